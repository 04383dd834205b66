//! Line-delimited JSON transport
//!
//! Each input line is one request envelope:
//!
//! ```text
//! {"id": 7, "request": {"method": "read_characteristic", "characteristic": {...}}}
//! ```
//!
//! Each output line is one [`HostMessage`]: either the response to a request
//! (tagged with the request id) or an event from one of the event streams.

use ble_mux::{
    BridgeError, BridgeHandle, CharacteristicUpdate, ConnectionUpdate, EventStreams, ScanEvent,
};
use ble_protocol::{BleRequest, BleResponse, BleStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Errors that end the transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// A request as received from the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id echoed in the response
    pub id: u64,
    /// The request
    pub request: BleRequest,
}

/// A line sent to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Answer to the request with the same id
    Response { id: u64, response: BleResponse },
    /// Adapter status change
    Status { status: BleStatus },
    /// Scan stream event
    Scan { event: ScanEvent },
    /// Connection stream event
    Connection { update: ConnectionUpdate },
    /// Characteristic stream event
    Characteristic { update: CharacteristicUpdate },
    /// A line that could not be handled
    Error { id: Option<u64>, message: String },
}

/// Read request lines until end of input, submitting each to the bridge
///
/// Requests are submitted in input order; responses are sent to `out` as they
/// complete.
pub async fn serve<R>(
    input: R,
    handle: BridgeHandle,
    out: mpsc::UnboundedSender<HostMessage>,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Envelope { id, request } = match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Rejected input line: {}", e);
                let _ = out.send(HostMessage::Error {
                    id: None,
                    message: format!("invalid request: {}", e),
                });
                continue;
            }
        };

        debug!("Request {} ({})", id, request.name());
        let pending = handle.submit(request).await?;
        let out = out.clone();
        tokio::spawn(async move {
            let message = match pending.await {
                Ok(response) => HostMessage::Response { id, response },
                Err(_) => HostMessage::Error {
                    id: Some(id),
                    message: "request dropped without a response".to_string(),
                },
            };
            let _ = out.send(message);
        });
    }

    debug!("Input closed");
    Ok(())
}

/// Forward the bridge event streams to the host until they all close
pub async fn forward_events(mut streams: EventStreams, out: mpsc::UnboundedSender<HostMessage>) {
    loop {
        let message = tokio::select! {
            Some(status) = streams.status.recv() => HostMessage::Status { status },
            Some(event) = streams.scan.recv() => HostMessage::Scan { event },
            Some(update) = streams.connection.recv() => HostMessage::Connection { update },
            Some(update) = streams.characteristic.recv() => HostMessage::Characteristic { update },
            else => break,
        };
        if out.send(message).is_err() {
            break;
        }
    }
}

/// Write messages as JSON lines until every sender is dropped
pub async fn write_messages<W>(
    mut output: W,
    mut messages: mpsc::UnboundedReceiver<HostMessage>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = messages.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}
