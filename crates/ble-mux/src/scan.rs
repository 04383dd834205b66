//! Scan forwarding
//!
//! At most one scan runs at a time. Advertisements are forwarded to the scan
//! event stream until the scan is stopped or replaced.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use ble_protocol::{BleRadio, ScanFilter, ScanStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventSink, ScanEvent};
use crate::queue::SerialQueues;

enum ScanCommand {
    Start(ScanFilter),
    Stop,
}

struct ScanJob {
    command: ScanCommand,
    done: oneshot::Sender<()>,
}

struct ScanState {
    radio: Arc<dyn BleRadio>,
    events: EventSink,
    current: Mutex<Option<CancellationToken>>,
}

/// Forwards radio scan results to the host
///
/// Start and stop requests take effect in the order they were made, even
/// when the returned futures are awaited on different tasks.
pub struct Scanner {
    state: Arc<ScanState>,
    requests: SerialQueues<(), ScanJob>,
}

impl Scanner {
    pub fn new(radio: Arc<dyn BleRadio>, events: EventSink) -> Self {
        Self {
            state: Arc::new(ScanState {
                radio,
                events,
                current: Mutex::new(None),
            }),
            requests: SerialQueues::default(),
        }
    }

    /// Replace any running scan with a new one
    ///
    /// Failures to start are reported on the scan event stream.
    pub fn start(&self, filter: ScanFilter) -> impl Future<Output = ()> + Send + 'static {
        self.submit(ScanCommand::Start(filter))
    }

    /// Stop the running scan, if any
    pub fn stop(&self) -> impl Future<Output = ()> + Send + 'static {
        self.submit(ScanCommand::Stop)
    }

    /// Whether a scan is being forwarded
    pub fn is_scanning(&self) -> bool {
        self.state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn submit(&self, command: ScanCommand) -> impl Future<Output = ()> + Send + 'static {
        let (done, finished) = oneshot::channel();
        let state = self.state.clone();
        self.requests.push(&(), ScanJob { command, done }, move |job: ScanJob| {
            let state = state.clone();
            async move {
                match job.command {
                    ScanCommand::Start(filter) => state.start(filter).await,
                    ScanCommand::Stop => state.stop().await,
                }
                let _ = job.done.send(());
            }
        });

        async move {
            let _ = finished.await;
        }
    }
}

impl ScanState {
    async fn start(&self, filter: ScanFilter) {
        if self.take_current().is_some() {
            self.stop_radio_scan().await;
        }

        info!(
            "Starting scan ({:?}, {} service filter(s))",
            filter.scan_mode,
            filter.services.len()
        );
        let stream = match self.radio.scan(filter).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!("Scan failed to start: {}", error);
                self.events.scan(ScanEvent::failed(error));
                return;
            }
        };

        let cancel = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        tokio::spawn(forward_scan(stream, self.events.clone(), cancel));
    }

    async fn stop(&self) {
        if self.take_current().is_some() {
            info!("Stopping scan");
        }
        // Always forwarded so the radio is quiet even if it scans on its own
        self.stop_radio_scan().await;
    }

    fn take_current(&self) -> Option<CancellationToken> {
        let token = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        token.cancel();
        Some(token)
    }

    async fn stop_radio_scan(&self) {
        if let Err(e) = self.radio.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
    }
}

async fn forward_scan(mut stream: ScanStream, events: EventSink, cancel: CancellationToken) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = stream.recv() => item,
        };

        match item {
            Some(Ok(info)) => events.scan(ScanEvent::Discovered { info }),
            Some(Err(error)) => {
                warn!("Scan failed: {}", error);
                events.scan(ScanEvent::failed(error));
                cancel.cancel();
                break;
            }
            None => {
                debug!("Scan stream ended");
                break;
            }
        }
    }
}
