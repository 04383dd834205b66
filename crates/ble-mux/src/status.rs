//! Adapter status forwarding
//!
//! While watched, every status change reported by the radio is forwarded to
//! the status event stream, starting with the status at the time watching
//! began.

use std::sync::{Arc, Mutex, PoisonError};

use ble_protocol::{BleRadio, StatusStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::EventSink;

pub struct StatusMonitor {
    radio: Arc<dyn BleRadio>,
    events: EventSink,
    current: Mutex<Option<CancellationToken>>,
}

impl StatusMonitor {
    pub fn new(radio: Arc<dyn BleRadio>, events: EventSink) -> Self {
        Self {
            radio,
            events,
            current: Mutex::new(None),
        }
    }

    /// Start forwarding status changes; does nothing if already forwarding
    pub async fn start(&self) {
        if self.is_watching() {
            return;
        }

        let stream = match self.radio.observe_status().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot watch adapter status: {}", e);
                return;
            }
        };

        let cancel = CancellationToken::new();
        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|token| !token.is_cancelled()) {
                // Started concurrently; the extra stream is dropped
                return;
            }
            *current = Some(cancel.clone());
        }
        tokio::spawn(forward_status(stream, self.events.clone(), cancel));
    }

    pub fn stop(&self) {
        if let Some(token) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

async fn forward_status(mut stream: StatusStream, events: EventSink, cancel: CancellationToken) {
    loop {
        let status = tokio::select! {
            _ = cancel.cancelled() => break,
            status = stream.recv() => status,
        };
        match status {
            Some(status) => events.status(status),
            None => {
                debug!("Radio closed the status stream");
                cancel.cancel();
                break;
            }
        }
    }
}
