//! Characteristic and link operations
//!
//! Read, write, MTU and connection priority requests all require a connected
//! device and complete exactly once with an [`OperationResult`]. Each radio
//! call runs under the device's connection scope and the operation deadline:
//! whichever of completion, disconnection or timeout comes first decides the
//! result.
//!
//! Writes to one characteristic are serialized through a per-key queue and
//! reach the radio in the order they were submitted. Writes to different
//! characteristics or devices never wait on each other. A queue's worker
//! only lives while it has writes to run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ble_protocol::{
    BleRadio, CharacteristicKey, ConnectionPriority, DeviceId, Failure, FailureKind,
    OperationResult, RadioError, WriteType,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::queue::SerialQueues;
use crate::registry::ConnectionRegistry;

/// Run a radio call under a connection scope and a deadline
///
/// Cancellation of `scope` resolves the call with a disconnection failure;
/// the radio future is dropped.
pub(crate) async fn run_bounded<T, F>(
    device: &DeviceId,
    scope: &CancellationToken,
    deadline: Duration,
    call: F,
) -> OperationResult<T>
where
    F: Future<Output = Result<T, RadioError>>,
{
    tokio::select! {
        biased;
        _ = scope.cancelled() => Err(Failure::disconnected(device)),
        result = tokio::time::timeout(deadline, call) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Failure::from_radio(error, device)),
            Err(_) => {
                let millis = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
                Err(Failure::from_radio(RadioError::Timeout(millis), device))
            }
        },
    }
}

struct WriteJob {
    value: Vec<u8>,
    write_type: WriteType,
    scope: CancellationToken,
    respond: oneshot::Sender<OperationResult<()>>,
}

/// Executes characteristic and link requests against connected devices
pub struct Operations {
    radio: Arc<dyn BleRadio>,
    registry: ConnectionRegistry,
    write_queues: SerialQueues<CharacteristicKey, WriteJob>,
    deadline: Duration,
}

impl Operations {
    /// Create the operation handler; `deadline` bounds every radio call
    pub fn new(radio: Arc<dyn BleRadio>, registry: ConnectionRegistry, deadline: Duration) -> Self {
        Self {
            radio,
            registry,
            write_queues: SerialQueues::default(),
            deadline,
        }
    }

    /// Read a characteristic once
    pub async fn read(&self, key: &CharacteristicKey) -> OperationResult<Vec<u8>> {
        let scope = self
            .registry
            .connected_scope(&key.device_id)
            .map_err(|failure| failure.with_characteristic(key.clone()))?;

        trace!("Reading {}", key);
        run_bounded(&key.device_id, &scope, self.deadline, self.radio.read(key))
            .await
            .map_err(|failure| failure.with_characteristic(key.clone()))
    }

    /// Queue a write to a characteristic
    ///
    /// The connection check and the queue position are decided when this is
    /// called, not when the returned future is first polled.
    pub fn write(
        &self,
        key: &CharacteristicKey,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> impl Future<Output = OperationResult<()>> + Send + 'static {
        let queued = self.enqueue_write(key, value, write_type);
        let key = key.clone();

        async move {
            match queued?.await {
                Ok(result) => result,
                Err(_) => Err(Failure::for_characteristic(
                    FailureKind::TransportFault,
                    &key,
                    "write queue closed",
                )),
            }
        }
    }

    fn enqueue_write(
        &self,
        key: &CharacteristicKey,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> OperationResult<oneshot::Receiver<OperationResult<()>>> {
        let scope = self
            .registry
            .connected_scope(&key.device_id)
            .map_err(|failure| failure.with_characteristic(key.clone()))?;

        let (respond, response) = oneshot::channel();
        let job = WriteJob {
            value,
            write_type,
            scope,
            respond,
        };

        let radio = self.radio.clone();
        let deadline = self.deadline;
        let target = key.clone();
        self.write_queues.push(key, job, move |job| {
            run_write(radio.clone(), target.clone(), job, deadline)
        });
        Ok(response)
    }

    /// Number of characteristics with writes queued or in flight
    pub fn queued_characteristics(&self) -> usize {
        self.write_queues.active()
    }

    /// Negotiate the MTU of a connected device
    pub async fn negotiate_mtu(&self, device: &DeviceId, size: u16) -> OperationResult<u16> {
        let scope = self.registry.connected_scope(device)?;
        let mtu = run_bounded(
            device,
            &scope,
            self.deadline,
            self.radio.negotiate_mtu(device, size),
        )
        .await?;
        debug!("MTU of {} is now {} (requested {})", device, mtu, size);
        Ok(mtu)
    }

    /// Change the connection priority of a connected device
    pub async fn request_connection_priority(
        &self,
        device: &DeviceId,
        priority: ConnectionPriority,
    ) -> OperationResult<()> {
        let scope = self.registry.connected_scope(device)?;
        run_bounded(
            device,
            &scope,
            self.deadline,
            self.radio.request_connection_priority(device, priority),
        )
        .await
    }
}

async fn run_write(
    radio: Arc<dyn BleRadio>,
    key: CharacteristicKey,
    job: WriteJob,
    deadline: Duration,
) {
    if job.respond.is_closed() {
        return;
    }

    let result = if job.scope.is_cancelled() {
        Err(Failure::disconnected(&key.device_id))
    } else {
        trace!("Writing {} bytes to {}", job.value.len(), key);
        run_bounded(
            &key.device_id,
            &job.scope,
            deadline,
            radio.write(&key, &job.value, job.write_type),
        )
        .await
    };

    let _ = job
        .respond
        .send(result.map_err(|failure| failure.with_characteristic(key.clone())));
}
