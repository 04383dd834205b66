//! Keyed serial queues
//!
//! Jobs pushed under the same key run one at a time in push order. The
//! position of a job is decided when [`SerialQueues::push`] is called, so
//! callers that push from a single task (the dispatcher loop) get arrival
//! order even though the jobs themselves run on spawned tasks.
//!
//! A worker only exists while its key has queued jobs. Once the queue is
//! drained the worker removes its own entry and exits.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

type QueueMap<K, J> = Arc<Mutex<HashMap<K, mpsc::UnboundedSender<J>>>>;

fn lock<K, J>(queues: &QueueMap<K, J>) -> MutexGuard<'_, HashMap<K, mpsc::UnboundedSender<J>>> {
    queues.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key FIFO job queues drained by on-demand workers
pub(crate) struct SerialQueues<K, J> {
    queues: QueueMap<K, J>,
}

impl<K, J> Default for SerialQueues<K, J> {
    fn default() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, J> SerialQueues<K, J>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    J: Send + 'static,
{
    /// Queue a job behind every job already pushed for `key`
    ///
    /// `run` only starts a worker if none is running for the key; otherwise
    /// it is dropped and the running worker takes the job.
    pub fn push<F, Fut>(&self, key: &K, job: J, run: F)
    where
        F: FnMut(J) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut queues = lock(&self.queues);

        let job = match queues.get(key) {
            Some(queue) => match queue.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive: it is handed to the worker below
        let _ = tx.send(job);
        queues.insert(key.clone(), tx.clone());
        tokio::spawn(drain(self.queues.clone(), key.clone(), rx, tx, run));
    }

    /// Number of keys with a live worker
    pub fn active(&self) -> usize {
        lock(&self.queues).len()
    }
}

async fn drain<K, J, F, Fut>(
    queues: QueueMap<K, J>,
    key: K,
    mut jobs: mpsc::UnboundedReceiver<J>,
    own: mpsc::UnboundedSender<J>,
    mut run: F,
) where
    K: Eq + Hash + Debug,
    F: FnMut(J) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let job = match jobs.try_recv() {
            Ok(job) => job,
            Err(_) => {
                // Pushes happen under the map lock, so an empty queue seen
                // here stays empty until the entry is gone.
                let mut map = lock(&queues);
                match jobs.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        if map.get(&key).is_some_and(|tx| tx.same_channel(&own)) {
                            map.remove(&key);
                        }
                        trace!("Queue {:?} drained", key);
                        return;
                    }
                }
            }
        };
        run(job).await;
    }
}
