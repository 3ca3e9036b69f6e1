//! Asynchronous removal of handled queue rows
//!
//! Deleting rows one by one from inside the worker pool would serialize
//! every worker on the store, so fully-handled objects are pushed onto a
//! bounded channel and a background task deletes them in batches. A
//! `Flush` message with a reply channel gives callers a deterministic
//! drain point before a run finalizes.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::QueueError;
use crate::models::HandledKey;
use crate::queue::store::QueueStore;

enum RemoverMessage {
    Remove(HandledKey),
    Flush(oneshot::Sender<()>),
}

/// Background deleter for handled queue entries.
pub struct QueueRemover {
    tx: Mutex<Option<mpsc::Sender<RemoverMessage>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueRemover {
    /// Spawn the remover task. `buffer` bounds the channel, `batch_size`
    /// is the number of keys deleted per statement batch.
    pub fn spawn(store: Arc<dyn QueueStore>, buffer: usize, batch_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<RemoverMessage>(buffer.max(1));
        let batch_size = batch_size.max(1);

        let handle = tokio::spawn(async move {
            let mut pending: Vec<HandledKey> = Vec::with_capacity(batch_size);

            while let Some(msg) = rx.recv().await {
                match msg {
                    RemoverMessage::Remove(key) => {
                        pending.push(key);
                        if pending.len() >= batch_size {
                            flush_pending(&*store, &mut pending);
                        }
                    }
                    RemoverMessage::Flush(reply) => {
                        flush_pending(&*store, &mut pending);
                        let _ = reply.send(());
                    }
                }
            }

            // channel closed: final drain
            flush_pending(&*store, &mut pending);
            tracing::debug!("queue remover stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<RemoverMessage>, QueueError> {
        self.tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| QueueError::RemoverUnavailable("remover shut down".into()))
    }

    /// Enqueue one fully-handled object for deletion.
    pub async fn remove(&self, key: HandledKey) -> Result<(), QueueError> {
        self.sender()?
            .send(RemoverMessage::Remove(key))
            .await
            .map_err(|e| QueueError::RemoverUnavailable(e.to_string()))
    }

    /// Wait until everything enqueued so far has been deleted.
    pub async fn await_drained(&self) -> Result<(), QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .send(RemoverMessage::Flush(reply_tx))
            .await
            .map_err(|e| QueueError::RemoverUnavailable(e.to_string()))?;
        reply_rx
            .await
            .map_err(|_| QueueError::RemoverUnavailable("remover task exited".into()))
    }

    /// Drain and stop the background task.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "queue remover task panicked");
            }
        }
    }
}

fn flush_pending(store: &dyn QueueStore, pending: &mut Vec<HandledKey>) {
    if pending.is_empty() {
        return;
    }
    match store.delete_handled(pending) {
        Ok(deleted) => {
            tracing::trace!(keys = pending.len(), deleted, "removed handled entries");
        }
        Err(e) => {
            tracing::warn!(error = %e, keys = pending.len(), "failed to remove handled entries");
        }
    }
    pending.clear();
}
