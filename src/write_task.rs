use std::sync::Arc;

use log::error;
use tokio::sync::mpsc;

use crate::storage::{Storage, WriteBatch, WriteBatchResult};

/// Outcome of one write-batch attempt. A failed write hands the original
/// batch back rather than just logging it, so the event loop can requeue
/// every affected group's entries instead of silently losing them.
pub enum WriteOutcome {
    Written(WriteBatchResult),
    Failed(WriteBatch),
}

/// Spawns the write worker and returns the two unbuffered-capacity (1)
/// handoff channels the event loop uses to drive it: the loop reserves a
/// send slot only when some group is dirty, the "offer" half of an
/// unbuffered handshake, and receives outcomes independently so a slow
/// fsync never blocks the loop from handling other events in the meantime.
pub fn spawn(storage: Arc<dyn Storage>) -> (mpsc::Sender<WriteBatch>, mpsc::Receiver<WriteOutcome>) {
    let (request_tx, mut request_rx) = mpsc::channel::<WriteBatch>(1);
    let (response_tx, response_rx) = mpsc::channel::<WriteOutcome>(1);

    tokio::spawn(async move {
        while let Some(batch) = request_rx.recv().await {
            let retry = batch.clone();
            match storage.write(batch).await {
                Ok(result) => {
                    if response_tx.send(WriteOutcome::Written(result)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!("write task: storage write failed, requeuing {} group(s): {err}", retry.len());
                    if response_tx.send(WriteOutcome::Failed(retry)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    (request_tx, response_rx)
}
