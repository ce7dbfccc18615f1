// ─────────────────────────────────────────────────────────────────
// Background checkpoint writer
// ─────────────────────────────────────────────────────────────────
// Single slot, replace-on-write: submitting while an older checkpoint
// is still queued (not yet picked up) discards the older one. The
// caller never waits for the upload.
// ─────────────────────────────────────────────────────────────────

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tpl_consensus::CheckpointState;
use tpl_core::{Uid, CHECKPOINT_KEY};
use tpl_network::ObjectStore;

use crate::metrics::ValidatorMetrics;

struct PendingCheckpoint {
    uid: Uid,
    window: u64,
    state: CheckpointState,
}

pub struct CheckpointWriter {
    slot: watch::Sender<Option<Arc<PendingCheckpoint>>>,
    worker: JoinHandle<()>,
}

impl CheckpointWriter {
    pub fn spawn(store: Arc<dyn ObjectStore>, metrics: Arc<ValidatorMetrics>) -> Self {
        let (slot, mut rx) = watch::channel::<Option<Arc<PendingCheckpoint>>>(None);

        let worker = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let pending = rx.borrow_and_update().clone();
                let Some(job) = pending else { continue };

                let bytes = match encode(&job.state) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Could not encode checkpoint {}: {}", job.state.global_step, e);
                        metrics.checkpoint_failures_total.inc();
                        continue;
                    }
                };

                match store
                    .put(bytes, job.uid, job.window, CHECKPOINT_KEY, job.state.global_step)
                    .await
                {
                    Ok(()) => {
                        metrics.checkpoint_writes_total.inc();
                        log::info!(
                            "Checkpoint for global step {} written (window {})",
                            job.state.global_step,
                            job.window
                        );
                    }
                    Err(e) => {
                        metrics.checkpoint_failures_total.inc();
                        log::warn!("Checkpoint upload failed: {}", e);
                    }
                }
            }
        });

        Self { slot, worker }
    }

    /// Queue a checkpoint, replacing any queued one that has not started.
    pub fn submit(&self, uid: Uid, window: u64, state: CheckpointState) {
        log::info!("Creating checkpoint at global_step {}", state.global_step);
        self.slot
            .send_replace(Some(Arc::new(PendingCheckpoint { uid, window, state })));
    }

    /// Finish whatever is queued, then stop the worker.
    pub async fn shutdown(self) {
        let Self { slot, worker } = self;
        drop(slot);
        if let Err(e) = worker.await {
            log::warn!("Checkpoint writer ended abnormally: {}", e);
        }
    }
}

fn encode(state: &CheckpointState) -> Result<Vec<u8>, String> {
    state.encode().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devnet::{BigramModel, SledObjectStore};
    use crate::evaluator::TrainingState;
    use tempfile::TempDir;
    use tpl_core::Hparams;

    #[tokio::test]
    async fn test_writes_latest_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SledObjectStore::open(temp_dir.path()).unwrap());
        let metrics = ValidatorMetrics::new().unwrap();
        let writer = CheckpointWriter::spawn(store.clone(), metrics.clone());

        let training = TrainingState::new(Box::new(BigramModel::new(4)), &Hparams::default());
        writer.submit(0, 10, training.to_checkpoint(100, 0, 10));
        writer.submit(0, 20, training.to_checkpoint(200, 0, 20));
        writer.shutdown().await;

        let bytes = store.load_checkpoint().await.unwrap().unwrap();
        let latest = CheckpointState::decode(&bytes).unwrap();
        assert_eq!(latest.global_step, 200);
        assert!(metrics.checkpoint_writes_total.get() >= 1);
        assert_eq!(metrics.checkpoint_failures_total.get(), 0);
    }
}
