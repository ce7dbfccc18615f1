// ─────────────────────────────────────────────────────────────────
// Catch-up / throttle
// ─────────────────────────────────────────────────────────────────
// InSync      → ask the catch-up source at every loop entrance
// CatchingUp  → a state is being fetched; on success it is adopted
//               wholesale and the node jumps to the current window
// Source failures leave the node InSync and the window proceeds.
// ─────────────────────────────────────────────────────────────────

use std::sync::Arc;
use tpl_network::CatchUpSource;

use crate::evaluator::TrainingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    InSync,
    CatchingUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpOutcome {
    /// A state was adopted; the caller must jump to the current window
    Adopted { global_step: u64 },
    InSync,
}

pub struct CatchUpController {
    source: Arc<dyn CatchUpSource>,
    state: SyncState,
}

impl CatchUpController {
    pub fn new(source: Arc<dyn CatchUpSource>) -> Self {
        Self {
            source,
            state: SyncState::InSync,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub async fn check(
        &mut self,
        training: &mut TrainingState,
        current_window: u64,
        sync_window: u64,
    ) -> CatchUpOutcome {
        self.state = SyncState::CatchingUp;
        let fetched = self.source.catch_up(current_window, sync_window).await;
        self.state = SyncState::InSync;

        match fetched {
            Ok(Some(checkpoint)) => {
                let global_step = checkpoint.global_step;
                training.adopt(checkpoint);
                log::info!(
                    "Caught up to window {} at global step {}",
                    current_window,
                    global_step
                );
                CatchUpOutcome::Adopted { global_step }
            }
            Ok(None) => CatchUpOutcome::InSync,
            Err(e) => {
                log::warn!("Catch-up check failed, continuing in sync: {}", e);
                CatchUpOutcome::InSync
            }
        }
    }
}

/// The validator trails the chain head by `offset` windows; it waits while
/// `sync_window` is already within that distance.
pub fn must_wait(sync_window: u64, current_window: u64, offset: u64) -> bool {
    sync_window >= current_window.saturating_sub(offset)
}

pub fn is_checkpoint_step(global_step: u64, checkpoint_frequency: u64) -> bool {
    checkpoint_frequency > 0 && global_step.is_multiple_of(checkpoint_frequency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devnet::BigramModel;
    use async_trait::async_trait;
    use tpl_consensus::CheckpointState;
    use tpl_core::{Hparams, Model};
    use tpl_network::CommsError;

    struct Fixed(Option<CheckpointState>, bool);

    #[async_trait]
    impl CatchUpSource for Fixed {
        async fn catch_up(&self, _: u64, _: u64) -> Result<Option<CheckpointState>, CommsError> {
            if self.1 {
                return Err(CommsError::Transport("bucket offline".to_string()));
            }
            Ok(self.0.clone())
        }
    }

    fn training() -> TrainingState {
        TrainingState::new(Box::new(BigramModel::new(4)), &Hparams::default())
    }

    #[test]
    fn test_must_wait() {
        assert!(must_wait(8, 10, 2));
        assert!(!must_wait(7, 10, 2));
        assert!(must_wait(0, 1, 2));
    }

    #[test]
    fn test_checkpoint_cadence() {
        assert!(is_checkpoint_step(0, 100));
        assert!(is_checkpoint_step(300, 100));
        assert!(!is_checkpoint_step(301, 100));
        assert!(!is_checkpoint_step(5, 0));
    }

    #[tokio::test]
    async fn test_adopts_fetched_state() {
        let mut t = training();
        let mut cp = t.to_checkpoint(77, 1, 90);
        cp.scheduler.last_epoch = 77;
        for v in cp.parameters.values_mut() {
            v.data.iter_mut().for_each(|x| *x = 1.0);
        }

        let mut c = CatchUpController::new(Arc::new(Fixed(Some(cp), false)));
        let outcome = c.check(&mut t, 90, 40).await;
        assert_eq!(outcome, CatchUpOutcome::Adopted { global_step: 77 });
        assert_eq!(c.state(), SyncState::InSync);
        assert_eq!(t.scheduler.last_epoch, 77);
        assert!(t.model.parameters()[BigramModel::LOGITS]
            .data
            .iter()
            .all(|x| *x == 1.0));
    }

    #[tokio::test]
    async fn test_failure_stays_in_sync() {
        let mut t = training();
        let mut c = CatchUpController::new(Arc::new(Fixed(None, true)));
        assert_eq!(c.check(&mut t, 10, 9).await, CatchUpOutcome::InSync);

        let mut c = CatchUpController::new(Arc::new(Fixed(None, false)));
        assert_eq!(c.check(&mut t, 10, 9).await, CatchUpOutcome::InSync);
        assert_eq!(t.scheduler.last_epoch, 0);
    }
}
