// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - REPUTATION & CHECKPOINTS
//
// - EMA reputation per peer with overfitting indicator and inactivity decay
// - Power normalization of reputations into an on-chain weight vector
// - Versioned training-state checkpoints persisted in sled
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod checkpoint;
pub mod reputation;
pub mod weights;

pub use checkpoint::{CheckpointState, CheckpointStats, CheckpointStore, CHECKPOINT_VERSION};
pub use reputation::{EvaluationResult, InactiveSnapshot, PeerReputation, ReputationTracker};
pub use weights::{min_power_normalization, WeightVector};
