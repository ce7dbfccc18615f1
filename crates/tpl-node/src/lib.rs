// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - VALIDATOR NODE
//
// Drives one window of validation work at a time:
// clock → peers → inactivity decay → catch-up → gather → evaluate one peer
// → reputation → weights → checkpoint → model update → weight submission
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod catch_up;
pub mod checkpoint_writer;
pub mod devnet;
pub mod evaluator;
pub mod metrics;
pub mod update;
pub mod validator;

pub use catch_up::{CatchUpController, CatchUpOutcome, SyncState};
pub use checkpoint_writer::CheckpointWriter;
pub use evaluator::{EvaluationError, EvaluationOutcome, GradientEvaluator, TrainingState};
pub use metrics::ValidatorMetrics;
pub use update::{apply_gather_update, UpdateSummary};
pub use validator::{
    Collaborators, PeerVerdict, Validator, ValidatorError, ValidatorOptions, WindowReport,
};
