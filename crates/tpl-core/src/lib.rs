// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - CORE TYPES
//
// Shared building blocks for the validator workspace:
// - Peer / window identifiers and window arithmetic
// - Hyperparameters (TOML / JSON / env)
// - Dense tensors and named parameter sets
// - Compressed gradient wire format + codec seam
// - SGD optimizer and warmup → cosine-restart LR schedule
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod gradient;
pub mod hparams;
pub mod model;
pub mod optim;
pub mod tensor;

pub use gradient::{
    CompressedFragment, DecodeError, GatherResult, GradientCodec, GradientPayload, ParameterMeta,
    TopKCodec,
};
pub use hparams::Hparams;
pub use model::{Batch, Model, ModelError};
pub use optim::{LrScheduler, Sgd};
pub use tensor::{ParameterSet, Tensor};

/// Network-wide peer identifier (slot index in the registry).
pub type Uid = u16;

/// Object-store key for per-window gradient submissions
pub const GRADIENT_KEY: &str = "gradient";
/// Object-store key for full training-state checkpoints
pub const CHECKPOINT_KEY: &str = "checkpoint";

/// Map a block height to its window index.
///
/// A zero `blocks_per_window` is rejected by `Hparams::validate`, but the
/// function still answers 0 instead of dividing by zero.
pub fn window_for_block(block: u64, blocks_per_window: u64) -> u64 {
    if blocks_per_window == 0 {
        return 0;
    }
    block / blocks_per_window
}
