// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - MODEL SEAM
//
// The validator never computes a forward/backward pass itself. It only needs
// named, mutable dense parameters and a scalar loss for a token batch.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use thiserror::Error;

use crate::tensor::ParameterSet;

/// A batch of token sequences.
pub type Batch = Vec<Vec<u32>>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("batch contains no usable tokens")]
    EmptyBatch,
    #[error("token {token} outside vocabulary of {vocab}")]
    TokenOutOfRange { token: u32, vocab: usize },
    #[error("model has no parameter named {0}")]
    MissingParameter(String),
    #[error("forward pass produced a non-finite loss")]
    NonFiniteLoss,
    #[error("model backend failure: {0}")]
    Backend(String),
}

pub trait Model: Send {
    fn parameters(&self) -> &ParameterSet;

    fn parameters_mut(&mut self) -> &mut ParameterSet;

    /// Mean loss of the model over one batch (no gradient tracking).
    fn loss(&self, batch: &Batch) -> Result<f32, ModelError>;

    /// Replace every parameter at once (checkpoint load / restore).
    fn load_parameters(&mut self, params: ParameterSet) {
        *self.parameters_mut() = params;
    }
}
