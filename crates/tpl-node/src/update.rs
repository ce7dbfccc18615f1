use tpl_core::{GatherResult, GradientCodec, ParameterSet};

use crate::evaluator::TrainingState;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Parameters that received a gradient
    pub applied: Vec<String>,
    /// Parameters without fragments or whose fragments failed to decode
    pub skipped: Vec<String>,
}

/// Apply the window's aggregated gradient to the model.
///
/// Each decoded gradient is stored as momentum, then its sign is used for
/// one optimizer step. Optimizer and scheduler step exactly once even when
/// nothing was gathered.
pub fn apply_gather_update(
    state: &mut TrainingState,
    gather: Option<&GatherResult>,
    codec: &dyn GradientCodec,
) -> UpdateSummary {
    let mut summary = UpdateSummary::default();
    let mut grads = ParameterSet::new();

    let names: Vec<String> = state.model.parameters().keys().cloned().collect();
    for name in names {
        let fragments = match gather.and_then(|g| g.fragments_for(&name)) {
            Some(f) => f,
            None => {
                log::info!("Gradient data missing for parameter {}, skipping", name);
                summary.skipped.push(name);
                continue;
            }
        };
        match codec.batch_decode(&name, fragments) {
            Ok(dense) => {
                grads.insert(name.clone(), dense.sign());
                state.momentum.insert(name.clone(), dense);
                summary.applied.push(name);
            }
            Err(e) => {
                log::warn!("Could not decode gathered gradient for {}: {}", name, e);
                summary.skipped.push(name);
            }
        }
    }

    state.optimizer.lr = state.scheduler.last_lr();
    state
        .optimizer
        .step(state.model.parameters_mut(), &grads);
    state.scheduler.step();

    summary
}
