// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - GRADIENT EVALUATOR
//
// Scores one peer's gradient by how much a single sign-step with it lowers
// the loss on the peer's assigned data versus on random data:
// 1. Load own pages (seed = peer uid) and random pages (random seed)
// 2. Sample a fraction of each batch pool
// 3. loss before → apply sign(g) · lr → loss after, on own then random data
// 4. Restore the model between passes and when the evaluation ends
//
// The restore runs from a guard's Drop, so every exit path (including
// errors) hands back the exact pre-evaluation state.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use thiserror::Error;
use tpl_consensus::{CheckpointState, EvaluationResult, CHECKPOINT_VERSION};
use tpl_core::tensor::zeros_like;
use tpl_core::{
    Batch, GradientCodec, GradientPayload, Hparams, LrScheduler, Model, ModelError, ParameterSet,
    Sgd, Uid,
};
use tpl_network::{DataError, Dataset};

/// Upper bound (exclusive) for the seed of the random-data pass
const RANDOM_SEED_RANGE: u64 = 10_000;

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Data(#[from] DataError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    Scored(EvaluationResult),
    /// The peer published nothing usable for the window
    Missing,
}

// ─────────────────────────────────────────────────────────────────
// Training state + restore guard
// ─────────────────────────────────────────────────────────────────

pub struct TrainingState {
    pub model: Box<dyn Model>,
    pub optimizer: Sgd,
    pub scheduler: LrScheduler,
    /// Last aggregated gradient per parameter, before sign
    pub momentum: ParameterSet,
}

/// What an evaluation may touch and must give back.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    parameters: ParameterSet,
    optimizer: Sgd,
    scheduler: LrScheduler,
}

impl TrainingState {
    pub fn new(model: Box<dyn Model>, hparams: &Hparams) -> Self {
        let momentum = zeros_like(model.parameters());
        Self {
            model,
            optimizer: Sgd::new(hparams.learning_rate),
            scheduler: LrScheduler::from_hparams(hparams),
            momentum,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            parameters: self.model.parameters().clone(),
            optimizer: self.optimizer.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: &StateSnapshot) {
        self.model.load_parameters(snapshot.parameters.clone());
        self.optimizer = snapshot.optimizer.clone();
        self.scheduler = snapshot.scheduler.clone();
    }

    /// Take a snapshot that is written back when the guard drops.
    pub fn guard(&mut self) -> RestoreGuard<'_> {
        let snapshot = self.snapshot();
        RestoreGuard {
            state: self,
            snapshot,
        }
    }

    pub fn to_checkpoint(
        &self,
        global_step: u64,
        start_window: u64,
        current_window: u64,
    ) -> CheckpointState {
        CheckpointState {
            version: CHECKPOINT_VERSION,
            global_step,
            start_window,
            current_window,
            parameters: self.model.parameters().clone(),
            optimizer: self.optimizer.clone(),
            scheduler: self.scheduler.clone(),
            momentum: self.momentum.clone(),
        }
    }

    /// Replace model, optimizer, scheduler and momentum in one go.
    /// Parameters the checkpoint lacks keep their current values.
    pub fn adopt(&mut self, checkpoint: CheckpointState) {
        let mut parameters = self.model.parameters().clone();
        for (name, tensor) in checkpoint.parameters {
            match parameters.get_mut(&name) {
                Some(current) if current.shape == tensor.shape => *current = tensor,
                Some(_) => log::warn!("Checkpoint parameter {} has a different shape, skipped", name),
                None => log::warn!("Checkpoint parameter {} is unknown to the model, skipped", name),
            }
        }
        self.model.load_parameters(parameters);
        self.optimizer = checkpoint.optimizer;
        self.scheduler = checkpoint.scheduler;

        let mut momentum = zeros_like(self.model.parameters());
        for (name, tensor) in checkpoint.momentum {
            if let Some(slot) = momentum.get_mut(&name) {
                *slot = tensor;
            }
        }
        self.momentum = momentum;
    }
}

pub struct RestoreGuard<'a> {
    state: &'a mut TrainingState,
    snapshot: StateSnapshot,
}

impl RestoreGuard<'_> {
    /// Put the parameters back without ending the guard.
    pub fn reset_parameters(&mut self) {
        let params = self.snapshot.parameters.clone();
        self.state.model.load_parameters(params);
    }
}

impl Deref for RestoreGuard<'_> {
    type Target = TrainingState;

    fn deref(&self) -> &TrainingState {
        self.state
    }
}

impl DerefMut for RestoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut TrainingState {
        self.state
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.state.restore(&self.snapshot);
        log::debug!("Model state restored after evaluation");
    }
}

// ─────────────────────────────────────────────────────────────────
// Evaluator
// ─────────────────────────────────────────────────────────────────

pub struct GradientEvaluator {
    codec: Arc<dyn GradientCodec>,
    dataset: Arc<dyn Dataset>,
    pages_per_window: usize,
    sample_rate: f64,
    rng: StdRng,
}

impl GradientEvaluator {
    pub fn new(codec: Arc<dyn GradientCodec>, dataset: Arc<dyn Dataset>, hparams: &Hparams) -> Self {
        Self {
            codec,
            dataset,
            pages_per_window: hparams.pages_per_window,
            sample_rate: hparams.validator_sample_rate,
            rng: StdRng::seed_from_u64(hparams.seed),
        }
    }

    pub async fn evaluate(
        &mut self,
        state: &mut TrainingState,
        uid: Uid,
        window: u64,
        payload: Option<&GradientPayload>,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        let payload = match payload {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(EvaluationOutcome::Missing),
        };

        let own_batches = self
            .dataset
            .batches(window, self.pages_per_window, uid as u64)
            .await?;
        let random_seed = self.rng.gen_range(0..RANDOM_SEED_RANGE);
        let random_batches = self
            .dataset
            .batches(window, self.pages_per_window, random_seed)
            .await?;

        let own_sample = sample_indices(&mut self.rng, own_batches.len(), self.sample_rate);
        let random_sample = sample_indices(&mut self.rng, random_batches.len(), self.sample_rate);

        let mut guard = state.guard();
        let lr = guard.scheduler.last_lr();

        let loss_before_own = mean_loss(guard.model.as_ref(), &own_batches, &own_sample)?;
        log::info!("Loss before (own data): {:.6}", loss_before_own);
        apply_signed_gradient(guard.model.as_mut(), self.codec.as_ref(), payload, lr);
        let loss_after_own = mean_loss(guard.model.as_ref(), &own_batches, &own_sample)?;
        log::info!("Loss after (own data): {:.6}", loss_after_own);

        guard.reset_parameters();

        let loss_before_random = mean_loss(guard.model.as_ref(), &random_batches, &random_sample)?;
        log::info!("Loss before (random data): {:.6}", loss_before_random);
        apply_signed_gradient(guard.model.as_mut(), self.codec.as_ref(), payload, lr);
        let loss_after_random = mean_loss(guard.model.as_ref(), &random_batches, &random_sample)?;
        log::info!("Loss after (random data): {:.6}", loss_after_random);

        drop(guard);

        Ok(EvaluationOutcome::Scored(EvaluationResult::from_losses(
            loss_before_own as f64,
            loss_after_own as f64,
            loss_before_random as f64,
            loss_after_random as f64,
        )))
    }
}

/// `max(1, floor(n · rate))` distinct indices in ascending order; empty when `n == 0`.
pub fn sample_indices(rng: &mut StdRng, n: usize, rate: f64) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let k = ((n as f64 * rate) as usize).clamp(1, n);
    let mut picked = sample(rng, n, k).into_vec();
    picked.sort_unstable();
    picked
}

/// Mean loss over the selected batches; 0 when nothing is selected.
fn mean_loss(model: &dyn Model, batches: &[Batch], indices: &[usize]) -> Result<f32, ModelError> {
    if indices.is_empty() {
        return Ok(0.0);
    }
    let mut total = 0.0f32;
    for &i in indices {
        total += model.loss(&batches[i])?;
    }
    if !total.is_finite() {
        return Err(ModelError::NonFiniteLoss);
    }
    Ok(total / indices.len() as f32)
}

/// `p -= lr · sign(decode(fragment))` for every parameter the payload covers.
/// Returns how many parameters were stepped.
pub fn apply_signed_gradient(
    model: &mut dyn Model,
    codec: &dyn GradientCodec,
    payload: &GradientPayload,
    lr: f32,
) -> usize {
    let mut applied = 0;
    for (name, param) in model.parameters_mut().iter_mut() {
        let fragment = match payload.fragment(name) {
            Some(f) => f,
            None => continue,
        };
        let grad = match codec.decode(name, fragment) {
            Ok(g) => g.sign(),
            Err(e) => {
                log::warn!("Skipping parameter {}: {}", name, e);
                continue;
            }
        };
        match param.sub_scaled(&grad, lr) {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("Skipping parameter {}: {}", name, e),
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devnet::{BigramModel, SyntheticDataset};
    use tpl_core::{CompressedFragment, TopKCodec};

    fn setup() -> (TrainingState, GradientEvaluator) {
        let hparams = Hparams {
            validator_sample_rate: 0.5,
            ..Hparams::default()
        };
        let model = BigramModel::new(16);
        let codec = Arc::new(TopKCodec::for_parameters(model.parameters()));
        let dataset = Arc::new(SyntheticDataset::new(16, 2, 12, 4));
        let state = TrainingState::new(Box::new(model), &hparams);
        let evaluator = GradientEvaluator::new(codec, dataset, &hparams);
        (state, evaluator)
    }

    fn payload(vals: Vec<f32>) -> GradientPayload {
        let mut p = GradientPayload::default();
        p.fragments.insert(
            BigramModel::LOGITS.to_string(),
            CompressedFragment {
                idxs: (0..vals.len() as i64).collect(),
                vals,
            },
        );
        p
    }

    #[test]
    fn test_sample_indices() {
        let mut rng = StdRng::seed_from_u64(42);
        assert!(sample_indices(&mut rng, 0, 0.2).is_empty());
        // 3 · 0.2 floors to 0 but at least one batch is always used
        assert_eq!(sample_indices(&mut rng, 3, 0.2).len(), 1);
        let picked = sample_indices(&mut rng, 20, 0.25);
        assert_eq!(picked.len(), 5);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
        assert!(picked.iter().all(|&i| i < 20));
    }

    #[tokio::test]
    async fn test_missing_payload() {
        let (mut state, mut evaluator) = setup();
        let outcome = evaluator.evaluate(&mut state, 1, 5, None).await.unwrap();
        assert_eq!(outcome, EvaluationOutcome::Missing);

        let empty = GradientPayload::default();
        let outcome = evaluator.evaluate(&mut state, 1, 5, Some(&empty)).await.unwrap();
        assert_eq!(outcome, EvaluationOutcome::Missing);
    }

    #[tokio::test]
    async fn test_evaluation_restores_state() {
        let (mut state, mut evaluator) = setup();
        let before = state.snapshot();
        let p = payload(vec![1.0; 16 * 16]);

        let outcome = evaluator.evaluate(&mut state, 3, 7, Some(&p)).await.unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Scored(_)));
        assert_eq!(state.model.parameters(), &before.parameters);
        assert_eq!(state.optimizer, before.optimizer);
        assert_eq!(state.scheduler, before.scheduler);
    }

    #[test]
    fn test_guard_restores_on_early_exit() {
        let (mut state, _) = setup();
        let original = state.model.parameters().clone();

        let result: Result<(), ModelError> = (|| {
            let mut guard = state.guard();
            for t in guard.model.parameters_mut().values_mut() {
                t.data.iter_mut().for_each(|v| *v = 9.0);
            }
            guard.optimizer.step += 5;
            Err(ModelError::NonFiniteLoss)
        })();

        assert!(result.is_err());
        assert_eq!(state.model.parameters(), &original);
        assert_eq!(state.optimizer.step, 0);
    }

    struct NanModel(ParameterSet);

    impl Model for NanModel {
        fn parameters(&self) -> &ParameterSet {
            &self.0
        }

        fn parameters_mut(&mut self) -> &mut ParameterSet {
            &mut self.0
        }

        fn loss(&self, _batch: &Batch) -> Result<f32, ModelError> {
            Ok(f32::NAN)
        }
    }

    #[test]
    fn test_mean_loss_rejects_non_finite() {
        let model = NanModel(ParameterSet::new());
        let batches: Vec<Batch> = vec![vec![vec![0, 1]], vec![vec![1, 2]]];
        assert!(matches!(
            mean_loss(&model, &batches, &[0, 1]),
            Err(ModelError::NonFiniteLoss)
        ));
        assert_eq!(mean_loss(&model, &batches, &[]).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_non_finite_loss_fails_evaluation() {
        let hparams = Hparams {
            validator_sample_rate: 0.5,
            ..Hparams::default()
        };
        let bigram = BigramModel::new(16);
        let codec = Arc::new(TopKCodec::for_parameters(bigram.parameters()));
        let dataset = Arc::new(SyntheticDataset::new(16, 2, 12, 4));
        let model = NanModel(bigram.parameters().clone());
        let mut state = TrainingState::new(Box::new(model), &hparams);
        let mut evaluator = GradientEvaluator::new(codec, dataset, &hparams);
        let before = state.snapshot();

        let p = payload(vec![1.0; 16 * 16]);
        let result = evaluator.evaluate(&mut state, 3, 7, Some(&p)).await;
        assert!(result.is_err());
        assert_eq!(state.model.parameters(), &before.parameters);
    }

    #[test]
    fn test_apply_signed_gradient_skips_bad_fragments() {
        let (mut state, _) = setup();
        let codec = TopKCodec::for_parameters(state.model.parameters());

        let mut p = payload(vec![2.0, -3.0, 0.0]);
        p.fragments.insert(
            "unknown".to_string(),
            CompressedFragment {
                idxs: vec![0],
                vals: vec![1.0],
            },
        );
        let applied = apply_signed_gradient(state.model.as_mut(), &codec, &p, 0.5);
        assert_eq!(applied, 1);

        let logits = &state.model.parameters()[BigramModel::LOGITS];
        assert_eq!(&logits.data[..3], &[-0.5, 0.5, 0.0]);

        let mut bad = payload(vec![1.0]);
        bad.fragments
            .get_mut(BigramModel::LOGITS)
            .unwrap()
            .idxs
            .push(1);
        assert_eq!(apply_signed_gradient(state.model.as_mut(), &codec, &bad, 0.5), 0);
    }

    #[test]
    fn test_adopt_checkpoint() {
        let (mut state, _) = setup();
        let mut cp = state.to_checkpoint(12, 3, 15);
        for t in cp.parameters.values_mut() {
            t.data.iter_mut().for_each(|v| *v = 0.25);
        }
        cp.optimizer.step = 11;
        cp.scheduler.last_epoch = 11;

        state.adopt(cp);
        assert!(state.model.parameters()[BigramModel::LOGITS]
            .data
            .iter()
            .all(|v| *v == 0.25));
        assert_eq!(state.optimizer.step, 11);
        assert_eq!(state.scheduler.last_epoch, 11);
        assert_eq!(state.momentum.len(), 1);
    }
}
