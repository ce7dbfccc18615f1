// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - VALIDATOR LOOP
//
// One iteration per window, strictly in this order:
//  1. Catch-up check (adopting a state ends the iteration)
//  2. Wait until the chain is `validator_offset` windows ahead
//  3. sync_window += 1, refresh peers, inactivity decay
//  4. Gather every gather peer's gradient (hard timeout)
//  5. Evaluate one random eval peer and fold the result into its reputation
//  6. Recompute weights, queue a checkpoint when due
//  7. Apply the gathered gradient to the model
//  8. Submit weights every `windows_per_weights` windows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tpl_consensus::{CheckpointState, ReputationTracker, WeightVector};
use tpl_core::{
    GatherResult, GradientCodec, GradientPayload, Hparams, Model, Uid, GRADIENT_KEY,
};
use tpl_network::{
    decode_payload, CatchUpSource, Chain, ChainError, CommsError, Dataset,
    ObjectStore, PeerDirectory, PeerSetManager, WindowClock,
};

use crate::catch_up::{is_checkpoint_step, must_wait, CatchUpController, CatchUpOutcome};
use crate::checkpoint_writer::CheckpointWriter;
use crate::evaluator::{EvaluationOutcome, GradientEvaluator, TrainingState};
use crate::metrics::ValidatorMetrics;
use crate::update::{apply_gather_update, UpdateSummary};

/// Object-store key for the optional debug dump of each window's gather result
pub const GATHERS_KEY: &str = "gathers";

/// Attempts to read the start window posted by the highest-stake validator
const START_WINDOW_ATTEMPTS: usize = 10;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Comms(#[from] CommsError),
    #[error("invalid hyperparameters: {0}")]
    Config(String),
}

/// Everything outside the process the validator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn Chain>,
    pub store: Arc<dyn ObjectStore>,
    pub directory: Arc<dyn PeerDirectory>,
    pub dataset: Arc<dyn Dataset>,
    pub catch_up: Arc<dyn CatchUpSource>,
    pub codec: Arc<dyn GradientCodec>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidatorOptions {
    pub hotkey: String,
    /// Replaces the directory's gather list when set
    pub pinned_peers: Option<Vec<Uid>>,
    /// Upload every window's gather result under `GATHERS_KEY`
    pub store_gathers: bool,
}

/// How the evaluated peer fared this window.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerVerdict {
    Scored { final_score: f64, moving_avg: f64 },
    Missing { moving_avg: f64 },
    /// Evaluation aborted; state restored, reputation untouched
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowReport {
    pub sync_window: u64,
    /// Global step at the end of the iteration
    pub global_step: u64,
    pub caught_up: bool,
    pub evaluated: Option<(Uid, PeerVerdict)>,
    pub slashed: Vec<Uid>,
    pub gathered: Vec<Uid>,
    pub update: Option<UpdateSummary>,
    pub checkpoint_queued: bool,
    pub weights_submitted: bool,
}

pub struct Validator {
    uid: Uid,
    hparams: Hparams,
    options: ValidatorOptions,
    collab: Collaborators,
    clock: WindowClock,
    metrics: Arc<ValidatorMetrics>,

    training: TrainingState,
    tracker: ReputationTracker,
    peers: PeerSetManager,
    evaluator: GradientEvaluator,
    catch_up: CatchUpController,
    writer: CheckpointWriter,
    rng: StdRng,

    start_window: u64,
    sync_window: u64,
    global_step: u64,
    poll_interval: Duration,
}

impl Validator {
    /// Resolve our uid on the chain and assemble the loop state.
    /// An unregistered hotkey is fatal.
    pub async fn new(
        hparams: Hparams,
        options: ValidatorOptions,
        collab: Collaborators,
        model: Box<dyn Model>,
        clock: WindowClock,
        metrics: Arc<ValidatorMetrics>,
    ) -> Result<Self, ValidatorError> {
        hparams.validate().map_err(ValidatorError::Config)?;

        let registry = collab.chain.registry().await?;
        let uid = registry
            .uid_of(&options.hotkey)
            .ok_or_else(|| ChainError::NotRegistered(options.hotkey.clone()))?;
        log::info!("Validator hotkey {} has uid {}", options.hotkey, uid);

        let current_window = clock.current_window();
        let training = TrainingState::new(model, &hparams);
        let evaluator = GradientEvaluator::new(collab.codec.clone(), collab.dataset.clone(), &hparams);
        let writer = CheckpointWriter::spawn(collab.store.clone(), metrics.clone());

        Ok(Self {
            uid,
            tracker: ReputationTracker::from_hparams(&hparams),
            peers: PeerSetManager::new(uid, options.pinned_peers.clone()),
            catch_up: CatchUpController::new(collab.catch_up.clone()),
            rng: StdRng::seed_from_u64(hparams.seed.wrapping_add(uid as u64)),
            poll_interval: Duration::from_secs(hparams.offset_poll_secs),
            start_window: current_window,
            sync_window: current_window,
            global_step: 0,
            hparams,
            options,
            collab,
            clock,
            metrics,
            training,
            evaluator,
            writer,
        })
    }

    /// Shorten the offset wait and start-window retry delay.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn start_window(&self) -> u64 {
        self.start_window
    }

    pub fn sync_window(&self) -> u64 {
        self.sync_window
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn tracker(&self) -> &ReputationTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ReputationTracker {
        &mut self.tracker
    }

    pub fn training(&self) -> &TrainingState {
        &self.training
    }

    pub fn metrics(&self) -> &Arc<ValidatorMetrics> {
        &self.metrics
    }

    pub fn weights(&self) -> WeightVector {
        WeightVector::compute(
            &self.tracker,
            self.hparams.power_normalisation,
            self.hparams.weight_epsilon,
        )
    }

    // ─────────────────────────────────────────────────────────────────
    // Startup
    // ─────────────────────────────────────────────────────────────────

    /// Agree on the start window, then resume from the latest network
    /// checkpoint if there is one.
    pub async fn startup(&mut self) -> Result<(), ValidatorError> {
        let registry = self.collab.chain.registry().await?;
        let current_window = self.clock.current_window();

        if registry.highest_stake_uid() == Some(self.uid) {
            self.start_window = current_window;
            match self
                .collab
                .store
                .post_start_window(self.uid, self.start_window)
                .await
            {
                Ok(()) => log::info!("Posted start window {}", self.start_window),
                Err(e) => log::warn!("Could not post start window: {}", e),
            }
        } else {
            match self.fetch_start_window().await {
                Some(start_window) => {
                    self.start_window = start_window;
                    self.global_step = current_window.saturating_sub(start_window);
                    log::info!(
                        "Using start window {}, global step {}",
                        start_window,
                        self.global_step
                    );
                }
                None => log::warn!(
                    "No start window published, starting at window {}",
                    self.start_window
                ),
            }
        }

        match self.collab.store.load_checkpoint().await {
            Ok(Some(bytes)) => match decode_checkpoint(&bytes) {
                Ok(checkpoint) => {
                    self.global_step = checkpoint.global_step;
                    self.training.adopt(checkpoint);
                    log::info!("Loaded checkpoint at global step {}", self.global_step);
                }
                Err(e) => log::warn!("Ignoring unreadable checkpoint: {}", e),
            },
            Ok(None) => log::info!("No checkpoint found, starting from scratch"),
            Err(e) => log::warn!("Checkpoint load failed, starting from scratch: {}", e),
        }

        self.metrics.global_step.set(self.global_step as i64);
        self.metrics.sync_window.set(self.sync_window as i64);
        Ok(())
    }

    async fn fetch_start_window(&self) -> Option<u64> {
        for attempt in 1..=START_WINDOW_ATTEMPTS {
            match self.collab.store.get_start_window().await {
                Ok(Some(w)) => return Some(w),
                Ok(None) => log::debug!("Start window not posted yet (attempt {})", attempt),
                Err(e) => log::warn!("Start window fetch failed (attempt {}): {}", attempt, e),
            }
            if attempt < START_WINDOW_ATTEMPTS {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────
    // Main loop
    // ─────────────────────────────────────────────────────────────────

    pub async fn run(&mut self) {
        loop {
            let report = self.run_window().await;
            log::debug!("Window report: {:?}", report);
        }
    }

    pub async fn run_window(&mut self) -> WindowReport {
        let started = Instant::now();
        let state = self.clock.snapshot();
        self.metrics.current_window.set(state.window as i64);
        self.metrics.current_block.set(state.block as i64);

        // 1. Catch-up
        if let CatchUpOutcome::Adopted { global_step } = self
            .catch_up
            .check(&mut self.training, state.window, self.sync_window)
            .await
        {
            self.global_step = global_step;
            self.sync_window = state.window;
            self.metrics.catch_ups_total.inc();
            self.metrics.global_step.set(global_step as i64);
            self.metrics.sync_window.set(self.sync_window as i64);
            return WindowReport {
                sync_window: self.sync_window,
                global_step,
                caught_up: true,
                ..WindowReport::default()
            };
        }

        // 2. Stay `validator_offset` windows behind the head
        loop {
            let current = self.clock.current_window();
            if !must_wait(self.sync_window, current, self.hparams.validator_offset) {
                break;
            }
            log::info!(
                "Waiting for validator window offset, synced: {}, current: {}, offset: {}",
                self.sync_window,
                current,
                self.hparams.validator_offset
            );
            tokio::time::sleep(self.poll_interval).await;
        }

        // 3. Peers + inactivity
        self.sync_window += 1;
        let current_window = self.clock.current_window();
        log::info!(
            "Processing window: {}, current: {}",
            self.sync_window,
            current_window
        );

        let update = self
            .peers
            .refresh(self.collab.directory.as_ref(), self.sync_window)
            .await;
        self.tracker.observe(&update.eval);
        self.tracker
            .mark_inactive(&update.newly_inactive, self.sync_window);
        let slashed = self.tracker.apply_inactivity(&update.eval);
        self.metrics
            .inactivity_slashes_total
            .inc_by(slashed.len() as u64);

        let mut report = WindowReport {
            sync_window: self.sync_window,
            slashed,
            ..WindowReport::default()
        };

        // 4. Gather
        let gather = self.gather(&update.gather).await;
        if let Some(g) = &gather {
            report.gathered = g.uids.clone();
            if self.options.store_gathers {
                self.store_gather(g).await;
            }
        }

        if update.eval.is_empty() {
            log::info!("No peers to evaluate in window {}", self.sync_window);
            self.global_step += 1;
            report.global_step = self.global_step;
            self.finish_window(started);
            return report;
        }

        // 5. Evaluate one peer
        if let Some(&eval_uid) = update.eval.choose(&mut self.rng) {
            log::info!("Evaluating uid: {}", eval_uid);
            let payload = self.fetch_payload(eval_uid).await;
            let verdict = self.evaluate(eval_uid, payload.as_ref()).await;
            report.evaluated = Some((eval_uid, verdict));
        }

        // 6. Weights + checkpoint
        let weights = self.weights();
        self.metrics
            .evaluated_peers
            .set(self.tracker.evaluated_uids().len() as i64);
        for (uid, w) in weights.iter() {
            log::debug!("Weight for uid {}: {:.6}", uid, w);
        }

        if is_checkpoint_step(self.global_step, self.hparams.checkpoint_frequency) {
            let checkpoint =
                self.training
                    .to_checkpoint(self.global_step, self.start_window, current_window);
            self.writer.submit(self.uid, current_window, checkpoint);
            report.checkpoint_queued = true;
        }

        // 7. Model update
        let summary = apply_gather_update(
            &mut self.training,
            gather.as_ref(),
            self.collab.codec.as_ref(),
        );
        self.metrics
            .learning_rate
            .set(self.training.scheduler.last_lr() as f64);
        report.update = Some(summary);

        // 8. Weight submission
        if self.hparams.windows_per_weights > 0
            && self.sync_window.is_multiple_of(self.hparams.windows_per_weights)
        {
            report.weights_submitted = self.submit_weights(&weights).await;
        }

        self.global_step += 1;
        report.global_step = self.global_step;
        self.finish_window(started);
        report
    }

    /// Flush the queued checkpoint and stop the background writer.
    pub async fn shutdown(self) {
        self.writer.shutdown().await;
    }

    fn finish_window(&self, started: Instant) {
        self.metrics.sync_window.set(self.sync_window as i64);
        self.metrics.global_step.set(self.global_step as i64);
        self.metrics
            .window_duration_seconds
            .observe(started.elapsed().as_secs_f64());
    }

    async fn gather(&self, uids: &[Uid]) -> Option<GatherResult> {
        let secs = self.hparams.gather_timeout_secs;
        let request = self.collab.store.gather(
            uids,
            self.sync_window,
            GRADIENT_KEY,
            Duration::from_secs(secs),
        );
        let what = format!("gather for window {}", self.sync_window);
        let responses = match bounded(what, secs, request).await {
            Ok(responses) => responses,
            Err(e) => {
                log::warn!("Gather failed, every peer counts as missing: {}", e);
                return None;
            }
        };

        let decoded = responses.into_iter().map(|(uid, bytes)| {
            let payload = bytes.and_then(|b| match decode_payload(&b) {
                Ok(p) => Some(p),
                Err(e) => {
                    log::warn!("Dropping malformed gradient from uid {}: {}", uid, e);
                    None
                }
            });
            (uid, payload)
        });
        let result = GatherResult::from_responses(decoded);
        match &result {
            Some(g) => log::info!("Gathered gradients from {} peers", g.uids.len()),
            None => log::info!("No gradients gathered for window {}", self.sync_window),
        }
        result
    }

    async fn store_gather(&self, gather: &GatherResult) {
        let bytes = match serde_json::to_vec(gather) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Could not encode gather result: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .collab
            .store
            .put(bytes, self.uid, self.sync_window, GATHERS_KEY, self.global_step)
            .await
        {
            log::warn!("Could not store gather result: {}", e);
        }
    }

    async fn fetch_payload(&self, uid: Uid) -> Option<GradientPayload> {
        let secs = self.hparams.eval_timeout_secs;
        let request = self.collab.store.get(
            uid,
            self.sync_window,
            GRADIENT_KEY,
            Duration::from_secs(secs),
        );
        let what = format!("gradient of uid {}", uid);
        match bounded(what, secs, request).await {
            Ok(Some(bytes)) => match decode_payload(&bytes) {
                Ok(p) => Some(p),
                Err(e) => {
                    log::warn!("Malformed gradient from uid {}: {}", uid, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("Fetching gradient of uid {} failed: {}", uid, e);
                None
            }
        }
    }

    async fn evaluate(&mut self, uid: Uid, payload: Option<&GradientPayload>) -> PeerVerdict {
        let outcome = self
            .evaluator
            .evaluate(&mut self.training, uid, self.sync_window, payload)
            .await;

        match outcome {
            Ok(EvaluationOutcome::Scored(mut result)) => {
                let moving_avg = self.tracker.record_evaluation(uid, &mut result);
                self.metrics.record_evaluation(&result);
                log::info!(
                    "Uid {}: raw {:.6}, indicator {}, final {:.6}, moving average {:.6}",
                    uid,
                    result.raw_score,
                    result.binary_indicator,
                    result.final_score,
                    moving_avg
                );
                PeerVerdict::Scored {
                    final_score: result.final_score,
                    moving_avg,
                }
            }
            Ok(EvaluationOutcome::Missing) => {
                let moving_avg = self.tracker.record_missing(uid);
                self.metrics.missing_submissions_total.inc();
                log::info!(
                    "No gradient received from uid {}. Slashed moving average score to {:.6}",
                    uid,
                    moving_avg
                );
                PeerVerdict::Missing { moving_avg }
            }
            Err(e) => {
                self.metrics.evaluation_errors_total.inc();
                log::warn!("Evaluation of uid {} failed: {}", uid, e);
                PeerVerdict::Failed
            }
        }
    }

    async fn submit_weights(&self, weights: &WeightVector) -> bool {
        let registry = match self.collab.chain.registry().await {
            Ok(registry) => registry,
            Err(e) => {
                self.metrics.weight_submission_failures_total.inc();
                log::warn!("Registry unavailable, skipping weight submission: {}", e);
                return false;
            }
        };
        let (uids, values): (Vec<Uid>, Vec<f64>) =
            weights.for_registry(&registry.uids()).into_iter().unzip();

        match self.collab.chain.set_weights(&uids, &values).await {
            Ok(()) => {
                self.metrics.weight_submissions_total.inc();
                log::info!("Submitted weights for {} uids", uids.len());
                true
            }
            Err(e) => {
                self.metrics.weight_submission_failures_total.inc();
                log::warn!("Weight submission failed: {}", e);
                false
            }
        }
    }
}

/// Run a store request under a hard deadline; a late answer is a timeout error.
async fn bounded<T, F>(what: String, secs: u64, request: F) -> Result<T, CommsError>
where
    F: Future<Output = Result<T, CommsError>>,
{
    match tokio::time::timeout(Duration::from_secs(secs), request).await {
        Ok(result) => result,
        Err(_) => Err(CommsError::Timeout { what, secs }),
    }
}

fn decode_checkpoint(bytes: &[u8]) -> Result<CheckpointState, String> {
    CheckpointState::decode(bytes).map_err(|e| e.to_string())
}
