// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - METRICS MODULE
//
// Prometheus-compatible metrics for the validator loop.
// Exposes counters, gauges, and histograms via the /metrics endpoint.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tpl_consensus::EvaluationResult;

pub struct ValidatorMetrics {
    registry: Registry,

    // Clock metrics
    pub current_window: IntGauge,
    pub sync_window: IntGauge,
    pub current_block: IntGauge,
    pub global_step: IntGauge,

    // Evaluation metrics
    pub evaluations_total: IntCounter,
    pub evaluation_errors_total: IntCounter,
    pub missing_submissions_total: IntCounter,
    pub loss_before_own: Gauge,
    pub loss_after_own: Gauge,
    pub loss_before_random: Gauge,
    pub loss_after_random: Gauge,
    pub last_raw_score: Gauge,
    pub last_final_score: Gauge,
    pub evaluated_peers: IntGauge,

    // Reputation / weights
    pub inactivity_slashes_total: IntCounter,
    pub weight_submissions_total: IntCounter,
    pub weight_submission_failures_total: IntCounter,

    // Recovery
    pub catch_ups_total: IntCounter,
    pub checkpoint_writes_total: IntCounter,
    pub checkpoint_failures_total: IntCounter,

    pub learning_rate: Gauge,
    pub window_duration_seconds: Histogram,
}

impl ValidatorMetrics {
    pub fn new() -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        macro_rules! int_gauge {
            ($name:expr, $help:expr) => {{
                let g = IntGauge::with_opts(Opts::new($name, $help))?;
                registry.register(Box::new(g.clone()))?;
                g
            }};
        }
        macro_rules! gauge {
            ($name:expr, $help:expr) => {{
                let g = Gauge::with_opts(Opts::new($name, $help))?;
                registry.register(Box::new(g.clone()))?;
                g
            }};
        }
        macro_rules! counter {
            ($name:expr, $help:expr) => {{
                let c = IntCounter::with_opts(Opts::new($name, $help))?;
                registry.register(Box::new(c.clone()))?;
                c
            }};
        }

        let current_window = int_gauge!("tpl_current_window", "Window derived from the chain head");
        let sync_window = int_gauge!("tpl_sync_window", "Window the validator last processed");
        let current_block = int_gauge!("tpl_current_block", "Latest observed block height");
        let global_step = int_gauge!("tpl_global_step", "Training steps since the start window");

        let evaluations_total = counter!("tpl_evaluations_total", "Gradients evaluated");
        let evaluation_errors_total = counter!(
            "tpl_evaluation_errors_total",
            "Evaluations aborted by a model or data error"
        );
        let missing_submissions_total = counter!(
            "tpl_missing_submissions_total",
            "Evaluated peers that published no gradient"
        );
        let loss_before_own = gauge!("tpl_loss_before_own", "Loss on the peer's data before its gradient");
        let loss_after_own = gauge!("tpl_loss_after_own", "Loss on the peer's data after its gradient");
        let loss_before_random = gauge!("tpl_loss_before_random", "Loss on random data before the gradient");
        let loss_after_random = gauge!("tpl_loss_after_random", "Loss on random data after the gradient");
        let last_raw_score = gauge!("tpl_last_raw_score", "Raw score of the last evaluation");
        let last_final_score = gauge!("tpl_last_final_score", "Final score of the last evaluation");
        let evaluated_peers = int_gauge!("tpl_evaluated_peers", "Peers evaluated at least once");

        let inactivity_slashes_total = counter!(
            "tpl_inactivity_slashes_total",
            "Per-window decays applied to inactive peers"
        );
        let weight_submissions_total = counter!("tpl_weight_submissions_total", "Weight vectors submitted");
        let weight_submission_failures_total = counter!(
            "tpl_weight_submission_failures_total",
            "Weight submissions rejected by the chain client"
        );

        let catch_ups_total = counter!("tpl_catch_ups_total", "Training states adopted from the network");
        let checkpoint_writes_total = counter!("tpl_checkpoint_writes_total", "Checkpoints published");
        let checkpoint_failures_total = counter!("tpl_checkpoint_failures_total", "Checkpoint writes that failed");

        let learning_rate = gauge!("tpl_learning_rate", "Current scheduler learning rate");

        let window_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "tpl_window_duration_seconds",
                "Wall time of one window iteration",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(window_duration_seconds.clone()))?;

        Ok(Arc::new(Self {
            registry,
            current_window,
            sync_window,
            current_block,
            global_step,
            evaluations_total,
            evaluation_errors_total,
            missing_submissions_total,
            loss_before_own,
            loss_after_own,
            loss_before_random,
            loss_after_random,
            last_raw_score,
            last_final_score,
            evaluated_peers,
            inactivity_slashes_total,
            weight_submissions_total,
            weight_submission_failures_total,
            catch_ups_total,
            checkpoint_writes_total,
            checkpoint_failures_total,
            learning_rate,
            window_duration_seconds,
        }))
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn record_evaluation(&self, result: &EvaluationResult) {
        self.evaluations_total.inc();
        self.loss_before_own.set(result.loss_before_own);
        self.loss_after_own.set(result.loss_after_own);
        self.loss_before_random.set(result.loss_before_random);
        self.loss_after_random.set(result.loss_after_random);
        self.last_raw_score.set(result.raw_score);
        self.last_final_score.set(result.final_score);
    }
}
