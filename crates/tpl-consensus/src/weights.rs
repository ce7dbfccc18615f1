// ─────────────────────────────────────────────────────────────────
// Weight calculation
// ─────────────────────────────────────────────────────────────────
// w[p] = ma[p]^power / Σ ma[q]^power over evaluated peers with ma > 0.
// Everyone else gets 0. A vanishing denominator zeroes the vector.
// ─────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tpl_core::Uid;

use crate::reputation::ReputationTracker;

/// Raise every value to `power` and normalize to sum 1.
/// Returns all zeros when the powered sum is not above `epsilon`.
pub fn min_power_normalization(values: &[f64], power: f64, epsilon: f64) -> Vec<f64> {
    let powered: Vec<f64> = values.iter().map(|v| v.powf(power)).collect();
    let sum: f64 = powered.iter().sum();
    if sum.is_nan() || sum <= epsilon {
        return vec![0.0; values.len()];
    }
    powered.into_iter().map(|p| p / sum).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    weights: BTreeMap<Uid, f64>,
}

impl WeightVector {
    pub fn compute(tracker: &ReputationTracker, power: f64, epsilon: f64) -> Self {
        let masked: Vec<(Uid, f64)> = tracker
            .evaluated_uids()
            .iter()
            .map(|&uid| (uid, tracker.moving_avg_score(uid)))
            .filter(|(_, ma)| *ma > 0.0)
            .collect();

        let scores: Vec<f64> = masked.iter().map(|(_, ma)| *ma).collect();
        let normalized = min_power_normalization(&scores, power, epsilon);

        let weights = masked
            .iter()
            .zip(normalized)
            .map(|((uid, _), w)| (*uid, w))
            .collect();
        Self { weights }
    }

    pub fn get(&self, uid: Uid) -> f64 {
        self.weights.get(&uid).copied().unwrap_or(0.0)
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn is_zero(&self) -> bool {
        self.weights.values().all(|w| *w == 0.0)
    }

    /// Dense `(uid, weight)` list covering every uid in the registry,
    /// in the order given. Unweighted peers get 0.
    pub fn for_registry(&self, uids: &[Uid]) -> Vec<(Uid, f64)> {
        uids.iter().map(|&uid| (uid, self.get(uid))).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Uid, f64)> + '_ {
        self.weights.iter().map(|(uid, w)| (*uid, *w))
    }
}
