// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - PEER REPUTATION & INACTIVITY SLASHING
//
// Every evaluated gradient moves a peer's reputation:
// - binary moving average tracks "beats random data" (+1) vs "does not" (-1)
// - final score = raw improvement × (binary average / 2)
// - moving average score = EMA of final scores, clamped at 0
// Peers that miss a submission lose half their score, peers that leave the
// eval set decay by a flat rate every window until they return.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tpl_core::{Hparams, Uid};

/// Outcome of evaluating one peer's gradient for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub loss_before_own: f64,
    pub loss_after_own: f64,
    pub loss_before_random: f64,
    pub loss_after_random: f64,
    pub improvement_own: f64,
    pub improvement_random: f64,
    /// +1 when the gradient helps its own data more than random data, else -1
    pub binary_indicator: i8,
    pub raw_score: f64,
    /// Filled in by `ReputationTracker::record_evaluation`
    pub final_score: f64,
}

impl EvaluationResult {
    pub fn from_losses(
        loss_before_own: f64,
        loss_after_own: f64,
        loss_before_random: f64,
        loss_after_random: f64,
    ) -> Self {
        let improvement_own = relative_improvement(loss_before_own, loss_after_own);
        let improvement_random = relative_improvement(loss_before_random, loss_after_random);
        let binary_indicator = if improvement_own > improvement_random {
            1
        } else {
            -1
        };

        Self {
            loss_before_own,
            loss_after_own,
            loss_before_random,
            loss_after_random,
            improvement_own,
            improvement_random,
            binary_indicator,
            raw_score: improvement_own,
            final_score: 0.0,
        }
    }
}

/// `(before - after) / before`, or 0 unless the loss before is positive.
pub fn relative_improvement(before: f64, after: f64) -> f64 {
    if before <= 0.0 {
        0.0
    } else {
        (before - after) / before
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerReputation {
    /// Raw score of the last successful evaluation
    pub score: f64,
    /// Never negative
    pub moving_avg_score: f64,
    /// Stays in [-1, 1]
    pub binary_moving_average: f64,
}

/// Recorded when a peer leaves the eval set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InactiveSnapshot {
    pub since_window: u64,
    pub score_at_departure: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationTracker {
    ma_alpha: f64,
    missing_submission_retention: f64,
    inactivity_retention: f64,

    peers: BTreeMap<Uid, PeerReputation>,
    inactive: BTreeMap<Uid, InactiveSnapshot>,
    /// Append-only: every peer ever evaluated (or marked missing)
    evaluated: BTreeSet<Uid>,
}

impl ReputationTracker {
    pub fn new(ma_alpha: f64, missing_submission_retention: f64, inactivity_retention: f64) -> Self {
        Self {
            ma_alpha,
            missing_submission_retention,
            inactivity_retention,
            peers: BTreeMap::new(),
            inactive: BTreeMap::new(),
            evaluated: BTreeSet::new(),
        }
    }

    pub fn from_hparams(h: &Hparams) -> Self {
        Self::new(
            h.ma_alpha,
            h.missing_submission_retention,
            h.inactivity_retention,
        )
    }

    fn entry(&mut self, uid: Uid) -> &mut PeerReputation {
        self.peers.entry(uid).or_default()
    }

    /// Create zeroed records for peers seen in the eval set for the first time.
    pub fn observe(&mut self, uids: &[Uid]) {
        for &uid in uids {
            self.entry(uid);
        }
    }

    /// Fold a successful evaluation into the peer's reputation.
    /// Sets `result.final_score` and returns the new moving average.
    pub fn record_evaluation(&mut self, uid: Uid, result: &mut EvaluationResult) -> f64 {
        let alpha = self.ma_alpha;
        let record = self.entry(uid);

        record.binary_moving_average = ((1.0 - alpha) * record.binary_moving_average
            + alpha * result.binary_indicator as f64)
            .clamp(-1.0, 1.0);
        let normalized_binary = record.binary_moving_average / 2.0;

        result.final_score = result.raw_score * normalized_binary;
        record.moving_avg_score =
            ((1.0 - alpha) * record.moving_avg_score + alpha * result.final_score).max(0.0);
        record.score = result.raw_score;

        let ma = record.moving_avg_score;
        self.evaluated.insert(uid);
        ma
    }

    /// The peer was selected but published nothing usable this window.
    pub fn record_missing(&mut self, uid: Uid) -> f64 {
        let retention = self.missing_submission_retention;
        let record = self.entry(uid);
        record.moving_avg_score *= retention;
        let ma = record.moving_avg_score;
        self.evaluated.insert(uid);
        ma
    }

    /// Start tracking peers that just left the eval set. Peers already
    /// tracked keep their original snapshot.
    pub fn mark_inactive(&mut self, uids: &[Uid], window: u64) {
        for &uid in uids {
            if self.inactive.contains_key(&uid) {
                continue;
            }
            let score_at_departure = self.entry(uid).moving_avg_score;
            self.inactive.insert(
                uid,
                InactiveSnapshot {
                    since_window: window,
                    score_at_departure,
                },
            );
            log::info!(
                "Peer {} became inactive at window {} (score {:.6})",
                uid,
                window,
                score_at_departure
            );
        }
    }

    /// Decay every tracked inactive peer once. Peers back in `eval_peers`
    /// are untracked without penalty. Returns the uids that were decayed.
    pub fn apply_inactivity(&mut self, eval_peers: &[Uid]) -> Vec<Uid> {
        let returned: Vec<Uid> = self
            .inactive
            .keys()
            .copied()
            .filter(|uid| eval_peers.contains(uid))
            .collect();
        for uid in returned {
            self.inactive.remove(&uid);
            log::info!("Peer {} is active again", uid);
        }

        let retention = self.inactivity_retention;
        let slashed: Vec<Uid> = self.inactive.keys().copied().collect();
        for &uid in &slashed {
            let record = self.peers.entry(uid).or_default();
            record.moving_avg_score *= retention;
            log::debug!(
                "Inactivity decay for peer {}: score now {:.6}",
                uid,
                record.moving_avg_score
            );
        }
        slashed
    }

    /// Overwrite a peer's record, e.g. when seeding from a previous run.
    pub fn set_record(&mut self, uid: Uid, record: PeerReputation) {
        self.peers.insert(uid, record);
    }

    pub fn get(&self, uid: Uid) -> Option<&PeerReputation> {
        self.peers.get(&uid)
    }

    pub fn moving_avg_score(&self, uid: Uid) -> f64 {
        self.peers.get(&uid).map_or(0.0, |r| r.moving_avg_score)
    }

    pub fn is_evaluated(&self, uid: Uid) -> bool {
        self.evaluated.contains(&uid)
    }

    pub fn evaluated_uids(&self) -> &BTreeSet<Uid> {
        &self.evaluated
    }

    pub fn inactive_peers(&self) -> &BTreeMap<Uid, InactiveSnapshot> {
        &self.inactive
    }

    pub fn records(&self) -> impl Iterator<Item = (Uid, &PeerReputation)> {
        self.peers.iter().map(|(uid, r)| (*uid, r))
    }
}

impl Default for ReputationTracker {
    fn default() -> Self {
        Self::from_hparams(&Hparams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ReputationTracker {
        ReputationTracker::new(0.5, 0.5, 0.75)
    }

    #[test]
    fn test_improvements_and_indicator() {
        let r = EvaluationResult::from_losses(2.0, 1.5, 2.0, 1.8);
        assert!((r.improvement_own - 0.25).abs() < 1e-12);
        assert!((r.improvement_random - 0.1).abs() < 1e-12);
        assert_eq!(r.binary_indicator, 1);
        assert!((r.raw_score - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_indicator_negative_when_random_helps_more() {
        let r = EvaluationResult::from_losses(2.0, 1.9, 2.0, 1.0);
        assert_eq!(r.binary_indicator, -1);

        // ties are not "better"
        let tie = EvaluationResult::from_losses(1.0, 0.5, 1.0, 0.5);
        assert_eq!(tie.binary_indicator, -1);
    }

    #[test]
    fn test_zero_before_loss_means_zero_improvement() {
        let r = EvaluationResult::from_losses(0.0, 0.0, 0.0, 0.0);
        assert_eq!(r.improvement_own, 0.0);
        assert_eq!(r.improvement_random, 0.0);
    }

    #[test]
    fn test_non_positive_before_loss_means_zero_improvement() {
        assert_eq!(relative_improvement(-2.0, -3.0), 0.0);
        assert_eq!(relative_improvement(-0.5, 1.0), 0.0);
        assert!((relative_improvement(2.0, 1.5) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_record_evaluation_updates_all_scores() {
        let mut t = tracker();
        let mut r = EvaluationResult::from_losses(2.0, 1.5, 2.0, 1.8);
        let ma = t.record_evaluation(3, &mut r);

        // bma = 0.5 * 0 + 0.5 * 1 = 0.5; normalized = 0.25; final = 0.25 * 0.25
        let rec = t.get(3).unwrap();
        assert!((rec.binary_moving_average - 0.5).abs() < 1e-12);
        assert!((r.final_score - 0.0625).abs() < 1e-12);
        assert!((ma - 0.03125).abs() < 1e-12);
        assert_eq!(rec.score, 0.25);
        assert!(t.is_evaluated(3));
    }

    #[test]
    fn test_moving_average_never_negative() {
        let mut t = tracker();
        for _ in 0..10 {
            // own loss gets worse, random improves: negative raw, negative indicator
            let mut r = EvaluationResult::from_losses(1.0, 1.5, 1.0, 0.5);
            t.record_evaluation(1, &mut r);
            assert!(t.moving_avg_score(1) >= 0.0);
            let bma = t.get(1).unwrap().binary_moving_average;
            assert!((-1.0..=1.0).contains(&bma));
        }
    }

    #[test]
    fn test_missing_submission_halves_score() {
        let mut t = tracker();
        t.peers.insert(
            7,
            PeerReputation {
                moving_avg_score: 0.8,
                ..PeerReputation::default()
            },
        );
        assert!((t.record_missing(7) - 0.4).abs() < 1e-12);
        assert!(t.is_evaluated(7));
    }

    #[test]
    fn test_inactivity_decay_and_return() {
        let mut t = tracker();
        t.peers.insert(
            4,
            PeerReputation {
                moving_avg_score: 1.0,
                ..PeerReputation::default()
            },
        );

        t.mark_inactive(&[4], 10);
        for _ in 0..3 {
            assert_eq!(t.apply_inactivity(&[1, 2]), vec![4]);
        }
        assert!((t.moving_avg_score(4) - 0.75f64.powi(3)).abs() < 1e-12);
        assert_eq!(t.inactive_peers()[&4].since_window, 10);
        assert_eq!(t.inactive_peers()[&4].score_at_departure, 1.0);

        // back in the eval set: untracked, no further penalty
        assert!(t.apply_inactivity(&[4]).is_empty());
        assert!(t.inactive_peers().is_empty());
        assert!((t.moving_avg_score(4) - 0.421875).abs() < 1e-12);
    }

    #[test]
    fn test_mark_inactive_keeps_first_snapshot() {
        let mut t = tracker();
        t.mark_inactive(&[9], 1);
        t.mark_inactive(&[9], 5);
        assert_eq!(t.inactive_peers()[&9].since_window, 1);
    }

    #[test]
    fn test_observe_creates_records_lazily() {
        let mut t = tracker();
        t.observe(&[1, 2]);
        assert!(t.get(1).is_some());
        assert!(t.get(3).is_none());
        assert!(!t.is_evaluated(1));
        assert_eq!(t.records().count(), 2);
    }
}
