// ─────────────────────────────────────────────────────────────────
// Optimizer & learning-rate schedule
// ─────────────────────────────────────────────────────────────────
// Optimizer:  plain SGD, p -= lr · grad (grads arrive already signed)
// Schedule:   linear warmup 0.1 → 1.0 over `warmup_steps`, then cosine
//             annealing with warm restarts (T_0, T_mult, eta_min)
// Both are plain serde structs so they ride inside checkpoints.
// ─────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::hparams::Hparams;
use crate::tensor::ParameterSet;

const WARMUP_START_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub lr: f32,
    /// Number of optimizer steps taken
    pub step: u64,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr, step: 0 }
    }

    /// Apply one step to every parameter that has a gradient.
    /// Returns how many parameters were updated.
    pub fn step(&mut self, params: &mut ParameterSet, grads: &ParameterSet) -> usize {
        let mut applied = 0;
        for (name, grad) in grads {
            if let Some(param) = params.get_mut(name) {
                if param.sub_scaled(grad, self.lr).is_ok() {
                    applied += 1;
                } else {
                    log::warn!("Gradient for {} has the wrong size, skipped", name);
                }
            }
        }
        self.step += 1;
        applied
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrScheduler {
    pub base_lr: f32,
    pub warmup_steps: u64,
    pub t_0: u64,
    pub t_mult: u64,
    pub eta_min: f32,
    /// Number of `step()` calls so far
    pub last_epoch: u64,
}

impl LrScheduler {
    pub fn from_hparams(h: &Hparams) -> Self {
        Self {
            base_lr: h.learning_rate,
            warmup_steps: h.warmup_steps,
            t_0: h.t_0.max(1),
            t_mult: h.t_mult.max(1),
            eta_min: h.learning_rate * h.eta_min_factor,
            last_epoch: 0,
        }
    }

    /// Learning rate in effect at `epoch`.
    pub fn lr_at(&self, epoch: u64) -> f32 {
        let base = self.base_lr as f64;
        if epoch < self.warmup_steps {
            let progress = epoch as f64 / self.warmup_steps as f64;
            let factor = WARMUP_START_FACTOR + (1.0 - WARMUP_START_FACTOR) * progress;
            return (base * factor) as f32;
        }

        let mut t_cur = epoch - self.warmup_steps;
        let mut t_i = self.t_0.max(1);
        if self.t_mult <= 1 {
            t_cur %= t_i;
        } else {
            while t_cur >= t_i {
                t_cur -= t_i;
                t_i = t_i.saturating_mul(self.t_mult);
            }
        }

        let eta_min = self.eta_min as f64;
        let cosine = (1.0 + (PI * t_cur as f64 / t_i as f64).cos()) / 2.0;
        (eta_min + (base - eta_min) * cosine) as f32
    }

    pub fn last_lr(&self) -> f32 {
        self.lr_at(self.last_epoch)
    }

    pub fn step(&mut self) {
        self.last_epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn scheduler(warmup: u64, t_0: u64, t_mult: u64) -> LrScheduler {
        LrScheduler {
            base_lr: 1.0,
            warmup_steps: warmup,
            t_0,
            t_mult,
            eta_min: 0.1,
            last_epoch: 0,
        }
    }

    #[test]
    fn test_warmup_is_linear_from_tenth() {
        let s = scheduler(10, 100, 2);
        assert!((s.lr_at(0) - 0.1).abs() < 1e-6);
        assert!((s.lr_at(5) - 0.55).abs() < 1e-6);
        assert!((s.lr_at(10) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_midpoint_and_restart() {
        let s = scheduler(0, 4, 2);
        assert!((s.lr_at(0) - 1.0).abs() < 1e-6);
        // halfway through the first cycle: eta_min + (1 - eta_min) / 2
        assert!((s.lr_at(2) - 0.55).abs() < 1e-6);
        // first cycle is 4 long, second 8: epoch 4 restarts at base lr
        assert!((s.lr_at(4) - 1.0).abs() < 1e-6);
        assert!((s.lr_at(8) - 0.55).abs() < 1e-6);
        assert!((s.lr_at(12) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_t_mult_one_repeats_cycles() {
        let s = scheduler(0, 4, 1);
        assert!((s.lr_at(4) - s.lr_at(0)).abs() < 1e-6);
        assert!((s.lr_at(6) - s.lr_at(2)).abs() < 1e-6);
    }

    #[test]
    fn test_step_advances_last_lr() {
        let mut s = scheduler(10, 100, 2);
        let before = s.last_lr();
        s.step();
        assert_eq!(s.last_epoch, 1);
        assert!(s.last_lr() > before);
    }

    #[test]
    fn test_sgd_updates_only_matching_parameters() {
        let mut params = ParameterSet::new();
        params.insert("a".to_string(), Tensor::from_vec(vec![2], vec![1.0, 1.0]).unwrap());
        params.insert("b".to_string(), Tensor::from_vec(vec![1], vec![5.0]).unwrap());

        let mut grads = ParameterSet::new();
        grads.insert("a".to_string(), Tensor::from_vec(vec![2], vec![1.0, -1.0]).unwrap());
        grads.insert("ghost".to_string(), Tensor::zeros(&[1]));

        let mut sgd = Sgd::new(0.25);
        assert_eq!(sgd.step(&mut params, &grads), 1);
        assert_eq!(params["a"].data, vec![0.75, 1.25]);
        assert_eq!(params["b"].data, vec![5.0]);
        assert_eq!(sgd.step, 1);
    }
}
