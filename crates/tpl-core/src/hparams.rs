use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Network hyperparameters shared by every validator.
/// Missing keys fall back to the defaults below, so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hparams {
    // Windowing
    pub blocks_per_window: u64,
    pub validator_offset: u64,
    pub windows_per_weights: u64,
    pub checkpoint_frequency: u64,

    // Reputation
    pub ma_alpha: f64,
    pub power_normalisation: f64,
    pub weight_epsilon: f64,
    pub inactivity_retention: f64,
    pub missing_submission_retention: f64,

    // Evaluation data
    pub validator_sample_rate: f64,
    pub pages_per_window: usize,
    pub batch_size: usize,
    pub sequence_length: usize,

    // Optimizer / schedule
    pub learning_rate: f32,
    pub warmup_steps: u64,
    pub t_0: u64,
    pub t_mult: u64,
    pub eta_min_factor: f32,

    // Compression
    pub topk_compression: usize,

    // Timing
    pub gather_timeout_secs: u64,
    pub eval_timeout_secs: u64,
    pub offset_poll_secs: u64,

    pub seed: u64,
}

impl Default for Hparams {
    fn default() -> Self {
        Self {
            blocks_per_window: 7,
            validator_offset: 2,
            windows_per_weights: 10,
            checkpoint_frequency: 100,
            ma_alpha: 0.02,
            power_normalisation: 2.0,
            weight_epsilon: 1e-8,
            inactivity_retention: 0.75,
            missing_submission_retention: 0.5,
            validator_sample_rate: 0.2,
            pages_per_window: 2,
            batch_size: 6,
            sequence_length: 128,
            learning_rate: 4e-4,
            warmup_steps: 250,
            t_0: 10_000,
            t_mult: 2,
            eta_min_factor: 0.1,
            topk_compression: 32,
            gather_timeout_secs: 5,
            eval_timeout_secs: 30,
            offset_poll_secs: 12,
            seed: 42,
        }
    }
}

impl Hparams {
    /// Load hyperparameters from a `.toml` or `.json` file
    pub fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        let hparams = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        Ok(hparams)
    }

    /// Save hyperparameters as TOML
    pub fn save_to_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Overlay `TPL_*` environment variables on top of `self`.
    /// Useful for containerized deployments
    pub fn apply_env(mut self) -> Result<Self, Box<dyn std::error::Error>> {
        env_override("TPL_BLOCKS_PER_WINDOW", &mut self.blocks_per_window)?;
        env_override("TPL_VALIDATOR_OFFSET", &mut self.validator_offset)?;
        env_override("TPL_WINDOWS_PER_WEIGHTS", &mut self.windows_per_weights)?;
        env_override("TPL_CHECKPOINT_FREQUENCY", &mut self.checkpoint_frequency)?;
        env_override("TPL_MA_ALPHA", &mut self.ma_alpha)?;
        env_override("TPL_POWER_NORMALISATION", &mut self.power_normalisation)?;
        env_override("TPL_VALIDATOR_SAMPLE_RATE", &mut self.validator_sample_rate)?;
        env_override("TPL_LEARNING_RATE", &mut self.learning_rate)?;
        env_override("TPL_GATHER_TIMEOUT_SECS", &mut self.gather_timeout_secs)?;
        env_override("TPL_EVAL_TIMEOUT_SECS", &mut self.eval_timeout_secs)?;
        env_override("TPL_OFFSET_POLL_SECS", &mut self.offset_poll_secs)?;
        env_override("TPL_SEED", &mut self.seed)?;
        Ok(self)
    }

    /// Defaults + environment overlay
    pub fn load_from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Self::default().apply_env()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.blocks_per_window == 0 {
            return Err("blocks_per_window must be > 0".to_string());
        }

        if self.windows_per_weights == 0 {
            return Err("windows_per_weights must be > 0".to_string());
        }

        if self.checkpoint_frequency == 0 {
            return Err("checkpoint_frequency must be > 0".to_string());
        }

        if !(self.ma_alpha > 0.0 && self.ma_alpha <= 1.0) {
            return Err(format!("ma_alpha must be in (0, 1], got {}", self.ma_alpha));
        }

        if !(self.power_normalisation.is_finite() && self.power_normalisation > 0.0) {
            return Err("power_normalisation must be a positive number".to_string());
        }

        if !(self.validator_sample_rate > 0.0 && self.validator_sample_rate <= 1.0) {
            return Err(format!(
                "validator_sample_rate must be in (0, 1], got {}",
                self.validator_sample_rate
            ));
        }

        for (name, v) in [
            ("inactivity_retention", self.inactivity_retention),
            ("missing_submission_retention", self.missing_submission_retention),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("{} must be in [0, 1], got {}", name, v));
            }
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err("learning_rate must be a positive number".to_string());
        }

        if self.t_0 == 0 {
            return Err("t_0 must be > 0".to_string());
        }

        if self.pages_per_window == 0 || self.batch_size == 0 || self.sequence_length == 0 {
            return Err("pages_per_window, batch_size and sequence_length must be > 0".to_string());
        }

        Ok(())
    }
}

fn env_override<T>(key: &str, slot: &mut T) -> Result<(), Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::error::Error + 'static,
{
    if let Ok(raw) = std::env::var(key) {
        *slot = raw
            .parse()
            .map_err(|e: T::Err| format!("{}={:?}: {}", key, raw, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let h = Hparams::default();
        assert!(h.validate().is_ok());
        assert_eq!(h.inactivity_retention, 0.75);
        assert_eq!(h.missing_submission_retention, 0.5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut h = Hparams {
            blocks_per_window: 0,
            ..Hparams::default()
        };
        assert!(h.validate().is_err());

        h.blocks_per_window = 7;
        h.ma_alpha = 0.0;
        assert!(h.validate().is_err());

        h.ma_alpha = 0.1;
        h.validator_sample_rate = 1.5;
        assert!(h.validate().is_err());

        h.validator_sample_rate = 0.5;
        h.inactivity_retention = -0.1;
        assert!(h.validate().is_err());

        h.inactivity_retention = 0.75;
        assert!(h.validate().is_ok());
    }

    #[test]
    fn test_env_overlay() {
        std::env::set_var("TPL_OFFSET_POLL_SECS", "3");
        let h = Hparams::load_from_env().unwrap();
        assert_eq!(h.offset_poll_secs, 3);
        assert_eq!(h.blocks_per_window, Hparams::default().blocks_per_window);

        std::env::set_var("TPL_OFFSET_POLL_SECS", "soon");
        assert!(Hparams::load_from_env().is_err());
        std::env::remove_var("TPL_OFFSET_POLL_SECS");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let h: Hparams = toml::from_str("blocks_per_window = 12\nma_alpha = 0.5\n").unwrap();
        assert_eq!(h.blocks_per_window, 12);
        assert_eq!(h.ma_alpha, 0.5);
        assert_eq!(h.windows_per_weights, Hparams::default().windows_per_weights);
    }

    #[test]
    fn test_save_and_load_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hparams.toml");

        let h = Hparams {
            checkpoint_frequency: 3,
            power_normalisation: 3.0,
            ..Hparams::default()
        };
        h.save_to_file(&path).unwrap();

        let loaded = Hparams::load_from_file(&path).unwrap();
        assert_eq!(loaded, h);
    }

    #[test]
    fn test_load_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hparams.json");
        fs::write(&path, r#"{"blocks_per_window": 3, "topk_compression": 8}"#).unwrap();

        let loaded = Hparams::load_from_file(&path).unwrap();
        assert_eq!(loaded.blocks_per_window, 3);
        assert_eq!(loaded.topk_compression, 8);
        assert_eq!(loaded.seed, 42);
    }
}
