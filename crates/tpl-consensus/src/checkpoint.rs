// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - TRAINING-STATE CHECKPOINTS
//
// A checkpoint is everything needed to resume training on another node:
// model parameters, optimizer + scheduler state, momentum, and the window
// bookkeeping. Encoded with bincode; the SHA3-256 of the encoded bytes is
// the checkpoint id and is re-checked on every read.
//
// How it's stored:
// 1. `checkpoint_<step>` → (id, bytes), step zero-padded so keys sort
// 2. `latest_checkpoint_step` → highest stored step (LE u64)
// 3. Old entries pruned on demand (keep last N)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::path::Path;
use tpl_core::{LrScheduler, ParameterSet, Sgd};

/// Current on-disk / on-wire layout
pub const CHECKPOINT_VERSION: u32 = 1;

const KEY_PREFIX: &str = "checkpoint_";
const LATEST_KEY: &[u8] = b"latest_checkpoint_step";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    pub global_step: u64,
    pub start_window: u64,
    pub current_window: u64,
    pub parameters: ParameterSet,
    pub optimizer: Sgd,
    pub scheduler: LrScheduler,
    /// Last decoded gradient per parameter
    pub momentum: ParameterSet,
}

impl CheckpointState {
    pub fn encode(&self) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Box<dyn std::error::Error>> {
        let state: CheckpointState = bincode::deserialize(bytes)?;
        if state.version != CHECKPOINT_VERSION {
            return Err(format!(
                "Unsupported checkpoint version {} (expected {})",
                state.version, CHECKPOINT_VERSION
            )
            .into());
        }
        Ok(state)
    }

    /// SHA3-256 (hex) of the encoded checkpoint
    pub fn calculate_id(&self) -> Result<String, Box<dyn std::error::Error>> {
        Ok(digest_hex(&self.encode()?))
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn step_key(step: u64) -> String {
    format!("{}{:020}", KEY_PREFIX, step)
}

#[derive(Serialize, Deserialize)]
struct StoredCheckpoint {
    id: String,
    bytes: Vec<u8>,
}

/// Checkpoint store with persistent storage
#[derive(Clone)]
pub struct CheckpointStore {
    db: sled::Db,
}

impl CheckpointStore {
    /// Open (or create) the store.
    ///
    /// Retries with backoff if the database lock is still held by a process
    /// that has not finished shutting down.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let path_ref = db_path.as_ref();
        let retry_delays_ms: [u64; 3] = [500, 1000, 2000];

        match Self::try_open(path_ref) {
            Ok(store) => return Ok(store),
            Err(e) if Self::is_lock_error(&*e) => {
                log::warn!(
                    "Checkpoint DB lock held at {}, retrying ({} attempts remain)",
                    path_ref.display(),
                    retry_delays_ms.len()
                );
            }
            Err(e) => return Err(e),
        }

        for (i, delay_ms) in retry_delays_ms.iter().enumerate() {
            std::thread::sleep(std::time::Duration::from_millis(*delay_ms));
            match Self::try_open(path_ref) {
                Ok(store) => {
                    log::info!("Checkpoint DB lock acquired on retry {}", i + 1);
                    return Ok(store);
                }
                Err(e) if Self::is_lock_error(&*e) && i + 1 < retry_delays_ms.len() => continue,
                Err(e) => return Err(e),
            }
        }

        Err("Checkpoint DB lock acquisition timed out".into())
    }

    /// Build a store on top of an already-open database (shared with other trees).
    pub fn with_db(db: sled::Db) -> Self {
        Self { db }
    }

    fn try_open(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    fn is_lock_error(e: &dyn std::error::Error) -> bool {
        let msg = e.to_string();
        msg.contains("Resource temporarily unavailable")
            || msg.contains("WouldBlock")
            || msg.contains("Would block")
            || msg.contains("lock")
            || msg.contains("EAGAIN")
    }

    /// Store a checkpoint; returns its id.
    pub fn store(&self, state: &CheckpointState) -> Result<String, Box<dyn std::error::Error>> {
        let bytes = state.encode()?;
        self.store_encoded(state.global_step, bytes)
    }

    /// Store bytes received from elsewhere. They must decode as a checkpoint.
    pub fn store_bytes(&self, bytes: &[u8]) -> Result<String, Box<dyn std::error::Error>> {
        let state = CheckpointState::decode(bytes)?;
        self.store_encoded(state.global_step, bytes.to_vec())
    }

    fn store_encoded(
        &self,
        step: u64,
        bytes: Vec<u8>,
    ) -> Result<String, Box<dyn std::error::Error>> {
        let id = digest_hex(&bytes);
        let record = bincode::serialize(&StoredCheckpoint {
            id: id.clone(),
            bytes,
        })?;
        self.db.insert(step_key(step).as_bytes(), record)?;

        if self.latest_step()?.is_none_or(|latest| step >= latest) {
            self.db.insert(LATEST_KEY, step.to_le_bytes().to_vec())?;
        }

        self.db.flush()?;
        Ok(id)
    }

    pub fn latest_step(&self) -> Result<Option<u64>, Box<dyn std::error::Error>> {
        Ok(self.db.get(LATEST_KEY)?.map(|bytes| {
            let arr: [u8; 8] = bytes.as_ref().try_into().unwrap_or([0u8; 8]);
            u64::from_le_bytes(arr)
        }))
    }

    /// Raw (verified) bytes for a step
    pub fn get_bytes(&self, step: u64) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error>> {
        let raw = match self.db.get(step_key(step).as_bytes())? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let record: StoredCheckpoint = bincode::deserialize(&raw)?;
        let actual = digest_hex(&record.bytes);
        if actual != record.id {
            return Err(format!(
                "Checkpoint {} is corrupt: id {} but content hashes to {}",
                step, record.id, actual
            )
            .into());
        }
        Ok(Some(record.bytes))
    }

    pub fn get(&self, step: u64) -> Result<Option<CheckpointState>, Box<dyn std::error::Error>> {
        match self.get_bytes(step)? {
            Some(bytes) => Ok(Some(CheckpointState::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn latest_bytes(&self) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error>> {
        match self.latest_step()? {
            Some(step) => self.get_bytes(step),
            None => Ok(None),
        }
    }

    pub fn latest(&self) -> Result<Option<CheckpointState>, Box<dyn std::error::Error>> {
        match self.latest_step()? {
            Some(step) => self.get(step),
            None => Ok(None),
        }
    }

    /// Stored steps, ascending
    pub fn steps(&self) -> Result<Vec<u64>, Box<dyn std::error::Error>> {
        let mut steps = Vec::new();
        for item in self.db.scan_prefix(KEY_PREFIX.as_bytes()) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some(step) = key.strip_prefix(KEY_PREFIX).and_then(|s| s.parse().ok()) {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    pub fn count(&self) -> usize {
        self.db.scan_prefix(KEY_PREFIX.as_bytes()).count()
    }

    /// Prune old checkpoints (keep last N)
    pub fn prune(&self, keep_last: usize) -> Result<usize, Box<dyn std::error::Error>> {
        let steps = self.steps()?;
        if steps.len() <= keep_last {
            return Ok(0);
        }

        let to_remove = steps.len() - keep_last;
        for step in steps.iter().take(to_remove) {
            self.db.remove(step_key(*step).as_bytes())?;
        }
        self.db.flush()?;
        log::debug!("Pruned {} checkpoints, kept {}", to_remove, keep_last);

        Ok(to_remove)
    }

    pub fn stats(&self) -> Result<CheckpointStats, Box<dyn std::error::Error>> {
        Ok(CheckpointStats {
            total_checkpoints: self.count(),
            latest_step: self.latest_step()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub total_checkpoints: usize,
    pub latest_step: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tpl_core::{Hparams, Tensor};

    fn sample_state(step: u64) -> CheckpointState {
        let mut parameters = ParameterSet::new();
        parameters.insert(
            "w".to_string(),
            Tensor::from_vec(vec![2], vec![step as f32, -1.0]).unwrap(),
        );
        let momentum = tpl_core::tensor::zeros_like(&parameters);
        CheckpointState {
            version: CHECKPOINT_VERSION,
            global_step: step,
            start_window: 3,
            current_window: 3 + step,
            parameters,
            optimizer: Sgd::new(0.01),
            scheduler: LrScheduler::from_hparams(&Hparams::default()),
            momentum,
        }
    }

    #[test]
    fn test_encode_decode_and_id() {
        let state = sample_state(5);
        let bytes = state.encode().unwrap();
        assert_eq!(CheckpointState::decode(&bytes).unwrap(), state);
        assert_eq!(state.calculate_id().unwrap(), state.calculate_id().unwrap());
        assert_ne!(
            state.calculate_id().unwrap(),
            sample_state(6).calculate_id().unwrap()
        );
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut state = sample_state(1);
        state.version = 99;
        let bytes = bincode::serialize(&state).unwrap();
        assert!(CheckpointState::decode(&bytes).is_err());
    }

    #[test]
    fn test_store_and_latest() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(temp_dir.path()).unwrap();
        assert!(store.latest().unwrap().is_none());

        let id = store.store(&sample_state(100)).unwrap();
        assert_eq!(id, sample_state(100).calculate_id().unwrap());
        store.store(&sample_state(200)).unwrap();
        // an older step does not move "latest" backwards
        store.store(&sample_state(50)).unwrap();

        assert_eq!(store.latest().unwrap().unwrap().global_step, 200);
        assert_eq!(store.get(100).unwrap().unwrap(), sample_state(100));
        assert!(store.get(7).unwrap().is_none());
        assert_eq!(store.steps().unwrap(), vec![50, 100, 200]);
    }

    #[test]
    fn test_store_bytes_validates() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(temp_dir.path()).unwrap();
        assert!(store.store_bytes(b"not a checkpoint").is_err());

        let bytes = sample_state(4).encode().unwrap();
        store.store_bytes(&bytes).unwrap();
        assert_eq!(store.latest_bytes().unwrap().unwrap(), bytes);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(temp_dir.path()).unwrap();
        for step in [1, 2, 3, 4, 5] {
            store.store(&sample_state(step)).unwrap();
        }

        assert_eq!(store.prune(2).unwrap(), 3);
        assert_eq!(store.steps().unwrap(), vec![4, 5]);
        assert_eq!(store.prune(2).unwrap(), 0);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_checkpoints, 2);
        assert_eq!(stats.latest_step, Some(5));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = CheckpointStore::open(temp_dir.path()).unwrap();
            store.store(&sample_state(9)).unwrap();
        }
        let store = CheckpointStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().global_step, 9);
    }
}
