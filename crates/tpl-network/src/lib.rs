// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - NETWORK MODULE
//
// Everything the validator talks to lives behind a narrow async trait:
// - Chain: registry snapshot + fire-and-forget weight submission
// - BlockSource: stream of block heights (may drop, gets resubscribed)
// - ObjectStore: per-window gradient / checkpoint blobs
// - PeerDirectory: gather + eval peer lists
// - Dataset: tokenized pages for (offset, seed)
// - CatchUpSource: full training state when the node has fallen behind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tpl_consensus::CheckpointState;
use tpl_core::{Batch, GradientPayload, Uid};

pub mod clock;
pub mod peers;

pub use clock::{WindowClock, WindowState};
pub use peers::{PeerSetManager, PeerUpdate};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed payload: {0}")]
    Codec(String),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("hotkey {0} is not registered on this subnet")]
    NotRegistered(String),
    #[error("chain request failed: {0}")]
    Rpc(String),
    #[error("block subscription failed: {0}")]
    Subscription(String),
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("page {page} unavailable: {reason}")]
    PageUnavailable { page: u64, reason: String },
    #[error("dataset failure: {0}")]
    Backend(String),
}

// ─────────────────────────────────────────────────────────────────
// Chain
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neuron {
    pub uid: Uid,
    pub hotkey: String,
    pub stake: f64,
}

/// Registry contents at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub neurons: Vec<Neuron>,
}

impl RegistrySnapshot {
    pub fn uid_of(&self, hotkey: &str) -> Option<Uid> {
        self.neurons
            .iter()
            .find(|n| n.hotkey == hotkey)
            .map(|n| n.uid)
    }

    /// Uid holding the most stake; ties go to the lowest uid.
    pub fn highest_stake_uid(&self) -> Option<Uid> {
        self.neurons
            .iter()
            .max_by(|a, b| {
                a.stake
                    .partial_cmp(&b.stake)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.uid.cmp(&a.uid))
            })
            .map(|n| n.uid)
    }

    pub fn uids(&self) -> Vec<Uid> {
        self.neurons.iter().map(|n| n.uid).collect()
    }
}

#[async_trait]
pub trait Chain: Send + Sync {
    async fn registry(&self) -> Result<RegistrySnapshot, ChainError>;

    /// Submit weights without waiting for inclusion or finalization.
    async fn set_weights(&self, uids: &[Uid], weights: &[f64]) -> Result<(), ChainError>;
}

pub type BlockStream = BoxStream<'static, Result<u64, ChainError>>;

#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn subscribe(&self) -> Result<BlockStream, ChainError>;
}

// ─────────────────────────────────────────────────────────────────
// Object store / peers / data
// ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        bytes: Vec<u8>,
        uid: Uid,
        window: u64,
        key: &str,
        global_step: u64,
    ) -> Result<(), CommsError>;

    /// `Ok(None)` when the peer published nothing under `key` for `window`.
    async fn get(
        &self,
        uid: Uid,
        window: u64,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, CommsError>;

    /// One entry per requested uid, `None` for absent or late peers.
    async fn gather(
        &self,
        uids: &[Uid],
        window: u64,
        key: &str,
        timeout: Duration,
    ) -> Result<Vec<(Uid, Option<Vec<u8>>)>, CommsError>;

    async fn post_start_window(&self, uid: Uid, start_window: u64) -> Result<(), CommsError>;

    async fn get_start_window(&self) -> Result<Option<u64>, CommsError>;

    /// Most recent checkpoint published to the network, encoded.
    async fn load_checkpoint(&self) -> Result<Option<Vec<u8>>, CommsError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLists {
    pub gather: Vec<Uid>,
    pub eval: Vec<Uid>,
}

#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn peer_lists(&self, window: u64) -> Result<PeerLists, CommsError>;
}

#[async_trait]
pub trait Dataset: Send + Sync {
    /// Tokenized batches for `n_pages` pages starting at `offset`, with the
    /// page choice derived from `seed`.
    async fn batches(&self, offset: u64, n_pages: usize, seed: u64) -> Result<Vec<Batch>, DataError>;
}

/// Supplies a full training state when the node has fallen behind the network.
#[async_trait]
pub trait CatchUpSource: Send + Sync {
    async fn catch_up(
        &self,
        current_window: u64,
        sync_window: u64,
    ) -> Result<Option<CheckpointState>, CommsError>;
}

/// Source that never has anything to offer; the node only ever runs in sync.
pub struct NoCatchUp;

#[async_trait]
impl CatchUpSource for NoCatchUp {
    async fn catch_up(&self, _: u64, _: u64) -> Result<Option<CheckpointState>, CommsError> {
        Ok(None)
    }
}

// ─────────────────────────────────────────────────────────────────
// Payload encoding
// ─────────────────────────────────────────────────────────────────

pub fn encode_payload(payload: &GradientPayload) -> Result<Vec<u8>, CommsError> {
    serde_json::to_vec(payload).map_err(|e| CommsError::Codec(e.to_string()))
}

pub fn decode_payload(bytes: &[u8]) -> Result<GradientPayload, CommsError> {
    serde_json::from_slice(bytes).map_err(|e| CommsError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpl_core::CompressedFragment;

    fn neuron(uid: Uid, hotkey: &str, stake: f64) -> Neuron {
        Neuron {
            uid,
            hotkey: hotkey.to_string(),
            stake,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let reg = RegistrySnapshot {
            neurons: vec![neuron(0, "alice", 5.0), neuron(1, "bob", 50.0), neuron(2, "carol", 50.0)],
        };
        assert_eq!(reg.uid_of("bob"), Some(1));
        assert_eq!(reg.uid_of("mallory"), None);
        assert_eq!(reg.highest_stake_uid(), Some(1));
        assert_eq!(reg.uids(), vec![0, 1, 2]);
        assert_eq!(RegistrySnapshot::default().highest_stake_uid(), None);
    }

    #[test]
    fn test_safe_lock_recovers_poisoned_mutex() {
        let shared = std::sync::Arc::new(Mutex::new(5));
        let inner = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = inner.lock().unwrap();
            panic!("holder died");
        })
        .join();

        assert!(shared.is_poisoned());
        *safe_lock(&shared) += 1;
        assert_eq!(*safe_lock(&shared), 6);
    }

    #[test]
    fn test_payload_codec() {
        let mut payload = GradientPayload::default();
        payload.fragments.insert(
            "w".to_string(),
            CompressedFragment {
                idxs: vec![3],
                vals: vec![0.5],
            },
        );
        payload.global_step = Some(12);
        let bytes = encode_payload(&payload).unwrap();
        assert_eq!(decode_payload(&bytes).unwrap(), payload);
        assert!(matches!(decode_payload(b"{oops"), Err(CommsError::Codec(_))));
    }
}
