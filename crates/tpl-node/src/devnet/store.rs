use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tpl_consensus::{CheckpointState, CheckpointStore};
use tpl_core::{Uid, CHECKPOINT_KEY};
use tpl_network::{CatchUpSource, CommsError, ObjectStore};

const START_WINDOW_KEY: &[u8] = b"start_window";

fn transport<E: std::fmt::Display>(e: E) -> CommsError {
    CommsError::Transport(e.to_string())
}

fn object_key(uid: Uid, window: u64, key: &str) -> String {
    format!("{}/{:020}/{:05}", key, window, uid)
}

/// Local object store shared by every devnet participant.
///
/// Blobs live in the `objects` tree keyed by `key/window/uid`. Checkpoints are
/// also indexed by global step in a `CheckpointStore` on the same database.
#[derive(Clone)]
pub struct SledObjectStore {
    objects: sled::Tree,
    meta: sled::Tree,
    checkpoints: CheckpointStore,
}

impl SledObjectStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let db = sled::open(path)?;
        Ok(Self {
            objects: db.open_tree("objects")?,
            meta: db.open_tree("meta")?,
            checkpoints: CheckpointStore::with_db(db),
        })
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Drop blobs of every window below `min_window`. Returns how many went.
    pub fn prune_before(&self, min_window: u64) -> Result<usize, CommsError> {
        let mut removed = 0;
        for item in self.objects.iter() {
            let (key, _) = item.map_err(transport)?;
            let window = String::from_utf8_lossy(&key)
                .split('/')
                .nth(1)
                .and_then(|w| w.parse::<u64>().ok());
            if window.is_some_and(|w| w < min_window) {
                self.objects.remove(&key).map_err(transport)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Keep only the newest `keep_last` entries of the checkpoint index.
    pub fn prune_checkpoints(&self, keep_last: usize) -> Result<usize, CommsError> {
        self.checkpoints.prune(keep_last).map_err(transport)
    }

    fn read(&self, uid: Uid, window: u64, key: &str) -> Result<Option<Vec<u8>>, CommsError> {
        Ok(self
            .objects
            .get(object_key(uid, window, key).as_bytes())
            .map_err(transport)?
            .map(|v| v.to_vec()))
    }
}

#[async_trait]
impl ObjectStore for SledObjectStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        uid: Uid,
        window: u64,
        key: &str,
        global_step: u64,
    ) -> Result<(), CommsError> {
        if key == CHECKPOINT_KEY {
            let id = self
                .checkpoints
                .store_bytes(&bytes)
                .map_err(|e| CommsError::Codec(e.to_string()))?;
            log::debug!("Checkpoint {} indexed at global step {}", id, global_step);
        }
        self.objects
            .insert(object_key(uid, window, key).as_bytes(), bytes)
            .map_err(transport)?;
        log::trace!("Stored {} for uid {} window {}", key, uid, window);
        Ok(())
    }

    async fn get(
        &self,
        uid: Uid,
        window: u64,
        key: &str,
        _timeout: Duration,
    ) -> Result<Option<Vec<u8>>, CommsError> {
        self.read(uid, window, key)
    }

    async fn gather(
        &self,
        uids: &[Uid],
        window: u64,
        key: &str,
        _timeout: Duration,
    ) -> Result<Vec<(Uid, Option<Vec<u8>>)>, CommsError> {
        let mut out = Vec::with_capacity(uids.len());
        for &uid in uids {
            let bytes = match self.read(uid, window, key) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("Gather read for uid {} failed: {}", uid, e);
                    None
                }
            };
            out.push((uid, bytes));
        }
        Ok(out)
    }

    async fn post_start_window(&self, uid: Uid, start_window: u64) -> Result<(), CommsError> {
        self.meta
            .insert(START_WINDOW_KEY, start_window.to_le_bytes().to_vec())
            .map_err(transport)?;
        log::info!("Uid {} posted start window {}", uid, start_window);
        Ok(())
    }

    async fn get_start_window(&self) -> Result<Option<u64>, CommsError> {
        let raw = self.meta.get(START_WINDOW_KEY).map_err(transport)?;
        match raw {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| CommsError::Codec("start window is not 8 bytes".to_string()))?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    async fn load_checkpoint(&self) -> Result<Option<Vec<u8>>, CommsError> {
        self.checkpoints.latest_bytes().map_err(transport)
    }
}

/// Offers the newest stored checkpoint once the node trails the chain by more
/// than `max_lag` windows.
pub struct CheckpointCatchUp {
    store: SledObjectStore,
    max_lag: u64,
}

impl CheckpointCatchUp {
    pub fn new(store: SledObjectStore, max_lag: u64) -> Self {
        Self { store, max_lag }
    }

    fn newer_than(&self, sync_window: u64) -> Result<Option<CheckpointState>, CommsError> {
        let latest = self.store.checkpoints().latest().map_err(transport)?;
        Ok(latest.filter(|cp| cp.current_window > sync_window))
    }
}

#[async_trait]
impl CatchUpSource for CheckpointCatchUp {
    async fn catch_up(
        &self,
        current_window: u64,
        sync_window: u64,
    ) -> Result<Option<CheckpointState>, CommsError> {
        if current_window.saturating_sub(sync_window) <= self.max_lag {
            return Ok(None);
        }
        log::info!(
            "Sync window {} trails current window {}, looking for a checkpoint",
            sync_window,
            current_window
        );
        self.newer_than(sync_window)
    }
}
