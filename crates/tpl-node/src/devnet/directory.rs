use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tpl_core::Uid;
use tpl_network::{safe_lock, CommsError, PeerDirectory, PeerLists};

/// Peer lists set by hand; can be switched offline to exercise fallbacks.
#[derive(Default)]
pub struct StaticPeerDirectory {
    lists: Mutex<PeerLists>,
    unavailable: AtomicBool,
}

impl StaticPeerDirectory {
    pub fn new(gather: Vec<Uid>, eval: Vec<Uid>) -> Self {
        Self {
            lists: Mutex::new(PeerLists { gather, eval }),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_lists(&self, gather: Vec<Uid>, eval: Vec<Uid>) {
        *safe_lock(&self.lists) = PeerLists { gather, eval };
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    async fn peer_lists(&self, _window: u64) -> Result<PeerLists, CommsError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CommsError::Transport("peer directory offline".to_string()));
        }
        Ok(safe_lock(&self.lists).clone())
    }
}
