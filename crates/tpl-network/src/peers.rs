use tpl_core::Uid;

use crate::{CommsError, PeerDirectory, PeerLists};

/// Result of one per-window refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    pub gather: Vec<Uid>,
    pub eval: Vec<Uid>,
    /// In the previous eval list but not the current one
    pub newly_inactive: Vec<Uid>,
}

/// Tracks gather/eval peer lists across windows.
#[derive(Debug, Clone)]
pub struct PeerSetManager {
    own_uid: Uid,
    pinned_gather: Option<Vec<Uid>>,
    gather: Vec<Uid>,
    eval: Vec<Uid>,
}

impl PeerSetManager {
    /// `pinned_gather` replaces whatever gather list the directory returns.
    pub fn new(own_uid: Uid, pinned_gather: Option<Vec<Uid>>) -> Self {
        Self {
            own_uid,
            pinned_gather,
            gather: Vec::new(),
            eval: Vec::new(),
        }
    }

    pub fn eval_peers(&self) -> &[Uid] {
        &self.eval
    }

    pub async fn refresh(&mut self, directory: &dyn PeerDirectory, window: u64) -> PeerUpdate {
        let lists = directory.peer_lists(window).await;
        self.apply(lists)
    }

    /// Fold a directory response into the tracked lists.
    /// On failure the previous lists are kept and nobody is reported inactive.
    pub fn apply(&mut self, lists: Result<PeerLists, CommsError>) -> PeerUpdate {
        let lists = match lists {
            Ok(lists) => lists,
            Err(e) => {
                log::warn!("Peer directory unavailable, keeping previous peer lists: {}", e);
                return PeerUpdate {
                    gather: self.gather.clone(),
                    eval: self.eval.clone(),
                    newly_inactive: Vec::new(),
                };
            }
        };

        let mut gather = match &self.pinned_gather {
            Some(pinned) => pinned.clone(),
            None => lists.gather,
        };
        if !gather.contains(&self.own_uid) {
            gather.push(self.own_uid);
        }

        let newly_inactive: Vec<Uid> = self
            .eval
            .iter()
            .copied()
            .filter(|uid| !lists.eval.contains(uid))
            .collect();

        self.gather = gather;
        self.eval = lists.eval;

        PeerUpdate {
            gather: self.gather.clone(),
            eval: self.eval.clone(),
            newly_inactive,
        }
    }
}
