// ─────────────────────────────────────────────────────────────────
// Window clock
// ─────────────────────────────────────────────────────────────────
// Background task folding block heights into (block, window).
// Both values are published together under one lock and read back
// as a copied snapshot. The window never moves backwards.
// ─────────────────────────────────────────────────────────────────

use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tpl_core::window_for_block;

use crate::{safe_lock, BlockSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowState {
    pub block: u64,
    pub window: u64,
}

#[derive(Debug, Clone)]
pub struct WindowClock {
    state: Arc<Mutex<WindowState>>,
    blocks_per_window: u64,
}

impl WindowClock {
    pub fn new(blocks_per_window: u64, initial_block: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(WindowState {
                block: initial_block,
                window: window_for_block(initial_block, blocks_per_window),
            })),
            blocks_per_window,
        }
    }

    pub fn snapshot(&self) -> WindowState {
        *safe_lock(&self.state)
    }

    pub fn current_window(&self) -> u64 {
        self.snapshot().window
    }

    /// Fold one header into the state. Returns true when the window advanced.
    pub fn observe(&self, block: u64) -> bool {
        let new_window = window_for_block(block, self.blocks_per_window);
        let mut state = safe_lock(&self.state);
        if block > state.block {
            state.block = block;
        }
        if new_window > state.window {
            state.window = new_window;
            return true;
        }
        false
    }

    /// Follow `source` forever on a tokio task. Subscription errors and
    /// stream ends are retried after `retry_delay`.
    pub fn spawn(&self, source: Arc<dyn BlockSource>, retry_delay: Duration) -> JoinHandle<()> {
        let clock = self.clone();
        tokio::spawn(async move {
            loop {
                match source.subscribe().await {
                    Ok(mut stream) => {
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(block) => {
                                    if clock.observe(block) {
                                        log::debug!(
                                            "Block {} opens window {}",
                                            block,
                                            clock.current_window()
                                        );
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Block stream error: {}", e);
                                    break;
                                }
                            }
                        }
                        log::warn!("Block stream ended, resubscribing");
                    }
                    Err(e) => log::warn!("Block subscription failed: {}", e),
                }
                tokio::time::sleep(retry_delay).await;
            }
        })
    }
}
