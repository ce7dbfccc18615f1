use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tpl_core::Uid;
use tpl_network::{
    safe_lock, BlockSource, BlockStream, Chain, ChainError, Neuron, RegistrySnapshot,
};

#[derive(Debug, Clone, PartialEq)]
pub struct WeightSubmission {
    pub block: u64,
    pub uids: Vec<Uid>,
    pub weights: Vec<f64>,
}

/// In-process chain: a registry, a block height and a log of weight submissions.
pub struct SimulatedChain {
    registry: Mutex<RegistrySnapshot>,
    head: watch::Sender<u64>,
    submissions: Mutex<Vec<WeightSubmission>>,
}

impl SimulatedChain {
    pub fn new(neurons: Vec<Neuron>, start_block: u64) -> Self {
        let (head, _) = watch::channel(start_block);
        Self {
            registry: Mutex::new(RegistrySnapshot { neurons }),
            head,
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, neuron: Neuron) {
        let mut registry = safe_lock(&self.registry);
        registry.neurons.retain(|n| n.uid != neuron.uid);
        registry.neurons.push(neuron);
        registry.neurons.sort_by_key(|n| n.uid);
    }

    pub fn block(&self) -> u64 {
        *self.head.borrow()
    }

    pub fn advance(&self, blocks: u64) -> u64 {
        let mut block = 0;
        self.head.send_modify(|b| {
            *b += blocks;
            block = *b;
        });
        block
    }

    pub fn submissions(&self) -> Vec<WeightSubmission> {
        safe_lock(&self.submissions).clone()
    }

    /// Produce one block every `block_time` until the handle is aborted.
    pub fn spawn_producer(self: &Arc<Self>, block_time: Duration) -> JoinHandle<()> {
        let chain = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(block_time);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let block = chain.advance(1);
                log::trace!("Produced block {}", block);
            }
        })
    }
}

#[async_trait]
impl Chain for SimulatedChain {
    async fn registry(&self) -> Result<RegistrySnapshot, ChainError> {
        Ok(safe_lock(&self.registry).clone())
    }

    async fn set_weights(&self, uids: &[Uid], weights: &[f64]) -> Result<(), ChainError> {
        if uids.len() != weights.len() {
            return Err(ChainError::Rpc(format!(
                "{} uids but {} weights",
                uids.len(),
                weights.len()
            )));
        }
        let submission = WeightSubmission {
            block: self.block(),
            uids: uids.to_vec(),
            weights: weights.to_vec(),
        };
        safe_lock(&self.submissions).push(submission);
        Ok(())
    }
}

#[async_trait]
impl BlockSource for SimulatedChain {
    async fn subscribe(&self) -> Result<BlockStream, ChainError> {
        let rx = self.head.subscribe();
        let stream = futures::stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let block = *rx.borrow_and_update();
            Some((Ok::<u64, ChainError>(block), (rx, false)))
        });
        Ok(Box::pin(stream))
    }
}
