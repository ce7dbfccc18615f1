use std::sync::Arc;
use tpl_core::{GradientCodec, GradientPayload, Model, TopKCodec, Uid, GRADIENT_KEY};
use tpl_network::{encode_payload, Dataset, ObjectStore};

use super::model::BigramModel;

/// Peer that trains on its own pages and publishes a top-k gradient per window.
pub struct SimulatedMiner {
    uid: Uid,
    model: BigramModel,
    codec: TopKCodec,
    dataset: Arc<dyn Dataset>,
    store: Arc<dyn ObjectStore>,
    pages: usize,
    topk: usize,
    lr: f32,
    step: u64,
}

impl SimulatedMiner {
    pub fn new(
        uid: Uid,
        vocab: usize,
        dataset: Arc<dyn Dataset>,
        store: Arc<dyn ObjectStore>,
        pages: usize,
        topk: usize,
        lr: f32,
    ) -> Self {
        let model = BigramModel::new(vocab);
        let codec = TopKCodec::for_parameters(model.parameters());
        Self {
            uid,
            model,
            codec,
            dataset,
            store,
            pages,
            topk,
            lr,
            step: 0,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Compute, compress and upload this window's gradient, then take a local step.
    pub async fn submit(&mut self, window: u64) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let batches = self
            .dataset
            .batches(window, self.pages, self.uid as u64)
            .await?;

        let mut payload = GradientPayload {
            global_step: Some(self.step),
            ..GradientPayload::default()
        };
        let mut grads = Vec::new();
        for batch in &batches {
            grads.push(self.model.gradient(batch)?);
        }
        let Some(first) = grads.first() else {
            return Err(format!("no batches for window {}", window).into());
        };

        for name in first.keys() {
            let mut mean = first[name].zeros_like();
            for g in &grads {
                mean.sub_scaled(&g[name], -1.0 / grads.len() as f32)?;
            }
            let fragment = self.codec.compress(name, &mean, self.topk)?;
            if let Some(param) = self.model.parameters_mut().get_mut(name) {
                param.sub_scaled(&mean.sign(), self.lr)?;
            }
            payload.fragments.insert(name.clone(), fragment);
        }

        let bytes = encode_payload(&payload)?;
        self.store
            .put(bytes, self.uid, window, GRADIENT_KEY, self.step)
            .await?;
        self.step += 1;
        log::debug!("Miner {} submitted gradient for window {}", self.uid, window);
        Ok(())
    }
}
