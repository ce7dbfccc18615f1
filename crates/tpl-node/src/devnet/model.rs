use tpl_core::{Batch, Model, ModelError, ParameterSet, Tensor};

/// Next-token bigram language model: one `[vocab × vocab]` logits matrix,
/// row = current token, column = next token.
#[derive(Debug, Clone)]
pub struct BigramModel {
    vocab: usize,
    params: ParameterSet,
}

impl BigramModel {
    pub const LOGITS: &'static str = "logits";

    /// Zero logits (uniform next-token distribution).
    pub fn new(vocab: usize) -> Self {
        let mut params = ParameterSet::new();
        params.insert(Self::LOGITS.to_string(), Tensor::zeros(&[vocab, vocab]));
        Self { vocab, params }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn logits(&self) -> Result<&Tensor, ModelError> {
        self.params
            .get(Self::LOGITS)
            .ok_or_else(|| ModelError::MissingParameter(Self::LOGITS.to_string()))
    }

    fn pairs(&self, batch: &Batch) -> Result<Vec<(usize, usize)>, ModelError> {
        let mut pairs = Vec::new();
        for seq in batch {
            for w in seq.windows(2) {
                for &token in w {
                    if token as usize >= self.vocab {
                        return Err(ModelError::TokenOutOfRange {
                            token,
                            vocab: self.vocab,
                        });
                    }
                }
                pairs.push((w[0] as usize, w[1] as usize));
            }
        }
        if pairs.is_empty() {
            return Err(ModelError::EmptyBatch);
        }
        Ok(pairs)
    }

    /// Mean cross-entropy gradient with respect to the logits.
    pub fn gradient(&self, batch: &Batch) -> Result<ParameterSet, ModelError> {
        let logits = self.logits()?;
        let pairs = self.pairs(batch)?;
        let v = self.vocab;

        let mut grad = vec![0.0f32; v * v];
        for &(cur, next) in &pairs {
            let row = &logits.data[cur * v..(cur + 1) * v];
            let probs = softmax(row);
            for (j, p) in probs.iter().enumerate() {
                grad[cur * v + j] += p;
            }
            grad[cur * v + next] -= 1.0;
        }
        let n = pairs.len() as f32;
        grad.iter_mut().for_each(|g| *g /= n);

        let mut out = ParameterSet::new();
        out.insert(
            Self::LOGITS.to_string(),
            Tensor {
                shape: vec![v, v],
                data: grad,
            },
        );
        Ok(out)
    }
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn log_softmax_at(row: &[f32], index: usize) -> f32 {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = row.iter().map(|x| (x - max).exp()).sum();
    row[index] - max - sum.ln()
}

impl Model for BigramModel {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn loss(&self, batch: &Batch) -> Result<f32, ModelError> {
        let logits = self.logits()?;
        let pairs = self.pairs(batch)?;
        let v = self.vocab;

        let mut total = 0.0f32;
        for &(cur, next) in &pairs {
            total -= log_softmax_at(&logits.data[cur * v..(cur + 1) * v], next);
        }
        let loss = total / pairs.len() as f32;
        if !loss.is_finite() {
            return Err(ModelError::NonFiniteLoss);
        }
        Ok(loss)
    }
}
