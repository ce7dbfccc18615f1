// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - COMPRESSED GRADIENT WIRE FORMAT
//
// Per parameter a peer publishes two index-addressed arrays: the top-k
// indices of its (transformed) gradient and the matching values. Shape
// metadata (`xshape`, `totalk`) is fixed once per parameter at startup and
// every decode is checked against it.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::tensor::{ParameterSet, Tensor};
use crate::Uid;

/// One parameter's sparse contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedFragment {
    pub idxs: Vec<i64>,
    pub vals: Vec<f32>,
}

/// A single peer's gradient submission for one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradientPayload {
    /// parameter name → fragment; parameters the peer did not send are absent
    pub fragments: BTreeMap<String, CompressedFragment>,
    /// Sender's global step when the payload was produced
    #[serde(default)]
    pub global_step: Option<u64>,
}

impl GradientPayload {
    pub fn fragment(&self, name: &str) -> Option<&CompressedFragment> {
        self.fragments.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Aggregate of every gather peer's submission for one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatherResult {
    /// parameter name → fragments from every contributing peer
    pub fragments: BTreeMap<String, Vec<CompressedFragment>>,
    /// Peers whose payload made it into the aggregate
    pub uids: Vec<Uid>,
    /// Peers that were asked but contributed nothing (absent / timed out)
    pub skipped_uids: Vec<Uid>,
}

impl GatherResult {
    /// Fold per-peer responses into one aggregate.
    ///
    /// Returns `None` when no peer contributed anything, so callers never have
    /// to inspect an empty aggregate.
    pub fn from_responses<I>(responses: I) -> Option<Self>
    where
        I: IntoIterator<Item = (Uid, Option<GradientPayload>)>,
    {
        let mut result = GatherResult::default();
        for (uid, payload) in responses {
            match payload {
                Some(p) if !p.is_empty() => {
                    for (name, fragment) in p.fragments {
                        result.fragments.entry(name).or_default().push(fragment);
                    }
                    result.uids.push(uid);
                }
                _ => result.skipped_uids.push(uid),
            }
        }
        if result.uids.is_empty() {
            None
        } else {
            Some(result)
        }
    }

    pub fn fragments_for(&self, name: &str) -> Option<&[CompressedFragment]> {
        self.fragments.get(name).map(|v| v.as_slice())
    }
}

/// Shape metadata fixed per parameter at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMeta {
    /// Shape of the dense tensor a decode produces
    pub xshape: Vec<usize>,
    /// Number of addressable entries (indices must be < totalk)
    pub totalk: usize,
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("no shape metadata registered for parameter {0}")]
    UnknownParameter(String),
    #[error("parameter {name}: {idxs} indices but {vals} values")]
    LengthMismatch {
        name: String,
        idxs: usize,
        vals: usize,
    },
    #[error("parameter {name}: index {index} outside 0..{totalk}")]
    IndexOutOfRange {
        name: String,
        index: i64,
        totalk: usize,
    },
    #[error("parameter {name}: decoded {actual} elements, parameter holds {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("parameter {0}: no fragments to decode")]
    Empty(String),
    #[error("parameter {name}: non-finite value at position {position}")]
    NonFinite { name: String, position: usize },
}

/// Seam to the external compression codec (transform + top-k).
pub trait GradientCodec: Send + Sync {
    /// Metadata registered for `name`, if any
    fn meta(&self, name: &str) -> Option<&ParameterMeta>;

    /// Sum-decode a list of fragments into one dense tensor shaped `xshape`.
    fn batch_decode(
        &self,
        name: &str,
        fragments: &[CompressedFragment],
    ) -> Result<Tensor, DecodeError>;

    /// Sparsify a dense tensor to its `topk` largest-magnitude entries.
    fn compress(
        &self,
        name: &str,
        dense: &Tensor,
        topk: usize,
    ) -> Result<CompressedFragment, DecodeError>;

    fn decode(&self, name: &str, fragment: &CompressedFragment) -> Result<Tensor, DecodeError> {
        self.batch_decode(name, std::slice::from_ref(fragment))
    }
}

/// Identity-transform top-k codec: indices address the flattened parameter.
#[derive(Debug, Clone, Default)]
pub struct TopKCodec {
    metas: BTreeMap<String, ParameterMeta>,
}

impl TopKCodec {
    /// Register `xshape` / `totalk` for every parameter of a model.
    pub fn for_parameters(params: &ParameterSet) -> Self {
        let metas = params
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    ParameterMeta {
                        xshape: t.shape.clone(),
                        totalk: t.numel(),
                    },
                )
            })
            .collect();
        Self { metas }
    }

    pub fn metas(&self) -> &BTreeMap<String, ParameterMeta> {
        &self.metas
    }

    fn validate(
        name: &str,
        meta: &ParameterMeta,
        fragment: &CompressedFragment,
    ) -> Result<(), DecodeError> {
        if fragment.idxs.len() != fragment.vals.len() {
            return Err(DecodeError::LengthMismatch {
                name: name.to_string(),
                idxs: fragment.idxs.len(),
                vals: fragment.vals.len(),
            });
        }
        for &index in &fragment.idxs {
            if index < 0 || index as usize >= meta.totalk {
                return Err(DecodeError::IndexOutOfRange {
                    name: name.to_string(),
                    index,
                    totalk: meta.totalk,
                });
            }
        }
        if let Some(position) = fragment.vals.iter().position(|v| !v.is_finite()) {
            return Err(DecodeError::NonFinite {
                name: name.to_string(),
                position,
            });
        }
        Ok(())
    }
}

impl GradientCodec for TopKCodec {
    fn meta(&self, name: &str) -> Option<&ParameterMeta> {
        self.metas.get(name)
    }

    fn batch_decode(
        &self,
        name: &str,
        fragments: &[CompressedFragment],
    ) -> Result<Tensor, DecodeError> {
        let meta = self
            .metas
            .get(name)
            .ok_or_else(|| DecodeError::UnknownParameter(name.to_string()))?;
        if fragments.is_empty() {
            return Err(DecodeError::Empty(name.to_string()));
        }

        let mut dense = vec![0.0f32; meta.totalk];
        for fragment in fragments {
            Self::validate(name, meta, fragment)?;
            for (&i, &v) in fragment.idxs.iter().zip(fragment.vals.iter()) {
                dense[i as usize] += v;
            }
        }

        let expected: usize = meta.xshape.iter().product();
        if expected != meta.totalk {
            return Err(DecodeError::ShapeMismatch {
                name: name.to_string(),
                expected,
                actual: meta.totalk,
            });
        }
        Ok(Tensor {
            shape: meta.xshape.clone(),
            data: dense,
        })
    }

    fn compress(
        &self,
        name: &str,
        dense: &Tensor,
        topk: usize,
    ) -> Result<CompressedFragment, DecodeError> {
        let meta = self
            .metas
            .get(name)
            .ok_or_else(|| DecodeError::UnknownParameter(name.to_string()))?;
        if dense.numel() != meta.totalk {
            return Err(DecodeError::ShapeMismatch {
                name: name.to_string(),
                expected: meta.totalk,
                actual: dense.numel(),
            });
        }

        let mut order: Vec<usize> = (0..dense.numel()).collect();
        order.sort_by(|&a, &b| {
            dense.data[b]
                .abs()
                .partial_cmp(&dense.data[a].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        order.truncate(topk.min(dense.numel()));
        order.sort_unstable();

        Ok(CompressedFragment {
            idxs: order.iter().map(|&i| i as i64).collect(),
            vals: order.iter().map(|&i| dense.data[i]).collect(),
        })
    }
}
