// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - DENSE TENSORS
//
// Minimal row-major f32 tensor used for model parameters, decoded gradients
// and momentum snapshots. Heavy math lives in the model backend; the
// validator only needs sign, scaled subtraction and shape bookkeeping.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named parameters of a model, iterated in deterministic (sorted) order.
pub type ParameterSet = BTreeMap<String, Tensor>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; numel],
        }
    }

    /// Build a tensor, rejecting data whose length disagrees with the shape.
    pub fn from_vec(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, String> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                numel,
                data.len()
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(&self.shape)
    }

    /// Elementwise sign with sign(0) = 0 (f32::signum maps +0.0 to 1.0).
    pub fn sign(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| sign_of(v)).collect(),
        }
    }

    /// `self -= alpha * other`
    pub fn sub_scaled(&mut self, other: &Tensor, alpha: f32) -> Result<(), String> {
        if self.data.len() != other.data.len() {
            return Err(format!(
                "cannot subtract tensor of {} elements from tensor of {}",
                other.data.len(),
                self.data.len()
            ));
        }
        for (p, g) in self.data.iter_mut().zip(other.data.iter()) {
            *p -= alpha * g;
        }
        Ok(())
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

fn sign_of(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Zero tensors with the same names and shapes as `params`.
pub fn zeros_like(params: &ParameterSet) -> ParameterSet {
    params
        .iter()
        .map(|(name, t)| (name.clone(), t.zeros_like()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_keeps_zero() {
        let t = Tensor::from_vec(vec![4], vec![-2.5, 0.0, 3.0, -0.0]).unwrap();
        assert_eq!(t.sign().data, vec![-1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_sub_scaled() {
        let mut p = Tensor::from_vec(vec![2], vec![1.0, 1.0]).unwrap();
        let g = Tensor::from_vec(vec![2], vec![1.0, -1.0]).unwrap();
        p.sub_scaled(&g, 0.5).unwrap();
        assert_eq!(p.data, vec![0.5, 1.5]);
    }

    #[test]
    fn test_sub_scaled_rejects_length_mismatch() {
        let mut p = Tensor::zeros(&[3]);
        let g = Tensor::zeros(&[2]);
        assert!(p.sub_scaled(&g, 1.0).is_err());
    }

    #[test]
    fn test_from_vec_validates_shape() {
        assert!(Tensor::from_vec(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(Tensor::from_vec(vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_zeros_like_set() {
        let mut params = ParameterSet::new();
        params.insert("w".to_string(), Tensor::from_vec(vec![2], vec![3.0, 4.0]).unwrap());
        let z = zeros_like(&params);
        assert_eq!(z["w"].shape, vec![2]);
        assert!(z["w"].data.iter().all(|v| *v == 0.0));
    }
}
