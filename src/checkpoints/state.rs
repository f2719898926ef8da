//! Model state containers exchanged between the model, the optimizer
//! factory and the checkpoint slot.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// One named parameter tensor, flattened in C order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl TensorData {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            bail!(
                "tensor shape {:?} wants {} values, got {}",
                shape,
                expected,
                data.len()
            );
        }
        Ok(Self { data, shape })
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }
}

/// Parameter-only snapshot of a model. Ordered by name so serialized
/// checkpoints are byte-stable across runs.
pub type ModelState = BTreeMap<String, TensorData>;

/// Total parameter count across a state dict.
pub fn num_parameters(state: &ModelState) -> usize {
    state.values().map(TensorData::num_elements).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_shape_must_match_payload() {
        assert!(TensorData::new(vec![1.0, 2.0], vec![2]).is_ok());
        assert!(TensorData::new(vec![1.0, 2.0], vec![3]).is_err());
    }

    #[test]
    fn counts_parameters_across_tensors() {
        let mut state = ModelState::new();
        state.insert(
            "a".into(),
            TensorData::new(vec![0.0; 6], vec![2, 3]).unwrap(),
        );
        state.insert("b".into(), TensorData::new(vec![0.0; 4], vec![4]).unwrap());
        assert_eq!(num_parameters(&state), 10);
    }
}
