//! Passthrough engine. Returns its input unchanged, which makes the whole
//! frame path testable without a model file.

use std::sync::Arc;

use anyhow::Result;
use ndarray::ArrayD;
use tracing::debug;

use crate::engine::{CompiledNetwork, Engine};
use crate::types::WorkerType;

pub struct IdentityEngine {
    network: Arc<CompiledNetwork>,
}

impl IdentityEngine {
    /// The worker type has no effect on a passthrough network.
    pub fn new(network: Arc<CompiledNetwork>, worker: WorkerType) -> Self {
        debug!(?worker, "identity worker");
        Self { network }
    }
}

impl Engine for IdentityEngine {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn infer_array(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if let Some(expected) = &self.network.input_shape {
            anyhow::ensure!(
                input.shape() == expected.as_slice(),
                "Identity: Input-Shape passt nicht. Erwartet {:?}, bekommen {:?}",
                expected,
                input.shape()
            );
        }
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    #[test]
    fn test_passthrough() {
        let mut engine = IdentityEngine::new(CompiledNetwork::identity(None), WorkerType::Gpu);
        let x = Array::from_shape_fn(IxDyn(&[1, 2, 2, 3]), |i| i[3] as f32);
        let y = engine.infer_array(x.clone()).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_pinned_shape() {
        let net = CompiledNetwork::identity(Some(vec![1, 4, 4, 3]));
        let mut engine = IdentityEngine::new(net, WorkerType::Auto);
        assert!(engine
            .infer_array(Array::zeros(IxDyn(&[1, 4, 4, 3])))
            .is_ok());
        let err = engine
            .infer_array(Array::zeros(IxDyn(&[1, 8, 4, 3])))
            .unwrap_err();
        assert!(err.to_string().contains("Input-Shape"));
    }
}
