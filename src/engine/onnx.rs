//! ONNX Runtime Engine (CPU/GPU via CUDA) für `ort = 2.0.0-rc.10`
//!
//! - Die Session wird aus den bereits geladenen Modell-Bytes gebaut.
//! - `WorkerType::Gpu` registriert CUDA (Feature `onnx-cuda`), sonst CPU
//!   mit Warnung.
//! - NCHW-Modelle bekommen den NHWC-Tensor transponiert und liefern ihn
//!   transponiert zurück.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use ndarray::{ArrayD, IxDyn};
use ort::{
    execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch},
    session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session},
    value::{DynValue, Tensor},
};
use tracing::{info, warn};

use crate::engine::{CompiledNetwork, Engine};
use crate::types::{ModelLayout, WorkerType};

pub struct OnnxEngine {
    session: Mutex<Session>,
    network: Arc<CompiledNetwork>,
}

impl OnnxEngine {
    pub fn new(network: Arc<CompiledNetwork>, worker: WorkerType) -> Result<Self> {
        let mut builder = SessionBuilder::new()
            .with_context(|| "Fehler beim Erstellen des SessionBuilder")?;
        builder = builder.with_optimization_level(GraphOptimizationLevel::Level3)?;

        match worker {
            WorkerType::Cpu => {
                let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
                builder = builder
                    .with_intra_threads(threads)?
                    .with_execution_providers(vec![CPUExecutionProvider::default().build()])?;
            }
            WorkerType::Gpu => match gpu_providers(network.gpu_id) {
                Some(eps) => builder = builder.with_execution_providers(eps)?,
                None => {
                    warn!("GPU-Worker angefordert, aber ohne CUDA gebaut; nutze CPU");
                    builder = builder
                        .with_execution_providers(vec![CPUExecutionProvider::default().build()])?;
                }
            },
            WorkerType::Auto => {
                if let Some(eps) = gpu_providers(network.gpu_id) {
                    builder = builder.with_execution_providers(eps)?;
                }
            }
        }

        let session = builder
            .commit_from_memory(&network.model_bytes)
            .with_context(|| "ONNX-Modell konnte nicht kompiliert werden")?;
        info!(?worker, layout = ?network.layout, "ONNX-Session bereit");

        Ok(Self {
            session: Mutex::new(session),
            network,
        })
    }
}

#[cfg(feature = "onnx-cuda")]
fn gpu_providers(gpu_id: i32) -> Option<Vec<ExecutionProviderDispatch>> {
    Some(vec![
        ort::execution_providers::CUDAExecutionProvider::default()
            .with_device_id(gpu_id)
            .build(),
        CPUExecutionProvider::default().build(),
    ])
}

#[cfg(not(feature = "onnx-cuda"))]
fn gpu_providers(_gpu_id: i32) -> Option<Vec<ExecutionProviderDispatch>> {
    None
}

impl Engine for OnnxEngine {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn infer_array(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let net = &self.network;
        if let Some(expected) = &net.input_shape {
            anyhow::ensure!(
                input.shape() == expected.as_slice(),
                "ONNX: Input-Shape passt nicht. Erwartet {:?}, bekommen {:?}",
                expected,
                input.shape()
            );
        }

        let input = match net.layout {
            ModelLayout::Nhwc => input,
            ModelLayout::Nchw => input
                .permuted_axes(IxDyn(&[0, 3, 1, 2]))
                .as_standard_layout()
                .into_owned(),
        };

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("ONNX: Session-Lock vergiftet"))?;

        let input_tensor: Tensor<f32> = Tensor::from_array(input)?;
        let outputs = session.run(ort::inputs![
            net.input_name.as_str() => input_tensor
        ])?;

        let dyn_out: &DynValue = &outputs[net.output_name.as_str()];
        let out_view = dyn_out
            .try_extract_array::<f32>()
            .map_err(|_| anyhow::anyhow!("ONNX: Output ist kein Tensor<f32>"))?;
        anyhow::ensure!(
            out_view.ndim() == 4,
            "ONNX: Output muss Rang 4 haben, bekommen {:?}",
            out_view.shape()
        );

        let out = match net.layout {
            ModelLayout::Nhwc => out_view.to_owned(),
            ModelLayout::Nchw => out_view
                .permuted_axes(IxDyn(&[0, 2, 3, 1]))
                .as_standard_layout()
                .into_owned(),
        };
        Ok(out)
    }
}
