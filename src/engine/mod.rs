//! Inference engine adapter.
//!
//! A [`CompiledNetwork`] is loaded once and shared read-only. The
//! [`InferenceEngine`] owns the one worker built from it and walks the
//! lifecycle `Uninitialized → Ready → Disposed`. Each `execute` returns a
//! [`TensorView`] borrowing the worker's most recent output; the borrow ends
//! before the next `execute` can start.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ndarray::{ArrayD, ArrayViewD};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::tensor::Tensor;
use crate::types::{BackendKind, ModelCfg, ModelLayout, WorkerType};

pub mod identity;
#[cfg(feature = "onnx")]
pub mod onnx;

pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;
    fn infer_array(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>>;
}

/// A model compiled once at startup. Immutable afterwards.
#[derive(Debug)]
pub struct CompiledNetwork {
    pub backend: BackendKind,
    pub layout: ModelLayout,
    pub input_name: String,
    pub output_name: String,
    pub input_shape: Option<Vec<usize>>,
    pub gpu_id: i32,
    /// Serialized model, empty for the identity network.
    pub model_bytes: Vec<u8>,
}

impl CompiledNetwork {
    pub fn load(cfg: &ModelCfg) -> Result<Arc<Self>> {
        let model_bytes = match (cfg.backend, &cfg.model_path) {
            (BackendKind::Identity, _) => Vec::new(),
            (BackendKind::Onnx, Some(path)) => {
                let bytes = std::fs::read(path).with_context(|| {
                    format!("Modell konnte nicht geladen werden: {}", path.display())
                })?;
                anyhow::ensure!(!bytes.is_empty(), "Modell ist leer: {}", path.display());
                bytes
            }
            (BackendKind::Onnx, None) => anyhow::bail!("backend 'onnx' needs a model_path"),
        };

        info!(
            backend = %cfg.backend,
            layout = ?cfg.layout,
            bytes = model_bytes.len(),
            "Netzwerk geladen"
        );

        Ok(Arc::new(Self {
            backend: cfg.backend,
            layout: cfg.layout,
            input_name: cfg.input_name.clone(),
            output_name: cfg.output_name.clone(),
            input_shape: cfg.input_shape.clone(),
            gpu_id: cfg.gpu_id,
            model_bytes,
        }))
    }

    /// Passthrough network, optionally pinned to one input shape.
    pub fn identity(input_shape: Option<Vec<usize>>) -> Arc<Self> {
        Arc::new(Self {
            backend: BackendKind::Identity,
            layout: ModelLayout::Nhwc,
            input_name: "input".into(),
            output_name: "output".into(),
            input_shape,
            gpu_id: 0,
            model_bytes: Vec::new(),
        })
    }
}

pub struct EngineFactory;

impl EngineFactory {
    pub fn create_worker(
        network: &Arc<CompiledNetwork>,
        worker: WorkerType,
    ) -> Result<Box<dyn Engine>> {
        match network.backend {
            BackendKind::Identity => Ok(Box::new(identity::IdentityEngine::new(
                Arc::clone(network),
                worker,
            ))),

            #[cfg(feature = "onnx")]
            BackendKind::Onnx => Ok(Box::new(onnx::OnnxEngine::new(
                Arc::clone(network),
                worker,
            )?)),

            #[cfg(not(feature = "onnx"))]
            BackendKind::Onnx => anyhow::bail!(
                "Backend 'onnx' nicht unterstützt (build mit feature: onnx)"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Disposed,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
    pub executions: u64,
    pub failures: u64,
    pub total_inference_us: u64,
}

/// Borrowed view of the worker's latest output.
///
/// Valid until the next [`InferenceEngine::execute`], which the borrow
/// checker enforces by tying the view to the engine's `&mut` borrow.
pub struct TensorView<'a> {
    view: ArrayViewD<'a, f32>,
}

impl<'a> TensorView<'a> {
    pub fn shape(&self) -> &[usize] {
        self.view.shape()
    }

    pub fn view(&self) -> ArrayViewD<'a, f32> {
        self.view.clone()
    }
}

pub struct InferenceEngine {
    state: EngineState,
    worker: Option<Box<dyn Engine>>,
    output: Option<ArrayD<f32>>,
    stats: EngineStats,
}

impl InferenceEngine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Uninitialized,
            worker: None,
            output: None,
            stats: EngineStats::default(),
        }
    }

    /// Build the worker for `network`. Valid once, from `Uninitialized`.
    pub fn initialize(
        &mut self,
        network: Arc<CompiledNetwork>,
        worker: WorkerType,
    ) -> PipelineResult<()> {
        match self.state {
            EngineState::Uninitialized => {}
            EngineState::Ready => {
                return Err(PipelineError::Inference(
                    "engine is already initialized".into(),
                ))
            }
            EngineState::Disposed => return Err(PipelineError::EngineDisposed),
        }

        let engine = EngineFactory::create_worker(&network, worker)
            .map_err(|e| PipelineError::Inference(format!("{:#}", e)))?;
        info!(engine = engine.name(), ?worker, "Starte Engine");

        self.worker = Some(engine);
        self.state = EngineState::Ready;
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Whether the worker still holds an output buffer.
    pub fn has_resident_output(&self) -> bool {
        self.output.is_some()
    }

    /// Run the network on `input` and borrow the result.
    pub fn execute(&mut self, input: &Tensor) -> PipelineResult<TensorView<'_>> {
        let worker = match self.state {
            EngineState::Uninitialized => return Err(PipelineError::EngineNotReady),
            EngineState::Disposed => return Err(PipelineError::EngineDisposed),
            EngineState::Ready => self.worker.as_mut().ok_or(PipelineError::EngineNotReady)?,
        };

        // The previous output is invalid from here on, whatever happens.
        self.output = None;

        let started = Instant::now();
        let result = worker.infer_array(input.view().to_owned().into_dyn());
        let elapsed = started.elapsed();
        self.stats.executions += 1;
        self.stats.total_inference_us += duration_us(elapsed);

        match result {
            Ok(out) => {
                debug!(shape = ?out.shape(), elapsed_us = duration_us(elapsed), "inference done");
                let out = self.output.insert(out);
                Ok(TensorView { view: out.view() })
            }
            Err(e) => {
                self.stats.failures += 1;
                Err(PipelineError::Inference(format!("{:#}", e)))
            }
        }
    }

    /// Release the worker and its output. Later calls are no-ops.
    pub fn teardown(&mut self) {
        match self.state {
            EngineState::Ready => {
                let name = self.worker.as_ref().map_or("none", |w| w.name());
                self.output = None;
                self.worker = None;
                self.state = EngineState::Disposed;
                info!(engine = name, executions = self.stats.executions, "Engine freigegeben");
            }
            EngineState::Uninitialized => {
                self.state = EngineState::Disposed;
            }
            EngineState::Disposed => {
                debug!("teardown on disposed engine ignored");
            }
        }
    }
}

impl Default for InferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        if self.state == EngineState::Ready {
            warn!("inference engine dropped without teardown");
            self.teardown();
        }
    }
}

fn duration_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
