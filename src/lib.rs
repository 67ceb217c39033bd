//! Real-time style-transfer frame pipeline.
//!
//! Per tick a captured frame is preprocessed on the GPU, run through a
//! neural network, postprocessed on the GPU and presented.
//! See [`orchestrator::FrameOrchestrator`] for the frame path and
//! [`start_runtime`] for the ready-made driver.

pub mod capture;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod image;
pub mod orchestrator;
pub mod pipeline;
pub mod resources;
pub mod tensor;
pub mod types;
pub mod worker;

pub use error::{PipelineError, PipelineResult};
pub use orchestrator::{FrameOrchestrator, TickReport, TickStats};
pub use types::Config;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::capture::{LoggingPresenter, SyntheticSource};
use crate::gpu::host::HostDevice;
use crate::gpu::wgpu_device::WgpuDevice;
use crate::gpu::ComputeDevice;
use crate::types::ComputeBackend;

/// Startet die Runtime (kannst du von main.rs aus aufrufen)
pub async fn start_runtime(config_path: &Path) -> Result<TickStats> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::load(config_path)?;
    info!(
        "Starte Runtime: backend={}, frame={}x{}, device={:?}, dispatch={:?}",
        cfg.model.backend, cfg.frame.width, cfg.frame.height, cfg.compute.device, cfg.compute.dispatch
    );

    match cfg.compute.device {
        ComputeBackend::Host => run_on(Arc::new(HostDevice::new()), &cfg).await,
        ComputeBackend::Wgpu => {
            let shader = match &cfg.compute.shader_path {
                Some(path) => Some(std::fs::read_to_string(path).with_context(|| {
                    format!("Shader konnte nicht gelesen werden: {}", path.display())
                })?),
                None => None,
            };
            match WgpuDevice::new(shader.as_deref()) {
                Ok(device) => {
                    info!(adapter = device.adapter_name(), "wgpu-Device bereit");
                    run_on(Arc::new(device), &cfg).await
                }
                Err(e) => {
                    warn!(error = %e, "kein wgpu-Adapter, nutze Host-Device");
                    run_on(Arc::new(HostDevice::new()), &cfg).await
                }
            }
        }
    }
}

async fn run_on<D: ComputeDevice>(device: Arc<D>, cfg: &Config) -> Result<TickStats> {
    let (w, h) = (cfg.frame.width, cfg.frame.height);
    let mut source = SyntheticSource::new(device.as_ref(), cfg.runtime.source, w, h)?;
    let mut presenter = LoggingPresenter::new(device.as_ref(), w, h, cfg.runtime.report_json)?;
    let orchestrator = FrameOrchestrator::initialize(Arc::clone(&device), cfg)?;

    let stats = worker::run_frame_loop(orchestrator, &mut source, &mut presenter, &cfg.runtime).await?;
    let resources = device.tracker().snapshot();
    info!(
        ticks = stats.ticks,
        presented = stats.presented,
        dropped = stats.dropped,
        peak_bytes = resources.peak_bytes,
        "Runtime beendet"
    );
    Ok(stats)
}
