//! Frame orchestrator.
//!
//! One tick runs capture → preprocess → tensorize → infer → detensorize →
//! postprocess → present. Every transient frame and tensor is owned by the
//! tick and dropped before it returns. A failed tick presents nothing.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::engine::{CompiledNetwork, InferenceEngine};
use crate::error::{DimensionAlignmentWarning, PipelineError, PipelineResult};
use crate::gpu::{ComputeDevice, FrameHandle};
use crate::image::{blit, to_cpu_image, PixelFormat};
use crate::pipeline::{DispatchRounding, Pipeline};
use crate::tensor::{image_to_tensor, tensor_to_image};
use crate::types::{Config, WorkerType};

/// Wall time per stage, in microseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    pub capture_us: u64,
    pub preprocess_us: u64,
    pub inference_us: u64,
    pub postprocess_us: u64,
    pub present_us: u64,
    pub total_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub timings: StageTimings,
    pub warnings: Vec<DimensionAlignmentWarning>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickStats {
    pub ticks: u64,
    pub presented: u64,
    pub dropped: u64,
    pub consecutive_failures: u64,
}

pub struct FrameOrchestrator<D: ComputeDevice> {
    stage: Pipeline<D>,
    engine: InferenceEngine,
    stats: TickStats,
}

impl<D: ComputeDevice> FrameOrchestrator<D> {
    /// Load and compile the configured network, create its worker and bind
    /// the compute stage to `device`.
    pub fn initialize(device: Arc<D>, config: &Config) -> anyhow::Result<Self> {
        let network = CompiledNetwork::load(&config.model)
            .with_context(|| format!("Backend {} konnte nicht geladen werden", config.model.backend))?;
        let orchestrator =
            Self::with_network(device, network, config.model.worker, config.compute.dispatch)?;
        Ok(orchestrator)
    }

    pub fn with_network(
        device: Arc<D>,
        network: Arc<CompiledNetwork>,
        worker: WorkerType,
        rounding: DispatchRounding,
    ) -> PipelineResult<Self> {
        let mut engine = InferenceEngine::new();
        engine.initialize(network, worker)?;
        info!(device = device.name(), ?rounding, "Orchestrator bereit");
        Ok(Self {
            stage: Pipeline::new(device, rounding),
            engine,
            stats: TickStats::default(),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        self.stage.device()
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    /// Runs one frame through the whole pipeline.
    ///
    /// Captures `source` as SDR, preprocesses it, runs the network,
    /// postprocesses the result and blits it into `destination`. All
    /// transient frames and tensors are released before returning.
    ///
    /// # Arguments
    ///
    /// * `source` - Rgba8 frame filled by the capture collaborator
    /// * `destination` - Frame that receives the styled image; keeps its own
    ///   dimensions and format
    ///
    /// # Returns
    ///
    /// * `Ok(report)` - Frame presented, with per-stage timings and alignment warnings
    /// * `Err(e)` - Frame dropped, `destination` untouched. If
    ///   [`PipelineError::is_fatal`] holds the caller must stop ticking.
    pub fn run_tick(&mut self, source: &D::Frame, destination: &D::Frame) -> PipelineResult<TickReport> {
        self.stats.ticks += 1;
        let tick = self.stats.ticks;

        match self.process(tick, source, destination) {
            Ok(report) => {
                self.stats.presented += 1;
                self.stats.consecutive_failures = 0;
                debug!(
                    tick,
                    total_us = report.timings.total_us,
                    inference_us = report.timings.inference_us,
                    "frame presented"
                );
                Ok(report)
            }
            Err(e) => {
                self.count_dropped(tick, "pipeline", &e);
                Err(e)
            }
        }
    }

    /// Count a tick that failed before reaching the pipeline (capture).
    pub fn record_dropped(&mut self, error: &PipelineError) {
        self.stats.ticks += 1;
        self.count_dropped(self.stats.ticks, "capture", error);
    }

    /// Reclassify the tick of `report` as dropped after its presentation
    /// failed.
    pub fn record_present_failure(&mut self, report: &TickReport, error: &PipelineError) {
        self.stats.presented = self.stats.presented.saturating_sub(1);
        self.count_dropped(report.tick, "present", error);
    }

    fn count_dropped(&mut self, tick: u64, stage: &'static str, e: &PipelineError) {
        self.stats.dropped += 1;
        self.stats.consecutive_failures += 1;
        error!(
            tick,
            stage,
            error = %e,
            fatal = e.is_fatal(),
            consecutive = self.stats.consecutive_failures,
            "frame dropped"
        );
    }

    fn process(
        &mut self,
        tick: u64,
        source: &D::Frame,
        destination: &D::Frame,
    ) -> PipelineResult<TickReport> {
        let started = Instant::now();
        let mut timings = StageTimings::default();
        let mut warnings = Vec::new();
        let device = self.stage.device().as_ref();
        let desc = source.desc();

        let t = Instant::now();
        let captured = to_cpu_image(device, source, PixelFormat::Rgba8)?;
        timings.capture_us = micros(t);

        let t = Instant::now();
        let pre = self.stage.run_pre(&captured)?;
        drop(captured);
        warnings.extend(pre.plan.warning);
        timings.preprocess_us = micros(t);

        let t = Instant::now();
        let tensor = image_to_tensor(&pre.image, device.tracker())?;
        drop(pre);
        let output = self.engine.execute(&tensor)?;
        let styled = tensor_to_image(output.view(), desc.width, desc.height)?;
        drop(tensor);
        timings.inference_us = micros(t);

        let t = Instant::now();
        let post = self.stage.run_post(&styled)?;
        drop(styled);
        warnings.extend(post.plan.warning);
        timings.postprocess_us = micros(t);

        let t = Instant::now();
        blit(device, &post.image, destination)?;
        timings.present_us = micros(t);
        timings.total_us = micros(started);

        Ok(TickReport {
            tick,
            timestamp: Utc::now(),
            width: desc.width,
            height: desc.height,
            timings,
            warnings,
        })
    }

    /// Release the engine. Safe to call more than once.
    pub fn teardown(&mut self) {
        self.engine.teardown();
        info!(
            ticks = self.stats.ticks,
            presented = self.stats.presented,
            dropped = self.stats.dropped,
            "Orchestrator beendet"
        );
    }
}

fn micros(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;
    use crate::gpu::host::HostDevice;
    use crate::gpu::TRANSFORM_OUTPUT;
    use crate::image::CpuImage;
    use crate::resources::ResourceKind;

    const GRAY: f32 = 128.0 / 255.0;

    struct Rig {
        device: Arc<HostDevice>,
        source: <HostDevice as ComputeDevice>::Frame,
        destination: <HostDevice as ComputeDevice>::Frame,
    }

    fn rig(device: HostDevice, width: u32, height: u32, value: [f32; 4]) -> Rig {
        let device = Arc::new(device);
        let desc = crate::image::FrameDesc::new(width, height, PixelFormat::Rgba8);
        let source = device.allocate(desc).unwrap();
        device
            .upload(&source, &CpuImage::uniform(width, height, PixelFormat::Rgba8, value))
            .unwrap();
        let destination = device.allocate(desc).unwrap();
        Rig {
            device,
            source,
            destination,
        }
    }

    fn identity(rig: &Rig, shape: Option<Vec<usize>>) -> FrameOrchestrator<HostDevice> {
        FrameOrchestrator::with_network(
            Arc::clone(&rig.device),
            CompiledNetwork::identity(shape),
            WorkerType::Auto,
            DispatchRounding::Ceil,
        )
        .unwrap()
    }

    fn presented(rig: &Rig) -> CpuImage {
        to_cpu_image(rig.device.as_ref(), &rig.destination, PixelFormat::Rgba8).unwrap()
    }

    #[test]
    fn test_gray_frame_survives_identity_network() {
        let rig = rig(HostDevice::new(), 512, 512, [GRAY, GRAY, GRAY, 1.0]);
        let mut orch = identity(&rig, None);

        let report = orch.run_tick(&rig.source, &rig.destination).unwrap();
        assert_eq!(report.tick, 1);
        assert_eq!((report.width, report.height), (512, 512));
        assert!(report.warnings.is_empty());

        let out = presented(&rig);
        for px in out.as_bytes().chunks_exact(4) {
            assert_eq!(px, &[128, 128, 128, 255]);
        }
        assert_eq!(orch.stats().presented, 1);
    }

    #[test]
    fn test_shape_invariant_for_aligned_dimensions() {
        let device = Arc::new(HostDevice::new());
        let stage = Pipeline::new(Arc::clone(&device), DispatchRounding::Floor);
        let mut engine = InferenceEngine::new();
        engine
            .initialize(CompiledNetwork::identity(None), WorkerType::Cpu)
            .unwrap();

        for (w, h) in [(8, 8), (64, 32), (256, 256), (40, 120)] {
            let pre = stage
                .run_pre(&CpuImage::uniform(w, h, PixelFormat::Rgba8, [0.2, 0.4, 0.6, 1.0]))
                .unwrap();
            let tensor = image_to_tensor(&pre.image, device.tracker()).unwrap();
            let out = engine.execute(&tensor).unwrap();
            assert_eq!(out.shape(), &[1, h as usize, w as usize, 3]);
        }
        engine.teardown();
    }

    #[test]
    fn test_no_leaks_after_successful_ticks() {
        let rig = rig(HostDevice::new(), 64, 48, [0.3, 0.6, 0.9, 1.0]);
        let baseline = rig.device.tracker().snapshot();
        let mut orch = identity(&rig, None);

        for _ in 0..5 {
            orch.run_tick(&rig.source, &rig.destination).unwrap();
        }
        let after = rig.device.tracker().snapshot();
        assert_eq!(after.frames, baseline.frames);
        assert_eq!(after.tensors, 0);
        assert_eq!(after.bytes, baseline.bytes);
        assert!(after.peak_bytes > baseline.bytes);
        assert_eq!(orch.stats().presented, 5);
    }

    #[test]
    fn test_no_leaks_after_failed_inference() {
        let rig = rig(HostDevice::new(), 16, 16, [0.5, 0.5, 0.5, 1.0]);
        let baseline = rig.device.tracker().snapshot();
        let before = presented(&rig);
        let mut orch = identity(&rig, Some(vec![1, 8, 8, 3]));

        for _ in 0..4 {
            let err = orch.run_tick(&rig.source, &rig.destination).unwrap_err();
            assert!(matches!(err, PipelineError::Inference(_)));
            assert!(!err.is_fatal());
        }

        let after = rig.device.tracker().snapshot();
        assert_eq!(after.frames, baseline.frames);
        assert_eq!(after.tensors, 0);
        assert_eq!(after.bytes, baseline.bytes);
        assert_eq!(presented(&rig).as_bytes(), before.as_bytes());

        let stats = orch.stats();
        assert_eq!(stats.dropped, 4);
        assert_eq!(stats.presented, 0);
        assert_eq!(stats.consecutive_failures, 4);
    }

    #[test]
    fn test_no_leaks_after_failed_postprocess() {
        let rig = rig(
            HostDevice::new().without_kernel(TRANSFORM_OUTPUT),
            32,
            32,
            [0.1, 0.2, 0.3, 1.0],
        );
        let baseline = rig.device.tracker().snapshot();
        let mut orch = identity(&rig, None);

        for _ in 0..3 {
            assert!(matches!(
                orch.run_tick(&rig.source, &rig.destination),
                Err(PipelineError::TransformDispatchFailure { .. })
            ));
        }
        let after = rig.device.tracker().snapshot();
        assert_eq!(after.frames, baseline.frames);
        assert_eq!(after.tensors, 0);
    }

    #[test]
    fn test_recovers_after_failed_tick() {
        let rig = rig(HostDevice::new(), 8, 8, [1.0, 1.0, 1.0, 1.0]);
        let gray = rig
            .device
            .allocate(crate::image::FrameDesc::new(8, 8, PixelFormat::Gray8))
            .unwrap();
        let baseline = rig.device.tracker().snapshot();
        let mut orch = identity(&rig, None);

        assert!(matches!(
            orch.run_tick(&gray, &rig.destination),
            Err(PipelineError::FormatMismatch { .. })
        ));
        assert_eq!(orch.stats().consecutive_failures, 1);

        orch.run_tick(&rig.source, &rig.destination).unwrap();
        let stats = orch.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.presented, 1);
        assert_eq!(stats.consecutive_failures, 0);
        assert!(presented(&rig).as_bytes().chunks_exact(4).all(|p| p == [255, 255, 255, 255]));

        let after = rig.device.tracker().snapshot();
        assert_eq!(after.frames, baseline.frames);
        assert_eq!(after.tensors, 0);
    }

    #[test]
    fn test_dropped_outside_pipeline_counts() {
        let rig = rig(HostDevice::new(), 8, 8, [1.0, 1.0, 1.0, 1.0]);
        let mut orch = identity(&rig, None);

        orch.record_dropped(&PipelineError::Device("camera gone".into()));
        let report = orch.run_tick(&rig.source, &rig.destination).unwrap();
        assert_eq!(report.tick, 2);
        orch.record_present_failure(&report, &PipelineError::Device("readback".into()));

        let stats = orch.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.presented, 0);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.consecutive_failures, 2);
    }

    #[test]
    fn test_tick_after_teardown_is_fatal() {
        let rig = rig(HostDevice::new(), 16, 16, [0.5, 0.5, 0.5, 1.0]);
        let mut orch = identity(&rig, None);
        orch.run_tick(&rig.source, &rig.destination).unwrap();

        orch.teardown();
        orch.teardown();
        assert_eq!(orch.engine().state(), EngineState::Disposed);
        assert!(!orch.engine().has_resident_output());

        let err = orch.run_tick(&rig.source, &rig.destination).unwrap_err();
        assert!(matches!(err, PipelineError::EngineDisposed));
        assert!(err.is_fatal());
        assert_eq!(rig.device.tracker().live(ResourceKind::Tensor), 0);
    }

    #[test]
    fn test_gray8_source_is_format_mismatch() {
        let device = Arc::new(HostDevice::new());
        let source = device
            .allocate(crate::image::FrameDesc::new(8, 8, PixelFormat::Gray8))
            .unwrap();
        let destination = device
            .allocate(crate::image::FrameDesc::new(8, 8, PixelFormat::Rgba8))
            .unwrap();
        let mut orch = FrameOrchestrator::with_network(
            Arc::clone(&device),
            CompiledNetwork::identity(None),
            WorkerType::Auto,
            DispatchRounding::Ceil,
        )
        .unwrap();

        assert!(matches!(
            orch.run_tick(&source, &destination),
            Err(PipelineError::FormatMismatch {
                from: PixelFormat::Gray8,
                to: PixelFormat::Rgba8
            })
        ));
    }

    #[test]
    fn test_unaligned_frame_reports_warnings() {
        let rig = rig(HostDevice::new(), 250, 250, [0.5, 0.5, 0.5, 1.0]);
        let mut orch = identity(&rig, None);
        let report = orch.run_tick(&rig.source, &rig.destination).unwrap();
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.warnings[0].uncovered_columns, 0);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["tick"], 1);
        assert_eq!(json["warnings"][0]["width"], 250);
        assert!(json["timings"]["total_us"].is_u64());
    }

    #[test]
    fn test_initialize_from_config() {
        let cfg = Config::from_toml_str(
            r#"
            [model]
            backend = "identity"
            [frame]
            width = 16
            height = 16
            [compute]
            device = "host"
            dispatch = "reject"
            "#,
        )
        .unwrap();
        let orch = FrameOrchestrator::initialize(Arc::new(HostDevice::new()), &cfg).unwrap();
        assert_eq!(orch.engine().state(), EngineState::Ready);
        assert_eq!(orch.stage.rounding(), DispatchRounding::Reject);
    }
}
