use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::DispatchRounding;

/// Which inference implementation backs the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// ONNX Runtime (cargo feature `onnx`).
    Onnx,
    /// Passthrough network, outputs = inputs.
    Identity,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Onnx => write!(f, "onnx"),
            BackendKind::Identity => write!(f, "identity"),
        }
    }
}

/// Execution strategy of the inference worker. Affects speed, never results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    #[default]
    Auto,
    #[serde(alias = "cpu-parallel")]
    Cpu,
    #[serde(alias = "gpu-compute")]
    Gpu,
}

/// Axis order the model itself expects. Tensors handed to the engine are
/// always NHWC; NCHW models are transposed around the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelLayout {
    #[default]
    Nhwc,
    Nchw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackend {
    #[default]
    Wgpu,
    Host,
}

/// Synthetic capture pattern used when no camera collaborator is wired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePattern {
    #[default]
    Gray,
    Gradient,
    Checker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelCfg {
    pub backend: BackendKind,
    #[serde(default)]
    pub worker: WorkerType,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default = "default_output_name")]
    pub output_name: String,
    #[serde(default)]
    pub layout: ModelLayout,
    #[serde(default)]
    pub gpu_id: i32,
    /// Fixed input shape `[1, H, W, 3]` the network accepts, if any.
    #[serde(default)]
    pub input_shape: Option<Vec<usize>>,
}

fn default_input_name() -> String {
    "input".to_string()
}

fn default_output_name() -> String {
    "output".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameCfg {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComputeCfg {
    #[serde(default)]
    pub device: ComputeBackend,
    #[serde(default)]
    pub dispatch: DispatchRounding,
    #[serde(default)]
    pub shader_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeCfg {
    #[serde(default = "default_tick_hz")]
    pub tick_hz: f64,
    /// 0 runs until Ctrl-C.
    #[serde(default)]
    pub max_ticks: u64,
    #[serde(default)]
    pub source: SourcePattern,
    #[serde(default)]
    pub report_json: bool,
}

fn default_tick_hz() -> f64 {
    30.0
}

impl RuntimeCfg {
    /// Interval between ticks. Fails for rates whose period is not a
    /// representable, non-zero duration.
    pub fn tick_period(&self) -> Result<Duration> {
        let period = Duration::try_from_secs_f64(1.0 / self.tick_hz)
            .with_context(|| format!("runtime.tick_hz {} ergibt keine gültige Periode", self.tick_hz))?;
        anyhow::ensure!(
            period > Duration::ZERO,
            "runtime.tick_hz {} is too high, tick period rounds to zero",
            self.tick_hz
        );
        Ok(period)
    }
}

impl Default for RuntimeCfg {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            max_ticks: 0,
            source: SourcePattern::default(),
            report_json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub model: ModelCfg,
    pub frame: FrameCfg,
    #[serde(default)]
    pub compute: ComputeCfg,
    #[serde(default)]
    pub runtime: RuntimeCfg,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(s).context("Konfiguration konnte nicht gelesen werden")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Konfigurationsdatei fehlt: {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.frame.width > 0 && self.frame.height > 0,
            "frame width/height must be > 0 (got {}x{})",
            self.frame.width,
            self.frame.height
        );
        anyhow::ensure!(
            self.runtime.tick_hz.is_finite() && self.runtime.tick_hz > 0.0,
            "runtime.tick_hz must be > 0"
        );
        self.runtime.tick_period()?;
        if self.model.backend == BackendKind::Onnx {
            anyhow::ensure!(
                self.model.model_path.is_some(),
                "backend 'onnx' needs model.model_path"
            );
        }
        if let Some(shape) = &self.model.input_shape {
            anyhow::ensure!(
                shape.len() == 4 && shape[0] == 1 && shape[3] == 3,
                "model.input_shape must be [1, H, W, 3], got {:?}",
                shape
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [model]
        backend = "onnx"
        worker = "gpu"
        model_path = "models/mosaic.onnx"
        layout = "nchw"

        [frame]
        width = 512
        height = 512

        [compute]
        device = "host"
        dispatch = "floor"

        [runtime]
        tick_hz = 24.0
        max_ticks = 100
        source = "checker"
        report_json = true
    "#;

    #[test]
    fn test_parse_full_config() {
        let cfg = Config::from_toml_str(FULL).unwrap();
        assert_eq!(cfg.model.backend, BackendKind::Onnx);
        assert_eq!(cfg.model.worker, WorkerType::Gpu);
        assert_eq!(cfg.model.layout, ModelLayout::Nchw);
        assert_eq!(cfg.model.input_name, "input");
        assert_eq!(cfg.compute.device, ComputeBackend::Host);
        assert_eq!(cfg.compute.dispatch, DispatchRounding::Floor);
        assert_eq!(cfg.runtime.max_ticks, 100);
        assert_eq!(cfg.runtime.source, SourcePattern::Checker);
        assert_eq!((cfg.frame.width, cfg.frame.height), (512, 512));
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            [model]
            backend = "identity"
            [frame]
            width = 64
            height = 32
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model.worker, WorkerType::Auto);
        assert_eq!(cfg.compute.device, ComputeBackend::Wgpu);
        assert_eq!(cfg.compute.dispatch, DispatchRounding::Ceil);
        assert_eq!(cfg.runtime.tick_hz, 30.0);
        assert!(!cfg.runtime.report_json);
    }

    #[test]
    fn test_worker_aliases() {
        let cfg = Config::from_toml_str(
            r#"
            [model]
            backend = "identity"
            worker = "cpu-parallel"
            [frame]
            width = 8
            height = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model.worker, WorkerType::Cpu);
    }

    #[test]
    fn test_validation_errors() {
        let no_model = r#"
            [model]
            backend = "onnx"
            [frame]
            width = 8
            height = 8
        "#;
        assert!(Config::from_toml_str(no_model).is_err());

        let zero = r#"
            [model]
            backend = "identity"
            [frame]
            width = 0
            height = 8
        "#;
        assert!(Config::from_toml_str(zero).is_err());

        let bad_shape = r#"
            [model]
            backend = "identity"
            input_shape = [1, 3, 8, 8]
            [frame]
            width = 8
            height = 8
        "#;
        assert!(Config::from_toml_str(bad_shape).is_err());
    }

    #[test]
    fn test_tick_rate_bounds() {
        let with_rate = |hz: &str| {
            format!(
                r#"
                [model]
                backend = "identity"
                [frame]
                width = 8
                height = 8
                [runtime]
                tick_hz = {}
                "#,
                hz
            )
        };

        let cfg = Config::from_toml_str(&with_rate("60.0")).unwrap();
        assert_eq!(cfg.runtime.tick_period().unwrap(), Duration::from_secs_f64(1.0 / 60.0));

        let err = Config::from_toml_str(&with_rate("1e10")).unwrap_err();
        assert!(format!("{:#}", err).contains("rounds to zero"));
        assert!(Config::from_toml_str(&with_rate("1e-300")).is_err());
        assert!(Config::from_toml_str(&with_rate("0.0")).is_err());
    }
}
