//! Typed errors for the frame pipeline.
//!
//! The core (image bridge, compute stage, tensor bridge, engine adapter,
//! orchestrator) returns [`PipelineError`]. Application code (config, CLI,
//! backends) works with `anyhow::Result` and converts at the seam.

use serde::Serialize;

use crate::image::PixelFormat;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("format mismatch: cannot reinterpret {from:?} as {to:?}")]
    FormatMismatch { from: PixelFormat, to: PixelFormat },

    #[error("unsupported channel layout: {0}")]
    UnsupportedChannelLayout(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("inference engine already disposed")]
    EngineDisposed,

    #[error("inference engine not initialized, call initialize() first")]
    EngineNotReady,

    #[error("compute transform '{transform}' failed: {reason}")]
    TransformDispatchFailure { transform: String, reason: String },

    #[error("{0} (dispatch policy: reject)")]
    DimensionAlignment(DimensionAlignmentWarning),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),
}

impl PipelineError {
    pub(crate) fn dispatch(transform: &str, reason: impl Into<String>) -> Self {
        PipelineError::TransformDispatchFailure {
            transform: transform.to_string(),
            reason: reason.into(),
        }
    }

    /// Lifecycle misuse. The orchestrator must stop instead of dropping the
    /// frame and carrying on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::EngineDisposed | PipelineError::EngineNotReady
        )
    }
}

/// Image dimensions that are not a multiple of the transform's thread group.
///
/// Not an error by itself: depending on the dispatch policy the stage either
/// covers the remainder with a partial group or leaves it unprocessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DimensionAlignmentWarning {
    pub width: u32,
    pub height: u32,
    pub group_size: u32,
    /// Columns at the right edge that no dispatched thread covers.
    pub uncovered_columns: u32,
    /// Rows at the bottom edge that no dispatched thread covers.
    pub uncovered_rows: u32,
}

impl std::fmt::Display for DimensionAlignmentWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} is not a multiple of the {}x{} thread group ({} columns, {} rows uncovered)",
            self.width,
            self.height,
            self.group_size,
            self.group_size,
            self.uncovered_columns,
            self.uncovered_rows
        )
    }
}
