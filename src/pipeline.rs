//! GPU pre/post-processing stage.
//!
//! Runs a named compute transform over one image and copies the HDR result
//! back to the CPU. Used twice per frame: `ProcessInput` before inference and
//! `ProcessOutput` after it.
//!
//! Callers must supply images whose width and height are multiples of the
//! 8x8 thread group. How other sizes are handled is decided by
//! [`DispatchRounding`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DimensionAlignmentWarning, PipelineError, PipelineResult};
use crate::gpu::{
    Bindings, ComputeDevice, SLOT_INPUT_IMAGE, SLOT_RESULT, THREAD_GROUP_SIZE, TRANSFORM_INPUT,
    TRANSFORM_OUTPUT,
};
use crate::image::{to_cpu_image, CpuImage, FrameDesc, PixelFormat};

/// How the thread-group count is derived for dimensions that are not a
/// multiple of the group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchRounding {
    /// `size / 8`. The last partial column/row of groups is never dispatched,
    /// so a strip at the right and bottom edges stays unprocessed.
    Floor,
    /// `ceil(size / 8)`. Every pixel is covered; kernels skip threads
    /// outside the image.
    #[default]
    Ceil,
    /// Refuse to dispatch.
    Reject,
}

/// Thread-group grid for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPlan {
    pub groups: [u32; 3],
    pub covered_width: u32,
    pub covered_height: u32,
    pub warning: Option<DimensionAlignmentWarning>,
}

impl DispatchPlan {
    pub fn for_dimensions(
        width: u32,
        height: u32,
        rounding: DispatchRounding,
    ) -> PipelineResult<Self> {
        let g = THREAD_GROUP_SIZE;
        let aligned = width % g == 0 && height % g == 0;

        let (gx, gy) = match rounding {
            DispatchRounding::Floor | DispatchRounding::Reject => (width / g, height / g),
            DispatchRounding::Ceil => (width.div_ceil(g), height.div_ceil(g)),
        };
        let covered_width = (gx * g).min(width);
        let covered_height = (gy * g).min(height);

        let warning = (!aligned).then_some(DimensionAlignmentWarning {
            width,
            height,
            group_size: g,
            uncovered_columns: width - covered_width,
            uncovered_rows: height - covered_height,
        });

        if let (DispatchRounding::Reject, Some(w)) = (rounding, warning) {
            return Err(PipelineError::DimensionAlignment(w));
        }

        Ok(Self {
            groups: [gx, gy, 1],
            covered_width,
            covered_height,
            warning,
        })
    }
}

/// Output of one transform run.
#[derive(Debug, Clone)]
pub struct Transformed {
    /// HDR image copied back from the result frame.
    pub image: CpuImage,
    pub plan: DispatchPlan,
}

/// Compute stage bound to one device.
pub struct Pipeline<D: ComputeDevice> {
    device: Arc<D>,
    rounding: DispatchRounding,
}

impl<D: ComputeDevice> Clone for Pipeline<D> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
            rounding: self.rounding,
        }
    }
}

impl<D: ComputeDevice> Pipeline<D> {
    pub fn new(device: Arc<D>, rounding: DispatchRounding) -> Self {
        Self { device, rounding }
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn rounding(&self) -> DispatchRounding {
        self.rounding
    }

    /// Runs a named compute transform over one image.
    ///
    /// Allocates two transient frames (source upload and HDR result with
    /// random write). Both are released before returning, on success and on
    /// error. The result is copied back only after the dispatch has been
    /// synchronized.
    ///
    /// # Arguments
    ///
    /// * `transform` - Transform name, `ProcessInput` or `ProcessOutput` for the built-ins
    /// * `input` - Source image, any format the device can upload
    ///
    /// # Returns
    ///
    /// * `Ok(transformed)` - HDR result and the dispatch plan that produced it
    /// * `Err(e)` - Unknown transform, misaligned size under `Reject`, or a
    ///   device/dispatch failure
    pub fn run_transform(&self, transform: &str, input: &CpuImage) -> PipelineResult<Transformed> {
        if !self.device.has_transform(transform) {
            return Err(PipelineError::dispatch(transform, "no such transform"));
        }
        let (width, height) = (input.width(), input.height());
        let plan = DispatchPlan::for_dimensions(width, height, self.rounding)?;
        if let Some(w) = plan.warning {
            warn!(
                transform,
                width,
                height,
                uncovered_columns = w.uncovered_columns,
                uncovered_rows = w.uncovered_rows,
                "dimensions not aligned to thread group"
            );
        }

        let device = self.device.as_ref();
        let source = device.allocate(input.desc())?;
        device.upload(&source, input)?;
        let result = device
            .allocate(FrameDesc::new(width, height, PixelFormat::Rgba16F).with_random_write())?;

        let mut bindings = Bindings::new();
        bindings
            .bind(SLOT_RESULT, &result)?
            .bind(SLOT_INPUT_IMAGE, &source)?;
        device.dispatch(transform, &bindings, plan.groups)?;
        device.synchronize()?;

        let image = to_cpu_image(device, &result, PixelFormat::Rgba16F)?;
        drop(bindings);
        drop(result);
        drop(source);

        debug!(transform, width, height, groups = ?plan.groups, "transform complete");
        Ok(Transformed { image, plan })
    }

    /// Preprocessing: SDR camera image to HDR network input.
    pub fn run_pre(&self, input: &CpuImage) -> PipelineResult<Transformed> {
        self.run_transform(TRANSFORM_INPUT, input)
    }

    /// Postprocessing: HDR network output to HDR display image.
    pub fn run_post(&self, input: &CpuImage) -> PipelineResult<Transformed> {
        self.run_transform(TRANSFORM_OUTPUT, input)
    }
}
