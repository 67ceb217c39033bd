//! Compute device abstraction.
//!
//! The pipeline needs very little from a GPU: allocate frame buffers, move
//! bytes in and out, bind two named slots of a compute transform, dispatch
//! thread groups, and wait for completion. [`ComputeDevice`] captures exactly
//! that. Two implementations ship with the crate:
//!
//! - [`wgpu_device::WgpuDevice`]: wgpu compute pipelines built from WGSL.
//! - [`host::HostDevice`]: a CPU reference that emulates the thread-group
//!   dispatch pixel for pixel. Used by tests and as the fallback when no
//!   adapter is available.

pub mod host;
pub mod wgpu_device;

use crate::error::{PipelineError, PipelineResult};
use crate::image::{CpuImage, FrameDesc};
use crate::resources::ResourceTracker;

/// Name of the preprocessing transform.
pub const TRANSFORM_INPUT: &str = "ProcessInput";
/// Name of the postprocessing transform.
pub const TRANSFORM_OUTPUT: &str = "ProcessOutput";

/// Slot receiving the transform's output image.
pub const SLOT_RESULT: &str = "Result";
/// Slot holding the transform's source image.
pub const SLOT_INPUT_IMAGE: &str = "InputImage";

/// Thread-group edge length of every transform (8x8x1).
pub const THREAD_GROUP_SIZE: u32 = 8;

/// A GPU-resident frame buffer.
pub trait FrameHandle {
    fn desc(&self) -> FrameDesc;
}

/// Buffers bound to a transform's slots for a single dispatch.
///
/// Built fresh for every call, nothing carries over between dispatches.
pub struct Bindings<'a, F> {
    result: Option<&'a F>,
    input_image: Option<&'a F>,
}

impl<'a, F: FrameHandle> Bindings<'a, F> {
    pub fn new() -> Self {
        Self {
            result: None,
            input_image: None,
        }
    }

    pub fn bind(&mut self, slot: &str, frame: &'a F) -> PipelineResult<&mut Self> {
        match slot {
            SLOT_RESULT => self.result = Some(frame),
            SLOT_INPUT_IMAGE => self.input_image = Some(frame),
            other => {
                return Err(PipelineError::Device(format!(
                    "unknown binding slot '{}'",
                    other
                )))
            }
        }
        Ok(self)
    }

    /// Both slots, or a dispatch failure naming the missing one.
    pub fn resolve(&self, transform: &str) -> PipelineResult<(&'a F, &'a F)> {
        let result = self
            .result
            .ok_or_else(|| PipelineError::dispatch(transform, "slot 'Result' is not bound"))?;
        let input = self
            .input_image
            .ok_or_else(|| PipelineError::dispatch(transform, "slot 'InputImage' is not bound"))?;

        let (out, src) = (result.desc(), input.desc());
        if !out.random_write {
            return Err(PipelineError::dispatch(
                transform,
                "'Result' frame was allocated without random write access",
            ));
        }
        if (out.width, out.height) != (src.width, src.height) {
            return Err(PipelineError::dispatch(
                transform,
                format!(
                    "'Result' is {}x{} but 'InputImage' is {}x{}",
                    out.width, out.height, src.width, src.height
                ),
            ));
        }
        Ok((result, input))
    }
}

impl<'a, F: FrameHandle> Default for Bindings<'a, F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the frame pipeline asks of a GPU.
pub trait ComputeDevice: Send + Sync {
    type Frame: FrameHandle;

    fn name(&self) -> &'static str;

    /// Counters for every frame this device allocates.
    fn tracker(&self) -> &ResourceTracker;

    fn allocate(&self, desc: FrameDesc) -> PipelineResult<Self::Frame>;

    /// Replace the frame's contents. The image must match the frame's
    /// dimensions and format exactly.
    fn upload(&self, frame: &Self::Frame, image: &CpuImage) -> PipelineResult<()>;

    /// Tightly packed texels of the frame, after all submitted work on it
    /// has completed.
    fn read_back(&self, frame: &Self::Frame) -> PipelineResult<Vec<u8>>;

    fn has_transform(&self, name: &str) -> bool;

    /// Run `transform` over `groups[0] x groups[1] x groups[2]` thread groups.
    fn dispatch(
        &self,
        transform: &str,
        bindings: &Bindings<'_, Self::Frame>,
        groups: [u32; 3],
    ) -> PipelineResult<()>;

    /// Block until all submitted work has finished.
    fn synchronize(&self) -> PipelineResult<()>;
}

/// Shared upload precondition for device implementations.
pub(crate) fn check_upload(frame: FrameDesc, image: &CpuImage) -> PipelineResult<()> {
    if image.format() != frame.format {
        return Err(PipelineError::FormatMismatch {
            from: image.format(),
            to: frame.format,
        });
    }
    if (image.width(), image.height()) != (frame.width, frame.height) {
        return Err(PipelineError::ShapeMismatch {
            expected: vec![frame.height as usize, frame.width as usize],
            actual: vec![image.height() as usize, image.width() as usize],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::host::HostDevice;
    use super::*;
    use crate::image::PixelFormat;

    #[test]
    fn test_bindings_require_both_slots() {
        let device = HostDevice::new();
        let src = device
            .allocate(FrameDesc::new(8, 8, PixelFormat::Rgba8))
            .unwrap();

        let mut bindings = Bindings::new();
        bindings.bind(SLOT_INPUT_IMAGE, &src).unwrap();
        let err = bindings.resolve(TRANSFORM_INPUT).err().unwrap();
        assert!(err.to_string().contains("'Result' is not bound"));
    }

    #[test]
    fn test_bindings_reject_unknown_slot() {
        let device = HostDevice::new();
        let src = device
            .allocate(FrameDesc::new(8, 8, PixelFormat::Rgba8))
            .unwrap();
        let mut bindings = Bindings::new();
        assert!(bindings.bind("Output", &src).is_err());
    }

    #[test]
    fn test_result_needs_random_write() {
        let device = HostDevice::new();
        let src = device
            .allocate(FrameDesc::new(8, 8, PixelFormat::Rgba8))
            .unwrap();
        let dst = device
            .allocate(FrameDesc::new(8, 8, PixelFormat::Rgba16F))
            .unwrap();
        let mut bindings = Bindings::new();
        bindings
            .bind(SLOT_RESULT, &dst)
            .unwrap()
            .bind(SLOT_INPUT_IMAGE, &src)
            .unwrap();
        assert!(matches!(
            bindings.resolve(TRANSFORM_INPUT),
            Err(PipelineError::TransformDispatchFailure { .. })
        ));
    }
}
