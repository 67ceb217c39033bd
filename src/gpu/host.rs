//! CPU reference implementation of [`ComputeDevice`].
//!
//! Frames live in host memory and transforms are per-pixel closures. The
//! dispatch loop walks thread groups and threads exactly like the GPU does,
//! so coverage effects of the dispatch size (a truncated grid leaving the
//! right and bottom edges untouched) reproduce faithfully.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{check_upload, Bindings, ComputeDevice, FrameHandle, THREAD_GROUP_SIZE};
use super::{TRANSFORM_INPUT, TRANSFORM_OUTPUT};
use crate::error::{PipelineError, PipelineResult};
use crate::image::{CpuImage, FrameDesc, PixelFormat};
use crate::resources::{LiveAllocation, ResourceKind, ResourceTracker};

/// Per-pixel body of a compute transform: decoded input texel in, output texel out.
pub type PixelKernel = Arc<dyn Fn([f32; 4]) -> [f32; 4] + Send + Sync>;

/// Scales normalized color into the 0..255 range the network was trained on.
pub fn process_input_kernel(px: [f32; 4]) -> [f32; 4] {
    [px[0] * 255.0, px[1] * 255.0, px[2] * 255.0, 1.0]
}

/// Clamps network output to 0..255 and normalizes back to 0..1.
pub fn process_output_kernel(px: [f32; 4]) -> [f32; 4] {
    [
        px[0].clamp(0.0, 255.0) / 255.0,
        px[1].clamp(0.0, 255.0) / 255.0,
        px[2].clamp(0.0, 255.0) / 255.0,
        1.0,
    ]
}

pub struct HostFrame {
    desc: FrameDesc,
    texels: Mutex<Vec<u8>>,
    _live: LiveAllocation,
}

impl FrameHandle for HostFrame {
    fn desc(&self) -> FrameDesc {
        self.desc
    }
}

impl HostFrame {
    fn snapshot(&self) -> PipelineResult<CpuImage> {
        let texels = self
            .texels
            .lock()
            .map_err(|_| PipelineError::Device("host frame lock poisoned".into()))?;
        CpuImage::from_raw(self.desc.width, self.desc.height, self.desc.format, texels.clone())
    }

    fn store(&self, image: CpuImage) -> PipelineResult<()> {
        let mut texels = self
            .texels
            .lock()
            .map_err(|_| PipelineError::Device("host frame lock poisoned".into()))?;
        *texels = image.into_bytes();
        Ok(())
    }
}

pub struct HostDevice {
    tracker: ResourceTracker,
    kernels: HashMap<String, PixelKernel>,
}

impl HostDevice {
    /// Device with the built-in `ProcessInput` / `ProcessOutput` transforms.
    pub fn new() -> Self {
        Self::empty()
            .with_kernel(TRANSFORM_INPUT, process_input_kernel)
            .with_kernel(TRANSFORM_OUTPUT, process_output_kernel)
    }

    /// Device without any transforms registered.
    pub fn empty() -> Self {
        Self {
            tracker: ResourceTracker::new(),
            kernels: HashMap::new(),
        }
    }

    /// Register (or replace) a transform.
    pub fn with_kernel<K>(mut self, name: &str, kernel: K) -> Self
    where
        K: Fn([f32; 4]) -> [f32; 4] + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Arc::new(kernel));
        self
    }

    pub fn without_kernel(mut self, name: &str) -> Self {
        self.kernels.remove(name);
        self
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeDevice for HostDevice {
    type Frame = HostFrame;

    fn name(&self) -> &'static str {
        "host"
    }

    fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    fn allocate(&self, desc: FrameDesc) -> PipelineResult<HostFrame> {
        if desc.width == 0 || desc.height == 0 {
            return Err(PipelineError::Device(format!(
                "cannot allocate {}x{} frame",
                desc.width, desc.height
            )));
        }
        let len = desc.byte_len();
        Ok(HostFrame {
            desc,
            texels: Mutex::new(vec![0; len]),
            _live: self.tracker.acquire(ResourceKind::Frame, len),
        })
    }

    fn upload(&self, frame: &HostFrame, image: &CpuImage) -> PipelineResult<()> {
        check_upload(frame.desc, image)?;
        frame.store(image.clone())
    }

    fn read_back(&self, frame: &HostFrame) -> PipelineResult<Vec<u8>> {
        Ok(frame.snapshot()?.into_bytes())
    }

    fn has_transform(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    fn dispatch(
        &self,
        transform: &str,
        bindings: &Bindings<'_, HostFrame>,
        groups: [u32; 3],
    ) -> PipelineResult<()> {
        let kernel = self
            .kernels
            .get(transform)
            .ok_or_else(|| PipelineError::dispatch(transform, "no such transform"))?;
        let (result, input) = bindings.resolve(transform)?;
        if std::ptr::eq(result, input) {
            return Err(PipelineError::dispatch(
                transform,
                "'Result' and 'InputImage' alias the same frame",
            ));
        }
        if result.desc.format != PixelFormat::Rgba16F {
            return Err(PipelineError::dispatch(
                transform,
                format!("'Result' must be Rgba16F, got {:?}", result.desc.format),
            ));
        }

        let src = input.snapshot()?;
        let mut out = result.snapshot()?;
        let (width, height) = (src.width(), src.height());
        let mut written = 0usize;

        // Depth is 1, so only the z = 0 slice of the grid touches texels.
        if groups[2] > 0 {
            for gy in 0..groups[1] {
                for gx in 0..groups[0] {
                    for ty in 0..THREAD_GROUP_SIZE {
                        for tx in 0..THREAD_GROUP_SIZE {
                            let x = gx * THREAD_GROUP_SIZE + tx;
                            let y = gy * THREAD_GROUP_SIZE + ty;
                            if x < width && y < height {
                                out.set_pixel(x, y, kernel(src.pixel(x, y)));
                                written += 1;
                            }
                        }
                    }
                }
            }
        }

        debug!(transform, ?groups, written, "host dispatch");
        result.store(out)
    }

    fn synchronize(&self) -> PipelineResult<()> {
        // Dispatches complete before `dispatch` returns.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{SLOT_INPUT_IMAGE, SLOT_RESULT};

    fn frames(device: &HostDevice, w: u32, h: u32) -> (HostFrame, HostFrame) {
        let src = device
            .allocate(FrameDesc::new(w, h, PixelFormat::Rgba8))
            .unwrap();
        let dst = device
            .allocate(FrameDesc::new(w, h, PixelFormat::Rgba16F).with_random_write())
            .unwrap();
        (src, dst)
    }

    #[test]
    fn test_builtin_kernels() {
        assert_eq!(
            process_input_kernel([0.5, 0.0, 1.0, 0.2]),
            [127.5, 0.0, 255.0, 1.0]
        );
        assert_eq!(
            process_output_kernel([300.0, -5.0, 51.0, 0.0]),
            [1.0, 0.0, 0.2, 1.0]
        );
    }

    #[test]
    fn test_dispatch_covers_only_dispatched_groups() {
        let device = HostDevice::new();
        let (src, dst) = frames(&device, 16, 16);
        device
            .upload(
                &src,
                &CpuImage::uniform(16, 16, PixelFormat::Rgba8, [1.0, 1.0, 1.0, 1.0]),
            )
            .unwrap();

        let mut bindings = Bindings::new();
        bindings
            .bind(SLOT_RESULT, &dst)
            .unwrap()
            .bind(SLOT_INPUT_IMAGE, &src)
            .unwrap();
        device.dispatch(TRANSFORM_INPUT, &bindings, [1, 2, 1]).unwrap();

        let out = CpuImage::from_raw(16, 16, PixelFormat::Rgba16F, device.read_back(&dst).unwrap())
            .unwrap();
        assert_eq!(out.pixel(7, 15), [255.0, 255.0, 255.0, 1.0]);
        assert_eq!(out.pixel(8, 0), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_unknown_transform_fails() {
        let device = HostDevice::new().without_kernel(TRANSFORM_OUTPUT);
        let (src, dst) = frames(&device, 8, 8);
        let mut bindings = Bindings::new();
        bindings
            .bind(SLOT_RESULT, &dst)
            .unwrap()
            .bind(SLOT_INPUT_IMAGE, &src)
            .unwrap();
        let err = device
            .dispatch(TRANSFORM_OUTPUT, &bindings, [1, 1, 1])
            .unwrap_err();
        assert!(matches!(err, PipelineError::TransformDispatchFailure { .. }));
        assert!(!device.has_transform(TRANSFORM_OUTPUT));
    }

    #[test]
    fn test_frames_are_tracked() {
        let device = HostDevice::new();
        {
            let _pair = frames(&device, 8, 8);
            assert_eq!(device.tracker().live(ResourceKind::Frame), 2);
        }
        assert_eq!(device.tracker().live(ResourceKind::Frame), 0);
    }

    #[test]
    fn test_upload_rejects_other_format() {
        let device = HostDevice::new();
        let (src, _dst) = frames(&device, 8, 8);
        let hdr = CpuImage::new(8, 8, PixelFormat::Rgba16F);
        assert!(matches!(
            device.upload(&src, &hdr),
            Err(PipelineError::FormatMismatch { .. })
        ));
    }
}
