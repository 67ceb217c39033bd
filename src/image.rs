//! Image format bridge: GPU frames ⇄ CPU-addressable images.
//!
//! `to_cpu_image` is a raw copy. The bytes read back from the GPU frame are
//! reinterpreted under the target format without any value conversion, so
//! the target must have the same channel count and texel size as the source.
//! `blit` is the presentation path and the only place that converts values
//! between formats.

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::gpu::{ComputeDevice, FrameHandle};

/// Pixel layouts a frame buffer can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit RGBA, standard dynamic range. Decoded to [0, 1].
    Rgba8,
    /// 16-bit float RGBA, high dynamic range. Decoded as raw values.
    Rgba16F,
    /// 8-bit single channel (luma only).
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Rgba16F => 4,
            PixelFormat::Gray8 => 1,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgba16F => 8,
            PixelFormat::Gray8 => 1,
        }
    }

    pub fn is_hdr(self) -> bool {
        matches!(self, PixelFormat::Rgba16F)
    }

    /// Whether a raw byte copy from `self` can be read back as `target`.
    pub fn copy_compatible(self, target: PixelFormat) -> bool {
        self.channels() == target.channels() && self.bytes_per_pixel() == target.bytes_per_pixel()
    }
}

/// Shape and usage of a GPU frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Frame may be bound as a writable storage image by a compute transform.
    pub random_write: bool,
}

impl FrameDesc {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            random_write: false,
        }
    }

    pub fn with_random_write(mut self) -> Self {
        self.random_write = true;
        self
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// A CPU-addressable image with tightly packed rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuImage {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl CpuImage {
    /// Zero-filled image (transparent black).
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = FrameDesc::new(width, height, format).byte_len();
        Self {
            width,
            height,
            format,
            data: vec![0; len],
        }
    }

    pub fn from_raw(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> PipelineResult<Self> {
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidImage(format!(
                "zero-sized image {}x{}",
                width, height
            )));
        }
        let expected = FrameDesc::new(width, height, format).byte_len();
        if data.len() != expected {
            return Err(PipelineError::InvalidImage(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn uniform(width: u32, height: u32, format: PixelFormat, value: [f32; 4]) -> Self {
        let mut image = Self::new(width, height, format);
        for y in 0..height {
            for x in 0..width {
                image.set_pixel(x, y, value);
            }
        }
        image
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn desc(&self) -> FrameDesc {
        FrameDesc::new(self.width, self.height, self.format)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        (y as usize * self.width as usize + x as usize) * self.format.bytes_per_pixel()
    }

    /// Decode one pixel to RGBA.
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        let at = self.offset(x, y);
        match self.format {
            PixelFormat::Rgba8 => {
                let px = &self.data[at..at + 4];
                [
                    px[0] as f32 / 255.0,
                    px[1] as f32 / 255.0,
                    px[2] as f32 / 255.0,
                    px[3] as f32 / 255.0,
                ]
            }
            PixelFormat::Rgba16F => {
                let texel: [f16; 4] = bytemuck::pod_read_unaligned(&self.data[at..at + 8]);
                texel.map(f16::to_f32)
            }
            PixelFormat::Gray8 => {
                let v = self.data[at] as f32 / 255.0;
                [v, v, v, 1.0]
            }
        }
    }

    /// Encode one RGBA pixel. 8-bit formats clamp to [0, 1].
    pub fn set_pixel(&mut self, x: u32, y: u32, value: [f32; 4]) {
        let at = self.offset(x, y);
        match self.format {
            PixelFormat::Rgba8 => {
                for (dst, v) in self.data[at..at + 4].iter_mut().zip(value) {
                    *dst = unorm8(v);
                }
            }
            PixelFormat::Rgba16F => {
                let texel = value.map(f16::from_f32);
                self.data[at..at + 8].copy_from_slice(bytemuck::bytes_of(&texel));
            }
            PixelFormat::Gray8 => {
                self.data[at] = unorm8(0.299 * value[0] + 0.587 * value[1] + 0.114 * value[2]);
            }
        }
    }

    /// Value-converting copy into another format.
    pub fn convert(&self, format: PixelFormat) -> CpuImage {
        if format == self.format {
            return self.clone();
        }
        let mut out = CpuImage::new(self.width, self.height, format);
        for y in 0..self.height {
            for x in 0..self.width {
                out.set_pixel(x, y, self.pixel(x, y));
            }
        }
        out
    }

    /// Nearest-neighbor resample to new dimensions.
    pub fn resample_nearest(&self, width: u32, height: u32) -> CpuImage {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut out = CpuImage::new(width, height, self.format);
        let bpp = self.format.bytes_per_pixel();
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64) as u32;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as u32;
                let src = self.offset(sx, sy);
                let dst = out.offset(x, y);
                out.data[dst..dst + bpp].copy_from_slice(&self.data[src..src + bpp]);
            }
        }
        out
    }
}

fn unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Copy a GPU frame into a new CPU image of `target` format.
///
/// Raw copy only: fails with `FormatMismatch` when the frame's texels cannot
/// be reinterpreted as `target`.
pub fn to_cpu_image<D: ComputeDevice>(
    device: &D,
    frame: &D::Frame,
    target: PixelFormat,
) -> PipelineResult<CpuImage> {
    let desc = frame.desc();
    if !desc.format.copy_compatible(target) {
        return Err(PipelineError::FormatMismatch {
            from: desc.format,
            to: target,
        });
    }
    let bytes = device.read_back(frame)?;
    CpuImage::from_raw(desc.width, desc.height, target, bytes)
}

/// Present `image` into `destination`, keeping the destination's declared
/// dimensions and format.
pub fn blit<D: ComputeDevice>(
    device: &D,
    image: &CpuImage,
    destination: &D::Frame,
) -> PipelineResult<()> {
    let desc = destination.desc();
    let converted = image
        .convert(desc.format)
        .resample_nearest(desc.width, desc.height);
    device.upload(destination, &converted)
}
