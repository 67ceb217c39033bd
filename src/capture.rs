//! Default capture and presentation collaborators.
//!
//! The pipeline only needs a source frame that is refreshed every tick and a
//! destination frame that receives the result. [`SyntheticSource`] fills the
//! source with a moving test pattern, [`LoggingPresenter`] reads the
//! destination back and logs its statistics.

use tracing::debug;

use crate::error::PipelineResult;
use crate::gpu::ComputeDevice;
use crate::image::{to_cpu_image, CpuImage, FrameDesc, PixelFormat};
use crate::orchestrator::TickReport;
use crate::types::SourcePattern;

pub trait FrameSource<D: ComputeDevice> {
    /// Write the frame for `tick` into the source buffer.
    fn refresh(&mut self, device: &D, tick: u64) -> PipelineResult<()>;
    fn frame(&self) -> &D::Frame;
}

pub trait FramePresenter<D: ComputeDevice> {
    fn frame(&self) -> &D::Frame;
    /// Called after a tick has blitted into [`FramePresenter::frame`].
    fn present(&mut self, device: &D, report: &TickReport) -> PipelineResult<()>;
}

pub struct SyntheticSource<D: ComputeDevice> {
    frame: D::Frame,
    pattern: SourcePattern,
    width: u32,
    height: u32,
}

impl<D: ComputeDevice> SyntheticSource<D> {
    pub fn new(device: &D, pattern: SourcePattern, width: u32, height: u32) -> PipelineResult<Self> {
        let frame = device.allocate(FrameDesc::new(width, height, PixelFormat::Rgba8))?;
        Ok(Self {
            frame,
            pattern,
            width,
            height,
        })
    }
}

/// Render `pattern` at animation step `tick`.
pub fn render_pattern(pattern: SourcePattern, width: u32, height: u32, tick: u64) -> CpuImage {
    match pattern {
        SourcePattern::Gray => {
            let v = 128.0 / 255.0;
            CpuImage::uniform(width, height, PixelFormat::Rgba8, [v, v, v, 1.0])
        }
        SourcePattern::Gradient => {
            let mut img = CpuImage::new(width, height, PixelFormat::Rgba8);
            let shift = (tick % u64::from(width)) as u32;
            let (wd, hd) = (width.max(2) - 1, height.max(2) - 1);
            for y in 0..height {
                for x in 0..width {
                    let sx = (x + shift) % width;
                    img.set_pixel(
                        x,
                        y,
                        [sx as f32 / wd as f32, y as f32 / hd as f32, 0.5, 1.0],
                    );
                }
            }
            img
        }
        SourcePattern::Checker => {
            const CELL: u32 = 16;
            let mut img = CpuImage::new(width, height, PixelFormat::Rgba8);
            let shift = (tick % u64::from(CELL * 2)) as u32;
            for y in 0..height {
                for x in 0..width {
                    let on = (((x + shift) / CELL) + (y / CELL)) % 2 == 0;
                    let v = if on { 0.9 } else { 0.1 };
                    img.set_pixel(x, y, [v, v, v, 1.0]);
                }
            }
            img
        }
    }
}

impl<D: ComputeDevice> FrameSource<D> for SyntheticSource<D> {
    fn refresh(&mut self, device: &D, tick: u64) -> PipelineResult<()> {
        let image = render_pattern(self.pattern, self.width, self.height, tick);
        device.upload(&self.frame, &image)
    }

    fn frame(&self) -> &D::Frame {
        &self.frame
    }
}

/// Mean RGBA of the last presented frame, in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameSummary {
    pub mean: [f32; 4],
    pub presented: u64,
}

pub struct LoggingPresenter<D: ComputeDevice> {
    frame: D::Frame,
    summary: FrameSummary,
    report_json: bool,
}

impl<D: ComputeDevice> LoggingPresenter<D> {
    pub fn new(device: &D, width: u32, height: u32, report_json: bool) -> PipelineResult<Self> {
        let frame = device.allocate(FrameDesc::new(width, height, PixelFormat::Rgba8))?;
        Ok(Self {
            frame,
            summary: FrameSummary::default(),
            report_json,
        })
    }

    pub fn summary(&self) -> FrameSummary {
        self.summary
    }
}

fn mean_rgba(image: &CpuImage) -> [f32; 4] {
    let mut sum = [0f64; 4];
    for px in image.as_bytes().chunks_exact(4) {
        for (s, &b) in sum.iter_mut().zip(px) {
            *s += f64::from(b);
        }
    }
    let n = (image.width() as f64 * image.height() as f64).max(1.0) * 255.0;
    sum.map(|s| (s / n) as f32)
}

impl<D: ComputeDevice> FramePresenter<D> for LoggingPresenter<D> {
    fn frame(&self) -> &D::Frame {
        &self.frame
    }

    fn present(&mut self, device: &D, report: &TickReport) -> PipelineResult<()> {
        let image = to_cpu_image(device, &self.frame, PixelFormat::Rgba8)?;
        self.summary.mean = mean_rgba(&image);
        self.summary.presented += 1;

        if self.report_json {
            match serde_json::to_string(report) {
                Ok(line) => tracing::info!(target: "stylecam::report", "{}", line),
                Err(e) => tracing::warn!(error = %e, "tick report not serializable"),
            }
        } else {
            debug!(
                tick = report.tick,
                mean_r = self.summary.mean[0],
                mean_g = self.summary.mean[1],
                mean_b = self.summary.mean[2],
                total_us = report.timings.total_us,
                "frame"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::host::HostDevice;

    #[test]
    fn test_gray_pattern_is_mid_gray() {
        let img = render_pattern(SourcePattern::Gray, 8, 8, 3);
        assert!(img.as_bytes().chunks_exact(4).all(|p| p == [128, 128, 128, 255]));
    }

    #[test]
    fn test_checker_moves_with_tick() {
        let a = render_pattern(SourcePattern::Checker, 64, 32, 0);
        let b = render_pattern(SourcePattern::Checker, 64, 32, 8);
        assert_ne!(a.as_bytes(), b.as_bytes());
        let c = render_pattern(SourcePattern::Checker, 64, 32, 32);
        assert_eq!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_gradient_spans_range() {
        let img = render_pattern(SourcePattern::Gradient, 16, 16, 0);
        assert_eq!(img.pixel(0, 0)[0], 0.0);
        assert_eq!(img.pixel(15, 15)[0], 1.0);
        assert_eq!(img.pixel(15, 15)[1], 1.0);
    }

    #[test]
    fn test_single_pixel_patterns() {
        for p in [SourcePattern::Gray, SourcePattern::Gradient, SourcePattern::Checker] {
            let img = render_pattern(p, 1, 1, 7);
            assert_eq!(img.as_bytes().len(), 4);
        }
    }

    #[test]
    fn test_source_refresh_uploads() {
        let device = HostDevice::new();
        let mut source = SyntheticSource::new(&device, SourcePattern::Gray, 8, 8).unwrap();
        source.refresh(&device, 0).unwrap();
        let img = to_cpu_image(&device, source.frame(), PixelFormat::Rgba8).unwrap();
        assert_eq!(&img.as_bytes()[..4], &[128, 128, 128, 255]);
    }

    #[test]
    fn test_mean_rgba() {
        let img = CpuImage::uniform(4, 4, PixelFormat::Rgba8, [1.0, 0.0, 1.0, 1.0]);
        assert_eq!(mean_rgba(&img), [1.0, 0.0, 1.0, 1.0]);
    }
}
