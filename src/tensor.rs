//! Tensor bridge between HDR images and the network's `[1, H, W, 3]` layout.

use ndarray::{Array4, ArrayView4, ArrayViewD, Ix4};

use crate::error::{PipelineError, PipelineResult};
use crate::image::{CpuImage, PixelFormat};
use crate::resources::{LiveAllocation, ResourceKind, ResourceTracker};

/// Color channels carried by every tensor. Alpha never enters the network.
pub const TENSOR_CHANNELS: usize = 3;

/// Network input tensor, NHWC with N = 1.
///
/// Holds a tracked allocation for as long as it is alive.
#[derive(Debug)]
pub struct Tensor {
    data: Array4<f32>,
    _live: LiveAllocation,
}

impl Tensor {
    pub fn new(data: Array4<f32>, tracker: &ResourceTracker) -> Self {
        let bytes = data.len() * std::mem::size_of::<f32>();
        Self {
            data,
            _live: tracker.acquire(ResourceKind::Tensor, bytes),
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3]]
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }
}

/// Drop alpha and lay the image's RGB out as `[1, H, W, 3]`.
pub fn image_to_tensor(image: &CpuImage, tracker: &ResourceTracker) -> PipelineResult<Tensor> {
    if image.format().channels() < TENSOR_CHANNELS {
        return Err(PipelineError::UnsupportedChannelLayout(format!(
            "{:?} has {} channel(s), need {}",
            image.format(),
            image.format().channels(),
            TENSOR_CHANNELS
        )));
    }

    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut values = Vec::with_capacity(h * w * TENSOR_CHANNELS);
    for y in 0..image.height() {
        for x in 0..image.width() {
            let px = image.pixel(x, y);
            values.extend_from_slice(&px[..TENSOR_CHANNELS]);
        }
    }

    let data = Array4::from_shape_vec((1, h, w, TENSOR_CHANNELS), values)
        .map_err(|e| PipelineError::InvalidImage(e.to_string()))?;
    Ok(Tensor::new(data, tracker))
}

/// Rebuild an HDR RGBA image from a `[1, H, W, C]` tensor with opaque alpha.
///
/// `C >= 3` uses the first three channels, `C == 1` is replicated to gray.
pub fn tensor_to_image(
    tensor: ArrayViewD<'_, f32>,
    width: u32,
    height: u32,
) -> PipelineResult<CpuImage> {
    let (w, h) = (width as usize, height as usize);
    let shape = tensor.shape().to_vec();
    let mismatch = || PipelineError::ShapeMismatch {
        expected: vec![1, h, w, TENSOR_CHANNELS],
        actual: shape.clone(),
    };

    let t = tensor
        .into_dimensionality::<Ix4>()
        .map_err(|_| mismatch())?;
    let (n, th, tw, c) = t.dim();
    if n != 1 || th != h || tw != w {
        return Err(mismatch());
    }
    if c == 0 || c == 2 {
        return Err(PipelineError::UnsupportedChannelLayout(format!(
            "cannot build RGB from {} channel(s)",
            c
        )));
    }

    let mut image = CpuImage::new(width, height, PixelFormat::Rgba16F);
    for y in 0..h {
        for x in 0..w {
            let px = if c == 1 {
                let v = t[[0, y, x, 0]];
                [v, v, v, 1.0]
            } else {
                [t[[0, y, x, 0]], t[[0, y, x, 1]], t[[0, y, x, 2]], 1.0]
            };
            image.set_pixel(x as u32, y as u32, px);
        }
    }
    Ok(image)
}
