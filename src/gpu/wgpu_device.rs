//! wgpu implementation of [`ComputeDevice`].
//!
//! Frames are 2D textures. Both transforms share one bind group layout:
//! binding 0 is `Result` (rgba16float storage texture, write-only), binding 1
//! is `InputImage` (sampled float texture read with `textureLoad`). A fresh
//! bind group is built for every dispatch.

use std::collections::HashMap;

use tracing::{debug, error, info};

use super::{check_upload, Bindings, ComputeDevice, FrameHandle};
use super::{TRANSFORM_INPUT, TRANSFORM_OUTPUT};
use crate::error::{PipelineError, PipelineResult};
use crate::image::{CpuImage, FrameDesc, PixelFormat};
use crate::resources::{LiveAllocation, ResourceKind, ResourceTracker};

/// Built-in transform program.
pub const STYLE_TRANSFER_WGSL: &str = include_str!("shaders/style_transfer.wgsl");

/// wgpu requires buffer rows in texture copies to be aligned to this.
const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Rgba16F => wgpu::TextureFormat::Rgba16Float,
        PixelFormat::Gray8 => wgpu::TextureFormat::R8Unorm,
    }
}

#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

pub struct WgpuFrame {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: FrameDesc,
    _live: LiveAllocation,
}

impl FrameHandle for WgpuFrame {
    fn desc(&self) -> FrameDesc {
        self.desc
    }
}

impl WgpuFrame {
    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.desc.width,
            height: self.desc.height,
            depth_or_array_layers: 1,
        }
    }

    fn copy_target(&self) -> wgpu::ImageCopyTexture<'_> {
        wgpu::ImageCopyTexture {
            texture: &self.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        }
    }
}

/// Field order matters: `_instance` is dropped after `device` and `queue`.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    layout: wgpu::BindGroupLayout,
    pipelines: HashMap<&'static str, wgpu::ComputePipeline>,
    tracker: ResourceTracker,
    _instance: wgpu::Instance,
}

impl WgpuDevice {
    /// Open the first high-performance adapter and build both transforms from
    /// `shader_source` (the built-in program when `None`).
    pub fn new(shader_source: Option<&str>) -> PipelineResult<Self> {
        pollster::block_on(Self::init_async(
            shader_source.unwrap_or(STYLE_TRANSFER_WGSL),
        ))
    }

    async fn init_async(shader_source: &str) -> PipelineResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| PipelineError::Device("no suitable GPU adapter".into()))?;

        let adapter_info = adapter.get_info();
        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            device_type = ?adapter_info.device_type,
            "GPU adapter selected"
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("stylecam"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| PipelineError::Device(format!("failed to create GPU device: {}", e)))?;

        device.on_uncaptured_error(Box::new(|e| {
            error!(error = %e, "uncaptured wgpu error");
        }));

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("style_transfer"),
            source: wgpu::ShaderSource::Wgsl(shader_source.into()),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("transform_bind_group_layout"),
            entries: &[
                // Result
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::Rgba16Float,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                // InputImage
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("transform_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let mut pipelines = HashMap::new();
        for name in [TRANSFORM_INPUT, TRANSFORM_OUTPUT] {
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: name,
                compilation_options: Default::default(),
                cache: None,
            });
            pipelines.insert(name, pipeline);
        }

        if let Some(err) = device.pop_error_scope().await {
            return Err(PipelineError::Device(format!(
                "transform program rejected: {}",
                err
            )));
        }

        Ok(Self {
            device,
            queue,
            adapter_info,
            layout,
            pipelines,
            tracker: ResourceTracker::new(),
            _instance: instance,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_info.name
    }
}

impl ComputeDevice for WgpuDevice {
    type Frame = WgpuFrame;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    fn allocate(&self, desc: FrameDesc) -> PipelineResult<WgpuFrame> {
        if desc.random_write && desc.format == PixelFormat::Gray8 {
            return Err(PipelineError::Device(
                "Gray8 frames cannot be bound for random write".into(),
            ));
        }

        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC;
        if desc.random_write {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame"),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.format),
            usage,
            view_formats: &[],
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(PipelineError::Device(format!(
                "failed to allocate {}x{} frame: {}",
                desc.width, desc.height, err
            )));
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(WgpuFrame {
            texture,
            view,
            desc,
            _live: self.tracker.acquire(ResourceKind::Frame, desc.byte_len()),
        })
    }

    fn upload(&self, frame: &WgpuFrame, image: &CpuImage) -> PipelineResult<()> {
        check_upload(frame.desc, image)?;
        let bytes_per_row = frame.desc.width * frame.desc.format.bytes_per_pixel() as u32;
        self.queue.write_texture(
            frame.copy_target(),
            image.as_bytes(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(frame.desc.height),
            },
            frame.extent(),
        );
        Ok(())
    }

    fn read_back(&self, frame: &WgpuFrame) -> PipelineResult<Vec<u8>> {
        let row_bytes = frame.desc.width * frame.desc.format.bytes_per_pixel() as u32;
        let padded_row = align_to(row_bytes, COPY_ALIGNMENT);
        let height = frame.desc.height;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame_readback"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame_readback"),
            });
        encoder.copy_texture_to_buffer(
            frame.copy_target(),
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            frame.extent(),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| PipelineError::Device("readback map callback never fired".into()))?
            .map_err(|e| PipelineError::Device(format!("failed to map readback buffer: {}", e)))?;

        let mapped = slice.get_mapped_range();
        let mut out = Vec::with_capacity(row_bytes as usize * height as usize);
        for row in mapped.chunks(padded_row as usize).take(height as usize) {
            out.extend_from_slice(&row[..row_bytes as usize]);
        }
        drop(mapped);
        staging.unmap();

        Ok(out)
    }

    fn has_transform(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    fn dispatch(
        &self,
        transform: &str,
        bindings: &Bindings<'_, WgpuFrame>,
        groups: [u32; 3],
    ) -> PipelineResult<()> {
        let pipeline = self
            .pipelines
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

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(transform),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&result.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&input.view),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(transform),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(transform),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(PipelineError::dispatch(transform, err.to_string()));
        }

        debug!(transform, ?groups, "wgpu dispatch submitted");
        Ok(())
    }

    fn synchronize(&self) -> PipelineResult<()> {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{SLOT_INPUT_IMAGE, SLOT_RESULT};

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(100, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(250 * 8, 256), 2048);
    }

    #[test]
    fn test_builtin_program_validates() {
        let module = naga::front::wgsl::parse_str(STYLE_TRANSFER_WGSL)
            .unwrap_or_else(|e| panic!("parse failed: {:?}", e));
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap_or_else(|e| panic!("validation failed: {:?}", e));

        let entry_points: Vec<_> = module.entry_points.iter().map(|e| e.name.as_str()).collect();
        assert!(entry_points.contains(&TRANSFORM_INPUT));
        assert!(entry_points.contains(&TRANSFORM_OUTPUT));
    }

    #[test]
    fn test_round_trip_on_adapter() {
        // Requires a GPU; skipped when none is present.
        let device = match WgpuDevice::new(None) {
            Ok(device) => device,
            Err(e) => {
                println!("Skipping test (no GPU): {}", e);
                return;
            }
        };

        let src = device
            .allocate(FrameDesc::new(40, 24, PixelFormat::Rgba8))
            .unwrap();
        let dst = device
            .allocate(FrameDesc::new(40, 24, PixelFormat::Rgba16F).with_random_write())
            .unwrap();
        let gray = CpuImage::uniform(40, 24, PixelFormat::Rgba8, [0.5, 0.5, 0.5, 1.0]);
        device.upload(&src, &gray).unwrap();

        let mut bindings = Bindings::new();
        bindings
            .bind(SLOT_RESULT, &dst)
            .unwrap()
            .bind(SLOT_INPUT_IMAGE, &src)
            .unwrap();
        device.dispatch(TRANSFORM_INPUT, &bindings, [5, 3, 1]).unwrap();
        device.synchronize().unwrap();

        let out = CpuImage::from_raw(40, 24, PixelFormat::Rgba16F, device.read_back(&dst).unwrap())
            .unwrap();
        assert_eq!(out.pixel(39, 23), [128.0, 128.0, 128.0, 1.0]);
    }
}
