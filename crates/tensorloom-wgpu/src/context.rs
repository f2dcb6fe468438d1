//! Thin wrapper around the wgpu device/queue pair.
//!
//! Owns adapter/device acquisition (capability failures surface here, at
//! construction), synchronous submission, and the staging-buffer readback
//! path. Everything above this layer deals in pooled storage buffers.

use bytemuck::cast_slice;
use pollster::block_on;
use std::sync::mpsc;
use tensorloom_api::BackendError;

#[derive(Clone, Debug)]
pub struct ContextOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: wgpu::AdapterInfo,
    pub limits: wgpu::Limits,
}

impl GpuContext {
    pub fn new(opts: &ContextOptions) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::default();
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: opts.power_preference,
            force_fallback_adapter: opts.force_fallback_adapter,
            compatible_surface: None,
        }))
        .ok_or_else(|| BackendError::Capability("no compatible GPU adapter found".into()))?;

        let limits = adapter.limits();
        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("TensorLoom Device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
            },
            None,
        ))
        .map_err(|e| BackendError::Capability(format!("device request failed: {e}")))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "tensorloom: using adapter '{}' ({:?})",
            adapter_info.name,
            adapter_info.backend
        );

        Ok(Self {
            device,
            queue,
            adapter_info,
            limits,
        })
    }

    /// Submit a finished encoder and block until the queue drains. Kernel
    /// dispatch stays synchronous from the caller's perspective; only
    /// explicit reads expose asynchrony.
    pub fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(Some(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
    }

    pub fn write_f32(&self, buffer: &wgpu::Buffer, data: &[f32]) {
        if !data.is_empty() {
            self.queue.write_buffer(buffer, 0, cast_slice(data));
        }
    }

    /// Copy `float_count` f32 values out of `buffer` through a staging
    /// buffer. Blocks on the map fence.
    pub fn read_f32(
        &self,
        buffer: &wgpu::Buffer,
        float_count: usize,
    ) -> Result<Vec<f32>, BackendError> {
        if float_count == 0 {
            return Ok(Vec::new());
        }
        let size_bytes = (float_count * 4) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tensorloom-download-staging"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tensorloom-download-encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size_bytes);
        self.submit(encoder);

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| BackendError::Capability("map_async callback dropped".into()))?
            .map_err(|e| BackendError::Capability(format!("buffer map failed: {e:?}")))?;
        let data = slice.get_mapped_range();
        let out: Vec<f32> = cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }
}
