//! The wgpu kernel backend: data lifecycle, dispatch orchestration,
//! paging, and read coordination behind the `KernelBackend` contract.

use crate::codegen::{InputInfo, ShapeInfo};
use crate::config::BackendConfig;
use crate::context::{ContextOptions, GpuContext};
use crate::layout;
use crate::metrics::{MetricsSnapshot, WgpuMetrics};
use crate::pager::MemoryPager;
use crate::pending::PendingReads;
use crate::pool::{BufferPool, StorageKind};
use crate::program::{compile_kernel, make_kernel_key, validate_kernel, KernelCache};
use crate::programs;
use crate::storage::{
    from_transport_f32, merge_complex, to_transport_f32, ComplexParts, DataStorage, GpuStorage,
    StorageRecord, StorageUsage,
};
use anyhow::anyhow;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tensorloom_api::{
    BackendError, BackendFuture, DType, DataId, HostValues, KernelBackend, MemoryInfo, Program,
    ReadFuture, TensorHandle, TimingInfo,
};
use wgpu::util::DeviceExt;

#[derive(Default)]
struct TimerFrame {
    kernels: Vec<(String, f64)>,
    upload_ms: f64,
    download_ms: f64,
}

#[derive(Default)]
struct TimerStack {
    frames: Vec<TimerFrame>,
}

#[derive(Debug, Clone, Default)]
pub struct WgpuBackendOptions {
    pub context: ContextOptions,
    pub config: BackendConfig,
}

/// One input as the dispatch engine will bind it: either a small value
/// inlined as uniform data, or GPU-resident storage.
enum BoundInput {
    Uniform { values: Vec<f32>, info: ShapeInfo },
    Storage { buffer: Arc<wgpu::Buffer>, info: ShapeInfo },
}

impl BoundInput {
    fn info(&self) -> &ShapeInfo {
        match self {
            BoundInput::Uniform { info, .. } | BoundInput::Storage { info, .. } => info,
        }
    }
}

pub struct WgpuBackend {
    ctx: GpuContext,
    config: BackendConfig,
    storage: Mutex<DataStorage>,
    pool: BufferPool,
    pager: Mutex<MemoryPager>,
    pending: PendingReads,
    kernels: KernelCache,
    metrics: WgpuMetrics,
    timers: Mutex<TimerStack>,
    disposed: AtomicBool,
}

impl WgpuBackend {
    pub fn new(options: WgpuBackendOptions) -> anyhow::Result<Self> {
        let ctx = GpuContext::new(&options.context)?;
        let config = options.config;
        let budget = config.paging_enabled.then_some(config.paging_budget_bytes);
        Ok(Self {
            ctx,
            pager: Mutex::new(MemoryPager::new(budget)),
            config,
            storage: Mutex::new(DataStorage::new()),
            pool: BufferPool::new(),
            pending: PendingReads::new(),
            kernels: KernelCache::new(),
            metrics: WgpuMetrics::default(),
            timers: Mutex::new(TimerStack::default()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn with_defaults() -> anyhow::Result<Self> {
        Self::new(WgpuBackendOptions::default())
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.ctx.device
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn compile_count(&self) -> u64 {
        self.kernels.compile_count()
    }

    pub fn has_data(&self, id: DataId) -> bool {
        self.storage_guard().has(id)
    }

    pub fn num_data_ids(&self) -> usize {
        self.storage_guard().len()
    }

    /// Whether the id currently owns GPU storage.
    pub fn is_resident(&self, id: DataId) -> bool {
        self.pager_guard().is_resident(id)
    }

    fn storage_guard(&self) -> MutexGuard<'_, DataStorage> {
        self.storage.lock().expect("data storage poisoned")
    }

    fn pager_guard(&self) -> MutexGuard<'_, MemoryPager> {
        self.pager.lock().expect("memory pager poisoned")
    }

    fn note_upload_time(&self, ms: f64) {
        let mut timers = self.timers.lock().expect("timer stack poisoned");
        if let Some(frame) = timers.frames.last_mut() {
            frame.upload_ms += ms;
        }
    }

    fn note_download_time(&self, ms: f64) {
        let mut timers = self.timers.lock().expect("timer stack poisoned");
        if let Some(frame) = timers.frames.last_mut() {
            frame.download_ms += ms;
        }
    }

    fn note_kernel_time(&self, name: &str, ms: f64) {
        let mut timers = self.timers.lock().expect("timer stack poisoned");
        if let Some(frame) = timers.frames.last_mut() {
            frame.kernels.push((name.to_string(), ms));
        }
    }

    fn register_record(
        &self,
        id: DataId,
        shape: &[usize],
        dtype: DType,
    ) -> Result<(), BackendError> {
        self.storage_guard()
            .register(id, StorageRecord::new(shape.to_vec(), dtype))
    }

    fn write_record(&self, id: DataId, values: HostValues) -> Result<(), BackendError> {
        let released = {
            let mut storage = self.storage_guard();
            let record = storage.get_mut(id)?;
            if record.dtype == DType::Complex64 || values.dtype() != record.dtype {
                return Err(BackendError::UnsupportedWrite {
                    id,
                    dtype: values.dtype(),
                });
            }
            if values.len() != record.size() {
                return Err(BackendError::ShapeMismatch {
                    expected: record.shape.clone(),
                    actual: vec![values.len()],
                });
            }
            record.values = Some(values);
            record.usage = StorageUsage::Upload;
            record.gpu.take()
        };
        // A write makes the host copy authoritative; stale GPU storage goes
        // back to the pool.
        if let Some(gpu) = released {
            self.release_gpu_storage(id, gpu)?;
        }
        Ok(())
    }

    fn release_gpu_storage(&self, id: DataId, gpu: GpuStorage) -> Result<(), BackendError> {
        self.pool.release(gpu.buffer, gpu.phys_shape, gpu.kind)?;
        self.pager_guard().on_release(id);
        Ok(())
    }

    /// Make `id` GPU-resident: touch the LRU position when it already is,
    /// otherwise acquire pooled storage and upload any host values (after
    /// which the host copy is dropped).
    fn ensure_resident(&self, id: DataId) -> Result<(), BackendError> {
        let bytes = {
            let mut storage = self.storage_guard();
            let record = storage.get_mut(id)?;
            if record.gpu.is_some() {
                drop(storage);
                self.pager_guard().touch(id);
                return Ok(());
            }
            if matches!(record.dtype, DType::Complex64 | DType::Str) {
                return Err(BackendError::UnsupportedInputType {
                    id,
                    dtype: record.dtype,
                });
            }
            let (phys, kind) = if record.is_packed {
                (layout::packed_phys_shape(&record.shape), StorageKind::Packed)
            } else {
                (
                    layout::dense_phys_shape(&record.shape, self.config.max_storage_dim),
                    StorageKind::Dense,
                )
            };
            let (buffer, reused) =
                self.pool
                    .acquire(&self.ctx.device, phys, kind, "tensorloom-storage");
            self.metrics.record_pool_acquire(reused);
            if let Some(values) = record.values.take() {
                let start = Instant::now();
                let mut data = to_transport_f32(&values)?;
                if record.is_packed {
                    data = layout::pack_dense(&data, &record.shape);
                }
                self.ctx.write_f32(&buffer, &data);
                self.metrics.record_upload();
                self.note_upload_time(start.elapsed().as_secs_f64() * 1e3);
            }
            record.gpu = Some(GpuStorage {
                buffer,
                phys_shape: phys,
                kind,
            });
            record.gpu_bytes()
        };
        self.pager_guard().on_acquire(id, bytes);
        Ok(())
    }

    fn read_sync_impl(&self, id: DataId) -> Result<HostValues, BackendError> {
        enum Next {
            Complex(DataId, DataId),
            Download,
        }
        let next = {
            let storage = self.storage_guard();
            let record = storage.get(id)?;
            if let Some(values) = &record.values {
                return Ok(values.clone());
            }
            if let Some(parts) = &record.complex_parts {
                Next::Complex(parts.real.id, parts.imag.id)
            } else if record.gpu.is_some() {
                Next::Download
            } else {
                return Err(BackendError::NoData { id });
            }
        };
        match next {
            Next::Complex(real, imag) => {
                let real_values = self.read_sync_impl(real)?;
                let imag_values = self.read_sync_impl(imag)?;
                let merged = merge_complex(&real_values, &imag_values)?;
                self.storage_guard().get_mut(id)?.values = Some(merged.clone());
                Ok(merged)
            }
            Next::Download => self.download_and_cache(id),
        }
    }

    /// Blocking readback. Caches the values on the record and releases the
    /// GPU storage back to the pool (the lazy-release-to-CPU policy that
    /// also makes eviction-by-read free memory).
    fn download_and_cache(&self, id: DataId) -> Result<HostValues, BackendError> {
        let start = Instant::now();
        let (buffer, float_count, packed, shape, dtype) = {
            let storage = self.storage_guard();
            let record = storage.get(id)?;
            let gpu = record.gpu.as_ref().ok_or(BackendError::NoData { id })?;
            let float_count = if record.is_packed {
                gpu.phys_shape.num_elements() * 4
            } else {
                record.size()
            };
            (
                gpu.buffer.clone(),
                float_count,
                record.is_packed,
                record.shape.clone(),
                record.dtype,
            )
        };
        let data = self.ctx.read_f32(&buffer, float_count)?;
        self.metrics.record_download();
        let logical = if packed {
            layout::unpack_to_dense(&data, &shape)
        } else {
            data
        };
        let values = from_transport_f32(dtype, logical)?;
        let released = {
            let mut storage = self.storage_guard();
            let record = storage.get_mut(id)?;
            record.values = Some(values.clone());
            record.usage = StorageUsage::Download;
            record.is_packed = false;
            record.gpu.take()
        };
        if let Some(gpu) = released {
            self.release_gpu_storage(id, gpu)?;
        }
        self.note_download_time(start.elapsed().as_secs_f64() * 1e3);
        Ok(values)
    }

    fn dispose_now(&self, id: DataId) -> Result<(), BackendError> {
        let removed = {
            let mut storage = self.storage_guard();
            if !storage.has(id) {
                return Ok(());
            }
            let record = storage.get_mut(id)?;
            record.ref_count = record.ref_count.saturating_sub(1);
            if record.ref_count > 0 {
                return Ok(());
            }
            storage.remove(id)
        };
        if let Some(record) = removed {
            if let Some(gpu) = record.gpu {
                self.release_gpu_storage(id, gpu)?;
            }
            if let Some(parts) = record.complex_parts {
                self.dispose_now(parts.real.id)?;
                self.dispose_now(parts.imag.id)?;
            }
        }
        Ok(())
    }

    /// Evict least-recently-used residents until the pager is back under
    /// budget or runs out of unpinned candidates. Best-effort: exhaustion
    /// is logged, never an error.
    fn evict_until_under_budget(&self, pinned: &HashSet<DataId>) -> Result<(), BackendError> {
        loop {
            let candidate = {
                let pager = self.pager_guard();
                if !pager.over_budget() {
                    return Ok(());
                }
                pager.eviction_candidate(pinned)
            };
            let Some(id) = candidate else {
                log::debug!("paging: LRU queue exhausted while over budget");
                return Ok(());
            };
            log::debug!("paging: evicting {id} to host");
            let _ = self.read_sync_impl(id)?;
            if self.pager_guard().is_resident(id) {
                // The read found a cached host copy without touching the
                // GPU side; force the release so the loop advances.
                let released = self.storage_guard().get_mut(id)?.gpu.take();
                if let Some(gpu) = released {
                    self.release_gpu_storage(id, gpu)?;
                }
            }
            self.metrics.record_eviction();
        }
    }

    fn pack(&self, handle: &TensorHandle) -> anyhow::Result<TensorHandle> {
        let view3 = layout::shape_as_3d(&handle.shape).to_vec();
        let program = programs::pack_program(&handle.shape);
        let out = self.compile_and_run_impl(&program, &[handle.view(view3)], None, None, false)?;
        Ok(out.view(handle.shape.clone()))
    }

    fn unpack(&self, handle: &TensorHandle) -> anyhow::Result<TensorHandle> {
        let view3 = layout::shape_as_3d(&handle.shape).to_vec();
        let program = programs::unpack_program(&handle.shape);
        let out = self.compile_and_run_impl(&program, &[handle.view(view3)], None, None, false)?;
        Ok(out.view(handle.shape.clone()))
    }

    /// Rare correctness fallback: packed storage whose texel grid cannot
    /// serve the handle's logical view (the same tensor reshaped into
    /// distinct inputs of one expression). Read the value back, rebuild the
    /// record under the new view, and let the next upload lay it out fresh.
    fn rebuild_packed_storage(&self, handle: &TensorHandle) -> Result<(), BackendError> {
        log::debug!(
            "rebuilding packed storage for {} under view {:?}",
            handle.id,
            handle.shape
        );
        let _ = self.read_sync_impl(handle.id)?;
        let mut storage = self.storage_guard();
        let record = storage.get_mut(handle.id)?;
        record.shape = handle.shape.clone();
        record.is_packed = true;
        Ok(())
    }

    fn compile_and_run_impl(
        &self,
        program: &Program,
        inputs: &[TensorHandle],
        output: Option<TensorHandle>,
        custom_values: Option<&[f32]>,
        allow_paging: bool,
    ) -> anyhow::Result<TensorHandle> {
        if program.variable_names.len() != inputs.len() {
            return Err(BackendError::ShapeMismatch {
                expected: vec![program.variable_names.len()],
                actual: vec![inputs.len()],
            }
            .into());
        }

        // The paging check runs before this dispatch allocates anything, so
        // the freshly produced output is never an eviction candidate.
        if allow_paging && self.config.paging_enabled {
            let mut pinned: HashSet<DataId> = inputs.iter().map(|h| h.id).collect();
            if let Some(out) = &output {
                pinned.insert(out.id);
            }
            self.evict_until_under_budget(&pinned)?;
        }

        let out_handle = match output {
            Some(handle) => handle,
            None => {
                let id = DataId::next();
                let dtype = inputs.first().map(|h| h.dtype).unwrap_or(DType::Float32);
                self.register_record(id, &program.output_shape, dtype)?;
                TensorHandle::new(id, program.output_shape.clone(), dtype)
            }
        };

        // Empty outputs are legitimate results of shape computations; a
        // 0-sized GPU dispatch is not. Skip compilation entirely.
        if out_handle.size() == 0 {
            let mut storage = self.storage_guard();
            let record = storage.get_mut(out_handle.id)?;
            record.values = Some(HostValues::empty(out_handle.dtype));
            return Ok(out_handle);
        }

        let mut bound: Vec<BoundInput> = Vec::with_capacity(inputs.len());
        let mut temps: Vec<DataId> = Vec::new();
        for handle in inputs {
            enum Plan {
                Uniform(Vec<f32>),
                Storage,
            }
            let plan = {
                let mut storage = self.storage_guard();
                let record = storage.get_mut(handle.id)?;
                if matches!(record.dtype, DType::Complex64 | DType::Str) {
                    return Err(BackendError::UnsupportedInputType {
                        id: handle.id,
                        dtype: record.dtype,
                    }
                    .into());
                }
                if record.gpu.is_none() {
                    if !program.packed_inputs
                        && handle.size() <= self.config.uniform_threshold
                        && record.values.is_some()
                    {
                        // Small CPU-resident values skip the upload round
                        // trip and ride along as kernel constants.
                        let values = record.values.as_ref().expect("checked above");
                        Plan::Uniform(to_transport_f32(values)?)
                    } else {
                        if program.packed_inputs && !record.is_packed {
                            // First upload should already use packed layout
                            // rather than uploading dense and repacking.
                            record.is_packed = true;
                        }
                        Plan::Storage
                    }
                } else {
                    Plan::Storage
                }
            };
            match plan {
                Plan::Uniform(values) => bound.push(BoundInput::Uniform {
                    values,
                    info: ShapeInfo {
                        logical_shape: handle.shape.clone(),
                        phys_shape: None,
                        is_uniform: true,
                        is_packed: false,
                    },
                }),
                Plan::Storage => {
                    self.ensure_resident(handle.id)?;
                    let (is_packed, record_shape) = {
                        let storage = self.storage_guard();
                        let record = storage.get(handle.id)?;
                        (record.is_packed, record.shape.clone())
                    };
                    let mut actual = handle.clone();
                    if is_packed != program.packed_inputs {
                        // Packing mode is a property of physical storage,
                        // not of identity; reconcile per dispatch.
                        let converted = if is_packed {
                            self.unpack(&actual)?
                        } else {
                            self.pack(&actual)?
                        };
                        temps.push(converted.id);
                        actual = converted;
                    } else if is_packed
                        && record_shape != actual.shape
                        && !layout::is_reshape_free(&record_shape, &actual.shape)
                    {
                        self.rebuild_packed_storage(&actual)?;
                        self.ensure_resident(actual.id)?;
                    }
                    let (buffer, phys, packed) = {
                        let storage = self.storage_guard();
                        let record = storage.get(actual.id)?;
                        let gpu = record.gpu.as_ref().ok_or(BackendError::NoData {
                            id: actual.id,
                        })?;
                        (gpu.buffer.clone(), gpu.phys_shape, record.is_packed)
                    };
                    bound.push(BoundInput::Storage {
                        buffer,
                        info: ShapeInfo {
                            logical_shape: actual.shape.clone(),
                            phys_shape: Some(phys),
                            is_uniform: false,
                            is_packed: packed,
                        },
                    });
                }
            }
        }

        {
            let mut storage = self.storage_guard();
            let record = storage.get_mut(out_handle.id)?;
            record.is_packed = program.packed_output;
        }
        self.ensure_resident(out_handle.id)?;
        let (out_buffer, out_info) = {
            let storage = self.storage_guard();
            let record = storage.get(out_handle.id)?;
            let gpu = record.gpu.as_ref().ok_or(BackendError::NoData {
                id: out_handle.id,
            })?;
            (
                gpu.buffer.clone(),
                ShapeInfo {
                    logical_shape: out_handle.shape.clone(),
                    phys_shape: Some(gpu.phys_shape),
                    is_uniform: false,
                    is_packed: record.is_packed,
                },
            )
        };

        let input_infos: Vec<InputInfo> = program
            .variable_names
            .iter()
            .zip(bound.iter())
            .map(|(name, input)| InputInfo {
                name: name.clone(),
                shape_info: input.info().clone(),
            })
            .collect();

        let key = make_kernel_key(program, &input_infos, &out_info);
        let kernel = self.kernels.get_or_compile(&key, || {
            compile_kernel(
                &self.ctx.device,
                program,
                &input_infos,
                &out_info,
                self.config.workgroup_size,
            )
        })?;
        validate_kernel(&kernel, &input_infos, &out_info)?;

        let kernel_start = Instant::now();

        let mut uniform_buffers: Vec<wgpu::Buffer> = Vec::new();
        for input in &bound {
            if let BoundInput::Uniform { values, .. } = input {
                let mut padded = values.clone();
                let target = padded.len().div_ceil(4).max(1) * 4;
                padded.resize(target, 0.0);
                uniform_buffers.push(self.ctx.device.create_buffer_init(
                    &wgpu::util::BufferInitDescriptor {
                        label: Some("tensorloom-inlined-input"),
                        contents: bytemuck::cast_slice(&padded),
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    },
                ));
            }
        }
        let custom_buffer = if kernel.has_custom_uniforms {
            let values = custom_values.ok_or_else(|| {
                anyhow!(
                    "program '{}' declares custom uniforms but no values were supplied",
                    program.name
                )
            })?;
            let expected: usize = program.custom_uniforms.iter().map(|u| u.arity).sum();
            if values.len() != expected {
                return Err(BackendError::ShapeMismatch {
                    expected: vec![expected],
                    actual: vec![values.len()],
                }
                .into());
            }
            // Each declared uniform occupies one vec4 slot.
            let mut padded = Vec::with_capacity(program.custom_uniforms.len() * 4);
            let mut cursor = 0;
            for uniform in &program.custom_uniforms {
                let mut slot = [0.0f32; 4];
                slot[..uniform.arity].copy_from_slice(&values[cursor..cursor + uniform.arity]);
                cursor += uniform.arity;
                padded.extend_from_slice(&slot);
            }
            Some(self.ctx.device.create_buffer_init(
                &wgpu::util::BufferInitDescriptor {
                    label: Some("tensorloom-custom-uniforms"),
                    contents: bytemuck::cast_slice(&padded),
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                },
            ))
        } else {
            None
        };

        let mut entries: Vec<wgpu::BindGroupEntry> = Vec::with_capacity(bound.len() + 2);
        let mut uniform_cursor = 0;
        for (i, input) in bound.iter().enumerate() {
            let resource = match input {
                BoundInput::Uniform { .. } => {
                    let buffer = &uniform_buffers[uniform_cursor];
                    uniform_cursor += 1;
                    buffer.as_entire_binding()
                }
                BoundInput::Storage { buffer, .. } => buffer.as_ref().as_entire_binding(),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource,
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: bound.len() as u32,
            resource: out_buffer.as_ref().as_entire_binding(),
        });
        if let Some(buffer) = &custom_buffer {
            entries.push(wgpu::BindGroupEntry {
                binding: bound.len() as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("tensorloom-{}-bind", program.name)),
            layout: &kernel.layout,
            entries: &entries,
        });

        let mut encoder =
            self.ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(&format!("tensorloom-{}-encoder", program.name)),
                });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&format!("tensorloom-{}-pass", program.name)),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let wg = self.config.workgroup_size as usize;
            let groups = kernel.dispatch_elems.div_ceil(wg).max(1) as u32;
            pass.dispatch_workgroups(groups, 1, 1);
        }
        self.ctx.submit(encoder);
        self.metrics.record_dispatch();
        self.note_kernel_time(&program.name, kernel_start.elapsed().as_secs_f64() * 1e3);

        for temp in temps {
            self.dispose_now(temp)?;
        }

        // Downstream code that never opted into packing must not observe
        // packed storage.
        if out_info.is_packed && !program.is_packing_kernel && !self.config.lazy_unpack {
            let unpacked = self.unpack(&out_handle)?;
            self.dispose_now(out_handle.id)?;
            return Ok(unpacked);
        }

        Ok(out_handle)
    }

    /// Run a program with a fresh output, paging allowed.
    pub fn run_program(
        &self,
        program: &Program,
        inputs: &[TensorHandle],
    ) -> anyhow::Result<TensorHandle> {
        self.compile_and_run_impl(program, inputs, None, None, true)
    }

    /// Release every resource this backend holds. Safe to call twice; also
    /// runs on drop. Leaked records and in-flight reads indicate a caller
    /// bug and are warned about, never panicked on.
    pub fn dispose_backend(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let in_flight = self.pending.outstanding();
        if in_flight > 0 {
            log::warn!("disposing backend with {in_flight} reads still in flight");
        }
        let live = self.num_data_ids();
        if live > 0 {
            log::warn!("disposing backend with {live} live data ids; caller leaked tensors");
        }
        self.pool.dispose();
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        self.dispose_backend();
    }
}

impl KernelBackend for WgpuBackend {
    fn register(&self, id: DataId, shape: &[usize], dtype: DType) -> anyhow::Result<()> {
        Ok(self.register_record(id, shape, dtype)?)
    }

    fn write(&self, id: DataId, values: HostValues) -> anyhow::Result<()> {
        Ok(self.write_record(id, values)?)
    }

    fn write_complex_parts(
        &self,
        id: DataId,
        real: HostValues,
        imag: HostValues,
    ) -> anyhow::Result<()> {
        let shape = {
            let storage = self.storage_guard();
            let record = storage.get(id)?;
            if record.dtype != DType::Complex64 {
                return Err(BackendError::UnsupportedWrite {
                    id,
                    dtype: record.dtype,
                }
                .into());
            }
            if real.len() != record.size() || imag.len() != record.size() {
                return Err(BackendError::ShapeMismatch {
                    expected: record.shape.clone(),
                    actual: vec![real.len(), imag.len()],
                }
                .into());
            }
            record.shape.clone()
        };
        let real_handle = TensorHandle::new(DataId::next(), shape.clone(), DType::Float32);
        let imag_handle = TensorHandle::new(DataId::next(), shape.clone(), DType::Float32);
        self.register_record(real_handle.id, &shape, DType::Float32)?;
        self.register_record(imag_handle.id, &shape, DType::Float32)?;
        self.write_record(real_handle.id, real)?;
        self.write_record(imag_handle.id, imag)?;
        let previous = {
            let mut storage = self.storage_guard();
            let record = storage.get_mut(id)?;
            record.complex_parts.replace(ComplexParts {
                real: real_handle,
                imag: imag_handle,
            })
        };
        if let Some(parts) = previous {
            self.dispose_now(parts.real.id)?;
            self.dispose_now(parts.imag.id)?;
        }
        Ok(())
    }

    fn read_sync(&self, id: DataId) -> anyhow::Result<HostValues> {
        Ok(self.read_sync_impl(id)?)
    }

    fn read(&self, id: DataId) -> ReadFuture<'_> {
        if !self.pending.begin(id) {
            let receiver = self.pending.subscribe(id);
            return Box::pin(async move {
                receiver
                    .await
                    .map_err(|_| anyhow!("in-flight read of {id} was abandoned"))
            });
        }
        Box::pin(async move {
            match self.read_sync_impl(id) {
                Ok(values) => {
                    let deferred = self.pending.complete(id, &values);
                    if deferred {
                        self.dispose_now(id)?;
                    }
                    Ok(values)
                }
                Err(err) => {
                    self.pending.fail(id);
                    Err(err.into())
                }
            }
        })
    }

    fn dispose(&self, id: DataId) -> anyhow::Result<()> {
        if self.pending.is_pending(id) {
            // Never free storage out from under an in-flight read.
            self.pending.mark_deferred_disposal(id);
            return Ok(());
        }
        Ok(self.dispose_now(id)?)
    }

    fn compile_and_run(
        &self,
        program: &Program,
        inputs: &[TensorHandle],
        output: Option<TensorHandle>,
        custom_values: Option<&[f32]>,
        allow_paging: bool,
    ) -> anyhow::Result<TensorHandle> {
        self.compile_and_run_impl(program, inputs, output, custom_values, allow_paging)
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            resident_bytes: self.pager_guard().resident_bytes(),
            reliable: true,
        }
    }

    fn time<'a>(
        &'a self,
        f: &'a mut dyn FnMut() -> anyhow::Result<()>,
    ) -> BackendFuture<'a, TimingInfo> {
        self.timers
            .lock()
            .expect("timer stack poisoned")
            .frames
            .push(TimerFrame::default());
        let wall_start = Instant::now();
        let result = f();
        let wall_ms = wall_start.elapsed().as_secs_f64() * 1e3;
        let frame = self
            .timers
            .lock()
            .expect("timer stack poisoned")
            .frames
            .pop()
            .unwrap_or_default();
        let info = TimingInfo {
            upload_wait_ms: frame.upload_ms,
            download_wait_ms: frame.download_ms,
            kernel_ms: frame.kernels.iter().map(|(_, ms)| ms).sum(),
            wall_ms,
        };
        Box::pin(async move {
            result?;
            Ok(info)
        })
    }
}
