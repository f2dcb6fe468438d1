//! Kernel compilation, keying, and memoization.
//!
//! The cache key folds in everything the generated source bakes in:
//! program identity, body text, packing flags, and each tensor's logical
//! shape plus physical shape (or a uniform marker). Two calls that agree
//! on the key are therefore guaranteed layout-compatible; a disagreement
//! detected at run time is a fatal `ShapeMismatch`, because it means the
//! key construction lost information.

use crate::bindings::{storage_read_entry, storage_read_write_entry, uniform_entry};
use crate::codegen::{self, InputInfo, ShapeInfo};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tensorloom_api::{BackendError, Program};

pub struct CompiledKernel {
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
    pub source: String,
    pub in_shape_infos: Vec<ShapeInfo>,
    pub out_shape_info: ShapeInfo,
    /// Threads the kernel guards against; dispatch size derives from this.
    pub dispatch_elems: usize,
    pub has_custom_uniforms: bool,
}

fn shape_fragment(key: &mut String, info: &ShapeInfo) {
    let _ = write!(key, "{:?}_", info.logical_shape);
    match info.phys_shape {
        Some(phys) => {
            let _ = write!(key, "{}x{}", phys.rows, phys.cols);
        }
        None => key.push_str("uniform"),
    }
    let _ = write!(key, "_{}|", u8::from(info.is_packed));
}

pub fn make_kernel_key(program: &Program, inputs: &[InputInfo], output: &ShapeInfo) -> String {
    let mut key = format!(
        "{}_{}{}_",
        program.name,
        u8::from(program.packed_inputs),
        u8::from(program.packed_output)
    );
    for input in inputs {
        shape_fragment(&mut key, &input.shape_info);
    }
    shape_fragment(&mut key, output);
    key.push('_');
    key.push_str(&program.body);
    key
}

/// Generate the shader, build the bind group layout matching the binding
/// order the generator emits, and create the compute pipeline.
pub fn compile_kernel(
    device: &wgpu::Device,
    program: &Program,
    inputs: &[InputInfo],
    output: &ShapeInfo,
    workgroup_size: u32,
) -> Result<CompiledKernel, BackendError> {
    let source = codegen::make_shader(inputs, output, program, workgroup_size)?;

    let mut entries = Vec::with_capacity(inputs.len() + 2);
    for (i, input) in inputs.iter().enumerate() {
        if input.shape_info.is_uniform {
            entries.push(uniform_entry(i as u32));
        } else {
            entries.push(storage_read_entry(i as u32));
        }
    }
    entries.push(storage_read_write_entry(inputs.len() as u32));
    let has_custom_uniforms = !program.custom_uniforms.is_empty();
    if has_custom_uniforms {
        entries.push(uniform_entry(inputs.len() as u32 + 1));
    }

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&format!("tensorloom-{}-layout", program.name)),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("tensorloom-{}-pipeline-layout", program.name)),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&format!("tensorloom-{}-shader", program.name)),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&source)),
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&format!("tensorloom-{}-pipeline", program.name)),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: "main",
    });

    Ok(CompiledKernel {
        pipeline,
        layout,
        dispatch_elems: codegen::dispatch_elems(output),
        source,
        in_shape_infos: inputs.iter().map(|i| i.shape_info.clone()).collect(),
        out_shape_info: output.clone(),
        has_custom_uniforms,
    })
}

/// Reuse guard: the cached kernel's recorded shapes must match the call's.
pub fn validate_kernel(
    kernel: &CompiledKernel,
    inputs: &[InputInfo],
    output: &ShapeInfo,
) -> Result<(), BackendError> {
    if kernel.in_shape_infos.len() != inputs.len() {
        return Err(BackendError::ShapeMismatch {
            expected: vec![kernel.in_shape_infos.len()],
            actual: vec![inputs.len()],
        });
    }
    for (recorded, input) in kernel.in_shape_infos.iter().zip(inputs) {
        if *recorded != input.shape_info {
            return Err(BackendError::ShapeMismatch {
                expected: recorded.logical_shape.clone(),
                actual: input.shape_info.logical_shape.clone(),
            });
        }
    }
    if kernel.out_shape_info != *output {
        return Err(BackendError::ShapeMismatch {
            expected: kernel.out_shape_info.logical_shape.clone(),
            actual: output.logical_shape.clone(),
        });
    }
    Ok(())
}

/// Memoized compiled kernels, one entry per key, never evicted: the set of
/// distinct (program x shape-class) combinations is small relative to the
/// number of dispatches.
pub struct KernelCache {
    kernels: Mutex<HashMap<String, Arc<CompiledKernel>>>,
    compiles: AtomicU64,
}

impl KernelCache {
    pub fn new() -> Self {
        Self {
            kernels: Mutex::new(HashMap::new()),
            compiles: AtomicU64::new(0),
        }
    }

    pub fn get_or_compile<F>(&self, key: &str, compile: F) -> Result<Arc<CompiledKernel>, BackendError>
    where
        F: FnOnce() -> Result<CompiledKernel, BackendError>,
    {
        if let Some(kernel) = self
            .kernels
            .lock()
            .expect("kernel cache poisoned")
            .get(key)
            .cloned()
        {
            log::debug!("kernel_cache hit: {key}");
            return Ok(kernel);
        }
        let kernel = Arc::new(compile()?);
        self.compiles.fetch_add(1, Ordering::Relaxed);
        log::debug!("kernel_cache miss, compiled: {key}");
        self.kernels
            .lock()
            .expect("kernel cache poisoned")
            .insert(key.to_string(), kernel.clone());
        Ok(kernel)
    }

    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.kernels.lock().expect("kernel cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new()
    }
}
