//! Backend-level tests. Every test constructs its own backend and skips
//! gracefully on machines without a usable GPU adapter.

use num_complex::Complex;
use tensorloom_api::{
    BackendError, DType, DataId, HostValues, KernelBackend, Program, TensorHandle,
};
use tensorloom_wgpu::pool::{BufferPool, StorageKind};
use tensorloom_wgpu::programs::{binary_program, fill_program, pack_program, unary_program};
use tensorloom_wgpu::{BackendConfig, ContextOptions, WgpuBackend, WgpuBackendOptions};

fn backend_with(config: BackendConfig) -> Option<WgpuBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    match WgpuBackend::new(WgpuBackendOptions {
        context: ContextOptions::default(),
        config,
    }) {
        Ok(backend) => Some(backend),
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
    }
}

fn backend() -> Option<WgpuBackend> {
    backend_with(BackendConfig::default())
}

fn make_tensor(backend: &WgpuBackend, shape: &[usize], values: HostValues) -> TensorHandle {
    let id = DataId::next();
    let dtype = values.dtype();
    backend.register(id, shape, dtype).unwrap();
    backend.write(id, values).unwrap();
    TensorHandle::new(id, shape.to_vec(), dtype)
}

fn f32s(values: &HostValues) -> &[f32] {
    match values {
        HostValues::F32(v) => v,
        other => panic!("expected f32 values, got {:?}", other.dtype()),
    }
}

#[test]
fn register_twice_fails_with_already_registered() {
    let Some(backend) = backend() else { return };
    let id = DataId::next();
    backend.register(id, &[3], DType::Float32).unwrap();
    let err = backend.register(id, &[3], DType::Float32).unwrap_err();
    assert_eq!(
        err.downcast_ref::<BackendError>(),
        Some(&BackendError::AlreadyRegistered { id })
    );
}

#[test]
fn write_then_read_sync_round_trips_on_the_host() {
    // Scenario A: register, write, readSync without any GPU traffic.
    let Some(backend) = backend() else { return };
    let t1 = make_tensor(&backend, &[3], HostValues::F32(vec![1.0, 2.0, 3.0]));
    let before = backend.metrics_snapshot();
    assert_eq!(
        backend.read_sync(t1.id).unwrap(),
        HostValues::F32(vec![1.0, 2.0, 3.0])
    );
    let after = backend.metrics_snapshot();
    assert_eq!(after.downloads, before.downloads);
}

#[test]
fn gpu_round_trip_preserves_every_dtype() {
    let Some(backend) = backend() else { return };
    let cases = vec![
        HostValues::F32(vec![0.5, -1.25, 3.75, 0.0, 9.0, -2.5, 1.0, 8.125]),
        HostValues::I32(vec![-3, 0, 7, 1_000_000, 42, -9, 5, 11]),
        HostValues::Bool(vec![0, 1, 1, 0, 1, 0, 0, 1]),
    ];
    for values in cases {
        let input = make_tensor(&backend, &[8], values.clone());
        let identity = unary_program("identity", "x", &[8], false);
        let out = backend.run_program(&identity, &[input.clone()]).unwrap();
        assert_eq!(out.dtype, values.dtype());
        assert_eq!(backend.read_sync(out.id).unwrap(), values);
        backend.dispose(input.id).unwrap();
        backend.dispose(out.id).unwrap();
    }
}

#[test]
fn small_cpu_inputs_ride_as_uniforms() {
    // Scenario B: two [2,2] inputs at the uniform threshold never touch the
    // buffer pool; only the output allocates storage.
    let Some(backend) = backend() else { return };
    let a = make_tensor(&backend, &[2, 2], HostValues::F32(vec![1.0, 2.0, 3.0, 4.0]));
    let b = make_tensor(&backend, &[2, 2], HostValues::F32(vec![10.0, 20.0, 30.0, 40.0]));
    let before = backend.metrics_snapshot();
    let add = binary_program("add", "a + b", &[2, 2], false);
    let out = backend.run_program(&add, &[a.clone(), b.clone()]).unwrap();
    let after = backend.metrics_snapshot();
    assert_eq!(after.pool_acquires - before.pool_acquires, 1);
    assert_eq!(after.uploads, before.uploads);
    assert!(!backend.is_resident(a.id));
    assert!(!backend.is_resident(b.id));
    assert_eq!(
        backend.read_sync(out.id).unwrap(),
        HostValues::F32(vec![11.0, 22.0, 33.0, 44.0])
    );
}

#[test]
fn identical_dispatches_compile_exactly_once() {
    let Some(backend) = backend() else { return };
    let add = binary_program("add", "a + b", &[2, 2], false);
    let before = backend.compile_count();
    for _ in 0..3 {
        let a = make_tensor(&backend, &[2, 2], HostValues::F32(vec![1.0; 4]));
        let b = make_tensor(&backend, &[2, 2], HostValues::F32(vec![2.0; 4]));
        let out = backend.run_program(&add, &[a.clone(), b.clone()]).unwrap();
        assert_eq!(backend.read_sync(out.id).unwrap(), HostValues::F32(vec![3.0; 4]));
        for id in [a.id, b.id, out.id] {
            backend.dispose(id).unwrap();
        }
    }
    assert_eq!(backend.compile_count() - before, 1);
}

#[test]
fn zero_sized_outputs_skip_compilation_and_dispatch() {
    let Some(backend) = backend() else { return };
    let before_compiles = backend.compile_count();
    let before = backend.metrics_snapshot();
    let program = Program::new("empty", vec![], vec![0, 4], "fn run() {\n}\n");
    let out = backend.run_program(&program, &[]).unwrap();
    assert_eq!(backend.compile_count(), before_compiles);
    assert_eq!(backend.metrics_snapshot().dispatches, before.dispatches);
    let values = backend.read_sync(out.id).unwrap();
    assert_eq!(values, HostValues::F32(vec![]));
}

#[test]
fn concurrent_reads_coalesce_onto_one_readback() {
    let Some(backend) = backend() else { return };
    let input = make_tensor(&backend, &[8], HostValues::F32((0..8).map(|v| v as f32).collect()));
    let double = unary_program("double", "x * 2.0", &[8], false);
    let out = backend.run_program(&double, &[input.clone()]).unwrap();

    let before = backend.metrics_snapshot();
    let first = backend.read(out.id);
    let second = backend.read(out.id);
    let (first, second) = pollster::block_on(async { futures::join!(first, second) });
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first, second);
    assert_eq!(f32s(&first), &[0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0]);
    let after = backend.metrics_snapshot();
    assert_eq!(after.downloads - before.downloads, 1);
}

#[test]
fn disposal_during_pending_read_is_deferred() {
    let Some(backend) = backend() else { return };
    let input = make_tensor(&backend, &[8], HostValues::F32(vec![1.0; 8]));
    let identity = unary_program("identity", "x", &[8], false);
    let out = backend.run_program(&identity, &[input.clone()]).unwrap();

    let pending = backend.read(out.id);
    backend.dispose(out.id).unwrap();
    // The record must survive until the in-flight read resolves.
    assert!(backend.has_data(out.id));
    let values = pollster::block_on(pending).unwrap();
    assert_eq!(values, HostValues::F32(vec![1.0; 8]));
    assert!(!backend.has_data(out.id));
}

#[test]
fn pool_recycles_exact_shape_matches() {
    let Some(backend) = backend() else { return };
    let pool = BufferPool::new();
    let shape = tensorloom_wgpu::layout::PhysShape::new(16, 16);
    let (first, reused) = pool.acquire(backend.device(), shape, StorageKind::Dense, "test");
    assert!(!reused);
    let first_id = first.global_id();
    pool.release(first, shape, StorageKind::Dense).unwrap();
    let (second, reused) = pool.acquire(backend.device(), shape, StorageKind::Dense, "test");
    assert!(reused);
    assert_eq!(second.global_id(), first_id);

    // A different shape must not recycle the parked buffer.
    let other = tensorloom_wgpu::layout::PhysShape::new(8, 8);
    let (_, reused) = pool.acquire(backend.device(), other, StorageKind::Dense, "test");
    assert!(!reused);
}

#[test]
fn releasing_a_foreign_buffer_fails_with_not_owned() {
    let Some(backend) = backend() else { return };
    let pool = BufferPool::new();
    let foreign = std::sync::Arc::new(backend.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some("foreign"),
        size: 64,
        usage: wgpu::BufferUsages::STORAGE,
        mapped_at_creation: false,
    }));
    let shape = tensorloom_wgpu::layout::PhysShape::new(4, 4);
    let err = pool.release(foreign, shape, StorageKind::Dense).unwrap_err();
    assert_eq!(err, BackendError::NotOwned);
}

#[test]
fn paging_evicts_least_recently_used_resident() {
    // Scenario C: budget of exactly one [100,100] f32 tensor; the third
    // dispatch evicts the first, leaving the two most recent resident.
    let tensor_bytes = 100 * 100 * 4;
    let config = BackendConfig {
        paging_enabled: true,
        paging_budget_bytes: tensor_bytes,
        ..BackendConfig::default()
    };
    let Some(backend) = backend_with(config) else { return };

    let fill = fill_program(&[100, 100]);
    let mut outs = Vec::new();
    for k in 1..=3 {
        let seed = make_tensor(&backend, &[1], HostValues::F32(vec![k as f32]));
        outs.push(backend.run_program(&fill, &[seed]).unwrap());
    }

    let snapshot = backend.metrics_snapshot();
    assert_eq!(snapshot.evictions, 1);
    assert!(!backend.is_resident(outs[0].id));
    assert!(backend.is_resident(outs[1].id));
    assert!(backend.is_resident(outs[2].id));
    assert_eq!(backend.memory_info().resident_bytes, 2 * tensor_bytes);

    // The evicted tensor's values were paged to the host and stay intact.
    let before = backend.metrics_snapshot();
    let values = backend.read_sync(outs[0].id).unwrap();
    assert!(f32s(&values).iter().all(|&v| v == 1.0));
    assert_eq!(backend.metrics_snapshot().downloads, before.downloads);
}

#[test]
fn packed_kernels_round_trip_through_auto_unpack() {
    let Some(backend) = backend() else { return };
    let values: Vec<f32> = (0..15).map(|v| v as f32).collect();
    let input = make_tensor(&backend, &[1, 3, 5], HostValues::F32(values.clone()));
    let double = unary_program("double", "x * 2.0", &[1, 3, 5], true);
    let out = backend.run_program(&double, &[input.clone()]).unwrap();
    // The packed result is implicitly unpacked before being handed back.
    let expected: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
    assert_eq!(f32s(&backend.read_sync(out.id).unwrap()), &expected[..]);
}

#[test]
fn pack_program_output_reads_back_in_logical_order() {
    let Some(backend) = backend() else { return };
    let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let input = make_tensor(&backend, &[3, 4], HostValues::F32(values.clone()));
    let pack = pack_program(&[3, 4]);
    let packed = backend
        .run_program(&pack, &[input.view(vec![1, 3, 4])])
        .unwrap();
    assert_eq!(f32s(&backend.read_sync(packed.id).unwrap()), &values[..]);
}

#[test]
fn incompatible_packed_view_falls_back_to_cpu_rebuild() {
    let Some(backend) = backend() else { return };
    let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let input = make_tensor(&backend, &[2, 6], HostValues::F32(values.clone()));

    // First dispatch uploads the tensor packed under its [2, 6] layout.
    let double_a = unary_program("double", "x * 2.0", &[1, 2, 6], true);
    let first = backend
        .run_program(&double_a, &[input.view(vec![1, 2, 6])])
        .unwrap();
    assert_eq!(
        f32s(&backend.read_sync(first.id).unwrap()),
        &values.iter().map(|v| v * 2.0).collect::<Vec<_>>()[..]
    );
    assert!(backend.is_resident(input.id));

    // Reusing the same identity under a block-incompatible [3, 4] view
    // forces the CPU round-trip rebuild and must still be correct.
    let double_b = unary_program("double", "x * 2.0", &[3, 4], true);
    let second = backend
        .run_program(&double_b, &[input.view(vec![3, 4])])
        .unwrap();
    assert_eq!(
        f32s(&backend.read_sync(second.id).unwrap()),
        &values.iter().map(|v| v * 2.0).collect::<Vec<_>>()[..]
    );
}

#[test]
fn non_broadcastable_shapes_fail_before_any_dispatch() {
    let Some(backend) = backend() else { return };
    let a = make_tensor(&backend, &[2, 4], HostValues::F32(vec![0.0; 8]));
    let b = make_tensor(&backend, &[3, 4], HostValues::F32(vec![0.0; 12]));
    let before = backend.metrics_snapshot();
    let add = binary_program("add", "a + b", &[3, 4], false);
    let err = backend.run_program(&add, &[a, b]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackendError>(),
        Some(BackendError::BroadcastError { .. })
    ));
    assert_eq!(backend.metrics_snapshot().dispatches, before.dispatches);
}

#[test]
fn rank_above_six_is_rejected() {
    let Some(backend) = backend() else { return };
    let shape = vec![2usize; 7];
    let input = make_tensor(&backend, &shape, HostValues::F32(vec![0.0; 128]));
    let identity = unary_program("identity", "x", &shape, false);
    let err = backend.run_program(&identity, &[input]).unwrap_err();
    assert_eq!(
        err.downcast_ref::<BackendError>(),
        Some(&BackendError::UnsupportedRank { rank: 7, max: 6 })
    );
}

#[test]
fn complex_tensors_compose_read_and_dispose_through_parts() {
    let Some(backend) = backend() else { return };
    let id = DataId::next();
    backend.register(id, &[2], DType::Complex64).unwrap();

    // Direct writes to complex identities are rejected.
    let err = backend
        .write(id, HostValues::F32(vec![1.0, 2.0]))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackendError>(),
        Some(BackendError::UnsupportedWrite { .. })
    ));

    backend
        .write_complex_parts(
            id,
            HostValues::F32(vec![1.0, 2.0]),
            HostValues::F32(vec![3.0, 4.0]),
        )
        .unwrap();
    assert_eq!(
        backend.read_sync(id).unwrap(),
        HostValues::C64(vec![Complex::new(1.0, 3.0), Complex::new(2.0, 4.0)])
    );

    // Complex identities never feed programs directly.
    let identity = unary_program("identity", "x", &[2], false);
    let handle = TensorHandle::new(id, vec![2], DType::Complex64);
    let err = backend.run_program(&identity, &[handle]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackendError>(),
        Some(BackendError::UnsupportedInputType { .. })
    ));

    // Disposal tears down the component children too.
    let live_before = backend.num_data_ids();
    backend.dispose(id).unwrap();
    assert!(!backend.has_data(id));
    assert_eq!(backend.num_data_ids(), live_before - 3);
}

#[test]
fn custom_uniform_values_reach_the_kernel() {
    let Some(backend) = backend() else { return };
    let input = make_tensor(&backend, &[8], HostValues::F32(vec![1.0; 8]));
    let mut program = unary_program("shift", "x + custom.offset.x", &[8], false);
    program.custom_uniforms = vec![tensorloom_api::CustomUniform {
        name: "offset".into(),
        arity: 1,
    }];
    let out = backend
        .compile_and_run(&program, &[input], None, Some(&[41.0]), true)
        .unwrap();
    assert_eq!(backend.read_sync(out.id).unwrap(), HostValues::F32(vec![42.0; 8]));
}

#[test]
fn time_reports_kernel_and_transfer_waits() {
    let Some(backend) = backend() else { return };
    let mut body = || -> anyhow::Result<()> {
        let input = make_tensor(&backend, &[64], HostValues::F32(vec![1.0; 64]));
        let double = unary_program("double", "x * 2.0", &[64], false);
        let out = backend.run_program(&double, &[input])?;
        backend.read_sync(out.id)?;
        Ok(())
    };
    let info = pollster::block_on(backend.time(&mut body)).unwrap();
    assert!(info.wall_ms > 0.0);
    assert!(info.kernel_ms > 0.0);
    assert!(info.download_wait_ms > 0.0);
    assert!(info.wall_ms >= info.kernel_ms);
    assert!(backend.memory_info().reliable);
}
