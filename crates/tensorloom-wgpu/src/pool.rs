//! Fixed-shape GPU buffer pooling.
//!
//! Allocation is expensive and shape-specific; steady-state workloads
//! recycle a small set of footprints, so freed buffers park in per-key
//! free lists and are handed back on the next acquire of the exact same
//! `(physical shape, kind)`.

use crate::layout::PhysShape;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tensorloom_api::BackendError;

/// Physical storage flavor. Dense buffers hold one f32 per element; packed
/// buffers hold one vec4 texel per 2x2 logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Dense,
    Packed,
}

impl StorageKind {
    pub fn bytes_per_physical_element(self) -> usize {
        match self {
            StorageKind::Dense => 4,
            StorageKind::Packed => 16,
        }
    }
}

pub fn buffer_size_bytes(shape: PhysShape, kind: StorageKind) -> u64 {
    (shape.num_elements().max(1) * kind.bytes_per_physical_element()) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    shape: PhysShape,
    kind: StorageKind,
}

pub struct BufferPool {
    free: Mutex<HashMap<PoolKey, VecDeque<Arc<wgpu::Buffer>>>>,
    /// Ids of every buffer this pool ever handed out and has not dropped.
    owned: Mutex<HashSet<u64>>,
    bytes_allocated: AtomicU64,
    bytes_free: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(HashMap::new()),
            owned: Mutex::new(HashSet::new()),
            bytes_allocated: AtomicU64::new(0),
            bytes_free: AtomicU64::new(0),
        }
    }

    /// Recycle a free buffer of the exact `(shape, kind)` or allocate a new
    /// one. The second return value is true when the buffer was recycled.
    pub fn acquire(
        &self,
        device: &wgpu::Device,
        shape: PhysShape,
        kind: StorageKind,
        label: &str,
    ) -> (Arc<wgpu::Buffer>, bool) {
        let key = PoolKey { shape, kind };
        if let Ok(mut guard) = self.free.lock() {
            if let Some(queue) = guard.get_mut(&key) {
                if let Some(buffer) = queue.pop_front() {
                    self.bytes_free
                        .fetch_sub(buffer_size_bytes(shape, kind), Ordering::Relaxed);
                    log::trace!(
                        "buffer_pool: reuse {:?} {}x{} ptr={:p}",
                        kind,
                        shape.rows,
                        shape.cols,
                        Arc::as_ptr(&buffer)
                    );
                    return (buffer, true);
                }
            }
        }

        let size = buffer_size_bytes(shape, kind);
        let buffer = Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        self.owned
            .lock()
            .expect("buffer pool poisoned")
            .insert(buffer.global_id().inner());
        log::trace!(
            "buffer_pool: new {:?} {}x{} ptr={:p}",
            kind,
            shape.rows,
            shape.cols,
            Arc::as_ptr(&buffer)
        );
        (buffer, false)
    }

    /// Return a buffer to the free list. Fails with `NotOwned` for buffers
    /// that were never checked out from this pool.
    pub fn release(
        &self,
        buffer: Arc<wgpu::Buffer>,
        shape: PhysShape,
        kind: StorageKind,
    ) -> Result<(), BackendError> {
        let owned = self
            .owned
            .lock()
            .expect("buffer pool poisoned")
            .contains(&buffer.global_id().inner());
        if !owned {
            return Err(BackendError::NotOwned);
        }
        let key = PoolKey { shape, kind };
        if let Ok(mut guard) = self.free.lock() {
            log::trace!(
                "buffer_pool: release {:?} {}x{} ptr={:p}",
                kind,
                shape.rows,
                shape.cols,
                Arc::as_ptr(&buffer)
            );
            self.bytes_free
                .fetch_add(buffer_size_bytes(shape, kind), Ordering::Relaxed);
            guard.entry(key).or_default().push_back(buffer);
        }
        Ok(())
    }

    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn bytes_free(&self) -> u64 {
        self.bytes_free.load(Ordering::Relaxed)
    }

    /// Drop every pooled buffer. Called exactly once when the owning
    /// backend is disposed.
    pub fn dispose(&self) {
        if let Ok(mut guard) = self.free.lock() {
            guard.clear();
        }
        if let Ok(mut guard) = self.owned.lock() {
            guard.clear();
        }
        self.bytes_free.store(0, Ordering::Relaxed);
        self.bytes_allocated.store(0, Ordering::Relaxed);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
