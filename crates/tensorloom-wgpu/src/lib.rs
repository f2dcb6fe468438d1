//! TensorLoom wgpu backend.
//!
//! Implements the `KernelBackend` contract on top of wgpu compute:
//! - a per-backend data storage map tracking where each tensor's
//!   authoritative bytes live (host, GPU, or complex component children);
//! - a WGSL program compiler that synthesizes complete kernels from
//!   declarative `Program` descriptions, specialized per input layout;
//! - a compiled-kernel cache keyed on program identity plus logical and
//!   physical shapes;
//! - exact-shape buffer pooling, a soft-budget LRU pager, and a
//!   pending-read coordinator with deferred disposal.

pub mod backend;
pub mod bindings;
pub mod codegen;
pub mod config;
pub mod context;
pub mod layout;
pub mod metrics;
pub mod pager;
pub mod pending;
pub mod pool;
pub mod program;
pub mod programs;
pub mod storage;

pub use backend::{WgpuBackend, WgpuBackendOptions};
pub use config::BackendConfig;
pub use context::ContextOptions;
