//! TensorLoom API: the contract between the tensor runtime and its kernel
//! backends.
//!
//! The runtime owns tensors and the operator library; a backend owns the
//! data behind them. Everything crosses this boundary through opaque
//! [`DataId`] identities, lightweight [`TensorHandle`]s, declarative
//! [`Program`] descriptions, and the [`KernelBackend`] trait.

use num_complex::Complex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DATA_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity for a piece of tensor data. Identities are minted from a
/// process-wide monotonically increasing counter; equality is identity
/// equality, never value equality. Explicit disposal through the owning
/// backend is the only way an identity dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(u64);

impl DataId {
    pub fn next() -> Self {
        Self(NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Int32,
    Bool,
    Complex64,
    Str,
}

impl DType {
    /// Bytes one element occupies on the host. Strings are variable-length
    /// and never participate in byte accounting, so they report zero.
    pub fn bytes_per_element(self) -> usize {
        match self {
            DType::Float32 | DType::Int32 => 4,
            DType::Bool => 1,
            DType::Complex64 => 8,
            DType::Str => 0,
        }
    }
}

/// Host-resident tensor values, tagged by dtype. GPU transport is always
/// f32; int32 and bool survive the round-trip exactly within f32's integer
/// range, strings never leave the host, and complex64 is carried as paired
/// real/imaginary components.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValues {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<u8>),
    C64(Vec<Complex<f32>>),
    Str(Vec<String>),
}

impl HostValues {
    pub fn dtype(&self) -> DType {
        match self {
            HostValues::F32(_) => DType::Float32,
            HostValues::I32(_) => DType::Int32,
            HostValues::Bool(_) => DType::Bool,
            HostValues::C64(_) => DType::Complex64,
            HostValues::Str(_) => DType::Str,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostValues::F32(v) => v.len(),
            HostValues::I32(v) => v.len(),
            HostValues::Bool(v) => v.len(),
            HostValues::C64(v) => v.len(),
            HostValues::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn empty(dtype: DType) -> Self {
        match dtype {
            DType::Float32 => HostValues::F32(Vec::new()),
            DType::Int32 => HostValues::I32(Vec::new()),
            DType::Bool => HostValues::Bool(Vec::new()),
            DType::Complex64 => HostValues::C64(Vec::new()),
            DType::Str => HostValues::Str(Vec::new()),
        }
    }
}

/// A lightweight reference to backend-owned data. Several handles may share
/// one identity (identity-preserving reshape presents the same id under a
/// different logical shape).
#[derive(Debug, Clone, PartialEq)]
pub struct TensorHandle {
    pub id: DataId,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorHandle {
    pub fn new(id: DataId, shape: Vec<usize>, dtype: DType) -> Self {
        Self { id, shape, dtype }
    }

    /// Element count of the logical shape.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// The same identity viewed under a different logical shape. The caller
    /// is responsible for element-count compatibility.
    pub fn view(&self, shape: Vec<usize>) -> Self {
        Self {
            id: self.id,
            shape,
            dtype: self.dtype,
        }
    }
}

/// Extra per-dispatch uniform declared by a program and fed from
/// `custom_values` at run time (slicing offsets, seeds, normalization
/// constants). `arity` is the number of f32 components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomUniform {
    pub name: String,
    pub arity: usize,
}

/// Declarative description of a kernel. This is the sole extension point
/// for new operators: operator code builds one of these and hands it to
/// [`KernelBackend::compile_and_run`], never touching the backend core.
///
/// `body` is a WGSL fragment that must define `fn run()` and may only reach
/// tensor data through the generated accessors: `get<Var>(..)`,
/// `get<Var>AtOutCoords()`, `getOutputCoords()`, and `setOutput(value)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub variable_names: Vec<String>,
    pub output_shape: Vec<usize>,
    pub body: String,
    /// The kernel samples its inputs as packed texels. Defaults to false.
    pub packed_inputs: bool,
    /// The kernel produces a packed output. Defaults to false.
    pub packed_output: bool,
    /// Pack/unpack conversion kernels set this so their packed outputs are
    /// not eagerly unpacked again.
    pub is_packing_kernel: bool,
    pub custom_uniforms: Vec<CustomUniform>,
}

impl Program {
    pub fn new(
        name: impl Into<String>,
        variable_names: Vec<String>,
        output_shape: Vec<usize>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            variable_names,
            output_shape,
            body: body.into(),
            packed_inputs: false,
            packed_output: false,
            is_packing_kernel: false,
            custom_uniforms: Vec::new(),
        }
    }

    pub fn output_size(&self) -> usize {
        self.output_shape.iter().product()
    }
}

/// Timing breakdown returned by [`KernelBackend::time`]. All figures are
/// milliseconds of wall time measured on the host around the respective
/// blocking GPU calls.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimingInfo {
    pub upload_wait_ms: f64,
    pub download_wait_ms: f64,
    pub kernel_ms: f64,
    pub wall_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub resident_bytes: usize,
    pub reliable: bool,
}

/// Typed failure taxonomy of the backend core. Programming and lifecycle
/// errors are fatal and never retried; `Capability` fails backend
/// construction so the runtime can fall back to another backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    AlreadyRegistered {
        id: DataId,
    },
    UnknownData {
        id: DataId,
    },
    /// The id is registered but holds neither host values nor GPU storage.
    NoData {
        id: DataId,
    },
    UnsupportedWrite {
        id: DataId,
        dtype: DType,
    },
    UnsupportedInputType {
        id: DataId,
        dtype: DType,
    },
    UnsupportedRank {
        rank: usize,
        max: usize,
    },
    /// A cached kernel's recorded shapes disagree with the current call.
    /// This indicates a cache-key bug, not a user error.
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    BroadcastError {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    /// The buffer pool was asked to release storage it never handed out.
    NotOwned,
    Capability(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered { id } => {
                write!(f, "data id {id} is already registered with this backend")
            }
            Self::UnknownData { id } => write!(f, "no data registered under id {id}"),
            Self::NoData { id } => write!(f, "id {id} holds no host values and no GPU storage"),
            Self::UnsupportedWrite { id, dtype } => write!(
                f,
                "cannot write {dtype:?} values to id {id}; complex tensors must be composed from real/imaginary parts"
            ),
            Self::UnsupportedInputType { id, dtype } => write!(
                f,
                "programs do not accept {dtype:?} input {id}; decompose it before dispatch"
            ),
            Self::UnsupportedRank { rank, max } => {
                write!(f, "rank {rank} exceeds the supported maximum of {max}")
            }
            Self::ShapeMismatch { expected, actual } => write!(
                f,
                "compiled kernel shape mismatch: expected {expected:?}, got {actual:?}"
            ),
            Self::BroadcastError { lhs, rhs } => {
                write!(f, "shapes {lhs:?} and {rhs:?} are not broadcast-compatible")
            }
            Self::NotOwned => write!(f, "storage object was not checked out from this pool"),
            Self::Capability(msg) => write!(f, "device capability error: {msg}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Boxed future type for backend operations that suspend (async reads,
/// timing queries). The only suspension point in the core is the fence
/// wait inside an asynchronous read.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + 'a>>;
pub type ReadFuture<'a> = BackendFuture<'a, HostValues>;

/// The backend contract consumed by the tensor runtime.
///
/// Identity and dtype/shape invariants: an id registered once keeps its
/// shape and dtype for life; `write` replaces host values and invalidates
/// any GPU copy; `dispose` is deferred while a read is in flight; complex64
/// identities decompose into real/imaginary children and reject direct
/// writes and program inputs.
pub trait KernelBackend {
    fn register(&self, id: DataId, shape: &[usize], dtype: DType) -> anyhow::Result<()>;

    fn write(&self, id: DataId, values: HostValues) -> anyhow::Result<()>;

    /// Compose a complex64 identity from host real/imaginary components.
    fn write_complex_parts(
        &self,
        id: DataId,
        real: HostValues,
        imag: HostValues,
    ) -> anyhow::Result<()>;

    fn read_sync(&self, id: DataId) -> anyhow::Result<HostValues>;

    /// Asynchronous read. Concurrent reads of the same id coalesce onto a
    /// single GPU readback; all callers resolve with the same values.
    fn read(&self, id: DataId) -> ReadFuture<'_>;

    fn dispose(&self, id: DataId) -> anyhow::Result<()>;

    /// Compile (or reuse) and execute `program` against `inputs`. When
    /// `output` is `None` a fresh handle sized to the program's output
    /// shape is allocated. `custom_values` feeds the program's declared
    /// custom uniforms. `allow_paging` lets a dispatch opt out of the
    /// eviction check (conversion kernels run during eviction do).
    fn compile_and_run(
        &self,
        program: &Program,
        inputs: &[TensorHandle],
        output: Option<TensorHandle>,
        custom_values: Option<&[f32]>,
        allow_paging: bool,
    ) -> anyhow::Result<TensorHandle>;

    fn memory_info(&self) -> MemoryInfo;

    /// Run `f` inside a timing scope and report upload/download/kernel
    /// wait times accumulated while it ran.
    fn time<'a>(
        &'a self,
        f: &'a mut dyn FnMut() -> anyhow::Result<()>,
    ) -> BackendFuture<'a, TimingInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_ids_are_unique_and_increasing() {
        let a = DataId::next();
        let b = DataId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn handle_size_is_shape_product() {
        let h = TensorHandle::new(DataId::next(), vec![2, 3, 4], DType::Float32);
        assert_eq!(h.size(), 24);
        assert_eq!(h.view(vec![6, 4]).size(), 24);
    }

    #[test]
    fn empty_values_match_dtype() {
        for dtype in [
            DType::Float32,
            DType::Int32,
            DType::Bool,
            DType::Complex64,
            DType::Str,
        ] {
            let v = HostValues::empty(dtype);
            assert_eq!(v.dtype(), dtype);
            assert!(v.is_empty());
        }
    }

    #[test]
    fn errors_render_identifying_detail() {
        let id = DataId::next();
        let msg = BackendError::AlreadyRegistered { id }.to_string();
        assert!(msg.contains(&id.to_string()));
        let msg = BackendError::ShapeMismatch {
            expected: vec![2, 2],
            actual: vec![4],
        }
        .to_string();
        assert!(msg.contains("[2, 2]") && msg.contains("[4]"));
    }
}
