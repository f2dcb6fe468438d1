//! The per-backend data storage map: one record per distinct identity.

use crate::layout::PhysShape;
use crate::pool::StorageKind;
use num_complex::Complex;
use std::collections::HashMap;
use std::sync::Arc;
use tensorloom_api::{BackendError, DType, DataId, HostValues, TensorHandle};

/// How a record's storage was populated. Affects the upload/download code
/// path taken and is kept for diagnostics after upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageUsage {
    Render,
    Upload,
    Pixels,
    Download,
}

#[derive(Clone)]
pub struct GpuStorage {
    pub buffer: Arc<wgpu::Buffer>,
    pub phys_shape: PhysShape,
    pub kind: StorageKind,
}

pub struct ComplexParts {
    pub real: TensorHandle,
    pub imag: TensorHandle,
}

/// One record per identity. At most one of `values`, `gpu`,
/// `complex_parts` holds the authoritative data, except transiently during
/// upload and download. Complex records never own GPU storage.
pub struct StorageRecord {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub values: Option<HostValues>,
    pub gpu: Option<GpuStorage>,
    pub is_packed: bool,
    pub usage: StorageUsage,
    pub complex_parts: Option<ComplexParts>,
    /// Shallow handles may share this identity; disposal only frees at zero.
    pub ref_count: usize,
}

impl StorageRecord {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            values: None,
            gpu: None,
            is_packed: false,
            usage: StorageUsage::Render,
            complex_parts: None,
            ref_count: 1,
        }
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Logical bytes this record contributes to GPU residency accounting.
    pub fn gpu_bytes(&self) -> usize {
        self.size() * self.dtype.bytes_per_element()
    }
}

/// Injective map from identity to storage record. No implicit creation.
#[derive(Default)]
pub struct DataStorage {
    records: HashMap<DataId, StorageRecord>,
}

impl DataStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: DataId, record: StorageRecord) -> Result<(), BackendError> {
        if self.records.contains_key(&id) {
            return Err(BackendError::AlreadyRegistered { id });
        }
        self.records.insert(id, record);
        Ok(())
    }

    pub fn get(&self, id: DataId) -> Result<&StorageRecord, BackendError> {
        self.records
            .get(&id)
            .ok_or(BackendError::UnknownData { id })
    }

    pub fn get_mut(&mut self, id: DataId) -> Result<&mut StorageRecord, BackendError> {
        self.records
            .get_mut(&id)
            .ok_or(BackendError::UnknownData { id })
    }

    pub fn has(&self, id: DataId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn remove(&mut self, id: DataId) -> Option<StorageRecord> {
        self.records.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Convert host values into the f32 transport format used on the GPU.
/// Complex and string values never take this path.
pub fn to_transport_f32(values: &HostValues) -> Result<Vec<f32>, BackendError> {
    match values {
        HostValues::F32(v) => Ok(v.clone()),
        HostValues::I32(v) => Ok(v.iter().map(|&x| x as f32).collect()),
        HostValues::Bool(v) => Ok(v.iter().map(|&x| if x != 0 { 1.0 } else { 0.0 }).collect()),
        HostValues::C64(_) | HostValues::Str(_) => Err(BackendError::Capability(
            "complex64/string values have no GPU transport format".into(),
        )),
    }
}

/// Convert downloaded f32 transport values back into `dtype`. Int32 and
/// bool round, matching the upload conversion exactly within f32's integer
/// range.
pub fn from_transport_f32(dtype: DType, data: Vec<f32>) -> Result<HostValues, BackendError> {
    match dtype {
        DType::Float32 => Ok(HostValues::F32(data)),
        DType::Int32 => Ok(HostValues::I32(
            data.iter().map(|&x| x.round() as i32).collect(),
        )),
        DType::Bool => Ok(HostValues::Bool(
            data.iter().map(|&x| u8::from(x.round() != 0.0)).collect(),
        )),
        DType::Complex64 | DType::Str => Err(BackendError::Capability(
            "complex64/string values have no GPU transport format".into(),
        )),
    }
}

/// Merge separate real/imaginary component buffers into complex values.
pub fn merge_complex(real: &HostValues, imag: &HostValues) -> Result<HostValues, BackendError> {
    match (real, imag) {
        (HostValues::F32(re), HostValues::F32(im)) if re.len() == im.len() => Ok(HostValues::C64(
            re.iter()
                .zip(im.iter())
                .map(|(&r, &i)| Complex::new(r, i))
                .collect(),
        )),
        _ => Err(BackendError::ShapeMismatch {
            expected: vec![real.len()],
            actual: vec![imag.len()],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_injective() {
        let mut storage = DataStorage::new();
        let id = DataId::next();
        storage
            .register(id, StorageRecord::new(vec![3], DType::Float32))
            .unwrap();
        let err = storage
            .register(id, StorageRecord::new(vec![3], DType::Float32))
            .unwrap_err();
        assert_eq!(err, BackendError::AlreadyRegistered { id });
    }

    #[test]
    fn transport_round_trips_ints_and_bools() {
        let ints = HostValues::I32(vec![-3, 0, 7, 1_000_000]);
        let via = from_transport_f32(DType::Int32, to_transport_f32(&ints).unwrap()).unwrap();
        assert_eq!(via, ints);

        let bools = HostValues::Bool(vec![0, 1, 1, 0]);
        let via = from_transport_f32(DType::Bool, to_transport_f32(&bools).unwrap()).unwrap();
        assert_eq!(via, bools);
    }

    #[test]
    fn merge_complex_zips_components() {
        let merged = merge_complex(
            &HostValues::F32(vec![1.0, 2.0]),
            &HostValues::F32(vec![3.0, 4.0]),
        )
        .unwrap();
        assert_eq!(
            merged,
            HostValues::C64(vec![Complex::new(1.0, 3.0), Complex::new(2.0, 4.0)])
        );
        assert!(merge_complex(
            &HostValues::F32(vec![1.0]),
            &HostValues::F32(vec![1.0, 2.0])
        )
        .is_err());
    }
}
