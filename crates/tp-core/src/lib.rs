#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_DATA_ID: AtomicU64 = AtomicU64::new(1);

/// Element type of a tensor buffer.
///
/// `Complex64` is stored as interleaved `f32` pairs; `Str` entries are raw
/// byte strings decoded to UTF-8 only at the read surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Int32,
    Bool,
    Complex64,
    Str,
}

impl DType {
    /// Bytes per element, or `None` for string tensors whose byte count is
    /// only known once values are written.
    #[must_use]
    pub fn bytes_per_element(self) -> Option<usize> {
        match self {
            Self::Float32 | Self::Int32 => Some(4),
            Self::Bool => Some(1),
            Self::Complex64 => Some(8),
            Self::Str => None,
        }
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Complex64)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Int32 => "int32",
            Self::Bool => "bool",
            Self::Complex64 => "complex64",
            Self::Str => "string",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "float32" => Some(Self::Float32),
            "int32" => Some(Self::Int32),
            "bool" => Some(Self::Bool),
            "complex64" => Some(Self::Complex64),
            "string" => Some(Self::Str),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-unique identity of one tensor view. Two views over the same buffer
/// have distinct `TensorId`s but may share a `DataId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub u64);

impl TensorId {
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque handle for one backend-resident buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(pub u64);

impl DataId {
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[must_use]
pub fn size_from_shape(shape: &[usize]) -> usize {
    shape.iter().copied().product()
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    SizeMismatch { expected: usize, actual: usize },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { expected, actual } => {
                write!(
                    f,
                    "buffer length {actual} does not match shape size {expected}"
                )
            }
        }
    }
}

impl std::error::Error for ShapeError {}

/// A cheap value handle onto an engine-owned buffer.
///
/// The handle carries no ownership: backend memory is freed when the engine's
/// ref count for `data_id` reaches zero, not when handles are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    id: TensorId,
    data_id: DataId,
    dtype: DType,
    shape: Vec<usize>,
}

impl Tensor {
    /// Builds a new view handle with a fresh tensor id. The caller (the
    /// engine) is responsible for ref-count bookkeeping on `data_id`.
    #[must_use]
    pub fn make(shape: Vec<usize>, dtype: DType, data_id: DataId) -> Self {
        Self {
            id: TensorId::fresh(),
            data_id,
            dtype,
            shape,
        }
    }

    #[must_use]
    pub fn id(&self) -> TensorId {
        self.id
    }

    #[must_use]
    pub fn data_id(&self) -> DataId {
        self.data_id
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        size_from_shape(&self.shape)
    }

    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        contiguous_strides(&self.shape)
    }
}

/// A named, optionally trainable binding whose underlying buffer can be
/// reassigned in place. The engine keeps the authoritative name → binding map.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    tensor: Tensor,
    name: String,
    trainable: bool,
}

impl Variable {
    #[must_use]
    pub fn new(tensor: Tensor, name: String, trainable: bool) -> Self {
        Self {
            tensor,
            name,
            trainable,
        }
    }

    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn trainable(&self) -> bool {
        self.trainable
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.tensor.dtype()
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }
}

/// Kernel output descriptor: a buffer the kernel created (or aliased) in the
/// backend, not yet wrapped into a tracked `Tensor`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub data_id: DataId,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Attribute value attached to a kernel invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntVec(Vec<i64>),
    FloatVec(Vec<f64>),
}

pub type Attrs = BTreeMap<String, AttrValue>;

/// Walks tensor handles out of the values a `tidy` closure may return.
///
/// Implemented for the shapes of result the scope machinery understands;
/// collections are walked recursively.
pub trait TensorContainer {
    fn collect_tensors(&self, out: &mut Vec<Tensor>);

    #[must_use]
    fn contained_tensors(&self) -> Vec<Tensor> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }
}

impl TensorContainer for () {
    fn collect_tensors(&self, _out: &mut Vec<Tensor>) {}
}

impl TensorContainer for Tensor {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        out.push(self.clone());
    }
}

impl<T: TensorContainer> TensorContainer for Option<T> {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        if let Some(inner) = self {
            inner.collect_tensors(out);
        }
    }
}

impl<T: TensorContainer> TensorContainer for Vec<T> {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        for item in self {
            item.collect_tensors(out);
        }
    }
}

impl<A: TensorContainer, B: TensorContainer> TensorContainer for (A, B) {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        self.0.collect_tensors(out);
        self.1.collect_tensors(out);
    }
}

impl<A: TensorContainer, B: TensorContainer, C: TensorContainer> TensorContainer for (A, B, C) {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        self.0.collect_tensors(out);
        self.1.collect_tensors(out);
        self.2.collect_tensors(out);
    }
}

impl<T: TensorContainer> TensorContainer for BTreeMap<String, T> {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        for item in self.values() {
            item.collect_tensors(out);
        }
    }
}

pub fn validate_buffer_size(shape: &[usize], actual: usize) -> Result<(), ShapeError> {
    let expected = size_from_shape(shape);
    if expected != actual {
        return Err(ShapeError::SizeMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        contiguous_strides, size_from_shape, validate_buffer_size, DType, DataId, Tensor,
        TensorContainer, TensorId, Variable,
    };

    #[test]
    fn scalar_shape_has_size_one_and_no_strides() {
        assert_eq!(size_from_shape(&[]), 1);
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn strides_are_row_major() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
    }

    #[test]
    fn zero_dim_shape_has_zero_size() {
        assert_eq!(size_from_shape(&[0, 3]), 0);
    }

    #[test]
    fn tensor_ids_are_unique_but_data_ids_can_be_shared() {
        let data_id = DataId::fresh();
        let a = Tensor::make(vec![2, 3], DType::Float32, data_id);
        let b = Tensor::make(vec![6], DType::Float32, data_id);

        assert_ne!(a.id(), b.id());
        assert_eq!(a.data_id(), b.data_id());
        assert_eq!(a.size(), b.size());
        assert_eq!(a.rank(), 2);
        assert_eq!(b.rank(), 1);
    }

    #[test]
    fn dtype_names_round_trip() {
        for dtype in [
            DType::Float32,
            DType::Int32,
            DType::Bool,
            DType::Complex64,
            DType::Str,
        ] {
            assert_eq!(DType::parse(dtype.as_str()), Some(dtype));
        }
        assert_eq!(DType::parse("float64"), None);
    }

    #[test]
    fn buffer_size_validation_fails_closed() {
        assert!(validate_buffer_size(&[2, 2], 4).is_ok());
        let err = validate_buffer_size(&[2, 2], 3).expect_err("short buffer must fail");
        assert!(err.to_string().contains("does not match shape size 4"));
    }

    #[test]
    fn variable_exposes_tensor_metadata() {
        let tensor = Tensor::make(vec![3], DType::Float32, DataId::fresh());
        let var = Variable::new(tensor.clone(), "weights".to_string(), true);

        assert_eq!(var.name(), "weights");
        assert!(var.trainable());
        assert_eq!(var.shape(), tensor.shape());
        assert_eq!(var.dtype(), DType::Float32);
    }

    #[test]
    fn containers_collect_nested_tensors() {
        let a = Tensor::make(vec![1], DType::Float32, DataId::fresh());
        let b = Tensor::make(vec![1], DType::Float32, DataId::fresh());

        let pair = (a.clone(), Some(vec![b.clone()]));
        let collected = pair.contained_tensors();
        let ids: Vec<TensorId> = collected.iter().map(Tensor::id).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);

        let empty: Option<Tensor> = None;
        assert!(empty.contained_tensors().is_empty());
    }

    proptest! {
        #[test]
        fn prop_strides_contract(shape in prop::collection::vec(1usize..=5, 1..=4)) {
            let strides = contiguous_strides(shape.as_slice());
            prop_assert_eq!(strides.len(), shape.len());
            prop_assert_eq!(strides.last().copied(), Some(1));

            // Stepping the slowest axis once covers the size of everything after it.
            for idx in 0..shape.len() {
                let tail: usize = shape[idx + 1..].iter().copied().product();
                prop_assert_eq!(strides[idx], tail);
            }
        }

        #[test]
        fn prop_size_matches_shape_product(shape in prop::collection::vec(0usize..=6, 0..=4)) {
            let expected: usize = shape.iter().copied().product();
            prop_assert_eq!(size_from_shape(shape.as_slice()), expected);
        }

        #[test]
        fn prop_fresh_ids_are_strictly_monotonic(count in 1usize..=16) {
            let ids: Vec<u64> = (0..count).map(|_| TensorId::fresh().0).collect();
            for pair in ids.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}
