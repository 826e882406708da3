#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;

use tp_core::{DType, DataId};

/// Typed buffer contents as a backend hands them back to the engine.
///
/// `C64` carries interleaved real/imaginary `f32` pairs; `Bytes` carries one
/// raw byte string per element, decoded to UTF-8 only at the read surface.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendValues {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<u8>),
    C64(Vec<f32>),
    Bytes(Vec<Vec<u8>>),
}

impl BackendValues {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::Float32,
            Self::I32(_) => DType::Int32,
            Self::Bool(_) => DType::Bool,
            Self::C64(_) => DType::Complex64,
            Self::Bytes(_) => DType::Str,
        }
    }

    /// Number of logical elements held (complex pairs count as one).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::C64(v) => v.len() / 2,
            Self::Bytes(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes this buffer occupies. String entries are counted by their raw
    /// byte length, so the figure moves when a string tensor is rewritten.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match self {
            Self::F32(v) => v.len() * 4,
            Self::I32(v) => v.len() * 4,
            Self::Bool(v) => v.len(),
            Self::C64(v) => v.len() * 4,
            Self::Bytes(v) => v.iter().map(Vec::len).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    NotYetImplemented {
        backend: String,
        method: &'static str,
    },
    SyncReadUnsupported {
        backend: String,
    },
    UnknownDataId {
        data_id: DataId,
    },
    StringDecode {
        data_id: DataId,
        index: usize,
    },
    Internal {
        reason: String,
    },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotYetImplemented { backend, method } => {
                write!(f, "backend '{backend}' does not implement {method}")
            }
            Self::SyncReadUnsupported { backend } => {
                write!(f, "backend '{backend}' cannot read data synchronously")
            }
            Self::UnknownDataId { data_id } => {
                write!(f, "no buffer registered for data id {}", data_id.0)
            }
            Self::StringDecode { data_id, index } => write!(
                f,
                "element {index} of string buffer {} is not valid UTF-8",
                data_id.0
            ),
            Self::Internal { reason } => write!(f, "backend failure: {reason}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Snapshot of a backend's buffer accounting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryReport {
    pub num_data_ids: usize,
    pub num_bytes: usize,
    pub unreliable: bool,
    pub reasons: Vec<String>,
}

/// Timing a backend reports for a profiled closure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelTiming {
    /// Time spent inside kernels, when the backend can isolate it.
    pub kernel_ms: Option<f64>,
    pub wall_ms: f64,
}

/// Storage and execution surface one device exposes to the engine.
///
/// Buffer ownership stays with the backend; the engine addresses buffers only
/// through `DataId` and drives the ref counts. Methods a backend does not
/// support fail with `NotYetImplemented` naming the method, so a partial
/// backend is registrable without panicking paths.
pub trait Backend {
    fn name(&self) -> &str;

    /// Stores a fresh buffer and returns its id with a ref count of one.
    /// Further views are accounted with `inc_ref`.
    fn write(
        &mut self,
        values: BackendValues,
        shape: &[usize],
        dtype: DType,
    ) -> Result<DataId, BackendError>;

    /// Installs a buffer under an existing id, preserving the ref count the
    /// engine tracked on the source backend.
    fn move_data(
        &mut self,
        data_id: DataId,
        values: BackendValues,
        shape: &[usize],
        dtype: DType,
        ref_count: usize,
    ) -> Result<(), BackendError>;

    /// Reads buffer contents, potentially scheduling device work first.
    fn read(&mut self, data_id: DataId) -> Result<BackendValues, BackendError>;

    /// Reads buffer contents without waiting; backends that cannot do this
    /// return `SyncReadUnsupported`.
    fn read_sync(&self, data_id: DataId) -> Result<BackendValues, BackendError>;

    /// Drops one reference; frees the buffer and reports `true` when the
    /// count reaches zero (or unconditionally when `force` is set). Unknown
    /// ids are a no-op reporting `true`.
    fn dispose_data(&mut self, data_id: DataId, force: bool) -> bool;

    /// Current ref count, zero for unknown ids.
    fn ref_count(&self, data_id: DataId) -> usize;

    fn inc_ref(&mut self, data_id: DataId);

    fn num_data_ids(&self) -> usize;

    fn memory(&self) -> MemoryReport;

    /// Runs `f` and reports how long it took, separating kernel time where
    /// the device supports it.
    fn time(
        &mut self,
        f: &mut dyn FnMut(&mut dyn Backend) -> Result<(), BackendError>,
    ) -> Result<KernelTiming, BackendError> {
        let _ = f;
        Err(BackendError::NotYetImplemented {
            backend: self.name().to_string(),
            method: "time",
        })
    }

    /// Mantissa width of the float type this backend computes in.
    fn float_precision(&self) -> u8 {
        32
    }

    /// Frees everything the backend holds. Called when the engine removes or
    /// resets the backend.
    fn dispose(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Constructor the engine invokes lazily the first time a registered backend
/// is selected.
pub type BackendFactory = fn() -> Result<Box<dyn Backend>, BackendError>;

#[cfg(test)]
mod tests {
    use super::{BackendError, BackendValues, MemoryReport};
    use tp_core::{DType, DataId};

    #[test]
    fn values_report_dtype_and_logical_length() {
        assert_eq!(BackendValues::F32(vec![1.0, 2.0]).len(), 2);
        assert_eq!(BackendValues::C64(vec![1.0, 0.0, 2.0, 0.0]).len(), 2);
        assert_eq!(
            BackendValues::C64(vec![1.0, 0.0]).dtype(),
            DType::Complex64
        );
        assert!(BackendValues::Bytes(Vec::new()).is_empty());
    }

    #[test]
    fn byte_accounting_tracks_raw_string_bytes() {
        assert_eq!(BackendValues::F32(vec![0.0; 3]).byte_len(), 12);
        assert_eq!(BackendValues::Bool(vec![1, 0]).byte_len(), 2);
        let strings = BackendValues::Bytes(vec![b"ab".to_vec(), b"cde".to_vec()]);
        assert_eq!(strings.byte_len(), 5);
    }

    #[test]
    fn errors_name_the_offending_surface() {
        let err = BackendError::NotYetImplemented {
            backend: "webgl".to_string(),
            method: "time",
        };
        assert!(err.to_string().contains("'webgl' does not implement time"));

        let err = BackendError::StringDecode {
            data_id: DataId(7),
            index: 2,
        };
        assert!(err.to_string().contains("element 2"));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn memory_report_defaults_to_reliable() {
        let report = MemoryReport::default();
        assert!(!report.unreliable);
        assert!(report.reasons.is_empty());
    }
}
