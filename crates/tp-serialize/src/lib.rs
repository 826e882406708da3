#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use tp_backend::BackendValues;
use tp_core::{size_from_shape, DType};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    UnknownDType {
        name: String,
        dtype: String,
    },
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    DTypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    Truncated {
        name: String,
    },
    TrailingBytes {
        remaining: usize,
    },
    UnsupportedSchema {
        found: u32,
    },
    Json {
        reason: String,
    },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDType { name, dtype } => {
                write!(f, "weight '{name}' declares unknown dtype '{dtype}'")
            }
            Self::SizeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "weight '{name}' holds {actual} values but its shape wants {expected}"
            ),
            Self::DTypeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "weight '{name}' declares dtype {expected} but holds {actual} values"
            ),
            Self::Truncated { name } => {
                write!(f, "buffer ended before weight '{name}' was fully read")
            }
            Self::TrailingBytes { remaining } => {
                write!(f, "{remaining} trailing byte(s) after the last weight")
            }
            Self::UnsupportedSchema { found } => write!(
                f,
                "manifest schema version {found} is not supported (expected {MANIFEST_SCHEMA_VERSION})"
            ),
            Self::Json { reason } => write!(f, "manifest parse failure: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

/// One weight's metadata in a manifest. `dtype` uses the canonical lowercase
/// names ("float32", "int32", "bool", "complex64", "string").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

impl WeightSpec {
    #[must_use]
    pub fn new(name: &str, shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            name: name.to_string(),
            shape,
            dtype: dtype.as_str().to_string(),
        }
    }

    pub fn parsed_dtype(&self) -> Result<DType, SerializeError> {
        DType::parse(&self.dtype).ok_or_else(|| SerializeError::UnknownDType {
            name: self.name.clone(),
            dtype: self.dtype.clone(),
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        size_from_shape(&self.shape)
    }
}

/// JSON envelope carrying weight specs alongside encoded weight data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightsManifest {
    pub schema_version: u32,
    pub weights: Vec<WeightSpec>,
}

impl WeightsManifest {
    #[must_use]
    pub fn new(weights: Vec<WeightSpec>) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            weights,
        }
    }

    pub fn to_json(&self) -> Result<String, SerializeError> {
        serde_json::to_string(self).map_err(|err| SerializeError::Json {
            reason: err.to_string(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, SerializeError> {
        let manifest: Self = serde_json::from_str(json).map_err(|err| SerializeError::Json {
            reason: err.to_string(),
        })?;
        if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(SerializeError::UnsupportedSchema {
                found: manifest.schema_version,
            });
        }
        Ok(manifest)
    }
}

fn check_entry(spec: &WeightSpec, values: &BackendValues) -> Result<DType, SerializeError> {
    let dtype = spec.parsed_dtype()?;
    if values.dtype() != dtype {
        return Err(SerializeError::DTypeMismatch {
            name: spec.name.clone(),
            expected: dtype.as_str().to_string(),
            actual: values.dtype().as_str().to_string(),
        });
    }
    if values.len() != spec.size() {
        return Err(SerializeError::SizeMismatch {
            name: spec.name.clone(),
            expected: spec.size(),
            actual: values.len(),
        });
    }
    Ok(dtype)
}

/// Concatenates weight values into one flat little-endian buffer in spec
/// order. Each string element is prefixed with a 4-byte little-endian byte
/// count before its UTF-8 payload.
pub fn encode_weights(
    entries: &[(WeightSpec, BackendValues)],
) -> Result<Vec<u8>, SerializeError> {
    let mut out = Vec::new();
    for (spec, values) in entries {
        check_entry(spec, values)?;
        match values {
            BackendValues::F32(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            BackendValues::I32(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            BackendValues::Bool(v) => out.extend_from_slice(v),
            BackendValues::C64(v) => {
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            BackendValues::Bytes(v) => {
                for element in v {
                    let len = element.len() as u32;
                    out.extend_from_slice(&len.to_le_bytes());
                    out.extend_from_slice(element);
                }
            }
        }
    }
    Ok(out)
}

/// Reverses `encode_weights`: splits one flat buffer back into per-weight
/// values following the spec list. The buffer must be consumed exactly;
/// truncation and trailing bytes are both errors.
pub fn decode_weights(
    buffer: &[u8],
    specs: &[WeightSpec],
) -> Result<Vec<BackendValues>, SerializeError> {
    let mut offset = 0usize;
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let dtype = spec.parsed_dtype()?;
        let count = spec.size();
        let values = match dtype {
            DType::Float32 => BackendValues::F32(read_f32s(buffer, &mut offset, count, spec)?),
            DType::Int32 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    let chunk = take(buffer, &mut offset, 4, spec)?;
                    v.push(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                BackendValues::I32(v)
            }
            DType::Bool => {
                let chunk = take(buffer, &mut offset, count, spec)?;
                BackendValues::Bool(chunk.to_vec())
            }
            DType::Complex64 => {
                BackendValues::C64(read_f32s(buffer, &mut offset, count * 2, spec)?)
            }
            DType::Str => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    let chunk = take(buffer, &mut offset, 4, spec)?;
                    let len =
                        u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
                    let payload = take(buffer, &mut offset, len, spec)?;
                    v.push(payload.to_vec());
                }
                BackendValues::Bytes(v)
            }
        };
        out.push(values);
    }
    if offset != buffer.len() {
        return Err(SerializeError::TrailingBytes {
            remaining: buffer.len() - offset,
        });
    }
    Ok(out)
}

fn take<'a>(
    buffer: &'a [u8],
    offset: &mut usize,
    len: usize,
    spec: &WeightSpec,
) -> Result<&'a [u8], SerializeError> {
    let end = offset.checked_add(len).ok_or_else(|| SerializeError::Truncated {
        name: spec.name.clone(),
    })?;
    if end > buffer.len() {
        return Err(SerializeError::Truncated {
            name: spec.name.clone(),
        });
    }
    let slice = &buffer[*offset..end];
    *offset = end;
    Ok(slice)
}

fn read_f32s(
    buffer: &[u8],
    offset: &mut usize,
    count: usize,
    spec: &WeightSpec,
) -> Result<Vec<f32>, SerializeError> {
    let mut v = Vec::with_capacity(count);
    for _ in 0..count {
        let chunk = take(buffer, offset, 4, spec)?;
        v.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(v)
}
