#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::BTreeMap;
use std::time::Instant;

use tp_backend::{Backend, BackendError, BackendValues, KernelTiming, MemoryReport};
use tp_core::{size_from_shape, AttrValue, DType, DataId, TensorSpec};
use tp_registry::{names, KernelConfig, KernelContext, KernelError, KernelRegistry};

pub const BACKEND_NAME: &str = "cpu";

/// Priority the stock CPU backend registers at; device backends register
/// higher so the engine prefers them when available.
pub const BACKEND_PRIORITY: i32 = 1;

#[derive(Debug, Clone)]
struct CpuEntry {
    values: BackendValues,
    dtype: DType,
    ref_count: usize,
}

/// Reference backend holding every buffer in host memory. Reads are
/// synchronous and never fail for live ids, which makes it the fallback of
/// last resort in the backend priority order.
#[derive(Default)]
pub struct CpuBackend {
    buffers: BTreeMap<DataId, CpuEntry>,
}

impl CpuBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn write(
        &mut self,
        values: BackendValues,
        shape: &[usize],
        dtype: DType,
    ) -> Result<DataId, BackendError> {
        if values.len() != size_from_shape(shape) {
            return Err(BackendError::Internal {
                reason: format!(
                    "buffer of {} elements written under shape {shape:?}",
                    values.len()
                ),
            });
        }
        let data_id = DataId::fresh();
        self.buffers.insert(
            data_id,
            CpuEntry {
                values,
                dtype,
                ref_count: 1,
            },
        );
        Ok(data_id)
    }

    fn move_data(
        &mut self,
        data_id: DataId,
        values: BackendValues,
        _shape: &[usize],
        dtype: DType,
        ref_count: usize,
    ) -> Result<(), BackendError> {
        self.buffers.insert(
            data_id,
            CpuEntry {
                values,
                dtype,
                ref_count,
            },
        );
        Ok(())
    }

    fn read(&mut self, data_id: DataId) -> Result<BackendValues, BackendError> {
        self.read_sync(data_id)
    }

    fn read_sync(&self, data_id: DataId) -> Result<BackendValues, BackendError> {
        self.buffers
            .get(&data_id)
            .map(|entry| entry.values.clone())
            .ok_or(BackendError::UnknownDataId { data_id })
    }

    fn dispose_data(&mut self, data_id: DataId, force: bool) -> bool {
        let Some(entry) = self.buffers.get_mut(&data_id) else {
            return true;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if force || entry.ref_count == 0 {
            self.buffers.remove(&data_id);
            return true;
        }
        false
    }

    fn ref_count(&self, data_id: DataId) -> usize {
        self.buffers
            .get(&data_id)
            .map_or(0, |entry| entry.ref_count)
    }

    fn inc_ref(&mut self, data_id: DataId) {
        if let Some(entry) = self.buffers.get_mut(&data_id) {
            entry.ref_count += 1;
        }
    }

    fn num_data_ids(&self) -> usize {
        self.buffers.len()
    }

    fn memory(&self) -> MemoryReport {
        let num_bytes = self
            .buffers
            .values()
            .map(|entry| entry.values.byte_len())
            .sum();
        let has_strings = self
            .buffers
            .values()
            .any(|entry| entry.dtype == DType::Str);
        let mut reasons = Vec::new();
        if has_strings {
            reasons.push(
                "the byte count of string tensors depends on their current contents".to_string(),
            );
        }
        MemoryReport {
            num_data_ids: self.buffers.len(),
            num_bytes,
            unreliable: has_strings,
            reasons,
        }
    }

    fn time(
        &mut self,
        f: &mut dyn FnMut(&mut dyn Backend) -> Result<(), BackendError>,
    ) -> Result<KernelTiming, BackendError> {
        let start = Instant::now();
        f(self)?;
        let wall_ms = start.elapsed().as_secs_f64() * 1e3;
        // Host execution is synchronous, so kernel time and wall time agree.
        Ok(KernelTiming {
            kernel_ms: Some(wall_ms),
            wall_ms,
        })
    }

    fn dispose(&mut self) {
        self.buffers.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Backend factory registered with the engine under `BACKEND_NAME`.
pub fn cpu_backend_factory() -> Result<Box<dyn Backend>, BackendError> {
    Ok(Box::new(CpuBackend::new()))
}

fn read_input(
    ctx: &mut KernelContext<'_>,
    name: &str,
) -> Result<(BackendValues, Vec<usize>, DType), KernelError> {
    let tensor = ctx.input(name)?.clone();
    let values = ctx.backend.read_sync(tensor.data_id())?;
    Ok((values, tensor.shape().to_vec(), tensor.dtype()))
}

fn as_f32(values: &BackendValues, kernel: &str) -> Result<Vec<f32>, KernelError> {
    match values {
        BackendValues::F32(v) => Ok(v.clone()),
        BackendValues::I32(v) => Ok(v.iter().map(|&x| x as f32).collect()),
        BackendValues::Bool(v) => Ok(v.iter().map(|&x| f32::from(x.min(1))).collect()),
        BackendValues::C64(_) | BackendValues::Bytes(_) => Err(KernelError::DTypeUnsupported {
            kernel: kernel.to_string(),
            dtype: values.dtype(),
        }),
    }
}

/// Resolves binary operand shapes: identical shapes run elementwise, a
/// size-one operand broadcasts against the other, anything else is rejected.
/// When both operands have size one the higher-rank shape wins, so `[1]`
/// against `[]` stays `[1]`.
fn binary_output_shape(
    kernel: &str,
    lhs: &[usize],
    rhs: &[usize],
) -> Result<Vec<usize>, KernelError> {
    if lhs == rhs {
        return Ok(lhs.to_vec());
    }
    let lhs_size = size_from_shape(lhs);
    let rhs_size = size_from_shape(rhs);
    if lhs_size == 1 && rhs_size == 1 {
        let winner = if lhs.len() >= rhs.len() { lhs } else { rhs };
        return Ok(winner.to_vec());
    }
    if lhs_size == 1 {
        return Ok(rhs.to_vec());
    }
    if rhs_size == 1 {
        return Ok(lhs.to_vec());
    }
    Err(KernelError::ShapeMismatch {
        kernel: kernel.to_string(),
        lhs: lhs.to_vec(),
        rhs: rhs.to_vec(),
    })
}

fn broadcast_pair(a: Vec<f32>, b: Vec<f32>, out_len: usize) -> (Vec<f32>, Vec<f32>) {
    let a = if a.len() == 1 { vec![a[0]; out_len] } else { a };
    let b = if b.len() == 1 { vec![b[0]; out_len] } else { b };
    (a, b)
}

fn binary_i32(
    ctx: &mut KernelContext<'_>,
    op: fn(i32, i32) -> i32,
) -> Result<Vec<TensorSpec>, KernelError> {
    let kernel = ctx.kernel_name.to_string();
    let (a_values, a_shape, _) = read_input(ctx, "a")?;
    let (b_values, b_shape, _) = read_input(ctx, "b")?;
    let out_shape = binary_output_shape(&kernel, &a_shape, &b_shape)?;
    let out_len = size_from_shape(&out_shape);

    let (BackendValues::I32(a), BackendValues::I32(b)) = (&a_values, &b_values) else {
        return Err(KernelError::DTypeUnsupported {
            kernel,
            dtype: a_values.dtype(),
        });
    };
    let a = if a.len() == 1 { vec![a[0]; out_len] } else { a.clone() };
    let b = if b.len() == 1 { vec![b[0]; out_len] } else { b.clone() };
    let out: Vec<i32> = a.iter().zip(&b).map(|(&x, &y)| op(x, y)).collect();
    let data_id = ctx
        .backend
        .write(BackendValues::I32(out), &out_shape, DType::Int32)?;
    Ok(vec![TensorSpec {
        data_id,
        shape: out_shape,
        dtype: DType::Int32,
    }])
}

fn binary_elementwise(
    ctx: &mut KernelContext<'_>,
    op_f32: fn(f32, f32) -> f32,
    op_i32: Option<fn(i32, i32) -> i32>,
) -> Result<Vec<TensorSpec>, KernelError> {
    let kernel = ctx.kernel_name.to_string();
    {
        let a_dtype = ctx.input("a")?.dtype();
        let b_dtype = ctx.input("b")?.dtype();
        if a_dtype == DType::Int32 && b_dtype == DType::Int32 {
            if let Some(op) = op_i32 {
                return binary_i32(ctx, op);
            }
        }
    }

    let (a_values, a_shape, _) = read_input(ctx, "a")?;
    let (b_values, b_shape, _) = read_input(ctx, "b")?;
    let out_shape = binary_output_shape(&kernel, &a_shape, &b_shape)?;
    let out_len = size_from_shape(&out_shape);

    let a = as_f32(&a_values, &kernel)?;
    let b = as_f32(&b_values, &kernel)?;
    let (a, b) = broadcast_pair(a, b, out_len);
    let out: Vec<f32> = a.iter().zip(&b).map(|(&x, &y)| op_f32(x, y)).collect();
    let data_id = ctx
        .backend
        .write(BackendValues::F32(out), &out_shape, DType::Float32)?;
    Ok(vec![TensorSpec {
        data_id,
        shape: out_shape,
        dtype: DType::Float32,
    }])
}

fn add_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    binary_elementwise(ctx, |x, y| x + y, Some(i32::wrapping_add))
}

fn sub_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    binary_elementwise(ctx, |x, y| x - y, Some(i32::wrapping_sub))
}

fn multiply_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    binary_elementwise(ctx, |x, y| x * y, Some(i32::wrapping_mul))
}

fn real_div_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    // Division always lands in float32, matching the kernel's name.
    binary_elementwise(ctx, |x, y| x / y, None)
}

fn unary_f32(
    ctx: &mut KernelContext<'_>,
    op_f32: fn(f32) -> f32,
    op_i32: Option<fn(i32) -> i32>,
) -> Result<Vec<TensorSpec>, KernelError> {
    let kernel = ctx.kernel_name.to_string();
    let (values, shape, dtype) = read_input(ctx, "x")?;
    match values {
        BackendValues::F32(v) => {
            let out: Vec<f32> = v.into_iter().map(op_f32).collect();
            let data_id = ctx
                .backend
                .write(BackendValues::F32(out), &shape, DType::Float32)?;
            Ok(vec![TensorSpec {
                data_id,
                shape,
                dtype: DType::Float32,
            }])
        }
        BackendValues::I32(v) => {
            let Some(op) = op_i32 else {
                return Err(KernelError::DTypeUnsupported {
                    kernel,
                    dtype: DType::Int32,
                });
            };
            let out: Vec<i32> = v.into_iter().map(op).collect();
            let data_id = ctx
                .backend
                .write(BackendValues::I32(out), &shape, DType::Int32)?;
            Ok(vec![TensorSpec {
                data_id,
                shape,
                dtype: DType::Int32,
            }])
        }
        _ => Err(KernelError::DTypeUnsupported { kernel, dtype }),
    }
}

fn neg_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    unary_f32(ctx, |x| -x, Some(i32::wrapping_neg))
}

fn square_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    unary_f32(ctx, |x| x * x, Some(|x: i32| x.wrapping_mul(x)))
}

/// Shares the input buffer under a new tensor. The extra reference keeps the
/// buffer alive after either view is disposed.
fn identity_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    let x = ctx.input("x")?.clone();
    ctx.backend.inc_ref(x.data_id());
    Ok(vec![TensorSpec {
        data_id: x.data_id(),
        shape: x.shape().to_vec(),
        dtype: x.dtype(),
    }])
}

fn reshape_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    let kernel = ctx.kernel_name.to_string();
    let x = ctx.input("x")?.clone();
    let Some(AttrValue::IntVec(dims)) = ctx.attrs.get("shape") else {
        return Err(KernelError::MissingAttr {
            kernel,
            attr: "shape".to_string(),
        });
    };
    let new_shape: Vec<usize> = dims.iter().map(|&d| d.max(0) as usize).collect();
    if size_from_shape(&new_shape) != x.size() {
        return Err(KernelError::ShapeMismatch {
            kernel,
            lhs: x.shape().to_vec(),
            rhs: new_shape,
        });
    }
    ctx.backend.inc_ref(x.data_id());
    Ok(vec![TensorSpec {
        data_id: x.data_id(),
        shape: new_shape,
        dtype: x.dtype(),
    }])
}

fn cast_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    let kernel = ctx.kernel_name.to_string();
    let Some(AttrValue::Str(target)) = ctx.attrs.get("dtype") else {
        return Err(KernelError::MissingAttr {
            kernel,
            attr: "dtype".to_string(),
        });
    };
    let Some(target) = DType::parse(target) else {
        return Err(KernelError::Unsupported {
            kernel,
            reason: format!("unknown target dtype '{target}'"),
        });
    };
    let (values, shape, dtype) = read_input(ctx, "x")?;

    let out = match (values, target) {
        (values, t) if t == dtype => values,
        (BackendValues::I32(v), DType::Float32) => {
            BackendValues::F32(v.iter().map(|&x| x as f32).collect())
        }
        (BackendValues::Bool(v), DType::Float32) => {
            BackendValues::F32(v.iter().map(|&x| f32::from(x.min(1))).collect())
        }
        (BackendValues::Bool(v), DType::Int32) => {
            BackendValues::I32(v.iter().map(|&x| i32::from(x.min(1))).collect())
        }
        (BackendValues::F32(v), DType::Int32) => {
            BackendValues::I32(v.iter().map(|&x| x as i32).collect())
        }
        (BackendValues::F32(v), DType::Bool) => {
            BackendValues::Bool(v.iter().map(|&x| u8::from(x != 0.0)).collect())
        }
        (BackendValues::I32(v), DType::Bool) => {
            BackendValues::Bool(v.iter().map(|&x| u8::from(x != 0)).collect())
        }
        (BackendValues::F32(v), DType::Complex64) => {
            let mut out = Vec::with_capacity(v.len() * 2);
            for x in v {
                out.push(x);
                out.push(0.0);
            }
            BackendValues::C64(out)
        }
        (BackendValues::C64(v), DType::Float32) => {
            // Dropping to float keeps the real component.
            BackendValues::F32(v.chunks_exact(2).map(|pair| pair[0]).collect())
        }
        _ => {
            return Err(KernelError::DTypeUnsupported {
                kernel,
                dtype: target,
            })
        }
    };
    let data_id = ctx.backend.write(out, &shape, target)?;
    Ok(vec![TensorSpec {
        data_id,
        shape,
        dtype: target,
    }])
}

fn fill_like(
    ctx: &mut KernelContext<'_>,
    fill: f64,
) -> Result<Vec<TensorSpec>, KernelError> {
    let kernel = ctx.kernel_name.to_string();
    let x = ctx.input("x")?.clone();
    let len = x.size();
    let values = match x.dtype() {
        DType::Float32 => BackendValues::F32(vec![fill as f32; len]),
        DType::Int32 => BackendValues::I32(vec![fill as i32; len]),
        DType::Bool => BackendValues::Bool(vec![u8::from(fill != 0.0); len]),
        DType::Complex64 => {
            let mut out = vec![0.0f32; len * 2];
            for pair in out.chunks_exact_mut(2) {
                pair[0] = fill as f32;
            }
            BackendValues::C64(out)
        }
        DType::Str => {
            return Err(KernelError::DTypeUnsupported {
                kernel,
                dtype: DType::Str,
            })
        }
    };
    let data_id = ctx.backend.write(values, x.shape(), x.dtype())?;
    Ok(vec![TensorSpec {
        data_id,
        shape: x.shape().to_vec(),
        dtype: x.dtype(),
    }])
}

/// Full reduction to a scalar. The engine's gradient plumbing relies on it
/// to collapse broadcast gradients back to a size-one operand.
fn sum_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    let kernel = ctx.kernel_name.to_string();
    let (values, _, dtype) = read_input(ctx, "x")?;
    match values {
        BackendValues::F32(v) => {
            let total: f32 = v.iter().sum();
            let data_id = ctx
                .backend
                .write(BackendValues::F32(vec![total]), &[], DType::Float32)?;
            Ok(vec![TensorSpec {
                data_id,
                shape: Vec::new(),
                dtype: DType::Float32,
            }])
        }
        BackendValues::I32(v) => {
            let total = v.iter().fold(0i32, |acc, &x| acc.wrapping_add(x));
            let data_id = ctx
                .backend
                .write(BackendValues::I32(vec![total]), &[], DType::Int32)?;
            Ok(vec![TensorSpec {
                data_id,
                shape: Vec::new(),
                dtype: DType::Int32,
            }])
        }
        _ => Err(KernelError::DTypeUnsupported { kernel, dtype }),
    }
}

fn ones_like_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    fill_like(ctx, 1.0)
}

fn zeros_like_kernel(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError> {
    fill_like(ctx, 0.0)
}

/// Registers every CPU kernel. Meant to run once per registry, right after
/// the backend factory is registered.
pub fn register_cpu_kernels(registry: &mut KernelRegistry) {
    let kernels: [(&str, tp_registry::KernelFunc); 12] = [
        (names::ADD, add_kernel),
        (names::SUB, sub_kernel),
        (names::MULTIPLY, multiply_kernel),
        (names::REAL_DIV, real_div_kernel),
        (names::NEG, neg_kernel),
        (names::SQUARE, square_kernel),
        (names::SUM, sum_kernel),
        (names::IDENTITY, identity_kernel),
        (names::RESHAPE, reshape_kernel),
        (names::CAST, cast_kernel),
        (names::ONES_LIKE, ones_like_kernel),
        (names::ZEROS_LIKE, zeros_like_kernel),
    ];
    for (name, func) in kernels {
        registry.register_kernel(KernelConfig::new(name, BACKEND_NAME, func));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::{
        cpu_backend_factory, register_cpu_kernels, CpuBackend, BACKEND_NAME,
    };
    use tp_backend::{Backend, BackendError, BackendValues};
    use tp_core::{AttrValue, Attrs, DType, Tensor, TensorSpec};
    use tp_registry::{names, KernelContext, KernelRegistry};

    fn write_f32(backend: &mut CpuBackend, values: Vec<f32>, shape: &[usize]) -> Tensor {
        let data_id = backend
            .write(BackendValues::F32(values), shape, DType::Float32)
            .expect("write should succeed");
        Tensor::make(shape.to_vec(), DType::Float32, data_id)
    }

    fn run(
        backend: &mut CpuBackend,
        kernel: &str,
        inputs: BTreeMap<String, Tensor>,
        attrs: Attrs,
    ) -> Result<Vec<TensorSpec>, tp_registry::KernelError> {
        let mut registry = KernelRegistry::new();
        register_cpu_kernels(&mut registry);
        let config = registry
            .get_kernel(kernel, BACKEND_NAME)
            .expect("kernel should be registered");
        let mut ctx = KernelContext {
            kernel_name: kernel,
            backend,
            inputs: &inputs,
            attrs: &attrs,
        };
        (config.kernel_func)(&mut ctx)
    }

    fn read_f32(backend: &CpuBackend, spec: &TensorSpec) -> Vec<f32> {
        match backend.read_sync(spec.data_id).expect("read should succeed") {
            BackendValues::F32(v) => v,
            other => panic!("expected f32 values, got {other:?}"),
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut backend = CpuBackend::new();
        let t = write_f32(&mut backend, vec![1.0, 2.0, 3.0], &[3]);
        assert_eq!(backend.ref_count(t.data_id()), 1);
        assert_eq!(
            backend.read_sync(t.data_id()).expect("read should succeed"),
            BackendValues::F32(vec![1.0, 2.0, 3.0])
        );
    }

    #[test]
    fn dispose_honours_ref_counts() {
        let mut backend = CpuBackend::new();
        let t = write_f32(&mut backend, vec![1.0], &[1]);
        backend.inc_ref(t.data_id());

        assert!(!backend.dispose_data(t.data_id(), false));
        assert_eq!(backend.num_data_ids(), 1);
        assert!(backend.dispose_data(t.data_id(), false));
        assert_eq!(backend.num_data_ids(), 0);
        // Unknown ids are a successful no-op.
        assert!(backend.dispose_data(t.data_id(), false));
    }

    #[test]
    fn forced_dispose_ignores_outstanding_refs() {
        let mut backend = CpuBackend::new();
        let t = write_f32(&mut backend, vec![1.0], &[1]);
        backend.inc_ref(t.data_id());
        assert!(backend.dispose_data(t.data_id(), true));
        assert_eq!(backend.num_data_ids(), 0);
    }

    #[test]
    fn memory_flags_string_buffers_as_unreliable() {
        let mut backend = CpuBackend::new();
        assert!(!backend.memory().unreliable);
        backend
            .write(
                BackendValues::Bytes(vec![b"hi".to_vec()]),
                &[1],
                DType::Str,
            )
            .expect("write should succeed");
        let report = backend.memory();
        assert!(report.unreliable);
        assert_eq!(report.num_bytes, 2);
        assert!(!report.reasons.is_empty());
    }

    #[test]
    fn shape_mismatched_write_is_rejected() {
        let mut backend = CpuBackend::new();
        let err = backend
            .write(BackendValues::F32(vec![1.0, 2.0]), &[3], DType::Float32)
            .expect_err("mismatched write must fail");
        assert!(matches!(err, BackendError::Internal { .. }));
    }

    #[test]
    fn add_broadcasts_a_scalar_operand() {
        let mut backend = CpuBackend::new();
        let a = write_f32(&mut backend, vec![1.0, 2.0, 3.0], &[3]);
        let b = write_f32(&mut backend, vec![10.0], &[1]);

        let outs = run(
            &mut backend,
            names::ADD,
            tp_registry::binary_inputs(&a, &b),
            Attrs::new(),
        )
        .expect("add should succeed");
        assert_eq!(outs[0].shape, vec![3]);
        assert_eq!(read_f32(&backend, &outs[0]), vec![11.0, 12.0, 13.0]);
    }

    #[test]
    fn size_one_operands_keep_the_higher_rank_shape() {
        let mut backend = CpuBackend::new();
        let one = write_f32(&mut backend, vec![2.0], &[1]);
        let scalar = write_f32(&mut backend, vec![3.0], &[]);

        let outs = run(
            &mut backend,
            names::MULTIPLY,
            tp_registry::binary_inputs(&one, &scalar),
            Attrs::new(),
        )
        .expect("multiply should succeed");
        assert_eq!(outs[0].shape, vec![1]);
        assert_eq!(read_f32(&backend, &outs[0]), vec![6.0]);

        let outs = run(
            &mut backend,
            names::MULTIPLY,
            tp_registry::binary_inputs(&scalar, &one),
            Attrs::new(),
        )
        .expect("multiply should succeed");
        assert_eq!(outs[0].shape, vec![1]);
    }

    #[test]
    fn incompatible_shapes_are_rejected() {
        let mut backend = CpuBackend::new();
        let a = write_f32(&mut backend, vec![1.0, 2.0], &[2]);
        let b = write_f32(&mut backend, vec![1.0, 2.0, 3.0], &[3]);
        let err = run(
            &mut backend,
            names::MULTIPLY,
            tp_registry::binary_inputs(&a, &b),
            Attrs::new(),
        )
        .expect_err("mismatched shapes must fail");
        assert!(err.to_string().contains("incompatible operand shapes"));
    }

    #[test]
    fn int_add_stays_int_but_div_goes_float() {
        let mut backend = CpuBackend::new();
        let a_id = backend
            .write(BackendValues::I32(vec![4, 6]), &[2], DType::Int32)
            .expect("write should succeed");
        let b_id = backend
            .write(BackendValues::I32(vec![2, 2]), &[2], DType::Int32)
            .expect("write should succeed");
        let a = Tensor::make(vec![2], DType::Int32, a_id);
        let b = Tensor::make(vec![2], DType::Int32, b_id);

        let outs = run(
            &mut backend,
            names::ADD,
            tp_registry::binary_inputs(&a, &b),
            Attrs::new(),
        )
        .expect("int add should succeed");
        assert_eq!(outs[0].dtype, DType::Int32);

        let outs = run(
            &mut backend,
            names::REAL_DIV,
            tp_registry::binary_inputs(&a, &b),
            Attrs::new(),
        )
        .expect("int div should succeed");
        assert_eq!(outs[0].dtype, DType::Float32);
        assert_eq!(read_f32(&backend, &outs[0]), vec![2.0, 3.0]);
    }

    #[test]
    fn identity_aliases_the_buffer_with_an_extra_ref() {
        let mut backend = CpuBackend::new();
        let x = write_f32(&mut backend, vec![5.0], &[1]);

        let outs = run(
            &mut backend,
            names::IDENTITY,
            tp_registry::unary_inputs(&x),
            Attrs::new(),
        )
        .expect("identity should succeed");
        assert_eq!(outs[0].data_id, x.data_id());
        assert_eq!(backend.ref_count(x.data_id()), 2);
    }

    #[test]
    fn reshape_aliases_and_validates_size() {
        let mut backend = CpuBackend::new();
        let x = write_f32(&mut backend, vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);

        let mut attrs = Attrs::new();
        attrs.insert("shape".to_string(), AttrValue::IntVec(vec![4]));
        let outs = run(
            &mut backend,
            names::RESHAPE,
            tp_registry::unary_inputs(&x),
            attrs,
        )
        .expect("reshape should succeed");
        assert_eq!(outs[0].shape, vec![4]);
        assert_eq!(outs[0].data_id, x.data_id());

        let mut attrs = Attrs::new();
        attrs.insert("shape".to_string(), AttrValue::IntVec(vec![3]));
        let err = run(
            &mut backend,
            names::RESHAPE,
            tp_registry::unary_inputs(&x),
            attrs,
        )
        .expect_err("size-changing reshape must fail");
        assert!(err.to_string().contains("incompatible operand shapes"));
    }

    #[test]
    fn cast_covers_the_documented_conversions() {
        let mut backend = CpuBackend::new();
        let x = write_f32(&mut backend, vec![0.0, 1.5, -2.0], &[3]);

        let mut attrs = Attrs::new();
        attrs.insert(
            "dtype".to_string(),
            AttrValue::Str("int32".to_string()),
        );
        let outs = run(
            &mut backend,
            names::CAST,
            tp_registry::unary_inputs(&x),
            attrs,
        )
        .expect("cast should succeed");
        assert_eq!(
            backend
                .read_sync(outs[0].data_id)
                .expect("read should succeed"),
            BackendValues::I32(vec![0, 1, -2])
        );

        let mut attrs = Attrs::new();
        attrs.insert("dtype".to_string(), AttrValue::Str("bool".to_string()));
        let outs = run(
            &mut backend,
            names::CAST,
            tp_registry::unary_inputs(&x),
            attrs,
        )
        .expect("cast should succeed");
        assert_eq!(
            backend
                .read_sync(outs[0].data_id)
                .expect("read should succeed"),
            BackendValues::Bool(vec![0, 1, 1])
        );
    }

    #[test]
    fn sum_reduces_to_a_scalar() {
        let mut backend = CpuBackend::new();
        let x = write_f32(&mut backend, vec![1.5, 2.5, -1.0], &[3]);
        let outs = run(
            &mut backend,
            names::SUM,
            tp_registry::unary_inputs(&x),
            Attrs::new(),
        )
        .expect("sum should succeed");
        assert!(outs[0].shape.is_empty());
        assert_eq!(read_f32(&backend, &outs[0]), vec![3.0]);
    }

    #[test]
    fn ones_like_matches_shape_and_dtype() {
        let mut backend = CpuBackend::new();
        let x = write_f32(&mut backend, vec![3.0, 4.0], &[2]);
        let outs = run(
            &mut backend,
            names::ONES_LIKE,
            tp_registry::unary_inputs(&x),
            Attrs::new(),
        )
        .expect("ones_like should succeed");
        assert_eq!(read_f32(&backend, &outs[0]), vec![1.0, 1.0]);
    }

    #[test]
    fn factory_builds_a_named_backend() {
        let backend = cpu_backend_factory().expect("factory should succeed");
        assert_eq!(backend.name(), BACKEND_NAME);
    }

    #[test]
    fn timing_reports_kernel_and_wall_ms() {
        let mut backend = CpuBackend::new();
        let timing = backend
            .time(&mut |_backend| Ok(()))
            .expect("timing should succeed");
        assert!(timing.wall_ms >= 0.0);
        assert_eq!(timing.kernel_ms, Some(timing.wall_ms));
    }

    proptest! {
        #[test]
        fn prop_neg_is_an_involution(values in prop::collection::vec(-1e3f32..1e3, 1..32)) {
            let mut backend = CpuBackend::new();
            let shape = vec![values.len()];
            let x = write_f32(&mut backend, values.clone(), &shape);

            let once = run(
                &mut backend,
                names::NEG,
                tp_registry::unary_inputs(&x),
                Attrs::new(),
            ).expect("neg should succeed");
            let y = Tensor::make(once[0].shape.clone(), once[0].dtype, once[0].data_id);
            let twice = run(
                &mut backend,
                names::NEG,
                tp_registry::unary_inputs(&y),
                Attrs::new(),
            ).expect("neg should succeed");

            prop_assert_eq!(read_f32(&backend, &twice[0]), values);
        }

        #[test]
        fn prop_square_matches_multiply_by_self(values in prop::collection::vec(-30f32..30.0, 1..16)) {
            let mut backend = CpuBackend::new();
            let shape = vec![values.len()];
            let x = write_f32(&mut backend, values, &shape);

            let squared = run(
                &mut backend,
                names::SQUARE,
                tp_registry::unary_inputs(&x),
                Attrs::new(),
            ).expect("square should succeed");
            let product = run(
                &mut backend,
                names::MULTIPLY,
                tp_registry::binary_inputs(&x, &x),
                Attrs::new(),
            ).expect("multiply should succeed");

            prop_assert_eq!(
                read_f32(&backend, &squared[0]),
                read_f32(&backend, &product[0])
            );
        }
    }
}
