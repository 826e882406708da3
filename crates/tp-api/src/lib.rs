#![forbid(unsafe_code)]

use tp_registry::{
    binary_inputs, names, unary_inputs, DispatchError, GradConfig, GradContext,
    GradientRegistry, KernelDispatcher,
};

pub use tp_backend::BackendValues;
pub use tp_core::{AttrValue, Attrs, DType, Tensor, Variable};
pub use tp_engine::{Engine, EngineError, GradientResult, MemoryInfo, ProfileInfo};
pub use tp_serialize::{decode_weights, encode_weights, WeightSpec, WeightsManifest};

/// Wires the CPU backend, its kernel set, and the built-in gradient table
/// into an engine. Call once per engine before running ops.
pub fn install(engine: &mut Engine) {
    engine.register_backend(
        tp_kernel_cpu::BACKEND_NAME,
        tp_kernel_cpu::cpu_backend_factory,
        tp_kernel_cpu::BACKEND_PRIORITY,
    );
    tp_kernel_cpu::register_cpu_kernels(engine.kernel_registry_mut());
    register_builtin_gradients(engine.gradient_registry_mut());
}

/// A fresh engine with the stock CPU stack installed.
#[must_use]
pub fn engine() -> Engine {
    let mut engine = Engine::new();
    install(&mut engine);
    engine
}

// ---- constructors ----------------------------------------------------------

pub fn scalar(engine: &mut Engine, value: f32) -> Result<Tensor, EngineError> {
    engine.make_tensor(BackendValues::F32(vec![value]), Vec::new())
}

pub fn tensor_1d(engine: &mut Engine, values: &[f32]) -> Result<Tensor, EngineError> {
    engine.make_tensor(BackendValues::F32(values.to_vec()), vec![values.len()])
}

pub fn tensor_2d(
    engine: &mut Engine,
    values: &[f32],
    rows: usize,
    cols: usize,
) -> Result<Tensor, EngineError> {
    engine.make_tensor(BackendValues::F32(values.to_vec()), vec![rows, cols])
}

pub fn from_values(
    engine: &mut Engine,
    values: BackendValues,
    shape: Vec<usize>,
) -> Result<Tensor, EngineError> {
    engine.make_tensor(values, shape)
}

// ---- ops -------------------------------------------------------------------

pub fn add(engine: &mut Engine, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::ADD, &binary_inputs(a, b), &Attrs::new())
}

pub fn sub(engine: &mut Engine, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::SUB, &binary_inputs(a, b), &Attrs::new())
}

pub fn mul(engine: &mut Engine, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::MULTIPLY, &binary_inputs(a, b), &Attrs::new())
}

pub fn div(engine: &mut Engine, a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::REAL_DIV, &binary_inputs(a, b), &Attrs::new())
}

pub fn neg(engine: &mut Engine, x: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::NEG, &unary_inputs(x), &Attrs::new())
}

pub fn square(engine: &mut Engine, x: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::SQUARE, &unary_inputs(x), &Attrs::new())
}

pub fn sum(engine: &mut Engine, x: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::SUM, &unary_inputs(x), &Attrs::new())
}

pub fn cast(engine: &mut Engine, x: &Tensor, dtype: DType) -> Result<Tensor, EngineError> {
    let mut attrs = Attrs::new();
    attrs.insert(
        "dtype".to_string(),
        AttrValue::Str(dtype.as_str().to_string()),
    );
    engine.run_kernel_single(names::CAST, &unary_inputs(x), &attrs)
}

pub fn reshape(engine: &mut Engine, x: &Tensor, shape: &[usize]) -> Result<Tensor, EngineError> {
    let mut attrs = Attrs::new();
    attrs.insert(
        "shape".to_string(),
        AttrValue::IntVec(shape.iter().map(|&d| d as i64).collect()),
    );
    engine.run_kernel_single(names::RESHAPE, &unary_inputs(x), &attrs)
}

/// Identity-kernel clone: the new tensor shares the buffer but has its own
/// handle and tape participation.
pub fn clone_tensor(engine: &mut Engine, x: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::IDENTITY, &unary_inputs(x), &Attrs::new())
}

pub fn ones_like(engine: &mut Engine, x: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::ONES_LIKE, &unary_inputs(x), &Attrs::new())
}

pub fn zeros_like(engine: &mut Engine, x: &Tensor) -> Result<Tensor, EngineError> {
    engine.run_kernel_single(names::ZEROS_LIKE, &unary_inputs(x), &Attrs::new())
}

// ---- gradient helpers ------------------------------------------------------

/// Gradient of a scalar-producing (or implicitly summed) function at `x`.
pub fn grad<F>(engine: &mut Engine, x: &Tensor, f: F) -> Result<Tensor, EngineError>
where
    F: FnOnce(&mut Engine, &Tensor) -> Result<Tensor, EngineError>,
{
    let (value, grad) = value_and_grad(engine, x, f)?;
    engine.dispose(&value);
    Ok(grad)
}

pub fn value_and_grad<F>(
    engine: &mut Engine,
    x: &Tensor,
    f: F,
) -> Result<(Tensor, Tensor), EngineError>
where
    F: FnOnce(&mut Engine, &Tensor) -> Result<Tensor, EngineError>,
{
    let result = engine.gradients(
        |engine| f(engine, x),
        std::slice::from_ref(x),
        None,
        false,
    )?;
    let grad = result.grads.into_iter().next().flatten();
    let grad = grad.ok_or(EngineError::DisconnectedGraph)?;
    Ok((result.value, grad))
}

// ---- built-in gradients ----------------------------------------------------

/// Collapses an upstream gradient onto an input that may have been a
/// broadcast size-one operand: same shape passes through, a size-one target
/// gets the full sum reshaped to its shape.
fn reduce_to(
    engine: &mut dyn KernelDispatcher,
    dy: &Tensor,
    target: &Tensor,
) -> Result<Tensor, DispatchError> {
    if dy.shape() == target.shape() {
        let out = engine.run_kernel(names::IDENTITY, &unary_inputs(dy), &Attrs::new())?;
        return Ok(out[0].clone());
    }
    let summed = engine.run_kernel(names::SUM, &unary_inputs(dy), &Attrs::new())?;
    let mut attrs = Attrs::new();
    attrs.insert(
        "shape".to_string(),
        AttrValue::IntVec(target.shape().iter().map(|&d| d as i64).collect()),
    );
    let out = engine.run_kernel(names::RESHAPE, &unary_inputs(&summed[0]), &attrs)?;
    Ok(out[0].clone())
}

fn grad_identity(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    let out = engine.run_kernel(names::IDENTITY, &unary_inputs(&ctx.dys[0]), &Attrs::new())?;
    Ok(vec![("x".to_string(), out[0].clone())])
}

fn grad_add(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    let (a, b) = (&ctx.saved[0], &ctx.saved[1]);
    let dy = &ctx.dys[0];
    let da = reduce_to(engine, dy, a)?;
    let db = reduce_to(engine, dy, b)?;
    Ok(vec![("a".to_string(), da), ("b".to_string(), db)])
}

fn grad_sub(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    let (a, b) = (&ctx.saved[0], &ctx.saved[1]);
    let dy = &ctx.dys[0];
    let da = reduce_to(engine, dy, a)?;
    let negated = engine.run_kernel(names::NEG, &unary_inputs(dy), &Attrs::new())?;
    let db = reduce_to(engine, &negated[0], b)?;
    Ok(vec![("a".to_string(), da), ("b".to_string(), db)])
}

fn grad_multiply(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    let (a, b) = (&ctx.saved[0], &ctx.saved[1]);
    let dy = &ctx.dys[0];
    let dy_b = engine.run_kernel(names::MULTIPLY, &binary_inputs(dy, b), &Attrs::new())?;
    let da = reduce_to(engine, &dy_b[0], a)?;
    let dy_a = engine.run_kernel(names::MULTIPLY, &binary_inputs(dy, a), &Attrs::new())?;
    let db = reduce_to(engine, &dy_a[0], b)?;
    Ok(vec![("a".to_string(), da), ("b".to_string(), db)])
}

fn grad_real_div(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    let (a, b) = (&ctx.saved[0], &ctx.saved[1]);
    let dy = &ctx.dys[0];
    let dy_over_b = engine.run_kernel(names::REAL_DIV, &binary_inputs(dy, b), &Attrs::new())?;
    let da = reduce_to(engine, &dy_over_b[0], a)?;

    let dy_a = engine.run_kernel(names::MULTIPLY, &binary_inputs(dy, a), &Attrs::new())?;
    let b_sq = engine.run_kernel(names::MULTIPLY, &binary_inputs(b, b), &Attrs::new())?;
    let ratio = engine.run_kernel(
        names::REAL_DIV,
        &binary_inputs(&dy_a[0], &b_sq[0]),
        &Attrs::new(),
    )?;
    let negated = engine.run_kernel(names::NEG, &unary_inputs(&ratio[0]), &Attrs::new())?;
    let db = reduce_to(engine, &negated[0], b)?;
    Ok(vec![("a".to_string(), da), ("b".to_string(), db)])
}

fn grad_neg(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    let out = engine.run_kernel(names::NEG, &unary_inputs(&ctx.dys[0]), &Attrs::new())?;
    Ok(vec![("x".to_string(), out[0].clone())])
}

fn grad_square(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    let x = &ctx.saved[0];
    let two = engine.fill(&[], DType::Float32, 2.0)?;
    let scaled = engine.run_kernel(names::MULTIPLY, &binary_inputs(x, &two), &Attrs::new())?;
    let out = engine.run_kernel(
        names::MULTIPLY,
        &binary_inputs(&ctx.dys[0], &scaled[0]),
        &Attrs::new(),
    )?;
    Ok(vec![("x".to_string(), out[0].clone())])
}

fn grad_sum(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    let x = &ctx.saved[0];
    let ones = engine.fill(x.shape(), DType::Float32, 1.0)?;
    let out = engine.run_kernel(
        names::MULTIPLY,
        &binary_inputs(&ones, &ctx.dys[0]),
        &Attrs::new(),
    )?;
    Ok(vec![("x".to_string(), out[0].clone())])
}

fn grad_cast(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    // Gradients stay float32 regardless of the forward cast.
    let out = engine.run_kernel(names::IDENTITY, &unary_inputs(&ctx.dys[0]), &Attrs::new())?;
    Ok(vec![("x".to_string(), out[0].clone())])
}

fn grad_reshape(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    let x = &ctx.saved[0];
    let mut attrs = Attrs::new();
    attrs.insert(
        "shape".to_string(),
        AttrValue::IntVec(x.shape().iter().map(|&d| d as i64).collect()),
    );
    let out = engine.run_kernel(names::RESHAPE, &unary_inputs(&ctx.dys[0]), &attrs)?;
    Ok(vec![("x".to_string(), out[0].clone())])
}

fn grad_fill_like(
    engine: &mut dyn KernelDispatcher,
    ctx: &GradContext,
) -> Result<Vec<(String, Tensor)>, DispatchError> {
    // The output is constant in the input; the gradient is all zeros.
    let x = &ctx.saved[0];
    let out = engine.fill(x.shape(), DType::Float32, 0.0)?;
    Ok(vec![("x".to_string(), out)])
}

fn unary_saving_x(kernel_name: &str, grad_func: tp_registry::GradFunc) -> GradConfig {
    GradConfig {
        kernel_name: kernel_name.to_string(),
        inputs_to_save: vec!["x".to_string()],
        save_all_inputs: false,
        outputs_to_save: Vec::new(),
        grad_func,
    }
}

fn binary_saving_all(kernel_name: &str, grad_func: tp_registry::GradFunc) -> GradConfig {
    GradConfig {
        kernel_name: kernel_name.to_string(),
        inputs_to_save: Vec::new(),
        save_all_inputs: true,
        outputs_to_save: Vec::new(),
        grad_func,
    }
}

/// Gradient definitions for the stock kernel set.
pub fn register_builtin_gradients(registry: &mut GradientRegistry) {
    registry.register_gradient(GradConfig {
        kernel_name: names::IDENTITY.to_string(),
        inputs_to_save: Vec::new(),
        save_all_inputs: false,
        outputs_to_save: Vec::new(),
        grad_func: grad_identity,
    });
    registry.register_gradient(GradConfig {
        kernel_name: names::CAST.to_string(),
        inputs_to_save: Vec::new(),
        save_all_inputs: false,
        outputs_to_save: Vec::new(),
        grad_func: grad_cast,
    });
    registry.register_gradient(binary_saving_all(names::ADD, grad_add));
    registry.register_gradient(binary_saving_all(names::SUB, grad_sub));
    registry.register_gradient(binary_saving_all(names::MULTIPLY, grad_multiply));
    registry.register_gradient(binary_saving_all(names::REAL_DIV, grad_real_div));
    registry.register_gradient(GradConfig {
        kernel_name: names::NEG.to_string(),
        inputs_to_save: Vec::new(),
        save_all_inputs: false,
        outputs_to_save: Vec::new(),
        grad_func: grad_neg,
    });
    registry.register_gradient(unary_saving_x(names::SQUARE, grad_square));
    registry.register_gradient(unary_saving_x(names::SUM, grad_sum));
    registry.register_gradient(unary_saving_x(names::RESHAPE, grad_reshape));
    registry.register_gradient(unary_saving_x(names::ONES_LIKE, grad_fill_like));
    registry.register_gradient(unary_saving_x(names::ZEROS_LIKE, grad_fill_like));
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        add, cast, clone_tensor, div, engine, grad, mul, neg, ones_like, reshape, scalar,
        square, sub, sum, tensor_1d, tensor_2d, value_and_grad, zeros_like,
    };
    use tp_core::DType;
    use tp_engine::EngineError;

    #[test]
    fn arithmetic_ops_compute_elementwise() {
        let mut engine = engine();
        let a = tensor_1d(&mut engine, &[1.0, 2.0, 3.0]).expect("tensor should build");
        let b = tensor_1d(&mut engine, &[4.0, 5.0, 6.0]).expect("tensor should build");

        let sums = add(&mut engine, &a, &b).expect("add should succeed");
        assert_eq!(engine.read_f32(&sums).expect("readable"), vec![5.0, 7.0, 9.0]);

        let diffs = sub(&mut engine, &b, &a).expect("sub should succeed");
        assert_eq!(engine.read_f32(&diffs).expect("readable"), vec![3.0, 3.0, 3.0]);

        let products = mul(&mut engine, &a, &b).expect("mul should succeed");
        assert_eq!(
            engine.read_f32(&products).expect("readable"),
            vec![4.0, 10.0, 18.0]
        );

        let ratios = div(&mut engine, &b, &a).expect("div should succeed");
        assert_eq!(engine.read_f32(&ratios).expect("readable"), vec![4.0, 2.5, 2.0]);

        let negated = neg(&mut engine, &a).expect("neg should succeed");
        assert_eq!(
            engine.read_f32(&negated).expect("readable"),
            vec![-1.0, -2.0, -3.0]
        );
    }

    #[test]
    fn scalar_operands_broadcast() {
        let mut engine = engine();
        let a = tensor_1d(&mut engine, &[1.0, 2.0]).expect("tensor should build");
        let s = scalar(&mut engine, 10.0).expect("scalar should build");

        let out = mul(&mut engine, &a, &s).expect("mul should succeed");
        assert_eq!(engine.read_f32(&out).expect("readable"), vec![10.0, 20.0]);
    }

    #[test]
    fn shape_ops_preserve_values() {
        let mut engine = engine();
        let x = tensor_2d(&mut engine, &[1.0, 2.0, 3.0, 4.0], 2, 2).expect("tensor should build");

        let flat = reshape(&mut engine, &x, &[4]).expect("reshape should succeed");
        assert_eq!(flat.shape(), &[4]);
        assert_eq!(
            engine.read_f32(&flat).expect("readable"),
            vec![1.0, 2.0, 3.0, 4.0]
        );

        let ones = ones_like(&mut engine, &x).expect("ones_like should succeed");
        assert_eq!(engine.read_f32(&ones).expect("readable"), vec![1.0; 4]);
        let zeros = zeros_like(&mut engine, &x).expect("zeros_like should succeed");
        assert_eq!(engine.read_f32(&zeros).expect("readable"), vec![0.0; 4]);

        let ints = cast(&mut engine, &x, DType::Int32).expect("cast should succeed");
        assert_eq!(ints.dtype(), DType::Int32);
    }

    #[test]
    fn grad_of_square_matches_analytic_form() {
        let mut engine = engine();
        for shape_values in [
            vec![3.0f32],
            vec![1.0, -2.0, 0.5],
            vec![1.0, 2.0, 3.0, 4.0],
        ] {
            let x = tensor_1d(&mut engine, &shape_values).expect("tensor should build");
            let g = grad(&mut engine, &x, |engine, x| square(engine, x))
                .expect("grad should succeed");
            let got = engine.read_f32(&g).expect("readable");
            for (g, v) in got.iter().zip(&shape_values) {
                assert!((g - 2.0 * v).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn grad_of_square_works_for_2d_shapes() {
        let mut engine = engine();
        let x = tensor_2d(&mut engine, &[1.0, -2.0, 3.0, -4.0], 2, 2).expect("tensor builds");
        let g = grad(&mut engine, &x, |engine, x| square(engine, x)).expect("grad succeeds");
        assert_eq!(g.shape(), &[2, 2]);
        assert_eq!(
            engine.read_f32(&g).expect("readable"),
            vec![2.0, -4.0, 6.0, -8.0]
        );
    }

    #[test]
    fn grad_of_x_plus_x_is_two() {
        let mut engine = engine();
        let x = tensor_1d(&mut engine, &[7.0, -3.0]).expect("tensor should build");
        let g = grad(&mut engine, &x, |engine, x| add(engine, x, x)).expect("grad succeeds");
        assert_eq!(engine.read_f32(&g).expect("readable"), vec![2.0, 2.0]);
    }

    #[test]
    fn grad_through_broadcast_collapses_to_the_scalar() {
        let mut engine = engine();
        let s = scalar(&mut engine, 3.0).expect("scalar should build");
        let weights = tensor_1d(&mut engine, &[1.0, 2.0, 4.0]).expect("tensor should build");

        // d/ds sum(s * w) = sum(w) = 7.
        let g = grad(&mut engine, &s, |engine, s| {
            let scaled = mul(engine, s, &weights)?;
            sum(engine, &scaled)
        })
        .expect("grad should succeed");
        assert_eq!(g.shape(), s.shape());
        assert_eq!(engine.read_f32(&g).expect("readable"), vec![7.0]);
    }

    #[test]
    fn grad_of_division_uses_the_quotient_rule() {
        let mut engine = engine();
        let a = tensor_1d(&mut engine, &[6.0]).expect("tensor should build");
        let b = tensor_1d(&mut engine, &[2.0]).expect("tensor should build");

        // d/db (a / b) = -a / b^2 = -1.5 at a=6, b=2.
        let g = grad(&mut engine, &b, |engine, b| div(engine, &a, b))
            .expect("grad should succeed");
        assert_eq!(engine.read_f32(&g).expect("readable"), vec![-1.5]);
    }

    #[test]
    fn grad_flows_through_reshape() {
        let mut engine = engine();
        let x = tensor_1d(&mut engine, &[1.0, 2.0, 3.0, 4.0]).expect("tensor should build");
        let g = grad(&mut engine, &x, |engine, x| {
            let grid = reshape(engine, x, &[2, 2])?;
            square(engine, &grid)
        })
        .expect("grad should succeed");
        assert_eq!(g.shape(), &[4]);
        assert_eq!(
            engine.read_f32(&g).expect("readable"),
            vec![2.0, 4.0, 6.0, 8.0]
        );
    }

    #[test]
    fn value_and_grad_returns_both() {
        let mut engine = engine();
        let x = tensor_1d(&mut engine, &[3.0]).expect("tensor should build");
        let (value, g) =
            value_and_grad(&mut engine, &x, |engine, x| square(engine, x))
                .expect("value_and_grad should succeed");
        assert_eq!(engine.read_f32(&value).expect("readable"), vec![9.0]);
        assert_eq!(engine.read_f32(&g).expect("readable"), vec![6.0]);
    }

    #[test]
    fn grad_of_an_unused_input_is_a_disconnected_graph() {
        let mut engine = engine();
        let x = tensor_1d(&mut engine, &[1.0]).expect("tensor should build");
        let other = tensor_1d(&mut engine, &[5.0]).expect("tensor should build");

        let err = grad(&mut engine, &x, |engine, _x| square(engine, &other))
            .expect_err("unused input must fail");
        assert!(matches!(err, EngineError::DisconnectedGraph));
    }

    #[test]
    fn clone_does_not_alias_disposal() {
        let mut engine = engine();
        let a = tensor_1d(&mut engine, &[1.0, 2.0, 3.0]).expect("tensor should build");
        let b = clone_tensor(&mut engine, &a).expect("clone should succeed");

        engine.dispose(&a);
        assert_eq!(
            engine.read_f32(&b).expect("clone outlives the original"),
            vec![1.0, 2.0, 3.0]
        );
    }

    proptest! {
        #[test]
        fn prop_sum_rule_grad_matches_parts(
            values in prop::collection::vec(-20f32..20.0, 1..12)
        ) {
            // d/dx (x^2 + x) = 2x + 1.
            let mut engine = engine();
            let x = tensor_1d(&mut engine, &values).expect("tensor should build");
            let g = grad(&mut engine, &x, |engine, x| {
                let squared = square(engine, x)?;
                add(engine, &squared, x)
            })
            .expect("grad should succeed");
            let got = engine.read_f32(&g).expect("readable");
            for (g, v) in got.iter().zip(&values) {
                prop_assert!((g - (2.0 * v + 1.0)).abs() < 1e-4);
            }
        }

        #[test]
        fn prop_product_rule_for_x_times_x(
            values in prop::collection::vec(-10f32..10.0, 1..8)
        ) {
            let mut engine = engine();
            let x = tensor_1d(&mut engine, &values).expect("tensor should build");
            let g = grad(&mut engine, &x, |engine, x| mul(engine, x, x))
                .expect("grad should succeed");
            let got = engine.read_f32(&g).expect("readable");
            for (g, v) in got.iter().zip(&values) {
                prop_assert!((g - 2.0 * v).abs() < 1e-4);
            }
        }
    }
}
