#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use tp_backend::{Backend, BackendError};
use tp_core::{Attrs, DType, Tensor, TensorSpec};

/// Canonical kernel names shared by kernel implementations, gradient
/// definitions, and the dispatch sites that invoke them.
pub mod names {
    pub const ADD: &str = "Add";
    pub const SUB: &str = "Sub";
    pub const MULTIPLY: &str = "Multiply";
    pub const REAL_DIV: &str = "RealDiv";
    pub const NEG: &str = "Neg";
    pub const SQUARE: &str = "Square";
    pub const SUM: &str = "Sum";
    pub const RESHAPE: &str = "Reshape";
    pub const IDENTITY: &str = "Identity";
    pub const CAST: &str = "Cast";
    pub const ONES_LIKE: &str = "OnesLike";
    pub const ZEROS_LIKE: &str = "ZerosLike";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    MissingInput {
        kernel: String,
        input: String,
    },
    MissingAttr {
        kernel: String,
        attr: String,
    },
    ShapeMismatch {
        kernel: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    DTypeUnsupported {
        kernel: String,
        dtype: DType,
    },
    Unsupported {
        kernel: String,
        reason: String,
    },
    Backend(BackendError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingInput { kernel, input } => {
                write!(f, "kernel '{kernel}' expected input '{input}'")
            }
            Self::MissingAttr { kernel, attr } => {
                write!(f, "kernel '{kernel}' expected attribute '{attr}'")
            }
            Self::ShapeMismatch { kernel, lhs, rhs } => write!(
                f,
                "kernel '{kernel}' got incompatible operand shapes {lhs:?} and {rhs:?}"
            ),
            Self::DTypeUnsupported { kernel, dtype } => {
                write!(f, "kernel '{kernel}' does not support dtype {dtype}")
            }
            Self::Unsupported { kernel, reason } => {
                write!(f, "kernel '{kernel}': {reason}")
            }
            Self::Backend(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for KernelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BackendError> for KernelError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

/// Everything a kernel sees for one invocation. Input handles are resolved by
/// the engine; the kernel touches buffers only through the backend.
pub struct KernelContext<'a> {
    pub kernel_name: &'a str,
    pub backend: &'a mut dyn Backend,
    pub inputs: &'a BTreeMap<String, Tensor>,
    pub attrs: &'a Attrs,
}

impl KernelContext<'_> {
    pub fn input(&self, name: &str) -> Result<&Tensor, KernelError> {
        self.inputs.get(name).ok_or_else(|| KernelError::MissingInput {
            kernel: self.kernel_name.to_string(),
            input: name.to_string(),
        })
    }
}

/// A kernel maps resolved inputs to fresh (or aliased) backend buffers.
pub type KernelFunc = fn(&mut KernelContext<'_>) -> Result<Vec<TensorSpec>, KernelError>;

/// One-time hook run when a kernel is attached to or detached from a live
/// backend instance.
pub type KernelLifecycleFunc = fn(&mut dyn Backend);

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub kernel_name: String,
    pub backend_name: String,
    pub kernel_func: KernelFunc,
    pub setup_func: Option<KernelLifecycleFunc>,
    pub dispose_func: Option<KernelLifecycleFunc>,
}

impl KernelConfig {
    #[must_use]
    pub fn new(kernel_name: &str, backend_name: &str, kernel_func: KernelFunc) -> Self {
        Self {
            kernel_name: kernel_name.to_string(),
            backend_name: backend_name.to_string(),
            kernel_func,
            setup_func: None,
            dispose_func: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    KernelNotRegistered { kernel: String, backend: String },
    GradientNotRegistered { kernel: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KernelNotRegistered { kernel, backend } => write!(
                f,
                "kernel '{kernel}' is not registered for backend '{backend}'"
            ),
            Self::GradientNotRegistered { kernel } => {
                write!(f, "no gradient registered for kernel '{kernel}'")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Kernels keyed by `(kernel name, backend name)`. Re-registering a key is
/// last-write-wins with a warning, which lets tests and alternate backends
/// shadow stock kernels.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: BTreeMap<(String, String), KernelConfig>,
}

impl KernelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_kernel(&mut self, config: KernelConfig) {
        let key = (config.kernel_name.clone(), config.backend_name.clone());
        if self.kernels.contains_key(&key) {
            log::warn!(
                "kernel '{}' for backend '{}' is already registered, overwriting",
                key.0,
                key.1
            );
        }
        self.kernels.insert(key, config);
    }

    #[must_use]
    pub fn get_kernel(&self, kernel_name: &str, backend_name: &str) -> Option<&KernelConfig> {
        self.kernels
            .get(&(kernel_name.to_string(), backend_name.to_string()))
    }

    /// All kernels registered for one backend, in name order.
    #[must_use]
    pub fn kernels_for_backend(&self, backend_name: &str) -> Vec<&KernelConfig> {
        self.kernels
            .values()
            .filter(|config| config.backend_name == backend_name)
            .collect()
    }

    /// Re-registers every kernel of `source_backend` under `dest_backend`,
    /// so a derived backend starts from the full stock kernel set.
    pub fn copy_registered_kernels(&mut self, source_backend: &str, dest_backend: &str) {
        let copies: Vec<KernelConfig> = self
            .kernels_for_backend(source_backend)
            .into_iter()
            .cloned()
            .collect();
        for mut config in copies {
            config.backend_name = dest_backend.to_string();
            self.register_kernel(config);
        }
    }

    pub fn unregister_kernel(
        &mut self,
        kernel_name: &str,
        backend_name: &str,
    ) -> Result<KernelConfig, RegistryError> {
        self.kernels
            .remove(&(kernel_name.to_string(), backend_name.to_string()))
            .ok_or_else(|| RegistryError::KernelNotRegistered {
                kernel: kernel_name.to_string(),
                backend: backend_name.to_string(),
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

/// Upstream gradients and saved values handed to a gradient function.
pub struct GradContext {
    /// One upstream gradient per recorded output, in output order.
    pub dys: Vec<Tensor>,
    /// Tensors the forward pass saved, per the gradient config's save lists.
    pub saved: Vec<Tensor>,
    pub attrs: Attrs,
}

/// A gradient function maps upstream gradients to per-input gradients, named
/// by the forward kernel's input names. It dispatches kernels like any other
/// caller, so gradients-of-gradients record onto the tape as usual.
pub type GradFunc =
    fn(&mut dyn KernelDispatcher, &GradContext) -> Result<Vec<(String, Tensor)>, DispatchError>;

#[derive(Debug, Clone)]
pub struct GradConfig {
    pub kernel_name: String,
    /// Forward inputs the tape must keep alive for the backward pass.
    pub inputs_to_save: Vec<String>,
    pub save_all_inputs: bool,
    /// Per-output flags; outputs marked `true` are saved for the backward
    /// pass. Shorter lists leave trailing outputs unsaved.
    pub outputs_to_save: Vec<bool>,
    pub grad_func: GradFunc,
}

/// Gradient definitions keyed by kernel name, backend-independent.
#[derive(Default)]
pub struct GradientRegistry {
    gradients: BTreeMap<String, GradConfig>,
}

impl GradientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_gradient(&mut self, config: GradConfig) {
        if self.gradients.contains_key(&config.kernel_name) {
            log::warn!(
                "overriding the gradient for kernel '{}'",
                config.kernel_name
            );
        }
        self.gradients.insert(config.kernel_name.clone(), config);
    }

    #[must_use]
    pub fn get_gradient(&self, kernel_name: &str) -> Option<&GradConfig> {
        self.gradients.get(kernel_name)
    }

    pub fn unregister_gradient(&mut self, kernel_name: &str) -> Result<GradConfig, RegistryError> {
        self.gradients
            .remove(kernel_name)
            .ok_or_else(|| RegistryError::GradientNotRegistered {
                kernel: kernel_name.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    MissingKernel { kernel: String, backend: String },
    Kernel(KernelError),
    Backend(BackendError),
    Internal { reason: String },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKernel { kernel, backend } => write!(
                f,
                "kernel '{kernel}' is not registered for backend '{backend}'"
            ),
            Self::Kernel(err) => write!(f, "{err}"),
            Self::Backend(err) => write!(f, "{err}"),
            Self::Internal { reason } => write!(f, "dispatch failure: {reason}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Kernel(err) => Some(err),
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KernelError> for DispatchError {
    fn from(err: KernelError) -> Self {
        Self::Kernel(err)
    }
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

/// Seam gradient functions dispatch through. The engine implements this, so
/// backward passes reuse the same tracking, taping, and scoping as forward
/// calls without the registries depending on the engine crate.
pub trait KernelDispatcher {
    fn run_kernel(
        &mut self,
        kernel_name: &str,
        inputs: &BTreeMap<String, Tensor>,
        attrs: &Attrs,
    ) -> Result<Vec<Tensor>, DispatchError>;

    /// Materializes a constant-filled tensor, used for gradient seeds and
    /// zero fills.
    fn fill(&mut self, shape: &[usize], dtype: DType, value: f64)
        -> Result<Tensor, DispatchError>;
}

/// Convenience for unary dispatch: wraps a single tensor under the canonical
/// input name `x`.
#[must_use]
pub fn unary_inputs(x: &Tensor) -> BTreeMap<String, Tensor> {
    let mut inputs = BTreeMap::new();
    inputs.insert("x".to_string(), x.clone());
    inputs
}

/// Convenience for binary dispatch under the canonical names `a` and `b`.
#[must_use]
pub fn binary_inputs(a: &Tensor, b: &Tensor) -> BTreeMap<String, Tensor> {
    let mut inputs = BTreeMap::new();
    inputs.insert("a".to_string(), a.clone());
    inputs.insert("b".to_string(), b.clone());
    inputs
}

#[cfg(test)]
mod tests {
    use super::{
        binary_inputs, names, unary_inputs, DispatchError, GradConfig, GradContext,
        GradientRegistry, KernelConfig, KernelContext, KernelDispatcher, KernelError,
        KernelRegistry, RegistryError,
    };
    use tp_core::{DType, DataId, Tensor, TensorSpec};

    fn noop_kernel(
        _ctx: &mut KernelContext<'_>,
    ) -> Result<Vec<TensorSpec>, KernelError> {
        Ok(Vec::new())
    }

    fn other_kernel(
        ctx: &mut KernelContext<'_>,
    ) -> Result<Vec<TensorSpec>, KernelError> {
        let x = ctx.input("x")?;
        Ok(vec![TensorSpec {
            data_id: x.data_id(),
            shape: x.shape().to_vec(),
            dtype: x.dtype(),
        }])
    }

    fn noop_grad(
        _engine: &mut dyn KernelDispatcher,
        _ctx: &GradContext,
    ) -> Result<Vec<(String, Tensor)>, DispatchError> {
        Ok(Vec::new())
    }

    #[test]
    fn registration_is_keyed_by_kernel_and_backend() {
        let mut registry = KernelRegistry::new();
        registry.register_kernel(KernelConfig::new(names::ADD, "cpu", noop_kernel));
        registry.register_kernel(KernelConfig::new(names::ADD, "webgl", noop_kernel));

        assert!(registry.get_kernel(names::ADD, "cpu").is_some());
        assert!(registry.get_kernel(names::ADD, "webgl").is_some());
        assert!(registry.get_kernel(names::SUB, "cpu").is_none());
        assert_eq!(registry.kernels_for_backend("cpu").len(), 1);
    }

    #[test]
    fn re_registration_is_last_write_wins() {
        let mut registry = KernelRegistry::new();
        registry.register_kernel(KernelConfig::new(names::NEG, "cpu", noop_kernel));
        registry.register_kernel(KernelConfig::new(names::NEG, "cpu", other_kernel));

        assert_eq!(registry.len(), 1);
        let config = registry
            .get_kernel(names::NEG, "cpu")
            .expect("kernel should exist");
        assert_eq!(config.kernel_func as usize, other_kernel as usize);
    }

    #[test]
    fn copying_kernels_rekeys_the_backend() {
        let mut registry = KernelRegistry::new();
        registry.register_kernel(KernelConfig::new(names::ADD, "cpu", noop_kernel));
        registry.register_kernel(KernelConfig::new(names::NEG, "cpu", noop_kernel));

        registry.copy_registered_kernels("cpu", "cpu-forked");
        assert_eq!(registry.kernels_for_backend("cpu-forked").len(), 2);
        assert_eq!(registry.kernels_for_backend("cpu").len(), 2);
    }

    #[test]
    fn unregistering_an_absent_kernel_fails() {
        let mut registry = KernelRegistry::new();
        let err = registry
            .unregister_kernel(names::CAST, "cpu")
            .expect_err("absent kernel must fail");
        assert_eq!(
            err,
            RegistryError::KernelNotRegistered {
                kernel: names::CAST.to_string(),
                backend: "cpu".to_string(),
            }
        );
    }

    #[test]
    fn gradient_registry_is_backend_independent() {
        let mut registry = GradientRegistry::new();
        registry.register_gradient(GradConfig {
            kernel_name: names::SQUARE.to_string(),
            inputs_to_save: vec!["x".to_string()],
            save_all_inputs: false,
            outputs_to_save: Vec::new(),
            grad_func: noop_grad,
        });

        let config = registry
            .get_gradient(names::SQUARE)
            .expect("gradient should exist");
        assert_eq!(config.inputs_to_save, vec!["x".to_string()]);

        let err = registry
            .unregister_gradient(names::ADD)
            .expect_err("absent gradient must fail");
        assert!(err.to_string().contains("no gradient registered"));
    }

    #[test]
    fn canonical_input_maps_use_stable_names() {
        let x = Tensor::make(vec![2], DType::Float32, DataId::fresh());
        let y = Tensor::make(vec![2], DType::Float32, DataId::fresh());

        let unary = unary_inputs(&x);
        assert_eq!(unary.keys().collect::<Vec<_>>(), vec!["x"]);

        let binary = binary_inputs(&x, &y);
        assert_eq!(binary.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(binary["a"].id(), x.id());
    }
}
