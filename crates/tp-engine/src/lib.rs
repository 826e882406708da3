#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use tp_backend::{Backend, BackendError, BackendFactory, BackendValues, KernelTiming};
use tp_core::{
    size_from_shape, validate_buffer_size, Attrs, DType, DataId, ShapeError, Tensor,
    TensorContainer, TensorId, TensorSpec, Variable,
};
use tp_env::{EnvError, Environment, FlagValue};
use tp_registry::{
    binary_inputs, names, DispatchError, GradContext, GradientRegistry, KernelContext,
    KernelDispatcher, KernelRegistry,
};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    BackendNotRegistered {
        name: String,
    },
    BackendInitFailed {
        name: String,
        reason: String,
    },
    AllBackendsFailed,
    Dispatch(DispatchError),
    Backend(BackendError),
    Env(EnvError),
    Shape(ShapeError),
    DisposedTensor {
        id: TensorId,
    },
    MemoryLeak {
        kernel: String,
        leaked: usize,
    },
    DuplicateVariable {
        name: String,
    },
    UnknownVariable {
        name: String,
    },
    VariableDTypeMismatch {
        name: String,
        expected: DType,
        actual: DType,
    },
    VariableShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    DisconnectedGraph,
    OutputNotFloat {
        actual: DType,
    },
    SeedDTypeMismatch {
        actual: DType,
    },
    MissingGradientDef {
        kernel: String,
    },
    MissingInputGradient {
        kernel: String,
        input: String,
    },
    SeedShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    GradientDTypeMismatch {
        kernel: String,
        input: String,
        actual: DType,
    },
    GradientShapeMismatch {
        kernel: String,
        input: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    ReadDTypeMismatch {
        expected: &'static str,
        actual: DType,
    },
    Internal {
        reason: String,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackendNotRegistered { name } => {
                write!(f, "backend '{name}' was never registered")
            }
            Self::BackendInitFailed { name, reason } => {
                write!(f, "backend '{name}' failed to initialize: {reason}")
            }
            Self::AllBackendsFailed => {
                write!(f, "no registered backend could be initialized")
            }
            Self::Dispatch(err) => write!(f, "{err}"),
            Self::Backend(err) => write!(f, "{err}"),
            Self::Env(err) => write!(f, "{err}"),
            Self::Shape(err) => write!(f, "{err}"),
            Self::DisposedTensor { id } => {
                write!(f, "tensor {} is disposed and can no longer be used", id.0)
            }
            Self::MemoryLeak { kernel, leaked } => write!(
                f,
                "kernel '{kernel}' leaked {leaked} data id(s) not attributable to its outputs"
            ),
            Self::DuplicateVariable { name } => {
                write!(f, "a variable named '{name}' is already registered")
            }
            Self::UnknownVariable { name } => {
                write!(f, "no variable named '{name}' is registered")
            }
            Self::VariableDTypeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "variable '{name}' has dtype {expected}, cannot assign {actual}"
            ),
            Self::VariableShapeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "variable '{name}' has shape {expected:?}, cannot assign shape {actual:?}"
            ),
            Self::DisconnectedGraph => write!(
                f,
                "no path on the tape connects the inputs to the output; \
                 the traced function must use its inputs"
            ),
            Self::OutputNotFloat { actual } => write!(
                f,
                "gradients require a float32 output, got {actual}"
            ),
            Self::SeedDTypeMismatch { actual } => {
                write!(f, "the gradient seed must be float32, got {actual}")
            }
            Self::MissingGradientDef { kernel } => write!(
                f,
                "cannot backpropagate through kernel '{kernel}': no gradient is defined"
            ),
            Self::MissingInputGradient { kernel, input } => write!(
                f,
                "gradient of kernel '{kernel}' produced no entry for input '{input}'"
            ),
            Self::SeedShapeMismatch { expected, actual } => write!(
                f,
                "the gradient seed has shape {actual:?}, expected the output shape {expected:?}"
            ),
            Self::GradientDTypeMismatch {
                kernel,
                input,
                actual,
            } => write!(
                f,
                "gradient of kernel '{kernel}' for input '{input}' must be float32, got {actual}"
            ),
            Self::GradientShapeMismatch {
                kernel,
                input,
                expected,
                actual,
            } => write!(
                f,
                "gradient of kernel '{kernel}' for input '{input}' has shape {actual:?}, \
                 expected {expected:?}"
            ),
            Self::ReadDTypeMismatch { expected, actual } => {
                write!(f, "cannot read a {actual} tensor as {expected}")
            }
            Self::Internal { reason } => write!(f, "engine failure: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dispatch(err) => Some(err),
            Self::Backend(err) => Some(err),
            Self::Env(err) => Some(err),
            Self::Shape(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DispatchError> for EngineError {
    fn from(err: DispatchError) -> Self {
        Self::Dispatch(err)
    }
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

impl From<EnvError> for EngineError {
    fn from(err: EnvError) -> Self {
        Self::Env(err)
    }
}

impl From<ShapeError> for EngineError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

fn to_dispatch(err: EngineError) -> DispatchError {
    match err {
        EngineError::Dispatch(err) => err,
        other => DispatchError::Internal {
            reason: other.to_string(),
        },
    }
}

/// Gradient closure stored for custom-gradient tape nodes. The engine is
/// single-threaded, so shared ownership is plain `Rc`.
pub type CustomGradFn =
    dyn Fn(&mut dyn KernelDispatcher, &GradContext) -> Result<Vec<(String, Tensor)>, DispatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GradSource {
    /// Looked up in the gradient registry by kernel name at backprop time.
    Registry,
    /// Index into the engine's custom-gradient table.
    Custom(usize),
    /// Recorded permissively; backprop through this node is a fatal error.
    None,
}

#[derive(Clone)]
struct TapeNode {
    id: u64,
    kernel_name: String,
    inputs: Vec<(String, Tensor)>,
    outputs: Vec<Tensor>,
    saved: Vec<Tensor>,
    attrs: Attrs,
    grad_source: GradSource,
}

struct LiveTensor {
    data_id: DataId,
    kept: bool,
    scope_id: Option<u64>,
}

struct TensorInfo {
    backend_name: String,
    dtype: DType,
    shape: Vec<usize>,
    bytes: usize,
    ref_count: usize,
}

struct ScopeFrame {
    id: u64,
    name: Option<String>,
    track: Vec<TensorId>,
}

/// Engine-level memory accounting merged with the active backend's report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub num_tensors: usize,
    pub num_data_buffers: usize,
    pub num_bytes: usize,
    pub unreliable: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelProfile {
    pub kernel_name: String,
    pub wall_ms: f64,
    pub bytes_added: i64,
    pub total_bytes_snapshot: usize,
    pub tensors_added: i64,
    pub total_tensors_snapshot: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileInfo {
    pub new_bytes: i64,
    pub new_tensors: i64,
    pub peak_bytes: usize,
    pub kernels: Vec<KernelProfile>,
}

impl ProfileInfo {
    /// Kernel names in first-seen order, without repeats.
    #[must_use]
    pub fn kernel_names(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for kernel in &self.kernels {
            if seen.insert(kernel.kernel_name.as_str()) {
                out.push(kernel.kernel_name.as_str());
            }
        }
        out
    }
}

struct ProfileState {
    start_bytes: usize,
    start_tensors: usize,
    peak_bytes: usize,
    kernels: Vec<KernelProfile>,
}

/// Result of a gradient computation: the forward value and one gradient per
/// requested input. Inputs not connected to the output yield `None`.
#[derive(Debug)]
pub struct GradientResult {
    pub value: Tensor,
    pub grads: Vec<Option<Tensor>>,
}

/// The orchestrator: owns the flag environment, both registries, every
/// backend, and all tensor bookkeeping. One engine per context; tests build
/// several isolated ones.
///
/// Buffer ownership is mediated entirely by the engine's ref-counted
/// `DataId` table. Tensor handles are cheap values; reads, disposal, and
/// variable assignment all go through `&mut Engine`.
pub struct Engine {
    env: Environment,
    kernels: KernelRegistry,
    gradients: GradientRegistry,

    factories: BTreeMap<String, (BackendFactory, i32)>,
    backends: BTreeMap<String, Box<dyn Backend>>,
    active_backend: Option<String>,

    live_tensors: BTreeMap<TensorId, LiveTensor>,
    tensor_info: BTreeMap<DataId, TensorInfo>,
    num_tensors: usize,
    num_data_buffers: usize,
    num_bytes: usize,
    num_string_tensors: usize,
    data_moves: usize,

    scope_stack: Vec<ScopeFrame>,
    next_scope_id: u64,

    active_tape: Option<Vec<TapeNode>>,
    gradient_depth: usize,
    kernel_depth: usize,
    next_tape_node_id: u64,
    custom_grads: Vec<Rc<CustomGradFn>>,

    registered_variables: BTreeMap<String, Variable>,

    profile: Option<ProfileState>,
    kernel_ms_accum: Option<f64>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            env: Environment::with_engine_flags(),
            kernels: KernelRegistry::new(),
            gradients: GradientRegistry::new(),
            factories: BTreeMap::new(),
            backends: BTreeMap::new(),
            active_backend: None,
            live_tensors: BTreeMap::new(),
            tensor_info: BTreeMap::new(),
            num_tensors: 0,
            num_data_buffers: 0,
            num_bytes: 0,
            num_string_tensors: 0,
            data_moves: 0,
            scope_stack: Vec::new(),
            next_scope_id: 0,
            active_tape: None,
            gradient_depth: 0,
            kernel_depth: 0,
            next_tape_node_id: 0,
            custom_grads: Vec::new(),
            registered_variables: BTreeMap::new(),
            profile: None,
            kernel_ms_accum: None,
        }
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn kernel_registry_mut(&mut self) -> &mut KernelRegistry {
        &mut self.kernels
    }

    pub fn gradient_registry_mut(&mut self) -> &mut GradientRegistry {
        &mut self.gradients
    }

    /// Shorthand for flipping a registered flag, used heavily by tests.
    pub fn set_flag(&mut self, name: &str, value: FlagValue) -> Result<(), EngineError> {
        self.env.set(name, value)?;
        Ok(())
    }

    // ---- backend lifecycle -------------------------------------------------

    /// Registers a backend factory under `name`. Registration is idempotent:
    /// a duplicate name keeps the existing factory, warns, and returns false.
    pub fn register_backend(&mut self, name: &str, factory: BackendFactory, priority: i32) -> bool {
        if self.factories.contains_key(name) {
            log::warn!("backend '{name}' is already registered, keeping the existing factory");
            return false;
        }
        self.factories.insert(name.to_string(), (factory, priority));
        true
    }

    /// Makes `name` the active backend, instantiating it if needed and
    /// running every registered kernel's setup hook against it.
    pub fn set_backend(&mut self, name: &str) -> Result<(), EngineError> {
        if !self.factories.contains_key(name) {
            return Err(EngineError::BackendNotRegistered {
                name: name.to_string(),
            });
        }
        self.instantiate_backend(name)
            .map_err(|err| EngineError::BackendInitFailed {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        self.activate_backend(name);
        Ok(())
    }

    /// Ensures some backend is active: registered backends are tried in
    /// descending priority, a failing factory is logged and skipped, and it
    /// is fatal only when every factory fails.
    pub fn ready(&mut self) -> Result<(), EngineError> {
        if self.active_backend.is_some() {
            return Ok(());
        }
        let mut candidates: Vec<(String, i32)> = self
            .factories
            .iter()
            .map(|(name, (_, priority))| (name.clone(), *priority))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (name, _) in candidates {
            match self.instantiate_backend(&name) {
                Ok(()) => {
                    self.activate_backend(&name);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("backend '{name}' failed to initialize, trying the next: {err}");
                }
            }
        }
        Err(EngineError::AllBackendsFailed)
    }

    /// Runs kernel dispose hooks, disposes the backend, and drops both its
    /// factory and instance.
    pub fn remove_backend(&mut self, name: &str) {
        if let Some(mut backend) = self.backends.remove(name) {
            let disposers: Vec<_> = self
                .kernels
                .kernels_for_backend(name)
                .iter()
                .filter_map(|config| config.dispose_func)
                .collect();
            for hook in disposers {
                hook(backend.as_mut());
            }
            backend.dispose();
        }
        self.factories.remove(name);
        if self.active_backend.as_deref() == Some(name) {
            self.active_backend = None;
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> Option<&str> {
        self.active_backend.as_deref()
    }

    #[must_use]
    pub fn find_backend(&self, name: &str) -> Option<&dyn Backend> {
        self.backends.get(name).map(AsRef::as_ref)
    }

    /// Names of every registered backend factory.
    #[must_use]
    pub fn backend_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    fn instantiate_backend(&mut self, name: &str) -> Result<(), EngineError> {
        if self.backends.contains_key(name) {
            return Ok(());
        }
        let (factory, _) = self
            .factories
            .get(name)
            .ok_or_else(|| EngineError::BackendNotRegistered {
                name: name.to_string(),
            })?;
        let backend = factory()?;
        self.backends.insert(name.to_string(), backend);
        Ok(())
    }

    fn activate_backend(&mut self, name: &str) {
        self.active_backend = Some(name.to_string());
        let setups: Vec<_> = self
            .kernels
            .kernels_for_backend(name)
            .iter()
            .filter_map(|config| config.setup_func)
            .collect();
        if let Some(backend) = self.backends.get_mut(name) {
            for hook in setups {
                hook(backend.as_mut());
            }
        }
        // Profiling state is meaningless across a backend switch.
        self.profile = None;
        self.kernel_ms_accum = None;
    }

    fn ensure_backend(&mut self) -> Result<String, EngineError> {
        self.ready()?;
        self.active_backend
            .clone()
            .ok_or(EngineError::AllBackendsFailed)
    }

    fn backend_mut(&mut self, name: &str) -> Result<&mut Box<dyn Backend>, EngineError> {
        self.backends
            .get_mut(name)
            .ok_or_else(|| EngineError::BackendNotRegistered {
                name: name.to_string(),
            })
    }

    // ---- tensor bookkeeping ------------------------------------------------

    /// Writes values into the active backend and returns a tracked tensor.
    pub fn make_tensor(
        &mut self,
        values: BackendValues,
        shape: Vec<usize>,
    ) -> Result<Tensor, EngineError> {
        let backend_name = self.ensure_backend()?;
        validate_buffer_size(&shape, values.len())?;
        let dtype = values.dtype();
        let bytes = values.byte_len();
        let data_id = self.backend_mut(&backend_name)?.write(values, &shape, dtype)?;
        let tensor = Tensor::make(shape, dtype, data_id);
        self.track_tensor(&tensor, &backend_name, bytes);
        Ok(tensor)
    }

    /// Materializes a constant-filled tensor on the active backend.
    pub fn fill(
        &mut self,
        shape: &[usize],
        dtype: DType,
        value: f64,
    ) -> Result<Tensor, EngineError> {
        let len = size_from_shape(shape);
        let values = match dtype {
            DType::Float32 => BackendValues::F32(vec![value as f32; len]),
            DType::Int32 => BackendValues::I32(vec![value as i32; len]),
            DType::Bool => BackendValues::Bool(vec![u8::from(value != 0.0); len]),
            DType::Complex64 => {
                let mut out = vec![0.0f32; len * 2];
                for pair in out.chunks_exact_mut(2) {
                    pair[0] = value as f32;
                }
                BackendValues::C64(out)
            }
            DType::Str => {
                return Err(EngineError::Internal {
                    reason: "string tensors cannot be constant-filled".to_string(),
                })
            }
        };
        self.make_tensor(values, shape.to_vec())
    }

    fn track_tensor(&mut self, tensor: &Tensor, backend_name: &str, bytes: usize) {
        if let Some(info) = self.tensor_info.get_mut(&tensor.data_id()) {
            info.ref_count += 1;
        } else {
            self.tensor_info.insert(
                tensor.data_id(),
                TensorInfo {
                    backend_name: backend_name.to_string(),
                    dtype: tensor.dtype(),
                    shape: tensor.shape().to_vec(),
                    bytes,
                    ref_count: 1,
                },
            );
            self.num_data_buffers += 1;
            self.num_bytes += bytes;
            if tensor.dtype() == DType::Str {
                self.num_string_tensors += 1;
            }
        }
        self.num_tensors += 1;
        let scope_id = self.scope_stack.last().map(|frame| frame.id);
        if let Some(frame) = self.scope_stack.last_mut() {
            frame.track.push(tensor.id());
        }
        self.live_tensors.insert(
            tensor.id(),
            LiveTensor {
                data_id: tensor.data_id(),
                kept: false,
                scope_id,
            },
        );
    }

    fn track_spec(&mut self, backend_name: &str, spec: TensorSpec) -> Tensor {
        let bytes = spec
            .dtype
            .bytes_per_element()
            .map_or(0, |per| per * size_from_shape(&spec.shape));
        let tensor = Tensor::make(spec.shape, spec.dtype, spec.data_id);
        self.track_tensor(&tensor, backend_name, bytes);
        tensor
    }

    /// New tracked view over an existing buffer: bumps the backend and
    /// engine ref counts so either handle can be disposed independently.
    fn alias(&mut self, tensor: &Tensor) -> Result<Tensor, EngineError> {
        let live = self
            .live_tensors
            .get(&tensor.id())
            .ok_or(EngineError::DisposedTensor { id: tensor.id() })?;
        let data_id = live.data_id;
        let backend_name = self
            .tensor_info
            .get(&data_id)
            .map(|info| info.backend_name.clone())
            .ok_or(EngineError::DisposedTensor { id: tensor.id() })?;
        self.backend_mut(&backend_name)?.inc_ref(data_id);
        let view = Tensor::make(tensor.shape().to_vec(), tensor.dtype(), data_id);
        self.track_tensor(&view, &backend_name, 0);
        Ok(view)
    }

    fn alias_keep(&mut self, tensor: &Tensor) -> Result<Tensor, EngineError> {
        let view = self.alias(tensor)?;
        self.keep(&view);
        Ok(view)
    }

    /// Decrements the ref count for the tensor's buffer and frees it at
    /// zero. A second dispose of the same handle is a no-op.
    pub fn dispose(&mut self, tensor: &Tensor) {
        self.dispose_id(tensor.id());
    }

    fn dispose_id(&mut self, tensor_id: TensorId) {
        let Some(live) = self.live_tensors.remove(&tensor_id) else {
            return;
        };
        self.num_tensors -= 1;
        let Some(info) = self.tensor_info.get_mut(&live.data_id) else {
            return;
        };
        info.ref_count = info.ref_count.saturating_sub(1);
        let backend_name = info.backend_name.clone();
        let freed = info.ref_count == 0;
        if let Some(backend) = self.backends.get_mut(&backend_name) {
            backend.dispose_data(live.data_id, false);
        }
        if freed {
            if let Some(info) = self.tensor_info.remove(&live.data_id) {
                self.num_data_buffers -= 1;
                self.num_bytes = self.num_bytes.saturating_sub(info.bytes);
                if info.dtype == DType::Str {
                    self.num_string_tensors -= 1;
                }
            }
        }
    }

    #[must_use]
    pub fn is_disposed(&self, tensor: &Tensor) -> bool {
        !self.live_tensors.contains_key(&tensor.id())
    }

    /// Exempts the tensor from scope-driven disposal for the rest of its
    /// life. It must then be disposed manually.
    pub fn keep(&mut self, tensor: &Tensor) {
        if let Some(live) = self.live_tensors.get_mut(&tensor.id()) {
            live.kept = true;
        }
    }

    #[must_use]
    pub fn num_tensors(&self) -> usize {
        self.num_tensors
    }

    #[must_use]
    pub fn num_data_buffers(&self) -> usize {
        self.num_data_buffers
    }

    #[must_use]
    pub fn memory(&self) -> MemoryInfo {
        let mut unreliable = false;
        let mut reasons = Vec::new();
        if self.num_string_tensors > 0 {
            unreliable = true;
            reasons.push(
                "the byte count of string tensors depends on their current contents".to_string(),
            );
        }
        if let Some(name) = &self.active_backend {
            if let Some(backend) = self.backends.get(name) {
                let report = backend.memory();
                if report.unreliable {
                    unreliable = true;
                    for reason in report.reasons {
                        if !reasons.contains(&reason) {
                            reasons.push(reason);
                        }
                    }
                }
            }
        }
        MemoryInfo {
            num_tensors: self.num_tensors,
            num_data_buffers: self.num_data_buffers,
            num_bytes: self.num_bytes,
            unreliable,
            reasons,
        }
    }

    // ---- reads -------------------------------------------------------------

    pub fn read_sync(&mut self, tensor: &Tensor) -> Result<BackendValues, EngineError> {
        let backend_name = self.ensure_readable(tensor)?;
        let backend = self.backend_mut(&backend_name)?;
        Ok(backend.read_sync(tensor.data_id())?)
    }

    /// Read that lets the backend finish in-flight work first.
    pub fn read(&mut self, tensor: &Tensor) -> Result<BackendValues, EngineError> {
        let backend_name = self.ensure_readable(tensor)?;
        let backend = self.backend_mut(&backend_name)?;
        Ok(backend.read(tensor.data_id())?)
    }

    /// Reads numeric values widened to `f32`.
    pub fn read_f32(&mut self, tensor: &Tensor) -> Result<Vec<f32>, EngineError> {
        match self.read_sync(tensor)? {
            BackendValues::F32(v) => Ok(v),
            BackendValues::I32(v) => Ok(v.iter().map(|&x| x as f32).collect()),
            BackendValues::Bool(v) => Ok(v.iter().map(|&x| f32::from(x.min(1))).collect()),
            other => Err(EngineError::ReadDTypeMismatch {
                expected: "f32",
                actual: other.dtype(),
            }),
        }
    }

    /// Decodes a string tensor's raw bytes to UTF-8. Decode failure is its
    /// own error, distinct from a generic read failure.
    pub fn read_strings(&mut self, tensor: &Tensor) -> Result<Vec<String>, EngineError> {
        let data_id = tensor.data_id();
        match self.read_sync(tensor)? {
            BackendValues::Bytes(raw) => {
                let mut out = Vec::with_capacity(raw.len());
                for (index, bytes) in raw.into_iter().enumerate() {
                    let text = String::from_utf8(bytes).map_err(|_| {
                        EngineError::Backend(BackendError::StringDecode { data_id, index })
                    })?;
                    out.push(text);
                }
                Ok(out)
            }
            other => Err(EngineError::ReadDTypeMismatch {
                expected: "string",
                actual: other.dtype(),
            }),
        }
    }

    fn ensure_readable(&mut self, tensor: &Tensor) -> Result<String, EngineError> {
        if self.is_disposed(tensor) {
            return Err(EngineError::DisposedTensor { id: tensor.id() });
        }
        let active = self.ensure_backend()?;
        let owner = self
            .tensor_info
            .get(&tensor.data_id())
            .map(|info| info.backend_name.clone())
            .ok_or(EngineError::DisposedTensor { id: tensor.id() })?;
        if owner != active {
            self.move_data_to(&active, tensor.data_id())?;
        }
        Ok(active)
    }

    /// Migrates a buffer between backends, preserving its ref count. Counted
    /// so mid-kernel moves do not trip leak detection.
    fn move_data_to(&mut self, dest: &str, data_id: DataId) -> Result<(), EngineError> {
        let (source_name, dtype, shape) = {
            let info = self
                .tensor_info
                .get(&data_id)
                .ok_or(EngineError::Internal {
                    reason: format!("no bookkeeping for data id {}", data_id.0),
                })?;
            (info.backend_name.clone(), info.dtype, info.shape.clone())
        };
        let (values, ref_count) = {
            let source = self.backend_mut(&source_name)?;
            let ref_count = source.ref_count(data_id);
            let values = source.read(data_id)?;
            source.dispose_data(data_id, true);
            (values, ref_count)
        };
        self.backend_mut(dest)?
            .move_data(data_id, values, &shape, dtype, ref_count)?;
        if let Some(info) = self.tensor_info.get_mut(&data_id) {
            info.backend_name = dest.to_string();
        }
        self.data_moves += 1;
        Ok(())
    }

    // ---- scopes ------------------------------------------------------------

    pub fn start_scope(&mut self, name: Option<&str>) {
        self.next_scope_id += 1;
        self.scope_stack.push(ScopeFrame {
            id: self.next_scope_id,
            name: name.map(str::to_string),
            track: Vec::new(),
        });
    }

    /// Pops the innermost scope, disposing every tensor it tracked that is
    /// neither reachable from `result` nor kept. Result tensors re-track
    /// into the parent scope.
    pub fn end_scope<T: TensorContainer + ?Sized>(&mut self, result: &T) {
        let Some(frame) = self.scope_stack.pop() else {
            return;
        };
        let result_tensors = result.contained_tensors();
        let result_ids: BTreeSet<TensorId> = result_tensors.iter().map(Tensor::id).collect();

        for tensor_id in frame.track {
            let Some(live) = self.live_tensors.get(&tensor_id) else {
                continue;
            };
            if live.scope_id != Some(frame.id) || live.kept || result_ids.contains(&tensor_id) {
                continue;
            }
            self.dispose_id(tensor_id);
        }

        let parent_id = self.scope_stack.last().map(|frame| frame.id);
        for tensor in &result_tensors {
            let Some(live) = self.live_tensors.get_mut(&tensor.id()) else {
                continue;
            };
            if live.kept || live.scope_id != Some(frame.id) {
                continue;
            }
            live.scope_id = parent_id;
            if let Some(parent) = self.scope_stack.last_mut() {
                parent.track.push(tensor.id());
            }
        }
    }

    /// Runs `f` inside a fresh scope; tensors it allocates and does not
    /// return are disposed when the scope ends, whether `f` succeeds or not.
    pub fn tidy<T, F>(&mut self, name: Option<&str>, f: F) -> Result<T, EngineError>
    where
        T: TensorContainer,
        F: FnOnce(&mut Engine) -> Result<T, EngineError>,
    {
        self.start_scope(name);
        match f(self) {
            Ok(value) => {
                self.end_scope(&value);
                Ok(value)
            }
            Err(err) => {
                self.end_scope(&());
                Err(err)
            }
        }
    }

    #[must_use]
    pub fn scope_depth(&self) -> usize {
        self.scope_stack.len()
    }

    #[must_use]
    pub fn scope_name(&self) -> Option<&str> {
        self.scope_stack
            .last()
            .and_then(|frame| frame.name.as_deref())
    }

    // ---- kernel dispatch ---------------------------------------------------

    #[must_use]
    pub fn is_tape_on(&self) -> bool {
        self.gradient_depth > 0 && self.kernel_depth == 0
    }

    #[must_use]
    pub fn tape_len(&self) -> usize {
        self.active_tape.as_ref().map_or(0, Vec::len)
    }

    /// Dispatch entry point every op wrapper calls. Looks up the kernel for
    /// the active backend, runs it with the kernel-depth counter bracketing
    /// the call so nested dispatches stay off the tape, tracks the outputs,
    /// checks test-mode leak accounting, and records a tape node when a
    /// gradient tape is open.
    pub fn run_kernel(
        &mut self,
        kernel_name: &str,
        inputs: &BTreeMap<String, Tensor>,
        attrs: &Attrs,
    ) -> Result<Vec<Tensor>, EngineError> {
        let backend_name = self.ensure_backend()?;
        let tape_on = self.is_tape_on();
        let is_test = self.env.get_bool(tp_env::IS_TEST)?;
        let debug = self.env.get_bool(tp_env::DEBUG)?;
        let check_numerics = debug && self.env.get_bool(tp_env::CHECK_COMPUTATION_FOR_ERRORS)?;

        let Some(config) = self.kernels.get_kernel(kernel_name, &backend_name) else {
            return Err(EngineError::Dispatch(DispatchError::MissingKernel {
                kernel: kernel_name.to_string(),
                backend: backend_name,
            }));
        };
        let kernel_func = config.kernel_func;

        let ids_before = self.backend_mut(&backend_name)?.num_data_ids();
        let moves_before = self.data_moves;
        let bytes_before = self.num_bytes;
        let tensors_before = self.num_tensors;

        self.kernel_depth += 1;
        let started = Instant::now();
        let result = {
            let backend = self.backend_mut(&backend_name)?;
            let mut ctx = KernelContext {
                kernel_name,
                backend: backend.as_mut(),
                inputs,
                attrs,
            };
            kernel_func(&mut ctx)
        };
        self.kernel_depth -= 1;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
        let specs = result.map_err(DispatchError::Kernel)?;

        let mut fresh_outputs = 0usize;
        let mut outputs = Vec::with_capacity(specs.len());
        for spec in specs {
            if !self.tensor_info.contains_key(&spec.data_id) {
                fresh_outputs += 1;
            }
            outputs.push(self.track_spec(&backend_name, spec));
        }

        if is_test {
            let ids_after = self
                .backends
                .get(&backend_name)
                .map_or(ids_before, |backend| backend.num_data_ids());
            let actual = ids_after.saturating_sub(ids_before);
            let expected = fresh_outputs + (self.data_moves - moves_before);
            if actual > expected {
                return Err(EngineError::MemoryLeak {
                    kernel: kernel_name.to_string(),
                    leaked: actual - expected,
                });
            }
        }

        if let Some(accum) = self.kernel_ms_accum.as_mut() {
            *accum += elapsed_ms;
        }
        if let Some(state) = self.profile.as_mut() {
            state.peak_bytes = state.peak_bytes.max(self.num_bytes);
            state.kernels.push(KernelProfile {
                kernel_name: kernel_name.to_string(),
                wall_ms: elapsed_ms,
                bytes_added: self.num_bytes as i64 - bytes_before as i64,
                total_bytes_snapshot: self.num_bytes,
                tensors_added: self.num_tensors as i64 - tensors_before as i64,
                total_tensors_snapshot: self.num_tensors,
            });
        }
        if debug {
            log::debug!("kernel '{kernel_name}' ran in {elapsed_ms:.3} ms");
        }
        if check_numerics {
            self.check_outputs_finite(kernel_name, &outputs);
        }

        if tape_on {
            self.record_tape_node(kernel_name, inputs, attrs, &outputs)?;
        }
        Ok(outputs)
    }

    /// Like `run_kernel` for kernels contracted to one output.
    pub fn run_kernel_single(
        &mut self,
        kernel_name: &str,
        inputs: &BTreeMap<String, Tensor>,
        attrs: &Attrs,
    ) -> Result<Tensor, EngineError> {
        let mut outputs = self.run_kernel(kernel_name, inputs, attrs)?;
        if outputs.len() != 1 {
            return Err(EngineError::Internal {
                reason: format!(
                    "kernel '{kernel_name}' produced {} outputs, expected one",
                    outputs.len()
                ),
            });
        }
        Ok(outputs.remove(0))
    }

    fn check_outputs_finite(&mut self, kernel_name: &str, outputs: &[Tensor]) {
        for (index, tensor) in outputs.iter().enumerate() {
            if !tensor.dtype().is_float() {
                continue;
            }
            let Ok(values) = self.read_sync(tensor) else {
                continue;
            };
            let floats = match values {
                BackendValues::F32(v) | BackendValues::C64(v) => v,
                _ => continue,
            };
            if floats.iter().any(|v| !v.is_finite()) {
                log::warn!("kernel '{kernel_name}' produced NaN or Infinity in output {index}");
            }
        }
    }

    fn record_tape_node(
        &mut self,
        kernel_name: &str,
        inputs: &BTreeMap<String, Tensor>,
        attrs: &Attrs,
        outputs: &[Tensor],
    ) -> Result<(), EngineError> {
        // A kernel without a gradient definition still records, with nothing
        // saved; backprop fails only if the node ends up on the y path.
        let save_plan = self.gradients.get_gradient(kernel_name).map(|config| {
            let input_names: Vec<String> = if config.save_all_inputs {
                inputs.keys().cloned().collect()
            } else {
                config.inputs_to_save.clone()
            };
            (input_names, config.outputs_to_save.clone())
        });

        let (saved, grad_source) = match save_plan {
            Some((input_names, output_flags)) => {
                let mut saved = Vec::new();
                for name in input_names {
                    if let Some(tensor) = inputs.get(&name) {
                        saved.push(self.alias_keep(tensor)?);
                    }
                }
                for (index, flag) in output_flags.iter().enumerate() {
                    if *flag {
                        if let Some(tensor) = outputs.get(index) {
                            saved.push(self.alias_keep(tensor)?);
                        }
                    }
                }
                (saved, GradSource::Registry)
            }
            None => (Vec::new(), GradSource::None),
        };

        self.push_tape_node(TapeNode {
            id: 0,
            kernel_name: kernel_name.to_string(),
            inputs: inputs
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.clone()))
                .collect(),
            outputs: outputs.to_vec(),
            saved,
            attrs: attrs.clone(),
            grad_source,
        });
        Ok(())
    }

    fn push_tape_node(&mut self, mut node: TapeNode) {
        if let Some(tape) = self.active_tape.as_mut() {
            self.next_tape_node_id += 1;
            node.id = self.next_tape_node_id;
            tape.push(node);
        }
    }

    /// Runs `forward` as one opaque taped operation whose backward pass is
    /// the supplied closure. Internal kernels run at elevated kernel depth,
    /// so only the single custom node reaches the tape. Inputs are named by
    /// position ("0", "1", ...) for the backward closure.
    pub fn custom_grad<F>(
        &mut self,
        name: &str,
        inputs: &[Tensor],
        forward: F,
        grad: Rc<CustomGradFn>,
    ) -> Result<Tensor, EngineError>
    where
        F: FnOnce(&mut Engine, &[Tensor]) -> Result<(Tensor, Vec<Tensor>), EngineError>,
    {
        self.ensure_backend()?;
        let tape_on = self.is_tape_on();
        self.start_scope(Some(name));
        self.kernel_depth += 1;
        let result = forward(self, inputs);
        self.kernel_depth -= 1;
        match result {
            Err(err) => {
                self.end_scope(&());
                Err(err)
            }
            Ok((value, to_save)) => {
                let mut saved = Vec::with_capacity(to_save.len());
                if tape_on {
                    for tensor in &to_save {
                        saved.push(self.alias_keep(tensor)?);
                    }
                }
                self.end_scope(&value);
                if tape_on {
                    self.custom_grads.push(grad);
                    let grad_index = self.custom_grads.len() - 1;
                    self.push_tape_node(TapeNode {
                        id: 0,
                        kernel_name: name.to_string(),
                        inputs: inputs
                            .iter()
                            .enumerate()
                            .map(|(index, tensor)| (index.to_string(), tensor.clone()))
                            .collect(),
                        outputs: vec![value.clone()],
                        saved,
                        attrs: Attrs::new(),
                        grad_source: GradSource::Custom(grad_index),
                    });
                }
                Ok(value)
            }
        }
    }

    // ---- gradients ---------------------------------------------------------

    /// Reverse-mode gradients of `f` with respect to `xs`.
    ///
    /// The forward pass runs inside a tape bracket and a disposal scope; the
    /// tape is filtered to the subgraph connecting `xs` to the output and
    /// walked in reverse, accumulating per-tensor gradients by elementwise
    /// sum. `dy` seeds the output gradient (all-ones when omitted) and must
    /// be float32. Inputs with no path to the output yield `None`, which is
    /// fatal unless `allow_no_gradients` is set.
    pub fn gradients<F>(
        &mut self,
        f: F,
        xs: &[Tensor],
        dy: Option<&Tensor>,
        allow_no_gradients: bool,
    ) -> Result<GradientResult, EngineError>
    where
        F: FnOnce(&mut Engine) -> Result<Tensor, EngineError>,
    {
        if let Some(dy) = dy {
            if dy.dtype() != DType::Float32 {
                return Err(EngineError::SeedDTypeMismatch { actual: dy.dtype() });
            }
        }
        self.start_tape();
        let result = self.gradients_scoped(f, xs, dy, allow_no_gradients);
        self.end_tape();
        result
    }

    fn start_tape(&mut self) {
        self.gradient_depth += 1;
        if self.active_tape.is_none() {
            self.active_tape = Some(Vec::new());
        }
    }

    /// Closes one gradient bracket. At depth zero the saved tensors held by
    /// every tape node are released and the tape is discarded; nested calls
    /// leave the outer tape untouched.
    fn end_tape(&mut self) {
        self.gradient_depth -= 1;
        if self.gradient_depth == 0 {
            if let Some(tape) = self.active_tape.take() {
                for node in tape {
                    for saved in node.saved {
                        self.dispose(&saved);
                    }
                }
            }
            self.custom_grads.clear();
        }
    }

    fn gradients_scoped<F>(
        &mut self,
        f: F,
        xs: &[Tensor],
        dy: Option<&Tensor>,
        allow_no_gradients: bool,
    ) -> Result<GradientResult, EngineError>
    where
        F: FnOnce(&mut Engine) -> Result<Tensor, EngineError>,
    {
        self.start_scope(Some("gradients"));
        let result = self.backprop(f, xs, dy, allow_no_gradients);
        match result {
            Ok(outcome) => {
                let mut keepers: Vec<Tensor> = vec![outcome.value.clone()];
                keepers.extend(outcome.grads.iter().flatten().cloned());
                self.end_scope(&keepers);
                Ok(outcome)
            }
            Err(err) => {
                self.end_scope(&());
                Err(err)
            }
        }
    }

    fn backprop<F>(
        &mut self,
        f: F,
        xs: &[Tensor],
        dy: Option<&Tensor>,
        allow_no_gradients: bool,
    ) -> Result<GradientResult, EngineError>
    where
        F: FnOnce(&mut Engine) -> Result<Tensor, EngineError>,
    {
        let y = self.tidy(Some("forward"), f)?;
        if y.dtype() != DType::Float32 {
            return Err(EngineError::OutputNotFloat { actual: y.dtype() });
        }
        if let Some(dy) = dy {
            if dy.shape() != y.shape() {
                return Err(EngineError::SeedShapeMismatch {
                    expected: y.shape().to_vec(),
                    actual: dy.shape().to_vec(),
                });
            }
        }

        let filtered = self.filter_tape(xs, &y);
        if filtered.is_empty() && !xs.is_empty() && !allow_no_gradients {
            return Err(EngineError::DisconnectedGraph);
        }

        let mut accum: BTreeMap<TensorId, Tensor> = BTreeMap::new();
        let seed = match dy {
            Some(dy) => self.alias(dy)?,
            None => self.fill(y.shape(), DType::Float32, 1.0)?,
        };
        accum.insert(y.id(), seed);

        for node in filtered.iter().rev() {
            let mut dys = Vec::with_capacity(node.outputs.len());
            for output in &node.outputs {
                match accum.get(&output.id()) {
                    Some(grad) => dys.push(grad.clone()),
                    // Outputs off the y path still get a seed so gradient
                    // closures see one upstream gradient per output.
                    None => dys.push(self.fill(output.shape(), DType::Float32, 0.0)?),
                }
            }
            let ctx = GradContext {
                dys,
                saved: node.saved.clone(),
                attrs: node.attrs.clone(),
            };
            let named = match node.grad_source {
                GradSource::Registry => {
                    let Some(config) = self.gradients.get_gradient(&node.kernel_name) else {
                        return Err(EngineError::MissingGradientDef {
                            kernel: node.kernel_name.clone(),
                        });
                    };
                    let grad_func = config.grad_func;
                    grad_func(self, &ctx)?
                }
                GradSource::Custom(index) => {
                    let grad_func = self
                        .custom_grads
                        .get(index)
                        .cloned()
                        .ok_or_else(|| EngineError::Internal {
                            reason: format!("no custom gradient at slot {index}"),
                        })?;
                    grad_func(self, &ctx)?
                }
                GradSource::None => {
                    return Err(EngineError::MissingGradientDef {
                        kernel: node.kernel_name.clone(),
                    })
                }
            };

            let mut named: BTreeMap<String, Tensor> = named.into_iter().collect();
            for (input_name, input) in &node.inputs {
                let Some(grad) = named.remove(input_name) else {
                    return Err(EngineError::MissingInputGradient {
                        kernel: node.kernel_name.clone(),
                        input: input_name.clone(),
                    });
                };
                if grad.dtype() != DType::Float32 {
                    return Err(EngineError::GradientDTypeMismatch {
                        kernel: node.kernel_name.clone(),
                        input: input_name.clone(),
                        actual: grad.dtype(),
                    });
                }
                if grad.shape() != input.shape() {
                    return Err(EngineError::GradientShapeMismatch {
                        kernel: node.kernel_name.clone(),
                        input: input_name.clone(),
                        expected: input.shape().to_vec(),
                        actual: grad.shape().to_vec(),
                    });
                }
                let input_id = input.id();
                if let Some(existing) = accum.remove(&input_id) {
                    let summed = self.run_kernel_single(
                        names::ADD,
                        &binary_inputs(&existing, &grad),
                        &Attrs::new(),
                    )?;
                    self.dispose(&existing);
                    accum.insert(input_id, summed);
                } else {
                    accum.insert(input_id, grad);
                }
            }
            // Gradients for inputs the tape filter pruned have nowhere to
            // flow; drop them instead of rejecting the closure's output.
            for (_, grad) in named {
                self.dispose(&grad);
            }
        }

        let grads = xs
            .iter()
            .map(|x| accum.get(&x.id()).cloned())
            .collect();
        Ok(GradientResult { value: y, grads })
    }

    /// Two-pass tape filter: a forward pass marks everything reachable from
    /// `xs`, a reverse pass marks everything leading to `y`. Kept nodes carry
    /// both marks, with inputs pruned to the from-x set so gradient closures
    /// never see inputs that cannot receive a gradient.
    fn filter_tape(&self, xs: &[Tensor], y: &Tensor) -> Vec<TapeNode> {
        let Some(tape) = self.active_tape.as_ref() else {
            return Vec::new();
        };
        let mut from_x: BTreeSet<TensorId> = xs.iter().map(Tensor::id).collect();
        let mut node_from_x = vec![false; tape.len()];
        for (index, node) in tape.iter().enumerate() {
            if node
                .inputs
                .iter()
                .any(|(_, tensor)| from_x.contains(&tensor.id()))
            {
                node_from_x[index] = true;
                for output in &node.outputs {
                    from_x.insert(output.id());
                }
            }
        }

        let mut to_y: BTreeSet<TensorId> = BTreeSet::new();
        to_y.insert(y.id());
        let mut node_to_y = vec![false; tape.len()];
        for (index, node) in tape.iter().enumerate().rev() {
            if node.outputs.iter().any(|tensor| to_y.contains(&tensor.id())) {
                node_to_y[index] = true;
                for (_, tensor) in &node.inputs {
                    to_y.insert(tensor.id());
                }
            }
        }

        tape.iter()
            .enumerate()
            .filter(|(index, _)| node_from_x[*index] && node_to_y[*index])
            .map(|(_, node)| {
                let mut pruned = node.clone();
                pruned
                    .inputs
                    .retain(|(_, tensor)| from_x.contains(&tensor.id()));
                pruned
            })
            .collect()
    }

    // ---- variables ---------------------------------------------------------

    /// Creates a named variable. Variables are kept (exempt from scope
    /// disposal) and registered under a process-unique name.
    pub fn make_variable(
        &mut self,
        name: &str,
        trainable: bool,
        values: BackendValues,
        shape: Vec<usize>,
    ) -> Result<Variable, EngineError> {
        if self.registered_variables.contains_key(name) {
            return Err(EngineError::DuplicateVariable {
                name: name.to_string(),
            });
        }
        let tensor = self.make_tensor(values, shape)?;
        self.keep(&tensor);
        let variable = Variable::new(tensor, name.to_string(), trainable);
        self.registered_variables
            .insert(name.to_string(), variable.clone());
        Ok(variable)
    }

    /// Rebinds the variable to `value`'s buffer. Fails before mutating
    /// anything when dtype or shape differ; on success the old binding's ref
    /// count is released.
    pub fn assign_variable(&mut self, name: &str, value: &Tensor) -> Result<(), EngineError> {
        let Some(variable) = self.registered_variables.get(name) else {
            return Err(EngineError::UnknownVariable {
                name: name.to_string(),
            });
        };
        if variable.dtype() != value.dtype() {
            return Err(EngineError::VariableDTypeMismatch {
                name: name.to_string(),
                expected: variable.dtype(),
                actual: value.dtype(),
            });
        }
        if variable.shape() != value.shape() {
            return Err(EngineError::VariableShapeMismatch {
                name: name.to_string(),
                expected: variable.shape().to_vec(),
                actual: value.shape().to_vec(),
            });
        }
        let trainable = variable.trainable();
        let old = variable.tensor().clone();
        let rebound = self.alias_keep(value)?;
        self.dispose(&old);
        self.registered_variables.insert(
            name.to_string(),
            Variable::new(rebound, name.to_string(), trainable),
        );
        Ok(())
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.registered_variables.get(name)
    }

    /// Unregisters and disposes one variable; false when no such name.
    pub fn dispose_variable(&mut self, name: &str) -> bool {
        match self.registered_variables.remove(name) {
            Some(variable) => {
                self.dispose(variable.tensor());
                true
            }
            None => false,
        }
    }

    pub fn dispose_variables(&mut self) {
        let names: Vec<String> = self.registered_variables.keys().cloned().collect();
        for name in names {
            self.dispose_variable(&name);
        }
    }

    // ---- profiling and timing ----------------------------------------------

    /// Runs `f` capturing per-kernel byte and tensor deltas plus the peak
    /// engine byte count reached during the run.
    pub fn profile<T, F>(&mut self, f: F) -> Result<(T, ProfileInfo), EngineError>
    where
        F: FnOnce(&mut Engine) -> Result<T, EngineError>,
    {
        self.profile = Some(ProfileState {
            start_bytes: self.num_bytes,
            start_tensors: self.num_tensors,
            peak_bytes: self.num_bytes,
            kernels: Vec::new(),
        });
        let result = f(self);
        let state = self.profile.take();
        let value = result?;
        let state = state.ok_or_else(|| EngineError::Internal {
            reason: "profiling state was cleared mid-run".to_string(),
        })?;
        Ok((
            value,
            ProfileInfo {
                new_bytes: self.num_bytes as i64 - state.start_bytes as i64,
                new_tensors: self.num_tensors as i64 - state.start_tensors as i64,
                peak_bytes: state.peak_bytes,
                kernels: state.kernels,
            },
        ))
    }

    /// Times `f` with a wall clock, accumulating the portion spent inside
    /// kernel functions.
    pub fn time<T, F>(&mut self, f: F) -> Result<(T, KernelTiming), EngineError>
    where
        F: FnOnce(&mut Engine) -> Result<T, EngineError>,
    {
        let previous = self.kernel_ms_accum.replace(0.0);
        let started = Instant::now();
        let result = f(self);
        let kernel_ms = self.kernel_ms_accum.take();
        self.kernel_ms_accum = previous;
        let value = result?;
        Ok((
            value,
            KernelTiming {
                kernel_ms,
                wall_ms: started.elapsed().as_secs_f64() * 1e3,
            },
        ))
    }

    /// Tears the engine down to a fresh state: every backend instance is
    /// disposed (factories stay registered), all bookkeeping is cleared, and
    /// cached flag evaluations are reset.
    pub fn reset(&mut self) {
        for backend in self.backends.values_mut() {
            backend.dispose();
        }
        self.backends.clear();
        self.active_backend = None;
        self.live_tensors.clear();
        self.tensor_info.clear();
        self.num_tensors = 0;
        self.num_data_buffers = 0;
        self.num_bytes = 0;
        self.num_string_tensors = 0;
        self.data_moves = 0;
        self.scope_stack.clear();
        self.active_tape = None;
        self.gradient_depth = 0;
        self.kernel_depth = 0;
        self.custom_grads.clear();
        self.registered_variables.clear();
        self.profile = None;
        self.kernel_ms_accum = None;
        self.env.reset();
    }
}

impl KernelDispatcher for Engine {
    fn run_kernel(
        &mut self,
        kernel_name: &str,
        inputs: &BTreeMap<String, Tensor>,
        attrs: &Attrs,
    ) -> Result<Vec<Tensor>, DispatchError> {
        Engine::run_kernel(self, kernel_name, inputs, attrs).map_err(to_dispatch)
    }

    fn fill(
        &mut self,
        shape: &[usize],
        dtype: DType,
        value: f64,
    ) -> Result<Tensor, DispatchError> {
        Engine::fill(self, shape, dtype, value).map_err(to_dispatch)
    }
}
