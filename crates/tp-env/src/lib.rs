#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

/// Value of one configuration flag.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl FlagValue {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
        }
    }
}

/// Lazily evaluated default for a registered flag.
pub type FlagEvaluator = fn() -> FlagValue;

#[derive(Debug, Clone, PartialEq)]
pub enum EnvError {
    UnregisteredFlag {
        name: String,
    },
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnregisteredFlag { name } => {
                write!(f, "flag '{name}' is not registered")
            }
            Self::TypeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "flag '{name}' has type {actual}, expected {expected}"
            ),
        }
    }
}

impl std::error::Error for EnvError {}

pub const DEBUG: &str = "DEBUG";
pub const IS_TEST: &str = "IS_TEST";
pub const PROD: &str = "PROD";
pub const CHECK_COMPUTATION_FOR_ERRORS: &str = "CHECK_COMPUTATION_FOR_ERRORS";

/// Query parameter carrying comma-separated `NAME:value` overrides, applied
/// once at startup and taking precedence over registered defaults.
const FLAGS_QUERY_PARAM: &str = "flags";

/// Registry of typed configuration flags with lazy, cached evaluation.
///
/// A flag must be registered before it can be read or set; evaluation runs at
/// most once per flag unless `reset` clears the cache.
#[derive(Default)]
pub struct Environment {
    registry: BTreeMap<String, FlagEvaluator>,
    cache: BTreeMap<String, FlagValue>,
    url_flags: BTreeMap<String, FlagValue>,
    debug_banner_shown: bool,
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an environment with the engine's standard flags registered.
    #[must_use]
    pub fn with_engine_flags() -> Self {
        let mut env = Self::new();
        env.register_flag(DEBUG, || FlagValue::Bool(false));
        env.register_flag(IS_TEST, || FlagValue::Bool(false));
        env.register_flag(PROD, || FlagValue::Bool(false));
        env.register_flag(CHECK_COMPUTATION_FOR_ERRORS, || FlagValue::Bool(true));
        env
    }

    pub fn register_flag(&mut self, name: &str, evaluator: FlagEvaluator) {
        if self.registry.contains_key(name) {
            log::warn!("flag '{name}' was already registered, keeping the new evaluator");
        }
        self.registry.insert(name.to_string(), evaluator);
    }

    #[must_use]
    pub fn has_flag(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    pub fn get(&mut self, name: &str) -> Result<FlagValue, EnvError> {
        if let Some(value) = self.cache.get(name) {
            return Ok(value.clone());
        }
        let value = self.evaluate(name)?;
        self.note_debug_banner(name, &value);
        self.cache.insert(name.to_string(), value.clone());
        Ok(value)
    }

    pub fn get_bool(&mut self, name: &str) -> Result<bool, EnvError> {
        match self.get(name)? {
            FlagValue::Bool(value) => Ok(value),
            other => Err(EnvError::TypeMismatch {
                name: name.to_string(),
                expected: "bool",
                actual: other.kind(),
            }),
        }
    }

    pub fn get_number(&mut self, name: &str) -> Result<f64, EnvError> {
        match self.get(name)? {
            FlagValue::Number(value) => Ok(value),
            other => Err(EnvError::TypeMismatch {
                name: name.to_string(),
                expected: "number",
                actual: other.kind(),
            }),
        }
    }

    pub fn get_string(&mut self, name: &str) -> Result<String, EnvError> {
        match self.get(name)? {
            FlagValue::Str(value) => Ok(value),
            other => Err(EnvError::TypeMismatch {
                name: name.to_string(),
                expected: "string",
                actual: other.kind(),
            }),
        }
    }

    pub fn set(&mut self, name: &str, value: FlagValue) -> Result<(), EnvError> {
        if !self.registry.contains_key(name) {
            return Err(EnvError::UnregisteredFlag {
                name: name.to_string(),
            });
        }
        self.note_debug_banner(name, &value);
        self.cache.insert(name.to_string(), value);
        Ok(())
    }

    /// Clears cached evaluations; query-string overrides survive a reset,
    /// matching "overrides hold for the life of the process".
    pub fn reset(&mut self) {
        self.cache = self.url_flags.clone();
        self.debug_banner_shown = false;
    }

    /// Parses `flags=NAME:value,NAME2:value2` pairs out of a query string and
    /// applies them as overrides. Unregistered names are skipped with a
    /// warning. Returns the number of overrides applied.
    pub fn apply_query_overrides(&mut self, query: &str) -> usize {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut applied = 0usize;
        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key != FLAGS_QUERY_PARAM {
                continue;
            }
            for pair in value.split(',') {
                let Some((name, raw)) = pair.split_once(':') else {
                    log::warn!("ignoring malformed flag override '{pair}'");
                    continue;
                };
                if !self.registry.contains_key(name) {
                    log::warn!("ignoring override for unregistered flag '{name}'");
                    continue;
                }
                let value = parse_flag_value(raw);
                self.note_debug_banner(name, &value);
                self.url_flags.insert(name.to_string(), value.clone());
                self.cache.insert(name.to_string(), value);
                applied += 1;
            }
        }
        applied
    }

    fn evaluate(&self, name: &str) -> Result<FlagValue, EnvError> {
        let evaluator = self
            .registry
            .get(name)
            .ok_or_else(|| EnvError::UnregisteredFlag {
                name: name.to_string(),
            })?;
        Ok(evaluator())
    }

    fn note_debug_banner(&mut self, name: &str, value: &FlagValue) {
        if name == DEBUG && matches!(value, FlagValue::Bool(true)) && !self.debug_banner_shown {
            self.debug_banner_shown = true;
            log::warn!(
                "debug mode is on: every kernel is profiled and outputs are \
                 checked for NaN, which slows execution down considerably"
            );
        }
    }
}

fn parse_flag_value(raw: &str) -> FlagValue {
    match raw {
        "true" => FlagValue::Bool(true),
        "false" => FlagValue::Bool(false),
        _ => raw
            .parse::<f64>()
            .map_or_else(|_| FlagValue::Str(raw.to_string()), FlagValue::Number),
    }
}
