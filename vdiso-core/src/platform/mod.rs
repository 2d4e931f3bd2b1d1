//! Platform service surface.
//!
//! The privileged control plane is reached through a [`ServiceRegistry`]
//! that locates named services. Each [`ServiceHandle`] lists the method
//! signatures it exposes on the running platform revision and executes
//! calls with positional [`Value`] arguments. Nothing above this module
//! knows which concrete signatures exist; the capability layer probes
//! them at bind time.
//!
//! | Backend    | Purpose                                                |
//! |------------|--------------------------------------------------------|
//! | `loopback` | In-process platform: generated frames, recorded input  |
//! | `shell`    | Privileged shell channel (`dumpsys`, `wm`, `input`)    |

pub mod loopback;
pub mod shell;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::display::config::VirtualOutputSpec;
use crate::input::event::InputEvent;
use crate::relay::queue::ProducerEndpoint;

pub use loopback::LoopbackPlatform;
pub use shell::ShellPlatform;

// ── Signatures ───────────────────────────────────────────────────

/// Parameter / return types a platform method can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    Void,
    Int,
    Long,
    Float,
    Bool,
    Str,
    StrArray,
    InputEvent,
    DisplayConfig,
    DisplayCallback,
    MediaProjection,
    Binder,
    Surface,
}

/// A method as exposed by a service on the running platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<ArgType>,
    pub returns: ArgType,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, params: &[ArgType], returns: ArgType) -> Self {
        Self {
            name: name.into(),
            params: params.to_vec(),
            returns,
        }
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p:?}")?;
        }
        write!(f, ") -> {:?}", self.returns)
    }
}

// ── Values ───────────────────────────────────────────────────────

/// Identity of the callback object registered with a virtual output.
///
/// The platform keys the output on it; destroying or re-targeting the
/// output passes the same token back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputToken(pub u64);

/// A positional argument or return value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Void,
    Int(i32),
    Long(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    StrArray(Vec<String>),
    Event(InputEvent),
    Config(Box<VirtualOutputSpec>),
    Callback(OutputToken),
    Binder(OutputToken),
    Surface(Option<ProducerEndpoint>),
}

impl Value {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Long(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<OutputToken> {
        match self {
            Value::Callback(t) | Value::Binder(t) => Some(*t),
            _ => None,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────

/// Failure reported by a platform service call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The caller lacks the privilege for this call.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Arguments did not fit the method.
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// The call reached the service but failed.
    #[error("{0}")]
    Failed(String),
}

// ── Traits ───────────────────────────────────────────────────────

/// A located privileged service.
pub trait ServiceHandle: Send + Sync {
    /// Service name as registered with the platform (e.g. `"input"`).
    fn name(&self) -> &str;

    /// Every method this service exposes on the running platform.
    fn methods(&self) -> Vec<MethodSignature>;

    /// Execute `method` with positional arguments.
    fn call(&self, method: &MethodSignature, args: &[Value]) -> Result<Value, CallError>;
}

/// Entry point to the privileged control plane.
pub trait ServiceRegistry: Send + Sync {
    /// Locate a named service. `None` when the platform has no such
    /// service or the privileged channel cannot reach it.
    fn locate(&self, name: &str) -> Option<Arc<dyn ServiceHandle>>;

    /// Whether the privileged channel is currently usable.
    fn is_available(&self) -> bool;

    /// Platform revision level (API level) used to pick display flags.
    fn platform_level(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_display_lists_params() {
        let sig = MethodSignature::new(
            "injectInputEvent",
            &[ArgType::InputEvent, ArgType::Int],
            ArgType::Bool,
        );
        assert_eq!(sig.to_string(), "injectInputEvent(InputEvent, Int) -> Bool");
    }

    #[test]
    fn value_accessors() {
        assert_eq!(Value::Long(5).as_int(), Some(5));
        assert_eq!(Value::Long(i64::MAX).as_int(), None);
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Str("x".into()).into_string().as_deref(), Some("x"));
        assert_eq!(Value::Binder(OutputToken(3)).as_token(), Some(OutputToken(3)));
    }
}
