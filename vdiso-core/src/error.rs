//! Domain-specific error types for the virtual display engine.
//!
//! All fallible operations return `Result<T, VdError>`. Best-effort paths
//! (injection, focus correction, teardown) log and swallow instead of
//! returning.

use std::time::Duration;
use thiserror::Error;

use crate::capability::Capability;
use crate::platform::CallError;

/// The canonical error type for vdiso.
#[derive(Debug, Error)]
pub enum VdError {
    // ── Capability Errors ────────────────────────────────────────
    /// The privileged service backing a capability could not be located.
    #[error("service discovery failed for {capability}: no service among [{services}]")]
    ServiceDiscovery {
        capability: Capability,
        services: String,
    },

    /// The service exists but exposes none of the known call signatures.
    #[error("no known signature of {capability} is exposed by the platform")]
    MethodResolution { capability: Capability },

    /// A bound capability call failed on the platform side.
    #[error("{capability} call failed: {message}")]
    Invocation {
        capability: Capability,
        message: String,
    },

    /// The platform rejected the call for lack of privilege.
    #[error("{capability} denied: {message}")]
    PermissionDenied {
        capability: Capability,
        message: String,
    },

    // ── GPU Errors ───────────────────────────────────────────────
    /// Context, program or surface creation failed during start.
    #[error("gpu init failed: {0}")]
    GpuInit(String),

    /// A GPU operation failed after initialisation.
    #[error("gpu error: {0}")]
    Gpu(String),

    /// A producer buffer whose size, stride or data length disagree.
    #[error("malformed frame: {0}")]
    InvalidFrame(String),

    /// No frame arrived before the capture deadline.
    #[error("no frame captured within {0:?}")]
    FrameCaptureTimeout(Duration),

    /// The pipeline did not expose a producer endpoint in time.
    #[error("producer endpoint not ready after {0:?}")]
    ProducerTimeout(Duration),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// The operation needs a running virtual display.
    #[error("virtual display is not started")]
    NotStarted,

    /// The operation is not supported by the active output mode or backend.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A configuration value is outside its accepted range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A state transition was requested from the wrong state.
    #[error("invalid state transition: {0}")]
    InvalidState(&'static str),

    // ── Plumbing Errors ──────────────────────────────────────────
    /// A worker channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl VdError {
    /// Attach capability context to a platform call failure.
    pub fn from_call(capability: Capability, err: CallError) -> Self {
        match err {
            CallError::PermissionDenied(message) => VdError::PermissionDenied {
                capability,
                message,
            },
            CallError::BadArguments(message) | CallError::Failed(message) => {
                VdError::Invocation {
                    capability,
                    message,
                }
            }
        }
    }

    /// Whether the error means the platform refused for lack of privilege.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, VdError::PermissionDenied { .. })
    }

    /// Whether the error is a bind-time failure (discovery or resolution).
    pub fn is_bind_failure(&self) -> bool {
        matches!(
            self,
            VdError::ServiceDiscovery { .. } | VdError::MethodResolution { .. }
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for VdError {
    fn from(s: String) -> Self {
        VdError::Other(s)
    }
}

impl From<&str> for VdError {
    fn from(s: &str) -> Self {
        VdError::Other(s.to_string())
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for VdError {
    fn from(_: std::sync::mpsc::SendError<T>) -> Self {
        VdError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = VdError::MethodResolution {
            capability: Capability::InjectEvent,
        };
        assert!(e.to_string().contains("injectEvent"));

        let e = VdError::FrameCaptureTimeout(Duration::from_millis(800));
        assert!(e.to_string().contains("800ms"));
    }

    #[test]
    fn from_string() {
        let e: VdError = "something broke".into();
        assert!(matches!(e, VdError::Other(_)));
    }

    #[test]
    fn call_error_keeps_permission_kind() {
        let e = VdError::from_call(
            Capability::CreateVirtualOutput,
            CallError::PermissionDenied("not trusted".into()),
        );
        assert!(e.is_permission_denied());
        assert!(!e.is_bind_failure());

        let e = VdError::from_call(Capability::QueryWindowState, CallError::Failed("exit 1".into()));
        assert!(matches!(e, VdError::Invocation { .. }));
    }
}
