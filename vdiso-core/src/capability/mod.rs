//! Capability negotiation against privileged platform services.
//!
//! A [`Capability`] is an abstract privileged operation. Its concrete call
//! signature differs between platform revisions, so each capability owns
//! a fixed, priority-ordered table of [`SignatureVariant`]s. The first
//! variant whose method the platform actually exposes wins; the resulting
//! [`BoundInvoker`] is cached by the [`CapabilityClient`] and never
//! re-probed.
//!
//! ```text
//!  bind(cap) ──► cache hit? ──yes──► Arc<BoundInvoker>
//!                   │ no
//!                   ▼
//!        locate services ──none──► ServiceDiscovery
//!                   │
//!        probe variants in order ──no match──► MethodResolution
//!                   │
//!                   ▼
//!        log chosen variant once, cache, return
//! ```

pub mod client;
pub mod variants;

use std::fmt;

use crate::display::config::VirtualOutputSpec;
use crate::input::event::InputEvent;
use crate::platform::{ArgType, CallError, MethodSignature, OutputToken, Value};
use crate::relay::queue::ProducerEndpoint;
use crate::types::DisplayId;

pub use client::{BoundInvoker, CapabilityClient};

// ── Capability ───────────────────────────────────────────────────

/// Abstract privileged operations the engine relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    CreateVirtualOutput,
    DestroyVirtualOutput,
    SetOutputSurface,
    InjectEvent,
    QueryWindowState,
    AssertDisplayFocus,
    FocusedDisplay,
    MoveTaskToDisplay,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::CreateVirtualOutput,
        Capability::DestroyVirtualOutput,
        Capability::SetOutputSurface,
        Capability::InjectEvent,
        Capability::QueryWindowState,
        Capability::AssertDisplayFocus,
        Capability::FocusedDisplay,
        Capability::MoveTaskToDisplay,
    ];

    /// Known call signatures, highest priority first.
    pub fn variants(self) -> &'static [SignatureVariant] {
        variants::table(self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::CreateVirtualOutput => "createVirtualOutput",
            Capability::DestroyVirtualOutput => "destroyVirtualOutput",
            Capability::SetOutputSurface => "setOutputSurface",
            Capability::InjectEvent => "injectEvent",
            Capability::QueryWindowState => "queryWindowState",
            Capability::AssertDisplayFocus => "assertDisplayFocus",
            Capability::FocusedDisplay => "focusedDisplay",
            Capability::MoveTaskToDisplay => "moveTaskToDisplay",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── InjectMode ───────────────────────────────────────────────────

/// Synchronisation mode passed with an injected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InjectMode {
    /// Fire and forget.
    Async = 0,
    WaitForResult = 1,
    WaitForFinish = 2,
}

// ── Request ──────────────────────────────────────────────────────

/// Typed arguments of a capability call, before they are laid out for a
/// concrete signature.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    CreateOutput {
        spec: &'a VirtualOutputSpec,
        token: OutputToken,
        owner_package: &'a str,
    },
    DestroyOutput {
        token: OutputToken,
    },
    SetOutputSurface {
        token: OutputToken,
        endpoint: Option<&'a ProducerEndpoint>,
    },
    InjectEvent {
        event: &'a InputEvent,
        display: DisplayId,
        mode: InjectMode,
    },
    QueryWindowState,
    AssertFocus {
        display: DisplayId,
    },
    FocusedDisplay,
    MoveTask {
        task_id: i32,
        display: DisplayId,
    },
}

/// Lays typed request data out as positional arguments.
pub type Encoder = fn(&Request<'_>) -> Result<Vec<Value>, CallError>;

// ── SignatureVariant ─────────────────────────────────────────────

/// One known way a platform revision exposes a capability.
#[derive(Debug)]
pub struct SignatureVariant {
    /// Service the method lives on.
    pub service: &'static str,
    /// Method name.
    pub method: &'static str,
    /// Exact parameter list.
    pub params: &'static [ArgType],
    /// Declared return type.
    pub returns: ArgType,
    /// Argument layout for this signature.
    pub encode: Encoder,
}

impl SignatureVariant {
    /// Whether an exposed method is exactly this variant.
    pub fn matches(&self, service: &str, sig: &MethodSignature) -> bool {
        self.service == service
            && sig.name == self.method
            && sig.params == self.params
            && sig.returns == self.returns
    }

    /// The signature this variant expects the platform to expose.
    pub fn signature(&self) -> MethodSignature {
        MethodSignature::new(self.method, self.params, self.returns)
    }
}

impl fmt::Display for SignatureVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.signature())
    }
}
