//! # vdiso-core
//!
//! Private virtual display engine for automation agents.
//!
//! This crate contains:
//! - **Capability**: `CapabilityClient` binding privileged operations to
//!   whichever call signature the running platform exposes
//! - **Display**: `VirtualOutput` lifecycle over relay or direct output modes
//! - **Relay**: `FramePipeline` rendering producer frames to a preview
//!   target and to on-demand captures
//! - **Input**: `InjectionQueue`, `Gestures` and the shared `EventInjector`
//! - **Focus**: `FocusController` detecting and countering keyboard focus theft
//! - **Platform**: `loopback` and `shell` service backends
//! - **Update**: remote update descriptor model
//! - **Error**: `VdError`, typed and `thiserror`-based

pub mod capability;
pub mod display;
pub mod error;
pub mod focus;
pub mod input;
pub mod platform;
pub mod relay;
pub mod throttle;
pub mod types;
pub mod update;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capability::{Capability, CapabilityClient};
pub use display::{OutputConfig, OutputFlags, OutputMode, OutputState, VirtualOutput};
pub use error::VdError;
pub use focus::{FocusConfig, FocusController, FocusHazardState};
pub use input::{EventInjector, Gestures, InjectionQueue};
pub use platform::{LoopbackPlatform, ServiceRegistry, ShellPlatform};
pub use relay::{FramePipeline, GpuFactory, SoftwareGpu, software_factory};
pub use types::{Bitmap, DisplayId, RawFrame};
pub use update::UpdateInfo;
