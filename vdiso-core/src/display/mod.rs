//! Virtual output lifecycle.
//!
//! [`VirtualOutput`] creates, starts and stops exactly one virtual display.
//! The output mode ([`OutputMode`]) is picked at start time: the GPU relay
//! or a caller surface handed straight to the platform.

pub mod config;
pub mod lifecycle;
pub mod state;
pub mod strategy;

pub use config::{FLAG_TABLE, OutputConfig, OutputFlags, VirtualOutputSpec, flags_for_level};
pub use lifecycle::{DisplayHandle, VirtualOutput};
pub use state::OutputState;
pub use strategy::{OutputMode, OutputStrategy};
