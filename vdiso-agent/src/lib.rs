//! # vdiso-agent: private virtual display service
//!
//! Keeps one off-screen virtual display alive for an automation agent:
//! frames relay through the software GPU backend, input goes through the
//! coalescing injection queue, and the focus controller keeps the soft
//! keyboard from stealing focus off the display.
//!
//! ## Modes
//!
//! - **Run** (default): start everything and log status until Ctrl-C.
//! - **Capture**: write one settled raw RGBA capture and exit.
//! - **Guard only**: run focus arbitration against an existing display.

pub mod config;
pub mod service;
