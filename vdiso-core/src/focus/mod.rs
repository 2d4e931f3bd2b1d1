//! Focus arbitration between the virtual display and the soft keyboard.
//!
//! On some platform revisions an input-method window that appears on the
//! virtual display steals input focus and never gives it back. The
//! [`FocusController`] samples window state, and while the keyboard is
//! active there it keeps reasserting focus on the virtual display.
//!
//! ```text
//!          active sample
//!   Clear ───────────────► Locked(display, reason)
//!     ▲                        │  force-lock every ~90ms
//!     └────────────────────────┘
//!        inactive sample / stop()
//! ```

pub mod controller;
pub mod window_state;

pub use controller::{FocusConfig, FocusController, FocusTransition};
pub use window_state::{ImeSample, parse_ime_state};

use crate::types::DisplayId;

/// Whether the keyboard currently holds the virtual display hostage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FocusHazardState {
    #[default]
    Clear,
    Locked { display: DisplayId, reason: String },
}

impl FocusHazardState {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    pub fn locked_display(&self) -> Option<DisplayId> {
        match self {
            Self::Locked { display, .. } => Some(*display),
            Self::Clear => None,
        }
    }
}

impl std::fmt::Display for FocusHazardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clear => write!(f, "Clear"),
            Self::Locked { display, .. } => write!(f, "Locked({display})"),
        }
    }
}
