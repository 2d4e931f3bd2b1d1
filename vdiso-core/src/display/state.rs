//! Lifecycle state of the virtual output.
//!
//! Transitions return `Result` instead of panicking, so a misordered call
//! surfaces as [`VdError::InvalidState`].

use std::time::Instant;

use crate::error::VdError;
use crate::types::DisplayId;

/// ```text
///  Stopped ──► Starting ──► Running
///     ▲           │            │
///     │           ▼            ▼
///     └──────── Stopping ◄─────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputState {
    /// No virtual output. Initial / terminal state.
    #[default]
    Stopped,

    /// Pipeline and platform output are being created.
    Starting,

    /// The output exists and owns `display`.
    Running { display: DisplayId, since: Instant },

    /// Teardown in progress.
    Stopping,
}

impl std::fmt::Display for OutputState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Running { display, .. } => write!(f, "Running({display})"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

impl OutputState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Display id; only ever set while `Running`.
    pub fn display(&self) -> Option<DisplayId> {
        match self {
            Self::Running { display, .. } => Some(*display),
            _ => None,
        }
    }

    pub fn uptime(&self) -> Option<std::time::Duration> {
        match self {
            Self::Running { since, .. } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Stopped`.
    pub fn begin_start(&mut self) -> Result<(), VdError> {
        match self {
            Self::Stopped => {
                *self = Self::Starting;
                Ok(())
            }
            _ => Err(VdError::InvalidState("cannot start: not Stopped")),
        }
    }

    /// Valid from: `Starting`.
    pub fn complete_start(&mut self, display: DisplayId) -> Result<(), VdError> {
        match self {
            Self::Starting => {
                *self = Self::Running {
                    display,
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(VdError::InvalidState("cannot complete start: not Starting")),
        }
    }

    /// Valid from: `Starting`, `Running`.
    pub fn begin_stop(&mut self) -> Result<(), VdError> {
        match self {
            Self::Starting | Self::Running { .. } => {
                *self = Self::Stopping;
                Ok(())
            }
            _ => Err(VdError::InvalidState("cannot stop: not Starting or Running")),
        }
    }

    /// Valid from: `Stopping`.
    pub fn finish_stop(&mut self) -> Result<(), VdError> {
        match self {
            Self::Stopping => {
                *self = Self::Stopped;
                Ok(())
            }
            _ => Err(VdError::InvalidState("cannot finish stop: not Stopping")),
        }
    }

    /// Reset to `Stopped` regardless of the current state.
    pub fn force_stop(&mut self) {
        *self = Self::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i32) -> DisplayId {
        DisplayId::new(n).unwrap()
    }

    #[test]
    fn full_cycle() {
        let mut s = OutputState::default();
        s.begin_start().unwrap();
        assert_eq!(s.display(), None);
        s.complete_start(id(3)).unwrap();
        assert_eq!(s.display(), Some(id(3)));
        assert!(s.is_running());
        s.begin_stop().unwrap();
        assert_eq!(s.display(), None);
        s.finish_stop().unwrap();
        assert!(s.is_stopped());
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut s = OutputState::default();
        assert!(s.complete_start(id(1)).is_err());
        assert!(s.begin_stop().is_err());
        s.begin_start().unwrap();
        assert!(s.begin_start().is_err());
        s.force_stop();
        assert!(s.is_stopped());
    }

    #[test]
    fn display_format() {
        let mut s = OutputState::Starting;
        s.complete_start(id(9)).unwrap();
        assert_eq!(s.to_string(), "Running(9)");
    }
}
