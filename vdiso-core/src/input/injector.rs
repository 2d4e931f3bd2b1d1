//! Single-event submission with optional focus correction.
//!
//! Everything here is best effort: a failed injection is logged (at most
//! once per second) and dropped, never retried.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::capability::{CapabilityClient, InjectMode};
use crate::focus::FocusHazardState;
use crate::input::event::InputEvent;
use crate::throttle::LogThrottle;
use crate::types::DisplayId;

/// Minimum spacing between two pre-injection focus corrections.
pub const DEFAULT_FOCUS_INTERVAL: Duration = Duration::from_millis(400);

pub struct EventInjector {
    client: Arc<CapabilityClient>,
    focus_interval: Duration,
    last_focus: Mutex<Option<Instant>>,
    hazard: Option<watch::Receiver<FocusHazardState>>,
    failures: LogThrottle,
}

impl EventInjector {
    pub fn new(client: Arc<CapabilityClient>) -> Self {
        Self {
            client,
            focus_interval: DEFAULT_FOCUS_INTERVAL,
            last_focus: Mutex::new(None),
            hazard: None,
            failures: LogThrottle::new(Duration::from_secs(1)),
        }
    }

    pub fn with_focus_interval(mut self, interval: Duration) -> Self {
        self.focus_interval = interval;
        self
    }

    /// Skip focus corrections while the arbitration controller already
    /// holds a lock on the target display.
    pub fn with_hazard_state(mut self, hazard: watch::Receiver<FocusHazardState>) -> Self {
        self.hazard = Some(hazard);
        self
    }

    pub fn client(&self) -> &Arc<CapabilityClient> {
        &self.client
    }

    /// Submit `event` asynchronously. Returns whether the platform
    /// accepted it; failures are swallowed.
    pub fn inject(&self, event: &InputEvent, ensure_focus: bool) -> bool {
        let display = event.display();
        if ensure_focus {
            self.correct_focus(display);
        }

        match self.client.inject_event(event, display, InjectMode::Async) {
            Ok(accepted) => {
                if !accepted {
                    self.log_failure(display, "rejected by platform");
                }
                accepted
            }
            Err(e) => {
                self.log_failure(display, &e.to_string());
                false
            }
        }
    }

    fn log_failure(&self, id: DisplayId, reason: &str) {
        if let Some(suppressed) = self.failures.allow() {
            warn!(display = %id, suppressed, reason, "input injection failed");
        }
    }

    fn correct_focus(&self, display: DisplayId) {
        if self.locked_on(display) {
            return;
        }
        {
            let mut last = self.last_focus.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if last.is_some_and(|t| now.duration_since(t) < self.focus_interval) {
                return;
            }
            *last = Some(now);
        }
        if let Err(e) = self.client.ensure_focused_display(display) {
            let id = display;
            debug!(display = %id, error = %e, "focus correction failed");
        }
    }

    fn locked_on(&self, display: DisplayId) -> bool {
        self.hazard
            .as_ref()
            .is_some_and(|rx| rx.borrow().locked_display() == Some(display))
    }
}
