//! Synchronous gestures on top of [`EventInjector`].
//!
//! These bypass the injection queue so a gesture's `Down` always precedes
//! its `Up`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::VdError;
use crate::input::event::{InputEvent, KEYCODE_BACK, KEYCODE_HOME, KeyAction, MotionAction};
use crate::input::injector::EventInjector;
use crate::types::{DisplayId, uptime_ms};

/// Interpolation step of a swipe.
pub const SWIPE_STEP: Duration = Duration::from_millis(16);

pub struct Gestures {
    injector: Arc<EventInjector>,
    display: watch::Receiver<Option<DisplayId>>,
}

impl Gestures {
    pub fn new(injector: Arc<EventInjector>, display: watch::Receiver<Option<DisplayId>>) -> Self {
        Self { injector, display }
    }

    fn target(&self) -> Result<DisplayId, VdError> {
        (*self.display.borrow()).ok_or(VdError::NotStarted)
    }

    pub fn tap(&self, x: f32, y: f32) -> Result<(), VdError> {
        let display = self.target()?;
        let down = uptime_ms();
        self.injector
            .inject(&InputEvent::touch(MotionAction::Down, down, x, y, display), true);
        self.injector
            .inject(&InputEvent::touch(MotionAction::Up, down, x, y, display), false);
        Ok(())
    }

    /// Linear swipe over `duration`, one `Move` per step.
    pub fn swipe(&self, from: (f32, f32), to: (f32, f32), duration: Duration) -> Result<(), VdError> {
        let display = self.target()?;
        let down = uptime_ms();
        let steps = (duration.as_millis() / SWIPE_STEP.as_millis()).max(1) as u32;

        self.injector.inject(
            &InputEvent::touch(MotionAction::Down, down, from.0, from.1, display),
            true,
        );
        for i in 1..=steps {
            let f = i as f32 / steps as f32;
            let x = from.0 + (to.0 - from.0) * f;
            let y = from.1 + (to.1 - from.1) * f;
            self.injector
                .inject(&InputEvent::touch(MotionAction::Move, down, x, y, display), false);
            thread::sleep(SWIPE_STEP);
        }
        self.injector
            .inject(&InputEvent::touch(MotionAction::Up, down, to.0, to.1, display), false);
        Ok(())
    }

    pub fn key(&self, key_code: i32) -> Result<(), VdError> {
        let display = self.target()?;
        let down = uptime_ms();
        self.injector
            .inject(&InputEvent::key(KeyAction::Down, key_code, down, display), true);
        self.injector
            .inject(&InputEvent::key(KeyAction::Up, key_code, down, display), false);
        Ok(())
    }

    pub fn back(&self) -> Result<(), VdError> {
        self.key(KEYCODE_BACK)
    }

    pub fn home(&self) -> Result<(), VdError> {
        self.key(KEYCODE_HOME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityClient;
    use crate::platform::ServiceRegistry;
    use crate::platform::loopback::{LoopbackConfig, LoopbackPlatform, RecordedEvent};

    fn setup(display: Option<i32>) -> (Arc<LoopbackPlatform>, Gestures) {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let client = Arc::new(CapabilityClient::new(
            Arc::clone(&platform) as Arc<dyn ServiceRegistry>
        ));
        let (_tx, rx) = watch::channel(display.and_then(DisplayId::new));
        let g = Gestures::new(Arc::new(EventInjector::new(client)), rx);
        (platform, g)
    }

    #[test]
    fn tap_is_down_then_up() {
        let (platform, g) = setup(Some(2));
        g.tap(5.0, 6.0).unwrap();
        let events = platform.injected_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RecordedEvent::Motion { action: MotionAction::Down, .. }));
        assert!(matches!(events[1], RecordedEvent::Motion { action: MotionAction::Up, .. }));
    }

    #[test]
    fn swipe_interpolates_to_target() {
        let (platform, g) = setup(Some(2));
        g.swipe((0.0, 0.0), (100.0, 50.0), Duration::from_millis(64)).unwrap();
        let events = platform.injected_events();
        // down + 4 moves + up
        assert_eq!(events.len(), 6);
        assert_eq!(
            events[4],
            RecordedEvent::Motion {
                action: MotionAction::Move,
                x: 100.0,
                y: 50.0,
                display: 2
            }
        );
    }

    #[test]
    fn keys_need_a_display() {
        let (_, g) = setup(None);
        assert!(matches!(g.back(), Err(VdError::NotStarted)));

        let (platform, g) = setup(Some(3));
        g.home().unwrap();
        assert_eq!(
            platform.injected_events()[1],
            RecordedEvent::Key {
                action: KeyAction::Up,
                code: KEYCODE_HOME,
                display: 3
            }
        );
    }
}
