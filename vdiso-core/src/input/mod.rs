//! Synthetic input into the virtual display.
//!
//! [`InjectionQueue`] serialises and coalesces touch / key commands onto a
//! dedicated worker; [`Gestures`] offers synchronous tap, swipe and key
//! presses. Both submit through one [`EventInjector`].

pub mod event;
pub mod gesture;
pub mod injector;
pub mod queue;

pub use event::{InputEvent, KeyAction, MotionAction};
pub use gesture::Gestures;
pub use injector::EventInjector;
pub use queue::{CommandKind, InjectionCommand, InjectionQueue};
