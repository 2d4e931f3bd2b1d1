//! Synthetic input events as submitted to the platform.
//!
//! Touch events carry exactly one pointer. Pointer properties and
//! coordinates are cached per thread and refreshed in place for every
//! event, so the hot path allocates nothing beyond the event itself.

use std::cell::RefCell;

use crate::types::{DisplayId, uptime_ms};

/// Source class stamped on touch events.
pub const SOURCE_TOUCHSCREEN: u32 = 0x1002;
/// Source class stamped on key events.
pub const SOURCE_KEYBOARD: u32 = 0x0101;

pub const KEYCODE_HOME: i32 = 3;
pub const KEYCODE_BACK: i32 = 4;

// ── Actions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAction {
    Down,
    Up,
    Move,
}

impl MotionAction {
    /// Platform action code.
    pub fn code(self) -> i32 {
        match self {
            MotionAction::Down => 0,
            MotionAction::Up => 1,
            MotionAction::Move => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
}

impl KeyAction {
    pub fn code(self) -> i32 {
        match self {
            KeyAction::Down => 0,
            KeyAction::Up => 1,
        }
    }
}

// ── Pointer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolType {
    Finger,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerProperties {
    pub id: i32,
    pub tool_type: ToolType,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerCoords {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub size: f32,
}

thread_local! {
    static POINTER: RefCell<(PointerProperties, PointerCoords)> = const {
        RefCell::new((
            PointerProperties {
                id: 0,
                tool_type: ToolType::Finger,
            },
            PointerCoords {
                x: 0.0,
                y: 0.0,
                pressure: 1.0,
                size: 1.0,
            },
        ))
    };
}

// ── Events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MotionEvent {
    pub down_time_ms: u64,
    pub event_time_ms: u64,
    pub action: MotionAction,
    pub pointer: PointerProperties,
    pub coords: PointerCoords,
    pub source: u32,
    pub display: DisplayId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent {
    pub down_time_ms: u64,
    pub event_time_ms: u64,
    pub action: KeyAction,
    pub key_code: i32,
    pub repeat: i32,
    pub meta_state: i32,
    pub source: u32,
    pub display: DisplayId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Motion(MotionEvent),
    Key(KeyEvent),
}

impl InputEvent {
    /// Single-pointer touch event stamped with the current time.
    pub fn touch(action: MotionAction, down_time_ms: u64, x: f32, y: f32, display: DisplayId) -> Self {
        let (pointer, coords) = POINTER.with(|cell| {
            let mut cached = cell.borrow_mut();
            cached.1.x = x;
            cached.1.y = y;
            *cached
        });
        InputEvent::Motion(MotionEvent {
            down_time_ms,
            event_time_ms: uptime_ms(),
            action,
            pointer,
            coords,
            source: SOURCE_TOUCHSCREEN,
            display,
        })
    }

    pub fn key(action: KeyAction, key_code: i32, down_time_ms: u64, display: DisplayId) -> Self {
        InputEvent::Key(KeyEvent {
            down_time_ms,
            event_time_ms: uptime_ms(),
            action,
            key_code,
            repeat: 0,
            meta_state: 0,
            source: SOURCE_KEYBOARD,
            display,
        })
    }

    pub fn display(&self) -> DisplayId {
        match self {
            InputEvent::Motion(m) => m.display,
            InputEvent::Key(k) => k.display,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_uses_single_finger_pointer() {
        let d = DisplayId::new(3).unwrap();
        let InputEvent::Motion(m) = InputEvent::touch(MotionAction::Down, 10, 5.0, 6.0, d) else {
            panic!("expected motion");
        };
        assert_eq!(m.pointer.tool_type, ToolType::Finger);
        assert_eq!((m.coords.x, m.coords.y), (5.0, 6.0));
        assert_eq!(m.coords.pressure, 1.0);
        assert_eq!(m.display, d);
    }

    #[test]
    fn cached_pointer_is_refreshed() {
        let d = DisplayId::new(3).unwrap();
        InputEvent::touch(MotionAction::Down, 0, 1.0, 1.0, d);
        let InputEvent::Motion(m) = InputEvent::touch(MotionAction::Move, 0, 9.0, 8.0, d) else {
            panic!("expected motion");
        };
        assert_eq!((m.coords.x, m.coords.y), (9.0, 8.0));
    }

    #[test]
    fn action_codes() {
        assert_eq!(MotionAction::Down.code(), 0);
        assert_eq!(MotionAction::Up.code(), 1);
        assert_eq!(MotionAction::Move.code(), 2);
        assert_eq!(KeyAction::Up.code(), 1);
    }
}
