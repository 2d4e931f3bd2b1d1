//! Ordered, coalescing injection queue drained by one worker thread.
//!
//! - `Move` replaces any pending `Move` and goes to the tail, so at most
//!   one `Move` is ever queued.
//! - `Down`, `Up`, `KeyDown`, `KeyUp` go to the head. Two of them queued
//!   back to back before the worker drains are serviced newest first.
//! - Commands for a non-positive display id are dropped on enqueue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::VdError;
use crate::input::event::{InputEvent, KeyAction, MotionAction};
use crate::input::injector::EventInjector;
use crate::types::DisplayId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandKind {
    Down { x: f32, y: f32 },
    Move { x: f32, y: f32 },
    Up { x: f32, y: f32 },
    KeyDown(i32),
    KeyUp(i32),
}

impl CommandKind {
    pub fn is_move(&self) -> bool {
        matches!(self, CommandKind::Move { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectionCommand {
    /// Raw target display id; non-positive ids are dropped.
    pub display: i32,
    /// Down time of the gesture this command belongs to.
    pub down_time_ms: u64,
    pub kind: CommandKind,
    pub ensure_focus: bool,
}

impl InjectionCommand {
    fn to_event(self, display: DisplayId) -> InputEvent {
        let down = self.down_time_ms;
        match self.kind {
            CommandKind::Down { x, y } => InputEvent::touch(MotionAction::Down, down, x, y, display),
            CommandKind::Move { x, y } => InputEvent::touch(MotionAction::Move, down, x, y, display),
            CommandKind::Up { x, y } => InputEvent::touch(MotionAction::Up, down, x, y, display),
            CommandKind::KeyDown(code) => InputEvent::key(KeyAction::Down, code, down, display),
            CommandKind::KeyUp(code) => InputEvent::key(KeyAction::Up, code, down, display),
        }
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<(DisplayId, InjectionCommand)>,
    paused: bool,
    closed: bool,
}

#[derive(Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    cv: Condvar,
    processed: AtomicU64,
}

pub struct InjectionQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InjectionQueue {
    /// Spawn the injection worker.
    pub fn start(injector: Arc<EventInjector>) -> Result<Self, VdError> {
        let shared = Arc::new(QueueShared::default());
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("vdiso-input".into())
                .spawn(move || injection_worker(shared, injector))?
        };
        info!("injection queue started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue one command. Returns `false` when it was dropped.
    pub fn enqueue(&self, cmd: InjectionCommand) -> bool {
        let Some(display) = DisplayId::new(cmd.display) else {
            debug!(display = cmd.display, "dropping command for invalid display");
            return false;
        };

        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return false;
        }
        if cmd.kind.is_move() {
            state.items.retain(|(_, c)| !c.kind.is_move());
            state.items.push_back((display, cmd));
        } else {
            state.items.push_front((display, cmd));
        }
        self.shared.cv.notify_one();
        true
    }

    pub fn touch_down(&self, display: i32, down_time_ms: u64, x: f32, y: f32, ensure_focus: bool) -> bool {
        self.enqueue(InjectionCommand {
            display,
            down_time_ms,
            kind: CommandKind::Down { x, y },
            ensure_focus,
        })
    }

    pub fn touch_move(&self, display: i32, down_time_ms: u64, x: f32, y: f32, ensure_focus: bool) -> bool {
        self.enqueue(InjectionCommand {
            display,
            down_time_ms,
            kind: CommandKind::Move { x, y },
            ensure_focus,
        })
    }

    pub fn touch_up(&self, display: i32, down_time_ms: u64, x: f32, y: f32, ensure_focus: bool) -> bool {
        self.enqueue(InjectionCommand {
            display,
            down_time_ms,
            kind: CommandKind::Up { x, y },
            ensure_focus,
        })
    }

    /// Hold the worker; commands keep queueing (and coalescing).
    pub fn pause(&self) {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner()).paused = true;
    }

    pub fn resume(&self) {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner()).paused = false;
        self.shared.cv.notify_all();
    }

    /// Commands not yet taken by the worker, head first.
    pub fn pending(&self) -> Vec<InjectionCommand> {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.items.iter().map(|(_, c)| *c).collect()
    }

    /// Commands the worker has submitted so far.
    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Acquire)
    }

    /// Drop pending commands and stop the worker. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            state.closed = true;
            let dropped = state.items.len();
            state.items.clear();
            if dropped > 0 {
                debug!(dropped, "pending injections discarded");
            }
        }
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if worker.join().is_err() {
                warn!("injection worker panicked");
            }
        }
        info!("injection queue stopped");
    }
}

impl Drop for InjectionQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn injection_worker(shared: Arc<QueueShared>, injector: Arc<EventInjector>) {
    loop {
        let (display, cmd) = {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if state.closed {
                    return;
                }
                if !state.paused {
                    if let Some(next) = state.items.pop_front() {
                        break next;
                    }
                }
                state = shared.cv.wait(state).unwrap_or_else(|e| e.into_inner());
            }
        };

        let event = cmd.to_event(display);
        injector.inject(&event, cmd.ensure_focus);
        shared.processed.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityClient;
    use crate::platform::ServiceRegistry;
    use crate::platform::loopback::{LoopbackConfig, LoopbackPlatform, RecordedEvent};
    use std::time::{Duration, Instant};

    fn setup() -> (Arc<LoopbackPlatform>, InjectionQueue) {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let client = Arc::new(CapabilityClient::new(
            Arc::clone(&platform) as Arc<dyn ServiceRegistry>
        ));
        let queue = InjectionQueue::start(Arc::new(EventInjector::new(client))).unwrap();
        (platform, queue)
    }

    fn wait_processed(q: &InjectionQueue, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while q.processed() < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn moves_coalesce_to_latest() {
        let (platform, q) = setup();
        q.pause();
        q.touch_move(2, 0, 10.0, 10.0, false);
        q.touch_move(2, 0, 12.0, 12.0, false);
        q.touch_move(2, 0, 15.0, 15.0, false);
        assert_eq!(q.pending().len(), 1);
        q.resume();
        wait_processed(&q, 1);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(q.processed(), 1);
        let events = platform.injected_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], RecordedEvent::Motion { action: MotionAction::Move, x: 15.0, y: 15.0, display: 2 });
    }

    #[test]
    fn discrete_commands_jump_the_queue() {
        let (_, q) = setup();
        q.pause();
        q.touch_move(2, 0, 1.0, 1.0, false);
        q.touch_down(2, 0, 2.0, 2.0, false);
        q.touch_up(2, 0, 3.0, 3.0, false);
        let kinds: Vec<_> = q.pending().into_iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::Up { x: 3.0, y: 3.0 },
                CommandKind::Down { x: 2.0, y: 2.0 },
                CommandKind::Move { x: 1.0, y: 1.0 },
            ]
        );
    }

    #[test]
    fn invalid_display_is_dropped() {
        let (platform, q) = setup();
        assert!(!q.touch_down(0, 0, 1.0, 1.0, false));
        assert!(!q.touch_down(-4, 0, 1.0, 1.0, false));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.processed(), 0);
        assert!(platform.injected_events().is_empty());
    }

    #[test]
    fn shutdown_discards_pending() {
        let (platform, q) = setup();
        q.pause();
        q.touch_down(2, 0, 1.0, 1.0, false);
        q.shutdown();
        q.shutdown();
        assert!(!q.touch_up(2, 0, 1.0, 1.0, false));
        assert!(platform.injected_events().is_empty());
    }
}
