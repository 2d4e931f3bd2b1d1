//! In-process platform.
//!
//! Exposes the four services the engine talks to (`display`, `input`,
//! `window`, `activity_task`) with the signature set of a recent platform
//! revision. Every virtual output gets a generator thread that renders
//! padded, non-black frames into whatever endpoint the output currently
//! targets. Injected events, focus asserts and task moves are recorded for
//! inspection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ArgType, CallError, MethodSignature, OutputToken, ServiceHandle, ServiceRegistry, Value};
use crate::display::config::{OutputFlags, VirtualOutputSpec};
use crate::input::event::{InputEvent, KeyAction, MotionAction};
use crate::relay::queue::{CropRect, ProducerEndpoint, ProducerFrame};
use crate::types::{DisplayId, RawFrame, align_up, uptime_ns};

const FIRST_DISPLAY_ID: i32 = 2;

/// Generated buffers are this many pixels wider than requested at most.
const PIXEL_ALIGN: usize = 32;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Services `locate` pretends not to find.
    pub hidden_services: Vec<String>,
    /// Replace the method list a service exposes.
    pub exposed_overrides: HashMap<String, Vec<MethodSignature>>,
    pub available: bool,
    pub platform_level: u32,
    /// Generated frames per second per output; 0 produces nothing.
    pub frame_rate: u32,
    /// Refuse creation requests carrying the trusted flag.
    pub deny_trusted: bool,
    /// Initial window-state text.
    pub window_state: String,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            hidden_services: Vec::new(),
            exposed_overrides: HashMap::new(),
            available: true,
            platform_level: 34,
            frame_rate: 0,
            deny_trusted: false,
            window_state: String::new(),
        }
    }
}

/// An injected event, reduced to what tests compare.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    Motion {
        action: MotionAction,
        x: f32,
        y: f32,
        display: i32,
    },
    Key {
        action: KeyAction,
        code: i32,
        display: i32,
    },
}

impl From<&InputEvent> for RecordedEvent {
    fn from(event: &InputEvent) -> Self {
        match event {
            InputEvent::Motion(m) => RecordedEvent::Motion {
                action: m.action,
                x: m.coords.x,
                y: m.coords.y,
                display: m.display.get(),
            },
            InputEvent::Key(k) => RecordedEvent::Key {
                action: k.action,
                code: k.key_code,
                display: k.display.get(),
            },
        }
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Outputs ──────────────────────────────────────────────────────

struct LiveOutput {
    display: DisplayId,
    target: Arc<Mutex<Option<ProducerEndpoint>>>,
    stop: Arc<AtomicBool>,
    generator: Option<JoinHandle<()>>,
}

impl LiveOutput {
    fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.generator.take() {
            let _ = handle.join();
        }
    }
}

/// Gradient that shifts with the frame counter; rows and columns are
/// padded past the visible area and cropped back.
fn render_frame(width: u32, height: u32, n: u64) -> ProducerFrame {
    let buf_w = align_up(width as usize, PIXEL_ALIGN) as u32;
    let stride = buf_w * 4;
    let mut buffer = RawFrame::zeroed(buf_w, height, stride);
    let shade = (n * 8 % 256) as u8;
    for y in 0..height {
        let row = &mut buffer.data[(y * stride) as usize..((y + 1) * stride) as usize];
        for x in 0..width {
            let i = (x * 4) as usize;
            row[i] = (x * 255 / width.max(1)) as u8;
            row[i + 1] = (y * 255 / height.max(1)) as u8;
            row[i + 2] = shade;
            row[i + 3] = 0xff;
        }
    }
    ProducerFrame {
        buffer,
        crop: CropRect {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        },
        rotation: crate::relay::queue::Rotation::None,
        timestamp_ns: uptime_ns(),
    }
}

fn spawn_generator(
    id: DisplayId,
    frame_rate: u32,
    target: Arc<Mutex<Option<ProducerEndpoint>>>,
    stop: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    if frame_rate == 0 {
        return None;
    }
    let period = Duration::from_secs(1) / frame_rate;
    let spawned = thread::Builder::new()
        .name(format!("loopback-frames-{id}"))
        .spawn(move || {
            let mut n = 0u64;
            while !stop.load(Ordering::Acquire) {
                let endpoint = locked(&target).clone();
                if let Some(endpoint) = endpoint.filter(ProducerEndpoint::is_valid) {
                    let (w, h) = endpoint.size();
                    if w > 0 && h > 0 {
                        if let Err(e) = endpoint.submit(render_frame(w, h, n)) {
                            debug!(display = %id, error = %e, "frame dropped");
                        }
                        n += 1;
                    }
                }
                thread::sleep(period);
            }
            debug!(display = %id, frames = n, "frame generator stopped");
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(display = %id, error = %e, "failed to spawn frame generator");
            None
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────

struct Shared {
    config: LoopbackConfig,
    available: AtomicBool,
    focused: AtomicI32,
    next_display: AtomicI32,
    window_state: Mutex<String>,
    probes: Mutex<HashMap<String, usize>>,
    events: Mutex<Vec<RecordedEvent>>,
    focus_asserts: Mutex<Vec<DisplayId>>,
    task_moves: Mutex<Vec<(i32, DisplayId)>>,
    outputs: Mutex<HashMap<OutputToken, LiveOutput>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl Shared {
    fn create_output(&self, spec: VirtualOutputSpec, token: OutputToken) -> Result<Value, CallError> {
        if self.config.deny_trusted && spec.flags.contains(OutputFlags::TRUSTED) {
            return Err(CallError::PermissionDenied(
                "trusted virtual displays require a system permission".into(),
            ));
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(CallError::BadArguments(format!(
                "invalid size {}x{}",
                spec.width, spec.height
            )));
        }
        if locked(&self.outputs).contains_key(&token) {
            return Err(CallError::Failed(format!("callback {token:?} already registered")));
        }

        let raw = self.next_display.fetch_add(1, Ordering::AcqRel);
        let id = DisplayId::new(raw)
            .ok_or_else(|| CallError::Failed(format!("display id {raw} out of range")))?;
        let target = Arc::new(Mutex::new(spec.surface.clone()));
        let stop = Arc::new(AtomicBool::new(false));
        let generator = spawn_generator(
            id,
            self.config.frame_rate,
            Arc::clone(&target),
            Arc::clone(&stop),
        );
        locked(&self.outputs).insert(
            token,
            LiveOutput {
                display: id,
                target,
                stop,
                generator,
            },
        );
        self.created.fetch_add(1, Ordering::AcqRel);
        info!(
            display = %id,
            name = %spec.name,
            size = %format!("{}x{}", spec.width, spec.height),
            flags = ?spec.flags,
            "loopback output created"
        );
        Ok(Value::Int(id.get()))
    }

    fn destroy_output(&self, token: OutputToken) -> Result<Value, CallError> {
        let removed = locked(&self.outputs).remove(&token);
        let Some(output) = removed else {
            return Err(CallError::Failed(format!("no output for {token:?}")));
        };
        let id = output.display;
        output.shutdown();
        self.destroyed.fetch_add(1, Ordering::AcqRel);
        if self.focused.load(Ordering::Acquire) == id.get() {
            self.focused.store(0, Ordering::Release);
        }
        info!(display = %id, "loopback output destroyed");
        Ok(Value::Void)
    }

    fn set_surface(&self, token: OutputToken, surface: Option<ProducerEndpoint>) -> Result<Value, CallError> {
        let outputs = locked(&self.outputs);
        let output = outputs
            .get(&token)
            .ok_or_else(|| CallError::Failed(format!("no output for {token:?}")))?;
        *locked(&output.target) = surface;
        Ok(Value::Void)
    }

    fn assert_focus(&self, raw: i32) -> Result<Value, CallError> {
        let display =
            DisplayId::new(raw).ok_or_else(|| CallError::BadArguments(format!("display {raw}")))?;
        self.focused.store(raw, Ordering::Release);
        locked(&self.focus_asserts).push(display);
        Ok(Value::Void)
    }
}

// ── Services ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Display,
    Input,
    Window,
    ActivityTask,
}

impl Kind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "display" => Some(Kind::Display),
            "input" => Some(Kind::Input),
            "window" => Some(Kind::Window),
            "activity_task" => Some(Kind::ActivityTask),
            _ => None,
        }
    }

    fn default_methods(self) -> Vec<MethodSignature> {
        use ArgType::*;
        match self {
            Kind::Display => vec![
                MethodSignature::new(
                    "createVirtualDisplay",
                    &[DisplayConfig, DisplayCallback, MediaProjection, Str],
                    Int,
                ),
                MethodSignature::new("releaseVirtualDisplay", &[DisplayCallback], Void),
                MethodSignature::new("setVirtualDisplaySurface", &[DisplayCallback, Surface], Void),
            ],
            Kind::Input => vec![
                MethodSignature::new("injectInputEvent", &[InputEvent, Int], Bool),
                MethodSignature::new("setFocusedDisplay", &[Int], Void),
                MethodSignature::new("getFocusedDisplayId", &[], Int),
            ],
            Kind::Window => vec![
                MethodSignature::new("dumpWindows", &[], Str),
                MethodSignature::new("setFocusedDisplay", &[Int], Void),
            ],
            Kind::ActivityTask => vec![MethodSignature::new(
                "moveRootTaskToDisplay",
                &[Int, Int],
                Void,
            )],
        }
    }
}

struct LoopbackService {
    name: String,
    kind: Kind,
    shared: Arc<Shared>,
}

fn arg<'a>(args: &'a [Value], i: usize, method: &MethodSignature) -> Result<&'a Value, CallError> {
    args.get(i)
        .ok_or_else(|| CallError::BadArguments(format!("{method}: missing argument {i}")))
}

fn int_arg(args: &[Value], i: usize, method: &MethodSignature) -> Result<i32, CallError> {
    arg(args, i, method)?
        .as_int()
        .ok_or_else(|| CallError::BadArguments(format!("{method}: argument {i} is not an int")))
}

fn token_arg(args: &[Value], i: usize, method: &MethodSignature) -> Result<OutputToken, CallError> {
    arg(args, i, method)?
        .as_token()
        .ok_or_else(|| CallError::BadArguments(format!("{method}: argument {i} is not a callback")))
}

impl LoopbackService {
    fn call_display(&self, method: &MethodSignature, args: &[Value]) -> Result<Value, CallError> {
        match method.name.as_str() {
            "createVirtualDisplay" => match args.first() {
                Some(Value::Config(spec)) => {
                    let token = token_arg(args, 1, method)?;
                    self.shared.create_output((**spec).clone(), token)
                }
                // Legacy positional form.
                Some(Value::Callback(token)) => {
                    let spec = legacy_spec(args, method)?;
                    self.shared.create_output(spec, *token)
                }
                _ => Err(CallError::BadArguments(format!("{method}: unexpected arguments"))),
            },
            "releaseVirtualDisplay" | "destroyVirtualDisplay" | "removeVirtualDisplay" => {
                self.shared.destroy_output(token_arg(args, 0, method)?)
            }
            "setVirtualDisplaySurface" => {
                let token = token_arg(args, 0, method)?;
                let surface = match arg(args, 1, method)? {
                    Value::Surface(s) => s.clone(),
                    Value::Null => None,
                    _ => return Err(CallError::BadArguments(format!("{method}: not a surface"))),
                };
                self.shared.set_surface(token, surface)
            }
            other => Err(CallError::Failed(format!("display.{other} not implemented"))),
        }
    }

    fn call_input(&self, method: &MethodSignature, args: &[Value]) -> Result<Value, CallError> {
        match method.name.as_str() {
            "injectInputEvent" | "injectInputEventToTarget" => {
                let Some(Value::Event(event)) = args.first() else {
                    return Err(CallError::BadArguments(format!("{method}: not an event")));
                };
                locked(&self.shared.events).push(RecordedEvent::from(event));
                Ok(Value::Bool(true))
            }
            "setFocusedDisplay" => self.shared.assert_focus(int_arg(args, 0, method)?),
            "getFocusedDisplayId" => Ok(Value::Int(self.shared.focused.load(Ordering::Acquire))),
            other => Err(CallError::Failed(format!("input.{other} not implemented"))),
        }
    }

    fn call_window(&self, method: &MethodSignature, args: &[Value]) -> Result<Value, CallError> {
        match method.name.as_str() {
            "dumpWindows" | "dump" => Ok(Value::Str(locked(&self.shared.window_state).clone())),
            "setFocusedDisplay" => self.shared.assert_focus(int_arg(args, 0, method)?),
            "getFocusedDisplayId" => Ok(Value::Int(self.shared.focused.load(Ordering::Acquire))),
            other => Err(CallError::Failed(format!("window.{other} not implemented"))),
        }
    }

    fn call_activity(&self, method: &MethodSignature, args: &[Value]) -> Result<Value, CallError> {
        match method.name.as_str() {
            "moveRootTaskToDisplay" | "moveStackToDisplay" | "moveTaskToDisplay" => {
                let task = int_arg(args, 0, method)?;
                let raw = int_arg(args, 1, method)?;
                let display = DisplayId::new(raw)
                    .ok_or_else(|| CallError::BadArguments(format!("display {raw}")))?;
                locked(&self.shared.task_moves).push((task, display));
                Ok(if method.returns == ArgType::Bool {
                    Value::Bool(true)
                } else {
                    Value::Void
                })
            }
            other => Err(CallError::Failed(format!("activity_task.{other} not implemented"))),
        }
    }
}

fn legacy_spec(args: &[Value], method: &MethodSignature) -> Result<VirtualOutputSpec, CallError> {
    let text = |i| match arg(args, i, method)? {
        Value::Str(s) => Ok(s.clone()),
        _ => Err(CallError::BadArguments(format!("{method}: argument {i} is not text"))),
    };
    let size = |i| int_arg(args, i, method).map(|v| v.max(0) as u32);
    let surface = match arg(args, 7, method)? {
        Value::Surface(s) => s.clone(),
        _ => None,
    };
    Ok(VirtualOutputSpec {
        name: text(3)?,
        width: size(4)?,
        height: size(5)?,
        dpi: size(6)?,
        refresh_rate: 0.0,
        flags: OutputFlags::from_bits_truncate(int_arg(args, 8, method)? as u32),
        unique_id: text(9)?,
        surface,
    })
}

impl ServiceHandle for LoopbackService {
    fn name(&self) -> &str {
        &self.name
    }

    fn methods(&self) -> Vec<MethodSignature> {
        *locked(&self.shared.probes).entry(self.name.clone()).or_default() += 1;
        match self.shared.config.exposed_overrides.get(&self.name) {
            Some(methods) => methods.clone(),
            None => self.kind.default_methods(),
        }
    }

    fn call(&self, method: &MethodSignature, args: &[Value]) -> Result<Value, CallError> {
        if !self.shared.available.load(Ordering::Acquire) {
            return Err(CallError::Failed("privileged channel unavailable".into()));
        }
        if !self.methods_unprobed().contains(method) {
            return Err(CallError::Failed(format!("{}.{method} is not exposed", self.name)));
        }
        match self.kind {
            Kind::Display => self.call_display(method, args),
            Kind::Input => self.call_input(method, args),
            Kind::Window => self.call_window(method, args),
            Kind::ActivityTask => self.call_activity(method, args),
        }
    }
}

impl LoopbackService {
    /// Exposed methods without counting as a probe.
    fn methods_unprobed(&self) -> Vec<MethodSignature> {
        match self.shared.config.exposed_overrides.get(&self.name) {
            Some(methods) => methods.clone(),
            None => self.kind.default_methods(),
        }
    }
}

// ── Platform ─────────────────────────────────────────────────────

pub struct LoopbackPlatform {
    shared: Arc<Shared>,
}

impl LoopbackPlatform {
    pub fn new(config: LoopbackConfig) -> Arc<Self> {
        let shared = Shared {
            available: AtomicBool::new(config.available),
            focused: AtomicI32::new(0),
            next_display: AtomicI32::new(FIRST_DISPLAY_ID),
            window_state: Mutex::new(config.window_state.clone()),
            probes: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            focus_asserts: Mutex::new(Vec::new()),
            task_moves: Mutex::new(Vec::new()),
            outputs: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            config,
        };
        Arc::new(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Release);
    }

    pub fn set_window_state(&self, text: impl Into<String>) {
        *locked(&self.shared.window_state) = text.into();
    }

    /// Move platform focus without recording an assert.
    pub fn set_focused_display(&self, raw: i32) {
        self.shared.focused.store(raw, Ordering::Release);
    }

    pub fn focused_display(&self) -> Option<DisplayId> {
        DisplayId::new(self.shared.focused.load(Ordering::Acquire))
    }

    /// How often `methods()` was listed on `service`.
    pub fn probe_count(&self, service: &str) -> usize {
        locked(&self.shared.probes).get(service).copied().unwrap_or(0)
    }

    pub fn injected_events(&self) -> Vec<RecordedEvent> {
        locked(&self.shared.events).clone()
    }

    pub fn focus_asserts(&self) -> Vec<DisplayId> {
        locked(&self.shared.focus_asserts).clone()
    }

    pub fn task_moves(&self) -> Vec<(i32, DisplayId)> {
        locked(&self.shared.task_moves).clone()
    }

    pub fn live_outputs(&self) -> usize {
        locked(&self.shared.outputs).len()
    }

    pub fn created_outputs(&self) -> usize {
        self.shared.created.load(Ordering::Acquire)
    }

    pub fn destroyed_outputs(&self) -> usize {
        self.shared.destroyed.load(Ordering::Acquire)
    }
}

impl ServiceRegistry for LoopbackPlatform {
    fn locate(&self, name: &str) -> Option<Arc<dyn ServiceHandle>> {
        if !self.is_available() || self.shared.config.hidden_services.iter().any(|s| s == name) {
            return None;
        }
        let kind = Kind::from_name(name)?;
        Some(Arc::new(LoopbackService {
            name: name.to_string(),
            kind,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::Acquire)
    }

    fn platform_level(&self) -> u32 {
        self.shared.config.platform_level
    }
}

impl Drop for LoopbackPlatform {
    fn drop(&mut self) {
        let outputs: Vec<_> = locked(&self.shared.outputs).drain().map(|(_, o)| o).collect();
        for output in outputs {
            output.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::queue::BufferQueue;

    fn spec(surface: Option<ProducerEndpoint>, flags: OutputFlags) -> VirtualOutputSpec {
        VirtualOutputSpec {
            name: "t".into(),
            width: 40,
            height: 30,
            dpi: 320,
            refresh_rate: 0.0,
            flags,
            unique_id: "t:1".into(),
            surface,
        }
    }

    fn create(platform: &LoopbackPlatform, spec: VirtualOutputSpec, token: u64) -> Result<Value, CallError> {
        let display = platform.locate("display").unwrap();
        let sig = display.methods()[0].clone();
        display.call(
            &sig,
            &[
                Value::Config(Box::new(spec)),
                Value::Callback(OutputToken(token)),
                Value::Null,
                Value::Str("pkg".into()),
            ],
        )
    }

    #[test]
    fn ids_start_at_two_and_increase() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let a = create(&platform, spec(None, OutputFlags::empty()), 1).unwrap();
        let b = create(&platform, spec(None, OutputFlags::empty()), 2).unwrap();
        assert_eq!(a.as_int(), Some(2));
        assert_eq!(b.as_int(), Some(3));
        assert_eq!(platform.live_outputs(), 2);
    }

    #[test]
    fn trusted_refusal() {
        let platform = LoopbackPlatform::new(LoopbackConfig {
            deny_trusted: true,
            ..Default::default()
        });
        let err = create(&platform, spec(None, OutputFlags::TRUSTED), 1).unwrap_err();
        assert!(matches!(err, CallError::PermissionDenied(_)));
        assert!(create(&platform, spec(None, OutputFlags::PUBLIC), 1).is_ok());
    }

    #[test]
    fn generator_fills_queue_with_padded_frames() {
        let platform = LoopbackPlatform::new(LoopbackConfig {
            frame_rate: 60,
            ..Default::default()
        });
        let queue = BufferQueue::new(40, 30);
        create(&platform, spec(Some(ProducerEndpoint::Queue(Arc::clone(&queue))), OutputFlags::empty()), 1)
            .unwrap();
        thread::sleep(Duration::from_millis(150));
        let frame = queue.acquire_latest().expect("a generated frame");
        assert_eq!(frame.buffer.width, 64);
        assert_eq!(frame.content_size(), (40, 30));
        assert!(!frame.buffer.to_bitmap().is_likely_black());
    }

    #[test]
    fn destroy_stops_generator() {
        let platform = LoopbackPlatform::new(LoopbackConfig {
            frame_rate: 60,
            ..Default::default()
        });
        let queue = BufferQueue::new(40, 30);
        create(&platform, spec(Some(ProducerEndpoint::Queue(Arc::clone(&queue))), OutputFlags::empty()), 9)
            .unwrap();
        let display = platform.locate("display").unwrap();
        let release = display.methods()[1].clone();
        display.call(&release, &[Value::Callback(OutputToken(9))]).unwrap();

        let count = queue.queued_count();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(queue.queued_count(), count);
        assert_eq!(platform.destroyed_outputs(), 1);
        assert!(display.call(&release, &[Value::Callback(OutputToken(9))]).is_err());
    }

    #[test]
    fn hidden_and_unavailable_services() {
        let platform = LoopbackPlatform::new(LoopbackConfig {
            hidden_services: vec!["window".into()],
            ..Default::default()
        });
        assert!(platform.locate("window").is_none());
        assert!(platform.locate("input").is_some());
        assert!(platform.locate("bluetooth").is_none());
        platform.set_available(false);
        assert!(platform.locate("input").is_none());
    }

    #[test]
    fn unexposed_method_is_rejected() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let window = platform.locate("window").unwrap();
        let sig = MethodSignature::new("dump", &[ArgType::StrArray], ArgType::Str);
        assert!(window.call(&sig, &[Value::StrArray(vec![])]).is_err());
    }
}
