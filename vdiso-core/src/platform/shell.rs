//! Privileged shell channel.
//!
//! For platforms where only a shell with elevated rights is reachable.
//! Each call is composed into a command line and executed through a
//! [`ShellRunner`]. There is no `display` service here: virtual outputs
//! cannot be created over a shell, so binding that capability fails
//! with a discovery error.

use std::process::Command;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use super::{ArgType, CallError, MethodSignature, ServiceHandle, ServiceRegistry, Value};
use crate::input::event::{InputEvent, KeyAction, MotionAction};

/// Executes one command line and returns its stdout.
pub trait ShellRunner: Send + Sync {
    fn run(&self, command: &str) -> Result<String, CallError>;
}

/// Runs commands through `<program> -c <command>`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ShellRunner for ProcessRunner {
    fn run(&self, command: &str) -> Result<String, CallError> {
        debug!(program = %self.program, command, "shell exec");
        let output = Command::new(&self.program)
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| CallError::Failed(format!("{}: {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);
        if stderr.contains("Permission denial") || stderr.contains("SecurityException") {
            return Err(CallError::PermissionDenied(stderr.trim().to_string()));
        }
        Err(CallError::Failed(format!(
            "`{command}` exited with {code}: {}",
            stderr.trim()
        )))
    }
}

// ── Command composition ──────────────────────────────────────────

fn motion_word(action: MotionAction) -> &'static str {
    match action {
        MotionAction::Down => "DOWN",
        MotionAction::Move => "MOVE",
        MotionAction::Up => "UP",
    }
}

/// Command line for `event`; `None` when the shell has nothing to send
/// (key presses fire on release).
pub fn input_command(event: &InputEvent) -> Option<String> {
    match event {
        InputEvent::Motion(m) => Some(format!(
            "input -d {} motionevent {} {} {}",
            m.display,
            motion_word(m.action),
            m.coords.x.round() as i64,
            m.coords.y.round() as i64
        )),
        InputEvent::Key(k) if k.action == KeyAction::Up => {
            Some(format!("input -d {} keyevent {}", k.display, k.key_code))
        }
        InputEvent::Key(_) => None,
    }
}

pub fn focus_command(display: i32) -> String {
    format!("wm set-focused-display {display}")
}

pub const WINDOW_DUMP_COMMAND: &str = "dumpsys window windows";

pub fn move_task_command(task_id: i32, display: i32) -> String {
    format!("am display move-stack {task_id} {display}")
}

// ── Services ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Input,
    Window,
    ActivityTask,
}

struct ShellService {
    name: &'static str,
    kind: Kind,
    runner: Arc<dyn ShellRunner>,
}

fn int_at(args: &[Value], i: usize) -> Result<i32, CallError> {
    args.get(i)
        .and_then(Value::as_int)
        .ok_or_else(|| CallError::BadArguments(format!("argument {i} is not an int")))
}

impl ServiceHandle for ShellService {
    fn name(&self) -> &str {
        self.name
    }

    fn methods(&self) -> Vec<MethodSignature> {
        use ArgType::*;
        match self.kind {
            Kind::Input => vec![
                MethodSignature::new("injectInputEvent", &[InputEvent, Int], Bool),
                MethodSignature::new("setFocusedDisplay", &[Int], Void),
            ],
            Kind::Window => vec![
                MethodSignature::new("dumpWindows", &[], Str),
                MethodSignature::new("setFocusedDisplay", &[Int], Void),
            ],
            Kind::ActivityTask => vec![MethodSignature::new("moveStackToDisplay", &[Int, Int], Void)],
        }
    }

    fn call(&self, method: &MethodSignature, args: &[Value]) -> Result<Value, CallError> {
        match (self.kind, method.name.as_str()) {
            (Kind::Input, "injectInputEvent") => {
                let Some(Value::Event(event)) = args.first() else {
                    return Err(CallError::BadArguments("not an event".into()));
                };
                if let Some(cmd) = input_command(event) {
                    self.runner.run(&cmd)?;
                }
                Ok(Value::Bool(true))
            }
            (Kind::Input | Kind::Window, "setFocusedDisplay") => {
                self.runner.run(&focus_command(int_at(args, 0)?))?;
                Ok(Value::Void)
            }
            (Kind::Window, "dumpWindows") => self.runner.run(WINDOW_DUMP_COMMAND).map(Value::Str),
            (Kind::ActivityTask, "moveStackToDisplay") => {
                self.runner
                    .run(&move_task_command(int_at(args, 0)?, int_at(args, 1)?))?;
                Ok(Value::Void)
            }
            (_, other) => Err(CallError::Failed(format!("{}.{other} is not exposed", self.name))),
        }
    }
}

// ── Platform ─────────────────────────────────────────────────────

pub struct ShellPlatform {
    runner: Arc<dyn ShellRunner>,
    level: u32,
    available: OnceLock<bool>,
}

impl ShellPlatform {
    pub fn new(program: impl Into<String>, level: u32) -> Arc<Self> {
        Self::with_runner(Arc::new(ProcessRunner::new(program)), level)
    }

    pub fn with_runner(runner: Arc<dyn ShellRunner>, level: u32) -> Arc<Self> {
        Arc::new(Self {
            runner,
            level,
            available: OnceLock::new(),
        })
    }
}

impl ServiceRegistry for ShellPlatform {
    fn locate(&self, name: &str) -> Option<Arc<dyn ServiceHandle>> {
        let (name, kind) = match name {
            "input" => ("input", Kind::Input),
            "window" => ("window", Kind::Window),
            "activity_task" => ("activity_task", Kind::ActivityTask),
            _ => return None,
        };
        if !self.is_available() {
            return None;
        }
        Some(Arc::new(ShellService {
            name,
            kind,
            runner: Arc::clone(&self.runner),
        }))
    }

    /// Checked once with a no-op command.
    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| match self.runner.run("true") {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "shell channel unavailable");
                false
            }
        })
    }

    fn platform_level(&self) -> u32 {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityClient};
    use crate::error::VdError;
    use crate::types::DisplayId;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        window_text: String,
    }

    impl ShellRunner for Recorder {
        fn run(&self, command: &str) -> Result<String, CallError> {
            self.commands.lock().unwrap().push(command.to_string());
            if command == WINDOW_DUMP_COMMAND {
                return Ok(self.window_text.clone());
            }
            Ok(String::new())
        }
    }

    fn setup() -> (Arc<Recorder>, CapabilityClient) {
        let rec = Arc::new(Recorder {
            window_text: "Window #1 Window{a InputMethod}:".into(),
            ..Default::default()
        });
        let platform = ShellPlatform::with_runner(Arc::clone(&rec) as Arc<dyn ShellRunner>, 33);
        (rec, CapabilityClient::new(platform))
    }

    #[test]
    fn composes_input_commands() {
        let d = DisplayId::new(7).unwrap();
        let down = InputEvent::touch(MotionAction::Down, 0, 10.4, 20.6, d);
        assert_eq!(
            input_command(&down).as_deref(),
            Some("input -d 7 motionevent DOWN 10 21")
        );
        assert_eq!(input_command(&InputEvent::key(KeyAction::Down, 4, 0, d)), None);
        assert_eq!(
            input_command(&InputEvent::key(KeyAction::Up, 4, 0, d)).as_deref(),
            Some("input -d 7 keyevent 4")
        );
    }

    #[test]
    fn capabilities_run_through_the_shell() {
        let (rec, client) = setup();
        let d = DisplayId::new(3).unwrap();

        client.assert_display_focus(d).unwrap();
        assert!(client.query_window_state().unwrap().contains("InputMethod"));
        assert!(client.move_task_to_display(12, d));

        let cmds = rec.commands.lock().unwrap().clone();
        assert!(cmds.contains(&"wm set-focused-display 3".to_string()));
        assert!(cmds.contains(&"am display move-stack 12 3".to_string()));
    }

    #[test]
    fn virtual_outputs_are_not_available() {
        let (_, client) = setup();
        let err = client.bind(Capability::CreateVirtualOutput).unwrap_err();
        assert!(matches!(err, VdError::ServiceDiscovery { .. }));
    }
}
