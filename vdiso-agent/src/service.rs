//! Agent service core logic.
//!
//! Wires the platform backend, the virtual display, the injection queue
//! and the focus controller together and keeps them alive until stopped.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use vdiso_core::platform::loopback::LoopbackConfig;
use vdiso_core::{
    CapabilityClient, DisplayId, EventInjector, FocusController, Gestures, InjectionQueue,
    LoopbackPlatform, ServiceRegistry, ShellPlatform, VdError, VirtualOutput, software_factory,
};

use crate::config::{AgentConfig, Backend};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Build the configured platform backend.
pub fn build_registry(config: &AgentConfig) -> Arc<dyn ServiceRegistry> {
    let p = &config.platform;
    match p.backend {
        Backend::Loopback => LoopbackPlatform::new(LoopbackConfig {
            frame_rate: p.loopback_frame_rate,
            platform_level: p.loopback_platform_level,
            ..Default::default()
        }) as Arc<dyn ServiceRegistry>,
        Backend::Shell => ShellPlatform::new(p.shell_program.clone(), p.shell_platform_level)
            as Arc<dyn ServiceRegistry>,
    }
}

// ── AgentService ─────────────────────────────────────────────────

/// Input entry points of a running agent.
#[derive(Clone)]
pub struct AgentInput {
    /// Asynchronous touch stream with move coalescing.
    pub queue: Arc<InjectionQueue>,
    /// Ordered, blocking taps, swipes and keys.
    pub gestures: Arc<Gestures>,
}

/// The top-level agent service.
pub struct AgentService {
    config: AgentConfig,
    registry: Arc<dyn ServiceRegistry>,
    running: Arc<AtomicBool>,
    input: Mutex<Option<AgentInput>>,
}

impl AgentService {
    pub fn new(config: AgentConfig) -> Self {
        let registry = build_registry(&config);
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: AgentConfig, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            config,
            registry,
            running: Arc::new(AtomicBool::new(false)),
            input: Mutex::new(None),
        }
    }

    /// Handle for stopping the service from another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Input handles while `run` is active.
    pub fn input(&self) -> Option<AgentInput> {
        self.input.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn client(&self) -> Arc<CapabilityClient> {
        Arc::new(CapabilityClient::new(Arc::clone(&self.registry)))
    }

    /// Run until stopped.
    ///
    /// 1. Starts the virtual display.
    /// 2. Starts the injection queue and, when enabled, focus arbitration.
    /// 3. Logs status periodically.
    /// 4. Tears everything down in reverse order.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.running.store(true, Ordering::SeqCst);
        let client = self.client();

        let output = Arc::new(VirtualOutput::new(Arc::clone(&client), software_factory()));
        let id = match start_output(&output, &self.config).await {
            Ok(id) => id,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        info!(display = %id, mode = ?output.mode_name(), "virtual display running");

        let focus = self.config.focus.enabled.then(|| {
            FocusController::new(
                Arc::clone(&client),
                output.subscribe(),
                self.config.to_focus_config(),
            )
        });
        let mut injector =
            EventInjector::new(Arc::clone(&client)).with_focus_interval(self.config.focus_interval());
        if let Some(fc) = &focus {
            fc.start().await;
            injector = injector.with_hazard_state(fc.subscribe());
        }
        let injector = Arc::new(injector);
        let queue = Arc::new(InjectionQueue::start(Arc::clone(&injector))?);
        let gestures = Arc::new(Gestures::new(injector, output.subscribe()));
        *self.input.lock().unwrap_or_else(|e| e.into_inner()) = Some(AgentInput {
            queue: Arc::clone(&queue),
            gestures,
        });

        while self.is_running() {
            tokio::select! {
                _ = Self::wait_for_stop(&self.running) => break,
                _ = tokio::time::sleep(STATUS_INTERVAL) => {}
            }
            info!(
                display = ?output.display_id().map(DisplayId::get),
                state = ?output.state(),
                hazard = %focus.as_ref().map(|f| f.state().to_string()).unwrap_or_else(|| "disabled".into()),
                injected = queue.processed(),
                last_frame_ns = ?output.latest_frame_timestamp_ns(),
                "status"
            );
        }

        self.input.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(fc) = &focus {
            fc.stop().await;
        }
        queue.shutdown();
        stop_output(output).await;

        self.running.store(false, Ordering::SeqCst);
        info!("agent stopped");
        Ok(())
    }

    /// Start the display, write one settled capture as raw RGBA to `path`
    /// and stop again.
    pub async fn capture_once(&self, path: &Path) -> Result<(u32, u32), BoxError> {
        let output = Arc::new(VirtualOutput::new(self.client(), software_factory()));
        start_output(&output, &self.config).await?;

        let (wait, poll) = (self.config.settle_wait(), self.config.settle_poll());
        let capture = {
            let output = Arc::clone(&output);
            tokio::task::spawn_blocking(move || output.capture_settled(wait, poll)).await?
        };
        stop_output(output).await;

        let bmp = capture?;
        tokio::fs::write(path, &bmp.pixels).await?;
        info!(
            path = %path.display(),
            width = bmp.width,
            height = bmp.height,
            black = bmp.is_likely_black(),
            "capture written"
        );
        Ok((bmp.width, bmp.height))
    }

    /// Run only focus arbitration against an existing display.
    pub async fn guard_only(&self, id: DisplayId) -> Result<(), BoxError> {
        self.running.store(true, Ordering::SeqCst);
        let (_display_tx, display_rx) = watch::channel(Some(id));
        let fc = FocusController::new(self.client(), display_rx, self.config.to_focus_config());
        fc.start().await;
        info!(display = %id, "guarding focus on existing display");

        let mut transitions = fc.transitions();
        loop {
            tokio::select! {
                _ = Self::wait_for_stop(&self.running) => break,
                event = transitions.recv() => match event {
                    Ok(t) => info!(locked = t.locked, detail = %t.detail, "focus transition"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "focus transitions lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        fc.stop().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Blocking lifecycle helpers ───────────────────────────────────

async fn start_output(output: &Arc<VirtualOutput>, config: &AgentConfig) -> Result<DisplayId, VdError> {
    let out_cfg = config.to_output_config();
    let output = Arc::clone(output);
    match tokio::task::spawn_blocking(move || output.ensure_started(&out_cfg)).await {
        Ok(result) => result.inspect_err(|e| error!("failed to start virtual display: {e}")),
        Err(e) => Err(VdError::Other(format!("start task failed: {e}"))),
    }
}

async fn stop_output(output: Arc<VirtualOutput>) {
    if let Err(e) = tokio::task::spawn_blocking(move || output.stop()).await {
        warn!("stop task failed: {e}");
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.display.width = 48;
        cfg.display.height = 32;
        cfg.platform.loopback_frame_rate = 60;
        cfg
    }

    #[test]
    fn service_creates_with_defaults() {
        let svc = AgentService::new(AgentConfig::default());
        assert!(!svc.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_until_stopped() {
        let svc = Arc::new(AgentService::new(small()));
        let handle = svc.stop_handle();
        let task = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.run().await.map_err(|e| e.to_string()) }
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.load(Ordering::SeqCst));
        svc.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!svc.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn running_agent_accepts_input() {
        use vdiso_core::platform::loopback::{LoopbackConfig, RecordedEvent};

        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let mut cfg = small();
        cfg.focus.enabled = false;
        let svc = Arc::new(AgentService::with_registry(
            cfg,
            Arc::clone(&platform) as Arc<dyn ServiceRegistry>,
        ));
        assert!(svc.input().is_none());

        let task = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.run().await.map_err(|e| e.to_string()) }
        });
        let input = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Some(input) = svc.input() {
                    return input;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let gestures = Arc::clone(&input.gestures);
        tokio::task::spawn_blocking(move || gestures.tap(5.0, 6.0))
            .await
            .unwrap()
            .unwrap();
        let RecordedEvent::Motion { display, .. } = platform.injected_events()[0] else {
            panic!("tap did not record a motion event");
        };
        assert!(input.queue.touch_move(display, 0, 7.0, 8.0, false));
        tokio::time::timeout(Duration::from_secs(2), async {
            while input.queue.processed() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let events = platform.injected_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], RecordedEvent::Motion { x, .. } if x == 7.0));

        svc.stop();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert!(svc.input().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capture_once_writes_rgba() {
        let svc = AgentService::new(small());
        let path = std::env::temp_dir().join(format!("vdiso-capture-{}.rgba", std::process::id()));
        let (w, h) = svc.capture_once(&path).await.unwrap();
        assert_eq!((w, h), (48, 32));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 48 * 32 * 4);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn shell_backend_cannot_create_displays() {
        let mut cfg = small();
        cfg.platform.backend = Backend::Shell;
        cfg.platform.shell_program = "/nonexistent/shell".into();
        let svc = AgentService::new(cfg);
        assert!(svc.run().await.is_err());
    }
}
