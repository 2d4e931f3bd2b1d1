//! Owner of the single virtual output.
//!
//! All transitions run under one mutex, so at most one handle is ever
//! `Running`. Readers that only need the display id subscribe to a
//! `watch` snapshot instead of taking the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::{OutputConfig, OutputFlags, VirtualOutputSpec};
use super::state::OutputState;
use super::strategy::{DirectOutput, OutputBinding, OutputMode, OutputStrategy, RelayOutput};
use crate::capability::CapabilityClient;
use crate::error::VdError;
use crate::platform::OutputToken;
use crate::relay::gpu::GpuFactory;
use crate::relay::queue::PreviewSurface;
use crate::types::{Bitmap, DisplayId, sleep_until};

/// A live virtual output.
pub struct DisplayHandle {
    pub display: DisplayId,
    pub config: OutputConfig,
    /// Flags the platform actually accepted.
    pub flags: OutputFlags,
    pub token: OutputToken,
    strategy: Arc<dyn OutputStrategy>,
}

#[derive(Default)]
struct OutputInner {
    state: OutputState,
    handle: Option<DisplayHandle>,
}

pub struct VirtualOutput {
    client: Arc<CapabilityClient>,
    gpu: GpuFactory,
    inner: Mutex<OutputInner>,
    display_tx: watch::Sender<Option<DisplayId>>,
    next_token: AtomicU64,
}

impl VirtualOutput {
    pub fn new(client: Arc<CapabilityClient>, gpu: GpuFactory) -> Self {
        let (display_tx, _) = watch::channel(None);
        Self {
            client,
            gpu,
            inner: Mutex::new(OutputInner::default()),
            display_tx,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn client(&self) -> &Arc<CapabilityClient> {
        &self.client
    }

    fn lock(&self) -> MutexGuard<'_, OutputInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Start / stop ─────────────────────────────────────────────

    /// Return the running display's id, or start one with `config`.
    pub fn ensure_started(&self, config: &OutputConfig) -> Result<DisplayId, VdError> {
        let mut inner = self.lock();
        if let (Some(display), Some(handle)) = (inner.state.display(), inner.handle.as_ref()) {
            if handle.strategy.is_healthy() {
                return Ok(display);
            }
        }
        self.start_locked(&mut inner, config, OutputMode::Relay)
    }

    /// Tear down any existing output and start a relayed one.
    pub fn start(&self, config: &OutputConfig) -> Result<DisplayId, VdError> {
        self.start_with(config, OutputMode::Relay)
    }

    /// Tear down any existing output and start one in `mode`.
    pub fn start_with(&self, config: &OutputConfig, mode: OutputMode) -> Result<DisplayId, VdError> {
        let mut inner = self.lock();
        self.start_locked(&mut inner, config, mode)
    }

    fn start_locked(
        &self,
        inner: &mut OutputInner,
        config: &OutputConfig,
        mode: OutputMode,
    ) -> Result<DisplayId, VdError> {
        self.teardown_locked(inner);
        config.validate()?;
        inner.state.begin_start()?;

        match self.create_handle(config, mode) {
            Ok(handle) => {
                let id = handle.display;
                inner.state.complete_start(id)?;
                info!(
                    display = %id,
                    width = config.width,
                    height = config.height,
                    dpi = config.clamped_dpi(),
                    mode = handle.strategy.mode_name(),
                    flags = format_args!("{:#x}", handle.flags.bits()),
                    "virtual output running"
                );
                inner.handle = Some(handle);
                self.display_tx.send_replace(Some(id));
                Ok(id)
            }
            Err(e) => {
                inner.state.force_stop();
                warn!(error = %e, "virtual output start failed");
                Err(e)
            }
        }
    }

    fn create_handle(&self, config: &OutputConfig, mode: OutputMode) -> Result<DisplayHandle, VdError> {
        let token = OutputToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let strategy: Arc<dyn OutputStrategy> = match mode {
            OutputMode::Relay => Arc::new(RelayOutput::start(config, &self.gpu)?),
            OutputMode::Direct(surface) => Arc::new(DirectOutput::new(surface)),
        };

        let spec = config.to_spec(self.client.platform_level(), token, Some(strategy.endpoint()));
        match self.create_with_trust_fallback(&spec, token) {
            Ok((display, flags)) => Ok(DisplayHandle {
                display,
                config: config.clone(),
                flags,
                token,
                strategy,
            }),
            Err(e) => {
                strategy.release();
                Err(e)
            }
        }
    }

    /// Platforms that refuse a trusted display get one retry without it.
    fn create_with_trust_fallback(
        &self,
        spec: &VirtualOutputSpec,
        token: OutputToken,
    ) -> Result<(DisplayId, OutputFlags), VdError> {
        match self.client.create_virtual_output(spec, token) {
            Ok(display) => Ok((display, spec.flags)),
            Err(e) if e.is_permission_denied() && spec.flags.contains(OutputFlags::TRUSTED) => {
                warn!(error = %e, "trusted display refused, retrying untrusted");
                let relaxed = spec.without(OutputFlags::TRUSTED);
                let display = self.client.create_virtual_output(&relaxed, token)?;
                Ok((display, relaxed.flags))
            }
            Err(e) => Err(e),
        }
    }

    /// Release the output. No-op when already stopped; never fails.
    pub fn stop(&self) {
        let mut inner = self.lock();
        self.teardown_locked(&mut inner);
    }

    fn teardown_locked(&self, inner: &mut OutputInner) {
        if inner.state.is_stopped() && inner.handle.is_none() {
            return;
        }
        if inner.state.begin_stop().is_err() {
            inner.state = OutputState::Stopping;
        }
        self.display_tx.send_replace(None);

        if let Some(handle) = inner.handle.take() {
            handle.strategy.release();
            if let Err(e) = self.client.destroy_virtual_output(handle.token) {
                warn!(display = %handle.display, error = %e, "destroy virtual output failed");
            }
            info!(display = %handle.display, "virtual output stopped");
        }

        if inner.state.finish_stop().is_err() {
            inner.state.force_stop();
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn display_id(&self) -> Option<DisplayId> {
        *self.display_tx.borrow()
    }

    /// Snapshot channel of the current display id.
    pub fn subscribe(&self) -> watch::Receiver<Option<DisplayId>> {
        self.display_tx.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.lock().state.is_running()
    }

    pub fn state(&self) -> OutputState {
        self.lock().state.clone()
    }

    pub fn latest_frame_timestamp_ns(&self) -> Option<u64> {
        self.lock()
            .handle
            .as_ref()
            .and_then(|h| h.strategy.latest_frame_timestamp_ns())
    }

    pub fn content_size(&self) -> Option<(u32, u32)> {
        self.lock()
            .handle
            .as_ref()
            .and_then(|h| h.strategy.content_size())
    }

    pub fn config(&self) -> Option<OutputConfig> {
        self.lock().handle.as_ref().map(|h| h.config.clone())
    }

    pub fn flags(&self) -> Option<OutputFlags> {
        self.lock().handle.as_ref().map(|h| h.flags)
    }

    pub fn mode_name(&self) -> Option<&'static str> {
        self.lock().handle.as_ref().map(|h| h.strategy.mode_name())
    }

    // ── Preview / capture ────────────────────────────────────────

    /// Route live frames to `target`. The platform-side producer binding
    /// is untouched in relay mode.
    pub fn set_preview_output(&self, target: PreviewSurface) -> Result<(), VdError> {
        self.switch_preview(Some(target))
    }

    /// Detach the preview target, keeping capture available.
    pub fn restore_capture_only_output(&self) -> Result<(), VdError> {
        self.switch_preview(None)
    }

    fn switch_preview(&self, target: Option<PreviewSurface>) -> Result<(), VdError> {
        let inner = self.lock();
        let handle = inner.handle.as_ref().ok_or(VdError::NotStarted)?;
        let binding = OutputBinding {
            client: &self.client,
            token: handle.token,
        };
        handle.strategy.set_preview(&binding, target)
    }

    /// Capture one frame, waiting up to `timeout` for it. The output lock
    /// is released before waiting.
    pub fn capture_bitmap_blocking(&self, timeout: Duration) -> Result<Bitmap, VdError> {
        let strategy = self
            .lock()
            .handle
            .as_ref()
            .map(|h| Arc::clone(&h.strategy))
            .ok_or(VdError::NotStarted)?;
        strategy.capture(timeout)
    }

    /// Refresh focus, then poll captures until one is not black or
    /// `max_wait` runs out. Returns the last capture either way.
    pub fn capture_settled(&self, max_wait: Duration, poll: Duration) -> Result<Bitmap, VdError> {
        let display = self.display_id().ok_or(VdError::NotStarted)?;
        if let Err(e) = self.client.ensure_focused_display(display) {
            debug!(error = %e, "focus refresh before capture failed");
        }

        let deadline = Instant::now() + max_wait;
        let mut last: Option<Bitmap> = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = self.capture_bitmap_blocking(remaining.max(poll));
            match attempt {
                Ok(bmp) if !bmp.is_likely_black() => return Ok(bmp),
                Ok(bmp) => last = Some(bmp),
                Err(VdError::FrameCaptureTimeout(_)) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep_until(deadline, poll);
        }
        last.ok_or(VdError::FrameCaptureTimeout(max_wait))
    }

    /// Best-effort move of a task onto the running display.
    pub fn move_task_here(&self, task_id: i32) -> bool {
        match self.display_id() {
            Some(display) => self.client.move_task_to_display(task_id, display),
            None => false,
        }
    }
}

impl Drop for VirtualOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::loopback::{LoopbackConfig, LoopbackPlatform};
    use crate::platform::ServiceRegistry;
    use crate::relay::software_factory;

    fn output(cfg: LoopbackConfig) -> (Arc<LoopbackPlatform>, VirtualOutput) {
        let platform = LoopbackPlatform::new(cfg);
        let client = Arc::new(CapabilityClient::new(
            Arc::clone(&platform) as Arc<dyn ServiceRegistry>
        ));
        (platform, VirtualOutput::new(client, software_factory()))
    }

    fn small() -> OutputConfig {
        OutputConfig {
            width: 64,
            height: 48,
            ..Default::default()
        }
    }

    #[test]
    fn start_assigns_positive_id() {
        let (platform, out) = output(LoopbackConfig::default());
        let id = out.start(&small()).unwrap();
        assert!(id.get() > 0);
        assert!(out.is_started());
        assert_eq!(out.display_id(), Some(id));
        assert_eq!(platform.live_outputs(), 1);
    }

    #[test]
    fn ensure_started_is_idempotent() {
        let (platform, out) = output(LoopbackConfig::default());
        let a = out.ensure_started(&small()).unwrap();
        let b = out.ensure_started(&small()).unwrap();
        assert_eq!(a, b);
        assert_eq!(platform.created_outputs(), 1);
    }

    #[test]
    fn restart_tears_down_previous_output() {
        let (platform, out) = output(LoopbackConfig::default());
        let a = out.start(&small()).unwrap();
        let b = out.start(&small()).unwrap();
        assert_ne!(a, b);
        assert_eq!(platform.live_outputs(), 1);
        assert_eq!(platform.destroyed_outputs(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_clears_id() {
        let (platform, out) = output(LoopbackConfig::default());
        out.start(&small()).unwrap();
        out.stop();
        out.stop();
        assert!(!out.is_started());
        assert_eq!(out.display_id(), None);
        assert_eq!(platform.live_outputs(), 0);
        assert!(out.state().is_stopped());
    }

    #[test]
    fn discovery_failure_rolls_back() {
        let (_, out) = output(LoopbackConfig {
            hidden_services: vec!["display".into()],
            ..Default::default()
        });
        let err = out.start(&small()).unwrap_err();
        assert!(matches!(err, VdError::ServiceDiscovery { .. }));
        assert!(out.state().is_stopped());
        assert_eq!(out.display_id(), None);
    }

    #[test]
    fn trusted_refusal_retries_without_trusted_flag() {
        let (platform, out) = output(LoopbackConfig {
            platform_level: 34,
            deny_trusted: true,
            ..Default::default()
        });
        out.start(&small()).unwrap();
        let flags = out.flags().unwrap();
        assert!(!flags.contains(OutputFlags::TRUSTED));
        assert!(flags.contains(OutputFlags::OWN_FOCUS));
        assert_eq!(platform.created_outputs(), 1);
    }

    #[test]
    fn capture_needs_a_running_output() {
        let (_, out) = output(LoopbackConfig::default());
        assert!(matches!(
            out.capture_bitmap_blocking(Duration::from_millis(10)),
            Err(VdError::NotStarted)
        ));
        assert!(matches!(
            out.restore_capture_only_output(),
            Err(VdError::NotStarted)
        ));
    }

    #[test]
    fn pending_capture_does_not_block_readers() {
        let (_, out) = output(LoopbackConfig::default());
        let out = Arc::new(out);
        out.start(&small()).unwrap();

        let capturing = {
            let out = Arc::clone(&out);
            std::thread::spawn(move || out.capture_bitmap_blocking(Duration::from_millis(800)))
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(out.is_started());
        assert_eq!(out.latest_frame_timestamp_ns(), None);
        assert_eq!(out.content_size(), None);
        out.stop();
        assert!(started.elapsed() < Duration::from_millis(300), "{:?}", started.elapsed());

        assert!(capturing.join().unwrap().is_err());
    }

    #[test]
    fn settled_capture_returns_generated_frame() {
        let (_, out) = output(LoopbackConfig {
            frame_rate: 30,
            ..Default::default()
        });
        out.start(&small()).unwrap();
        let bmp = out
            .capture_settled(Duration::from_millis(1500), Duration::from_millis(80))
            .unwrap();
        assert_eq!((bmp.width, bmp.height), (64, 48));
        assert!(!bmp.is_likely_black());
    }
}
