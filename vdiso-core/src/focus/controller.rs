//! Monitor loop and force-lock sub-loop.
//!
//! Both loops are tokio tasks cancelled through a `CancellationToken`.
//! Platform calls run on the blocking pool and are never abandoned
//! mid-flight: a loop only observes cancellation between calls, and
//! `stop()` awaits both tasks, so no focus assert is issued once it
//! returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::FocusHazardState;
use super::window_state::{ImeSample, parse_ime_state};
use crate::capability::CapabilityClient;
use crate::throttle::LogThrottle;
use crate::types::DisplayId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusConfig {
    /// Window-state sampling interval; doubled while idle.
    pub poll_interval: Duration,
    /// Focus reassertion interval while locked.
    pub force_interval: Duration,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(220),
            force_interval: Duration::from_millis(90),
        }
    }
}

/// Edge notification sent on every `Clear ⇄ Locked` change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusTransition {
    pub locked: bool,
    pub display: Option<DisplayId>,
    pub detail: String,
}

struct Running {
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

/// Shared between the controller handle and its tasks.
struct Ctx {
    client: Arc<CapabilityClient>,
    display: watch::Receiver<Option<DisplayId>>,
    config: FocusConfig,
    state_tx: watch::Sender<FocusHazardState>,
    events_tx: broadcast::Sender<FocusTransition>,
    asserts: AtomicU64,
}

pub struct FocusController {
    ctx: Arc<Ctx>,
    running: Mutex<Option<Running>>,
}

impl FocusController {
    pub fn new(
        client: Arc<CapabilityClient>,
        display: watch::Receiver<Option<DisplayId>>,
        config: FocusConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(FocusHazardState::Clear);
        let (events_tx, _) = broadcast::channel(16);
        Self {
            ctx: Arc::new(Ctx {
                client,
                display,
                config,
                state_tx,
                events_tx,
                asserts: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the monitor loop. No-op when already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor_loop(Arc::clone(&self.ctx), cancel.clone()));
        *running = Some(Running { cancel, monitor });
        info!(
            poll_ms = self.ctx.config.poll_interval.as_millis() as u64,
            force_ms = self.ctx.config.force_interval.as_millis() as u64,
            "focus controller started"
        );
    }

    /// Cancel both loops and wait for them; leaves the state `Clear`.
    pub async fn stop(&self) {
        let Some(run) = self.running.lock().await.take() else {
            return;
        };
        run.cancel.cancel();
        if let Err(e) = run.monitor.await {
            warn!(error = %e, "focus monitor task failed");
        }
        // The monitor clears the state on exit; a panicked monitor does not.
        let locked = self.ctx.state_tx.borrow().is_locked();
        if locked {
            set_clear(&self.ctx, None, "stopped".into());
        }
        info!("focus controller stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn state(&self) -> FocusHazardState {
        self.ctx.state_tx.borrow().clone()
    }

    /// Current hazard state, for gating focus corrections elsewhere.
    pub fn subscribe(&self) -> watch::Receiver<FocusHazardState> {
        self.ctx.state_tx.subscribe()
    }

    /// Edge notifications.
    pub fn transitions(&self) -> broadcast::Receiver<FocusTransition> {
        self.ctx.events_tx.subscribe()
    }

    /// Force-lock asserts issued so far.
    pub fn force_asserts(&self) -> u64 {
        self.ctx.asserts.load(Ordering::Acquire)
    }
}

// ── Loops ────────────────────────────────────────────────────────

struct ForceLock {
    display: DisplayId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ForceLock {
    /// Cancel and wait until the in-flight assert (if any) is done.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "force-lock task failed");
        }
        info!(display = %self.display, "force-lock stopped");
    }
}

fn set_clear(ctx: &Ctx, display: Option<DisplayId>, detail: String) {
    ctx.state_tx.send_replace(FocusHazardState::Clear);
    let _ = ctx.events_tx.send(FocusTransition {
        locked: false,
        display,
        detail,
    });
}

fn set_locked(ctx: &Ctx, display: DisplayId, detail: String) {
    ctx.state_tx.send_replace(FocusHazardState::Locked {
        display,
        reason: detail.clone(),
    });
    let _ = ctx.events_tx.send(FocusTransition {
        locked: true,
        display: Some(display),
        detail,
    });
}

async fn sample(ctx: &Ctx, display: Option<DisplayId>, available: bool) -> ImeSample {
    let Some(display) = display.filter(|_| available) else {
        return ImeSample {
            active: false,
            detail: format!("display={display:?} available={available}"),
        };
    };
    let client = Arc::clone(&ctx.client);
    match tokio::task::spawn_blocking(move || client.query_window_state()).await {
        Ok(Ok(text)) => parse_ime_state(&text, display),
        Ok(Err(e)) => ImeSample {
            active: false,
            detail: format!("window state unavailable: {e}"),
        },
        Err(e) => ImeSample {
            active: false,
            detail: format!("window state query aborted: {e}"),
        },
    }
}

async fn monitor_loop(ctx: Arc<Ctx>, cancel: CancellationToken) {
    let ticks = LogThrottle::new(Duration::from_millis(1500));
    let mut force: Option<ForceLock> = None;

    while !cancel.is_cancelled() {
        let display = *ctx.display.borrow();
        let available = ctx.client.is_available();
        let s = sample(&ctx, display, available).await;
        let locked_on = ctx.state_tx.borrow().locked_display();

        match (s.active, display, locked_on) {
            (true, Some(d), current) if current != Some(d) => {
                if let Some(old) = force.take() {
                    old.stop().await;
                }
                info!(display = %d, detail = %s.detail, "keyboard on virtual display, locking focus");
                set_locked(&ctx, d, s.detail.clone());
                force = Some(spawn_force_lock(Arc::clone(&ctx), d, cancel.child_token()));
            }
            (false, _, Some(old)) => {
                if let Some(f) = force.take() {
                    f.stop().await;
                }
                info!(display = %old, detail = %s.detail, "keyboard gone, releasing focus lock");
                set_clear(&ctx, Some(old), s.detail.clone());
            }
            _ => {}
        }

        if ticks.allow().is_some() {
            let target = display.map(DisplayId::get);
            debug!(
                display = ?target,
                locked = locked_on.is_some() || s.active,
                active = s.active,
                "focus monitor tick"
            );
        }

        let interval = if display.is_none() || !available {
            ctx.config.poll_interval * 2
        } else {
            ctx.config.poll_interval
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    if let Some(f) = force.take() {
        f.stop().await;
    }
    let locked_on = ctx.state_tx.borrow().locked_display();
    if let Some(d) = locked_on {
        set_clear(&ctx, Some(d), "stopped".into());
    }
}

fn spawn_force_lock(ctx: Arc<Ctx>, display: DisplayId, cancel: CancellationToken) -> ForceLock {
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let progress = LogThrottle::new(Duration::from_millis(800));
        let mut n: u64 = 0;
        while !token.is_cancelled() {
            let client = Arc::clone(&ctx.client);
            let result = tokio::task::spawn_blocking(move || client.assert_display_focus(display)).await;
            n += 1;
            ctx.asserts.fetch_add(1, Ordering::AcqRel);

            if progress.allow().is_some() {
                let id = display;
                match result {
                    Ok(Ok(())) => info!(display = %id, n, "force-lock"),
                    Ok(Err(e)) => warn!(display = %id, n, error = %e, "force-lock assert failed"),
                    Err(e) => warn!(display = %id, n, error = %e, "force-lock assert aborted"),
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(ctx.config.force_interval) => {}
            }
        }
    });
    ForceLock {
        display,
        cancel,
        handle,
    }
}
