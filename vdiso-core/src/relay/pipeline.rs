//! The frame relay: one GPU worker thread serving a live preview target
//! and an on-demand capture target from the producer's buffer queue.
//!
//! ```text
//!  producer thread ──queue()──► BufferQueue ──listener──► render_pending?
//!                                                           │ first only
//!                                                           ▼
//!  caller ──Job::Capture / Job::SetPreview──►  jobs ──► GPU worker
//!                                                      latch → draw → swap
//! ```
//!
//! The listener never touches GPU state: it bumps the frame signal and
//! posts at most one pending render job.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::gpu::{FRAGMENT_SHADER, GpuBackend, GpuFactory, ProgramId, SurfaceId, TextureId, VERTEX_SHADER};
use super::queue::{BufferQueue, PreviewSurface, ProducerEndpoint};
use super::transform::{Mat4, texture_transform};
use crate::error::VdError;
use crate::types::{Bitmap, uptime_ns};

/// Extra time allowed for the worker's capture reply.
pub const CAPTURE_REPLY_SLACK: Duration = Duration::from_millis(300);

/// Bound on preview switches, which only create or destroy a surface.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

enum Job {
    Render,
    SetPreview(Option<PreviewSurface>, Sender<Result<(), VdError>>),
    Capture(Sender<Result<Bitmap, VdError>>),
    Stop,
}

// ── Shared state ─────────────────────────────────────────────────

#[derive(Default)]
struct FrameSignal {
    /// Frames signalled by the producer.
    seq: u64,
    /// `seq` as of the last capture that consumed a fresh frame.
    captured: u64,
}

#[derive(Default)]
struct Shared {
    render_pending: AtomicBool,
    signal: Mutex<FrameSignal>,
    frame_cv: Condvar,
    latched_ns: AtomicU64,
    render_passes: AtomicU64,
}

impl Shared {
    fn signal_frame(&self) {
        let mut s = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        s.seq += 1;
        self.frame_cv.notify_all();
    }

    /// Wait until a frame newer than the last capture arrives. Returns
    /// `false` on timeout.
    fn wait_fresh_frame(&self, deadline: Instant) -> bool {
        let mut s = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if s.seq > s.captured {
                s.captured = s.seq;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .frame_cv
                .wait_timeout(s, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            s = guard;
        }
    }

    fn has_seen_frame(&self) -> bool {
        self.signal.lock().unwrap_or_else(|e| e.into_inner()).seq > 0
    }
}

// ── FramePipeline ────────────────────────────────────────────────

/// Handle to a running relay. Dropping it stops the worker.
pub struct FramePipeline {
    width: u32,
    height: u32,
    queue: Arc<BufferQueue>,
    shared: Arc<Shared>,
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FramePipeline {
    /// Spawn the GPU worker, build the context, program, external texture
    /// and capture surface, and wait up to `producer_timeout` for the
    /// producer endpoint to become valid.
    pub fn start(
        width: u32,
        height: u32,
        gpu: &GpuFactory,
        producer_timeout: Duration,
    ) -> Result<Self, VdError> {
        if width == 0 || height == 0 {
            return Err(VdError::InvalidConfig(format!("pipeline size {width}x{height}")));
        }

        let queue = BufferQueue::new(width, height);
        let shared = Arc::new(Shared::default());
        let (job_tx, job_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker = {
            let factory = Arc::clone(gpu);
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("vdiso-gpu".into())
                .spawn(move || gpu_worker(factory, width, height, queue, shared, job_rx, ready_tx))?
        };

        match ready_rx.recv_timeout(producer_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(RecvTimeoutError::Timeout) => {
                queue.abandon();
                let _ = job_tx.send(Job::Stop);
                warn!(?producer_timeout, "gpu worker did not become ready");
                return Err(VdError::ProducerTimeout(producer_timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                return Err(VdError::GpuInit("gpu worker exited during init".into()));
            }
        }

        let listener_tx = job_tx.clone();
        let weak = Arc::downgrade(&shared);
        queue.set_frame_listener(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared.signal_frame();
            if !shared.render_pending.swap(true, Ordering::AcqRel)
                && listener_tx.send(Job::Render).is_err()
            {
                shared.render_pending.store(false, Ordering::Release);
            }
        });

        info!(width, height, "frame relay started");
        Ok(Self {
            width,
            height,
            queue,
            shared,
            jobs: Mutex::new(Some(job_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Endpoint the virtual output renders into.
    pub fn producer_endpoint(&self) -> ProducerEndpoint {
        ProducerEndpoint::Queue(Arc::clone(&self.queue))
    }

    /// `false` once stopped or once the worker thread has exited.
    pub fn is_running(&self) -> bool {
        if self.jobs.lock().unwrap_or_else(|e| e.into_inner()).is_none() {
            return false;
        }
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Producer timestamp of the most recently latched frame.
    pub fn latest_frame_timestamp_ns(&self) -> Option<u64> {
        match self.shared.latched_ns.load(Ordering::Acquire) {
            0 => None,
            ns => Some(ns),
        }
    }

    /// Size captures are read back at, once a frame has been latched.
    /// Producer crop and row padding are scaled or trimmed away.
    pub fn content_size(&self) -> Option<(u32, u32)> {
        self.latest_frame_timestamp_ns().map(|_| (self.width, self.height))
    }

    /// Preview render passes executed so far.
    pub fn render_passes(&self) -> u64 {
        self.shared.render_passes.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Result<Sender<Job>, VdError> {
        let jobs = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(VdError::NotStarted)?;
        if !self.is_running() {
            return Err(VdError::Gpu("gpu worker exited".into()));
        }
        Ok(jobs)
    }

    /// Replace the preview target; `None` disables preview only.
    pub fn set_preview_surface(&self, target: Option<PreviewSurface>) -> Result<(), VdError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.sender()?.send(Job::SetPreview(target, reply_tx))?;
        match reply_rx.recv_timeout(CONTROL_TIMEOUT) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(VdError::Gpu("preview switch timed out".into())),
            Err(RecvTimeoutError::Disconnected) => Err(VdError::ChannelClosed),
        }
    }

    /// Render the newest frame into the capture surface and read it back.
    ///
    /// Waits up to `timeout` for a frame newer than the previous capture.
    /// When none arrives but an older frame was latched, that frame is
    /// rendered again; with no frame ever, fails with
    /// [`VdError::FrameCaptureTimeout`].
    pub fn capture_bitmap_blocking(&self, timeout: Duration) -> Result<Bitmap, VdError> {
        let jobs = self.sender()?;
        let deadline = Instant::now() + timeout;

        if !self.shared.wait_fresh_frame(deadline) && !self.shared.has_seen_frame() {
            debug!(?timeout, "capture timed out with no frame");
            return Err(VdError::FrameCaptureTimeout(timeout));
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        jobs.send(Job::Capture(reply_tx))?;
        let wait = deadline.saturating_duration_since(Instant::now()) + CAPTURE_REPLY_SLACK;
        match reply_rx.recv_timeout(wait) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(VdError::FrameCaptureTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(VdError::ChannelClosed),
        }
    }

    /// Stop the worker and release every GPU resource on it. Idempotent.
    pub fn stop(&self) {
        let Some(jobs) = self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        self.queue.abandon();
        let _ = jobs.send(Job::Stop);
        drop(jobs);

        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("gpu worker panicked");
            }
        }
        info!("frame relay stopped");
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Worker ───────────────────────────────────────────────────────

/// The external texture's latched state.
#[derive(Default)]
struct FrameSourceBinding {
    transform: Mat4,
    has_image: bool,
}

struct RenderContext {
    gpu: Box<dyn GpuBackend>,
    width: u32,
    height: u32,
    queue: Arc<BufferQueue>,
    program: Option<ProgramId>,
    texture: Option<TextureId>,
    capture: Option<SurfaceId>,
    preview: Option<SurfaceId>,
    binding: FrameSourceBinding,
}

fn as_init(e: VdError) -> VdError {
    match e {
        VdError::Gpu(m) => VdError::GpuInit(m),
        other => other,
    }
}

impl RenderContext {
    fn create(
        gpu: Box<dyn GpuBackend>,
        width: u32,
        height: u32,
        queue: Arc<BufferQueue>,
    ) -> Result<Self, VdError> {
        let mut ctx = Self {
            gpu,
            width,
            height,
            queue,
            program: None,
            texture: None,
            capture: None,
            preview: None,
            binding: FrameSourceBinding::default(),
        };
        if let Err(e) = ctx.init_resources() {
            ctx.release();
            return Err(as_init(e));
        }
        Ok(ctx)
    }

    fn init_resources(&mut self) -> Result<(), VdError> {
        self.gpu.init()?;
        self.program = Some(self.gpu.compile_program(VERTEX_SHADER, FRAGMENT_SHADER)?);
        self.texture = Some(self.gpu.create_external_texture()?);
        self.capture = Some(self.gpu.create_offscreen_surface(self.width, self.height)?);
        Ok(())
    }

    /// Consume the newest producer frame, if any.
    fn latch(&mut self, shared: &Shared) -> Result<(), VdError> {
        let Some(frame) = self.queue.acquire_latest() else {
            return Ok(());
        };
        let texture = self.texture.ok_or(VdError::InvalidState("no external texture"))?;
        let transform = texture_transform(&frame);
        let ts = frame.timestamp_ns.max(1);

        self.gpu.attach_image(texture, frame.buffer)?;
        self.binding = FrameSourceBinding {
            transform,
            has_image: true,
        };
        shared.latched_ns.store(ts, Ordering::Release);
        Ok(())
    }

    fn draw_into(&mut self, surface: SurfaceId, viewport: (u32, u32)) -> Result<(), VdError> {
        let program = self.program.ok_or(VdError::InvalidState("no program"))?;
        let texture = self.texture.ok_or(VdError::InvalidState("no external texture"))?;
        self.gpu.make_current(surface)?;
        self.gpu.draw(program, texture, &self.binding.transform, viewport)
    }

    fn render_preview(&mut self, shared: &Shared) -> Result<(), VdError> {
        self.latch(shared)?;
        let Some(surface) = self.preview else {
            return Ok(());
        };
        if !self.binding.has_image {
            return Ok(());
        }
        let viewport = self
            .gpu
            .surface_size(surface)
            .ok_or(VdError::InvalidState("preview surface lost"))?;
        self.draw_into(surface, viewport)?;
        self.gpu.set_presentation_time(surface, uptime_ns())?;
        self.gpu.swap_buffers(surface)?;
        shared.render_passes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_preview(&mut self, target: Option<PreviewSurface>, shared: &Shared) -> Result<(), VdError> {
        if let Some(old) = self.preview.take() {
            self.gpu.destroy_surface(old);
        }
        if let Some(target) = target {
            self.preview = Some(self.gpu.create_window_surface(target)?);
            self.render_preview(shared)?;
        }
        Ok(())
    }

    fn capture(&mut self, shared: &Shared) -> Result<Bitmap, VdError> {
        self.latch(shared)?;
        if !self.binding.has_image {
            return Err(VdError::Gpu("no producer frame latched".into()));
        }
        let surface = self.capture.ok_or(VdError::InvalidState("no capture surface"))?;
        self.draw_into(surface, (self.width, self.height))?;
        let raw = self.gpu.read_pixels(surface)?;
        Ok(raw.to_bitmap())
    }

    /// Presentation surfaces, capture surface, texture, program, context.
    fn release(&mut self) {
        if let Some(s) = self.preview.take() {
            self.gpu.destroy_surface(s);
        }
        if let Some(s) = self.capture.take() {
            self.gpu.destroy_surface(s);
        }
        if let Some(t) = self.texture.take() {
            self.gpu.delete_texture(t);
        }
        if let Some(p) = self.program.take() {
            self.gpu.delete_program(p);
        }
        self.gpu.terminate();
    }
}

fn gpu_worker(
    factory: GpuFactory,
    width: u32,
    height: u32,
    queue: Arc<BufferQueue>,
    shared: Arc<Shared>,
    jobs: Receiver<Job>,
    ready: SyncSender<Result<(), VdError>>,
) {
    let mut ctx = match RenderContext::create(factory(), width, height, queue) {
        Ok(ctx) => {
            let _ = ready.send(Ok(()));
            ctx
        }
        Err(e) => {
            warn!(error = %e, "gpu init failed");
            let _ = ready.send(Err(e));
            return;
        }
    };
    drop(ready);

    for job in jobs.iter() {
        match job {
            Job::Render => {
                shared.render_pending.store(false, Ordering::Release);
                if let Err(e) = ctx.render_preview(&shared) {
                    warn!(error = %e, "preview render failed");
                }
            }
            Job::SetPreview(target, reply) => {
                let _ = reply.send(ctx.set_preview(target, &shared));
            }
            Job::Capture(reply) => {
                let _ = reply.send(ctx.capture(&shared));
            }
            Job::Stop => break,
        }
    }

    ctx.release();
    debug!("gpu worker exiting");
}
