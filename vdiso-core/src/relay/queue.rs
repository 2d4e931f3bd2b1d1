//! Producer side of the relay: the buffer queue the virtual output writes
//! into, and the endpoint handle passed to the platform.
//!
//! The queue keeps only the most recent frame. Producers may run on any
//! thread; a queued frame fires the frame-available listener on that same
//! thread, and the consumer latches lazily.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::VdError;
use crate::types::RawFrame;

// ── Frame metadata ───────────────────────────────────────────────

/// Clockwise rotation the consumer applies to show the buffer upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Rot90,
    Rot180,
    Rot270,
}

impl Rotation {
    /// Whether the rotation swaps width and height.
    pub fn is_transposed(self) -> bool {
        matches!(self, Rotation::Rot90 | Rotation::Rot270)
    }
}

/// Valid region of a buffer, in pixels, top-left origin. `right` and
/// `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Clamp to the buffer bounds; an empty result falls back to the whole
    /// buffer.
    pub fn clamped(self, width: u32, height: u32) -> Self {
        let c = Self {
            left: self.left.min(width),
            top: self.top.min(height),
            right: self.right.min(width),
            bottom: self.bottom.min(height),
        };
        if c.width() == 0 || c.height() == 0 {
            Self::full(width, height)
        } else {
            c
        }
    }
}

/// One buffer queued by the producer.
#[derive(Debug, Clone)]
pub struct ProducerFrame {
    pub buffer: RawFrame,
    pub crop: CropRect,
    pub rotation: Rotation,
    /// Producer timestamp on the uptime clock.
    pub timestamp_ns: u64,
}

impl ProducerFrame {
    /// A frame whose whole buffer is valid and upright.
    pub fn upright(buffer: RawFrame, timestamp_ns: u64) -> Self {
        let crop = CropRect::full(buffer.width, buffer.height);
        Self {
            buffer,
            crop,
            rotation: Rotation::None,
            timestamp_ns,
        }
    }

    /// Displayed size after crop and rotation; padding never counts.
    pub fn content_size(&self) -> (u32, u32) {
        let crop = self.crop.clamped(self.buffer.width, self.buffer.height);
        if self.rotation.is_transposed() {
            (crop.height(), crop.width())
        } else {
            (crop.width(), crop.height())
        }
    }
}

// ── BufferQueue ──────────────────────────────────────────────────

type FrameListener = Arc<dyn Fn() + Send + Sync>;

/// Single-slot buffer queue between the virtual output and the relay.
pub struct BufferQueue {
    default_size: (u32, u32),
    pending: Mutex<Option<ProducerFrame>>,
    listener: Mutex<Option<FrameListener>>,
    abandoned: AtomicBool,
    queued: AtomicU64,
}

impl BufferQueue {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            default_size: (width, height),
            pending: Mutex::new(None),
            listener: Mutex::new(None),
            abandoned: AtomicBool::new(false),
            queued: AtomicU64::new(0),
        })
    }

    /// Buffer size producers are asked to render at.
    pub fn default_size(&self) -> (u32, u32) {
        self.default_size
    }

    /// Install the frame-available callback. It runs on the producer
    /// thread and must not block.
    pub fn set_frame_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(listener));
    }

    pub fn clear_frame_listener(&self) {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Producer side: replace the pending frame and signal availability.
    pub fn queue(&self, frame: ProducerFrame) -> Result<(), VdError> {
        if self.is_abandoned() {
            return Err(VdError::InvalidState("buffer queue abandoned"));
        }
        frame.buffer.validate()?;
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
        self.queued.fetch_add(1, Ordering::Relaxed);

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener();
        }
        Ok(())
    }

    /// Consumer side: take the newest frame, if one arrived since the
    /// last latch.
    pub fn acquire_latest(&self) -> Option<ProducerFrame> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Reject further frames. Idempotent.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        self.clear_frame_listener();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Total frames ever queued.
    pub fn queued_count(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferQueue")
            .field("default_size", &self.default_size)
            .field("queued", &self.queued_count())
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

// ── PreviewSurface ───────────────────────────────────────────────

/// A caller-owned presentation target (an on-screen view, a recorder).
pub trait PreviewSink: Send + Sync {
    /// Current size of the target in pixels.
    fn size(&self) -> (u32, u32);

    /// Receive one presented buffer.
    fn present(&self, frame: &RawFrame, presentation_ns: u64);
}

/// Shared handle to a [`PreviewSink`].
#[derive(Clone)]
pub struct PreviewSurface(Arc<dyn PreviewSink>);

impl PreviewSurface {
    pub fn new(sink: Arc<dyn PreviewSink>) -> Self {
        Self(sink)
    }

    pub fn size(&self) -> (u32, u32) {
        self.0.size()
    }

    pub fn present(&self, frame: &RawFrame, presentation_ns: u64) {
        self.0.present(frame, presentation_ns);
    }

    /// Whether both handles refer to the same sink.
    pub fn same_target(&self, other: &PreviewSurface) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PreviewSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PreviewSurface").field(&self.size()).finish()
    }
}

// ── ProducerEndpoint ─────────────────────────────────────────────

/// What the platform renders the virtual output into.
#[derive(Debug, Clone)]
pub enum ProducerEndpoint {
    /// Relay mode: frames go through the GPU pipeline.
    Queue(Arc<BufferQueue>),
    /// Direct mode: frames land on the caller's surface untouched.
    Direct(PreviewSurface),
}

impl ProducerEndpoint {
    /// Producer side: deliver one frame.
    pub fn submit(&self, frame: ProducerFrame) -> Result<(), VdError> {
        match self {
            ProducerEndpoint::Queue(queue) => queue.queue(frame),
            ProducerEndpoint::Direct(surface) => {
                frame.buffer.validate()?;
                surface.present(&frame.buffer, frame.timestamp_ns);
                Ok(())
            }
        }
    }

    /// Size the producer should render at.
    pub fn size(&self) -> (u32, u32) {
        match self {
            ProducerEndpoint::Queue(queue) => queue.default_size(),
            ProducerEndpoint::Direct(surface) => surface.size(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            ProducerEndpoint::Queue(queue) => !queue.is_abandoned(),
            ProducerEndpoint::Direct(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn frame(w: u32, h: u32, ts: u64) -> ProducerFrame {
        ProducerFrame::upright(RawFrame::zeroed(w, h, w * 4), ts)
    }

    #[test]
    fn queue_keeps_only_latest() {
        let q = BufferQueue::new(4, 4);
        q.queue(frame(4, 4, 1)).unwrap();
        q.queue(frame(4, 4, 2)).unwrap();
        assert_eq!(q.acquire_latest().map(|f| f.timestamp_ns), Some(2));
        assert!(q.acquire_latest().is_none());
        assert_eq!(q.queued_count(), 2);
    }

    #[test]
    fn listener_fires_per_frame() {
        let q = BufferQueue::new(4, 4);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        q.set_frame_listener(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        q.queue(frame(4, 4, 1)).unwrap();
        q.queue(frame(4, 4, 2)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let q = BufferQueue::new(16, 16);
        let short_stride = ProducerFrame::upright(RawFrame::zeroed(16, 16, 8), 1);
        assert!(matches!(q.queue(short_stride), Err(VdError::InvalidFrame(_))));
        assert!(q.queue(frame(0, 4, 2)).is_err());

        let mut truncated = frame(4, 4, 3);
        truncated.buffer.data.truncate(10);
        assert!(q.queue(truncated).is_err());

        assert!(q.acquire_latest().is_none());
        assert_eq!(q.queued_count(), 0);
    }

    #[test]
    fn abandoned_queue_rejects_frames() {
        let q = BufferQueue::new(4, 4);
        q.abandon();
        q.abandon();
        assert!(q.queue(frame(4, 4, 1)).is_err());
        assert!(!ProducerEndpoint::Queue(q).is_valid());
    }

    #[test]
    fn content_size_ignores_padding_and_follows_rotation() {
        let mut f = ProducerFrame::upright(RawFrame::zeroed(6, 4, 64), 0);
        assert_eq!(f.content_size(), (6, 4));
        f.crop = CropRect {
            left: 1,
            top: 0,
            right: 5,
            bottom: 4,
        };
        assert_eq!(f.content_size(), (4, 4));
        f.crop = CropRect::full(6, 4);
        f.rotation = Rotation::Rot90;
        assert_eq!(f.content_size(), (4, 6));
    }
}
