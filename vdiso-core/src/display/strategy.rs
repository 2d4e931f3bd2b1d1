//! Output-mode strategies chosen at start time.
//!
//! [`RelayOutput`] renders through the GPU relay and can both preview and
//! capture. [`DirectOutput`] hands the caller's surface straight to the
//! platform; preview switches re-target the virtual output itself and
//! capture is not available.

use std::sync::Mutex;
use std::time::Duration;

use crate::capability::CapabilityClient;
use crate::display::config::OutputConfig;
use crate::error::VdError;
use crate::platform::OutputToken;
use crate::relay::gpu::GpuFactory;
use crate::relay::pipeline::FramePipeline;
use crate::relay::queue::{PreviewSurface, ProducerEndpoint};
use crate::types::Bitmap;

/// How the virtual output's frames reach the caller.
#[derive(Debug, Clone)]
pub enum OutputMode {
    /// Through the GPU relay (preview + capture).
    Relay,
    /// Straight into a caller-provided surface.
    Direct(PreviewSurface),
}

/// Binding between a running virtual output and the platform.
pub struct OutputBinding<'a> {
    pub client: &'a CapabilityClient,
    pub token: OutputToken,
}

pub trait OutputStrategy: Send + Sync {
    fn mode_name(&self) -> &'static str;

    /// Endpoint passed to the platform on creation.
    fn endpoint(&self) -> ProducerEndpoint;

    /// Whether the strategy can still serve frames.
    fn is_healthy(&self) -> bool;

    /// Attach a preview target, or detach it with `None`.
    fn set_preview(
        &self,
        binding: &OutputBinding<'_>,
        target: Option<PreviewSurface>,
    ) -> Result<(), VdError>;

    fn capture(&self, timeout: Duration) -> Result<Bitmap, VdError>;

    fn latest_frame_timestamp_ns(&self) -> Option<u64>;

    fn content_size(&self) -> Option<(u32, u32)>;

    /// Release every resource. Idempotent, never fails.
    fn release(&self);
}

// ── RelayOutput ──────────────────────────────────────────────────

pub struct RelayOutput {
    pipeline: FramePipeline,
}

impl RelayOutput {
    pub fn start(config: &OutputConfig, gpu: &GpuFactory) -> Result<Self, VdError> {
        let pipeline =
            FramePipeline::start(config.width, config.height, gpu, config.producer_timeout)?;
        Ok(Self { pipeline })
    }
}

impl OutputStrategy for RelayOutput {
    fn mode_name(&self) -> &'static str {
        "relay"
    }

    fn endpoint(&self) -> ProducerEndpoint {
        self.pipeline.producer_endpoint()
    }

    fn is_healthy(&self) -> bool {
        self.pipeline.is_running()
    }

    fn set_preview(
        &self,
        _binding: &OutputBinding<'_>,
        target: Option<PreviewSurface>,
    ) -> Result<(), VdError> {
        self.pipeline.set_preview_surface(target)
    }

    fn capture(&self, timeout: Duration) -> Result<Bitmap, VdError> {
        self.pipeline.capture_bitmap_blocking(timeout)
    }

    fn latest_frame_timestamp_ns(&self) -> Option<u64> {
        self.pipeline.latest_frame_timestamp_ns()
    }

    fn content_size(&self) -> Option<(u32, u32)> {
        self.pipeline.content_size()
    }

    fn release(&self) {
        self.pipeline.stop();
    }
}

// ── DirectOutput ─────────────────────────────────────────────────

pub struct DirectOutput {
    surface: Mutex<Option<PreviewSurface>>,
    initial: PreviewSurface,
}

impl DirectOutput {
    pub fn new(surface: PreviewSurface) -> Self {
        Self {
            surface: Mutex::new(Some(surface.clone())),
            initial: surface,
        }
    }

    fn current(&self) -> Option<PreviewSurface> {
        self.surface.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl OutputStrategy for DirectOutput {
    fn mode_name(&self) -> &'static str {
        "direct"
    }

    fn endpoint(&self) -> ProducerEndpoint {
        ProducerEndpoint::Direct(self.current().unwrap_or_else(|| self.initial.clone()))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn set_preview(
        &self,
        binding: &OutputBinding<'_>,
        target: Option<PreviewSurface>,
    ) -> Result<(), VdError> {
        let endpoint = target.clone().map(ProducerEndpoint::Direct);
        binding
            .client
            .set_output_surface(binding.token, endpoint.as_ref())?;
        *self.surface.lock().unwrap_or_else(|e| e.into_inner()) = target;
        Ok(())
    }

    fn capture(&self, _timeout: Duration) -> Result<Bitmap, VdError> {
        Err(VdError::Unsupported("capture in direct output mode"))
    }

    fn latest_frame_timestamp_ns(&self) -> Option<u64> {
        None
    }

    fn content_size(&self) -> Option<(u32, u32)> {
        self.current().map(|s| s.size())
    }

    fn release(&self) {
        self.surface.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
