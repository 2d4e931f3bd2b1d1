//! CPU implementation of [`GpuBackend`].
//!
//! Runs the relay's fixed program on the CPU: the vertex stage is the
//! identity over the full-screen quad, the fragment stage samples the
//! external texture at `M * (s, t, 0, 1)` with nearest filtering and
//! clamp-to-edge. Offscreen surfaces pad rows to 64 bytes so read-back
//! exercises the same stride handling a hardware driver needs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tracing::debug;

use super::gpu::{GpuBackend, ProgramId, SurfaceId, TextureId};
use super::queue::PreviewSurface;
use super::transform::Mat4;
use crate::error::VdError;
use crate::types::{PixelFormat, RawFrame, align_up};

/// Row alignment of surfaces allocated by this backend.
const ROW_ALIGN: usize = 64;

/// Largest surface edge this backend accepts.
pub const DEFAULT_MAX_SURFACE: u32 = 8192;

// ── Trace ────────────────────────────────────────────────────────

/// Operations recorded when tracing is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuOp {
    Init,
    CompileProgram,
    CreateTexture,
    AttachImage,
    CreateWindowSurface(SurfaceId),
    CreateOffscreenSurface(SurfaceId),
    Draw(SurfaceId),
    SetPresentationTime(SurfaceId),
    Swap(SurfaceId),
    ReadPixels(SurfaceId),
    DestroySurface(SurfaceId),
    DeleteTexture,
    DeleteProgram,
    Terminate,
}

/// Shared log of backend operations, in call order.
#[derive(Debug, Clone, Default)]
pub struct GpuTrace(Arc<Mutex<Vec<GpuOp>>>);

impl GpuTrace {
    fn push(&self, op: GpuOp) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }

    pub fn ops(&self) -> Vec<GpuOp> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, pred: impl Fn(&GpuOp) -> bool) -> usize {
        self.ops().iter().filter(|op| pred(op)).count()
    }
}

// ── Surfaces ─────────────────────────────────────────────────────

enum SurfaceKind {
    Window(PreviewSurface),
    Offscreen,
}

struct SoftSurface {
    kind: SurfaceKind,
    back: RawFrame,
    presentation_ns: u64,
}

impl SoftSurface {
    fn new(kind: SurfaceKind, width: u32, height: u32) -> Self {
        let stride = align_up(width as usize * PixelFormat::Rgba8.bytes_per_pixel(), ROW_ALIGN);
        Self {
            kind,
            back: RawFrame::zeroed(width, height, stride as u32),
            presentation_ns: 0,
        }
    }
}

// ── SoftwareGpu ──────────────────────────────────────────────────

pub struct SoftwareGpu {
    owner: Option<ThreadId>,
    max_surface: u32,
    next_id: u32,
    programs: HashMap<ProgramId, ()>,
    textures: HashMap<TextureId, Option<RawFrame>>,
    surfaces: HashMap<SurfaceId, SoftSurface>,
    current: Option<SurfaceId>,
    trace: Option<GpuTrace>,
}

impl SoftwareGpu {
    pub fn new() -> Self {
        Self {
            owner: None,
            max_surface: DEFAULT_MAX_SURFACE,
            next_id: 1,
            programs: HashMap::new(),
            textures: HashMap::new(),
            surfaces: HashMap::new(),
            current: None,
            trace: None,
        }
    }

    /// Limit the largest surface edge; larger requests fail.
    pub fn with_max_surface(mut self, max: u32) -> Self {
        self.max_surface = max;
        self
    }

    /// Record every operation into `trace`.
    pub fn with_trace(mut self, trace: GpuTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    fn record(&self, op: GpuOp) {
        if let Some(trace) = &self.trace {
            trace.push(op);
        }
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Every call must come from the thread that created the context.
    fn check_owner(&self) -> Result<(), VdError> {
        match self.owner {
            Some(owner) if owner == thread::current().id() => Ok(()),
            Some(_) => Err(VdError::Gpu("context used from a foreign thread".into())),
            None => Err(VdError::Gpu("context not initialised".into())),
        }
    }

    fn check_size(&self, width: u32, height: u32) -> Result<(), VdError> {
        if width == 0 || height == 0 || width > self.max_surface || height > self.max_surface {
            return Err(VdError::GpuInit(format!(
                "surface {width}x{height} outside 1..={}",
                self.max_surface
            )));
        }
        Ok(())
    }
}

impl Default for SoftwareGpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Fragment stage: nearest sample with clamp-to-edge.
fn sample(image: &RawFrame, s: f32, t: f32) -> [u8; 4] {
    let x = ((s * image.width as f32).floor() as i64).clamp(0, image.width as i64 - 1) as u32;
    let y = ((t * image.height as f32).floor() as i64).clamp(0, image.height as i64 - 1) as u32;
    let p = image.pixel(x, y);
    [p[0], p[1], p[2], p[3]]
}

impl GpuBackend for SoftwareGpu {
    fn init(&mut self) -> Result<(), VdError> {
        if self.owner.is_some() {
            return Err(VdError::GpuInit("context already initialised".into()));
        }
        self.owner = Some(thread::current().id());
        self.record(GpuOp::Init);
        debug!("software gpu context created");
        Ok(())
    }

    fn compile_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramId, VdError> {
        self.check_owner()?;
        let vertex_ok = vertex.contains("aPos") && vertex.contains("vTex");
        let fragment_ok = fragment.contains("samplerExternalOES") && fragment.contains("uSTMatrix");
        if !vertex_ok || !fragment_ok {
            return Err(VdError::GpuInit("program does not match the relay stages".into()));
        }
        let id = ProgramId(self.next());
        self.programs.insert(id, ());
        self.record(GpuOp::CompileProgram);
        Ok(id)
    }

    fn create_external_texture(&mut self) -> Result<TextureId, VdError> {
        self.check_owner()?;
        let id = TextureId(self.next());
        self.textures.insert(id, None);
        self.record(GpuOp::CreateTexture);
        Ok(id)
    }

    fn attach_image(&mut self, texture: TextureId, image: RawFrame) -> Result<(), VdError> {
        self.check_owner()?;
        let slot = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| VdError::Gpu(format!("unknown texture {texture:?}")))?;
        image.validate()?;
        *slot = Some(image);
        self.record(GpuOp::AttachImage);
        Ok(())
    }

    fn create_window_surface(&mut self, target: PreviewSurface) -> Result<SurfaceId, VdError> {
        self.check_owner()?;
        let (w, h) = target.size();
        self.check_size(w, h).map_err(|e| VdError::Gpu(e.to_string()))?;
        let id = SurfaceId(self.next());
        self.surfaces
            .insert(id, SoftSurface::new(SurfaceKind::Window(target), w, h));
        self.record(GpuOp::CreateWindowSurface(id));
        Ok(id)
    }

    fn create_offscreen_surface(&mut self, width: u32, height: u32) -> Result<SurfaceId, VdError> {
        self.check_owner()?;
        self.check_size(width, height)?;
        let id = SurfaceId(self.next());
        self.surfaces
            .insert(id, SoftSurface::new(SurfaceKind::Offscreen, width, height));
        self.record(GpuOp::CreateOffscreenSurface(id));
        Ok(id)
    }

    fn surface_size(&self, surface: SurfaceId) -> Option<(u32, u32)> {
        self.surfaces
            .get(&surface)
            .map(|s| (s.back.width, s.back.height))
    }

    fn make_current(&mut self, surface: SurfaceId) -> Result<(), VdError> {
        self.check_owner()?;
        if !self.surfaces.contains_key(&surface) {
            return Err(VdError::Gpu(format!("unknown surface {surface:?}")));
        }
        self.current = Some(surface);
        Ok(())
    }

    fn draw(
        &mut self,
        program: ProgramId,
        texture: TextureId,
        transform: &Mat4,
        viewport: (u32, u32),
    ) -> Result<(), VdError> {
        self.check_owner()?;
        if !self.programs.contains_key(&program) {
            return Err(VdError::Gpu(format!("unknown program {program:?}")));
        }
        let current = self
            .current
            .ok_or_else(|| VdError::Gpu("no current surface".into()))?;
        let image = self
            .textures
            .get(&texture)
            .and_then(Option::as_ref)
            .ok_or_else(|| VdError::Gpu("external texture has no image".into()))?;
        let surface = self
            .surfaces
            .get_mut(&current)
            .ok_or_else(|| VdError::Gpu("current surface vanished".into()))?;

        let back = &mut surface.back;
        let vw = viewport.0.min(back.width);
        let vh = viewport.1.min(back.height);
        let stride = back.stride as usize;

        for y in 0..vh {
            // Quad coordinates have their origin at the bottom-left.
            let t = 1.0 - (y as f32 + 0.5) / vh as f32;
            let row = &mut back.data[y as usize * stride..(y as usize + 1) * stride];
            for x in 0..vw {
                let s = (x as f32 + 0.5) / vw as f32;
                let (u, v) = transform.apply(s, t);
                let texel = sample(image, u, v);
                let off = x as usize * 4;
                row[off..off + 4].copy_from_slice(&texel);
            }
        }
        self.record(GpuOp::Draw(current));
        Ok(())
    }

    fn set_presentation_time(&mut self, surface: SurfaceId, ns: u64) -> Result<(), VdError> {
        self.check_owner()?;
        let s = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| VdError::Gpu(format!("unknown surface {surface:?}")))?;
        s.presentation_ns = ns;
        self.record(GpuOp::SetPresentationTime(surface));
        Ok(())
    }

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<(), VdError> {
        self.check_owner()?;
        let s = self
            .surfaces
            .get(&surface)
            .ok_or_else(|| VdError::Gpu(format!("unknown surface {surface:?}")))?;
        if let SurfaceKind::Window(target) = &s.kind {
            target.present(&s.back, s.presentation_ns);
        }
        self.record(GpuOp::Swap(surface));
        Ok(())
    }

    fn read_pixels(&mut self, surface: SurfaceId) -> Result<RawFrame, VdError> {
        self.check_owner()?;
        let s = self
            .surfaces
            .get(&surface)
            .ok_or_else(|| VdError::Gpu(format!("unknown surface {surface:?}")))?;
        let mut frame = s.back.clone();
        frame.timestamp = std::time::Instant::now();
        self.record(GpuOp::ReadPixels(surface));
        Ok(frame)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        if self.surfaces.remove(&surface).is_some() {
            if self.current == Some(surface) {
                self.current = None;
            }
            self.record(GpuOp::DestroySurface(surface));
        }
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_some() {
            self.record(GpuOp::DeleteTexture);
        }
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program).is_some() {
            self.record(GpuOp::DeleteProgram);
        }
    }

    fn terminate(&mut self) {
        if self.owner.take().is_some() {
            self.surfaces.clear();
            self.textures.clear();
            self.programs.clear();
            self.current = None;
            self.record(GpuOp::Terminate);
            debug!("software gpu context terminated");
        }
    }
}
