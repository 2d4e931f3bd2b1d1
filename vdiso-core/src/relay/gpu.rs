//! GPU backend seam for the frame relay.
//!
//! The pipeline drives a backend from exactly one worker thread. Backends
//! mirror a minimal GLES-style surface: one context, one fixed program,
//! one external texture, a set of window / offscreen surfaces, draw,
//! presentation time, swap and read-back.

use std::sync::Arc;

use super::queue::PreviewSurface;
use super::transform::Mat4;
use crate::error::VdError;
use crate::types::RawFrame;

/// Pass-through vertex stage for a full-screen quad.
pub const VERTEX_SHADER: &str = "\
attribute vec4 aPos;
attribute vec2 aTex;
varying vec2 vTex;
void main() {
    gl_Position = aPos;
    vTex = aTex;
}
";

/// Samples the external texture through the supplied transform.
pub const FRAGMENT_SHADER: &str = "\
#extension GL_OES_EGL_image_external : require
precision mediump float;
uniform samplerExternalOES uTex;
uniform mat4 uSTMatrix;
varying vec2 vTex;
void main() {
    vec2 t = (uSTMatrix * vec4(vTex, 0.0, 1.0)).xy;
    gl_FragColor = texture2D(uTex, t);
}
";

/// Triangle strip: `x, y, s, t` per vertex, covering the whole viewport.
pub const QUAD_VERTICES: [[f32; 4]; 4] = [
    [-1.0, -1.0, 0.0, 0.0],
    [1.0, -1.0, 1.0, 0.0],
    [-1.0, 1.0, 0.0, 1.0],
    [1.0, 1.0, 1.0, 1.0],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

/// A rendering context owned by one thread.
///
/// Every method is called from the pipeline's GPU worker only.
pub trait GpuBackend: Send {
    /// Create the context. Called once, first.
    fn init(&mut self) -> Result<(), VdError>;

    fn compile_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramId, VdError>;

    fn create_external_texture(&mut self) -> Result<TextureId, VdError>;

    /// Attach the latest producer image to the external texture.
    fn attach_image(&mut self, texture: TextureId, image: RawFrame) -> Result<(), VdError>;

    fn create_window_surface(&mut self, target: PreviewSurface) -> Result<SurfaceId, VdError>;

    fn create_offscreen_surface(&mut self, width: u32, height: u32) -> Result<SurfaceId, VdError>;

    fn surface_size(&self, surface: SurfaceId) -> Option<(u32, u32)>;

    fn make_current(&mut self, surface: SurfaceId) -> Result<(), VdError>;

    /// Draw the full-screen quad into the current surface over
    /// `0, 0, viewport`.
    fn draw(
        &mut self,
        program: ProgramId,
        texture: TextureId,
        transform: &Mat4,
        viewport: (u32, u32),
    ) -> Result<(), VdError>;

    fn set_presentation_time(&mut self, surface: SurfaceId, ns: u64) -> Result<(), VdError>;

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<(), VdError>;

    /// Read back a surface. The returned frame may carry row padding.
    fn read_pixels(&mut self, surface: SurfaceId) -> Result<RawFrame, VdError>;

    fn destroy_surface(&mut self, surface: SurfaceId);

    fn delete_texture(&mut self, texture: TextureId);

    fn delete_program(&mut self, program: ProgramId);

    /// Tear down the context. Last call.
    fn terminate(&mut self);
}

/// Creates a fresh backend on the GPU worker thread.
pub type GpuFactory = Arc<dyn Fn() -> Box<dyn GpuBackend> + Send + Sync>;
