//! Frame relay pipeline.
//!
//! The virtual output renders into a [`BufferQueue`]; a dedicated GPU
//! worker latches its newest buffer as an external texture and draws it
//! with a fixed program into a preview surface (on every frame, debounced)
//! and into an offscreen capture surface (on request).
//!
//! | Module      | Responsibility                                        |
//! |-------------|-------------------------------------------------------|
//! | `queue`     | Buffer queue, producer endpoint, preview targets      |
//! | `transform` | Crop / flip / rotation texture matrix                 |
//! | `gpu`       | Backend trait and the fixed program                   |
//! | `software`  | CPU backend                                           |
//! | `pipeline`  | GPU worker, debounce, blocking capture                |

pub mod gpu;
pub mod pipeline;
pub mod queue;
pub mod software;
pub mod transform;

pub use gpu::{GpuBackend, GpuFactory};
pub use pipeline::FramePipeline;
pub use queue::{
    BufferQueue, CropRect, PreviewSink, PreviewSurface, ProducerEndpoint, ProducerFrame, Rotation,
};
pub use software::SoftwareGpu;
pub use transform::Mat4;

use std::sync::Arc;

/// Factory producing the CPU backend.
pub fn software_factory() -> GpuFactory {
    Arc::new(|| Box::new(SoftwareGpu::new()) as Box<dyn GpuBackend>)
}
