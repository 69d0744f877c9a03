//! Native backends.

pub mod translate;
mod wgpu_backend;

pub use wgpu_backend::{WgpuDevice, WgpuInitError, WgpuRenderState, WgpuVertexBufferLayout};
