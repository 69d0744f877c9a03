//! `aero-draw-translate` turns GL-style draw calls into native device traffic.
//!
//! Currently this crate provides:
//! - Client buffers with system-memory storage and lazily uploaded native mirrors
//!   (see [`BufferRegistry`]).
//! - Vertex attribute translation through direct binding, promoted static buffers, a shared
//!   streaming buffer or constant current values (see [`VertexTranslator`]).
//! - Index translation with per-range min/max caching, primitive emulation for line loops and
//!   triangle fans, and cached counting indices (see [`IndexTranslator`]).
//! - A device state cache that suppresses redundant state calls (see [`DeviceStateCache`]).
//! - Device-loss handling with bounded reset retries (see [`TranslationContext`]).
//! - A wgpu-backed [`NativeDevice`] implementation (see [`backend::WgpuDevice`]).

mod context;
mod error;
mod serial;
mod static_buffer;
mod stream;

pub mod backend;
pub mod buffer;
pub mod config;
pub mod device_loss;
pub mod hal;
pub mod index;
pub mod state;
pub mod stats;
pub mod vertex;

pub use buffer::{Buffer, BufferName, BufferRegistry, BufferUsage};
pub use config::TranslatorConfig;
pub use context::TranslationContext;
pub use device_loss::{DeviceLossCoordinator, DeviceState, ResetPolicy};
pub use error::{classify, BackendOutcome, DeviceError, Result, TranslateError};
pub use hal::{DeviceCaps, NativeDevice};
pub use index::topology::{PrimitiveEmulation, PrimitiveMode};
pub use index::{IndexPath, IndexSource, IndexTranslator, IndexType, TranslatedIndexData};
pub use serial::Serial;
pub use static_buffer::{RangeCache, StaticIndexBuffer, StaticVertexBuffer};
pub use state::DeviceStateCache;
pub use stats::{TranslateStats, TranslateStatsSnapshot};
pub use stream::{StreamAllocation, StreamingBuffer, STREAM_ALIGNMENT};
pub use vertex::format_map::{AttributeFormat, ElementType};
pub use vertex::{
    AttributePath, AttributeSource, CurrentValue, TranslatedAttribute, VertexAttribute,
    VertexTranslator,
};
