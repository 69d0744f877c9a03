//! Narrow interface to the native graphics backend.
//!
//! Everything the translation layer needs from a device is expressed by [`NativeDevice`]: buffer
//! allocation and upload, vertex layouts, per-category state setters, and the status/reset pair
//! used by device-loss recovery. Backends are free to model these however suits them; the wgpu
//! backend, for example, records state into pipeline descriptors instead of issuing immediate
//! calls.

mod recording;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::error::DeviceError;
use crate::state::types::{
    BlendState, ColorF, DepthStencilState, RasterizerState, SamplerState, ScissorRect,
    ShaderStage, Viewport,
};

pub use recording::{DeviceCall, FailPoint, RecordingDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayoutId(pub u32);

bitflags! {
    /// How a native buffer will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NativeUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        /// Content is rewritten frequently; the backend should allow discard/orphaning.
        const DYNAMIC = 1 << 2;
    }
}

/// Native index element format. There is no native 8-bit index format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn byte_size(self) -> u64 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// Vertex formats the backend can consume directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeVertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Float16x2,
    Float16x4,
    Uint8x4,
    Unorm8x4,
    Sint16x2,
    Sint16x4,
    Snorm16x2,
    Snorm16x4,
    Unorm16x2,
    Unorm16x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
}

/// Storage of a single component of a [`NativeVertexFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeComponent {
    F32,
    F16,
    U8,
    Unorm8,
    I16,
    Snorm16,
    Unorm16,
    I32,
    U32,
}

impl NativeComponent {
    pub fn byte_size(self) -> u32 {
        match self {
            NativeComponent::U8 | NativeComponent::Unorm8 => 1,
            NativeComponent::F16
            | NativeComponent::I16
            | NativeComponent::Snorm16
            | NativeComponent::Unorm16 => 2,
            NativeComponent::F32 | NativeComponent::I32 | NativeComponent::U32 => 4,
        }
    }
}

impl NativeVertexFormat {
    pub fn component(self) -> NativeComponent {
        use NativeVertexFormat::*;
        match self {
            Float32 | Float32x2 | Float32x3 | Float32x4 => NativeComponent::F32,
            Float16x2 | Float16x4 => NativeComponent::F16,
            Uint8x4 => NativeComponent::U8,
            Unorm8x4 => NativeComponent::Unorm8,
            Sint16x2 | Sint16x4 => NativeComponent::I16,
            Snorm16x2 | Snorm16x4 => NativeComponent::Snorm16,
            Unorm16x2 | Unorm16x4 => NativeComponent::Unorm16,
            Sint32 | Sint32x2 | Sint32x3 | Sint32x4 => NativeComponent::I32,
            Uint32 | Uint32x2 | Uint32x3 | Uint32x4 => NativeComponent::U32,
        }
    }

    pub fn components(self) -> u32 {
        use NativeVertexFormat::*;
        match self {
            Float32 | Sint32 | Uint32 => 1,
            Float32x2 | Float16x2 | Sint16x2 | Snorm16x2 | Unorm16x2 | Sint32x2 | Uint32x2 => 2,
            Float32x3 | Sint32x3 | Uint32x3 => 3,
            Float32x4 | Float16x4 | Uint8x4 | Unorm8x4 | Sint16x4 | Snorm16x4 | Unorm16x4
            | Sint32x4 | Uint32x4 => 4,
        }
    }

    pub fn byte_size(self) -> u32 {
        self.component().byte_size() * self.components()
    }
}

/// Vertex formats beyond the always-available `float32xN` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexFormatCaps {
    pub ubyte4: bool,
    pub ubyte4n: bool,
    pub short_normalized: bool,
    pub half_float: bool,
    pub int32: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub max_buffer_size: u64,
    /// Buffer storage can be bound as a vertex/index source without an intermediate copy.
    pub direct_buffer_binding: bool,
    pub index_u32: bool,
    pub vertex_formats: VertexFormatCaps,
    /// Required alignment of a vertex binding offset when binding in place.
    pub vertex_offset_alignment: u64,
    /// Required alignment of a vertex stride when binding in place.
    pub vertex_stride_alignment: u32,
    pub max_vertex_attributes: u32,
    pub max_texture_units: u32,
    /// Instanced attributes may advance every N instances. Without it only divisor 1 is valid.
    pub instance_divisors: bool,
}

impl DeviceCaps {
    /// Capabilities of a D3D9-class device: every vertex stream goes through a device buffer,
    /// no half-float or 32-bit integer vertex formats.
    pub fn d3d9_class() -> Self {
        Self {
            max_buffer_size: 256 * 1024 * 1024,
            direct_buffer_binding: false,
            index_u32: true,
            vertex_formats: VertexFormatCaps {
                ubyte4: true,
                ubyte4n: true,
                short_normalized: true,
                half_float: false,
                int32: false,
            },
            vertex_offset_alignment: 1,
            vertex_stride_alignment: 1,
            max_vertex_attributes: 16,
            max_texture_units: 16,
            instance_divisors: true,
        }
    }

    /// Capabilities of a modern (D3D11/WebGPU-class) device.
    pub fn modern() -> Self {
        Self {
            max_buffer_size: 256 * 1024 * 1024,
            direct_buffer_binding: true,
            index_u32: true,
            vertex_formats: VertexFormatCaps {
                ubyte4: true,
                ubyte4n: true,
                short_normalized: true,
                half_float: true,
                int32: true,
            },
            vertex_offset_alignment: 4,
            vertex_stride_alignment: 4,
            max_vertex_attributes: 16,
            max_texture_units: 16,
            instance_divisors: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferBinding {
    pub buffer: BufferId,
    pub offset: u64,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexBufferBinding {
    pub buffer: BufferId,
    pub format: IndexFormat,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub slot: u32,
    pub format: NativeVertexFormat,
    /// 0 for per-vertex data, otherwise the instance step rate.
    pub divisor: u32,
}

/// Native vertex input layout (a D3D9 vertex declaration / WebGPU vertex state).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexLayout {
    pub elements: Vec<VertexElement>,
}

/// The native backend.
///
/// Fallible calls return [`DeviceError`]; call sites classify it through
/// [`DeviceError::outcome`] and route device loss to the coordinator. State setters cannot fail:
/// a lost device silently drops them, and the loss is observed at the next fallible call or
/// status poll.
pub trait NativeDevice {
    fn capabilities(&self) -> DeviceCaps;

    fn create_buffer(&mut self, usage: NativeUsage, size: u64) -> Result<BufferId, DeviceError>;
    /// Upload `data` at `offset`. This is the map/write/unmap of a D3D-class device.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8])
        -> Result<(), DeviceError>;
    /// Orphan the current contents; previously written data must not be read afterwards.
    fn discard_buffer(&mut self, buffer: BufferId) -> Result<(), DeviceError>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn create_vertex_layout(&mut self, layout: &VertexLayout) -> Result<LayoutId, DeviceError>;
    fn destroy_vertex_layout(&mut self, layout: LayoutId);
    fn set_vertex_layout(&mut self, layout: Option<LayoutId>);

    fn set_vertex_buffer(&mut self, slot: u32, binding: Option<VertexBufferBinding>);
    fn set_index_buffer(&mut self, binding: Option<IndexBufferBinding>);

    fn set_rasterizer_state(&mut self, state: &RasterizerState);
    fn set_blend_state(&mut self, state: &BlendState, color: ColorF, sample_mask: u32);
    fn set_depth_stencil_state(
        &mut self,
        state: &DepthStencilState,
        stencil_ref: u32,
        stencil_back_ref: u32,
    );
    fn set_scissor_rect(&mut self, rect: Option<ScissorRect>);
    fn set_viewport(&mut self, viewport: &Viewport);
    fn set_sampler_state(&mut self, stage: ShaderStage, unit: u32, state: &SamplerState);
    fn set_texture(&mut self, stage: ShaderStage, unit: u32, texture: Option<TextureId>);
    fn set_program(&mut self, program: Option<ProgramId>);

    /// Poll the cooperative level / device status.
    fn check_device_state(&mut self) -> Result<(), DeviceError>;
    /// Attempt to bring a lost device back. All native resources are gone afterwards.
    fn reset(&mut self) -> Result<(), DeviceError>;

    /// Access the wgpu backend when this device is one.
    fn as_wgpu(&self) -> Option<&crate::backend::WgpuDevice> {
        None
    }
}

/// Native buffers whose owning [`BufferHandle`] was dropped, waiting to be destroyed.
///
/// Dropping a handle cannot reach the device, so the release is queued and applied the next time
/// the owner has the device in hand. After device loss the queue is forgotten instead: the ids
/// belong to a device that no longer exists.
#[derive(Clone, Default)]
pub struct ReleaseQueue(Rc<RefCell<Vec<BufferId>>>);

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, id: BufferId) {
        self.0.borrow_mut().push(id);
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain_into(&self, device: &mut dyn NativeDevice) {
        let pending = std::mem::take(&mut *self.0.borrow_mut());
        for id in pending {
            device.destroy_buffer(id);
        }
    }

    pub fn forget(&self) {
        self.0.borrow_mut().clear();
    }
}

impl fmt::Debug for ReleaseQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseQueue")
            .field("pending", &self.len())
            .finish()
    }
}

/// Exclusive owner of a native buffer. Releases it (via the [`ReleaseQueue`]) when dropped.
pub struct BufferHandle {
    id: BufferId,
    usage: NativeUsage,
    size: u64,
    releases: ReleaseQueue,
}

impl BufferHandle {
    pub fn create(
        device: &mut dyn NativeDevice,
        releases: &ReleaseQueue,
        usage: NativeUsage,
        size: u64,
    ) -> Result<Self, DeviceError> {
        let id = device.create_buffer(usage, size)?;
        Ok(Self {
            id,
            usage,
            size,
            releases: releases.clone(),
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn usage(&self) -> NativeUsage {
        self.usage
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.releases.push(self.id);
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.id)
            .field("usage", &self.usage)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_format_sizes() {
        assert_eq!(NativeVertexFormat::Float32x3.byte_size(), 12);
        assert_eq!(NativeVertexFormat::Unorm8x4.byte_size(), 4);
        assert_eq!(NativeVertexFormat::Sint16x2.byte_size(), 4);
        assert_eq!(NativeVertexFormat::Float16x4.byte_size(), 8);
        assert_eq!(NativeVertexFormat::Uint32x3.byte_size(), 12);
    }

    #[test]
    fn dropped_handles_are_released_on_drain() {
        let mut device = RecordingDevice::new(DeviceCaps::d3d9_class());
        let releases = ReleaseQueue::new();

        let handle =
            BufferHandle::create(&mut device, &releases, NativeUsage::VERTEX, 64).unwrap();
        let id = handle.id();
        assert!(device.buffer_contents(id).is_some());

        drop(handle);
        assert_eq!(releases.len(), 1);
        // Nothing is destroyed until the owner drains the queue.
        assert!(device.buffer_contents(id).is_some());

        releases.drain_into(&mut device);
        assert!(releases.is_empty());
        assert!(device.buffer_contents(id).is_none());
    }

    #[test]
    fn forgotten_releases_never_reach_the_device() {
        let mut device = RecordingDevice::new(DeviceCaps::d3d9_class());
        let releases = ReleaseQueue::new();
        let handle =
            BufferHandle::create(&mut device, &releases, NativeUsage::INDEX, 16).unwrap();
        let id = handle.id();
        drop(handle);

        releases.forget();
        releases.drain_into(&mut device);
        assert!(device.buffer_contents(id).is_some());
    }
}
