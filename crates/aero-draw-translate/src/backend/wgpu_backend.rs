use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::translate::{
    culls_everything, translate_blend_constant, translate_blend_state, translate_color_write_mask,
    translate_depth_bias, translate_depth_stencil, translate_primitive_state, translate_sampler,
    translate_vertex_format,
};
use crate::error::DeviceError;
use crate::hal::{
    BufferId, DeviceCaps, IndexBufferBinding, LayoutId, NativeDevice, NativeUsage, ProgramId,
    TextureId, VertexBufferBinding, VertexFormatCaps, VertexLayout,
};
use crate::state::types::{
    BlendState, ColorF, DepthStencilState, RasterizerState, SamplerState, ScissorRect,
    ShaderStage, Viewport,
};

#[derive(Debug, Error)]
pub enum WgpuInitError {
    #[error("no suitable wgpu adapter found")]
    NoAdapter,
    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

#[derive(Debug)]
struct StoredBuffer {
    buffer: wgpu::Buffer,
    usage: wgpu::BufferUsages,
    size: u64,
}

/// One vertex buffer slot of the current layout, owned so it can outlive the state borrow.
#[derive(Debug, Clone, PartialEq)]
pub struct WgpuVertexBufferLayout {
    pub array_stride: u64,
    pub step_mode: wgpu::VertexStepMode,
    pub attributes: Vec<wgpu::VertexAttribute>,
}

impl WgpuVertexBufferLayout {
    pub fn as_wgpu(&self) -> wgpu::VertexBufferLayout<'_> {
        wgpu::VertexBufferLayout {
            array_stride: self.array_stride,
            step_mode: self.step_mode,
            attributes: &self.attributes,
        }
    }
}

/// Applied state, already translated into wgpu terms.
///
/// wgpu has no immediate state setters: pipelines and render passes are built by the consumer from
/// this snapshot at draw time.
#[derive(Debug, Clone)]
pub struct WgpuRenderState {
    pub primitive: wgpu::PrimitiveState,
    /// Cull mode `FrontAndBack`: polygon draws are dropped.
    pub cull_all: bool,
    pub depth_bias: wgpu::DepthBiasState,
    pub multisample: wgpu::MultisampleState,
    pub blend: Option<wgpu::BlendState>,
    pub color_writes: wgpu::ColorWrites,
    pub blend_constant: wgpu::Color,
    pub depth_stencil: Option<wgpu::DepthStencilState>,
    pub stencil_reference: u32,
    pub scissor: Option<ScissorRect>,
    pub viewport: Option<Viewport>,
    pub vertex_layout: Option<LayoutId>,
    pub vertex_buffers: BTreeMap<u32, VertexBufferBinding>,
    pub index_buffer: Option<IndexBufferBinding>,
    pub samplers: HashMap<(ShaderStage, u32), wgpu::SamplerDescriptor<'static>>,
    pub textures: HashMap<(ShaderStage, u32), TextureId>,
    pub program: Option<ProgramId>,
    depth_stencil_source: DepthStencilState,
}

impl Default for WgpuRenderState {
    fn default() -> Self {
        Self {
            primitive: wgpu::PrimitiveState::default(),
            cull_all: false,
            depth_bias: wgpu::DepthBiasState::default(),
            multisample: wgpu::MultisampleState::default(),
            blend: None,
            color_writes: wgpu::ColorWrites::ALL,
            blend_constant: wgpu::Color::TRANSPARENT,
            depth_stencil: None,
            stencil_reference: 0,
            scissor: None,
            viewport: None,
            vertex_layout: None,
            vertex_buffers: BTreeMap::new(),
            index_buffer: None,
            samplers: HashMap::new(),
            textures: HashMap::new(),
            program: None,
            depth_stencil_source: DepthStencilState::default(),
        }
    }
}

/// `wgpu` implementation of [`NativeDevice`].
///
/// Device loss is observed through wgpu's device-lost callback and reported by every fallible call
/// until [`NativeDevice::reset`] requests a fresh device from the same adapter.
pub struct WgpuDevice {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: DeviceCaps,
    lost: Arc<AtomicBool>,
    next_id: u32,
    buffers: HashMap<BufferId, StoredBuffer>,
    layouts: HashMap<LayoutId, VertexLayout>,
    state: WgpuRenderState,
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("caps", &self.caps)
            .field("lost", &self.lost.load(Ordering::Relaxed))
            .field("buffers", &self.buffers.len())
            .field("layouts", &self.layouts.len())
            .finish()
    }
}

async fn request_adapter(backends: wgpu::Backends) -> Option<wgpu::Adapter> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends,
        ..Default::default()
    });
    instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
}

async fn request_device(
    adapter: &wgpu::Adapter,
) -> Result<(wgpu::Device, wgpu::Queue), wgpu::RequestDeviceError> {
    adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("aero-draw-translate device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        )
        .await
}

fn watch_device_loss(device: &wgpu::Device, lost: &Arc<AtomicBool>) {
    let lost = lost.clone();
    device.set_device_lost_callback(move |reason, message| {
        if matches!(reason, wgpu::DeviceLostReason::Destroyed) {
            return;
        }
        warn!(?reason, %message, "wgpu device lost");
        lost.store(true, Ordering::Release);
    });
}

fn caps_from_device(device: &wgpu::Device) -> DeviceCaps {
    let limits = device.limits();
    DeviceCaps {
        max_buffer_size: limits.max_buffer_size,
        direct_buffer_binding: true,
        index_u32: true,
        vertex_formats: VertexFormatCaps {
            ubyte4: true,
            ubyte4n: true,
            short_normalized: true,
            half_float: true,
            int32: true,
        },
        vertex_offset_alignment: wgpu::VERTEX_STRIDE_ALIGNMENT,
        vertex_stride_alignment: wgpu::VERTEX_STRIDE_ALIGNMENT as u32,
        max_vertex_attributes: limits.max_vertex_attributes,
        max_texture_units: limits.max_sampled_textures_per_shader_stage,
        // WebGPU steps instanced buffers once per instance.
        instance_divisors: false,
    }
}

fn map_usage(usage: NativeUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::COPY_DST;
    if usage.contains(NativeUsage::VERTEX) {
        out |= wgpu::BufferUsages::VERTEX;
    }
    if usage.contains(NativeUsage::INDEX) {
        out |= wgpu::BufferUsages::INDEX;
    }
    out
}

impl WgpuDevice {
    /// Creates a device without a presentation surface.
    ///
    /// On Linux the GL backend is tried first, then the primary native backends.
    pub async fn new_headless() -> Result<Self, WgpuInitError> {
        let adapter = if cfg!(target_os = "linux") {
            match request_adapter(wgpu::Backends::GL).await {
                Some(adapter) => Some(adapter),
                None => request_adapter(wgpu::Backends::PRIMARY).await,
            }
        } else {
            request_adapter(wgpu::Backends::PRIMARY).await
        }
        .ok_or(WgpuInitError::NoAdapter)?;

        let (device, queue) = request_device(&adapter).await?;
        let lost = Arc::new(AtomicBool::new(false));
        watch_device_loss(&device, &lost);
        let caps = caps_from_device(&device);
        debug!(adapter = ?adapter.get_info().name, ?caps, "wgpu device created");

        Ok(Self {
            adapter,
            device,
            queue,
            caps,
            lost,
            next_id: 1,
            buffers: HashMap::new(),
            layouts: HashMap::new(),
            state: WgpuRenderState::default(),
        })
    }

    pub fn new_headless_blocking() -> Result<Self, WgpuInitError> {
        pollster::block_on(Self::new_headless())
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn buffer(&self, id: BufferId) -> Option<&wgpu::Buffer> {
        self.buffers.get(&id).map(|b| &b.buffer)
    }

    pub fn render_state(&self) -> &WgpuRenderState {
        &self.state
    }

    /// Vertex buffer layouts for the current vertex layout, one per bound slot, in slot order.
    pub fn vertex_buffer_layouts(&self) -> Vec<(u32, WgpuVertexBufferLayout)> {
        let Some(layout) = self.state.vertex_layout.and_then(|id| self.layouts.get(&id)) else {
            return Vec::new();
        };
        layout
            .elements
            .iter()
            .map(|element| {
                let stride = self
                    .state
                    .vertex_buffers
                    .get(&element.slot)
                    .map_or(0, |b| u64::from(b.stride));
                let step_mode = if element.divisor == 0 {
                    wgpu::VertexStepMode::Vertex
                } else {
                    wgpu::VertexStepMode::Instance
                };
                (
                    element.slot,
                    WgpuVertexBufferLayout {
                        array_stride: stride,
                        step_mode,
                        attributes: vec![wgpu::VertexAttribute {
                            format: translate_vertex_format(element.format),
                            offset: 0,
                            shader_location: element.slot,
                        }],
                    },
                )
            })
            .collect()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::DeviceLost);
        }
        Ok(())
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Create a wgpu buffer inside an out-of-memory error scope.
    fn create_wgpu_buffer(
        &self,
        usage: wgpu::BufferUsages,
        size: u64,
    ) -> Result<wgpu::Buffer, DeviceError> {
        if size > self.caps.max_buffer_size {
            return Err(DeviceError::OutOfVideoMemory);
        }
        let size = size
            .max(wgpu::COPY_BUFFER_ALIGNMENT)
            .next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("aero-draw-translate buffer"),
            size,
            usage,
            mapped_at_creation: false,
        });
        match pollster::block_on(self.device.pop_error_scope()) {
            None => Ok(buffer),
            Some(err) => {
                warn!(size, %err, "wgpu buffer allocation failed");
                buffer.destroy();
                Err(DeviceError::OutOfVideoMemory)
            }
        }
    }
}

impl NativeDevice for WgpuDevice {
    fn capabilities(&self) -> DeviceCaps {
        self.caps
    }

    fn create_buffer(&mut self, usage: NativeUsage, size: u64) -> Result<BufferId, DeviceError> {
        self.check_lost()?;
        let usage = map_usage(usage);
        let buffer = self.create_wgpu_buffer(usage, size)?;
        let id = BufferId(self.alloc_id());
        self.buffers.insert(
            id,
            StoredBuffer {
                buffer,
                usage,
                size,
            },
        );
        Ok(id)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.check_lost()?;
        let stored = self.buffers.get(&buffer).ok_or(DeviceError::InvalidCall)?;
        let len = data.len() as u64;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || len % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || offset + len > stored.buffer.size()
        {
            return Err(DeviceError::InvalidCall);
        }
        if len > 0 {
            self.queue.write_buffer(&stored.buffer, offset, data);
        }
        Ok(())
    }

    /// Orphan the buffer: the id now names a fresh allocation, and in-flight work keeps the old
    /// one alive.
    fn discard_buffer(&mut self, buffer: BufferId) -> Result<(), DeviceError> {
        self.check_lost()?;
        let (usage, size) = {
            let stored = self.buffers.get(&buffer).ok_or(DeviceError::InvalidCall)?;
            (stored.usage, stored.size)
        };
        let fresh = self.create_wgpu_buffer(usage, size)?;
        if let Some(stored) = self.buffers.get_mut(&buffer) {
            stored.buffer = fresh;
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(stored) = self.buffers.remove(&buffer) {
            stored.buffer.destroy();
        }
    }

    fn create_vertex_layout(&mut self, layout: &VertexLayout) -> Result<LayoutId, DeviceError> {
        self.check_lost()?;
        // WebGPU steps instanced buffers once per instance.
        if layout.elements.iter().any(|e| e.divisor > 1) {
            return Err(DeviceError::InvalidCall);
        }
        let id = LayoutId(self.alloc_id());
        self.layouts.insert(id, layout.clone());
        Ok(id)
    }

    fn destroy_vertex_layout(&mut self, layout: LayoutId) {
        self.layouts.remove(&layout);
    }

    fn set_vertex_layout(&mut self, layout: Option<LayoutId>) {
        self.state.vertex_layout = layout;
    }

    fn set_vertex_buffer(&mut self, slot: u32, binding: Option<VertexBufferBinding>) {
        match binding {
            Some(binding) => {
                self.state.vertex_buffers.insert(slot, binding);
            }
            None => {
                self.state.vertex_buffers.remove(&slot);
            }
        }
    }

    fn set_index_buffer(&mut self, binding: Option<IndexBufferBinding>) {
        self.state.index_buffer = binding;
    }

    fn set_rasterizer_state(&mut self, state: &RasterizerState) {
        self.state.primitive = translate_primitive_state(state);
        self.state.cull_all = culls_everything(state);
        self.state.depth_bias = translate_depth_bias(state);
        self.state.depth_stencil =
            translate_depth_stencil(&self.state.depth_stencil_source, self.state.depth_bias);
    }

    fn set_blend_state(&mut self, state: &BlendState, color: ColorF, sample_mask: u32) {
        self.state.blend = translate_blend_state(state);
        self.state.color_writes = translate_color_write_mask(state.color_write_mask);
        self.state.blend_constant = translate_blend_constant(color);
        self.state.multisample = wgpu::MultisampleState {
            count: self.state.multisample.count,
            mask: u64::from(sample_mask),
            alpha_to_coverage_enabled: state.alpha_to_coverage,
        };
    }

    fn set_depth_stencil_state(
        &mut self,
        state: &DepthStencilState,
        stencil_ref: u32,
        _stencil_back_ref: u32,
    ) {
        self.state.depth_stencil_source = *state;
        self.state.depth_stencil = translate_depth_stencil(state, self.state.depth_bias);
        self.state.stencil_reference = stencil_ref;
    }

    fn set_scissor_rect(&mut self, rect: Option<ScissorRect>) {
        self.state.scissor = rect;
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.state.viewport = Some(*viewport);
    }

    fn set_sampler_state(&mut self, stage: ShaderStage, unit: u32, state: &SamplerState) {
        self.state
            .samplers
            .insert((stage, unit), translate_sampler(state));
    }

    fn set_texture(&mut self, stage: ShaderStage, unit: u32, texture: Option<TextureId>) {
        match texture {
            Some(texture) => {
                self.state.textures.insert((stage, unit), texture);
            }
            None => {
                self.state.textures.remove(&(stage, unit));
            }
        }
    }

    fn set_program(&mut self, program: Option<ProgramId>) {
        self.state.program = program;
    }

    /// A lost wgpu device cannot come back, but a new one can be requested; report it as ready
    /// for reset.
    fn check_device_state(&mut self) -> Result<(), DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::DeviceNotReset);
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        let (device, queue) = pollster::block_on(request_device(&self.adapter)).map_err(|err| {
            warn!(%err, "wgpu device re-creation failed");
            DeviceError::DeviceLost
        })?;
        let lost = Arc::new(AtomicBool::new(false));
        watch_device_loss(&device, &lost);

        self.buffers.clear();
        self.layouts.clear();
        self.state = WgpuRenderState::default();
        self.caps = caps_from_device(&device);
        self.device = device;
        self.queue = queue;
        self.lost = lost;
        debug!("wgpu device re-created after loss");
        Ok(())
    }

    fn as_wgpu(&self) -> Option<&WgpuDevice> {
        Some(self)
    }
}
