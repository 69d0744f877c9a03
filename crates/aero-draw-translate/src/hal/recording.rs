use hashbrown::HashMap;

use super::{
    BufferId, DeviceCaps, IndexBufferBinding, LayoutId, NativeDevice, NativeUsage, ProgramId,
    TextureId, VertexBufferBinding, VertexLayout,
};
use crate::error::DeviceError;
use crate::state::types::{
    BlendState, ColorF, DepthStencilState, RasterizerState, SamplerState, ScissorRect,
    ShaderStage, Viewport,
};

/// Byte pattern written over a buffer's contents when it is discarded.
const DISCARD_FILL: u8 = 0xcd;

/// A backend call observed by [`RecordingDevice`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    CreateBuffer {
        id: BufferId,
        usage: NativeUsage,
        size: u64,
    },
    WriteBuffer {
        id: BufferId,
        offset: u64,
        len: u64,
    },
    DiscardBuffer(BufferId),
    DestroyBuffer(BufferId),
    CreateVertexLayout(LayoutId),
    DestroyVertexLayout(LayoutId),
    SetVertexLayout(Option<LayoutId>),
    SetVertexBuffer {
        slot: u32,
        binding: Option<VertexBufferBinding>,
    },
    SetIndexBuffer(Option<IndexBufferBinding>),
    SetRasterizerState(RasterizerState),
    SetBlendState {
        state: BlendState,
        color: ColorF,
        sample_mask: u32,
    },
    SetDepthStencilState {
        state: DepthStencilState,
        stencil_ref: u32,
        stencil_back_ref: u32,
    },
    SetScissorRect(Option<ScissorRect>),
    SetViewport(Viewport),
    SetSamplerState {
        stage: ShaderStage,
        unit: u32,
        state: SamplerState,
    },
    SetTexture {
        stage: ShaderStage,
        unit: u32,
        texture: Option<TextureId>,
    },
    SetProgram(Option<ProgramId>),
    CheckDeviceState,
    Reset,
}

impl DeviceCall {
    /// True for the per-category state setters (not buffer or status traffic).
    pub fn is_state_call(&self) -> bool {
        matches!(
            self,
            DeviceCall::SetVertexLayout(_)
                | DeviceCall::SetVertexBuffer { .. }
                | DeviceCall::SetIndexBuffer(_)
                | DeviceCall::SetRasterizerState(_)
                | DeviceCall::SetBlendState { .. }
                | DeviceCall::SetDepthStencilState { .. }
                | DeviceCall::SetScissorRect(_)
                | DeviceCall::SetViewport(_)
                | DeviceCall::SetSamplerState { .. }
                | DeviceCall::SetTexture { .. }
                | DeviceCall::SetProgram(_)
        )
    }
}

/// Fallible calls that can have a failure injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateBuffer,
    WriteBuffer,
    DiscardBuffer,
    CreateVertexLayout,
}

/// In-memory backend that keeps buffer contents and records every call.
///
/// Supports failure injection for allocation/upload failures, device loss and failing resets.
#[derive(Debug)]
pub struct RecordingDevice {
    caps: DeviceCaps,
    next_id: u32,
    buffers: HashMap<BufferId, Vec<u8>>,
    layouts: HashMap<LayoutId, VertexLayout>,
    calls: Vec<DeviceCall>,
    injected: HashMap<FailPoint, DeviceError>,
    lost: Option<DeviceError>,
    failing_resets: u32,
}

impl RecordingDevice {
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            next_id: 1,
            buffers: HashMap::new(),
            layouts: HashMap::new(),
            calls: Vec::new(),
            injected: HashMap::new(),
            lost: None,
            failing_resets: 0,
        }
    }

    pub fn set_capabilities(&mut self, caps: DeviceCaps) {
        self.caps = caps;
    }

    pub fn calls(&self) -> &[DeviceCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<DeviceCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn buffer_contents(&self, id: BufferId) -> Option<&[u8]> {
        self.buffers.get(&id).map(Vec::as_slice)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn layout(&self, id: LayoutId) -> Option<&VertexLayout> {
        self.layouts.get(&id)
    }

    pub fn live_layouts(&self) -> usize {
        self.layouts.len()
    }

    /// Make the next call of `point` fail with `err`.
    pub fn fail_next(&mut self, point: FailPoint, err: DeviceError) {
        self.injected.insert(point, err);
    }

    /// Simulate device loss. Every fallible call reports `err` until a successful reset.
    pub fn lose_device(&mut self, err: DeviceError) {
        debug_assert!(err.is_device_lost());
        self.lost = Some(err);
    }

    /// The next `count` resets fail.
    pub fn fail_resets(&mut self, count: u32) {
        self.failing_resets = count;
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_some()
    }

    fn check(&mut self, point: FailPoint) -> Result<(), DeviceError> {
        if let Some(err) = self.lost {
            return Err(err);
        }
        match self.injected.remove(&point) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record_state(&mut self, call: DeviceCall) {
        // A lost device drops state calls on the floor.
        if self.lost.is_none() {
            self.calls.push(call);
        }
    }
}

impl NativeDevice for RecordingDevice {
    fn capabilities(&self) -> DeviceCaps {
        self.caps
    }

    fn create_buffer(&mut self, usage: NativeUsage, size: u64) -> Result<BufferId, DeviceError> {
        self.check(FailPoint::CreateBuffer)?;
        if size > self.caps.max_buffer_size {
            return Err(DeviceError::OutOfVideoMemory);
        }
        let len = usize::try_from(size).map_err(|_| DeviceError::OutOfMemory)?;
        let id = BufferId(self.alloc_id());
        self.buffers.insert(id, vec![0; len]);
        self.calls.push(DeviceCall::CreateBuffer { id, usage, size });
        Ok(id)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.check(FailPoint::WriteBuffer)?;
        let contents = self
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::InvalidCall)?;
        let start = usize::try_from(offset).map_err(|_| DeviceError::InvalidCall)?;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= contents.len())
            .ok_or(DeviceError::InvalidCall)?;
        contents[start..end].copy_from_slice(data);
        self.calls.push(DeviceCall::WriteBuffer {
            id: buffer,
            offset,
            len: data.len() as u64,
        });
        Ok(())
    }

    fn discard_buffer(&mut self, buffer: BufferId) -> Result<(), DeviceError> {
        self.check(FailPoint::DiscardBuffer)?;
        let contents = self
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::InvalidCall)?;
        contents.fill(DISCARD_FILL);
        self.calls.push(DeviceCall::DiscardBuffer(buffer));
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer).is_some() {
            self.calls.push(DeviceCall::DestroyBuffer(buffer));
        }
    }

    fn create_vertex_layout(&mut self, layout: &VertexLayout) -> Result<LayoutId, DeviceError> {
        self.check(FailPoint::CreateVertexLayout)?;
        let id = LayoutId(self.alloc_id());
        self.layouts.insert(id, layout.clone());
        self.calls.push(DeviceCall::CreateVertexLayout(id));
        Ok(id)
    }

    fn destroy_vertex_layout(&mut self, layout: LayoutId) {
        if self.layouts.remove(&layout).is_some() {
            self.calls.push(DeviceCall::DestroyVertexLayout(layout));
        }
    }

    fn set_vertex_layout(&mut self, layout: Option<LayoutId>) {
        self.record_state(DeviceCall::SetVertexLayout(layout));
    }

    fn set_vertex_buffer(&mut self, slot: u32, binding: Option<VertexBufferBinding>) {
        self.record_state(DeviceCall::SetVertexBuffer { slot, binding });
    }

    fn set_index_buffer(&mut self, binding: Option<IndexBufferBinding>) {
        self.record_state(DeviceCall::SetIndexBuffer(binding));
    }

    fn set_rasterizer_state(&mut self, state: &RasterizerState) {
        self.record_state(DeviceCall::SetRasterizerState(*state));
    }

    fn set_blend_state(&mut self, state: &BlendState, color: ColorF, sample_mask: u32) {
        self.record_state(DeviceCall::SetBlendState {
            state: *state,
            color,
            sample_mask,
        });
    }

    fn set_depth_stencil_state(
        &mut self,
        state: &DepthStencilState,
        stencil_ref: u32,
        stencil_back_ref: u32,
    ) {
        self.record_state(DeviceCall::SetDepthStencilState {
            state: *state,
            stencil_ref,
            stencil_back_ref,
        });
    }

    fn set_scissor_rect(&mut self, rect: Option<ScissorRect>) {
        self.record_state(DeviceCall::SetScissorRect(rect));
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.record_state(DeviceCall::SetViewport(*viewport));
    }

    fn set_sampler_state(&mut self, stage: ShaderStage, unit: u32, state: &SamplerState) {
        self.record_state(DeviceCall::SetSamplerState {
            stage,
            unit,
            state: *state,
        });
    }

    fn set_texture(&mut self, stage: ShaderStage, unit: u32, texture: Option<TextureId>) {
        self.record_state(DeviceCall::SetTexture {
            stage,
            unit,
            texture,
        });
    }

    fn set_program(&mut self, program: Option<ProgramId>) {
        self.record_state(DeviceCall::SetProgram(program));
    }

    fn check_device_state(&mut self) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::CheckDeviceState);
        match self.lost {
            // A lost device becomes resettable once nothing else is pending.
            Some(_) if self.failing_resets == 0 => Err(DeviceError::DeviceNotReset),
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::Reset);
        if self.failing_resets > 0 {
            self.failing_resets -= 1;
            return Err(DeviceError::DeviceLost);
        }
        // Every native resource is gone after a reset.
        self.buffers.clear();
        self.layouts.clear();
        self.injected.clear();
        self.lost = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_land_in_buffer_contents() {
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        let id = device.create_buffer(NativeUsage::VERTEX, 8).unwrap();
        device.write_buffer(id, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.buffer_contents(id), Some(&[0, 0, 0, 0, 1, 2, 3, 4][..]));

        assert_eq!(
            device.write_buffer(id, 6, &[1, 2, 3]),
            Err(DeviceError::InvalidCall)
        );
    }

    #[test]
    fn injected_failure_fires_once() {
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        device.fail_next(FailPoint::CreateBuffer, DeviceError::OutOfVideoMemory);
        assert_eq!(
            device.create_buffer(NativeUsage::INDEX, 4),
            Err(DeviceError::OutOfVideoMemory)
        );
        assert!(device.create_buffer(NativeUsage::INDEX, 4).is_ok());
    }

    #[test]
    fn lost_device_fails_until_reset() {
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        let id = device.create_buffer(NativeUsage::VERTEX, 4).unwrap();
        device.lose_device(DeviceError::DeviceRemoved);
        device.fail_resets(1);

        assert_eq!(
            device.write_buffer(id, 0, &[0; 4]),
            Err(DeviceError::DeviceRemoved)
        );
        assert_eq!(device.check_device_state(), Err(DeviceError::DeviceRemoved));
        assert_eq!(device.reset(), Err(DeviceError::DeviceLost));
        assert_eq!(device.check_device_state(), Err(DeviceError::DeviceNotReset));
        assert_eq!(device.reset(), Ok(()));
        assert_eq!(device.check_device_state(), Ok(()));
        assert_eq!(device.live_buffers(), 0);
    }
}
