use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::buffer::{Buffer, BufferName, BufferRegistry, BufferUsage};
use crate::config::TranslatorConfig;
use crate::device_loss::{DeviceLossCoordinator, DeviceState};
use crate::error::{Result, TranslateError};
use crate::hal::{NativeDevice, ProgramId, ReleaseQueue, TextureId};
use crate::index::topology::PrimitiveEmulation;
use crate::index::{IndexSource, IndexTranslator, IndexType, TranslatedIndexData};
use crate::serial::Serial;
use crate::state::types::{
    BlendState, ColorF, DepthStencilState, RasterizerState, SamplerState, ScissorRect,
    ShaderStage, Viewport,
};
use crate::state::DeviceStateCache;
use crate::stats::TranslateStats;
use crate::vertex::{TranslatedAttribute, VertexAttribute, VertexTranslator};

/// Owner of every translation component for one native device.
///
/// All backend traffic goes through here so device loss has a single choke point: any operation
/// that observes it tears down native resources, moves the coordinator to `Lost` and reports
/// [`TranslateError::ContextLost`]. Translation and state application are refused until
/// [`TranslationContext::reset_device`] succeeds. Buffer contents live in system memory and survive
/// loss.
pub struct TranslationContext<D: NativeDevice> {
    device: D,
    config: TranslatorConfig,
    buffers: BufferRegistry,
    vertices: VertexTranslator,
    indices: IndexTranslator,
    state: DeviceStateCache,
    coordinator: DeviceLossCoordinator,
    releases: ReleaseQueue,
    stats: Arc<TranslateStats>,
}

impl<D: NativeDevice> TranslationContext<D> {
    pub fn new(device: D, config: TranslatorConfig) -> Self {
        let stats = Arc::new(TranslateStats::new());
        let releases = ReleaseQueue::new();
        Self {
            vertices: VertexTranslator::new(&config, releases.clone(), stats.clone()),
            indices: IndexTranslator::new(&config, releases.clone(), stats.clone()),
            state: DeviceStateCache::new(config.state_diffing, stats.clone()),
            coordinator: DeviceLossCoordinator::new(config.reset_policy),
            buffers: BufferRegistry::new(),
            device,
            config,
            releases,
            stats,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Raw device access, bypassing loss routing.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<TranslateStats> {
        &self.stats
    }

    pub fn state_cache(&self) -> &DeviceStateCache {
        &self.state
    }

    pub fn vertex_translator(&self) -> &VertexTranslator {
        &self.vertices
    }

    pub fn index_translator(&self) -> &IndexTranslator {
        &self.indices
    }

    pub fn device_state(&self) -> DeviceState {
        self.coordinator.state()
    }

    pub fn is_lost(&self) -> bool {
        !self.coordinator.is_active()
    }

    // Buffers.

    pub fn create_buffer(&mut self) -> BufferName {
        let direct = self.config.direct_binding && self.device.capabilities().direct_buffer_binding;
        self.buffers.create(direct)
    }

    /// Replace a buffer's contents (`glBufferData`).
    pub fn buffer_data(&mut self, name: BufferName, data: &[u8], usage: BufferUsage) -> Result<()> {
        self.buffer_mut(name)?.set_contents(data, usage)
    }

    /// Overwrite part of a buffer (`glBufferSubData`). The range must lie within the buffer.
    pub fn buffer_sub_data(&mut self, name: BufferName, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffer_mut(name)?;
        let in_range = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= buffer.size());
        if !in_range {
            return Err(TranslateError::invalid(format!(
                "sub-data range {offset}+{} exceeds buffer size {}",
                data.len(),
                buffer.size()
            )));
        }
        buffer.update(data, offset)
    }

    pub fn buffer(&self, name: BufferName) -> Option<&Buffer> {
        self.buffers.get(name)
    }

    /// Delete a buffer and release its native objects. Unknown names are ignored.
    pub fn delete_buffer(&mut self, name: BufferName) -> bool {
        let deleted = self.buffers.delete(name).is_some();
        self.flush_releases();
        deleted
    }

    fn buffer_mut(&mut self, name: BufferName) -> Result<&mut Buffer> {
        self.buffers
            .get_mut(name)
            .ok_or_else(|| TranslateError::invalid(format!("unknown buffer {name:?}")))
    }

    // Translation.

    pub fn prepare_vertex_data(
        &mut self,
        attributes: &[VertexAttribute<'_>],
        active_mask: u32,
        first_vertex: u32,
        vertex_count: u32,
        instance_count: u32,
    ) -> Result<Vec<TranslatedAttribute>> {
        self.ensure_active()?;
        let result = self.vertices.prepare(
            &mut self.device,
            &mut self.buffers,
            attributes,
            active_mask,
            first_vertex,
            vertex_count,
            instance_count,
        );
        self.route(result)
    }

    pub fn prepare_index_data(
        &mut self,
        index_type: IndexType,
        count: u32,
        source: IndexSource<'_>,
    ) -> Result<TranslatedIndexData> {
        self.ensure_active()?;
        let result =
            self.indices
                .prepare(&mut self.device, &mut self.buffers, index_type, count, source);
        self.route(result)
    }

    /// Indices for a line loop or triangle fan, indexed (`source`) or not.
    pub fn prepare_emulated_indices(
        &mut self,
        emulation: PrimitiveEmulation,
        source: Option<(IndexType, IndexSource<'_>)>,
        count: u32,
    ) -> Result<TranslatedIndexData> {
        self.ensure_active()?;
        let result =
            self.indices
                .prepare_emulated(&mut self.device, &self.buffers, emulation, source, count);
        self.route(result)
    }

    pub fn counting_indices(&mut self, count: u32) -> Result<TranslatedIndexData> {
        self.ensure_active()?;
        let result = self.indices.counting_indices(&mut self.device, count);
        self.route(result)
    }

    // State application.

    /// Bind translated attributes: vertex layout plus one buffer per attribute slot.
    pub fn apply_vertex_buffers(&mut self, attributes: &[TranslatedAttribute]) -> Result<()> {
        self.ensure_active()?;
        let result = self
            .state
            .apply_translated_attributes(&mut self.device, attributes);
        self.route(result)
    }

    pub fn apply_index_buffer(&mut self, indices: Option<&TranslatedIndexData>) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.state.apply_index_buffer(&mut self.device, indices))
    }

    pub fn apply_rasterizer(&mut self, state: &RasterizerState) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.state.apply_rasterizer(&mut self.device, state))
    }

    pub fn apply_blend(
        &mut self,
        state: &BlendState,
        color: ColorF,
        sample_mask: u32,
    ) -> Result<bool> {
        self.ensure_active()?;
        Ok(self
            .state
            .apply_blend(&mut self.device, state, color, sample_mask))
    }

    pub fn apply_depth_stencil(
        &mut self,
        state: &DepthStencilState,
        stencil_ref: u32,
        stencil_back_ref: u32,
    ) -> Result<bool> {
        self.ensure_active()?;
        Ok(self
            .state
            .apply_depth_stencil(&mut self.device, state, stencil_ref, stencil_back_ref))
    }

    pub fn apply_scissor(&mut self, rect: Option<ScissorRect>) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.state.apply_scissor(&mut self.device, rect))
    }

    pub fn apply_viewport(&mut self, viewport: &Viewport) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.state.apply_viewport(&mut self.device, viewport))
    }

    pub fn apply_sampler(
        &mut self,
        stage: ShaderStage,
        unit: u32,
        state: &SamplerState,
    ) -> Result<bool> {
        self.ensure_active()?;
        self.state.apply_sampler(&mut self.device, stage, unit, state)
    }

    pub fn apply_texture(
        &mut self,
        stage: ShaderStage,
        unit: u32,
        texture: Option<(TextureId, Serial)>,
    ) -> Result<bool> {
        self.ensure_active()?;
        self.state.apply_texture(&mut self.device, stage, unit, texture)
    }

    pub fn apply_program(&mut self, program: Option<(ProgramId, Serial)>) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.state.apply_program(&mut self.device, program))
    }

    /// Make the next apply of every state category unconditional.
    pub fn force_all_state(&mut self) {
        self.state.force_all();
    }

    // Device loss.

    /// Record device loss. Idempotent: teardown runs once per loss.
    pub fn notify_device_lost(&mut self) -> bool {
        if !self.coordinator.notify_device_lost(&self.stats) {
            return false;
        }
        self.teardown_native();
        true
    }

    /// Poll the device status; loss is routed like any other failing call.
    pub fn check_device(&mut self) -> Result<()> {
        if self.coordinator.is_fatal() {
            return Err(TranslateError::ResetFailed {
                attempts: self.coordinator.policy().max_attempts,
            });
        }
        self.ensure_active()?;
        let result = self
            .device
            .check_device_state()
            .map_err(|err| TranslateError::from_device(err, "polling device state"));
        self.route(result)
    }

    /// Run the reset protocol, sleeping with [`std::thread::sleep`] between attempts.
    pub fn reset_device(&mut self) -> Result<()> {
        self.reset_device_with(std::thread::sleep)
    }

    /// Run the reset protocol with an injected sleep.
    pub fn reset_device_with(&mut self, sleep: impl FnMut(Duration)) -> Result<()> {
        if self.coordinator.is_active() {
            return Ok(());
        }
        self.coordinator
            .reset(&mut self.device, &self.stats, sleep)?;
        // Everything native is recreated lazily; only the state snapshot must be forced.
        self.state.force_all();
        info!(buffers = self.buffers.len(), "translation context recovered from device loss");
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.coordinator.is_active() {
            Ok(())
        } else {
            Err(TranslateError::ContextLost)
        }
    }

    /// Convert internal device loss into a transition plus `ContextLost`, then flush releases.
    fn route<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Err(TranslateError::DeviceLost) => {
                self.notify_device_lost();
                Err(TranslateError::ContextLost)
            }
            other => {
                self.flush_releases();
                other
            }
        }
    }

    fn flush_releases(&mut self) {
        if self.coordinator.is_active() {
            self.releases.drain_into(&mut self.device);
        } else {
            self.releases.forget();
        }
    }

    /// Drop every native object. Ids are forgotten, not destroyed: they died with the device.
    fn teardown_native(&mut self) {
        self.vertices.invalidate();
        self.indices.invalidate();
        for (_, buffer) in self.buffers.iter_mut() {
            buffer.invalidate_native();
        }
        self.state.invalidate();
        debug!(
            forgotten = self.releases.len(),
            buffers = self.buffers.len(),
            "native resources dropped after device loss"
        );
        self.releases.forget();
    }
}

impl<D: NativeDevice> Drop for TranslationContext<D> {
    fn drop(&mut self) {
        if !self.coordinator.is_active() {
            return;
        }
        self.vertices.invalidate();
        self.indices.invalidate();
        for (_, buffer) in self.buffers.iter_mut() {
            buffer.invalidate_native();
        }
        self.state.release(&mut self.device);
        self.releases.drain_into(&mut self.device);
    }
}

impl<D: NativeDevice> std::fmt::Debug for TranslationContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationContext")
            .field("state", &self.coordinator.state())
            .field("buffers", &self.buffers.len())
            .field("pending_releases", &self.releases.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::hal::{DeviceCaps, FailPoint, RecordingDevice};
    use crate::vertex::format_map::AttributeFormat;

    fn context(caps: DeviceCaps) -> TranslationContext<RecordingDevice> {
        TranslationContext::new(RecordingDevice::new(caps), TranslatorConfig::for_tests())
    }

    #[test]
    fn deleting_a_buffer_destroys_its_native_mirror() {
        let mut ctx = context(DeviceCaps::modern());
        let name = ctx.create_buffer();
        ctx.buffer_data(name, &[0u8; 48], BufferUsage::Dynamic)
            .unwrap();
        let attrs = [VertexAttribute::buffer(AttributeFormat::float(3), name, 12, 0)];
        let out = ctx.prepare_vertex_data(&attrs, 0b1, 0, 4, 0).unwrap();
        assert!(ctx.device().buffer_contents(out[0].buffer).is_some());

        assert!(ctx.delete_buffer(name));
        assert!(ctx.device().buffer_contents(out[0].buffer).is_none());
        assert!(!ctx.delete_buffer(name));
    }

    #[test]
    fn sub_data_out_of_range_is_invalid() {
        let mut ctx = context(DeviceCaps::d3d9_class());
        let name = ctx.create_buffer();
        ctx.buffer_data(name, &[0u8; 8], BufferUsage::Dynamic)
            .unwrap();
        assert!(ctx.buffer_sub_data(name, 4, &[1, 2, 3, 4]).is_ok());
        assert!(matches!(
            ctx.buffer_sub_data(name, 6, &[1, 2, 3, 4]),
            Err(TranslateError::InvalidOperation(_))
        ));
    }

    #[test]
    fn device_loss_during_translation_surfaces_as_context_lost() {
        let mut ctx = context(DeviceCaps::d3d9_class());
        ctx.device_mut()
            .fail_next(FailPoint::CreateBuffer, DeviceError::DeviceRemoved);
        let data = [0u8; 24];
        let attrs = [VertexAttribute::client(AttributeFormat::float(3), &data, 0)];

        assert_eq!(
            ctx.prepare_vertex_data(&attrs, 0b1, 0, 2, 0),
            Err(TranslateError::ContextLost)
        );
        assert_eq!(ctx.device_state(), DeviceState::Lost);
        assert_eq!(
            ctx.counting_indices(3).unwrap_err(),
            TranslateError::ContextLost
        );
        assert_eq!(ctx.stats().snapshot().device_losses, 1);
    }

    #[test]
    fn allocation_failure_is_out_of_memory_and_retryable() {
        let mut ctx = context(DeviceCaps::d3d9_class());
        ctx.device_mut()
            .fail_next(FailPoint::CreateBuffer, DeviceError::OutOfVideoMemory);
        assert!(matches!(
            ctx.counting_indices(6),
            Err(TranslateError::OutOfMemory(_))
        ));
        assert!(!ctx.is_lost());
        assert_eq!(ctx.counting_indices(6).unwrap().count, 6);
    }

    #[test]
    fn invalidated_translators_release_their_buffers() {
        let mut ctx = context(DeviceCaps::d3d9_class());
        ctx.counting_indices(4).unwrap();
        assert_eq!(ctx.device().live_buffers(), 1);
        ctx.vertices.invalidate();
        ctx.indices.invalidate();
        ctx.flush_releases();
        assert_eq!(ctx.device().live_buffers(), 0);
    }
}
