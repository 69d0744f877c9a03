//! Redundant device-state elimination.
//!
//! [`DeviceStateCache`] remembers the last value applied for each state category and only calls
//! into the backend when the new value differs. A category that has not been applied since
//! creation (or since [`DeviceStateCache::force_all`]) is unknown and always applied.

mod layout_cache;
pub mod types;

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::debug;

use crate::error::{Result, TranslateError};
use crate::hal::{
    IndexBufferBinding, LayoutId, NativeDevice, ProgramId, TextureId, VertexBufferBinding,
    VertexElement, VertexLayout,
};
use crate::index::TranslatedIndexData;
use crate::serial::Serial;
use crate::stats::TranslateStats;
use crate::vertex::TranslatedAttribute;

pub use self::layout_cache::{LayoutCache, VERTEX_LAYOUT_CACHE_CAPACITY};
use self::types::{
    BlendState, ColorF, DepthStencilState, RasterizerState, SamplerState, ScissorRect,
    ShaderStage, Viewport,
};

/// Last-applied value of every state category. `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStateSnapshot {
    pub rasterizer: Option<RasterizerState>,
    pub blend: Option<(BlendState, ColorF, u32)>,
    pub depth_stencil: Option<(DepthStencilState, u32, u32)>,
    pub scissor: Option<Option<ScissorRect>>,
    pub viewport: Option<Viewport>,
    pub samplers: HashMap<(ShaderStage, u32), SamplerState>,
    pub textures: HashMap<(ShaderStage, u32), Option<(TextureId, Serial)>>,
    pub program: Option<Option<(ProgramId, Serial)>>,
    pub vertex_layout: Option<Option<LayoutId>>,
    pub vertex_buffers: HashMap<u32, Option<(VertexBufferBinding, Serial)>>,
    pub index_buffer: Option<Option<(IndexBufferBinding, Serial)>>,
}

#[derive(Debug)]
pub struct DeviceStateCache {
    snapshot: DeviceStateSnapshot,
    layouts: LayoutCache,
    diffing: bool,
    stats: Arc<TranslateStats>,
}

impl DeviceStateCache {
    pub fn new(diffing: bool, stats: Arc<TranslateStats>) -> Self {
        Self {
            snapshot: DeviceStateSnapshot::default(),
            layouts: LayoutCache::new(stats.clone()),
            diffing,
            stats,
        }
    }

    pub fn snapshot(&self) -> &DeviceStateSnapshot {
        &self.snapshot
    }

    pub fn layouts(&self) -> &LayoutCache {
        &self.layouts
    }

    pub fn is_diffing(&self) -> bool {
        self.diffing
    }

    /// Make the next apply of every category unconditional.
    pub fn force_all(&mut self) {
        debug!("device state cache forced; every category will be re-applied");
        self.snapshot = DeviceStateSnapshot::default();
    }

    /// Device loss: the snapshot and the native layouts are gone.
    pub fn invalidate(&mut self) {
        self.force_all();
        self.layouts.forget();
    }

    /// Returns `true` if `value` must be sent to the backend, recording it as applied.
    fn changed<T: PartialEq>(&self, slot: &mut Option<T>, value: T) -> bool {
        if self.diffing && slot.as_ref() == Some(&value) {
            self.stats.inc_state_calls_skipped();
            return false;
        }
        *slot = Some(value);
        self.stats.inc_state_calls_issued();
        true
    }

    pub fn apply_rasterizer(
        &mut self,
        device: &mut dyn NativeDevice,
        state: &RasterizerState,
    ) -> bool {
        let mut slot = self.snapshot.rasterizer.take();
        let changed = self.changed(&mut slot, *state);
        self.snapshot.rasterizer = slot;
        if changed {
            device.set_rasterizer_state(state);
        }
        changed
    }

    pub fn apply_blend(
        &mut self,
        device: &mut dyn NativeDevice,
        state: &BlendState,
        color: ColorF,
        sample_mask: u32,
    ) -> bool {
        let mut slot = self.snapshot.blend.take();
        let changed = self.changed(&mut slot, (*state, color, sample_mask));
        self.snapshot.blend = slot;
        if changed {
            device.set_blend_state(state, color, sample_mask);
        }
        changed
    }

    pub fn apply_depth_stencil(
        &mut self,
        device: &mut dyn NativeDevice,
        state: &DepthStencilState,
        stencil_ref: u32,
        stencil_back_ref: u32,
    ) -> bool {
        let mut slot = self.snapshot.depth_stencil.take();
        let changed = self.changed(&mut slot, (*state, stencil_ref, stencil_back_ref));
        self.snapshot.depth_stencil = slot;
        if changed {
            device.set_depth_stencil_state(state, stencil_ref, stencil_back_ref);
        }
        changed
    }

    /// `None` disables the scissor test.
    pub fn apply_scissor(
        &mut self,
        device: &mut dyn NativeDevice,
        rect: Option<ScissorRect>,
    ) -> bool {
        let mut slot = self.snapshot.scissor.take();
        let changed = self.changed(&mut slot, rect);
        self.snapshot.scissor = slot;
        if changed {
            device.set_scissor_rect(rect);
        }
        changed
    }

    pub fn apply_viewport(&mut self, device: &mut dyn NativeDevice, viewport: &Viewport) -> bool {
        let mut slot = self.snapshot.viewport.take();
        let changed = self.changed(&mut slot, *viewport);
        self.snapshot.viewport = slot;
        if changed {
            device.set_viewport(viewport);
        }
        changed
    }

    pub fn apply_sampler(
        &mut self,
        device: &mut dyn NativeDevice,
        stage: ShaderStage,
        unit: u32,
        state: &SamplerState,
    ) -> Result<bool> {
        check_unit(device, unit)?;
        let mut slot = self.snapshot.samplers.remove(&(stage, unit));
        let changed = self.changed(&mut slot, *state);
        if let Some(state) = slot {
            self.snapshot.samplers.insert((stage, unit), state);
        }
        if changed {
            device.set_sampler_state(stage, unit, state);
        }
        Ok(changed)
    }

    /// Textures compare by `(id, Serial)`: re-specifying a texture's contents rebinds it.
    pub fn apply_texture(
        &mut self,
        device: &mut dyn NativeDevice,
        stage: ShaderStage,
        unit: u32,
        texture: Option<(TextureId, Serial)>,
    ) -> Result<bool> {
        check_unit(device, unit)?;
        let mut slot = self.snapshot.textures.remove(&(stage, unit));
        let changed = self.changed(&mut slot, texture);
        if let Some(texture) = slot {
            self.snapshot.textures.insert((stage, unit), texture);
        }
        if changed {
            device.set_texture(stage, unit, texture.map(|(id, _)| id));
        }
        Ok(changed)
    }

    pub fn apply_program(
        &mut self,
        device: &mut dyn NativeDevice,
        program: Option<(ProgramId, Serial)>,
    ) -> bool {
        let mut slot = self.snapshot.program.take();
        let changed = self.changed(&mut slot, program);
        self.snapshot.program = slot;
        if changed {
            device.set_program(program.map(|(id, _)| id));
        }
        changed
    }

    pub fn apply_vertex_layout(
        &mut self,
        device: &mut dyn NativeDevice,
        layout: Option<&VertexLayout>,
    ) -> Result<bool> {
        let id = match layout {
            Some(layout) => Some(self.layouts.get_or_create(device, layout)?),
            None => None,
        };
        let mut slot = self.snapshot.vertex_layout.take();
        let changed = self.changed(&mut slot, id);
        self.snapshot.vertex_layout = slot;
        if changed {
            device.set_vertex_layout(id);
        }
        Ok(changed)
    }

    pub fn apply_vertex_buffer(
        &mut self,
        device: &mut dyn NativeDevice,
        slot: u32,
        binding: Option<(VertexBufferBinding, Serial)>,
    ) -> bool {
        let mut current = self.snapshot.vertex_buffers.remove(&slot);
        let changed = self.changed(&mut current, binding);
        if let Some(current) = current {
            self.snapshot.vertex_buffers.insert(slot, current);
        }
        if changed {
            device.set_vertex_buffer(slot, binding.map(|(b, _)| b));
        }
        changed
    }

    /// Bind a draw's translated attributes: the native layout built from their formats, one
    /// vertex buffer per attribute, and unbind slots a previous draw used but this one does not.
    pub fn apply_translated_attributes(
        &mut self,
        device: &mut dyn NativeDevice,
        attributes: &[TranslatedAttribute],
    ) -> Result<()> {
        let layout = VertexLayout {
            elements: attributes
                .iter()
                .map(|a| VertexElement {
                    slot: a.slot,
                    format: a.format,
                    divisor: a.divisor,
                })
                .collect(),
        };
        self.apply_vertex_layout(device, Some(&layout))?;

        for attribute in attributes {
            let binding = VertexBufferBinding {
                buffer: attribute.buffer,
                offset: attribute.offset,
                stride: attribute.stride,
            };
            self.apply_vertex_buffer(device, attribute.slot, Some((binding, attribute.serial)));
        }

        let mut stale: Vec<u32> = self
            .snapshot
            .vertex_buffers
            .iter()
            .filter(|(slot, binding)| {
                binding.is_some() && !attributes.iter().any(|a| a.slot == **slot)
            })
            .map(|(&slot, _)| slot)
            .collect();
        stale.sort_unstable();
        for slot in stale {
            self.apply_vertex_buffer(device, slot, None);
        }
        Ok(())
    }

    pub fn apply_index_buffer(
        &mut self,
        device: &mut dyn NativeDevice,
        indices: Option<&TranslatedIndexData>,
    ) -> bool {
        let binding = indices.map(|data| {
            (
                IndexBufferBinding {
                    buffer: data.buffer,
                    format: data.format,
                    offset: data.start_offset,
                },
                data.serial,
            )
        });
        let mut slot = self.snapshot.index_buffer.take();
        let changed = self.changed(&mut slot, binding);
        self.snapshot.index_buffer = slot;
        if changed {
            device.set_index_buffer(binding.map(|(b, _)| b));
        }
        changed
    }

    /// Destroy native objects owned by the cache.
    pub fn release(&mut self, device: &mut dyn NativeDevice) {
        self.layouts.destroy_all(device);
        self.snapshot.vertex_layout = None;
    }
}

fn check_unit(device: &dyn NativeDevice, unit: u32) -> Result<()> {
    let max = device.capabilities().max_texture_units;
    if unit >= max {
        return Err(TranslateError::invalid(format!(
            "texture unit {unit} exceeds the device limit of {max}"
        )));
    }
    Ok(())
}
