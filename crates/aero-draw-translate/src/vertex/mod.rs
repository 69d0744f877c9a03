//! Vertex attribute translation.
//!
//! Each active attribute is bound in one of four ways, cheapest first:
//!
//! - direct: the buffer storage is bound in place (no copy, no conversion);
//! - static: a whole-buffer conversion cached on the buffer and reused across draws;
//! - streamed: the referenced elements are converted into the vertex streaming buffer;
//! - current value: a disabled attribute's constant, streamed once per change.
//!
//! Translation runs in three phases (plan, reserve, execute) so the streaming buffer discards or
//! grows at most once per draw and every validation error is reported before any upload.

pub mod current_value;
pub mod format_map;

use std::sync::Arc;

use tracing::debug;

use crate::buffer::{Buffer, BufferName, BufferRegistry};
use crate::config::TranslatorConfig;
use crate::error::{Result, TranslateError};
use crate::hal::{
    BufferId, DeviceCaps, NativeDevice, NativeUsage, NativeVertexFormat, ReleaseQueue,
};
use crate::serial::Serial;
use crate::static_buffer::StaticAttributeKey;
use crate::stats::TranslateStats;
use crate::stream::StreamingBuffer;

use self::current_value::CurrentValueCache;
use self::format_map::{AttributeFormat, ConversionPlan};

pub use self::current_value::CurrentValue;

/// Where an attribute's array lives.
#[derive(Debug, Clone, Copy, Default)]
pub enum AttributeSource<'a> {
    #[default]
    None,
    Buffer(BufferName),
    Client(&'a [u8]),
}

/// Client description of one vertex attribute.
#[derive(Debug, Clone, Copy)]
pub struct VertexAttribute<'a> {
    pub enabled: bool,
    pub format: AttributeFormat,
    /// Bytes between consecutive elements; 0 means tightly packed.
    pub stride: u32,
    pub offset: u64,
    /// 0 for per-vertex data, otherwise elements advance once per `divisor` instances.
    pub divisor: u32,
    pub source: AttributeSource<'a>,
    pub current_value: CurrentValue,
}

impl Default for VertexAttribute<'_> {
    fn default() -> Self {
        Self {
            enabled: false,
            format: AttributeFormat::float(4),
            stride: 0,
            offset: 0,
            divisor: 0,
            source: AttributeSource::None,
            current_value: CurrentValue::default(),
        }
    }
}

impl<'a> VertexAttribute<'a> {
    pub fn buffer(format: AttributeFormat, name: BufferName, stride: u32, offset: u64) -> Self {
        Self {
            enabled: true,
            format,
            stride,
            offset,
            source: AttributeSource::Buffer(name),
            ..Self::default()
        }
    }

    pub fn client(format: AttributeFormat, data: &'a [u8], stride: u32) -> Self {
        Self {
            enabled: true,
            format,
            stride,
            source: AttributeSource::Client(data),
            ..Self::default()
        }
    }

    pub fn constant(value: CurrentValue) -> Self {
        Self {
            current_value: value,
            ..Self::default()
        }
    }

    pub fn effective_stride(&self) -> u32 {
        if self.stride == 0 {
            self.format.byte_size()
        } else {
            self.stride
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributePath {
    Direct,
    StaticHit,
    StaticMiss,
    Streamed,
    CurrentValue,
}

/// Native binding of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatedAttribute {
    pub slot: u32,
    pub format: NativeVertexFormat,
    pub buffer: BufferId,
    pub serial: Serial,
    pub offset: u64,
    /// 0 for current values.
    pub stride: u32,
    pub divisor: u32,
    pub path: AttributePath,
}

#[derive(Debug, Clone, Copy)]
enum Plan {
    Current,
    Direct,
    Static {
        key: StaticAttributeKey,
        stored: Option<u64>,
    },
    Streamed,
}

#[derive(Debug, Clone, Copy)]
struct AttributePlan {
    slot: u32,
    conversion: ConversionPlan,
    stride: u32,
    /// First element read, relative to the attribute offset.
    start: u64,
    elements: u64,
    /// Byte offset of element `start` in the source.
    begin: u64,
    plan: Plan,
}

/// Byte range `[begin, end)` read by `elements` elements of `stride` starting at element `start`.
/// `elements` must be non-zero. `None` when the range does not fit in a `u64`.
fn read_span(
    offset: u64,
    start: u64,
    elements: u64,
    stride: u32,
    element_size: u32,
) -> Option<(u64, u64)> {
    let stride = u64::from(stride);
    let begin = offset.checked_add(start.checked_mul(stride)?)?;
    let end = (elements - 1)
        .checked_mul(stride)?
        .checked_add(u64::from(element_size))?
        .checked_add(begin)?;
    Some((begin, end))
}

/// Elements of `stride` starting at `base` that fit in `size` bytes.
fn elements_in_buffer(size: u64, base: u64, stride: u32, element_size: u32) -> u64 {
    let element_size = u64::from(element_size);
    if size < base + element_size {
        return 0;
    }
    (size - base - element_size) / u64::from(stride) + 1
}

#[derive(Debug)]
pub struct VertexTranslator {
    stream: StreamingBuffer,
    current_values: CurrentValueCache,
    releases: ReleaseQueue,
    stats: Arc<TranslateStats>,
    direct_binding: bool,
    promotion_factor: u64,
}

impl VertexTranslator {
    pub fn new(
        config: &TranslatorConfig,
        releases: ReleaseQueue,
        stats: Arc<TranslateStats>,
    ) -> Self {
        Self {
            stream: StreamingBuffer::new(
                "vertex",
                NativeUsage::VERTEX,
                config.initial_vertex_stream_size,
                releases.clone(),
                stats.clone(),
            ),
            current_values: CurrentValueCache::new(
                config.current_value_stream_size,
                releases.clone(),
                stats.clone(),
            ),
            releases,
            stats,
            direct_binding: config.direct_binding,
            promotion_factor: config.static_promotion_factor,
        }
    }

    pub fn stream(&self) -> &StreamingBuffer {
        &self.stream
    }

    /// Translate every attribute whose bit is set in `active_mask`.
    ///
    /// Per-vertex attributes start at element `first_vertex`; instanced attributes (non-zero
    /// divisor with `instance_count > 0`) read `ceil(instance_count / divisor)` elements from
    /// element 0.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &mut self,
        device: &mut dyn NativeDevice,
        buffers: &mut BufferRegistry,
        attributes: &[VertexAttribute<'_>],
        active_mask: u32,
        first_vertex: u32,
        vertex_count: u32,
        instance_count: u32,
    ) -> Result<Vec<TranslatedAttribute>> {
        let caps = device.capabilities();
        if let Some(slot) = (0..32u32)
            .filter(|slot| active_mask & (1 << slot) != 0)
            .find(|&slot| slot as usize >= attributes.len() || slot >= caps.max_vertex_attributes)
        {
            return Err(TranslateError::invalid(format!(
                "active attribute {slot} is out of range"
            )));
        }

        let mut plans = Vec::new();
        for (slot, attribute) in attributes.iter().enumerate().take(32) {
            if active_mask & (1 << slot) == 0 {
                continue;
            }
            plans.push(self.plan_attribute(
                &caps,
                buffers,
                slot as u32,
                attribute,
                first_vertex,
                vertex_count,
                instance_count,
            )?);
        }

        if let Err(err) = self.reserve(buffers, attributes, &mut plans) {
            self.stream.cancel_reservation();
            return Err(err);
        }

        let mut translated = Vec::with_capacity(plans.len());
        for plan in &plans {
            let attribute = &attributes[plan.slot as usize];
            match self.execute(device, buffers, attribute, plan) {
                Ok(t) => translated.push(t),
                Err(err) => {
                    self.stream.cancel_reservation();
                    return Err(err);
                }
            }
        }
        Ok(translated)
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_attribute(
        &self,
        caps: &DeviceCaps,
        buffers: &mut BufferRegistry,
        slot: u32,
        attribute: &VertexAttribute<'_>,
        first_vertex: u32,
        vertex_count: u32,
        instance_count: u32,
    ) -> Result<AttributePlan> {
        let conversion = ConversionPlan::new(attribute.format, caps.vertex_formats);
        if !attribute.enabled {
            return Ok(AttributePlan {
                slot,
                conversion,
                stride: 0,
                start: 0,
                elements: 0,
                begin: 0,
                plan: Plan::Current,
            });
        }

        let element_size = attribute.format.byte_size();
        if attribute.stride != 0 && attribute.stride < element_size {
            return Err(TranslateError::invalid(format!(
                "attribute {slot}: stride {} is smaller than the element size {element_size}",
                attribute.stride
            )));
        }
        let stride = attribute.effective_stride();
        if attribute.divisor > 1 && !caps.instance_divisors {
            return Err(TranslateError::invalid(format!(
                "attribute {slot}: instance divisor {} is not supported by the device",
                attribute.divisor
            )));
        }

        let (start, elements) = if attribute.divisor > 0 && instance_count > 0 {
            (0, u64::from(instance_count.div_ceil(attribute.divisor)))
        } else {
            (u64::from(first_vertex), u64::from(vertex_count))
        };
        // Zero-element draws read nothing.
        let (begin, required) = if elements == 0 {
            (attribute.offset, 0)
        } else {
            read_span(attribute.offset, start, elements, stride, element_size).ok_or_else(|| {
                TranslateError::invalid(format!(
                    "attribute {slot}: draw reads past the addressable range"
                ))
            })?
        };

        let buffer = match attribute.source {
            AttributeSource::None => {
                return Err(TranslateError::invalid(format!(
                    "attribute {slot} is enabled but has no data source"
                )));
            }
            AttributeSource::Client(data) => {
                if (data.len() as u64) < required {
                    return Err(TranslateError::invalid(format!(
                        "attribute {slot}: client array holds {} bytes, draw reads {required}",
                        data.len()
                    )));
                }
                None
            }
            AttributeSource::Buffer(name) => {
                let buffer = buffers.get_mut(name).ok_or_else(|| {
                    TranslateError::invalid(format!("attribute {slot}: unknown buffer {name:?}"))
                })?;
                if buffer.size() < required {
                    return Err(TranslateError::invalid(format!(
                        "attribute {slot}: buffer holds {} bytes, draw reads {required}",
                        buffer.size()
                    )));
                }
                buffer.validate_statics(&self.stats);
                Some(buffer)
            }
        };

        let plan = match buffer {
            None => Plan::Streamed,
            Some(buffer) => {
                if self.direct_binding
                    && caps.direct_buffer_binding
                    && buffer.storage().supports_direct_binding()
                    && !conversion.needs_conversion()
                    && attribute.offset % caps.vertex_offset_alignment.max(1) == 0
                    && stride % caps.vertex_stride_alignment.max(1) == 0
                {
                    Plan::Direct
                } else if buffer.is_promoted() && elements > 0 {
                    let key = StaticAttributeKey {
                        format: attribute.format,
                        stride,
                        base_offset: (attribute.offset % u64::from(stride)) as u32,
                    };
                    let stored = buffer.static_vertex().and_then(|s| s.lookup(&key));
                    Plan::Static { key, stored }
                } else {
                    Plan::Streamed
                }
            }
        };

        Ok(AttributePlan {
            slot,
            conversion,
            stride,
            start,
            elements,
            begin,
            plan,
        })
    }

    /// Reserve streaming and static space for the whole draw. A static buffer that already holds
    /// other layouts cannot grow; it is dropped and every attribute it served streams instead.
    fn reserve(
        &mut self,
        buffers: &mut BufferRegistry,
        attributes: &[VertexAttribute<'_>],
        plans: &mut [AttributePlan],
    ) -> Result<()> {
        let mut dropped = Vec::new();
        for plan in plans.iter_mut() {
            let Plan::Static { key, stored: None } = plan.plan else {
                continue;
            };
            let attribute = &attributes[plan.slot as usize];
            let AttributeSource::Buffer(name) = attribute.source else {
                plan.plan = Plan::Streamed;
                continue;
            };
            let Some(buffer) = buffers.get_mut(name) else {
                plan.plan = Plan::Streamed;
                continue;
            };
            let total = elements_in_buffer(
                buffer.size(),
                u64::from(key.base_offset),
                plan.stride,
                attribute.format.byte_size(),
            );
            let out_size = u64::from(plan.conversion.output.byte_size);
            if !buffer.static_vertex_mut().reserve(total * out_size)? {
                debug!(slot = plan.slot, "static vertex buffer layout changed; dropping it");
                buffer.drop_static_vertex(&self.stats);
                dropped.push(name);
            }
        }

        for plan in plans.iter_mut() {
            if let (Plan::Static { .. }, AttributeSource::Buffer(name)) =
                (plan.plan, attributes[plan.slot as usize].source)
            {
                if dropped.contains(&name) {
                    plan.plan = Plan::Streamed;
                }
            }
            if let Plan::Streamed = plan.plan {
                let out_size = u64::from(plan.conversion.output.byte_size);
                self.stream.reserve(plan.elements * out_size)?;
            }
        }
        Ok(())
    }

    fn execute(
        &mut self,
        device: &mut dyn NativeDevice,
        buffers: &mut BufferRegistry,
        attribute: &VertexAttribute<'_>,
        plan: &AttributePlan,
    ) -> Result<TranslatedAttribute> {
        let slot = plan.slot;
        let out_size = plan.conversion.output.byte_size;
        let divisor = attribute.divisor;

        match plan.plan {
            Plan::Current => {
                let binding =
                    self.current_values
                        .fetch(device, slot, attribute.current_value)?;
                Ok(TranslatedAttribute {
                    slot,
                    format: binding.format,
                    buffer: binding.buffer,
                    serial: binding.serial,
                    offset: binding.offset,
                    stride: 0,
                    divisor: 0,
                    path: AttributePath::CurrentValue,
                })
            }
            Plan::Direct => {
                let buffer = source_buffer(buffers, attribute)?;
                let id = buffer.storage_mut().native_buffer(
                    device,
                    &self.releases,
                    NativeUsage::VERTEX,
                )?;
                self.stats.inc_vertex_direct_binds();
                Ok(TranslatedAttribute {
                    slot,
                    format: plan.conversion.output.format,
                    buffer: id,
                    serial: buffer.serial(),
                    offset: plan.begin,
                    stride: plan.stride,
                    divisor,
                    path: AttributePath::Direct,
                })
            }
            Plan::Static { key, stored } => {
                let buffer = source_buffer(buffers, attribute)?;
                let (stored, path) = match stored {
                    Some(offset) => {
                        self.stats.inc_vertex_static_hits();
                        (offset, AttributePath::StaticHit)
                    }
                    // An earlier slot of this draw may have stored the same layout.
                    None => match buffer.static_vertex().and_then(|s| s.lookup(&key)) {
                        Some(offset) => {
                            self.stats.inc_vertex_static_hits();
                            (offset, AttributePath::StaticHit)
                        }
                        None => {
                            let offset = self.convert_static(device, buffer, key, plan)?;
                            self.stats.inc_vertex_static_misses();
                            (offset, AttributePath::StaticMiss)
                        }
                    },
                };
                let statics = buffer.static_vertex_mut();
                let Some(id) = statics.buffer_id() else {
                    return Err(TranslateError::invalid(format!(
                        "attribute {slot}: buffer has no complete element"
                    )));
                };
                let first_element = attribute.offset / u64::from(plan.stride);
                Ok(TranslatedAttribute {
                    slot,
                    format: plan.conversion.output.format,
                    buffer: id,
                    serial: statics.serial(),
                    offset: stored + (first_element + plan.start) * u64::from(out_size),
                    stride: out_size,
                    divisor,
                    path,
                })
            }
            Plan::Streamed => {
                let begin = plan.begin;
                let count = plan.elements as usize;
                let alloc = match attribute.source {
                    AttributeSource::Client(data) => {
                        let src = data.get(begin as usize..).unwrap_or(&[]);
                        self.stream_elements(device, plan, src, count)?
                    }
                    AttributeSource::Buffer(_) => {
                        let buffer = source_buffer(buffers, attribute)?;
                        let src = buffer.data().get(begin as usize..).unwrap_or(&[]);
                        let alloc = self.stream_elements(device, plan, src, count)?;
                        buffer.mark_streamed(
                            plan.elements * u64::from(attribute.format.byte_size()),
                            self.promotion_factor,
                            &self.stats,
                        );
                        alloc
                    }
                    AttributeSource::None => {
                        return Err(TranslateError::invalid(format!(
                            "attribute {slot} is enabled but has no data source"
                        )));
                    }
                };
                Ok(TranslatedAttribute {
                    slot,
                    format: plan.conversion.output.format,
                    buffer: alloc.0,
                    serial: alloc.1,
                    offset: alloc.2,
                    stride: out_size,
                    divisor,
                    path: AttributePath::Streamed,
                })
            }
        }
    }

    fn stream_elements(
        &mut self,
        device: &mut dyn NativeDevice,
        plan: &AttributePlan,
        src: &[u8],
        count: usize,
    ) -> Result<(BufferId, Serial, u64)> {
        let out_size = plan.conversion.output.byte_size as usize;
        let mut write = self.stream.map(device, (count * out_size) as u64)?;
        let dst = write.bytes_mut();
        debug_assert_eq!(dst.len(), count * out_size);
        if count > 0 {
            plan.conversion
                .convert(src, plan.stride as usize, count, dst);
        }
        let alloc = write.unmap()?;
        self.stats.inc_vertex_streamed();
        if plan.conversion.needs_conversion() {
            self.stats.inc_conversions();
        }
        Ok((alloc.buffer, alloc.serial, alloc.offset))
    }

    fn convert_static(
        &mut self,
        device: &mut dyn NativeDevice,
        buffer: &mut Buffer,
        key: StaticAttributeKey,
        plan: &AttributePlan,
    ) -> Result<u64> {
        let (data, statics) = buffer.static_vertex_source();
        let base = u64::from(key.base_offset);
        let total = elements_in_buffer(
            data.len() as u64,
            base,
            plan.stride,
            plan.conversion.source.byte_size(),
        ) as usize;
        let out_size = plan.conversion.output.byte_size as usize;

        let mut converted = Vec::new();
        converted
            .try_reserve(total * out_size)
            .map_err(|_| TranslateError::OutOfMemory("converting static vertex buffer"))?;
        converted.resize(total * out_size, 0);
        if total > 0 {
            plan.conversion
                .convert(&data[base as usize..], plan.stride as usize, total, &mut converted);
        }
        let offset = statics.store_attribute(device, &self.releases, key, &converted)?;
        self.stats.inc_conversions();
        debug!(
            slot = plan.slot,
            elements = total,
            format = ?plan.conversion.output.format,
            "attribute converted into static buffer"
        );
        Ok(offset)
    }

    /// Device loss: drop the streaming buffers. Static translations live on the buffers.
    pub fn invalidate(&mut self) {
        self.stream.invalidate();
        self.current_values.invalidate();
    }
}

fn source_buffer<'r>(
    buffers: &'r mut BufferRegistry,
    attribute: &VertexAttribute<'_>,
) -> Result<&'r mut Buffer> {
    match attribute.source {
        AttributeSource::Buffer(name) => buffers
            .get_mut(name)
            .ok_or_else(|| TranslateError::invalid(format!("unknown buffer {name:?}"))),
        _ => Err(TranslateError::invalid("attribute is not sourced from a buffer")),
    }
}
