//! Index translation: direct binding, static conversion with range caching, or streaming.

pub mod range;
pub mod topology;

use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::{Buffer, BufferName, BufferRegistry};
use crate::config::TranslatorConfig;
use crate::error::{Result, TranslateError};
use crate::hal::{
    BufferHandle, BufferId, DeviceCaps, IndexFormat, NativeDevice, NativeUsage, ReleaseQueue,
};
use crate::serial::Serial;
use crate::static_buffer::StaticIndexBuffer;
use crate::stats::TranslateStats;
use crate::stream::{align_up, StreamingBuffer, STREAM_ALIGNMENT};

use self::range::{compute_range, convert_indices, indices, pack_indices};
use self::topology::{emulate, PrimitiveEmulation};

/// Client index element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U8,
    U16,
    U32,
}

impl IndexType {
    pub fn byte_size(self) -> u64 {
        match self {
            IndexType::U8 => 1,
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }

    /// Native format indices of this type are translated to. 8-bit indices widen to 16-bit.
    pub fn native_format(self, caps: &DeviceCaps) -> Result<IndexFormat> {
        match self {
            IndexType::U8 | IndexType::U16 => Ok(IndexFormat::U16),
            IndexType::U32 if caps.index_u32 => Ok(IndexFormat::U32),
            IndexType::U32 => Err(TranslateError::invalid(
                "32-bit indices are not supported by the device",
            )),
        }
    }
}

/// Inclusive `[min, max]` of the indices referenced by a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexRange {
    pub min: u32,
    pub max: u32,
}

/// Where a draw's indices come from.
#[derive(Debug, Clone, Copy)]
pub enum IndexSource<'a> {
    /// Byte `offset` into a client buffer.
    Buffer { name: BufferName, offset: u64 },
    /// Client memory.
    Client(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPath {
    Direct,
    StaticHit,
    StaticMiss,
    Streamed,
    Counting,
}

/// Native index binding for one draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatedIndexData {
    pub format: IndexFormat,
    pub min_index: u32,
    pub max_index: u32,
    /// Index count to draw. Differs from the requested count for emulated primitives.
    pub count: u32,
    pub start_index: u32,
    pub start_offset: u64,
    pub buffer: BufferId,
    pub serial: Serial,
    pub path: IndexPath,
}

#[derive(Debug)]
struct CountingIndices {
    handle: BufferHandle,
    format: IndexFormat,
    count: u32,
    serial: Serial,
}

#[derive(Debug)]
pub struct IndexTranslator {
    stream_u16: StreamingBuffer,
    stream_u32: StreamingBuffer,
    counting: Option<CountingIndices>,
    releases: ReleaseQueue,
    stats: Arc<TranslateStats>,
    direct_binding: bool,
    promotion_factor: u64,
}

impl IndexTranslator {
    pub fn new(
        config: &TranslatorConfig,
        releases: ReleaseQueue,
        stats: Arc<TranslateStats>,
    ) -> Self {
        let stream = |label| {
            StreamingBuffer::new(
                label,
                NativeUsage::INDEX,
                config.initial_index_stream_size,
                releases.clone(),
                stats.clone(),
            )
        };
        Self {
            stream_u16: stream("index16"),
            stream_u32: stream("index32"),
            counting: None,
            releases: releases.clone(),
            stats: stats.clone(),
            direct_binding: config.direct_binding,
            promotion_factor: config.static_promotion_factor,
        }
    }

    pub fn stream(&self, format: IndexFormat) -> &StreamingBuffer {
        match format {
            IndexFormat::U16 => &self.stream_u16,
            IndexFormat::U32 => &self.stream_u32,
        }
    }

    fn stream_mut(&mut self, format: IndexFormat) -> &mut StreamingBuffer {
        match format {
            IndexFormat::U16 => &mut self.stream_u16,
            IndexFormat::U32 => &mut self.stream_u32,
        }
    }

    /// Translate `count` indices of `index_type` from `source`.
    pub fn prepare(
        &mut self,
        device: &mut dyn NativeDevice,
        buffers: &mut BufferRegistry,
        index_type: IndexType,
        count: u32,
        source: IndexSource<'_>,
    ) -> Result<TranslatedIndexData> {
        let format = index_type.native_format(&device.capabilities())?;
        let byte_len = u64::from(count) * index_type.byte_size();

        match source {
            IndexSource::Client(bytes) => {
                if (bytes.len() as u64) < byte_len {
                    return Err(TranslateError::invalid(
                        "client index array is smaller than the index count",
                    ));
                }
                self.stats.inc_index_range_scans();
                let range = compute_range(index_type, bytes, count);
                self.stream_indices(device, index_type, format, bytes, count, range)
            }
            IndexSource::Buffer { name, offset } => {
                let buffer = buffers
                    .get_mut(name)
                    .ok_or_else(|| TranslateError::invalid(format!("unknown buffer {name:?}")))?;
                self.prepare_from_buffer(device, buffer, index_type, format, count, offset)
            }
        }
    }

    fn prepare_from_buffer(
        &mut self,
        device: &mut dyn NativeDevice,
        buffer: &mut Buffer,
        index_type: IndexType,
        format: IndexFormat,
        count: u32,
        offset: u64,
    ) -> Result<TranslatedIndexData> {
        let src_size = index_type.byte_size();
        let byte_len = u64::from(count) * src_size;
        let end = offset
            .checked_add(byte_len)
            .filter(|&end| end <= buffer.size())
            .ok_or_else(|| TranslateError::invalid("index range exceeds buffer size"))?;
        let aligned = offset % src_size == 0;
        buffer.validate_statics(&self.stats);

        if aligned
            && self.direct_binding
            && buffer.storage().supports_direct_binding()
            && format.byte_size() == src_size
        {
            let range = buffer.index_range(index_type, offset, count, &self.stats);
            let id = buffer
                .storage_mut()
                .native_buffer(device, &self.releases, NativeUsage::INDEX)?;
            self.stats.inc_index_direct_binds();
            return Ok(TranslatedIndexData {
                format,
                min_index: range.min,
                max_index: range.max,
                count,
                start_index: (offset / src_size) as u32,
                start_offset: offset,
                buffer: id,
                serial: buffer.serial(),
                path: IndexPath::Direct,
            });
        }

        if aligned && buffer.is_promoted() {
            if buffer.static_index().is_none() {
                let serial = buffer.serial();
                buffer.set_static_index(StaticIndexBuffer::new(index_type, format, serial));
            }
            if let Some(translated) =
                self.prepare_static(device, buffer, index_type, format, count, offset)?
            {
                return Ok(translated);
            }
        }

        self.stats.inc_index_range_scans();
        let src = &buffer.data()[offset as usize..end as usize];
        let range = compute_range(index_type, src, count);
        let translated = self.stream_indices(device, index_type, format, src, count, range)?;
        buffer.mark_streamed(byte_len, self.promotion_factor, &self.stats);
        Ok(translated)
    }

    /// Static path. `None` when the static buffer holds another index type or is empty.
    fn prepare_static(
        &mut self,
        device: &mut dyn NativeDevice,
        buffer: &mut Buffer,
        index_type: IndexType,
        format: IndexFormat,
        count: u32,
        offset: u64,
    ) -> Result<Option<TranslatedIndexData>> {
        let (data, statics) = buffer.static_index_source();
        let Some(statics) = statics else {
            return Ok(None);
        };
        if statics.source_type() != index_type {
            return Ok(None);
        }

        let src_size = index_type.byte_size();
        let dst_size = format.byte_size();
        let output_offset = offset / src_size * dst_size;

        let path = if statics.is_populated() {
            IndexPath::StaticHit
        } else {
            let total = u32::try_from(data.len() as u64 / src_size)
                .map_err(|_| TranslateError::OutOfMemory("converting static index buffer"))?;
            let mut converted = vec![0u8; total as usize * dst_size as usize];
            convert_indices(index_type, format, data, total, &mut converted);
            statics.reserve(converted.len() as u64);
            statics.store(device, &self.releases, &converted)?;
            self.stats.inc_conversions();
            debug!(?index_type, indices = total, "index buffer converted to static");
            IndexPath::StaticMiss
        };
        let Some(id) = statics.buffer_id() else {
            return Ok(None);
        };

        let range = match statics.lookup(offset, count) {
            Some(cached) => cached.range,
            None => {
                self.stats.inc_index_range_scans();
                let range = compute_range(index_type, &data[offset as usize..], count);
                statics.add_range(offset, count, range, output_offset);
                range
            }
        };

        match path {
            IndexPath::StaticHit => self.stats.inc_index_static_hits(),
            _ => self.stats.inc_index_static_misses(),
        }
        Ok(Some(TranslatedIndexData {
            format,
            min_index: range.min,
            max_index: range.max,
            count,
            start_index: (output_offset / dst_size) as u32,
            start_offset: output_offset,
            buffer: id,
            serial: statics.serial(),
            path,
        }))
    }

    fn stream_indices(
        &mut self,
        device: &mut dyn NativeDevice,
        index_type: IndexType,
        format: IndexFormat,
        src: &[u8],
        count: u32,
        range: IndexRange,
    ) -> Result<TranslatedIndexData> {
        let dst_size = format.byte_size();
        let stream = self.stream_mut(format);
        let mut write = stream.map(device, u64::from(count) * dst_size)?;
        convert_indices(index_type, format, src, count, write.bytes_mut());
        let alloc = write.unmap()?;

        self.stats.inc_index_streamed();
        if index_type.byte_size() != dst_size {
            self.stats.inc_conversions();
        }
        trace!(?format, count, offset = alloc.offset, "indices streamed");
        Ok(TranslatedIndexData {
            format,
            min_index: range.min,
            max_index: range.max,
            count,
            start_index: (alloc.offset / dst_size) as u32,
            start_offset: alloc.offset,
            buffer: alloc.buffer,
            serial: alloc.serial,
            path: IndexPath::Streamed,
        })
    }

    /// Rewrite a draw's indices for a primitive mode the backend lacks and stream the result.
    ///
    /// `indices` is `None` for a non-indexed draw of `count` vertices.
    pub fn prepare_emulated(
        &mut self,
        device: &mut dyn NativeDevice,
        buffers: &BufferRegistry,
        emulation: PrimitiveEmulation,
        indices_source: Option<(IndexType, IndexSource<'_>)>,
        count: u32,
    ) -> Result<TranslatedIndexData> {
        let logical: Vec<u32> = match indices_source {
            None => (0..count).collect(),
            Some((index_type, source)) => {
                let byte_len = u64::from(count) * index_type.byte_size();
                let bytes = match source {
                    IndexSource::Client(bytes) => bytes,
                    IndexSource::Buffer { name, offset } => {
                        let buffer = buffers.get(name).ok_or_else(|| {
                            TranslateError::invalid(format!("unknown buffer {name:?}"))
                        })?;
                        buffer.data().get(offset as usize..).unwrap_or(&[])
                    }
                };
                if (bytes.len() as u64) < byte_len {
                    return Err(TranslateError::invalid("index range exceeds source size"));
                }
                indices(index_type, bytes, count).collect()
            }
        };

        let expanded = emulate(emulation, &logical);
        let range = IndexRange {
            min: expanded.iter().copied().min().unwrap_or(0),
            max: expanded.iter().copied().max().unwrap_or(0),
        };
        let format = if range.max <= u32::from(u16::MAX) {
            IndexFormat::U16
        } else if device.capabilities().index_u32 {
            IndexFormat::U32
        } else {
            return Err(TranslateError::invalid(
                "emulated primitive needs 32-bit indices, which the device lacks",
            ));
        };

        let packed = pack_indices(format, &expanded);
        let alloc = self.stream_mut(format).write(device, &packed)?;
        self.stats.inc_index_streamed();
        self.stats.inc_conversions();
        Ok(TranslatedIndexData {
            format,
            min_index: range.min,
            max_index: range.max,
            count: expanded.len() as u32,
            start_index: (alloc.offset / format.byte_size()) as u32,
            start_offset: alloc.offset,
            buffer: alloc.buffer,
            serial: alloc.serial,
            path: IndexPath::Streamed,
        })
    }

    /// Indices `0..count`, cached and regenerated only when a longer sequence is requested.
    pub fn counting_indices(
        &mut self,
        device: &mut dyn NativeDevice,
        count: u32,
    ) -> Result<TranslatedIndexData> {
        let reusable = self.counting.as_ref().is_some_and(|c| c.count >= count);
        if !reusable {
            let format = if count <= 0x1_0000 {
                IndexFormat::U16
            } else if device.capabilities().index_u32 {
                IndexFormat::U32
            } else {
                return Err(TranslateError::invalid(
                    "counting indices beyond 65536 need 32-bit index support",
                ));
            };
            let values: Vec<u32> = (0..count).collect();
            let packed = pack_indices(format, &values);
            let size = align_up((packed.len() as u64).max(STREAM_ALIGNMENT), STREAM_ALIGNMENT);
            let handle = BufferHandle::create(device, &self.releases, NativeUsage::INDEX, size)
                .map_err(|err| TranslateError::from_device(err, "allocating counting indices"))?;
            let mut padded = packed;
            padded.resize(size as usize, 0);
            device
                .write_buffer(handle.id(), 0, &padded)
                .map_err(|err| TranslateError::from_device(err, "uploading counting indices"))?;
            debug!(count, ?format, "counting index buffer rebuilt");
            self.stats.inc_counting_index_rebuilds();
            self.counting = Some(CountingIndices {
                handle,
                format,
                count,
                serial: Serial::issue(),
            });
        }

        let Some(counting) = &self.counting else {
            return Err(TranslateError::OutOfMemory("allocating counting indices"));
        };
        Ok(TranslatedIndexData {
            format: counting.format,
            min_index: 0,
            max_index: count.saturating_sub(1),
            count,
            start_index: 0,
            start_offset: 0,
            buffer: counting.handle.id(),
            serial: counting.serial,
            path: IndexPath::Counting,
        })
    }

    /// Device loss: drop every native buffer.
    pub fn invalidate(&mut self) {
        self.stream_u16.invalidate();
        self.stream_u32.invalidate();
        self.counting = None;
    }
}
