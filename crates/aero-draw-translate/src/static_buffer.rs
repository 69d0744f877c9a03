//! Whole-buffer static translations and the index range cache.

use hashbrown::HashMap;
use tracing::trace;

use crate::error::{Result, TranslateError};
use crate::hal::{BufferHandle, BufferId, IndexFormat, NativeDevice, NativeUsage, ReleaseQueue};
use crate::index::{IndexRange, IndexType};
use crate::serial::Serial;
use crate::stream::{align_up, STREAM_ALIGNMENT};
use crate::vertex::format_map::AttributeFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RangeKey {
    index_type: IndexType,
    offset: u64,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRange {
    pub range: IndexRange,
    pub output_offset: u64,
}

/// `(index type, source byte offset, count) -> (min, max, output offset)`.
///
/// Owners validate the cache against their content serial and clear it wholesale on mismatch.
#[derive(Debug, Default)]
pub struct RangeCache {
    entries: HashMap<RangeKey, CachedRange>,
}

impl RangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, index_type: IndexType, offset: u64, count: u32) -> Option<CachedRange> {
        self.entries
            .get(&RangeKey {
                index_type,
                offset,
                count,
            })
            .copied()
    }

    pub fn add_range(
        &mut self,
        index_type: IndexType,
        offset: u64,
        count: u32,
        range: IndexRange,
        output_offset: u64,
    ) {
        self.entries.insert(
            RangeKey {
                index_type,
                offset,
                count,
            },
            CachedRange {
                range,
                output_offset,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn allocate_and_upload(
    device: &mut dyn NativeDevice,
    releases: &ReleaseQueue,
    usage: NativeUsage,
    size: u64,
) -> Result<BufferHandle> {
    let size = align_up(size.max(STREAM_ALIGNMENT), STREAM_ALIGNMENT);
    BufferHandle::create(device, releases, usage, size)
        .map_err(|err| TranslateError::from_device(err, "allocating static buffer"))
}

fn padded(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize(align_up(bytes.len() as u64, STREAM_ALIGNMENT) as usize, 0);
    out
}

/// Whole-buffer conversion of an index buffer to a native index format.
#[derive(Debug)]
pub struct StaticIndexBuffer {
    source_type: IndexType,
    format: IndexFormat,
    source_serial: Serial,
    reserved: u64,
    buffer: Option<BufferHandle>,
    serial: Serial,
    ranges: RangeCache,
}

impl StaticIndexBuffer {
    pub fn new(source_type: IndexType, format: IndexFormat, source_serial: Serial) -> Self {
        Self {
            source_type,
            format,
            source_serial,
            reserved: 0,
            buffer: None,
            serial: Serial::issue(),
            ranges: RangeCache::new(),
        }
    }

    pub fn source_type(&self) -> IndexType {
        self.source_type
    }

    pub fn format(&self) -> IndexFormat {
        self.format
    }

    pub fn source_serial(&self) -> Serial {
        self.source_serial
    }

    /// Contents were converted from storage at `serial`.
    pub fn is_current(&self, serial: Serial) -> bool {
        self.source_serial == serial
    }

    pub fn is_populated(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffer_id(&self) -> Option<BufferId> {
        self.buffer.as_ref().map(BufferHandle::id)
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Record the converted size. Zero defers allocation until a non-empty store.
    pub fn reserve(&mut self, total: u64) {
        self.reserved = self.reserved.max(total);
    }

    /// Upload the converted contents of the whole source buffer.
    pub fn store(
        &mut self,
        device: &mut dyn NativeDevice,
        releases: &ReleaseQueue,
        converted: &[u8],
    ) -> Result<()> {
        if converted.is_empty() {
            return Ok(());
        }
        let handle = allocate_and_upload(
            device,
            releases,
            NativeUsage::INDEX,
            self.reserved.max(converted.len() as u64),
        )?;
        device
            .write_buffer(handle.id(), 0, &padded(converted))
            .map_err(|err| TranslateError::from_device(err, "uploading static index buffer"))?;
        trace!(id = ?handle.id(), bytes = converted.len(), "static index buffer stored");
        self.buffer = Some(handle);
        self.serial = Serial::issue();
        Ok(())
    }

    pub fn lookup(&self, offset: u64, count: u32) -> Option<CachedRange> {
        self.ranges.lookup(self.source_type, offset, count)
    }

    pub fn add_range(&mut self, offset: u64, count: u32, range: IndexRange, output_offset: u64) {
        self.ranges
            .add_range(self.source_type, offset, count, range, output_offset);
    }

    pub fn cached_ranges(&self) -> usize {
        self.ranges.len()
    }
}

/// Identity of one attribute's conversion inside a [`StaticVertexBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StaticAttributeKey {
    pub format: AttributeFormat,
    pub stride: u32,
    /// `offset % stride`: attributes that differ only by a whole number of elements share one
    /// conversion.
    pub base_offset: u32,
}

/// Whole-buffer conversions of the attributes sourced from one buffer.
///
/// Space is reserved for every attribute of the draw that first populates it; the native buffer
/// is then allocated once and never grows. A later draw with an unknown layout does not fit and
/// the owner drops the whole structure.
#[derive(Debug)]
pub struct StaticVertexBuffer {
    source_serial: Serial,
    reserved: u64,
    buffer: Option<BufferHandle>,
    cursor: u64,
    serial: Serial,
    entries: Vec<(StaticAttributeKey, u64)>,
}

impl StaticVertexBuffer {
    pub fn new(source_serial: Serial) -> Self {
        Self {
            source_serial,
            reserved: 0,
            buffer: None,
            cursor: 0,
            serial: Serial::issue(),
            entries: Vec::new(),
        }
    }

    pub fn is_current(&self, serial: Serial) -> bool {
        self.source_serial == serial
    }

    pub fn buffer_id(&self) -> Option<BufferId> {
        self.buffer.as_ref().map(BufferHandle::id)
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    /// Output offset of a stored conversion.
    pub fn lookup(&self, key: &StaticAttributeKey) -> Option<u64> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|&(_, offset)| offset)
    }

    /// Reserve space for one conversion. Returns `false` once the native buffer exists, since its
    /// size is fixed.
    pub fn reserve(&mut self, size: u64) -> Result<bool> {
        if self.buffer.is_some() {
            return Ok(false);
        }
        self.reserved = self
            .reserved
            .checked_add(align_up(size, STREAM_ALIGNMENT))
            .ok_or(TranslateError::OutOfMemory("reserving static vertex space"))?;
        Ok(true)
    }

    /// Store a converted attribute and return its output offset.
    pub fn store_attribute(
        &mut self,
        device: &mut dyn NativeDevice,
        releases: &ReleaseQueue,
        key: StaticAttributeKey,
        converted: &[u8],
    ) -> Result<u64> {
        if let Some(offset) = self.lookup(&key) {
            return Ok(offset);
        }
        if converted.is_empty() {
            self.entries.push((key, self.cursor));
            return Ok(self.cursor);
        }

        // A fresh buffer is only kept once its first upload lands. On failure the retried draw
        // reserves again from zero.
        let fresh = match self.buffer {
            Some(_) => None,
            None => match allocate_and_upload(device, releases, NativeUsage::VERTEX, self.reserved)
            {
                Ok(handle) => Some(handle),
                Err(err) => {
                    self.reserved = 0;
                    return Err(err);
                }
            },
        };
        let Some(target) = fresh.as_ref().or(self.buffer.as_ref()) else {
            return Err(TranslateError::OutOfMemory("allocating static buffer"));
        };
        let buffer = target.id();

        let aligned_len = align_up(converted.len() as u64, STREAM_ALIGNMENT);
        if self.cursor + aligned_len > target.size() {
            return Err(TranslateError::OutOfMemory(
                "static vertex buffer reservation exceeded",
            ));
        }

        let offset = self.cursor;
        if let Err(err) = device.write_buffer(buffer, offset, &padded(converted)) {
            if fresh.is_some() {
                self.reserved = 0;
            }
            return Err(TranslateError::from_device(
                err,
                "uploading static vertex buffer",
            ));
        }
        if let Some(handle) = fresh {
            self.buffer = Some(handle);
            self.serial = Serial::issue();
        }
        self.cursor += aligned_len;
        self.entries.push((key, offset));
        trace!(?buffer, offset, bytes = converted.len(), "static attribute stored");
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::hal::{DeviceCaps, FailPoint, RecordingDevice};
    use crate::vertex::format_map::ElementType;

    #[test]
    fn range_cache_round_trips_entries() {
        let mut cache = RangeCache::new();
        let range = IndexRange { min: 2, max: 9 };
        assert_eq!(cache.lookup(IndexType::U16, 4, 6), None);
        cache.add_range(IndexType::U16, 4, 6, range, 8);
        assert_eq!(
            cache.lookup(IndexType::U16, 4, 6),
            Some(CachedRange {
                range,
                output_offset: 8
            })
        );
        // Keyed on type as well as position.
        assert_eq!(cache.lookup(IndexType::U32, 4, 6), None);
    }

    #[test]
    fn zero_length_store_defers_allocation() {
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        let releases = ReleaseQueue::new();
        let mut statics = StaticIndexBuffer::new(IndexType::U16, IndexFormat::U16, Serial::issue());
        statics.reserve(0);
        statics.store(&mut device, &releases, &[]).unwrap();
        assert!(!statics.is_populated());
        assert_eq!(device.live_buffers(), 0);

        statics.reserve(6);
        statics.store(&mut device, &releases, &[1, 0, 2, 0, 3, 0]).unwrap();
        let id = statics.buffer_id().unwrap();
        assert_eq!(&device.buffer_contents(id).unwrap()[..6], &[1, 0, 2, 0, 3, 0]);
    }

    #[test]
    fn vertex_entries_pack_into_one_buffer() {
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        let releases = ReleaseQueue::new();
        let mut statics = StaticVertexBuffer::new(Serial::issue());
        let pos = StaticAttributeKey {
            format: AttributeFormat::float(3),
            stride: 20,
            base_offset: 0,
        };
        let color = StaticAttributeKey {
            format: AttributeFormat::new(ElementType::UnsignedByte, 4, true, false),
            stride: 20,
            base_offset: 12,
        };

        assert!(statics.reserve(24).unwrap());
        assert!(statics.reserve(6).unwrap());
        assert_eq!(
            statics
                .store_attribute(&mut device, &releases, pos, &[1; 24])
                .unwrap(),
            0
        );
        assert_eq!(
            statics
                .store_attribute(&mut device, &releases, color, &[2; 6])
                .unwrap(),
            24
        );
        assert_eq!(statics.lookup(&color), Some(24));
        assert_eq!(device.live_buffers(), 1);

        // Fixed size once allocated.
        assert!(!statics.reserve(4).unwrap());
    }

    #[test]
    fn failed_first_upload_leaves_no_buffer() {
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        let releases = ReleaseQueue::new();
        let mut statics = StaticVertexBuffer::new(Serial::issue());
        let key = StaticAttributeKey {
            format: AttributeFormat::float(2),
            stride: 8,
            base_offset: 0,
        };

        assert!(statics.reserve(16).unwrap());
        device.fail_next(FailPoint::WriteBuffer, DeviceError::OutOfVideoMemory);
        assert!(matches!(
            statics.store_attribute(&mut device, &releases, key, &[3; 16]),
            Err(TranslateError::OutOfMemory(_))
        ));
        assert!(!statics.is_allocated());
        assert_eq!(statics.lookup(&key), None);
        assert_eq!(releases.len(), 1);

        // Still open for the retried draw.
        assert!(statics.reserve(16).unwrap());
        assert_eq!(
            statics
                .store_attribute(&mut device, &releases, key, &[3; 16])
                .unwrap(),
            0
        );
        let id = statics.buffer_id().unwrap();
        assert_eq!(device.buffer_contents(id).unwrap().len(), 16);
    }
}
