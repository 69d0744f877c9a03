//! Client-visible buffers and the registry that names them.

mod storage;

use hashbrown::HashMap;
use tracing::debug;

use crate::error::Result;
use crate::index::range::compute_range;
use crate::index::{IndexRange, IndexType};
use crate::serial::Serial;
use crate::static_buffer::{RangeCache, StaticIndexBuffer, StaticVertexBuffer};
use crate::stats::TranslateStats;

pub use storage::BufferStorage;

/// Client name of a buffer. Acts as a weak reference: a stale name simply fails to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferName(pub u32);

/// Usage hint supplied with the buffer contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferUsage {
    /// Specified once, drawn many times. Promoted to static translations immediately.
    Static,
    /// Respecified repeatedly.
    #[default]
    Dynamic,
    /// Specified once, drawn a few times.
    Stream,
}

/// A client buffer: its bytes plus every translation derived from them.
#[derive(Debug)]
pub struct Buffer {
    storage: BufferStorage,
    usage: BufferUsage,
    promoted: bool,
    static_vertex: Option<StaticVertexBuffer>,
    static_index: Option<StaticIndexBuffer>,
    /// Ranges scanned for direct index binding, valid for `index_ranges_serial`.
    index_ranges: RangeCache,
    index_ranges_serial: Serial,
}

impl Buffer {
    pub fn new(direct_binding: bool) -> Self {
        Self {
            storage: BufferStorage::new(direct_binding),
            usage: BufferUsage::default(),
            promoted: false,
            static_vertex: None,
            static_index: None,
            index_ranges: RangeCache::new(),
            index_ranges_serial: Serial::NONE,
        }
    }

    pub fn storage(&self) -> &BufferStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut BufferStorage {
        &mut self.storage
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn serial(&self) -> Serial {
        self.storage.serial()
    }

    pub fn size(&self) -> u64 {
        self.storage.size()
    }

    pub fn data(&self) -> &[u8] {
        self.storage.get_data()
    }

    /// Replace the whole contents.
    pub fn set_contents(&mut self, data: &[u8], usage: BufferUsage) -> Result<()> {
        self.storage.clear();
        self.storage.set_data(data, 0)?;
        self.usage = usage;
        self.promoted = usage == BufferUsage::Static;
        self.static_vertex = None;
        self.static_index = None;
        Ok(())
    }

    /// Overwrite part of the contents. Derived translations go stale through the new serial.
    pub fn update(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.storage.set_data(data, offset)
    }

    /// Whether translations from this buffer should go through a static buffer.
    pub fn is_promoted(&self) -> bool {
        self.promoted
    }

    /// Count a streamed read of unmodified contents and promote once they have been read more
    /// than `factor` times their size. Returns `true` on promotion.
    pub fn mark_streamed(&mut self, bytes: u64, factor: u64, stats: &TranslateStats) -> bool {
        self.storage.mark_usage(bytes);
        if self.promoted || self.size() == 0 {
            return false;
        }
        if self.storage.unmodified_reads() > self.size().saturating_mul(factor) {
            debug!(
                size = self.size(),
                reads = self.storage.unmodified_reads(),
                "buffer promoted to static translation"
            );
            stats.inc_static_promotions();
            self.promoted = true;
            return true;
        }
        false
    }

    /// Drop static translations converted from older contents. A buffer whose statics were
    /// invalidated must earn promotion again.
    pub fn validate_statics(&mut self, stats: &TranslateStats) {
        let serial = self.storage.serial();
        let stale_vertex = self
            .static_vertex
            .as_ref()
            .is_some_and(|s| !s.is_current(serial));
        let stale_index = self
            .static_index
            .as_ref()
            .is_some_and(|s| !s.is_current(serial));
        if stale_vertex || stale_index {
            debug!(?serial, "static translations invalidated by buffer update");
            stats.inc_static_invalidations();
            self.static_vertex = None;
            self.static_index = None;
            self.promoted = false;
        }
    }

    pub fn static_vertex(&self) -> Option<&StaticVertexBuffer> {
        self.static_vertex.as_ref()
    }

    /// The static vertex buffer, created on first use.
    pub fn static_vertex_mut(&mut self) -> &mut StaticVertexBuffer {
        let serial = self.storage.serial();
        self.static_vertex
            .get_or_insert_with(|| StaticVertexBuffer::new(serial))
    }

    pub fn static_index(&self) -> Option<&StaticIndexBuffer> {
        self.static_index.as_ref()
    }

    pub fn static_index_mut(&mut self) -> Option<&mut StaticIndexBuffer> {
        self.static_index.as_mut()
    }

    pub fn set_static_index(&mut self, statics: StaticIndexBuffer) {
        self.static_index = Some(statics);
    }

    /// Drop the static vertex translations (layout no longer fits).
    pub fn drop_static_vertex(&mut self, stats: &TranslateStats) {
        if self.static_vertex.take().is_some() {
            stats.inc_static_invalidations();
            self.promoted = false;
        }
    }

    /// Split borrow of the bytes and the static vertex buffer, for converting into it.
    pub fn static_vertex_source(&mut self) -> (&[u8], &mut StaticVertexBuffer) {
        let serial = self.storage.serial();
        let statics = self
            .static_vertex
            .get_or_insert_with(|| StaticVertexBuffer::new(serial));
        (self.storage.get_data(), statics)
    }

    /// Split borrow of the bytes and the static index buffer.
    pub fn static_index_source(&mut self) -> (&[u8], Option<&mut StaticIndexBuffer>) {
        (self.storage.get_data(), self.static_index.as_mut())
    }

    /// `[min, max]` of `count` indices at `offset`, memoized until the contents change.
    pub fn index_range(
        &mut self,
        index_type: IndexType,
        offset: u64,
        count: u32,
        stats: &TranslateStats,
    ) -> IndexRange {
        let serial = self.storage.serial();
        if self.index_ranges_serial != serial {
            self.index_ranges.clear();
            self.index_ranges_serial = serial;
        }
        if let Some(cached) = self.index_ranges.lookup(index_type, offset, count) {
            return cached.range;
        }
        stats.inc_index_range_scans();
        let range = compute_range(index_type, &self.storage.get_data()[offset as usize..], count);
        self.index_ranges
            .add_range(index_type, offset, count, range, offset);
        range
    }

    /// Device loss: every native object derived from this buffer is gone. Bytes survive.
    pub fn invalidate_native(&mut self) {
        self.storage.invalidate_native();
        self.static_vertex = None;
        self.static_index = None;
    }
}

/// Name → buffer table.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: HashMap<BufferName, Buffer>,
    next_name: u32,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, direct_binding: bool) -> BufferName {
        self.next_name += 1;
        let name = BufferName(self.next_name);
        self.buffers.insert(name, Buffer::new(direct_binding));
        name
    }

    pub fn get(&self, name: BufferName) -> Option<&Buffer> {
        self.buffers.get(&name)
    }

    pub fn get_mut(&mut self, name: BufferName) -> Option<&mut Buffer> {
        self.buffers.get_mut(&name)
    }

    pub fn delete(&mut self, name: BufferName) -> Option<Buffer> {
        self.buffers.remove(&name)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BufferName, &mut Buffer)> {
        self.buffers.iter_mut().map(|(name, buffer)| (*name, buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_until_deleted() {
        let mut registry = BufferRegistry::new();
        let a = registry.create(false);
        let b = registry.create(false);
        assert_ne!(a, b);
        assert!(registry.get(a).is_some());
        assert!(registry.delete(a).is_some());
        assert!(registry.get(a).is_none());
        assert!(registry.get(b).is_some());
    }

    #[test]
    fn static_hint_promotes_immediately() {
        let mut buffer = Buffer::new(false);
        buffer.set_contents(&[0; 16], BufferUsage::Static).unwrap();
        assert!(buffer.is_promoted());
        buffer.set_contents(&[0; 16], BufferUsage::Dynamic).unwrap();
        assert!(!buffer.is_promoted());
    }

    #[test]
    fn promotion_after_reading_three_times_the_size() {
        let stats = TranslateStats::new();
        let mut buffer = Buffer::new(false);
        buffer.set_contents(&[0; 16], BufferUsage::Dynamic).unwrap();

        assert!(!buffer.mark_streamed(16, 3, &stats));
        assert!(!buffer.mark_streamed(16, 3, &stats));
        assert!(!buffer.mark_streamed(16, 3, &stats));
        assert!(buffer.mark_streamed(16, 3, &stats));
        assert_eq!(stats.snapshot().static_promotions, 1);
    }

    #[test]
    fn write_invalidates_statics_lazily() {
        let stats = TranslateStats::new();
        let mut buffer = Buffer::new(false);
        buffer.set_contents(&[0; 16], BufferUsage::Static).unwrap();
        buffer.static_vertex_mut();
        buffer.validate_statics(&stats);
        assert!(buffer.static_vertex().is_some());

        buffer.update(&[1], 0).unwrap();
        assert!(buffer.static_vertex().is_some());
        buffer.validate_statics(&stats);
        assert!(buffer.static_vertex().is_none());
        assert!(!buffer.is_promoted());
        assert_eq!(stats.snapshot().static_invalidations, 1);
    }

    #[test]
    fn index_ranges_are_memoized_per_serial() {
        let stats = TranslateStats::new();
        let mut buffer = Buffer::new(true);
        buffer
            .set_contents(&[3, 0, 1, 0, 7, 0], BufferUsage::Dynamic)
            .unwrap();

        let range = buffer.index_range(IndexType::U16, 0, 3, &stats);
        assert_eq!(range, IndexRange { min: 1, max: 7 });
        buffer.index_range(IndexType::U16, 0, 3, &stats);
        assert_eq!(stats.snapshot().index_range_scans, 1);

        buffer.update(&[9, 0], 0).unwrap();
        let range = buffer.index_range(IndexType::U16, 0, 3, &stats);
        assert_eq!(range, IndexRange { min: 1, max: 9 });
        assert_eq!(stats.snapshot().index_range_scans, 2);
    }
}
