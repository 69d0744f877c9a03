use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::trace;

use crate::error::{Result, TranslateError};
use crate::hal::{LayoutId, NativeDevice, VertexLayout};
use crate::stats::TranslateStats;

pub const VERTEX_LAYOUT_CACHE_CAPACITY: usize = 32;

/// Native vertex layouts keyed by their elements.
///
/// Creating a vertex declaration / input layout is comparatively expensive and draws typically
/// cycle through a handful of layouts, so they are kept around and evicted least-recently-used.
pub struct LayoutCache {
    entries: LruCache<VertexLayout, LayoutId>,
    stats: Arc<TranslateStats>,
}

impl LayoutCache {
    pub fn new(stats: Arc<TranslateStats>) -> Self {
        Self::with_capacity(VERTEX_LAYOUT_CACHE_CAPACITY, stats)
    }

    pub fn with_capacity(capacity: usize, stats: Arc<TranslateStats>) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_or_create(
        &mut self,
        device: &mut dyn NativeDevice,
        layout: &VertexLayout,
    ) -> Result<LayoutId> {
        if let Some(&id) = self.entries.get(layout) {
            return Ok(id);
        }

        let id = device
            .create_vertex_layout(layout)
            .map_err(|err| TranslateError::from_device(err, "creating vertex layout"))?;
        self.stats.inc_vertex_layouts_created();
        trace!(?id, elements = layout.elements.len(), "vertex layout created");

        if let Some((_, evicted)) = self.entries.push(layout.clone(), id) {
            trace!(id = ?evicted, "vertex layout evicted");
            device.destroy_vertex_layout(evicted);
        }
        Ok(id)
    }

    /// Destroy every cached layout.
    pub fn destroy_all(&mut self, device: &mut dyn NativeDevice) {
        while let Some((_, id)) = self.entries.pop_lru() {
            device.destroy_vertex_layout(id);
        }
    }

    /// Device loss: the layouts are already gone with the device.
    pub fn forget(&mut self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for LayoutCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{DeviceCaps, NativeVertexFormat, RecordingDevice, VertexElement};

    fn layout(slot: u32) -> VertexLayout {
        VertexLayout {
            elements: vec![VertexElement {
                slot,
                format: NativeVertexFormat::Float32x3,
                divisor: 0,
            }],
        }
    }

    #[test]
    fn identical_layouts_are_created_once() {
        let mut device = RecordingDevice::new(DeviceCaps::d3d9_class());
        let stats = Arc::new(TranslateStats::new());
        let mut cache = LayoutCache::new(stats.clone());

        let a = cache.get_or_create(&mut device, &layout(0)).unwrap();
        let b = cache.get_or_create(&mut device, &layout(0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(stats.snapshot().vertex_layouts_created, 1);
        assert_eq!(device.layout(a), Some(&layout(0)));
    }

    #[test]
    fn eviction_destroys_least_recently_used() {
        let mut device = RecordingDevice::new(DeviceCaps::d3d9_class());
        let mut cache = LayoutCache::with_capacity(2, Arc::new(TranslateStats::new()));

        let first = cache.get_or_create(&mut device, &layout(0)).unwrap();
        cache.get_or_create(&mut device, &layout(1)).unwrap();
        cache.get_or_create(&mut device, &layout(0)).unwrap();
        cache.get_or_create(&mut device, &layout(2)).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(device.live_layouts(), 2);
        assert!(device.layout(first).is_some());
    }
}
