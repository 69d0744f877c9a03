use std::sync::Arc;

use hashbrown::HashMap;
use tracing::trace;

use crate::error::Result;
use crate::hal::{
    BufferId, NativeDevice, NativeUsage, NativeVertexFormat, ReleaseQueue, VertexFormatCaps,
};
use crate::serial::Serial;
use crate::stats::TranslateStats;
use crate::stream::{StreamAllocation, StreamingBuffer};

/// Constant value of a vertex attribute that has no enabled array.
#[derive(Debug, Clone, Copy)]
pub enum CurrentValue {
    Float([f32; 4]),
    Int([i32; 4]),
    Uint([u32; 4]),
}

impl Default for CurrentValue {
    fn default() -> Self {
        CurrentValue::Float([0.0, 0.0, 0.0, 1.0])
    }
}

impl PartialEq for CurrentValue {
    /// Bit-wise: a re-specified `NaN` is not a change.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CurrentValue::Float(a), CurrentValue::Float(b)) => {
                a.iter().zip(b).all(|(a, b)| a.to_bits() == b.to_bits())
            }
            (CurrentValue::Int(a), CurrentValue::Int(b)) => a == b,
            (CurrentValue::Uint(a), CurrentValue::Uint(b)) => a == b,
            _ => false,
        }
    }
}

impl CurrentValue {
    /// Native format and bytes. Integer values fall back to floats without 32-bit integer
    /// vertex formats.
    pub fn encode(&self, caps: VertexFormatCaps) -> (NativeVertexFormat, [u8; 16]) {
        let mut out = [0u8; 16];
        let format = match *self {
            CurrentValue::Float(v) => {
                out.copy_from_slice(bytemuck::cast_slice(&v));
                NativeVertexFormat::Float32x4
            }
            CurrentValue::Int(v) if caps.int32 => {
                out.copy_from_slice(bytemuck::cast_slice(&v));
                NativeVertexFormat::Sint32x4
            }
            CurrentValue::Uint(v) if caps.int32 => {
                out.copy_from_slice(bytemuck::cast_slice(&v));
                NativeVertexFormat::Uint32x4
            }
            CurrentValue::Int(v) => {
                out.copy_from_slice(bytemuck::cast_slice(&v.map(|c| c as f32)));
                NativeVertexFormat::Float32x4
            }
            CurrentValue::Uint(v) => {
                out.copy_from_slice(bytemuck::cast_slice(&v.map(|c| c as f32)));
                NativeVertexFormat::Float32x4
            }
        };
        (format, out)
    }
}

/// Native binding of a current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentValueBinding {
    pub format: NativeVertexFormat,
    pub buffer: BufferId,
    pub offset: u64,
    pub serial: Serial,
}

#[derive(Debug)]
struct Slot {
    stream: StreamingBuffer,
    cached: Option<(CurrentValue, NativeVertexFormat, StreamAllocation)>,
}

/// One small streaming buffer per attribute slot, re-streamed only when the value changes.
#[derive(Debug)]
pub struct CurrentValueCache {
    slots: HashMap<u32, Slot>,
    stream_size: u64,
    releases: ReleaseQueue,
    stats: Arc<TranslateStats>,
}

impl CurrentValueCache {
    pub fn new(stream_size: u64, releases: ReleaseQueue, stats: Arc<TranslateStats>) -> Self {
        Self {
            slots: HashMap::new(),
            stream_size,
            releases,
            stats,
        }
    }

    pub fn fetch(
        &mut self,
        device: &mut dyn NativeDevice,
        slot: u32,
        value: CurrentValue,
    ) -> Result<CurrentValueBinding> {
        let caps = device.capabilities().vertex_formats;
        let entry = self.slots.entry(slot).or_insert_with(|| Slot {
            stream: StreamingBuffer::new(
                "current_value",
                NativeUsage::VERTEX,
                self.stream_size,
                self.releases.clone(),
                self.stats.clone(),
            ),
            cached: None,
        });

        if let Some((cached, format, alloc)) = &entry.cached {
            if *cached == value && entry.stream.is_current(alloc) {
                return Ok(CurrentValueBinding {
                    format: *format,
                    buffer: alloc.buffer,
                    offset: alloc.offset,
                    serial: alloc.serial,
                });
            }
        }

        let (format, bytes) = value.encode(caps);
        let alloc = entry.stream.write(device, &bytes)?;
        entry.cached = Some((value, format, alloc));
        self.stats.inc_current_value_uploads();
        trace!(slot, ?value, "current value streamed");
        Ok(CurrentValueBinding {
            format,
            buffer: alloc.buffer,
            offset: alloc.offset,
            serial: alloc.serial,
        })
    }

    /// Device loss: forget every native buffer and cached value.
    pub fn invalidate(&mut self) {
        for slot in self.slots.values_mut() {
            slot.stream.invalidate();
            slot.cached = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{DeviceCaps, RecordingDevice};

    fn cache() -> (CurrentValueCache, Arc<TranslateStats>) {
        let stats = Arc::new(TranslateStats::new());
        (
            CurrentValueCache::new(64, ReleaseQueue::new(), stats.clone()),
            stats,
        )
    }

    #[test]
    fn unchanged_value_is_not_restreamed() {
        let mut device = RecordingDevice::new(DeviceCaps::d3d9_class());
        let (mut cache, stats) = cache();
        let value = CurrentValue::Float([1.0, 2.0, 3.0, 4.0]);

        let a = cache.fetch(&mut device, 3, value).unwrap();
        let b = cache.fetch(&mut device, 3, value).unwrap();
        assert_eq!(a, b);
        assert_eq!(stats.snapshot().current_value_uploads, 1);

        let c = cache
            .fetch(&mut device, 3, CurrentValue::Float([0.0; 4]))
            .unwrap();
        assert_ne!(a.offset, c.offset);
        assert_eq!(stats.snapshot().current_value_uploads, 2);
    }

    #[test]
    fn integer_values_fall_back_to_float_without_int32() {
        let (format, bytes) =
            CurrentValue::Int([1, -2, 3, 4]).encode(DeviceCaps::d3d9_class().vertex_formats);
        assert_eq!(format, NativeVertexFormat::Float32x4);
        assert_eq!(&bytes[4..8], &(-2.0f32).to_le_bytes());

        let (format, _) = CurrentValue::Uint([1; 4]).encode(DeviceCaps::modern().vertex_formats);
        assert_eq!(format, NativeVertexFormat::Uint32x4);
    }

    #[test]
    fn invalidation_forces_restream() {
        let mut device = RecordingDevice::new(DeviceCaps::d3d9_class());
        let (mut cache, stats) = cache();
        let value = CurrentValue::default();
        cache.fetch(&mut device, 0, value).unwrap();
        cache.invalidate();
        cache.fetch(&mut device, 0, value).unwrap();
        assert_eq!(stats.snapshot().current_value_uploads, 2);
    }
}
