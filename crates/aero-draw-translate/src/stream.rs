use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{Result, TranslateError};
use crate::hal::{BufferHandle, BufferId, NativeDevice, NativeUsage, ReleaseQueue};
use crate::serial::Serial;
use crate::stats::TranslateStats;

/// Alignment of every streaming allocation.
pub const STREAM_ALIGNMENT: u64 = 4;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0. Saturates instead of overflowing.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// A committed region of a streaming buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAllocation {
    pub buffer: BufferId,
    pub offset: u64,
    pub size: u64,
    /// Discard generation the allocation was made in.
    pub epoch: u64,
    /// Serial of the native buffer contents the allocation belongs to.
    pub serial: Serial,
}

/// Growable ring allocator over one native buffer.
///
/// The write cursor only returns to zero on a discard, so an allocation never overlaps data
/// handed out earlier in the same generation. Space for a whole draw is reserved up front with
/// [`StreamingBuffer::reserve`]; the first [`StreamingBuffer::map`] afterwards regrows or discards
/// once for the total, so the individual writes of that draw never trigger a discard in between.
pub struct StreamingBuffer {
    label: &'static str,
    usage: NativeUsage,
    releases: ReleaseQueue,
    stats: Arc<TranslateStats>,
    buffer: Option<BufferHandle>,
    capacity: u64,
    cursor: u64,
    reserved: u64,
    epoch: u64,
    serial: Serial,
    scratch: Vec<u8>,
    abandoned: bool,
}

impl StreamingBuffer {
    pub fn new(
        label: &'static str,
        usage: NativeUsage,
        initial_capacity: u64,
        releases: ReleaseQueue,
        stats: Arc<TranslateStats>,
    ) -> Self {
        Self {
            label,
            usage: usage | NativeUsage::DYNAMIC,
            releases,
            stats,
            buffer: None,
            capacity: align_up(initial_capacity.max(STREAM_ALIGNMENT), STREAM_ALIGNMENT),
            cursor: 0,
            reserved: 0,
            epoch: 0,
            serial: Serial::issue(),
            scratch: Vec::new(),
            abandoned: false,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn buffer_id(&self) -> Option<BufferId> {
        self.buffer.as_ref().map(BufferHandle::id)
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// Whether `alloc` still refers to live data (no discard or regrow since it was made).
    pub fn is_current(&self, alloc: &StreamAllocation) -> bool {
        alloc.epoch == self.epoch && self.buffer_id() == Some(alloc.buffer)
    }

    /// Add `size` bytes (aligned) to the space the next map must guarantee.
    pub fn reserve(&mut self, size: u64) -> Result<()> {
        self.clear_abandoned();
        self.reserved = self
            .reserved
            .checked_add(align_up(size, STREAM_ALIGNMENT))
            .ok_or(TranslateError::OutOfMemory("reserving streaming space"))?;
        Ok(())
    }

    /// Drop any pending reservation. Used when a draw aborts.
    pub fn cancel_reservation(&mut self) {
        self.reserved = 0;
    }

    /// Map `size` bytes for writing.
    ///
    /// Nothing is committed until [`StreamWrite::unmap`]; dropping the guard abandons the map.
    pub fn map<'a>(
        &'a mut self,
        device: &'a mut dyn NativeDevice,
        size: u64,
    ) -> Result<StreamWrite<'a>> {
        self.clear_abandoned();

        let aligned = align_up(size, STREAM_ALIGNMENT);
        let required = std::mem::take(&mut self.reserved).max(aligned);
        self.ensure_space(device, required)?;

        let len = usize::try_from(size)
            .map_err(|_| TranslateError::OutOfMemory("mapping streaming buffer"))?;
        self.scratch.clear();
        self.scratch
            .try_reserve(len)
            .map_err(|_| TranslateError::OutOfMemory("mapping streaming buffer"))?;
        self.scratch.resize(len, 0);

        let offset = self.cursor;
        Ok(StreamWrite {
            stream: self,
            device,
            offset,
            committed: false,
        })
    }

    /// Map, copy `data` and unmap in one step.
    pub fn write(
        &mut self,
        device: &mut dyn NativeDevice,
        data: &[u8],
    ) -> Result<StreamAllocation> {
        let mut write = self.map(device, data.len() as u64)?;
        write.bytes_mut().copy_from_slice(data);
        write.unmap()
    }

    /// Orphan the current contents and restart at offset 0.
    pub fn discard(&mut self, device: &mut dyn NativeDevice) -> Result<()> {
        if let Some(buffer) = &self.buffer {
            device
                .discard_buffer(buffer.id())
                .map_err(|err| TranslateError::from_device(err, "discarding streaming buffer"))?;
        }
        self.cursor = 0;
        self.epoch += 1;
        self.serial = Serial::issue();
        self.stats.inc_stream_discards();
        debug!(label = self.label, epoch = self.epoch, "streaming buffer discarded");
        Ok(())
    }

    /// Forget the native buffer (device loss). The capacity reached so far is kept and the buffer
    /// is recreated on the next map.
    pub fn invalidate(&mut self) {
        self.buffer = None;
        self.cursor = 0;
        self.reserved = 0;
        self.abandoned = false;
        self.epoch += 1;
        self.serial = Serial::issue();
    }

    fn clear_abandoned(&mut self) {
        if std::mem::take(&mut self.abandoned) {
            warn!(
                label = self.label,
                cursor = self.cursor,
                "streaming buffer map was dropped without unmap; nothing was committed"
            );
        }
    }

    fn ensure_space(&mut self, device: &mut dyn NativeDevice, required: u64) -> Result<()> {
        let max = device.capabilities().max_buffer_size;
        if required > max {
            return Err(TranslateError::OutOfMemory("streaming request exceeds buffer limit"));
        }

        if required > self.capacity {
            let grown = required.max(self.capacity.saturating_mul(3) / 2).min(max);
            let grown = align_up(grown, STREAM_ALIGNMENT).min(max);
            self.recreate(device, grown)?;
            self.stats.inc_stream_regrows();
            debug!(
                label = self.label,
                capacity = self.capacity,
                required,
                "streaming buffer regrown"
            );
            return Ok(());
        }

        if self.buffer.is_none() {
            return self.recreate(device, self.capacity);
        }

        if self.cursor + required > self.capacity {
            self.discard(device)?;
        }
        Ok(())
    }

    /// Allocate a fresh native buffer of `capacity` bytes. The old buffer is only released once
    /// the new one exists, so a failure leaves the stream untouched.
    fn recreate(&mut self, device: &mut dyn NativeDevice, capacity: u64) -> Result<()> {
        let handle = BufferHandle::create(device, &self.releases, self.usage, capacity)
            .map_err(|err| TranslateError::from_device(err, "allocating streaming buffer"))?;
        trace!(label = self.label, id = ?handle.id(), capacity, "streaming buffer allocated");
        self.buffer = Some(handle);
        self.capacity = capacity;
        self.cursor = 0;
        self.epoch += 1;
        self.serial = Serial::issue();
        Ok(())
    }
}

impl fmt::Debug for StreamingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingBuffer")
            .field("label", &self.label)
            .field("buffer", &self.buffer_id())
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .field("reserved", &self.reserved)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// An open map of a [`StreamingBuffer`].
///
/// Borrowing the stream and the device mutably makes a second map impossible until this one is
/// unmapped or dropped.
pub struct StreamWrite<'a> {
    stream: &'a mut StreamingBuffer,
    device: &'a mut dyn NativeDevice,
    offset: u64,
    committed: bool,
}

impl StreamWrite<'_> {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.stream.scratch
    }

    /// Upload the written bytes and advance the cursor.
    pub fn unmap(mut self) -> Result<StreamAllocation> {
        self.committed = true;
        let stream = &mut *self.stream;
        let Some(buffer) = stream.buffer.as_ref().map(BufferHandle::id) else {
            return Err(TranslateError::OutOfMemory("unmapping streaming buffer"));
        };

        // Native uploads are padded to the copy alignment.
        let size = stream.scratch.len() as u64;
        let padded = align_up(size, STREAM_ALIGNMENT);
        stream.scratch.resize(padded as usize, 0);
        self.device
            .write_buffer(buffer, self.offset, &stream.scratch)
            .map_err(|err| TranslateError::from_device(err, "writing streaming buffer"))?;

        stream.cursor = self.offset + padded;
        Ok(StreamAllocation {
            buffer,
            offset: self.offset,
            size,
            epoch: stream.epoch,
            serial: stream.serial,
        })
    }
}

impl Drop for StreamWrite<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.stream.abandoned = true;
        }
    }
}
