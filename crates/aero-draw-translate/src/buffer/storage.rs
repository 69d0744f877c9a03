use std::borrow::Cow;

use tracing::trace;

use crate::error::{Result, TranslateError};
use crate::hal::{BufferHandle, BufferId, NativeDevice, NativeUsage, ReleaseQueue};
use crate::serial::Serial;
use crate::stream::{align_up, STREAM_ALIGNMENT};

#[derive(Debug)]
struct NativeMirror {
    handle: BufferHandle,
    /// Serial of the system-memory contents last uploaded into `handle`.
    uploaded: Serial,
}

/// System-memory contents of a buffer plus an optional native copy.
///
/// The bytes are authoritative. The native mirror is materialized on demand and may be dropped at
/// any time (device loss) without losing data.
#[derive(Debug)]
pub struct BufferStorage {
    data: Vec<u8>,
    serial: Serial,
    unmodified_reads: u64,
    direct_binding: bool,
    native: Option<NativeMirror>,
}

impl BufferStorage {
    /// `direct_binding` is whether the backend can bind this storage in place.
    pub fn new(direct_binding: bool) -> Self {
        Self {
            data: Vec::new(),
            serial: Serial::issue(),
            unmodified_reads: 0,
            direct_binding,
            native: None,
        }
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Write `bytes` at `offset`, growing the storage when the write extends past the end.
    ///
    /// Existing bytes are preserved and the storage never shrinks. A new serial is issued before
    /// any byte changes, so every translation derived from the old contents is stale from here on.
    pub fn set_data(&mut self, bytes: &[u8], offset: u64) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| TranslateError::OutOfMemory("growing buffer storage"))?;
        let end = start
            .checked_add(bytes.len())
            .ok_or(TranslateError::OutOfMemory("growing buffer storage"))?;

        self.serial = Serial::issue();
        self.unmodified_reads = 0;

        if end > self.data.len() {
            self.data
                .try_reserve(end - self.data.len())
                .map_err(|_| TranslateError::OutOfMemory("growing buffer storage"))?;
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Drop the contents (size becomes zero).
    pub fn clear(&mut self) {
        self.serial = Serial::issue();
        self.unmodified_reads = 0;
        self.data.clear();
    }

    /// Whether the backend can bind this storage without an intermediate copy. Per-attribute
    /// alignment and format checks are layered on top by the translators.
    pub fn supports_direct_binding(&self) -> bool {
        self.direct_binding
    }

    pub fn set_direct_binding(&mut self, direct_binding: bool) {
        self.direct_binding = direct_binding;
    }

    /// Count `bytes` read from unmodified contents (static promotion heuristic).
    pub fn mark_usage(&mut self, bytes: u64) {
        self.unmodified_reads = self.unmodified_reads.saturating_add(bytes);
    }

    pub fn unmodified_reads(&self) -> u64 {
        self.unmodified_reads
    }

    /// Native copy of the current contents, uploading first if it is stale.
    pub fn native_buffer(
        &mut self,
        device: &mut dyn NativeDevice,
        releases: &ReleaseQueue,
        usage: NativeUsage,
    ) -> Result<BufferId> {
        if let Some(mirror) = &self.native {
            if mirror.uploaded == self.serial && mirror.handle.usage().contains(usage) {
                return Ok(mirror.handle.id());
            }
        }

        let padded_len = align_up(self.size().max(STREAM_ALIGNMENT), STREAM_ALIGNMENT);
        let upload: Cow<'_, [u8]> = if padded_len == self.size() {
            Cow::Borrowed(&self.data)
        } else {
            let mut padded = self.data.clone();
            padded.resize(padded_len as usize, 0);
            Cow::Owned(padded)
        };

        let reusable = self.native.as_ref().is_some_and(|mirror| {
            mirror.handle.size() >= padded_len && mirror.handle.usage().contains(usage)
        });
        if !reusable {
            let usage = usage
                | self
                    .native
                    .as_ref()
                    .map_or(NativeUsage::empty(), |m| m.handle.usage());
            let handle = BufferHandle::create(device, releases, usage, padded_len)
                .map_err(|err| TranslateError::from_device(err, "allocating native buffer"))?;
            trace!(id = ?handle.id(), size = padded_len, "native buffer mirror allocated");
            self.native = Some(NativeMirror {
                handle,
                uploaded: Serial::NONE,
            });
        }

        let Some(mirror) = self.native.as_mut() else {
            return Err(TranslateError::OutOfMemory("allocating native buffer"));
        };
        device
            .write_buffer(mirror.handle.id(), 0, &upload)
            .map_err(|err| TranslateError::from_device(err, "uploading buffer contents"))?;
        mirror.uploaded = self.serial;
        Ok(mirror.handle.id())
    }

    /// Serial of the contents currently held by the native mirror, if any.
    pub fn native_serial(&self) -> Option<Serial> {
        self.native.as_ref().map(|m| m.uploaded)
    }

    /// Drop the native mirror. The bytes survive.
    pub fn invalidate_native(&mut self) {
        self.native = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::hal::{DeviceCall, DeviceCaps, FailPoint, RecordingDevice};
    use pretty_assertions::assert_eq;

    #[test]
    fn set_data_grows_and_preserves() {
        let mut storage = BufferStorage::new(false);
        storage.set_data(&[1, 2, 3, 4], 0).unwrap();
        storage.set_data(&[9, 9], 6).unwrap();
        assert_eq!(storage.get_data(), &[1, 2, 3, 4, 0, 0, 9, 9]);

        // Never shrinks.
        storage.set_data(&[5], 0).unwrap();
        assert_eq!(storage.size(), 8);
        assert_eq!(storage.get_data()[0], 5);
    }

    #[test]
    fn every_mutation_issues_a_new_serial() {
        let mut storage = BufferStorage::new(false);
        let s0 = storage.serial();
        storage.set_data(&[0; 4], 0).unwrap();
        let s1 = storage.serial();
        storage.set_data(&[0; 4], 0).unwrap();
        let s2 = storage.serial();
        storage.clear();
        assert!(s0 < s1 && s1 < s2 && s2 < storage.serial());
        assert_eq!(storage.size(), 0);
    }

    #[test]
    fn mutation_resets_usage_counter() {
        let mut storage = BufferStorage::new(false);
        storage.set_data(&[0; 4], 0).unwrap();
        storage.mark_usage(100);
        assert_eq!(storage.unmodified_reads(), 100);
        storage.set_data(&[1], 0).unwrap();
        assert_eq!(storage.unmodified_reads(), 0);
    }

    #[test]
    fn native_mirror_uploads_only_when_stale() {
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        let releases = ReleaseQueue::new();
        let mut storage = BufferStorage::new(true);
        storage.set_data(&[1, 2, 3, 4, 5, 6], 0).unwrap();

        let id = storage
            .native_buffer(&mut device, &releases, NativeUsage::VERTEX)
            .unwrap();
        assert_eq!(
            device.buffer_contents(id),
            Some(&[1, 2, 3, 4, 5, 6, 0, 0][..])
        );
        device.clear_calls();

        assert_eq!(
            storage
                .native_buffer(&mut device, &releases, NativeUsage::VERTEX)
                .unwrap(),
            id
        );
        assert!(device.calls().is_empty());

        storage.set_data(&[7], 0).unwrap();
        assert_eq!(
            storage
                .native_buffer(&mut device, &releases, NativeUsage::VERTEX)
                .unwrap(),
            id
        );
        assert_eq!(
            device.count_calls(|c| matches!(c, DeviceCall::WriteBuffer { .. })),
            1
        );
        assert_eq!(device.buffer_contents(id).unwrap()[0], 7);
    }

    #[test]
    fn failed_upload_keeps_bytes() {
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        let releases = ReleaseQueue::new();
        let mut storage = BufferStorage::new(true);
        storage.set_data(&[1, 2, 3, 4], 0).unwrap();

        device.fail_next(FailPoint::WriteBuffer, DeviceError::OutOfVideoMemory);
        assert!(matches!(
            storage.native_buffer(&mut device, &releases, NativeUsage::INDEX),
            Err(TranslateError::OutOfMemory(_))
        ));
        assert_eq!(storage.get_data(), &[1, 2, 3, 4]);
        assert_ne!(storage.native_serial(), Some(storage.serial()));
    }
}
