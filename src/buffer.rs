// Buffers and host mappings
//
// A `Buffer` is the caller's handle. The shared `BufferInner` is what bind
// groups and recorded commands hold on to, so native memory outlives any
// command still referencing it.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::soft::memory::SoftMemory;
#[cfg(feature = "vulkan")]
use crate::backend::vulkan::buffer::VulkanBuffer;
use crate::device::ResourceKey;
use crate::error::{Error, Result};
use crate::types::{BufferUsage, MapMode};

pub(crate) enum BufferImpl {
    Soft(Arc<SoftMemory>),
    #[cfg(feature = "vulkan")]
    Vulkan(VulkanBuffer),
}

pub struct BufferInner {
    pub(crate) device_id: u64,
    pub(crate) size: u64,
    pub(crate) usage: BufferUsage,
    /// Set for internal buffers backing `bind_uniform_data`
    pub(crate) internal: bool,
    mapped: AtomicBool,
    pub(crate) imp: BufferImpl,
}

impl BufferInner {
    pub(crate) fn new(device_id: u64, size: u64, usage: BufferUsage, internal: bool, imp: BufferImpl) -> Self {
        Self {
            device_id,
            size,
            usage,
            internal,
            mapped: AtomicBool::new(false),
            imp,
        }
    }

    pub(crate) fn soft(&self) -> Result<&Arc<SoftMemory>> {
        match &self.imp {
            BufferImpl::Soft(memory) => Ok(memory),
            #[cfg(feature = "vulkan")]
            _ => Err(Error::InvalidHandle),
        }
    }

    #[cfg(feature = "vulkan")]
    pub(crate) fn vulkan(&self) -> Result<&VulkanBuffer> {
        match &self.imp {
            BufferImpl::Vulkan(buffer) => Ok(buffer),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Whether `offset..offset + size` lies inside the buffer
    pub(crate) fn contains(&self, offset: u64, size: u64) -> bool {
        offset.checked_add(size).map_or(false, |end| end <= self.size)
    }
}

impl std::fmt::Debug for BufferInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferInner")
            .field("device_id", &self.device_id)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("mapped", &self.mapped.load(Ordering::Relaxed))
            .finish()
    }
}

/// A device buffer. Destroy it with `Device::destroy_buffer`.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) inner: Arc<BufferInner>,
    pub(crate) key: ResourceKey,
}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.mapped.load(Ordering::Acquire)
    }
}

enum MappedBytes {
    /// Staging copy, written back on unmap in write mode
    Copy(Vec<u8>),
    #[cfg(feature = "vulkan")]
    Native { ptr: *mut u8, len: usize },
}

/// Host view of a mapped buffer. Unmaps when dropped.
///
/// Changes made through a `MapMode::Read` mapping are not guaranteed to
/// reach the buffer.
pub struct BufferMapping<'a> {
    buffer: &'a Buffer,
    mode: MapMode,
    bytes: MappedBytes,
}

impl<'a> BufferMapping<'a> {
    pub(crate) fn new(buffer: &'a Buffer, mode: MapMode) -> Result<Self> {
        let inner = &buffer.inner;
        let required = match mode {
            MapMode::Read => BufferUsage::TRANSFER_DOWNLOAD,
            MapMode::Write => BufferUsage::TRANSFER_UPLOAD,
        };
        if !inner.usage.contains(required) {
            return Err(Error::MapFailed);
        }
        if inner
            .mapped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::MapFailed);
        }

        let bytes = match &inner.imp {
            BufferImpl::Soft(memory) => Ok(MappedBytes::Copy(memory.read_vec(0, inner.size as usize))),
            #[cfg(feature = "vulkan")]
            BufferImpl::Vulkan(native) => native.map().map(|ptr| MappedBytes::Native {
                ptr,
                len: inner.size as usize,
            }),
        };
        match bytes {
            Ok(bytes) => Ok(Self { buffer, mode, bytes }),
            Err(e) => {
                inner.mapped.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    /// Explicit unmap, equivalent to dropping the mapping
    pub fn unmap(self) {}
}

impl Deref for BufferMapping<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.bytes {
            MappedBytes::Copy(bytes) => bytes,
            // SAFETY: the range stays mapped until this mapping is dropped
            #[cfg(feature = "vulkan")]
            MappedBytes::Native { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }
}

impl DerefMut for BufferMapping<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.bytes {
            MappedBytes::Copy(bytes) => bytes,
            #[cfg(feature = "vulkan")]
            MappedBytes::Native { ptr, len } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
        }
    }
}

impl Drop for BufferMapping<'_> {
    fn drop(&mut self) {
        let inner = &self.buffer.inner;
        match (&inner.imp, &self.bytes) {
            (BufferImpl::Soft(memory), MappedBytes::Copy(bytes)) => {
                if self.mode == MapMode::Write {
                    memory.write(0, bytes);
                }
            }
            #[cfg(feature = "vulkan")]
            (BufferImpl::Vulkan(native), MappedBytes::Native { .. }) => native.unmap(),
            #[cfg(feature = "vulkan")]
            _ => log::error!("Buffer mapping does not match its buffer's backend"),
        }
        inner.mapped.store(false, Ordering::Release);
    }
}
