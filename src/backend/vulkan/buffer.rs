// Vulkan buffers
//
// Every buffer is usable as a storage buffer, a copy source and destination
// and an indirect argument buffer. Buffers the host maps live in host
// visible coherent memory, the rest prefer device local memory.

use ash::vk;
use std::sync::Arc;

use super::VulkanContext;
use crate::error::{Error, Result};
use crate::types::BufferUsage;

pub struct VulkanBuffer {
    context: Arc<VulkanContext>,
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    host_visible: bool,
}

fn vk_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::INDIRECT_BUFFER;
    if usage.contains(BufferUsage::UNIFORM_ACCESS) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    flags
}

impl VulkanBuffer {
    pub fn new(context: &Arc<VulkanContext>, size: u64, usage: BufferUsage) -> Result<Self> {
        let device = &context.device;
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk_buffer_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }?;

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let host_flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let wants_host = usage.intersects(
            BufferUsage::TRANSFER_UPLOAD | BufferUsage::TRANSFER_DOWNLOAD | BufferUsage::UNIFORM_ACCESS,
        );
        let candidates = if wants_host {
            [host_flags, host_flags]
        } else {
            [vk::MemoryPropertyFlags::DEVICE_LOCAL, host_flags]
        };
        let Some((memory_type_index, flags)) = candidates
            .iter()
            .find_map(|&flags| context.find_memory_type(mem_requirements.memory_type_bits, flags).map(|i| (i, flags)))
        else {
            unsafe { device.destroy_buffer(buffer, None) };
            context.sink.error("(Vulkan) no memory type fits the buffer");
            return Err(Error::DeviceAllocationFailed);
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(e.into());
        }

        Ok(Self {
            context: context.clone(),
            buffer,
            memory,
            size,
            host_visible: flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Map the whole buffer. Only one mapping may exist at a time.
    pub fn map(&self) -> Result<*mut u8> {
        if !self.host_visible {
            return Err(Error::MapFailed);
        }
        let ptr = unsafe {
            self.context
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
        }
        .map_err(|_| Error::MapFailed)?;
        Ok(ptr as *mut u8)
    }

    pub fn unmap(&self) {
        unsafe { self.context.device.unmap_memory(self.memory) };
    }

    /// Copy `data` to the start of the buffer through a temporary mapping
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.size {
            return Err(Error::InvalidRegion);
        }
        let ptr = self.map()?;
        unsafe { ptr.copy_from_nonoverlapping(data.as_ptr(), data.len()) };
        self.unmap();
        Ok(())
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_buffer(self.buffer, None);
            self.context.device.free_memory(self.memory, None);
        }
    }
}
