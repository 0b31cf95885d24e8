// Vulkan backend - GPU compute through ash
//
// Responsibilities:
// - Adapter selection (prefer discrete GPU, skip forbidden adapters)
// - Logical device with a single compute queue
// - Factory for buffers, images, pipelines, fences and command lists

pub mod buffer;
pub mod command_list;
pub mod descriptor;
pub mod fence;
pub mod image;
pub mod instance;
pub mod pipeline;

use anyhow::Context;
use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;
use std::time::Duration;

use self::buffer::VulkanBuffer;
use self::command_list::VulkanCommandList;
use self::descriptor::VulkanBinder;
use self::fence::VulkanFence;
use self::image::VulkanImage;
use self::instance::VulkanInstance;
use self::pipeline::VulkanPipeline;
use crate::binding::{LayoutCache, PoolManager};
use crate::buffer::BufferImpl;
use crate::config::PulseConfig;
use crate::debug::DebugSink;
use crate::error::{Error, Result};
use crate::image::ImageImpl;
use crate::types::{BufferUsage, ComputePipelineCreateInfo, ImageCreateInfo, ImageFormat, ImageType, ImageUsage};

/// Whether a Vulkan instance with at least one compute-capable adapter can be
/// created on this machine
pub fn probe(config: &PulseConfig) -> bool {
    let sink = Arc::new(DebugSink::new(crate::types::DebugLevel::NoDebug));
    let mut quiet = config.clone();
    quiet.vulkan.validation_layers = false;
    match VulkanInstance::new(&quiet, sink) {
        Ok(instance) => unsafe { instance.instance.enumerate_physical_devices() }
            .map(|devices| devices.iter().any(|&d| compute_queue_family(&instance.instance, d).is_some()))
            .unwrap_or(false),
        Err(e) => {
            log::debug!("Vulkan probe failed: {:#}", e);
            false
        }
    }
}

fn compute_queue_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    // Prefer a dedicated compute family, then any family with compute
    families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE) && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .or_else(|| families.iter().position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE)))
        .map(|i| i as u32)
}

/// Logical device state shared by every object created from it
pub struct VulkanContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue: Mutex<vk::Queue>,
    pub queue_family: u32,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub binder: VulkanBinder,
    pub layouts: LayoutCache<VulkanBinder>,
    pub pools: PoolManager<VulkanBinder>,
    pub sink: Arc<DebugSink>,
    // Must be dropped after the logical device
    pub instance: Arc<VulkanInstance>,
}

impl VulkanContext {
    /// Find a suitable memory type index
    pub fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            (type_filter & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }

    /// Record `record` into a throwaway command buffer and wait for it
    pub fn immediate(&self, record: impl FnOnce(vk::CommandBuffer)) -> Result<()> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }?;

        let result = (|| -> Result<()> {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }?[0];
            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cmd, &begin_info) }?;
            record(cmd);
            unsafe { self.device.end_command_buffer(cmd) }?;

            let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }?;
            let submit = vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&cmd)).build();
            let submitted = {
                let queue = self.queue.lock();
                unsafe { self.device.queue_submit(*queue, &[submit], fence) }
            };
            let waited = submitted.and_then(|_| unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) });
            unsafe { self.device.destroy_fence(fence, None) };
            waited?;
            Ok(())
        })();

        unsafe { self.device.destroy_command_pool(pool, None) };
        result
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        self.pools.destroy(&self.binder);
        self.layouts.destroy(&self.binder);
        unsafe { self.device.destroy_device(None) };
    }
}

pub struct VulkanDevice {
    context: Arc<VulkanContext>,
}

impl VulkanDevice {
    pub fn new(instance: Arc<VulkanInstance>, forbidden: &[u64], sink: Arc<DebugSink>) -> Result<Self> {
        let (physical_device, queue_family) = pick_physical_device(&instance.instance, forbidden).map_err(|e| {
            sink.error(format!("(Vulkan) {:#}", e));
            Error::InitializationFailed
        })?;

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();
        let create_info =
            vk::DeviceCreateInfo::builder().queue_create_infos(std::slice::from_ref(&queue_create_info));
        let device = unsafe { instance.instance.create_device(physical_device, &create_info, None) }?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let properties = unsafe { instance.instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.instance.get_physical_device_memory_properties(physical_device) };

        log::info!("Selected GPU: {}", device_name(&properties));
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        if sink.is_high_level() {
            sink.info(format!("(Vulkan) created device on {}", device_name(&properties)));
        }

        Ok(Self {
            context: Arc::new(VulkanContext {
                binder: VulkanBinder::new(device.clone()),
                device,
                physical_device,
                queue: Mutex::new(queue),
                queue_family,
                properties,
                memory_properties,
                layouts: LayoutCache::new(),
                pools: PoolManager::new(),
                sink,
                instance,
            }),
        })
    }

    pub fn context(&self) -> &Arc<VulkanContext> {
        &self.context
    }

    pub fn name(&self) -> String {
        device_name(&self.context.properties)
    }

    /// Identity of the physical device inside the backend's instance
    pub fn adapter_id(&self) -> u64 {
        self.context.physical_device.as_raw()
    }

    pub(crate) fn create_buffer(&self, size: u64, usage: BufferUsage) -> Result<BufferImpl> {
        VulkanBuffer::new(&self.context, size, usage).map(BufferImpl::Vulkan)
    }

    pub(crate) fn upload(&self, buffer: &BufferImpl, data: &[u8]) -> Result<()> {
        match buffer {
            BufferImpl::Vulkan(buffer) => buffer.write(data),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub fn is_image_format_valid(&self, format: ImageFormat, ty: ImageType, usage: ImageUsage) -> bool {
        let Some(vk_format) = image::vk_format(format) else {
            return false;
        };
        let properties = unsafe {
            self.context.instance.instance.get_physical_device_image_format_properties(
                self.context.physical_device,
                vk_format,
                image::vk_image_type(ty),
                vk::ImageTiling::OPTIMAL,
                image::vk_image_usage(usage),
                image::vk_create_flags(ty),
            )
        };
        properties.is_ok()
    }

    pub(crate) fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageImpl> {
        VulkanImage::new(&self.context, info).map(ImageImpl::Vulkan)
    }

    pub(crate) fn create_pipeline(&self, info: &ComputePipelineCreateInfo) -> Result<VulkanPipeline> {
        VulkanPipeline::new(&self.context, info)
    }

    pub fn create_fence(&self) -> Result<VulkanFence> {
        VulkanFence::new(&self.context)
    }

    pub fn create_command_list(&self) -> Result<VulkanCommandList> {
        VulkanCommandList::new(self.context.clone())
    }

    pub fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: Duration) -> Result<()> {
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe { self.context.device.wait_for_fences(fences, wait_all, timeout) }?;
        Ok(())
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn pick_physical_device(instance: &ash::Instance, forbidden: &[u64]) -> anyhow::Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.context("Failed to enumerate adapters")?;

    if devices.is_empty() {
        anyhow::bail!("No Vulkan-capable GPU found");
    }

    // Score each device
    let mut best_device = None;
    let mut best_score = 0u64;

    for device in devices {
        if forbidden.contains(&device.as_raw()) {
            continue;
        }
        let Some(compute_family) = compute_queue_family(instance, device) else {
            continue;
        };

        let props = unsafe { instance.get_physical_device_properties(device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(device) };

        // Prefer discrete GPUs, then bigger device-local heaps
        let type_score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1_000_000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100_000,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 10_000,
            _ => 1,
        };
        let local_mib: u64 = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size >> 20)
            .sum();
        let score = type_score + local_mib.min(99_999) + u64::from(props.limits.max_compute_work_group_invocations);

        log::debug!("Adapter {} scored {}", device_name(&props), score);
        if score > best_score {
            best_score = score;
            best_device = Some((device, compute_family));
        }
    }

    best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
}
