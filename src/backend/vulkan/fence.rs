// Vulkan fences
//
// Created signaled, so a fence never submitted with anything reads as ready.

use ash::vk;
use std::sync::Arc;

use super::VulkanContext;
use crate::error::Result;

/// Longest a dropped fence waits for pending work to signal it
const DROP_WAIT_NS: u64 = 10_000_000_000;

pub struct VulkanFence {
    context: Arc<VulkanContext>,
    fence: vk::Fence,
}

impl VulkanFence {
    pub fn new(context: &Arc<VulkanContext>) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe { context.device.create_fence(&fence_info, None) }?;
        Ok(Self {
            context: context.clone(),
            fence,
        })
    }

    pub fn raw(&self) -> vk::Fence {
        self.fence
    }

    pub fn is_signaled(&self) -> bool {
        unsafe { self.context.device.get_fence_status(self.fence) }.unwrap_or(false)
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.context.device.reset_fences(&[self.fence]) }?;
        Ok(())
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            // A pending fence may still be signaled by the queue
            let _ = self.context.device.wait_for_fences(&[self.fence], true, DROP_WAIT_NS);
            self.context.device.destroy_fence(self.fence, None);
        }
    }
}
