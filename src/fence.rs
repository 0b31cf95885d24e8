// Completion fences

use std::sync::Arc;

use crate::backend::soft::fence::SoftFence;
#[cfg(feature = "vulkan")]
use crate::backend::vulkan::fence::VulkanFence;

pub(crate) enum FenceImpl {
    Soft(Arc<SoftFence>),
    #[cfg(feature = "vulkan")]
    Vulkan(VulkanFence),
}

pub struct FenceInner {
    pub(crate) device_id: u64,
    pub(crate) imp: FenceImpl,
}

/// Signaled by the backend once the work submitted with it has completed.
/// A new fence starts signaled.
pub struct Fence {
    pub(crate) inner: Arc<FenceInner>,
}

impl Fence {
    pub fn is_ready(&self) -> bool {
        match &self.inner.imp {
            FenceImpl::Soft(fence) => fence.is_signaled(),
            #[cfg(feature = "vulkan")]
            FenceImpl::Vulkan(fence) => fence.is_signaled(),
        }
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence").field("ready", &self.is_ready()).finish()
    }
}
