// Compute pipelines

use std::sync::Arc;

use crate::backend::soft::pipeline::SoftPipeline;
#[cfg(feature = "vulkan")]
use crate::backend::vulkan::pipeline::VulkanPipeline;
use crate::binding::{BindingCategory, LayoutSignature};
#[cfg(feature = "vulkan")]
use crate::error::Error;
use crate::error::Result;
use crate::types::ComputePipelineCreateInfo;

pub(crate) enum PipelineImpl {
    Soft(Arc<SoftPipeline>),
    #[cfg(feature = "vulkan")]
    Vulkan(Arc<VulkanPipeline>),
}

pub struct PipelineInner {
    pub(crate) device_id: u64,
    pub(crate) signatures: [LayoutSignature; 3],
    pub(crate) imp: PipelineImpl,
}

impl PipelineInner {
    pub(crate) fn new(device_id: u64, info: &ComputePipelineCreateInfo, imp: PipelineImpl) -> Self {
        Self {
            device_id,
            signatures: [
                LayoutSignature::read_only(info.num_readonly_storage_images, info.num_readonly_storage_buffers),
                LayoutSignature::read_write(info.num_readwrite_storage_images, info.num_readwrite_storage_buffers),
                LayoutSignature::uniform(info.num_uniform_buffers),
            ],
            imp,
        }
    }

    pub(crate) fn soft(&self) -> Result<&Arc<SoftPipeline>> {
        match &self.imp {
            PipelineImpl::Soft(pipeline) => Ok(pipeline),
            #[cfg(feature = "vulkan")]
            _ => Err(Error::InvalidHandle),
        }
    }

    #[cfg(feature = "vulkan")]
    pub(crate) fn vulkan(&self) -> Result<&Arc<VulkanPipeline>> {
        match &self.imp {
            PipelineImpl::Vulkan(pipeline) => Ok(pipeline),
            _ => Err(Error::InvalidHandle),
        }
    }
}

/// A compiled compute shader together with its binding layouts.
/// Destroy it with `Device::destroy_compute_pipeline`.
pub struct ComputePipeline {
    pub(crate) inner: Arc<PipelineInner>,
}

impl ComputePipeline {
    /// Binding counts the pipeline expects for one category
    pub fn layout_signature(&self, category: BindingCategory) -> LayoutSignature {
        self.inner.signatures[category as usize]
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("signatures", &self.inner.signatures)
            .finish()
    }
}
