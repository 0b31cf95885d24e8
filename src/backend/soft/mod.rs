// CPU fallback backend
//
// Interprets SPIR-V compute shaders on a worker pool. Always available, so
// it sits last in the registry.

pub mod binding;
pub mod command_list;
pub mod executor;
pub mod fence;
pub mod memory;
pub mod pipeline;
pub mod spirv;

use std::sync::Arc;

use self::binding::SoftBinder;
use self::command_list::SoftCommandList;
use self::executor::SoftExecutor;
use self::fence::SoftFence;
use self::memory::{SoftImage, SoftMemory};
use self::pipeline::SoftPipeline;
use crate::binding::{LayoutCache, PoolManager};
use crate::buffer::BufferImpl;
use crate::config::PulseConfig;
use crate::debug::DebugSink;
use crate::error::Result;
use crate::image::ImageImpl;
use crate::pipeline::PipelineImpl;
use crate::types::{ComputePipelineCreateInfo, ImageCreateInfo, ImageFormat, ImageType, ImageUsage, ShaderFormats};

/// Shader formats the interpreter consumes
pub const SHADER_FORMATS: ShaderFormats = ShaderFormats::SPIRV;

/// Everything a CPU device shares with its command lists
pub struct SoftContext {
    pub binder: SoftBinder,
    pub layouts: LayoutCache<SoftBinder>,
    pub pools: PoolManager<SoftBinder>,
    pub executor: SoftExecutor,
    pub sink: Arc<DebugSink>,
}

impl Drop for SoftContext {
    fn drop(&mut self) {
        self.pools.destroy(&self.binder);
        self.layouts.destroy(&self.binder);
    }
}

pub struct SoftDevice {
    context: Arc<SoftContext>,
    worker_threads: usize,
}

impl SoftDevice {
    pub fn new(sink: Arc<DebugSink>, config: &PulseConfig) -> Result<Self> {
        let worker_threads = config.worker_threads();
        let executor = SoftExecutor::new(worker_threads, sink.clone())?;
        if sink.is_high_level() {
            sink.info(format!("(Soft) created device with {} worker threads", worker_threads));
        }
        Ok(Self {
            context: Arc::new(SoftContext {
                binder: SoftBinder,
                layouts: LayoutCache::new(),
                pools: PoolManager::new(),
                executor,
                sink,
            }),
            worker_threads,
        })
    }

    pub fn context(&self) -> &Arc<SoftContext> {
        &self.context
    }

    pub fn name(&self) -> String {
        format!("CPU ({} threads)", self.worker_threads)
    }

    /// There is only one CPU adapter
    pub fn adapter_id(&self) -> u64 {
        0
    }

    pub(crate) fn create_buffer(&self, size: u64) -> Result<BufferImpl> {
        let memory = SoftMemory::new(size as usize)?;
        Ok(BufferImpl::Soft(Arc::new(memory)))
    }

    pub(crate) fn upload(&self, buffer: &BufferImpl, data: &[u8]) -> Result<()> {
        match buffer {
            BufferImpl::Soft(memory) => {
                memory.write(0, data);
                Ok(())
            }
            #[cfg(feature = "vulkan")]
            _ => Err(crate::error::Error::InvalidHandle),
        }
    }

    pub fn is_image_format_valid(format: ImageFormat, _ty: ImageType, _usage: ImageUsage) -> bool {
        format != ImageFormat::Invalid && !format.is_block_compressed()
    }

    pub(crate) fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageImpl> {
        let image = SoftImage::new(
            info.ty,
            info.format,
            info.width,
            info.height,
            info.layer_count_or_depth,
        )?;
        Ok(ImageImpl::Soft(Arc::new(image)))
    }

    pub(crate) fn create_pipeline(&self, info: &ComputePipelineCreateInfo) -> Result<PipelineImpl> {
        let pipeline = SoftPipeline::new(&self.context, info)?;
        Ok(PipelineImpl::Soft(Arc::new(pipeline)))
    }

    pub fn create_fence(&self) -> Arc<SoftFence> {
        Arc::new(SoftFence::new(true))
    }

    pub fn create_command_list(&self) -> SoftCommandList {
        SoftCommandList::new(self.context.clone())
    }
}
