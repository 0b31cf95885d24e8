// Vulkan compute pipelines
//
// Set 0 holds read-only resources, set 1 read-write resources and set 2
// uniform buffers. The workgroup size comes from the shader itself.

use ash::vk;
use std::ffi::CString;
use std::io::Cursor;
use std::sync::Arc;

use super::descriptor::VulkanBinder;
use super::VulkanContext;
use crate::binding::{pipeline_layouts, PipelineLayouts};
use crate::error::{Error, Result};
use crate::types::ComputePipelineCreateInfo;

pub struct VulkanPipeline {
    context: Arc<VulkanContext>,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layouts: PipelineLayouts<VulkanBinder>,
}

/// Load SPIR-V from bytes and create a shader module
fn create_shader_module(context: &VulkanContext, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv checks length and magic and fixes alignment and endianness
    let words = ash::util::read_spv(&mut Cursor::new(code)).map_err(|e| {
        context.sink.error(format!("(Vulkan) invalid SPIR-V: {}", e));
        Error::InitializationFailed
    })?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
    let module = unsafe { context.device.create_shader_module(&create_info, None) }?;
    Ok(module)
}

impl VulkanPipeline {
    pub fn new(context: &Arc<VulkanContext>, info: &ComputePipelineCreateInfo) -> Result<Self> {
        let device = &context.device;
        let set_layouts = pipeline_layouts(
            &context.layouts,
            &context.binder,
            (info.num_readonly_storage_images, info.num_readonly_storage_buffers),
            (info.num_readwrite_storage_images, info.num_readwrite_storage_buffers),
            info.num_uniform_buffers,
        )?;

        let raw_layouts = set_layouts.each_ref().map(|layout| layout.raw);
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&raw_layouts);
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }?;

        let module = match create_shader_module(context, info.code) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        let entrypoint = CString::new(info.entrypoint).map_err(|_| Error::InitializationFailed);
        let pipeline = entrypoint.and_then(|entrypoint| {
            let stage = vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(&entrypoint)
                .build();
            let create_info = vk::ComputePipelineCreateInfo::builder()
                .stage(stage)
                .layout(layout)
                .build();
            unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None) }
                .map(|pipelines| pipelines[0])
                .map_err(|(_, e)| e.into())
        });

        // The module is no longer needed once the pipeline exists
        unsafe { device.destroy_shader_module(module, None) };

        let pipeline = match pipeline {
            Ok(pipeline) => pipeline,
            Err(e) => {
                context
                    .sink
                    .error(format!("(Vulkan) failed to create compute pipeline '{}': {}", info.entrypoint, e));
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        log::debug!("Vulkan pipeline '{}'", info.entrypoint);
        Ok(Self {
            context: context.clone(),
            pipeline,
            layout,
            set_layouts,
        })
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_pipeline(self.pipeline, None);
            self.context.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
