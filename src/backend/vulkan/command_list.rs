// Vulkan command lists
//
// Each list owns a command pool with one primary command buffer, begun at
// creation. A full memory barrier follows every command so work executes in
// the order it was recorded.

use ash::vk;
use std::sync::Arc;

use super::descriptor::VulkanBinder;
use super::fence::VulkanFence;
use super::image::{box_offset_extent, color_layers};
use super::pipeline::VulkanPipeline;
use super::VulkanContext;
use crate::binding::{BindingCategory, PassGroups};
use crate::buffer::BufferInner;
use crate::command_list::DispatchSize;
use crate::compute_pass::{DirtyFlags, PassBindings};
use crate::error::Result;
use crate::image::{ImageInner, TexelBox};
use crate::pipeline::PipelineInner;

pub struct VulkanCommandList {
    context: Arc<VulkanContext>,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    /// Signaled once the submitted command buffer has finished
    done: vk::Fence,
    groups: PassGroups<VulkanBinder>,
    /// Pipelines referenced by recorded commands
    pipelines: Vec<Arc<VulkanPipeline>>,
    recording: bool,
    recorded: usize,
}

impl VulkanCommandList {
    pub fn new(context: Arc<VulkanContext>) -> Result<Self> {
        let device = &context.device;
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }?;

        let created = (|| -> Result<(vk::CommandBuffer, vk::Fence)> {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }?[0];
            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin_info) }?;
            let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
            let done = unsafe { device.create_fence(&fence_info, None) }?;
            Ok((cmd, done))
        })();

        let (cmd, done) = match created {
            Ok(created) => created,
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e);
            }
        };

        Ok(Self {
            context,
            pool,
            cmd,
            done,
            groups: PassGroups::new(),
            pipelines: Vec::new(),
            recording: true,
            recorded: 0,
        })
    }

    // TODO: track written resources and narrow this to buffer/image barriers
    fn barrier(&self) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::SHADER_WRITE
                    | vk::AccessFlags::TRANSFER_READ
                    | vk::AccessFlags::TRANSFER_WRITE
                    | vk::AccessFlags::INDIRECT_COMMAND_READ
                    | vk::AccessFlags::HOST_READ,
            )
            .build();
        unsafe {
            self.context.device.cmd_pipeline_barrier(
                self.cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER
                    | vk::PipelineStageFlags::TRANSFER
                    | vk::PipelineStageFlags::DRAW_INDIRECT
                    | vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    pub fn bind_pipeline(&mut self, pipeline: &PipelineInner) -> Result<()> {
        let native = pipeline.vulkan()?;
        unsafe {
            self.context
                .device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::COMPUTE, native.pipeline);
        }
        if !self.pipelines.iter().any(|p| Arc::ptr_eq(p, native)) {
            self.pipelines.push(native.clone());
        }
        Ok(())
    }

    pub(crate) fn dispatch(
        &mut self,
        pipeline: &PipelineInner,
        bindings: &PassBindings,
        dirty: &mut DirtyFlags,
        size: DispatchSize,
    ) -> Result<()> {
        let native = pipeline.vulkan()?;
        self.groups.rebuild(
            &self.context.binder,
            &self.context.pools,
            &native.set_layouts,
            bindings,
            dirty,
        )?;

        let device = &self.context.device;
        for category in BindingCategory::ALL {
            if let Some(set) = self.groups.current(category) {
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        self.cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        native.layout,
                        category.set_index(),
                        &[*set],
                        &[],
                    );
                }
            }
        }

        match size {
            DispatchSize::Direct([x, y, z]) => unsafe { device.cmd_dispatch(self.cmd, x, y, z) },
            DispatchSize::Indirect { buffer, offset } => {
                let raw = buffer.vulkan()?.buffer;
                unsafe { device.cmd_dispatch_indirect(self.cmd, raw, offset) }
            }
        }
        self.barrier();
        self.recorded += 1;
        Ok(())
    }

    pub fn end_pass(&mut self) -> Result<()> {
        self.groups.retire_all(&self.context.pools)
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &BufferInner,
        src_offset: u64,
        dst: &BufferInner,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.context
                .device
                .cmd_copy_buffer(self.cmd, src.vulkan()?.buffer, dst.vulkan()?.buffer, &[region]);
        }
        self.barrier();
        self.recorded += 1;
        Ok(())
    }

    fn buffer_image_copy(offset: u64, region: &TexelBox) -> vk::BufferImageCopy {
        let (image_offset, image_extent) = box_offset_extent(region);
        vk::BufferImageCopy {
            buffer_offset: offset,
            // Tightly packed
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: color_layers(region.layer, 1),
            image_offset,
            image_extent,
        }
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &BufferInner,
        offset: u64,
        dst: &ImageInner,
        region: TexelBox,
    ) -> Result<()> {
        let copy = Self::buffer_image_copy(offset, &region);
        unsafe {
            self.context.device.cmd_copy_buffer_to_image(
                self.cmd,
                src.vulkan()?.buffer,
                dst.vulkan()?.image,
                vk::ImageLayout::GENERAL,
                &[copy],
            );
        }
        self.barrier();
        self.recorded += 1;
        Ok(())
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: &ImageInner,
        region: TexelBox,
        dst: &BufferInner,
        offset: u64,
    ) -> Result<()> {
        let copy = Self::buffer_image_copy(offset, &region);
        unsafe {
            self.context.device.cmd_copy_image_to_buffer(
                self.cmd,
                src.vulkan()?.image,
                vk::ImageLayout::GENERAL,
                dst.vulkan()?.buffer,
                &[copy],
            );
        }
        self.barrier();
        self.recorded += 1;
        Ok(())
    }

    pub fn blit_image(
        &mut self,
        src: &ImageInner,
        src_region: TexelBox,
        dst: &ImageInner,
        dst_region: TexelBox,
    ) -> Result<()> {
        let corners = |region: &TexelBox| {
            let (offset, extent) = box_offset_extent(region);
            [
                offset,
                vk::Offset3D {
                    x: offset.x + extent.width as i32,
                    y: offset.y + extent.height as i32,
                    z: offset.z + extent.depth as i32,
                },
            ]
        };
        let blit = vk::ImageBlit {
            src_subresource: color_layers(src_region.layer, 1),
            src_offsets: corners(&src_region),
            dst_subresource: color_layers(dst_region.layer, 1),
            dst_offsets: corners(&dst_region),
        };
        unsafe {
            self.context.device.cmd_blit_image(
                self.cmd,
                src.vulkan()?.image,
                vk::ImageLayout::GENERAL,
                dst.vulkan()?.image,
                vk::ImageLayout::GENERAL,
                &[blit],
                vk::Filter::NEAREST,
            );
        }
        self.barrier();
        self.recorded += 1;
        Ok(())
    }

    /// Queue the command buffer. The caller's fence is signaled by an empty
    /// batch submitted right after, which completes only once every earlier
    /// batch on the queue has.
    pub fn submit(&mut self, fence: Option<&VulkanFence>) -> Result<()> {
        let device = &self.context.device;
        if self.recording {
            self.recording = false;
            unsafe { device.end_command_buffer(self.cmd) }?;
        }
        unsafe { device.reset_fences(&[self.done]) }?;
        if let Some(fence) = fence {
            fence.reset()?;
        }

        let submit = vk::SubmitInfo::builder()
            .command_buffers(std::slice::from_ref(&self.cmd))
            .build();
        let queue = self.context.queue.lock();
        unsafe { device.queue_submit(*queue, &[submit], self.done) }?;
        if let Some(fence) = fence {
            unsafe { device.queue_submit(*queue, &[], fence.raw()) }?;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        // A lost device completes nothing further, report it as done
        unsafe { self.context.device.get_fence_status(self.done) }.unwrap_or(true)
    }

    fn wait(&self) -> Result<()> {
        unsafe { self.context.device.wait_for_fences(&[self.done], true, u64::MAX) }?;
        Ok(())
    }

    /// Wait for the GPU, then give descriptor sets back to their pools
    pub fn release(&mut self) -> Result<()> {
        self.wait()?;
        self.groups.retire_all(&self.context.pools)?;
        self.groups.recycle(&self.context.pools)?;
        self.pipelines.clear();
        Ok(())
    }

    pub fn recorded(&self) -> usize {
        self.recorded
    }
}

impl Drop for VulkanCommandList {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            log::error!("Failed to wait for command list: {}", e);
        }
        unsafe {
            self.context.device.destroy_fence(self.done, None);
            // Frees the command buffer with it
            self.context.device.destroy_command_pool(self.pool, None);
        }
    }
}
