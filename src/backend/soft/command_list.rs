// CPU command lists
//
// Commands are recorded as plain values holding their own references to the
// memory they touch. Submitting hands the whole list to the executor queue.

use std::sync::Arc;

use super::binding::{SoftBinder, SoftGroup};
use super::executor::Submission;
use super::fence::SoftFence;
use super::memory::{SoftImage, SoftMemory};
use super::pipeline::SoftPipeline;
use super::SoftContext;
use crate::binding::{BindingCategory, PassGroups};
use crate::buffer::BufferInner;
use crate::command_list::DispatchSize;
use crate::compute_pass::{DirtyFlags, PassBindings};
use crate::error::Result;
use crate::image::{ImageInner, TexelBox};
use crate::pipeline::PipelineInner;

pub(crate) enum SoftDispatchSize {
    Direct([u32; 3]),
    Indirect { memory: Arc<SoftMemory>, offset: usize },
}

pub(crate) enum SoftCommand {
    Dispatch {
        pipeline: Arc<SoftPipeline>,
        groups: [Option<SoftGroup>; 3],
        size: SoftDispatchSize,
    },
    CopyBufferToBuffer {
        src: Arc<SoftMemory>,
        src_offset: usize,
        dst: Arc<SoftMemory>,
        dst_offset: usize,
        size: usize,
    },
    CopyBufferToImage {
        src: Arc<SoftMemory>,
        offset: usize,
        dst: Arc<SoftImage>,
        region: TexelBox,
    },
    CopyImageToBuffer {
        src: Arc<SoftImage>,
        region: TexelBox,
        dst: Arc<SoftMemory>,
        offset: usize,
    },
    BlitImage {
        src: Arc<SoftImage>,
        src_region: TexelBox,
        dst: Arc<SoftImage>,
        dst_region: TexelBox,
    },
}

pub struct SoftCommandList {
    context: Arc<SoftContext>,
    commands: Vec<SoftCommand>,
    groups: PassGroups<SoftBinder>,
    /// Signaled when the last submission of this list has finished
    done: Arc<SoftFence>,
}

impl SoftCommandList {
    pub fn new(context: Arc<SoftContext>) -> Self {
        Self {
            context,
            commands: Vec::new(),
            groups: PassGroups::new(),
            done: Arc::new(SoftFence::new(true)),
        }
    }

    pub fn bind_pipeline(&mut self, pipeline: &PipelineInner) -> Result<()> {
        pipeline.soft().map(|_| ())
    }

    pub(crate) fn dispatch(
        &mut self,
        pipeline: &PipelineInner,
        bindings: &PassBindings,
        dirty: &mut DirtyFlags,
        size: DispatchSize,
    ) -> Result<()> {
        let pipeline = pipeline.soft()?.clone();
        self.groups.rebuild(
            &self.context.binder,
            &self.context.pools,
            &pipeline.layouts,
            bindings,
            dirty,
        )?;

        let size = match size {
            DispatchSize::Direct(counts) => SoftDispatchSize::Direct(counts),
            DispatchSize::Indirect { buffer, offset } => SoftDispatchSize::Indirect {
                memory: buffer.soft()?.clone(),
                offset: offset as usize,
            },
        };
        let groups = BindingCategory::ALL.map(|category| self.groups.current(category).cloned());
        self.commands.push(SoftCommand::Dispatch { pipeline, groups, size });
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
        self.commands.push(SoftCommand::CopyBufferToBuffer {
            src: src.soft()?.clone(),
            src_offset: src_offset as usize,
            dst: dst.soft()?.clone(),
            dst_offset: dst_offset as usize,
            size: size as usize,
        });
        Ok(())
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &BufferInner,
        offset: u64,
        dst: &ImageInner,
        region: TexelBox,
    ) -> Result<()> {
        self.commands.push(SoftCommand::CopyBufferToImage {
            src: src.soft()?.clone(),
            offset: offset as usize,
            dst: dst.soft()?.clone(),
            region,
        });
        Ok(())
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: &ImageInner,
        region: TexelBox,
        dst: &BufferInner,
        offset: u64,
    ) -> Result<()> {
        self.commands.push(SoftCommand::CopyImageToBuffer {
            src: src.soft()?.clone(),
            region,
            dst: dst.soft()?.clone(),
            offset: offset as usize,
        });
        Ok(())
    }

    pub fn blit_image(
        &mut self,
        src: &ImageInner,
        src_region: TexelBox,
        dst: &ImageInner,
        dst_region: TexelBox,
    ) -> Result<()> {
        self.commands.push(SoftCommand::BlitImage {
            src: src.soft()?.clone(),
            src_region,
            dst: dst.soft()?.clone(),
            dst_region,
        });
        Ok(())
    }

    pub fn submit(&mut self, fence: Option<Arc<SoftFence>>) -> Result<()> {
        let commands = std::mem::take(&mut self.commands);
        self.done.reset();
        if let Some(fence) = &fence {
            fence.reset();
        }
        let result = self.context.executor.submit(Submission {
            commands,
            fence,
            done: self.done.clone(),
        });
        if result.is_err() {
            self.done.signal();
        }
        result
    }

    pub fn is_complete(&self) -> bool {
        self.done.is_signaled()
    }

    pub fn wait(&self) {
        self.done.wait();
    }

    /// Drop recorded commands and give back any deferred groups
    pub fn release(&mut self) -> Result<()> {
        self.done.wait();
        self.commands.clear();
        self.groups.retire_all(&self.context.pools)?;
        self.groups.recycle(&self.context.pools)
    }

    pub fn recorded(&self) -> usize {
        self.commands.len()
    }
}
