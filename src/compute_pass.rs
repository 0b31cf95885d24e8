// Compute pass recording
//
// A pass tracks which resources are bound per category and which categories
// changed since the last dispatch. Groups are rebuilt lazily, right before a
// dispatch is recorded, and only for dirty categories.

use bitflags::bitflags;
use std::sync::Arc;

use crate::binding::{BindingCategory, GroupResources, LayoutSignature};
use crate::buffer::{Buffer, BufferInner};
use crate::command_list::{CommandList, DispatchSize};
use crate::error::{Error, Result};
use crate::image::{Image, ImageInner};
use crate::pipeline::{ComputePipeline, PipelineInner};
use crate::types::{BufferUsage, ImageUsage};

/// Slots per resource array of a pass
pub const MAX_BOUND_SLOTS: usize = 8;

bitflags! {
    /// Categories whose bound resources changed since their group was built
    #[derive(Default)]
    pub struct DirtyFlags: u8 {
        const READ_ONLY = 1 << 0;
        const READ_WRITE = 1 << 1;
        const UNIFORM = 1 << 2;
    }
}

impl DirtyFlags {
    pub fn of(category: BindingCategory) -> Self {
        match category {
            BindingCategory::ReadOnly => DirtyFlags::READ_ONLY,
            BindingCategory::ReadWrite => DirtyFlags::READ_WRITE,
            BindingCategory::Uniform => DirtyFlags::UNIFORM,
        }
    }
}

type Slots<T> = [Option<Arc<T>>; MAX_BOUND_SLOTS];

/// Resources currently bound to a pass, per category
#[derive(Clone, Default)]
pub struct PassBindings {
    pub(crate) read_only_images: Slots<ImageInner>,
    pub(crate) read_only_buffers: Slots<BufferInner>,
    pub(crate) read_write_images: Slots<ImageInner>,
    pub(crate) read_write_buffers: Slots<BufferInner>,
    pub(crate) uniform_buffers: Slots<BufferInner>,
    /// Last bytes uploaded per uniform slot
    pub(crate) uniform_data: [Option<Vec<u8>>; MAX_BOUND_SLOTS],
}

fn gather<T>(slots: &Slots<T>, count: u32) -> Result<Vec<Arc<T>>> {
    if count as usize > MAX_BOUND_SLOTS {
        return Err(Error::InvalidHandle);
    }
    slots[..count as usize]
        .iter()
        .map(|slot| slot.clone().ok_or(Error::InvalidHandle))
        .collect()
}

fn occupied<T>(slots: &Slots<T>) -> usize {
    slots.iter().filter(|s| s.is_some()).count()
}

impl PassBindings {
    /// True when no resource of any category is bound
    pub fn is_empty(&self) -> bool {
        self.bound_count(BindingCategory::ReadOnly) == 0
            && self.bound_count(BindingCategory::ReadWrite) == 0
            && self.bound_count(BindingCategory::Uniform) == 0
    }

    /// Number of occupied slots (images and buffers) in a category
    pub fn bound_count(&self, category: BindingCategory) -> usize {
        match category {
            BindingCategory::ReadOnly => occupied(&self.read_only_images) + occupied(&self.read_only_buffers),
            BindingCategory::ReadWrite => occupied(&self.read_write_images) + occupied(&self.read_write_buffers),
            BindingCategory::Uniform => occupied(&self.uniform_buffers),
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    /// Resources a group of `signature` needs, images first.
    /// A slot the layout expects but nobody bound is an invalid handle.
    pub(crate) fn resources_for(
        &self,
        category: BindingCategory,
        signature: &LayoutSignature,
    ) -> Result<GroupResources> {
        let (images, buffers) = signature.binding_counts();
        Ok(match category {
            BindingCategory::ReadOnly => GroupResources {
                images: gather(&self.read_only_images, images)?,
                buffers: gather(&self.read_only_buffers, buffers)?,
            },
            BindingCategory::ReadWrite => GroupResources {
                images: gather(&self.read_write_images, images)?,
                buffers: gather(&self.read_write_buffers, buffers)?,
            },
            BindingCategory::Uniform => GroupResources {
                images: Vec::new(),
                buffers: gather(&self.uniform_buffers, buffers)?,
            },
        })
    }
}

/// Write `items` into the front of `slots`, returning whether anything changed
fn assign<T>(slots: &mut Slots<T>, items: impl Iterator<Item = Arc<T>>) -> bool {
    let mut changed = false;
    for (slot, item) in slots.iter_mut().zip(items) {
        let same = matches!(slot, Some(current) if Arc::ptr_eq(current, &item));
        if !same {
            *slot = Some(item);
            changed = true;
        }
    }
    changed
}

/// Pass-level state kept on the command list between passes
#[derive(Default)]
pub(crate) struct PassState {
    pub bindings: PassBindings,
    pub dirty: DirtyFlags,
    pub pipeline: Option<Arc<PipelineInner>>,
    pub recording: bool,
}

/// A compute pass borrowed from its command list.
///
/// Ending the pass, explicitly or by dropping it, returns every bind group
/// and clears the bound resources.
pub struct ComputePass<'a> {
    list: &'a mut CommandList,
    ended: bool,
}

impl<'a> ComputePass<'a> {
    pub(crate) fn new(list: &'a mut CommandList) -> Self {
        Self { list, ended: false }
    }

    pub fn bindings(&self) -> &PassBindings {
        &self.list.pass.bindings
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.list.pass.dirty
    }

    /// Bind storage buffers to consecutive slots starting at 0.
    ///
    /// The first buffer decides the category: a `STORAGE_WRITE` buffer goes
    /// to the read-write array, anything else to the read-only array. All
    /// buffers are validated before any slot changes.
    pub fn bind_storage_buffers(&mut self, buffers: &[&Buffer]) -> Result<()> {
        let Some(first) = buffers.first() else {
            return Ok(());
        };
        let device = self.list.device.clone();
        let sink = device.sink();
        if buffers.len() > MAX_BOUND_SLOTS {
            sink.error(format!("cannot bind more than {} storage buffers", MAX_BOUND_SLOTS));
            return Err(Error::InvalidBufferUsage);
        }

        let writable = first.usage().is_writable();
        for buffer in buffers {
            if buffer.inner.device_id != device.id {
                return Err(Error::InvalidDevice);
            }
            if !buffer
                .usage()
                .intersects(BufferUsage::STORAGE_READ | BufferUsage::STORAGE_WRITE)
            {
                sink.error("cannot bind a buffer without storage usage");
                return Err(Error::InvalidBufferUsage);
            }
            match (writable, buffer.usage().is_writable()) {
                (true, false) => {
                    sink.error("cannot bind a read only buffer with read-write buffers");
                    return Err(Error::InvalidBufferUsage);
                }
                (false, true) => {
                    sink.error("cannot bind a read-write buffer with read only buffers");
                    return Err(Error::InvalidBufferUsage);
                }
                _ => {}
            }
        }

        let pass = &mut self.list.pass;
        let (slots, flag) = if writable {
            (&mut pass.bindings.read_write_buffers, DirtyFlags::READ_WRITE)
        } else {
            (&mut pass.bindings.read_only_buffers, DirtyFlags::READ_ONLY)
        };
        if assign(slots, buffers.iter().map(|b| b.inner.clone())) {
            pass.dirty |= flag;
        }
        Ok(())
    }

    /// Bind storage images to consecutive slots starting at 0, with the same
    /// category rule as buffers
    pub fn bind_storage_images(&mut self, images: &[&Image]) -> Result<()> {
        let Some(first) = images.first() else {
            return Ok(());
        };
        let device = self.list.device.clone();
        let sink = device.sink();
        if images.len() > MAX_BOUND_SLOTS {
            sink.error(format!("cannot bind more than {} storage images", MAX_BOUND_SLOTS));
            return Err(Error::InvalidImageUsage);
        }

        let writable = first.usage().is_writable();
        for image in images {
            if image.inner.device_id != device.id {
                return Err(Error::InvalidDevice);
            }
            if !image.usage().intersects(ImageUsage::STORAGE_READ) && !image.usage().is_writable() {
                sink.error("cannot bind an image without storage usage");
                return Err(Error::InvalidImageUsage);
            }
            match (writable, image.usage().is_writable()) {
                (true, false) => {
                    sink.error("cannot bind a read only image with read-write images");
                    return Err(Error::InvalidImageUsage);
                }
                (false, true) => {
                    sink.error("cannot bind a read-write image with read only images");
                    return Err(Error::InvalidImageUsage);
                }
                _ => {}
            }
        }

        let pass = &mut self.list.pass;
        let (slots, flag) = if writable {
            (&mut pass.bindings.read_write_images, DirtyFlags::READ_WRITE)
        } else {
            (&mut pass.bindings.read_only_images, DirtyFlags::READ_ONLY)
        };
        if assign(slots, images.iter().map(|i| i.inner.clone())) {
            pass.dirty |= flag;
        }
        Ok(())
    }

    /// Upload `data` into an internal uniform buffer bound at `slot`.
    /// Identical bytes at the same slot change nothing.
    pub fn bind_uniform_data(&mut self, slot: u32, data: &[u8]) -> Result<()> {
        let slot = slot as usize;
        if slot >= MAX_BOUND_SLOTS || data.is_empty() {
            return Err(Error::InvalidRegion);
        }
        if self.list.pass.bindings.uniform_data[slot].as_deref() == Some(data) {
            return Ok(());
        }

        let buffer = self.list.device.create_uniform_buffer(data)?;
        let pass = &mut self.list.pass;
        pass.bindings.uniform_buffers[slot] = Some(buffer);
        pass.bindings.uniform_data[slot] = Some(data.to_vec());
        pass.dirty |= DirtyFlags::UNIFORM;
        Ok(())
    }

    /// Bind a pipeline. Every category is dirtied since the new pipeline may
    /// use different layouts.
    pub fn bind_compute_pipeline(&mut self, pipeline: &ComputePipeline) -> Result<()> {
        if pipeline.inner.device_id != self.list.device.id {
            return Err(Error::InvalidDevice);
        }
        let list = &mut *self.list;
        list.imp.bind_pipeline(&pipeline.inner)?;
        list.pass.pipeline = Some(pipeline.inner.clone());
        list.pass.dirty = DirtyFlags::all();
        list.bound_pipelines.push(pipeline.inner.clone());
        Ok(())
    }

    fn current_pipeline(&self) -> Result<Arc<PipelineInner>> {
        match &self.list.pass.pipeline {
            Some(pipeline) => Ok(pipeline.clone()),
            None => {
                self.list
                    .device
                    .sink()
                    .warn("cannot dispatch computations, no pipeline bound");
                Err(Error::InvalidHandle)
            }
        }
    }

    pub fn dispatch(&mut self, groupcount_x: u32, groupcount_y: u32, groupcount_z: u32) -> Result<()> {
        let pipeline = self.current_pipeline()?;
        let list = &mut *self.list;
        list.imp.dispatch(
            &pipeline,
            &list.pass.bindings,
            &mut list.pass.dirty,
            DispatchSize::Direct([groupcount_x, groupcount_y, groupcount_z]),
        )?;
        list.retain_bindings();
        Ok(())
    }

    /// Dispatch with group counts read from `buffer` at `offset` when the
    /// command executes, laid out as `IndirectDispatchCommand`
    pub fn dispatch_indirect(&mut self, buffer: &Buffer, offset: u64) -> Result<()> {
        let pipeline = self.current_pipeline()?;
        if buffer.inner.device_id != self.list.device.id {
            return Err(Error::InvalidDevice);
        }
        let size = std::mem::size_of::<crate::types::IndirectDispatchCommand>() as u64;
        if offset % 4 != 0 || !buffer.inner.contains(offset, size) {
            return Err(Error::InvalidRegion);
        }
        let list = &mut *self.list;
        list.imp.dispatch(
            &pipeline,
            &list.pass.bindings,
            &mut list.pass.dirty,
            DispatchSize::Indirect {
                buffer: buffer.inner.clone(),
                offset,
            },
        )?;
        list.retain_bindings();
        list.retain_buffer(buffer.inner.clone());
        Ok(())
    }

    pub fn end(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        let list = &mut *self.list;
        let result = list.imp.end_pass();
        list.pass.bindings.clear();
        list.pass.pipeline = None;
        list.pass.dirty = DirtyFlags::empty();
        list.pass.recording = false;
        result
    }
}

impl Drop for ComputePass<'_> {
    fn drop(&mut self) {
        if !self.ended {
            if let Err(e) = self.finish() {
                log::error!("Failed to end compute pass: {}", e);
            }
        }
    }
}
