// Command lists
//
// Lifecycle per request: Recording -> (submit) -> Sent -> (work done) -> Ready.
// A list is bound to the thread that requested it, as are the bind group
// pools its passes draw from.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::backend::soft::command_list::SoftCommandList;
#[cfg(feature = "vulkan")]
use crate::backend::vulkan::command_list::VulkanCommandList;
use crate::buffer::BufferInner;
use crate::compute_pass::{ComputePass, DirtyFlags, PassBindings, PassState};
use crate::device::DeviceShared;
use crate::error::{Error, Result};
use crate::fence::{Fence, FenceImpl, FenceInner};
use crate::image::{ImageInner, TexelBox};
use crate::pipeline::PipelineInner;
use crate::types::{BufferRegion, CommandListState, CommandListUsage, ImageRegion};

/// Group counts of a recorded dispatch
pub(crate) enum DispatchSize {
    Direct([u32; 3]),
    Indirect { buffer: Arc<BufferInner>, offset: u64 },
}

pub(crate) enum CommandListImpl {
    Soft(SoftCommandList),
    #[cfg(feature = "vulkan")]
    Vulkan(VulkanCommandList),
}

impl CommandListImpl {
    pub(crate) fn bind_pipeline(&mut self, pipeline: &PipelineInner) -> Result<()> {
        match self {
            Self::Soft(list) => list.bind_pipeline(pipeline),
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => list.bind_pipeline(pipeline),
        }
    }

    pub(crate) fn dispatch(
        &mut self,
        pipeline: &PipelineInner,
        bindings: &PassBindings,
        dirty: &mut DirtyFlags,
        size: DispatchSize,
    ) -> Result<()> {
        match self {
            Self::Soft(list) => list.dispatch(pipeline, bindings, dirty, size),
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => list.dispatch(pipeline, bindings, dirty, size),
        }
    }

    pub(crate) fn end_pass(&mut self) -> Result<()> {
        match self {
            Self::Soft(list) => list.end_pass(),
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => list.end_pass(),
        }
    }

    fn is_complete(&self) -> bool {
        match self {
            Self::Soft(list) => list.is_complete(),
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => list.is_complete(),
        }
    }

    fn submit(&mut self, fence: Option<&FenceInner>) -> Result<()> {
        match self {
            Self::Soft(list) => {
                let fence = match fence.map(|f| &f.imp) {
                    None => None,
                    Some(FenceImpl::Soft(fence)) => Some(fence.clone()),
                    #[cfg(feature = "vulkan")]
                    Some(_) => return Err(Error::InvalidHandle),
                };
                list.submit(fence)
            }
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => {
                let fence = match fence.map(|f| &f.imp) {
                    None => None,
                    Some(FenceImpl::Vulkan(fence)) => Some(fence),
                    Some(_) => return Err(Error::InvalidHandle),
                };
                list.submit(fence)
            }
        }
    }

    fn release(&mut self) -> Result<()> {
        match self {
            Self::Soft(list) => list.release(),
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => list.release(),
        }
    }
}

/// Resources kept alive until the list is released
enum Retained {
    Buffer(Arc<BufferInner>),
    Image(Arc<ImageInner>),
}

pub struct CommandList {
    pub(crate) device: Arc<DeviceShared>,
    usage: CommandListUsage,
    state: Cell<CommandListState>,
    pub(crate) imp: CommandListImpl,
    pub(crate) pass: PassState,
    pub(crate) bound_pipelines: Vec<Arc<PipelineInner>>,
    retained: Vec<Retained>,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl CommandList {
    pub(crate) fn new(device: Arc<DeviceShared>, usage: CommandListUsage, imp: CommandListImpl) -> Self {
        Self {
            device,
            usage,
            state: Cell::new(CommandListState::Recording),
            imp,
            pass: PassState::default(),
            bound_pipelines: Vec::new(),
            retained: Vec::new(),
            released: false,
            _not_send: PhantomData,
        }
    }

    pub fn usage(&self) -> CommandListUsage {
        self.usage
    }

    /// Current state. A sent list reports `Ready` once its work has completed.
    pub fn state(&self) -> CommandListState {
        let state = self.state.get();
        if state == CommandListState::Sent && self.imp.is_complete() {
            self.state.set(CommandListState::Ready);
            return CommandListState::Ready;
        }
        state
    }

    /// Pipelines bound since the last submit
    pub fn bound_pipelines(&self) -> usize {
        self.bound_pipelines.len()
    }

    /// Resources bound to the current pass, empty between passes
    pub fn pass_bindings(&self) -> &PassBindings {
        &self.pass.bindings
    }

    fn ensure_recording(&self, action: &str) -> Result<()> {
        if self.state.get() == CommandListState::Recording {
            return Ok(());
        }
        self.device
            .sink()
            .error(format!("cannot {}, command list is not recording", action));
        Err(Error::InvalidHandle)
    }

    pub fn begin_compute_pass(&mut self) -> Result<ComputePass<'_>> {
        self.ensure_recording("begin a compute pass")?;
        if self.usage == CommandListUsage::TransferOnly {
            self.device
                .sink()
                .error("cannot begin a compute pass in a transfer only command list");
            return Err(Error::InvalidHandle);
        }
        self.pass = PassState {
            recording: true,
            ..PassState::default()
        };
        Ok(ComputePass::new(self))
    }

    pub(crate) fn retain_bindings(&mut self) {
        let bindings = &self.pass.bindings;
        let images = bindings
            .read_only_images
            .iter()
            .chain(bindings.read_write_images.iter())
            .flatten()
            .map(|image| Retained::Image(image.clone()));
        let buffers = bindings
            .read_only_buffers
            .iter()
            .chain(bindings.read_write_buffers.iter())
            .chain(bindings.uniform_buffers.iter())
            .flatten()
            .map(|buffer| Retained::Buffer(buffer.clone()));
        let retained: Vec<Retained> = images.chain(buffers).collect();
        self.retained.extend(retained);
    }

    pub(crate) fn retain_buffer(&mut self, buffer: Arc<BufferInner>) {
        self.retained.push(Retained::Buffer(buffer));
    }

    fn check_device(&self, device_id: u64) -> Result<()> {
        if device_id == self.device.id {
            Ok(())
        } else {
            Err(Error::InvalidDevice)
        }
    }

    /// Copy `src.size` bytes from `src` to `dst`
    pub fn copy_buffer_to_buffer(&mut self, src: &BufferRegion, dst: &BufferRegion) -> Result<()> {
        self.ensure_recording("copy between buffers")?;
        self.check_device(src.buffer.inner.device_id)?;
        self.check_device(dst.buffer.inner.device_id)?;
        let size = src.size;
        if size == 0
            || !src.buffer.inner.contains(src.offset, size)
            || !dst.buffer.inner.contains(dst.offset, size)
        {
            return Err(Error::InvalidRegion);
        }

        self.imp
            .copy_buffer_to_buffer(&src.buffer.inner, src.offset, &dst.buffer.inner, dst.offset, size)?;
        self.retained.push(Retained::Buffer(src.buffer.inner.clone()));
        self.retained.push(Retained::Buffer(dst.buffer.inner.clone()));
        Ok(())
    }

    /// Upload tightly packed texels from `src` into `dst`
    pub fn copy_buffer_to_image(&mut self, src: &BufferRegion, dst: &ImageRegion) -> Result<()> {
        self.ensure_recording("copy a buffer to an image")?;
        self.check_device(src.buffer.inner.device_id)?;
        self.check_device(dst.image.inner.device_id)?;
        let image = &dst.image.inner;
        let region = TexelBox::from(dst);
        if image.format.is_block_compressed() {
            return Err(Error::InvalidImageFormat);
        }
        image.check_box(&region)?;
        let bytes = region.texel_count() as u64 * image.format.texel_size() as u64;
        if !src.buffer.inner.contains(src.offset, bytes) {
            return Err(Error::InvalidRegion);
        }

        self.imp.copy_buffer_to_image(&src.buffer.inner, src.offset, image, region)?;
        self.retained.push(Retained::Buffer(src.buffer.inner.clone()));
        self.retained.push(Retained::Image(image.clone()));
        Ok(())
    }

    /// Download texels of `src` into `dst`, tightly packed
    pub fn copy_image_to_buffer(&mut self, src: &ImageRegion, dst: &BufferRegion) -> Result<()> {
        self.ensure_recording("copy an image to a buffer")?;
        self.check_device(src.image.inner.device_id)?;
        self.check_device(dst.buffer.inner.device_id)?;
        let image = &src.image.inner;
        let region = TexelBox::from(src);
        if image.format.is_block_compressed() {
            return Err(Error::InvalidImageFormat);
        }
        image.check_box(&region)?;
        let bytes = region.texel_count() as u64 * image.format.texel_size() as u64;
        if !dst.buffer.inner.contains(dst.offset, bytes) {
            return Err(Error::InvalidRegion);
        }

        self.imp.copy_image_to_buffer(image, region, &dst.buffer.inner, dst.offset)?;
        self.retained.push(Retained::Image(image.clone()));
        self.retained.push(Retained::Buffer(dst.buffer.inner.clone()));
        Ok(())
    }

    /// Scaled copy between two image regions of the same format
    pub fn blit_image(&mut self, src: &ImageRegion, dst: &ImageRegion) -> Result<()> {
        self.ensure_recording("blit an image")?;
        self.check_device(src.image.inner.device_id)?;
        self.check_device(dst.image.inner.device_id)?;
        let (from, to) = (&src.image.inner, &dst.image.inner);
        if from.format != to.format {
            self.device.sink().error("cannot blit between images of different formats");
            return Err(Error::InvalidImageFormat);
        }
        let (src_region, dst_region) = (TexelBox::from(src), TexelBox::from(dst));
        from.check_box(&src_region)?;
        to.check_box(&dst_region)?;

        self.imp.blit_image(from, src_region, to, dst_region)?;
        self.retained.push(Retained::Image(from.clone()));
        self.retained.push(Retained::Image(to.clone()));
        Ok(())
    }

    /// Queue every recorded command. `fence` is reset and then signaled once
    /// the work completes.
    pub fn submit(&mut self, fence: Option<&Fence>) -> Result<()> {
        let sink = self.device.sink();
        match self.state() {
            CommandListState::Recording => {}
            CommandListState::Invalid => {
                sink.error("command list is in invalid state");
                return Err(Error::InvalidHandle);
            }
            CommandListState::Sent => {
                sink.warn("command list has already been submitted");
                return Err(Error::InvalidHandle);
            }
            CommandListState::Ready => {
                sink.warn("command list has already completed, request a new one");
                return Err(Error::InvalidHandle);
            }
        }
        if let Some(fence) = fence {
            self.check_device(fence.inner.device_id)?;
        }

        if let Err(e) = self.imp.submit(fence.map(|f| f.inner.as_ref())) {
            sink.error(format!("failed to submit command list: {}", e));
            self.state.set(CommandListState::Invalid);
            return Err(e);
        }
        self.state.set(CommandListState::Sent);
        self.bound_pipelines.clear();
        Ok(())
    }

    /// Wait for submitted work and return pooled objects. Also done on drop.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let result = self.imp.release();
        self.retained.clear();
        self.bound_pipelines.clear();
        self.state.set(CommandListState::Invalid);
        result
    }
}

impl CommandListImpl {
    fn copy_buffer_to_buffer(
        &mut self,
        src: &BufferInner,
        src_offset: u64,
        dst: &BufferInner,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        match self {
            Self::Soft(list) => list.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size),
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => list.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size),
        }
    }

    fn copy_buffer_to_image(&mut self, src: &BufferInner, offset: u64, dst: &ImageInner, region: TexelBox) -> Result<()> {
        match self {
            Self::Soft(list) => list.copy_buffer_to_image(src, offset, dst, region),
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => list.copy_buffer_to_image(src, offset, dst, region),
        }
    }

    fn copy_image_to_buffer(&mut self, src: &ImageInner, region: TexelBox, dst: &BufferInner, offset: u64) -> Result<()> {
        match self {
            Self::Soft(list) => list.copy_image_to_buffer(src, region, dst, offset),
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => list.copy_image_to_buffer(src, region, dst, offset),
        }
    }

    fn blit_image(&mut self, src: &ImageInner, src_region: TexelBox, dst: &ImageInner, dst_region: TexelBox) -> Result<()> {
        match self {
            Self::Soft(list) => list.blit_image(src, src_region, dst, dst_region),
            #[cfg(feature = "vulkan")]
            Self::Vulkan(list) => list.blit_image(src, src_region, dst, dst_region),
        }
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            log::error!("Failed to release command list: {}", e);
        }
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("usage", &self.usage)
            .field("state", &self.state.get())
            .field("bound_pipelines", &self.bound_pipelines.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::device::Device;
    use crate::types::{BackendFlags, BufferCreateInfo, BufferUsage, DebugLevel, ShaderFormats};

    fn device() -> Device {
        let backend = Backend::load(BackendFlags::SOFTWARE, ShaderFormats::SPIRV, DebugLevel::Low).unwrap();
        backend.create_device(&[]).unwrap()
    }

    #[test]
    fn submit_moves_recording_to_sent_then_ready() {
        let device = device();
        let mut list = device.request_command_list(CommandListUsage::General).unwrap();
        assert_eq!(list.state(), CommandListState::Recording);

        let fence = device.create_fence().unwrap();
        list.submit(Some(&fence)).unwrap();
        device
            .wait_for_fences(&[&fence], true, std::time::Duration::from_secs(5))
            .unwrap();

        // The list's own completion is signaled before the fence
        assert_eq!(list.state(), CommandListState::Ready);
        assert_eq!(list.submit(None), Err(Error::InvalidHandle));
        device.destroy_fence(fence).unwrap();
    }

    #[test]
    fn second_submit_queues_nothing() {
        let device = device();
        let src = device
            .create_buffer(&BufferCreateInfo {
                usage: BufferUsage::TRANSFER_UPLOAD,
                size: 16,
            })
            .unwrap();
        let dst = device
            .create_buffer(&BufferCreateInfo {
                usage: BufferUsage::TRANSFER_DOWNLOAD,
                size: 16,
            })
            .unwrap();
        let mut list = device.request_command_list(CommandListUsage::TransferOnly).unwrap();
        fn whole(buffer: &crate::buffer::Buffer) -> BufferRegion<'_> {
            BufferRegion { buffer, offset: 0, size: 16 }
        }
        list.copy_buffer_to_buffer(&whole(&src), &whole(&dst)).unwrap();
        list.submit(None).unwrap();
        assert_eq!(list.submit(None), Err(Error::InvalidHandle));
        assert_eq!(
            list.copy_buffer_to_buffer(&whole(&src), &whole(&dst)),
            Err(Error::InvalidHandle)
        );
        list.release().unwrap();
        device.destroy_buffer(src).unwrap();
        device.destroy_buffer(dst).unwrap();
    }

    #[test]
    fn transfer_only_lists_refuse_compute_passes() {
        let device = device();
        let mut list = device.request_command_list(CommandListUsage::TransferOnly).unwrap();
        assert!(matches!(list.begin_compute_pass(), Err(Error::InvalidHandle)));
    }

    #[test]
    fn out_of_bounds_copies_are_rejected_before_recording() {
        let device = device();
        let a = device
            .create_buffer(&BufferCreateInfo {
                usage: BufferUsage::TRANSFER_UPLOAD,
                size: 8,
            })
            .unwrap();
        let mut list = device.request_command_list(CommandListUsage::General).unwrap();
        let src = BufferRegion { buffer: &a, offset: 4, size: 8 };
        let dst = BufferRegion { buffer: &a, offset: 0, size: 8 };
        assert_eq!(list.copy_buffer_to_buffer(&src, &dst), Err(Error::InvalidRegion));
        match &list.imp {
            CommandListImpl::Soft(soft) => assert_eq!(soft.recorded(), 0),
            #[cfg(feature = "vulkan")]
            _ => unreachable!(),
        }
        drop(list);
        device.destroy_buffer(a).unwrap();
    }
}
