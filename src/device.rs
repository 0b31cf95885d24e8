// =============================================================================
// DEVICE - Logical connection to one adapter of a backend
// =============================================================================
//
// Every public entry point validates its arguments here, forwards to the
// backend device and keeps the buffer/image registries current. Whatever is
// still registered when the device goes away is reported as a leak.

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::soft::SoftDevice;
#[cfg(feature = "vulkan")]
use crate::backend::vulkan::VulkanDevice;
use crate::backend::BackendKind;
use crate::buffer::{Buffer, BufferImpl, BufferInner, BufferMapping};
use crate::command_list::{CommandList, CommandListImpl};
use crate::compute_pass::MAX_BOUND_SLOTS;
use crate::debug::DebugSink;
use crate::error::{Error, Result};
use crate::fence::{Fence, FenceImpl, FenceInner};
use crate::image::{Image, ImageInner};
#[cfg(feature = "vulkan")]
use crate::pipeline::PipelineImpl;
use crate::pipeline::{ComputePipeline, PipelineInner};
use crate::types::{
    BufferCreateInfo, BufferUsage, CommandListUsage, ComputePipelineCreateInfo, ImageCreateInfo, ImageFormat,
    ImageType, ImageUsage, MapMode, ShaderFormats,
};

new_key_type! {
    /// Registry slot of a live buffer or image
    pub struct ResourceKey;
}

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum DeviceImpl {
    Soft(SoftDevice),
    #[cfg(feature = "vulkan")]
    Vulkan(VulkanDevice),
}

/// Device state shared with command lists
pub(crate) struct DeviceShared {
    pub(crate) id: u64,
    pub(crate) kind: BackendKind,
    pub(crate) shader_formats: ShaderFormats,
    pub(crate) poll_interval: Duration,
    pub(crate) default_timeout: Duration,
    sink: Arc<DebugSink>,
    pub(crate) imp: DeviceImpl,
}

impl DeviceShared {
    pub(crate) fn sink(&self) -> &DebugSink {
        &self.sink
    }

    fn create_native_buffer(&self, size: u64, usage: BufferUsage) -> Result<BufferImpl> {
        match &self.imp {
            DeviceImpl::Soft(device) => device.create_buffer(size),
            #[cfg(feature = "vulkan")]
            DeviceImpl::Vulkan(device) => device.create_buffer(size, usage),
        }
        .map_err(|e| {
            self.sink.error(format!("failed to create buffer of {} bytes ({:?}): {}", size, usage, e));
            e
        })
    }

    /// Internal uniform buffer holding a copy of `data`
    pub(crate) fn create_uniform_buffer(&self, data: &[u8]) -> Result<Arc<BufferInner>> {
        let usage = BufferUsage::UNIFORM_ACCESS | BufferUsage::TRANSFER_UPLOAD;
        let size = data.len() as u64;
        let imp = self.create_native_buffer(size, usage)?;
        match &self.imp {
            DeviceImpl::Soft(device) => device.upload(&imp, data)?,
            #[cfg(feature = "vulkan")]
            DeviceImpl::Vulkan(device) => device.upload(&imp, data)?,
        }
        Ok(Arc::new(BufferInner::new(self.id, size, usage, true, imp)))
    }
}

pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
    buffers: Mutex<SlotMap<ResourceKey, Arc<BufferInner>>>,
    images: Mutex<SlotMap<ResourceKey, Arc<ImageInner>>>,
}

impl Device {
    pub(crate) fn new(
        kind: BackendKind,
        shader_formats: ShaderFormats,
        sink: Arc<DebugSink>,
        poll_interval: Duration,
        default_timeout: Duration,
        imp: DeviceImpl,
    ) -> Self {
        let shared = DeviceShared {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            shader_formats,
            poll_interval,
            default_timeout,
            sink,
            imp,
        };
        log::info!("Created {} device '{}'", kind.name(), shared_name(&shared));
        Self {
            shared: Arc::new(shared),
            buffers: Mutex::new(SlotMap::with_key()),
            images: Mutex::new(SlotMap::with_key()),
        }
    }

    fn sink(&self) -> &DebugSink {
        &self.shared.sink
    }

    fn check_device(&self, device_id: u64) -> Result<()> {
        if device_id == self.shared.id {
            Ok(())
        } else {
            self.sink().error("object belongs to another device");
            Err(Error::InvalidDevice)
        }
    }

    // =========================================================================
    // Info
    // =========================================================================

    pub fn backend_in_use(&self) -> BackendKind {
        self.shared.kind
    }

    /// Whether every requested format is consumable by this device
    pub fn supports_shader_formats(&self, formats: ShaderFormats) -> bool {
        !formats.is_empty() && self.shared.shader_formats.contains(formats)
    }

    /// Backend-specific adapter identity, used by the forbidden-device filter
    pub fn adapter_id(&self) -> u64 {
        match &self.shared.imp {
            DeviceImpl::Soft(device) => device.adapter_id(),
            #[cfg(feature = "vulkan")]
            DeviceImpl::Vulkan(device) => device.adapter_id(),
        }
    }

    pub fn name(&self) -> String {
        shared_name(&self.shared)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn live_images(&self) -> usize {
        self.images.lock().len()
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    pub fn create_buffer(&self, info: &BufferCreateInfo) -> Result<Buffer> {
        if info.usage.is_empty() {
            self.sink().error("buffer usage cannot be empty");
            return Err(Error::InvalidBufferUsage);
        }
        if info.usage.contains(BufferUsage::UNIFORM_ACCESS | BufferUsage::STORAGE_WRITE) {
            self.sink().error("a uniform buffer cannot be written by shaders");
            return Err(Error::InvalidBufferUsage);
        }
        if info.size == 0 {
            self.sink().error("buffer size cannot be zero");
            return Err(Error::InvalidRegion);
        }

        let imp = self.shared.create_native_buffer(info.size, info.usage)?;
        let inner = Arc::new(BufferInner::new(self.shared.id, info.size, info.usage, false, imp));
        let key = self.buffers.lock().insert(inner.clone());
        Ok(Buffer { inner, key })
    }

    /// Map a buffer for host access. The buffer is unmapped when the mapping
    /// is dropped.
    pub fn map_buffer<'a>(&self, buffer: &'a Buffer, mode: MapMode) -> Result<BufferMapping<'a>> {
        self.check_device(buffer.inner.device_id)?;
        BufferMapping::new(buffer, mode).map_err(|e| {
            self.sink().error(format!("failed to map buffer in {:?} mode", mode));
            e
        })
    }

    pub fn destroy_buffer(&self, buffer: Buffer) -> Result<()> {
        self.check_device(buffer.inner.device_id)?;
        if buffer.is_mapped() {
            self.sink()
                .warn("buffer is still mapped, consider unmapping it before destroy");
        }
        match self.buffers.lock().remove(buffer.key) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidHandle),
        }
    }

    // =========================================================================
    // Images
    // =========================================================================

    pub fn is_image_format_valid(&self, format: ImageFormat, ty: ImageType, usage: ImageUsage) -> bool {
        match &self.shared.imp {
            DeviceImpl::Soft(_) => SoftDevice::is_image_format_valid(format, ty, usage),
            #[cfg(feature = "vulkan")]
            DeviceImpl::Vulkan(device) => device.is_image_format_valid(format, ty, usage),
        }
    }

    pub fn create_image(&self, info: &ImageCreateInfo) -> Result<Image> {
        if info.usage.is_empty() {
            self.sink().error("image usage cannot be empty");
            return Err(Error::InvalidImageUsage);
        }
        if info.width == 0 || info.height == 0 || info.layer_count_or_depth == 0 {
            self.sink().error("image dimensions cannot be zero");
            return Err(Error::InvalidRegion);
        }
        let layers = info.layer_count_or_depth;
        let shape_ok = match info.ty {
            ImageType::Image2D => layers == 1,
            ImageType::Image2DArray | ImageType::Image3D => true,
            ImageType::Cube => info.width == info.height && layers == 6,
            ImageType::CubeArray => info.width == info.height && layers % 6 == 0,
        };
        if !shape_ok {
            self.sink()
                .error(format!("invalid extent {}x{}x{} for {:?}", info.width, info.height, layers, info.ty));
            return Err(Error::InvalidRegion);
        }
        if !self.is_image_format_valid(info.format, info.ty, info.usage) {
            self.sink()
                .error(format!("image format {:?} is not supported for {:?}", info.format, info.ty));
            return Err(Error::InvalidImageFormat);
        }

        let imp = match &self.shared.imp {
            DeviceImpl::Soft(device) => device.create_image(info),
            #[cfg(feature = "vulkan")]
            DeviceImpl::Vulkan(device) => device.create_image(info),
        }?;
        let inner = Arc::new(ImageInner::new(self.shared.id, info, imp));
        let key = self.images.lock().insert(inner.clone());
        Ok(Image { inner, key })
    }

    pub fn destroy_image(&self, image: Image) -> Result<()> {
        self.check_device(image.inner.device_id)?;
        match self.images.lock().remove(image.key) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidHandle),
        }
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    pub fn create_compute_pipeline(&self, info: &ComputePipelineCreateInfo) -> Result<ComputePipeline> {
        if info.code.is_empty() {
            self.sink().error("compute pipeline code cannot be empty");
            return Err(Error::InitializationFailed);
        }
        if !self.supports_shader_formats(info.format) {
            self.sink()
                .error(format!("shader format {:?} is not supported by this device", info.format));
            return Err(Error::BackendsCandidatesShaderFormatMismatch);
        }
        let per_array = [
            info.num_readonly_storage_images,
            info.num_readonly_storage_buffers,
            info.num_readwrite_storage_images,
            info.num_readwrite_storage_buffers,
            info.num_uniform_buffers,
        ];
        if per_array.iter().any(|n| *n as usize > MAX_BOUND_SLOTS) {
            self.sink().error(format!(
                "compute pipeline uses more than {} resources of one kind ({:?})",
                MAX_BOUND_SLOTS, per_array
            ));
            return Err(Error::InitializationFailed);
        }

        let imp = match &self.shared.imp {
            DeviceImpl::Soft(device) => device.create_pipeline(info),
            #[cfg(feature = "vulkan")]
            DeviceImpl::Vulkan(device) => device.create_pipeline(info).map(|p| PipelineImpl::Vulkan(Arc::new(p))),
        }?;
        Ok(ComputePipeline {
            inner: Arc::new(PipelineInner::new(self.shared.id, info, imp)),
        })
    }

    /// Release the caller's handle. Command lists that bound the pipeline keep
    /// it alive until they are released.
    pub fn destroy_compute_pipeline(&self, pipeline: ComputePipeline) -> Result<()> {
        self.check_device(pipeline.inner.device_id)?;
        drop(pipeline);
        Ok(())
    }

    // =========================================================================
    // Command lists & fences
    // =========================================================================

    /// A new list in the recording state, bound to the calling thread
    pub fn request_command_list(&self, usage: CommandListUsage) -> Result<CommandList> {
        let imp = match &self.shared.imp {
            DeviceImpl::Soft(device) => CommandListImpl::Soft(device.create_command_list()),
            #[cfg(feature = "vulkan")]
            DeviceImpl::Vulkan(device) => CommandListImpl::Vulkan(device.create_command_list()?),
        };
        log::debug!("Command list requested on {:?}", thread::current().id());
        Ok(CommandList::new(self.shared.clone(), usage, imp))
    }

    pub fn create_fence(&self) -> Result<Fence> {
        let imp = match &self.shared.imp {
            DeviceImpl::Soft(device) => FenceImpl::Soft(device.create_fence()),
            #[cfg(feature = "vulkan")]
            DeviceImpl::Vulkan(device) => FenceImpl::Vulkan(device.create_fence()?),
        };
        Ok(Fence {
            inner: Arc::new(FenceInner {
                device_id: self.shared.id,
                imp,
            }),
        })
    }

    pub fn destroy_fence(&self, fence: Fence) -> Result<()> {
        self.check_device(fence.inner.device_id)?;
        drop(fence);
        Ok(())
    }

    /// Block until all (or any) of `fences` are signaled, or `timeout` passes.
    /// An empty slice returns immediately.
    pub fn wait_for_fences(&self, fences: &[&Fence], wait_for_all: bool, timeout: Duration) -> Result<()> {
        if fences.is_empty() {
            return Ok(());
        }
        for fence in fences {
            self.check_device(fence.inner.device_id)?;
        }

        #[cfg(feature = "vulkan")]
        if let DeviceImpl::Vulkan(device) = &self.shared.imp {
            let native = fences
                .iter()
                .map(|f| match &f.inner.imp {
                    FenceImpl::Vulkan(fence) => Ok(fence.raw()),
                    _ => Err(Error::InvalidHandle),
                })
                .collect::<Result<Vec<_>>>()?;
            return device.wait_for_fences(&native, wait_for_all, timeout);
        }

        // A timeout past the clock's range waits without a deadline
        let deadline = Instant::now().checked_add(timeout);
        let soft = fences
            .iter()
            .map(|f| match &f.inner.imp {
                FenceImpl::Soft(fence) => Ok(fence.clone()),
                #[cfg(feature = "vulkan")]
                _ => Err(Error::InvalidHandle),
            })
            .collect::<Result<Vec<_>>>()?;

        if wait_for_all {
            for fence in &soft {
                match deadline {
                    Some(deadline) => {
                        if !fence.wait_until(deadline) {
                            return Err(Error::Timeout);
                        }
                    }
                    None => fence.wait(),
                }
            }
            return Ok(());
        }

        loop {
            if soft.iter().any(|f| f.is_signaled()) {
                return Ok(());
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Err(Error::Timeout);
            }
            thread::sleep(self.shared.poll_interval);
        }
    }

    /// `wait_for_fences` with the configured default timeout
    pub fn wait_for_fences_default(&self, fences: &[&Fence], wait_for_all: bool) -> Result<()> {
        self.wait_for_fences(fences, wait_for_all, self.shared.default_timeout)
    }
}

fn shared_name(shared: &DeviceShared) -> String {
    match &shared.imp {
        DeviceImpl::Soft(device) => device.name(),
        #[cfg(feature = "vulkan")]
        DeviceImpl::Vulkan(device) => device.name(),
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let buffers = self.buffers.get_mut().len();
        let images = self.images.get_mut().len();
        if buffers > 0 {
            self.sink()
                .error(format!("{} buffer(s) were not destroyed before their device", buffers));
        }
        if images > 0 {
            self.sink()
                .error(format!("{} image(s) were not destroyed before their device", images));
        }
        self.buffers.get_mut().clear();
        self.images.get_mut().clear();
        log::info!("Destroyed {} device", self.shared.kind.name());
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("backend", &self.shared.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::spirv::assembler::Assembler;
    use crate::backend::Backend;
    use crate::types::{BackendFlags, DebugLevel, Severity};

    fn backend() -> Backend {
        Backend::load(BackendFlags::SOFTWARE, ShaderFormats::SPIRV, DebugLevel::Low).unwrap()
    }

    #[test]
    fn buffer_usage_rules() {
        let device = backend().create_device(&[]).unwrap();
        let create = |usage, size| device.create_buffer(&BufferCreateInfo { usage, size });
        assert_eq!(create(BufferUsage::empty(), 4).unwrap_err(), Error::InvalidBufferUsage);
        assert_eq!(
            create(BufferUsage::UNIFORM_ACCESS | BufferUsage::STORAGE_WRITE, 4).unwrap_err(),
            Error::InvalidBufferUsage
        );
        assert_eq!(create(BufferUsage::STORAGE_READ, 0).unwrap_err(), Error::InvalidRegion);
        assert_eq!(device.live_buffers(), 0);

        let ok = create(BufferUsage::STORAGE_READ | BufferUsage::TRANSFER_UPLOAD, 4).unwrap();
        assert_eq!(device.live_buffers(), 1);
        device.destroy_buffer(ok).unwrap();
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn cube_images_must_be_square_with_six_faces() {
        let device = backend().create_device(&[]).unwrap();
        let info = |ty, width, layers| ImageCreateInfo {
            ty,
            format: ImageFormat::R8G8B8A8Unorm,
            usage: ImageUsage::STORAGE_READ,
            width,
            height: 8,
            layer_count_or_depth: layers,
        };
        assert_eq!(device.create_image(&info(ImageType::Cube, 8, 5)).unwrap_err(), Error::InvalidRegion);
        assert_eq!(device.create_image(&info(ImageType::Cube, 4, 6)).unwrap_err(), Error::InvalidRegion);
        assert_eq!(device.create_image(&info(ImageType::CubeArray, 8, 9)).unwrap_err(), Error::InvalidRegion);

        let cube = device.create_image(&info(ImageType::Cube, 8, 6)).unwrap();
        let array = device.create_image(&info(ImageType::CubeArray, 8, 12)).unwrap();
        assert_eq!(device.live_images(), 2);
        device.destroy_image(cube).unwrap();
        device.destroy_image(array).unwrap();
    }

    #[test]
    fn image_usage_and_format_are_checked() {
        let device = backend().create_device(&[]).unwrap();
        let mut info = ImageCreateInfo {
            ty: ImageType::Image2D,
            format: ImageFormat::Bc7RgbaUnorm,
            usage: ImageUsage::STORAGE_READ,
            width: 4,
            height: 4,
            layer_count_or_depth: 1,
        };
        assert_eq!(device.create_image(&info).unwrap_err(), Error::InvalidImageFormat);
        info.format = ImageFormat::R32Float;
        info.usage = ImageUsage::empty();
        assert_eq!(device.create_image(&info).unwrap_err(), Error::InvalidImageUsage);
    }

    #[test]
    fn leaked_buffers_are_reported_on_drop() {
        let backend = backend();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();
        backend.set_debug_callback(Some(Arc::new(move |severity, message: &str| {
            if severity == Severity::Error {
                seen.lock().push(message.to_string());
            }
        })));

        let device = backend.create_device(&[]).unwrap();
        let leaked = device
            .create_buffer(&BufferCreateInfo {
                usage: BufferUsage::STORAGE_READ,
                size: 16,
            })
            .unwrap();
        drop(device);
        assert!(errors.lock().iter().any(|m| m.contains("1 buffer(s)")));
        drop(leaked);
    }

    #[test]
    fn empty_fence_wait_returns_at_once() {
        let device = backend().create_device(&[]).unwrap();
        let start = Instant::now();
        device.wait_for_fences(&[], true, Duration::from_secs(60)).unwrap();
        device.wait_for_fences(&[], false, Duration::from_secs(60)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn fresh_fences_are_ready() {
        let device = backend().create_device(&[]).unwrap();
        let fence = device.create_fence().unwrap();
        assert!(fence.is_ready());
        device.wait_for_fences(&[&fence], false, Duration::from_millis(10)).unwrap();
        device.destroy_fence(fence).unwrap();
    }

    fn flat_index_code(local_size: [u32; 3]) -> Vec<u8> {
        let mut asm = Assembler::compute("main", local_size);
        let out = asm.storage_buffer_u32(1, 0);
        let gid = asm.global_invocation_x();
        asm.store_u32_at(out, gid, gid);
        asm.bytes()
    }

    #[test]
    fn unbounded_timeout_waits_without_deadline() {
        let device = backend().create_device(&[]).unwrap();
        let fresh = device.create_fence().unwrap();
        device.wait_for_fences(&[&fresh], true, Duration::MAX).unwrap();
        device.wait_for_fences(&[&fresh], false, Duration::MAX).unwrap();

        let submitted = device.create_fence().unwrap();
        let mut list = device.request_command_list(CommandListUsage::General).unwrap();
        list.submit(Some(&submitted)).unwrap();
        device.wait_for_fences(&[&submitted], true, Duration::MAX).unwrap();
        list.release().unwrap();

        device.destroy_fence(fresh).unwrap();
        device.destroy_fence(submitted).unwrap();
    }

    #[test]
    fn huge_resource_counts_fail_pipeline_creation() {
        let device = backend().create_device(&[]).unwrap();
        let code = flat_index_code([1, 1, 1]);
        let info = ComputePipelineCreateInfo {
            num_readonly_storage_images: u32::MAX,
            num_readonly_storage_buffers: 1,
            num_readwrite_storage_images: u32::MAX,
            num_readwrite_storage_buffers: u32::MAX,
            ..ComputePipelineCreateInfo::spirv(&code, "main")
        };
        assert_eq!(device.create_compute_pipeline(&info).unwrap_err(), Error::InitializationFailed);
    }

    #[test]
    fn oversized_workgroups_fail_pipeline_creation() {
        let device = backend().create_device(&[]).unwrap();
        for local_size in [[65536, 65536, 1], [32, 32, 2]] {
            let code = flat_index_code(local_size);
            let info = ComputePipelineCreateInfo {
                num_readwrite_storage_buffers: 1,
                ..ComputePipelineCreateInfo::spirv(&code, "main")
            };
            assert_eq!(device.create_compute_pipeline(&info).unwrap_err(), Error::InitializationFailed);
        }

        // The device keeps accepting work afterwards
        let fence = device.create_fence().unwrap();
        let mut list = device.request_command_list(CommandListUsage::General).unwrap();
        list.submit(Some(&fence)).unwrap();
        device.wait_for_fences(&[&fence], true, Duration::from_secs(30)).unwrap();
        list.release().unwrap();
        device.destroy_fence(fence).unwrap();
    }

    #[test]
    fn command_lists_on_two_threads_use_their_own_pools() {
        let device = backend().create_device(&[]).unwrap();
        let code = flat_index_code([4, 1, 1]);

        let record = || {
            let out = device
                .create_buffer(&BufferCreateInfo {
                    usage: BufferUsage::STORAGE_WRITE,
                    size: 16,
                })
                .unwrap();
            let pipeline = device
                .create_compute_pipeline(&ComputePipelineCreateInfo {
                    num_readwrite_storage_buffers: 1,
                    ..ComputePipelineCreateInfo::spirv(&code, "main")
                })
                .unwrap();
            let fence = device.create_fence().unwrap();

            let mut list = device.request_command_list(CommandListUsage::General).unwrap();
            let mut pass = list.begin_compute_pass().unwrap();
            pass.bind_compute_pipeline(&pipeline).unwrap();
            pass.bind_storage_buffers(&[&out]).unwrap();
            pass.dispatch(1, 1, 1).unwrap();
            pass.end().unwrap();
            list.submit(Some(&fence)).unwrap();
            device.wait_for_fences(&[&fence], true, Duration::from_secs(30)).unwrap();
            list.release().unwrap();

            device.destroy_fence(fence).unwrap();
            device.destroy_compute_pipeline(pipeline).unwrap();
            device.destroy_buffer(out).unwrap();
            thread::current().id()
        };
        let (a, b) = thread::scope(|s| {
            let a = s.spawn(record);
            let b = s.spawn(record);
            (a.join().unwrap(), b.join().unwrap())
        });

        let pools = match &device.shared.imp {
            DeviceImpl::Soft(soft) => &soft.context().pools,
            #[cfg(feature = "vulkan")]
            _ => unreachable!("software device expected"),
        };
        let pools_a = pools.pools_of(a);
        let pools_b = pools.pools_of(b);
        assert!(!pools_a.is_empty());
        assert!(!pools_b.is_empty());
        assert!(pools_a.iter().all(|key| !pools_b.contains(key)));
        assert!(pools.pools_of(thread::current().id()).is_empty());
    }

    #[test]
    fn objects_of_another_device_are_rejected() {
        let backend = backend();
        let a = backend.create_device(&[]).unwrap();
        let b = backend.create_device(&[]).unwrap();
        let buffer = a
            .create_buffer(&BufferCreateInfo {
                usage: BufferUsage::TRANSFER_DOWNLOAD,
                size: 4,
            })
            .unwrap();
        assert!(matches!(b.map_buffer(&buffer, MapMode::Read), Err(Error::InvalidDevice)));
        let fence = a.create_fence().unwrap();
        assert_eq!(b.wait_for_fences(&[&fence], true, Duration::ZERO), Err(Error::InvalidDevice));
        a.destroy_fence(fence).unwrap();
        a.destroy_buffer(buffer).unwrap();
    }
}
