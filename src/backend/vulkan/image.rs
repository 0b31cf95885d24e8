// Vulkan storage images
//
// Images stay in the GENERAL layout for their whole life, so storage access,
// copies and blits never need layout transitions after creation.

use ash::vk;
use std::sync::Arc;

use super::VulkanContext;
use crate::error::{Error, Result};
use crate::image::TexelBox;
use crate::types::{ImageCreateInfo, ImageFormat, ImageType, ImageUsage};

pub fn vk_format(format: ImageFormat) -> Option<vk::Format> {
    use ImageFormat::*;
    let format = match format {
        Invalid => return None,
        A8Unorm => vk::Format::R8_UNORM,
        R8Unorm => vk::Format::R8_UNORM,
        R8G8Unorm => vk::Format::R8G8_UNORM,
        R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        R16Unorm => vk::Format::R16_UNORM,
        R16G16Unorm => vk::Format::R16G16_UNORM,
        R16G16B16A16Unorm => vk::Format::R16G16B16A16_UNORM,
        R10G10B10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        B5G6R5Unorm => vk::Format::B5G6R5_UNORM_PACK16,
        B5G5R5A1Unorm => vk::Format::A1R5G5B5_UNORM_PACK16,
        B4G4R4A4Unorm => vk::Format::B4G4R4A4_UNORM_PACK16,
        B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,

        Bc1RgbaUnorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
        Bc2RgbaUnorm => vk::Format::BC2_UNORM_BLOCK,
        Bc3RgbaUnorm => vk::Format::BC3_UNORM_BLOCK,
        Bc4RUnorm => vk::Format::BC4_UNORM_BLOCK,
        Bc5RgUnorm => vk::Format::BC5_UNORM_BLOCK,
        Bc7RgbaUnorm => vk::Format::BC7_UNORM_BLOCK,
        Bc6hRgbFloat => vk::Format::BC6H_SFLOAT_BLOCK,
        Bc6hRgbUfloat => vk::Format::BC6H_UFLOAT_BLOCK,

        R8Snorm => vk::Format::R8_SNORM,
        R8G8Snorm => vk::Format::R8G8_SNORM,
        R8G8B8A8Snorm => vk::Format::R8G8B8A8_SNORM,
        R16Snorm => vk::Format::R16_SNORM,
        R16G16Snorm => vk::Format::R16G16_SNORM,
        R16G16B16A16Snorm => vk::Format::R16G16B16A16_SNORM,

        R16Float => vk::Format::R16_SFLOAT,
        R16G16Float => vk::Format::R16G16_SFLOAT,
        R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
        R32Float => vk::Format::R32_SFLOAT,
        R32G32Float => vk::Format::R32G32_SFLOAT,
        R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,

        R11G11B10Ufloat => vk::Format::B10G11R11_UFLOAT_PACK32,

        R8Uint => vk::Format::R8_UINT,
        R8G8Uint => vk::Format::R8G8_UINT,
        R8G8B8A8Uint => vk::Format::R8G8B8A8_UINT,
        R16Uint => vk::Format::R16_UINT,
        R16G16Uint => vk::Format::R16G16_UINT,
        R16G16B16A16Uint => vk::Format::R16G16B16A16_UINT,
        R32Uint => vk::Format::R32_UINT,
        R32G32Uint => vk::Format::R32G32_UINT,
        R32G32B32A32Uint => vk::Format::R32G32B32A32_UINT,

        R8Int => vk::Format::R8_SINT,
        R8G8Int => vk::Format::R8G8_SINT,
        R8G8B8A8Int => vk::Format::R8G8B8A8_SINT,
        R16Int => vk::Format::R16_SINT,
        R16G16Int => vk::Format::R16G16_SINT,
        R16G16B16A16Int => vk::Format::R16G16B16A16_SINT,
        R32Int => vk::Format::R32_SINT,
        R32G32Int => vk::Format::R32G32_SINT,
        R32G32B32A32Int => vk::Format::R32G32B32A32_SINT,

        R8G8B8A8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        B8G8R8A8UnormSrgb => vk::Format::B8G8R8A8_SRGB,

        Bc1RgbaUnormSrgb => vk::Format::BC1_RGBA_SRGB_BLOCK,
        Bc2RgbaUnormSrgb => vk::Format::BC2_SRGB_BLOCK,
        Bc3RgbaUnormSrgb => vk::Format::BC3_SRGB_BLOCK,
        Bc7RgbaUnormSrgb => vk::Format::BC7_SRGB_BLOCK,
    };
    Some(format)
}

pub fn vk_image_type(ty: ImageType) -> vk::ImageType {
    match ty {
        ImageType::Image3D => vk::ImageType::TYPE_3D,
        _ => vk::ImageType::TYPE_2D,
    }
}

fn vk_view_type(ty: ImageType) -> vk::ImageViewType {
    match ty {
        ImageType::Image2D => vk::ImageViewType::TYPE_2D,
        ImageType::Image2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
        ImageType::Image3D => vk::ImageViewType::TYPE_3D,
        ImageType::Cube => vk::ImageViewType::CUBE,
        ImageType::CubeArray => vk::ImageViewType::CUBE_ARRAY,
    }
}

pub fn vk_image_usage(_usage: ImageUsage) -> vk::ImageUsageFlags {
    // Every storage image can also be copied and blitted
    vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST
}

pub fn vk_create_flags(ty: ImageType) -> vk::ImageCreateFlags {
    match ty {
        ImageType::Cube | ImageType::CubeArray => vk::ImageCreateFlags::CUBE_COMPATIBLE,
        _ => vk::ImageCreateFlags::empty(),
    }
}

pub fn color_layers(layer: u32, count: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: layer,
        layer_count: count,
    }
}

/// Offset and extent of a texel box in native form
pub fn box_offset_extent(region: &TexelBox) -> (vk::Offset3D, vk::Extent3D) {
    (
        vk::Offset3D {
            x: region.x as i32,
            y: region.y as i32,
            z: region.z as i32,
        },
        vk::Extent3D {
            width: region.width,
            height: region.height,
            depth: region.depth.max(1),
        },
    )
}

pub struct VulkanImage {
    context: Arc<VulkanContext>,
    pub image: vk::Image,
    pub view: vk::ImageView,
    memory: vk::DeviceMemory,
}

impl VulkanImage {
    pub fn new(context: &Arc<VulkanContext>, info: &ImageCreateInfo) -> Result<Self> {
        let format = vk_format(info.format).ok_or(Error::InvalidImageFormat)?;
        let device = &context.device;

        let (depth, layers) = match info.ty {
            ImageType::Image3D => (info.layer_count_or_depth.max(1), 1),
            _ => (1, info.layer_count_or_depth.max(1)),
        };

        let image_info = vk::ImageCreateInfo::builder()
            .flags(vk_create_flags(info.ty))
            .image_type(vk_image_type(info.ty))
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth,
            })
            .mip_levels(1)
            .array_layers(layers)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk_image_usage(info.usage))
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = unsafe { device.create_image(&image_info, None) }?;

        let mem_requirements = unsafe { device.get_image_memory_requirements(image) };
        let Some(memory_type_index) =
            context.find_memory_type(mem_requirements.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        else {
            unsafe { device.destroy_image(image, None) };
            return Err(Error::DeviceAllocationFailed);
        };
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: layers,
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk_view_type(info.ty))
            .format(format)
            .subresource_range(subresource_range);
        let view = unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .and_then(|_| device.create_image_view(&view_info, None))
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(e.into());
            }
        };

        let created = Self {
            context: context.clone(),
            image,
            view,
            memory,
        };

        // UNDEFINED -> GENERAL once, the layout never changes afterwards
        context.immediate(|cmd| {
            let barrier = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(subresource_range)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
                .build();
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        })?;

        Ok(created)
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_image_view(self.view, None);
            self.context.device.destroy_image(self.image, None);
            self.context.device.free_memory(self.memory, None);
        }
    }
}
