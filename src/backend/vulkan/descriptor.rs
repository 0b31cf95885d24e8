// Descriptor sets as binding groups
//
// One descriptor set layout per binding category, images first then
// buffers. Sets are recycled only after the command list that used them is
// released, since recorded commands still point at them.

use ash::vk;

use crate::binding::{BindingCategory, GroupDriver, GroupResources, Layout, LayoutSignature, POOL_CAPACITY};
use crate::compute_pass::MAX_BOUND_SLOTS;
use crate::error::{Error, Result};

pub struct VulkanBinder {
    device: ash::Device,
}

impl VulkanBinder {
    pub fn new(device: ash::Device) -> Self {
        Self { device }
    }
}

fn buffer_type(category: BindingCategory) -> vk::DescriptorType {
    match category {
        BindingCategory::Uniform => vk::DescriptorType::UNIFORM_BUFFER,
        _ => vk::DescriptorType::STORAGE_BUFFER,
    }
}

impl GroupDriver for VulkanBinder {
    type Layout = vk::DescriptorSetLayout;
    type Pool = vk::DescriptorPool;
    type Group = vk::DescriptorSet;

    const DEFERRED_RECYCLE: bool = true;

    fn create_layout(&self, signature: &LayoutSignature, category: BindingCategory) -> Result<vk::DescriptorSetLayout> {
        let (images, buffers) = signature.binding_counts();
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..images)
            .map(|_| vk::DescriptorType::STORAGE_IMAGE)
            .chain((0..buffers).map(|_| buffer_type(category)))
            .enumerate()
            .map(|(binding, ty)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding as u32)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }?;
        Ok(layout)
    }

    fn destroy_layout(&self, layout: &vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(*layout, None) };
    }

    fn create_pool(&self) -> Result<vk::DescriptorPool> {
        let per_type = (POOL_CAPACITY * MAX_BOUND_SLOTS) as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: per_type,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: per_type,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: per_type,
            },
        ];
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_CAPACITY as u32)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&create_info, None) }?;
        Ok(pool)
    }

    fn destroy_pool(&self, pool: &mut vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(*pool, None) };
    }

    fn allocate_group(&self, pool: &mut vk::DescriptorPool, layout: &Layout<Self>) -> Result<vk::DescriptorSet> {
        let layouts = [layout.raw];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(*pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }?;
        sets.into_iter().next().ok_or(Error::DeviceAllocationFailed)
    }

    fn write_group(
        &self,
        group: &mut vk::DescriptorSet,
        layout: &Layout<Self>,
        resources: &GroupResources,
    ) -> Result<()> {
        let image_infos = resources
            .images
            .iter()
            .map(|image| {
                let native = image.vulkan()?;
                Ok(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: native.view,
                    image_layout: vk::ImageLayout::GENERAL,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let buffer_infos = resources
            .buffers
            .iter()
            .map(|buffer| {
                let native = buffer.vulkan()?;
                Ok(vk::DescriptorBufferInfo {
                    buffer: native.buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut writes = Vec::with_capacity(image_infos.len() + buffer_infos.len());
        for (i, info) in image_infos.iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(*group)
                    .dst_binding(i as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(info))
                    .build(),
            );
        }
        let first_buffer = image_infos.len();
        for (i, info) in buffer_infos.iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(*group)
                    .dst_binding((first_buffer + i) as u32)
                    .descriptor_type(buffer_type(layout.category))
                    .buffer_info(std::slice::from_ref(info))
                    .build(),
            );
        }

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }
}
