// Storage images

use std::sync::Arc;

use crate::backend::soft::memory::SoftImage;
#[cfg(feature = "vulkan")]
use crate::backend::vulkan::image::VulkanImage;
use crate::device::ResourceKey;
use crate::error::{Error, Result};
use crate::types::{ImageCreateInfo, ImageFormat, ImageRegion, ImageType, ImageUsage};

pub(crate) enum ImageImpl {
    Soft(Arc<SoftImage>),
    #[cfg(feature = "vulkan")]
    Vulkan(VulkanImage),
}

pub struct ImageInner {
    pub(crate) device_id: u64,
    pub(crate) ty: ImageType,
    pub(crate) format: ImageFormat,
    pub(crate) usage: ImageUsage,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) layer_count_or_depth: u32,
    pub(crate) imp: ImageImpl,
}

impl ImageInner {
    pub(crate) fn new(device_id: u64, info: &ImageCreateInfo, imp: ImageImpl) -> Self {
        Self {
            device_id,
            ty: info.ty,
            format: info.format,
            usage: info.usage,
            width: info.width,
            height: info.height,
            layer_count_or_depth: info.layer_count_or_depth.max(1),
            imp,
        }
    }

    pub(crate) fn soft(&self) -> Result<&Arc<SoftImage>> {
        match &self.imp {
            ImageImpl::Soft(image) => Ok(image),
            #[cfg(feature = "vulkan")]
            _ => Err(Error::InvalidHandle),
        }
    }

    #[cfg(feature = "vulkan")]
    pub(crate) fn vulkan(&self) -> Result<&VulkanImage> {
        match &self.imp {
            ImageImpl::Vulkan(image) => Ok(image),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Depth of a 3D image, 1 otherwise
    pub(crate) fn depth(&self) -> u32 {
        match self.ty {
            ImageType::Image3D => self.layer_count_or_depth,
            _ => 1,
        }
    }

    pub(crate) fn layers(&self) -> u32 {
        match self.ty {
            ImageType::Image3D => 1,
            _ => self.layer_count_or_depth,
        }
    }

    /// Validate a texel box against this image
    pub(crate) fn check_box(&self, region: &TexelBox) -> Result<()> {
        let fits = |start: u32, extent: u32, limit: u32| {
            extent > 0 && start.checked_add(extent).map_or(false, |end| end <= limit)
        };
        if fits(region.x, region.width, self.width)
            && fits(region.y, region.height, self.height)
            && fits(region.z, region.depth.max(1), self.depth())
            && region.layer < self.layers()
        {
            Ok(())
        } else {
            Err(Error::InvalidRegion)
        }
    }
}

impl std::fmt::Debug for ImageInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageInner")
            .field("ty", &self.ty)
            .field("format", &self.format)
            .field("usage", &self.usage)
            .field("extent", &(self.width, self.height, self.layer_count_or_depth))
            .finish()
    }
}

/// A storage image. Destroy it with `Device::destroy_image`.
#[derive(Debug)]
pub struct Image {
    pub(crate) inner: Arc<ImageInner>,
    pub(crate) key: ResourceKey,
}

impl Image {
    pub fn ty(&self) -> ImageType {
        self.inner.ty
    }

    pub fn format(&self) -> ImageFormat {
        self.inner.format
    }

    pub fn usage(&self) -> ImageUsage {
        self.inner.usage
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn layer_count_or_depth(&self) -> u32 {
        self.inner.layer_count_or_depth
    }
}

/// Image region without the image reference, as recorded into commands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TexelBox {
    pub layer: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl TexelBox {
    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth.max(1) as usize
    }
}

impl From<&ImageRegion<'_>> for TexelBox {
    fn from(region: &ImageRegion<'_>) -> Self {
        Self {
            layer: region.layer,
            x: region.x,
            y: region.y,
            z: region.z,
            width: region.width,
            height: region.height,
            depth: region.depth.max(1),
        }
    }
}
