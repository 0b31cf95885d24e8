// Shared enums, flags and creation descriptors
//
// These are the plain-data types passed across the public API. Handles
// themselves live in their own modules (buffer, image, pipeline, ...).

use bitflags::bitflags;

use crate::buffer::Buffer;
use crate::image::Image;

bitflags! {
    /// Backend selection mask
    pub struct BackendFlags: u32 {
        const INVALID = 1 << 0;
        const ANY = 1 << 1;
        const VULKAN = 1 << 2;
        const D3D11 = 1 << 3;
        const OPENGL = 1 << 4;
        const OPENGL_ES = 1 << 5;
        const WEBGPU = 1 << 6;
        const SOFTWARE = 1 << 7;
    }
}

bitflags! {
    /// Shader code formats a backend can consume
    pub struct ShaderFormats: u32 {
        const INVALID = 1 << 0;
        /// Portable intermediate bytecode
        const SPIRV = 1 << 1;
        /// Vendor bytecode
        const DXBC = 1 << 2;
        const WGSL = 1 << 3;
        const GLSL = 1 << 4;
    }
}

bitflags! {
    pub struct BufferUsage: u32 {
        const TRANSFER_UPLOAD = 1 << 0;
        const TRANSFER_DOWNLOAD = 1 << 1;
        const STORAGE_READ = 1 << 2;
        const STORAGE_WRITE = 1 << 3;
        const UNIFORM_ACCESS = 1 << 4;
    }
}

bitflags! {
    /// Storage usage of an image.
    ///
    /// `STORAGE_READ | STORAGE_WRITE` allows one shader to read and another
    /// to write the same image. `SIMULTANEOUS_READWRITE` allows both within
    /// a single shader.
    pub struct ImageUsage: u32 {
        const STORAGE_READ = 1 << 0;
        const STORAGE_WRITE = 1 << 1;
        const SIMULTANEOUS_READWRITE = 1 << 2;
    }
}

impl BufferUsage {
    /// Whether the buffer belongs in the read-write binding category
    pub fn is_writable(self) -> bool {
        self.contains(BufferUsage::STORAGE_WRITE)
    }
}

impl ImageUsage {
    pub fn is_writable(self) -> bool {
        self.intersects(ImageUsage::STORAGE_WRITE | ImageUsage::SIMULTANEOUS_READWRITE)
    }
}

/// Severity of a debug message delivered to the backend callback
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// How much validation and reporting a backend performs
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DebugLevel {
    NoDebug,
    #[default]
    Low,
    High,
    /// Like `High`, and every warning is delivered as an error
    Paranoid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CommandListUsage {
    #[default]
    General,
    TransferOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandListState {
    Invalid,
    Recording,
    Ready,
    Sent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageType {
    Image2D,
    Image2DArray,
    Image3D,
    Cube,
    CubeArray,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Invalid,

    A8Unorm,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R16Unorm,
    R16G16Unorm,
    R16G16B16A16Unorm,
    R10G10B10A2Unorm,
    B5G6R5Unorm,
    B5G5R5A1Unorm,
    B4G4R4A4Unorm,
    B8G8R8A8Unorm,

    Bc1RgbaUnorm,
    Bc2RgbaUnorm,
    Bc3RgbaUnorm,
    Bc4RUnorm,
    Bc5RgUnorm,
    Bc7RgbaUnorm,
    Bc6hRgbFloat,
    Bc6hRgbUfloat,

    R8Snorm,
    R8G8Snorm,
    R8G8B8A8Snorm,
    R16Snorm,
    R16G16Snorm,
    R16G16B16A16Snorm,

    R16Float,
    R16G16Float,
    R16G16B16A16Float,
    R32Float,
    R32G32Float,
    R32G32B32A32Float,

    R11G11B10Ufloat,

    R8Uint,
    R8G8Uint,
    R8G8B8A8Uint,
    R16Uint,
    R16G16Uint,
    R16G16B16A16Uint,
    R32Uint,
    R32G32Uint,
    R32G32B32A32Uint,

    R8Int,
    R8G8Int,
    R8G8B8A8Int,
    R16Int,
    R16G16Int,
    R16G16B16A16Int,
    R32Int,
    R32G32Int,
    R32G32B32A32Int,

    R8G8B8A8UnormSrgb,
    B8G8R8A8UnormSrgb,

    Bc1RgbaUnormSrgb,
    Bc2RgbaUnormSrgb,
    Bc3RgbaUnormSrgb,
    Bc7RgbaUnormSrgb,
}

impl ImageFormat {
    /// Block-compressed formats store 4x4 texel blocks
    pub fn is_block_compressed(self) -> bool {
        use ImageFormat::*;
        matches!(
            self,
            Bc1RgbaUnorm
                | Bc2RgbaUnorm
                | Bc3RgbaUnorm
                | Bc4RUnorm
                | Bc5RgUnorm
                | Bc7RgbaUnorm
                | Bc6hRgbFloat
                | Bc6hRgbUfloat
                | Bc1RgbaUnormSrgb
                | Bc2RgbaUnormSrgb
                | Bc3RgbaUnormSrgb
                | Bc7RgbaUnormSrgb
        )
    }

    /// Size of one texel in bytes, or of one 4x4 block for compressed formats
    pub fn texel_size(self) -> u32 {
        use ImageFormat::*;
        match self {
            Invalid => 0,
            A8Unorm | R8Unorm | R8Snorm | R8Uint | R8Int => 1,
            R8G8Unorm | R8G8Snorm | R8G8Uint | R8G8Int | R16Unorm | R16Snorm | R16Float
            | R16Uint | R16Int | B5G6R5Unorm | B5G5R5A1Unorm | B4G4R4A4Unorm => 2,
            R8G8B8A8Unorm | R8G8B8A8Snorm | R8G8B8A8Uint | R8G8B8A8Int | R8G8B8A8UnormSrgb
            | B8G8R8A8Unorm | B8G8R8A8UnormSrgb | R16G16Unorm | R16G16Snorm | R16G16Float
            | R16G16Uint | R16G16Int | R32Float | R32Uint | R32Int | R10G10B10A2Unorm
            | R11G11B10Ufloat => 4,
            R16G16B16A16Unorm | R16G16B16A16Snorm | R16G16B16A16Float | R16G16B16A16Uint
            | R16G16B16A16Int | R32G32Float | R32G32Uint | R32G32Int => 8,
            R32G32B32A32Float | R32G32B32A32Uint | R32G32B32A32Int => 16,
            Bc1RgbaUnorm | Bc1RgbaUnormSrgb | Bc4RUnorm => 8,
            Bc2RgbaUnorm | Bc3RgbaUnorm | Bc5RgUnorm | Bc7RgbaUnorm | Bc6hRgbFloat
            | Bc6hRgbUfloat | Bc2RgbaUnormSrgb | Bc3RgbaUnormSrgb | Bc7RgbaUnormSrgb => 16,
        }
    }
}

/// Parameters for `Device::create_buffer`
#[derive(Clone, Copy, Debug)]
pub struct BufferCreateInfo {
    pub usage: BufferUsage,
    pub size: u64,
}

/// Parameters for `Device::create_image`
#[derive(Clone, Copy, Debug)]
pub struct ImageCreateInfo {
    pub ty: ImageType,
    pub format: ImageFormat,
    pub usage: ImageUsage,
    pub width: u32,
    pub height: u32,
    /// Layer count for array and cube images, depth for 3D images
    pub layer_count_or_depth: u32,
}

/// Parameters for `Device::create_compute_pipeline`
#[derive(Clone, Copy, Debug)]
pub struct ComputePipelineCreateInfo<'a> {
    pub code: &'a [u8],
    pub entrypoint: &'a str,
    pub format: ShaderFormats,
    pub num_readonly_storage_images: u32,
    pub num_readonly_storage_buffers: u32,
    pub num_readwrite_storage_images: u32,
    pub num_readwrite_storage_buffers: u32,
    pub num_uniform_buffers: u32,
    /// Workgroup size used when the shader does not declare one
    pub threadcount_x: u32,
    pub threadcount_y: u32,
    pub threadcount_z: u32,
}

impl<'a> ComputePipelineCreateInfo<'a> {
    /// SPIR-V pipeline with no resources and a 1x1x1 workgroup
    pub fn spirv(code: &'a [u8], entrypoint: &'a str) -> Self {
        Self {
            code,
            entrypoint,
            format: ShaderFormats::SPIRV,
            num_readonly_storage_images: 0,
            num_readonly_storage_buffers: 0,
            num_readwrite_storage_images: 0,
            num_readwrite_storage_buffers: 0,
            num_uniform_buffers: 0,
            threadcount_x: 1,
            threadcount_y: 1,
            threadcount_z: 1,
        }
    }
}

/// A byte range of a buffer
#[derive(Clone, Copy)]
pub struct BufferRegion<'a> {
    pub buffer: &'a Buffer,
    pub offset: u64,
    pub size: u64,
}

/// A box of texels inside one layer of an image
#[derive(Clone, Copy)]
pub struct ImageRegion<'a> {
    pub image: &'a Image,
    pub layer: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Group counts read by an indirect dispatch, laid out as three `u32`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndirectDispatchCommand {
    pub groupcount_x: u32,
    pub groupcount_y: u32,
    pub groupcount_z: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_usage_classification() {
        assert!(BufferUsage::STORAGE_WRITE.is_writable());
        assert!(!(BufferUsage::STORAGE_READ | BufferUsage::TRANSFER_DOWNLOAD).is_writable());
        assert!(ImageUsage::SIMULTANEOUS_READWRITE.is_writable());
        assert!(!ImageUsage::STORAGE_READ.is_writable());
    }

    #[test]
    fn texel_sizes() {
        assert_eq!(ImageFormat::R32Uint.texel_size(), 4);
        assert_eq!(ImageFormat::R32G32B32A32Float.texel_size(), 16);
        assert_eq!(ImageFormat::R8Unorm.texel_size(), 1);
        assert!(ImageFormat::Bc7RgbaUnorm.is_block_compressed());
        assert!(!ImageFormat::R8G8B8A8Unorm.is_block_compressed());
    }
}
