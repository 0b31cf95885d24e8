//! Pulse - cross-API GPU compute runtime
//!
//! One object model for compute work over several drivers: pick a backend,
//! create a device, record dispatches into command lists and wait on fences.
//! A Vulkan driver is compiled in with the `vulkan` feature; a CPU driver
//! interpreting SPIR-V is always available as the fallback.
//!
//! ```no_run
//! use pulse::*;
//!
//! # fn main() -> pulse::Result<()> {
//! let backend = Backend::load(BackendFlags::ANY, ShaderFormats::SPIRV, DebugLevel::Low)?;
//! let device = backend.create_device(&[])?;
//! let buffer = device.create_buffer(&BufferCreateInfo {
//!     usage: BufferUsage::STORAGE_WRITE | BufferUsage::TRANSFER_DOWNLOAD,
//!     size: 4096,
//! })?;
//! device.destroy_buffer(buffer)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod binding;
pub mod buffer;
pub mod command_list;
pub mod compute_pass;
pub mod config;
pub mod debug;
pub mod device;
pub mod error;
pub mod fence;
pub mod image;
pub mod pipeline;
pub mod types;

pub use backend::{select_backend, supports_backend, Backend, BackendKind};
pub use buffer::{Buffer, BufferMapping};
pub use command_list::CommandList;
pub use compute_pass::{ComputePass, MAX_BOUND_SLOTS};
pub use config::PulseConfig;
pub use debug::DebugCallback;
pub use device::Device;
pub use error::{Error, Result};
pub use fence::Fence;
pub use image::Image;
pub use pipeline::ComputePipeline;
pub use types::*;
