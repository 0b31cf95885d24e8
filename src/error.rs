// Error taxonomy
//
// Every fallible entry point returns `pulse::Result<T>`. Backends translate
// their native failures into the nearest variant before returning.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum Error {
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid backend")]
    InvalidBackend,
    #[error("invalid device")]
    InvalidDevice,
    #[error("initialization of an object could not be completed for implementation-specific reasons")]
    InitializationFailed,
    #[error("a CPU allocation failed")]
    CpuAllocationFailed,
    #[error("a device allocation failed")]
    DeviceAllocationFailed,
    #[error("device has been lost")]
    DeviceLost,
    #[error("buffer mapping failed")]
    MapFailed,
    #[error("invalid region")]
    InvalidRegion,
    #[error("invalid buffer usage")]
    InvalidBufferUsage,
    #[error("invalid image usage")]
    InvalidImageUsage,
    #[error("invalid image format")]
    InvalidImageFormat,
    #[error("invalid internal pointer")]
    InvalidInternalPointer,
    #[error("no backend candidates support the required shader formats")]
    BackendsCandidatesShaderFormatMismatch,
    #[error("timed out while waiting for fences")]
    Timeout,
}

impl Error {
    /// Human readable description of the error
    pub fn verbalize(&self) -> String {
        self.to_string()
    }
}

#[cfg(feature = "vulkan")]
impl From<ash::vk::Result> for Error {
    fn from(result: ash::vk::Result) -> Self {
        use ash::vk;
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::CpuAllocationFailed,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS
            | vk::Result::ERROR_FRAGMENTED_POOL
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY => Error::DeviceAllocationFailed,
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Error::MapFailed,
            vk::Result::TIMEOUT => Error::Timeout,
            _ => Error::InitializationFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbalized_messages_are_distinct() {
        let all = [
            Error::InvalidHandle,
            Error::InvalidBackend,
            Error::InvalidDevice,
            Error::InitializationFailed,
            Error::CpuAllocationFailed,
            Error::DeviceAllocationFailed,
            Error::DeviceLost,
            Error::MapFailed,
            Error::InvalidRegion,
            Error::InvalidBufferUsage,
            Error::InvalidImageUsage,
            Error::InvalidImageFormat,
            Error::InvalidInternalPointer,
            Error::BackendsCandidatesShaderFormatMismatch,
            Error::Timeout,
        ];
        let mut seen = std::collections::HashSet::new();
        for err in all {
            assert!(seen.insert(err.verbalize()), "duplicate message for {:?}", err);
        }
    }

    #[cfg(feature = "vulkan")]
    #[test]
    fn native_results_map_to_nearest_kind() {
        use ash::vk;
        assert_eq!(Error::from(vk::Result::ERROR_DEVICE_LOST), Error::DeviceLost);
        assert_eq!(Error::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY), Error::CpuAllocationFailed);
        assert_eq!(Error::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY), Error::DeviceAllocationFailed);
        assert_eq!(Error::from(vk::Result::ERROR_LAYER_NOT_PRESENT), Error::InitializationFailed);
    }
}
