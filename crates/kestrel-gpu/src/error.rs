//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found or a required feature is missing.
    #[error("Unsupported device: {0}")]
    Unsupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Descriptor pool rotation failed twice in a row.
    #[error("Descriptor pool exhausted after rotating to a fresh pool")]
    DescriptorPoolExhausted,

    /// The presentation surface changed and the swapchain must be rebuilt.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Handle not known to the device.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// How the frame loop should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The renderer cannot continue.
    Fatal,
    /// Recovered locally by acquiring a fresh pool; fatal only for the current draw.
    Transient,
    /// Handled by rebuilding the swapchain, never reported to the caller.
    Recoverable,
}

impl GpuError {
    /// Classify this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::SwapchainOutOfDate
            | Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR) => {
                ErrorSeverity::Recoverable
            }
            Self::DescriptorPoolExhausted
            | Self::Vulkan(
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL,
            ) => ErrorSeverity::Transient,
            _ => ErrorSeverity::Fatal,
        }
    }

    /// Whether the renderer has to shut down.
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_is_recoverable() {
        let err = GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert_eq!(err.severity(), ErrorSeverity::Recoverable);
        assert!(!err.is_fatal());
    }

    #[test]
    fn pool_errors_are_transient() {
        assert_eq!(
            GpuError::from(vk::Result::ERROR_FRAGMENTED_POOL).severity(),
            ErrorSeverity::Transient
        );
        assert_eq!(
            GpuError::DescriptorPoolExhausted.severity(),
            ErrorSeverity::Transient
        );
    }

    #[test]
    fn allocation_failure_is_fatal() {
        assert!(GpuError::AllocationFailed("out of device memory".into()).is_fatal());
        assert!(GpuError::from(vk::Result::ERROR_DEVICE_LOST).is_fatal());
    }
}
