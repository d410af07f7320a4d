//! RHI-specific error types and the per-frame result code.

use ash::vk;
use thiserror::Error;
use tracing::warn;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error not covered by a more specific variant
    #[error("Vulkan error: {0}")]
    VulkanError(vk::Result),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// Invalid backend configuration
    #[error("Config error: {0}")]
    ConfigError(#[from] vkframe_core::Error),

    /// Native object creation or memory allocation failed. The resource is
    /// left in the not-created state.
    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(String),

    /// The surface was resized or invalidated; recreate the swapchain and
    /// retry the frame.
    #[error("Swapchain is out of date")]
    SwapChainOutOfDate,

    /// The device was lost; the backend must be torn down and recreated.
    #[error("Device lost")]
    DeviceLost,

    /// A binding-set pool ran out of room. Handled internally by creating a
    /// new pool.
    #[error("Binding-set pool exhausted")]
    PoolExhausted,

    /// A fence wait exceeded the configured timeout.
    #[error("Timed out waiting for a fence")]
    FenceTimeout,

    /// Swapchain setup error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Stale, destroyed or foreign handle
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Operation not valid in the current frame or pass state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                RhiError::SwapChainOutOfDate
            }
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                RhiError::PoolExhausted
            }
            vk::Result::TIMEOUT => RhiError::FenceTimeout,
            other => RhiError::VulkanError(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

/// Outcome of a frame-cycle call (`begin_frame`, `end_frame`, `finish`, ...).
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOpResult {
    /// The operation completed.
    Success,
    /// A non-fatal failure; the frame should be skipped.
    Error,
    /// Treat the frame as a no-op, recreate the swapchain and retry.
    SwapChainOutOfDate,
    /// Stop rendering until the backend is recreated.
    DeviceLost,
    /// A fence wait exceeded the configured timeout.
    Timeout,
}

impl FrameOpResult {
    /// Returns true for [`FrameOpResult::Success`].
    #[inline]
    pub fn is_success(self) -> bool {
        self == FrameOpResult::Success
    }
}

impl From<RhiError> for FrameOpResult {
    fn from(error: RhiError) -> Self {
        match error {
            RhiError::SwapChainOutOfDate => FrameOpResult::SwapChainOutOfDate,
            RhiError::DeviceLost => FrameOpResult::DeviceLost,
            RhiError::FenceTimeout => FrameOpResult::Timeout,
            other => {
                warn!("Frame operation failed: {}", other);
                FrameOpResult::Error
            }
        }
    }
}

impl<T> From<RhiResult<T>> for FrameOpResult {
    fn from(result: RhiResult<T>) -> Self {
        match result {
            Ok(_) => FrameOpResult::Success,
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_result_mapping() {
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_DEVICE_LOST),
            RhiError::DeviceLost
        ));
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            RhiError::SwapChainOutOfDate
        ));
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            RhiError::PoolExhausted
        ));
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_FRAGMENTED_POOL),
            RhiError::PoolExhausted
        ));
        assert!(matches!(
            RhiError::from(vk::Result::TIMEOUT),
            RhiError::FenceTimeout
        ));
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
    }

    #[test]
    fn test_frame_op_result_from_error() {
        assert_eq!(
            FrameOpResult::from(RhiError::SwapChainOutOfDate),
            FrameOpResult::SwapChainOutOfDate
        );
        assert_eq!(
            FrameOpResult::from(RhiError::DeviceLost),
            FrameOpResult::DeviceLost
        );
        assert_eq!(
            FrameOpResult::from(RhiError::FenceTimeout),
            FrameOpResult::Timeout
        );
        assert_eq!(
            FrameOpResult::from(RhiError::InvalidState("x".to_string())),
            FrameOpResult::Error
        );
    }

    #[test]
    fn test_frame_op_result_from_result() {
        let ok: RhiResult<()> = Ok(());
        assert!(FrameOpResult::from(ok).is_success());
        let err: RhiResult<u32> = Err(RhiError::DeviceLost);
        assert_eq!(FrameOpResult::from(err), FrameOpResult::DeviceLost);
    }
}
