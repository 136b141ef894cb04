//! Runtime configuration for the GPU core.

use ash::vk;

use crate::command::ResetStrategy;
use crate::descriptors::PoolSizeFactor;

/// Descriptor counts per pool, expressed as multiples of the pool's set capacity.
pub const DEFAULT_DESCRIPTOR_SIZE_FACTORS: [PoolSizeFactor; 11] = [
    PoolSizeFactor::new(vk::DescriptorType::SAMPLER, 0.5),
    PoolSizeFactor::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
    PoolSizeFactor::new(vk::DescriptorType::SAMPLED_IMAGE, 4.0),
    PoolSizeFactor::new(vk::DescriptorType::STORAGE_IMAGE, 1.0),
    PoolSizeFactor::new(vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1.0),
    PoolSizeFactor::new(vk::DescriptorType::STORAGE_TEXEL_BUFFER, 1.0),
    PoolSizeFactor::new(vk::DescriptorType::UNIFORM_BUFFER, 2.0),
    PoolSizeFactor::new(vk::DescriptorType::STORAGE_BUFFER, 2.0),
    PoolSizeFactor::new(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1.0),
    PoolSizeFactor::new(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 1.0),
    PoolSizeFactor::new(vk::DescriptorType::INPUT_ATTACHMENT, 0.5),
];

/// GPU core configuration.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    /// Name used to prefix allocation debug labels.
    pub app_name: String,
    /// Number of frames the CPU may record ahead of the device.
    pub frames_in_flight: usize,
    /// Maximum descriptor sets per descriptor pool.
    pub descriptor_pool_size: u32,
    /// Per-type descriptor counts relative to `descriptor_pool_size`.
    pub descriptor_size_factors: Vec<PoolSizeFactor>,
    /// How recycled command buffers are reset.
    pub command_reset_strategy: ResetStrategy,
    /// Upper bound of a single fence wait attempt. A timeout is retried.
    pub fence_timeout_ns: u64,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            app_name: "Kestrel".to_string(),
            frames_in_flight: 2,
            descriptor_pool_size: 1000,
            descriptor_size_factors: DEFAULT_DESCRIPTOR_SIZE_FACTORS.to_vec(),
            command_reset_strategy: ResetStrategy::Individual,
            fence_timeout_ns: 1_000_000_000,
        }
    }
}

impl GpuConfig {
    /// Create a config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    /// Set the descriptor set capacity of each pool.
    pub fn with_descriptor_pool_size(mut self, size: u32) -> Self {
        self.descriptor_pool_size = size.max(1);
        self
    }

    /// Replace the descriptor type multipliers.
    pub fn with_descriptor_size_factors(mut self, factors: Vec<PoolSizeFactor>) -> Self {
        self.descriptor_size_factors = factors;
        self
    }

    /// Set the command buffer reset strategy.
    pub fn with_command_reset_strategy(mut self, strategy: ResetStrategy) -> Self {
        self.command_reset_strategy = strategy;
        self
    }

    /// Set the per-attempt fence timeout.
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }
}
