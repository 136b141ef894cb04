//! The native device seam.
//!
//! Every call that reaches the graphics API goes through [`RawDevice`]. The
//! resource wrappers in this crate hold an `Arc<dyn RawDevice>` and never talk
//! to `ash` directly, which lets the same recycling and caching logic run on a
//! real Vulkan device ([`crate::vulkan::VulkanDevice`]) or on the in-process
//! headless device used by tests.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::error::Result;

/// Shared handle to a device implementation.
pub type SharedDevice = Arc<dyn RawDevice>;

/// Opaque identifier of one sub-allocation owned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationToken(pub u64);

/// Memory placement requested for a buffer or image.
#[derive(Debug, Clone, Copy)]
pub struct AllocationDesc<'a> {
    /// Debug name of the allocation.
    pub name: &'a str,
    /// Where the memory should live.
    pub location: MemoryLocation,
    /// Keep the memory mapped for the lifetime of the allocation.
    pub persistent_map: bool,
    /// Request a dedicated memory block (images that are sampled every frame).
    pub dedicated: bool,
}

/// What the device reports back about a fresh allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationInfo {
    /// Handle used to map, flush and free the allocation.
    pub token: AllocationToken,
    /// Size actually reserved, at least the requested size.
    pub size: vk::DeviceSize,
    /// Properties of the memory type the allocation landed in.
    pub memory_flags: vk::MemoryPropertyFlags,
    /// Host pointer, present only for persistently mapped allocations.
    pub mapped: Option<NonNull<u8>>,
}

/// One batch handed to `vkQueueSubmit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    /// Executed in order.
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Waited on before the stages in `wait_stages` run.
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One stage mask per entry in `wait_semaphores`.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Signaled once every command buffer has completed.
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Result of acquiring a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    /// Index into the swapchain's images.
    pub index: u32,
    /// The image is usable but the swapchain no longer matches the surface.
    pub suboptimal: bool,
}

/// Raw device operations used by the core.
///
/// Implementations must be usable from any thread, but the wrappers in this
/// crate only call them from the recording thread.
///
/// # Safety
///
/// All methods mirror their Vulkan counterparts. Callers must pass handles
/// created by the same device and respect the external synchronization
/// rules of the corresponding Vulkan command.
pub trait RawDevice: Send + Sync {
    // Memory

    unsafe fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        desc: &AllocationDesc<'_>,
    ) -> Result<(vk::Buffer, AllocationInfo)>;

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationToken);

    unsafe fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        desc: &AllocationDesc<'_>,
    ) -> Result<(vk::Image, AllocationInfo)>;

    unsafe fn destroy_image(&self, image: vk::Image, allocation: AllocationToken);

    unsafe fn map_memory(&self, allocation: AllocationToken) -> Result<NonNull<u8>>;

    unsafe fn unmap_memory(&self, allocation: AllocationToken);

    unsafe fn flush_memory(
        &self,
        allocation: AllocationToken,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()>;

    unsafe fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView>;

    unsafe fn destroy_image_view(&self, view: vk::ImageView);

    // Commands

    unsafe fn create_command_pool(
        &self,
        info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool>;

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    unsafe fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> Result<()>;

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;

    unsafe fn device_wait_idle(&self) -> Result<()>;

    // Descriptors

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout>;

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    unsafe fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    unsafe fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()>;

    /// Allocate one set. The raw `vk::Result` is returned so callers can tell
    /// pool exhaustion apart from other failures.
    unsafe fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    // Synchronization

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// Wait for all fences. Returns `false` if the timeout elapsed first.
    unsafe fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<bool>;

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()>;

    /// Non-blocking signal query.
    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool>;

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore>;

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Presentation

    /// Acquire the next presentable image. An out-of-date swapchain is
    /// reported as [`crate::GpuError::SwapchainOutOfDate`].
    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquiredImage>;

    /// Queue an image for presentation. Returns `true` when the swapchain is
    /// suboptimal; out-of-date is reported as an error.
    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool>;
}
