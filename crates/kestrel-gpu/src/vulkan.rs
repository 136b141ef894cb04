//! [`RawDevice`] implementation on top of `ash` and `gpu-allocator`.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;

use crate::device::{AcquiredImage, AllocationDesc, AllocationInfo, AllocationToken, RawDevice, SubmitBatch};
use crate::error::{GpuError, Result};

struct MemoryState {
    allocator: Option<Allocator>,
    allocations: HashMap<AllocationToken, Allocation>,
    next_token: u64,
}

impl MemoryState {
    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    fn insert(&mut self, allocation: Allocation) -> AllocationToken {
        self.next_token += 1;
        let token = AllocationToken(self.next_token);
        self.allocations.insert(token, allocation);
        token
    }

    fn free(&mut self, token: AllocationToken) {
        let Some(allocation) = self.allocations.remove(&token) else {
            tracing::warn!("Freeing unknown allocation {:?}", token);
            return;
        };
        if let Some(allocator) = self.allocator.as_mut() {
            if let Err(e) = allocator.free(allocation) {
                tracing::error!("Failed to free allocation {:?}: {e}", token);
            }
        }
    }
}

/// Vulkan device wrapper.
///
/// The instance, logical device and queues are created by the caller; this
/// type only borrows the device through an `Arc` and owns the memory
/// sub-allocator.
pub struct VulkanDevice {
    device: Arc<ash::Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    memory: Mutex<MemoryState>,
    non_coherent_atom_size: vk::DeviceSize,
}

impl VulkanDevice {
    /// Wrap an existing logical device.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid and outlive
    /// the returned value.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        let properties = instance.get_physical_device_properties(physical_device);
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);

        Ok(Self {
            device,
            swapchain_loader,
            memory: Mutex::new(MemoryState {
                allocator: Some(allocator),
                allocations: HashMap::new(),
                next_token: 0,
            }),
            non_coherent_atom_size: properties.limits.non_coherent_atom_size.max(1),
        })
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Free all device memory. Must run before the logical device is destroyed.
    pub fn shutdown(&self) {
        let mut memory = self.memory.lock();
        if !memory.allocations.is_empty() {
            tracing::warn!(
                "{} allocations still alive at shutdown",
                memory.allocations.len()
            );
        }
        memory.allocations.clear();
        // gpu_allocator::Allocator::drop releases every memory block.
        memory.allocator.take();
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        desc: &AllocationDesc<'_>,
        linear: bool,
        scheme: AllocationScheme,
    ) -> Result<AllocationInfo> {
        let mut memory = self.memory.lock();
        let allocation = memory
            .allocator()?
            .allocate(&AllocationCreateDesc {
                name: desc.name,
                requirements,
                location: desc.location,
                linear,
                allocation_scheme: scheme,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        let size = allocation.size();
        let memory_flags = allocation.memory_properties();
        let mapped = if desc.persistent_map {
            allocation.mapped_ptr().map(|p| p.cast::<u8>())
        } else {
            None
        };
        let token = memory.insert(allocation);

        Ok(AllocationInfo {
            token,
            size,
            memory_flags,
            mapped,
        })
    }

    fn bind_target(&self, token: AllocationToken) -> Result<(vk::DeviceMemory, vk::DeviceSize)> {
        let memory = self.memory.lock();
        let allocation = memory
            .allocations
            .get(&token)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("allocation {token:?}")))?;
        // SAFETY: the memory block outlives the allocation, which lives in the table.
        Ok((unsafe { allocation.memory() }, allocation.offset()))
    }
}

/// Offset and size of the mapped range to flush for `offset..offset + size`
/// of an allocation, widened to `atom` boundaries.
///
/// Returns `vk::WHOLE_SIZE` as the size when the widened end would run past
/// the allocation.
fn flush_range(
    allocation_offset: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let start = allocation_offset + offset;
    let aligned_start = start - start % atom;
    let aligned_end = (start + size).div_ceil(atom) * atom;
    if aligned_end > allocation_offset + allocation_size {
        (aligned_start, vk::WHOLE_SIZE)
    } else {
        (aligned_start, aligned_end - aligned_start)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RawDevice for VulkanDevice {
    unsafe fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        desc: &AllocationDesc<'_>,
    ) -> Result<(vk::Buffer, AllocationInfo)> {
        let buffer = self.device.create_buffer(info, None)?;
        let requirements = self.device.get_buffer_memory_requirements(buffer);

        let scheme = if desc.dedicated {
            AllocationScheme::DedicatedBuffer(buffer)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };
        let allocation = match self.allocate(requirements, desc, true, scheme) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(buffer, None);
                return Err(e);
            }
        };

        let bound = self.bind_target(allocation.token).and_then(|(memory, offset)| {
            Ok(self.device.bind_buffer_memory(buffer, memory, offset)?)
        });
        if let Err(e) = bound {
            self.memory.lock().free(allocation.token);
            self.device.destroy_buffer(buffer, None);
            return Err(e);
        }

        Ok((buffer, allocation))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationToken) {
        self.memory.lock().free(allocation);
        self.device.destroy_buffer(buffer, None);
    }

    unsafe fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        desc: &AllocationDesc<'_>,
    ) -> Result<(vk::Image, AllocationInfo)> {
        let image = self.device.create_image(info, None)?;
        let requirements = self.device.get_image_memory_requirements(image);

        let scheme = if desc.dedicated {
            AllocationScheme::DedicatedImage(image)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };
        let linear = info.tiling == vk::ImageTiling::LINEAR;
        let allocation = match self.allocate(requirements, desc, linear, scheme) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_image(image, None);
                return Err(e);
            }
        };

        let bound = self.bind_target(allocation.token).and_then(|(memory, offset)| {
            Ok(self.device.bind_image_memory(image, memory, offset)?)
        });
        if let Err(e) = bound {
            self.memory.lock().free(allocation.token);
            self.device.destroy_image(image, None);
            return Err(e);
        }

        Ok((image, allocation))
    }

    unsafe fn destroy_image(&self, image: vk::Image, allocation: AllocationToken) {
        self.memory.lock().free(allocation);
        self.device.destroy_image(image, None);
    }

    unsafe fn map_memory(&self, allocation: AllocationToken) -> Result<NonNull<u8>> {
        let memory = self.memory.lock();
        memory
            .allocations
            .get(&allocation)
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("Memory is not host visible".to_string()))
    }

    unsafe fn unmap_memory(&self, _allocation: AllocationToken) {
        // gpu-allocator keeps host-visible blocks mapped for their whole life.
    }

    unsafe fn flush_memory(
        &self,
        allocation: AllocationToken,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()> {
        let memory = self.memory.lock();
        let allocation = memory
            .allocations
            .get(&allocation)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("allocation {allocation:?}")))?;

        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }

        let (aligned_start, range_size) = flush_range(
            allocation.offset(),
            allocation.size(),
            offset,
            size,
            self.non_coherent_atom_size,
        );

        let range = vk::MappedMemoryRange::default()
            .memory(allocation.memory())
            .offset(aligned_start)
            .size(range_size);
        self.device
            .flush_mapped_memory_ranges(std::slice::from_ref(&range))?;
        Ok(())
    }

    unsafe fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView> {
        Ok(self.device.create_image_view(info, None)?)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.device.destroy_image_view(view, None);
    }

    unsafe fn create_command_pool(
        &self,
        info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool> {
        Ok(self.device.create_command_pool(info, None)?)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.device.destroy_command_pool(pool, None);
    }

    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        self.device
            .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?;
        Ok(())
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);

        Ok(self.device.allocate_command_buffers(&alloc_info)?)
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        self.device.free_command_buffers(pool, buffers);
    }

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        Ok(())
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        self.device.begin_command_buffer(cmd, &begin_info)?;
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.device.end_command_buffer(cmd)?;
        Ok(())
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            image_barriers,
        );
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.device.cmd_copy_buffer(cmd, src, dst, regions);
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.device
            .cmd_copy_buffer_to_image(cmd, src, dst, layout, regions);
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(batch.command_buffers)
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .signal_semaphores(batch.signal_semaphores);

        self.device.queue_submit(queue, &[submit_info], fence)?;
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        self.device.queue_wait_idle(queue)?;
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> Result<()> {
        self.device.device_wait_idle()?;
        Ok(())
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        Ok(self.device.create_descriptor_set_layout(&layout_info, None)?)
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.device.destroy_descriptor_set_layout(layout, None);
    }

    unsafe fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        Ok(self.device.create_descriptor_pool(&create_info, None)?)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.device.destroy_descriptor_pool(pool, None);
    }

    unsafe fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        self.device
            .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?;
        Ok(())
    }

    unsafe fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = self.device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets[0])
    }

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        self.device.update_descriptor_sets(writes, &[]);
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(self.device.create_fence(&create_info, None)?)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device.destroy_fence(fence, None);
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<bool> {
        match self.device.wait_for_fences(fences, true, timeout_ns) {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        self.device.reset_fences(fences)?;
        Ok(())
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        Ok(self.device.get_fence_status(fence)?)
    }

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(self.device.create_semaphore(&create_info, None)?)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.device.destroy_semaphore(semaphore, None);
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        match self.swapchain_loader.acquire_next_image(
            swapchain,
            timeout_ns,
            semaphore,
            vk::Fence::null(),
        ) {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            // No image was acquired; the swapchain has to be rebuilt.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match self.swapchain_loader.queue_present(queue, &present_info) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }
}
