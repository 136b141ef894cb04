//! In-process device without a GPU.
//!
//! Handles are fabricated from a counter, allocations are backed by host
//! memory and submissions execute immediately: buffer copies are applied,
//! then the signal semaphores and the fence are set. Descriptor pools enforce
//! their set and per-type capacities the way a driver does. Every barrier and
//! descriptor write is recorded so tests can inspect what the core issued.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::device::{AcquiredImage, AllocationDesc, AllocationInfo, AllocationToken, RawDevice, SubmitBatch};
use crate::error::{GpuError, Result};

/// Counters of native work performed by the headless device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub buffers_alive: usize,
    pub images_alive: usize,
    pub image_views_alive: usize,
    pub command_pools_created: usize,
    pub command_pool_resets: usize,
    pub command_buffers_allocated: usize,
    pub command_buffers_freed: usize,
    pub command_buffer_resets: usize,
    pub descriptor_layouts_created: usize,
    pub descriptor_pools_created: usize,
    pub descriptor_pool_resets: usize,
    pub descriptor_sets_allocated: usize,
    pub descriptor_update_calls: usize,
    pub flushes: usize,
    pub submits: usize,
    pub queue_idle_waits: usize,
    pub acquires: usize,
    pub presents: usize,
}

/// One image barrier as it reached the device.
#[derive(Debug, Clone, Copy)]
pub struct RecordedBarrier {
    pub command_buffer: vk::CommandBuffer,
    pub image: vk::Image,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub subresource_range: vk::ImageSubresourceRange,
}

/// One descriptor write as it reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub buffer: Option<vk::Buffer>,
    pub image_view: Option<vk::ImageView>,
}

/// One buffer-to-image copy as it reached the device.
#[derive(Debug, Clone)]
pub struct RecordedImageCopy {
    pub src: vk::Buffer,
    pub dst: vk::Image,
    pub layout: vk::ImageLayout,
    pub regions: Vec<vk::BufferImageCopy>,
}

struct HostMemory {
    bytes: Vec<u8>,
    flags: vk::MemoryPropertyFlags,
    mapped: bool,
}

enum Command {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
}

struct CommandBufferState {
    pool: vk::CommandPool,
    recording: bool,
    executable: bool,
    commands: Vec<Command>,
}

struct DescriptorPoolState {
    max_sets: u32,
    capacity: HashMap<vk::DescriptorType, u32>,
    remaining: HashMap<vk::DescriptorType, u32>,
    sets_allocated: u32,
}

impl DescriptorPoolState {
    fn reset(&mut self) {
        self.remaining = self.capacity.clone();
        self.sets_allocated = 0;
    }
}

struct SwapchainState {
    image_count: u32,
    next_image: u32,
}

#[derive(Default)]
struct State {
    memory: HashMap<AllocationToken, HostMemory>,
    buffers: HashMap<vk::Buffer, AllocationToken>,
    images: HashMap<vk::Image, AllocationToken>,
    image_views: HashMap<vk::ImageView, vk::Image>,
    command_pools: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferState>,
    layouts: HashMap<vk::DescriptorSetLayout, Vec<(vk::DescriptorType, u32)>>,
    descriptor_pools: HashMap<vk::DescriptorPool, DescriptorPoolState>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashMap<vk::Semaphore, bool>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainState>,
    barriers: Vec<RecordedBarrier>,
    writes: Vec<RecordedWrite>,
    image_copies: Vec<RecordedImageCopy>,
    fail_next_descriptor_allocation: Option<vk::Result>,
    fail_next_begin: Option<vk::Result>,
    fail_next_pool_reset: Option<vk::Result>,
    out_of_date_acquires: u32,
    out_of_date_presents: u32,
    suboptimal_present: bool,
    stats: HeadlessStats,
}

/// Device that runs entirely in host memory.
pub struct HeadlessDevice {
    state: Mutex<State>,
    next_handle: AtomicU64,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// Create an empty device.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            // Low values are left for the queue handle.
            next_handle: AtomicU64::new(0x1000),
        }
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn next<H: Handle>(&self) -> H {
        H::from_raw(self.next_raw())
    }

    /// The single queue of this device.
    pub fn graphics_queue(&self) -> vk::Queue {
        vk::Queue::from_raw(0x10)
    }

    /// Snapshot of the native work counters.
    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().stats
    }

    /// Every image barrier recorded so far, in order.
    pub fn barriers(&self) -> Vec<RecordedBarrier> {
        self.state.lock().barriers.clone()
    }

    /// Every descriptor write issued so far, in order.
    pub fn descriptor_writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    /// Every buffer-to-image copy recorded so far, in order.
    pub fn image_copies(&self) -> Vec<RecordedImageCopy> {
        self.state.lock().image_copies.clone()
    }

    /// Copy of the memory backing `buffer`.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let token = state.buffers.get(&buffer)?;
        state.memory.get(token).map(|m| m.bytes.clone())
    }

    /// Whether `fence` is currently signaled.
    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    /// Number of command buffers `pool` currently owns natively.
    pub fn command_buffers_in_pool(&self, pool: vk::CommandPool) -> usize {
        self.state
            .lock()
            .command_pools
            .get(&pool)
            .map_or(0, Vec::len)
    }

    /// Make the next descriptor set allocation fail with `result`.
    pub fn fail_next_descriptor_allocation(&self, result: vk::Result) {
        self.state.lock().fail_next_descriptor_allocation = Some(result);
    }

    /// Make the next `begin_command_buffer` fail with `result`.
    pub fn fail_next_begin(&self, result: vk::Result) {
        self.state.lock().fail_next_begin = Some(result);
    }

    /// Make the next descriptor pool reset fail with `result`.
    pub fn fail_next_pool_reset(&self, result: vk::Result) {
        self.state.lock().fail_next_pool_reset = Some(result);
    }

    /// Report the swapchain out of date on the next `count` acquires.
    pub fn expire_swapchain_on_acquire(&self, count: u32) {
        self.state.lock().out_of_date_acquires = count;
    }

    /// Report the swapchain out of date on the next `count` presents.
    pub fn expire_swapchain_on_present(&self, count: u32) {
        self.state.lock().out_of_date_presents = count;
    }

    /// Make every present report a suboptimal swapchain.
    pub fn set_present_suboptimal(&self, suboptimal: bool) {
        self.state.lock().suboptimal_present = suboptimal;
    }

    /// Create a swapchain with `image_count` presentable images.
    pub fn create_swapchain(&self, image_count: u32) -> vk::SwapchainKHR {
        let swapchain = self.next();
        self.state.lock().swapchains.insert(
            swapchain,
            SwapchainState {
                image_count: image_count.max(1),
                next_image: 0,
            },
        );
        swapchain
    }

    /// Destroy a swapchain created with [`Self::create_swapchain`].
    pub fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state.lock().swapchains.remove(&swapchain);
    }

    fn host_memory(&self, size: vk::DeviceSize, desc: &AllocationDesc<'_>) -> HostMemory {
        let flags = match desc.location {
            MemoryLocation::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            // Persistent mappings land in coherent memory, scoped ones do
            // not, so the flush path is exercised.
            MemoryLocation::CpuToGpu if desc.persistent_map => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryLocation::CpuToGpu => vk::MemoryPropertyFlags::HOST_VISIBLE,
            MemoryLocation::GpuToCpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            }
            MemoryLocation::Unknown => vk::MemoryPropertyFlags::empty(),
        };

        HostMemory {
            bytes: vec![0; usize::try_from(size).unwrap_or(0)],
            flags,
            mapped: false,
        }
    }

    fn insert_memory(&self, state: &mut State, memory: HostMemory, persistent: bool) -> AllocationInfo {
        let token = AllocationToken(self.next_raw());
        let mut memory = memory;
        let size = memory.bytes.len() as vk::DeviceSize;
        let memory_flags = memory.flags;
        let mapped = if persistent && memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            memory.mapped = true;
            NonNull::new(memory.bytes.as_mut_ptr())
        } else {
            None
        };
        // The Vec's heap block does not move when the map rehashes.
        state.memory.insert(token, memory);

        AllocationInfo {
            token,
            size,
            memory_flags,
            mapped,
        }
    }
}

fn image_byte_size(info: &vk::ImageCreateInfo<'_>) -> vk::DeviceSize {
    let texel = crate::image::format_bytes_per_pixel(info.format).unwrap_or(4);
    let mut total = 0;
    for level in 0..info.mip_levels {
        let w = u64::from((info.extent.width >> level).max(1));
        let h = u64::from((info.extent.height >> level).max(1));
        let d = u64::from((info.extent.depth >> level).max(1));
        total += w * h * d * texel;
    }
    total * u64::from(info.array_layers)
}

impl RawDevice for HeadlessDevice {
    unsafe fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
        desc: &AllocationDesc<'_>,
    ) -> Result<(vk::Buffer, AllocationInfo)> {
        if info.size == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "{}: zero-sized buffer",
                desc.name
            )));
        }
        let memory = self.host_memory(info.size, desc);
        let buffer = self.next();

        let mut state = self.state.lock();
        let allocation = self.insert_memory(&mut state, memory, desc.persistent_map);
        state.buffers.insert(buffer, allocation.token);
        state.stats.buffers_alive += 1;

        Ok((buffer, allocation))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationToken) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_some() {
            state.stats.buffers_alive -= 1;
        }
        state.memory.remove(&allocation);
    }

    unsafe fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        desc: &AllocationDesc<'_>,
    ) -> Result<(vk::Image, AllocationInfo)> {
        let memory = self.host_memory(image_byte_size(info), desc);
        let image = self.next();

        let mut state = self.state.lock();
        let allocation = self.insert_memory(&mut state, memory, desc.persistent_map);
        state.images.insert(image, allocation.token);
        state.stats.images_alive += 1;

        Ok((image, allocation))
    }

    unsafe fn destroy_image(&self, image: vk::Image, allocation: AllocationToken) {
        let mut state = self.state.lock();
        if state.images.remove(&image).is_some() {
            state.stats.images_alive -= 1;
        }
        state.memory.remove(&allocation);
    }

    unsafe fn map_memory(&self, allocation: AllocationToken) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        let memory = state
            .memory
            .get_mut(&allocation)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("allocation {allocation:?}")))?;
        if !memory.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(GpuError::InvalidState(
                "Memory is not host visible".to_string(),
            ));
        }
        memory.mapped = true;
        NonNull::new(memory.bytes.as_mut_ptr())
            .ok_or_else(|| GpuError::InvalidState("Empty allocation".to_string()))
    }

    unsafe fn unmap_memory(&self, allocation: AllocationToken) {
        if let Some(memory) = self.state.lock().memory.get_mut(&allocation) {
            memory.mapped = false;
        }
    }

    unsafe fn flush_memory(
        &self,
        allocation: AllocationToken,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let memory = state
            .memory
            .get(&allocation)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("allocation {allocation:?}")))?;
        if !memory.mapped {
            return Err(GpuError::InvalidState("Flushing unmapped memory".to_string()));
        }
        if offset + size > memory.bytes.len() as vk::DeviceSize {
            return Err(GpuError::from(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        if !memory.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
            state.stats.flushes += 1;
        }
        Ok(())
    }

    unsafe fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&info.image) {
            return Err(GpuError::ResourceNotFound(format!("image {:?}", info.image)));
        }
        let view = self.next();
        state.image_views.insert(view, info.image);
        state.stats.image_views_alive += 1;
        Ok(view)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        if state.image_views.remove(&view).is_some() {
            state.stats.image_views_alive -= 1;
        }
    }

    unsafe fn create_command_pool(
        &self,
        _info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool> {
        let pool = self.next();
        let mut state = self.state.lock();
        state.command_pools.insert(pool, Vec::new());
        state.stats.command_pools_created += 1;
        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if let Some(buffers) = state.command_pools.remove(&pool) {
            for cmd in buffers {
                state.command_buffers.remove(&cmd);
            }
        }
    }

    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        let mut state = self.state.lock();
        let buffers = state
            .command_pools
            .get(&pool)
            .cloned()
            .ok_or_else(|| GpuError::ResourceNotFound(format!("command pool {pool:?}")))?;
        for cmd in buffers {
            if let Some(cb) = state.command_buffers.get_mut(&cmd) {
                cb.recording = false;
                cb.executable = false;
                cb.commands.clear();
            }
        }
        state.stats.command_pool_resets += 1;
        Ok(())
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let handles: Vec<vk::CommandBuffer> = (0..count).map(|_| self.next()).collect();

        let mut state = self.state.lock();
        let owned = state
            .command_pools
            .get_mut(&pool)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("command pool {pool:?}")))?;
        owned.extend_from_slice(&handles);
        for &cmd in &handles {
            state.command_buffers.insert(
                cmd,
                CommandBufferState {
                    pool,
                    recording: false,
                    executable: false,
                    commands: Vec::new(),
                },
            );
        }
        state.stats.command_buffers_allocated += handles.len();
        Ok(handles)
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        if let Some(owned) = state.command_pools.get_mut(&pool) {
            owned.retain(|cmd| !buffers.contains(cmd));
        }
        for cmd in buffers {
            if state.command_buffers.remove(cmd).is_some() {
                state.stats.command_buffers_freed += 1;
            }
        }
    }

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let cb = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("command buffer {cmd:?}")))?;
        cb.recording = false;
        cb.executable = false;
        cb.commands.clear();
        state.stats.command_buffer_resets += 1;
        Ok(())
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_begin.take() {
            return Err(result.into());
        }
        let cb = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("command buffer {cmd:?}")))?;
        if cb.recording {
            return Err(GpuError::InvalidState(format!(
                "Command buffer {cmd:?} is already recording"
            )));
        }
        cb.recording = true;
        cb.executable = false;
        cb.commands.clear();
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let cb = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("command buffer {cmd:?}")))?;
        if !cb.recording {
            return Err(GpuError::InvalidState(format!(
                "Command buffer {cmd:?} is not recording"
            )));
        }
        cb.recording = false;
        cb.executable = true;
        Ok(())
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        let mut state = self.state.lock();
        for barrier in image_barriers {
            state.barriers.push(RecordedBarrier {
                command_buffer: cmd,
                image: barrier.image,
                src_stage,
                dst_stage,
                src_access: barrier.src_access_mask,
                dst_access: barrier.dst_access_mask,
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
                src_queue_family: barrier.src_queue_family_index,
                dst_queue_family: barrier.dst_queue_family_index,
                subresource_range: barrier.subresource_range,
            });
        }
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        if let Some(cb) = self.state.lock().command_buffers.get_mut(&cmd) {
            cb.commands.push(Command::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            });
        }
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        _cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.state.lock().image_copies.push(RecordedImageCopy {
            src,
            dst,
            layout,
            regions: regions.to_vec(),
        });
    }

    unsafe fn queue_submit(
        &self,
        _queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if fence != vk::Fence::null() && state.fences.get(&fence).copied().unwrap_or(false) {
            return Err(GpuError::InvalidState(format!(
                "Fence {fence:?} submitted while signaled"
            )));
        }

        for &cmd in batch.command_buffers {
            let commands = match state.command_buffers.get_mut(&cmd) {
                Some(cb) if cb.executable => std::mem::take(&mut cb.commands),
                Some(_) => {
                    return Err(GpuError::InvalidState(format!(
                        "Command buffer {cmd:?} is not executable"
                    )))
                }
                None => {
                    return Err(GpuError::ResourceNotFound(format!("command buffer {cmd:?}")))
                }
            };
            for command in &commands {
                execute(&mut state, command);
            }
            if let Some(cb) = state.command_buffers.get_mut(&cmd) {
                cb.commands = commands;
            }
        }

        for semaphore in batch.wait_semaphores {
            state.semaphores.insert(*semaphore, false);
        }
        for semaphore in batch.signal_semaphores {
            state.semaphores.insert(*semaphore, true);
        }
        if fence != vk::Fence::null() {
            state.fences.insert(fence, true);
        }
        state.stats.submits += 1;
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, _queue: vk::Queue) -> Result<()> {
        // Submissions complete inside `queue_submit`.
        self.state.lock().stats.queue_idle_waits += 1;
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> Result<()> {
        Ok(())
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let layout = self.next();
        let mut state = self.state.lock();
        state.layouts.insert(
            layout,
            bindings
                .iter()
                .map(|b| (b.descriptor_type, b.descriptor_count))
                .collect(),
        );
        state.stats.descriptor_layouts_created += 1;
        Ok(layout)
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().layouts.remove(&layout);
    }

    unsafe fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let mut capacity = HashMap::new();
        for size in pool_sizes {
            *capacity.entry(size.ty).or_insert(0) += size.descriptor_count;
        }

        let pool = self.next();
        let mut state = self.state.lock();
        state.descriptor_pools.insert(
            pool,
            DescriptorPoolState {
                max_sets,
                remaining: capacity.clone(),
                capacity,
                sets_allocated: 0,
            },
        );
        state.stats.descriptor_pools_created += 1;
        Ok(pool)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().descriptor_pools.remove(&pool);
    }

    unsafe fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_pool_reset.take() {
            return Err(result.into());
        }
        state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("descriptor pool {pool:?}")))?
            .reset();
        state.stats.descriptor_pool_resets += 1;
        Ok(())
    }

    unsafe fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_descriptor_allocation.take() {
            return Err(result);
        }

        let needs = state
            .layouts
            .get(&layout)
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let pool_state = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;

        if pool_state.sets_allocated >= pool_state.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        for (ty, count) in &needs {
            if pool_state.remaining.get(ty).copied().unwrap_or(0) < *count {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
            }
        }
        for (ty, count) in &needs {
            if let Some(remaining) = pool_state.remaining.get_mut(ty) {
                *remaining -= count;
            }
        }
        pool_state.sets_allocated += 1;
        state.stats.descriptor_sets_allocated += 1;

        Ok(self.next())
    }

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state.lock();
        for write in writes {
            let buffer = if write.p_buffer_info.is_null() {
                None
            } else {
                Some((*write.p_buffer_info).buffer)
            };
            let image_view = if write.p_image_info.is_null() {
                None
            } else {
                Some((*write.p_image_info).image_view)
            };
            state.writes.push(RecordedWrite {
                set: write.dst_set,
                binding: write.dst_binding,
                descriptor_type: write.descriptor_type,
                count: write.descriptor_count,
                buffer,
                image_view,
            });
        }
        state.stats.descriptor_update_calls += 1;
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence = self.next();
        self.state.lock().fences.insert(fence, signaled);
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    unsafe fn wait_for_fences(&self, fences: &[vk::Fence], _timeout_ns: u64) -> Result<bool> {
        // Work never completes later than its submit, so an unsignaled fence
        // stays unsignaled for any timeout.
        let state = self.state.lock();
        for fence in fences {
            match state.fences.get(fence) {
                Some(true) => {}
                Some(false) => return Ok(false),
                None => return Err(GpuError::ResourceNotFound(format!("fence {fence:?}"))),
            }
        }
        Ok(true)
    }

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        let mut state = self.state.lock();
        for fence in fences {
            let signaled = state
                .fences
                .get_mut(fence)
                .ok_or_else(|| GpuError::ResourceNotFound(format!("fence {fence:?}")))?;
            *signaled = false;
        }
        Ok(())
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| GpuError::ResourceNotFound(format!("fence {fence:?}")))
    }

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore = self.next();
        self.state.lock().semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        let mut state = self.state.lock();
        state.stats.acquires += 1;
        if state.out_of_date_acquires > 0 {
            state.out_of_date_acquires -= 1;
            return Err(GpuError::SwapchainOutOfDate);
        }

        let chain = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("swapchain {swapchain:?}")))?;
        let index = chain.next_image;
        chain.next_image = (chain.next_image + 1) % chain.image_count;

        if semaphore != vk::Semaphore::null() {
            state.semaphores.insert(semaphore, true);
        }
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    unsafe fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        _image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.swapchains.contains_key(&swapchain) {
            return Err(GpuError::ResourceNotFound(format!("swapchain {swapchain:?}")));
        }
        for semaphore in wait_semaphores {
            if !state.semaphores.get(semaphore).copied().unwrap_or(false) {
                return Err(GpuError::InvalidState(format!(
                    "Present waits on unsignaled semaphore {semaphore:?}"
                )));
            }
            state.semaphores.insert(*semaphore, false);
        }
        state.stats.presents += 1;

        if state.out_of_date_presents > 0 {
            state.out_of_date_presents -= 1;
            return Err(GpuError::SwapchainOutOfDate);
        }
        Ok(state.suboptimal_present)
    }
}

fn execute(state: &mut State, command: &Command) {
    match command {
        Command::CopyBuffer { src, dst, regions } => {
            let (Some(&src_token), Some(&dst_token)) = (state.buffers.get(src), state.buffers.get(dst))
            else {
                return;
            };
            for region in regions {
                let len = region.size as usize;
                let from = region.src_offset as usize;
                let Some(data) = state
                    .memory
                    .get(&src_token)
                    .and_then(|m| m.bytes.get(from..from + len))
                    .map(<[u8]>::to_vec)
                else {
                    continue;
                };
                let to = region.dst_offset as usize;
                if let Some(target) = state
                    .memory
                    .get_mut(&dst_token)
                    .and_then(|m| m.bytes.get_mut(to..to + len))
                {
                    target.copy_from_slice(&data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_desc(persistent_map: bool) -> AllocationDesc<'static> {
        AllocationDesc {
            name: "test",
            location: MemoryLocation::CpuToGpu,
            persistent_map,
            dedicated: false,
        }
    }

    #[test]
    fn persistent_mapping_is_coherent() {
        let device = HeadlessDevice::new();
        let info = vk::BufferCreateInfo::default().size(64);
        let (_, allocation) = unsafe { device.create_buffer(&info, &upload_desc(true)) }.unwrap();
        assert!(allocation.mapped.is_some());
        assert!(allocation
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT));
    }

    #[test]
    fn device_local_memory_cannot_be_mapped() {
        let device = HeadlessDevice::new();
        let info = vk::BufferCreateInfo::default().size(64);
        let desc = AllocationDesc {
            location: MemoryLocation::GpuOnly,
            ..upload_desc(false)
        };
        let (_, allocation) = unsafe { device.create_buffer(&info, &desc) }.unwrap();
        assert!(unsafe { device.map_memory(allocation.token) }.is_err());
    }

    #[test]
    fn submit_signals_fence_and_semaphores() {
        let device = HeadlessDevice::new();
        unsafe {
            let fence = device.create_fence(false).unwrap();
            let semaphore = device.create_semaphore().unwrap();
            assert!(!device.wait_for_fences(&[fence], 0).unwrap());

            let signal = [semaphore];
            let batch = SubmitBatch {
                signal_semaphores: &signal,
                ..Default::default()
            };
            device
                .queue_submit(device.graphics_queue(), &batch, fence)
                .unwrap();
            assert!(device.wait_for_fences(&[fence], 0).unwrap());

            // Resubmitting with a signaled fence is rejected.
            assert!(device
                .queue_submit(device.graphics_queue(), &batch, fence)
                .is_err());
        }
    }

    #[test]
    fn descriptor_pool_enforces_max_sets() {
        let device = HeadlessDevice::new();
        unsafe {
            let binding = vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1);
            let layout = device.create_descriptor_set_layout(&[binding]).unwrap();
            let sizes = [vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 10,
            }];
            let pool = device.create_descriptor_pool(2, &sizes).unwrap();

            assert!(device.allocate_descriptor_set(pool, layout).is_ok());
            assert!(device.allocate_descriptor_set(pool, layout).is_ok());
            assert_eq!(
                device.allocate_descriptor_set(pool, layout),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
            );

            device.reset_descriptor_pool(pool).unwrap();
            assert!(device.allocate_descriptor_set(pool, layout).is_ok());
        }
    }
}
