//! Command buffer management.
//!
//! A [`CommandPool`] hands out [`CommandBuffer`]s and takes them back when
//! they are dropped: the native handle is reset (for
//! [`ResetStrategy::Individual`]) and pushed on the free list of its level,
//! and the next allocation of that level pops it before asking the device
//! for a new one. Explicitly freed buffers go back to the device instead.
//!
//! Every pool slot carries a generation that is bumped whenever its buffer
//! is returned, so a stale [`CommandBufferId`] can be detected.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::barrier::LayoutTransition;
use crate::buffer::Buffer;
use crate::device::{SharedDevice, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::image::{format_bytes_per_pixel, ImageResource};

/// How recycled command buffers are reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetStrategy {
    /// Each buffer is reset when it returns to the pool.
    #[default]
    Individual,
    /// Buffers are reset together by [`CommandPool::reset`].
    Pool,
}

/// Index of a command buffer in its pool plus the generation it was handed
/// out at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferId {
    slot: u32,
    generation: u32,
}

struct Slot {
    handle: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    generation: u32,
    borrowed: bool,
}

#[derive(Default)]
struct PoolInner {
    slots: Vec<Slot>,
    primary_free: Vec<u32>,
    secondary_free: Vec<u32>,
    vacant: Vec<u32>,
}

impl PoolInner {
    fn free_list(&mut self, level: vk::CommandBufferLevel) -> &mut Vec<u32> {
        if level == vk::CommandBufferLevel::PRIMARY {
            &mut self.primary_free
        } else {
            &mut self.secondary_free
        }
    }

    fn insert(&mut self, handle: vk::CommandBuffer, level: vk::CommandBufferLevel) -> CommandBufferId {
        let slot = Slot {
            handle,
            level,
            generation: 0,
            borrowed: true,
        };
        let index = if let Some(index) = self.vacant.pop() {
            let generation = self.slots[index as usize].generation;
            self.slots[index as usize] = Slot { generation, ..slot };
            index
        } else {
            self.slots.push(slot);
            (self.slots.len() - 1) as u32
        };
        CommandBufferId {
            slot: index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn retire(&mut self, id: CommandBufferId) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation || !slot.borrowed {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.borrowed = false;
        Some(slot)
    }
}

struct PoolShared {
    device: SharedDevice,
    handle: vk::CommandPool,
    queue: vk::Queue,
    strategy: ResetStrategy,
    inner: Mutex<PoolInner>,
}

impl PoolShared {
    fn recycle(&self, id: CommandBufferId) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.retire(id) else {
            tracing::warn!("Recycling stale command buffer {:?}", id);
            return;
        };
        let (handle, level) = (slot.handle, slot.level);

        if self.strategy == ResetStrategy::Individual {
            // SAFETY: the buffer is no longer borrowed and belongs to this pool.
            if let Err(e) = unsafe { self.device.reset_command_buffer(handle) } {
                tracing::error!("Failed to reset command buffer, freeing it: {e}");
                // SAFETY: allocated from this pool and no longer referenced by any slot.
                unsafe { self.device.free_command_buffers(self.handle, &[handle]) };
                inner.slots[id.slot as usize].handle = vk::CommandBuffer::null();
                inner.vacant.push(id.slot);
                return;
            }
        }

        tracing::trace!("Recycled {:?} command buffer {:?}", level, handle);
        inner.free_list(level).push(id.slot);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        // SAFETY: no command buffer of this pool is alive once the last
        // reference is gone.
        unsafe {
            // Some drivers only reclaim buffer memory on reset.
            if let Err(e) = self.device.reset_command_pool(self.handle) {
                tracing::warn!("Failed to reset command pool before destruction: {e}");
            }
            self.device.destroy_command_pool(self.handle);
        }
    }
}

/// Recycling pool of command buffers bound to one queue.
///
/// Pools are not meant for concurrent recording; give each recording thread
/// its own pool.
#[derive(Clone)]
pub struct CommandPool {
    shared: Arc<PoolShared>,
}

impl CommandPool {
    /// Create a pool for `queue`. The `RESET_COMMAND_BUFFER` flag is added for
    /// [`ResetStrategy::Individual`].
    pub fn new(
        device: SharedDevice,
        queue: vk::Queue,
        queue_family_index: u32,
        strategy: ResetStrategy,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let flags = match strategy {
            ResetStrategy::Individual => flags | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ResetStrategy::Pool => flags,
        };
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);

        // SAFETY: valid create info for this device.
        let handle = unsafe { device.create_command_pool(&create_info)? };
        tracing::debug!("Created command pool {:?} ({:?})", handle, strategy);

        Ok(Self {
            shared: Arc::new(PoolShared {
                device,
                handle,
                queue,
                strategy,
                inner: Mutex::new(PoolInner::default()),
            }),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.shared.handle
    }

    /// Queue that buffers of this pool are submitted to.
    pub fn queue(&self) -> vk::Queue {
        self.shared.queue
    }

    pub fn reset_strategy(&self) -> ResetStrategy {
        self.shared.strategy
    }

    /// Number of recycled buffers waiting on the free list of `level`.
    pub fn recycled_count(&self, level: vk::CommandBufferLevel) -> usize {
        self.shared.inner.lock().free_list(level).len()
    }

    /// Whether `id` still names a borrowed buffer.
    pub fn is_current(&self, id: CommandBufferId) -> bool {
        self.shared
            .inner
            .lock()
            .slots
            .get(id.slot as usize)
            .is_some_and(|s| s.generation == id.generation && s.borrowed)
    }

    /// Borrow one command buffer, reusing a recycled one when available.
    pub fn allocate_command_buffer(&self, level: vk::CommandBufferLevel) -> Result<CommandBuffer> {
        let mut buffers = self.allocate_command_buffers(1, level)?;
        buffers
            .pop()
            .ok_or_else(|| GpuError::Other("Device returned no command buffer".to_string()))
    }

    /// Borrow `count` command buffers. The free list is drained first and
    /// the rest is allocated from the device in one call.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate_command_buffers(
        &self,
        count: u32,
        level: vk::CommandBufferLevel,
    ) -> Result<Vec<CommandBuffer>> {
        let mut buffers = Vec::with_capacity(count as usize);
        let mut inner = self.shared.inner.lock();

        while buffers.len() < count as usize {
            let Some(index) = inner.free_list(level).pop() else {
                break;
            };
            let slot = &mut inner.slots[index as usize];
            slot.borrowed = true;
            buffers.push(self.wrap(
                CommandBufferId {
                    slot: index,
                    generation: slot.generation,
                },
                slot.handle,
                level,
            ));
        }

        let remaining = count - buffers.len() as u32;
        if remaining == 0 {
            return Ok(buffers);
        }

        // SAFETY: the pool is externally synchronized through `inner`.
        let handles = unsafe {
            self.shared
                .device
                .allocate_command_buffers(self.shared.handle, level, remaining)?
        };
        tracing::trace!("Allocated {} new {:?} command buffers", handles.len(), level);

        for handle in handles {
            let id = inner.insert(handle, level);
            buffers.push(self.wrap(id, handle, level));
        }
        Ok(buffers)
    }

    fn wrap(&self, id: CommandBufferId, handle: vk::CommandBuffer, level: vk::CommandBufferLevel) -> CommandBuffer {
        CommandBuffer {
            pool: self.shared.clone(),
            id,
            handle,
            level,
        }
    }

    /// Return a buffer to the device instead of recycling it.
    pub fn free_command_buffer(&self, command_buffer: CommandBuffer) {
        self.free_command_buffers(vec![command_buffer]);
    }

    /// Return buffers to the device in one call.
    pub fn free_command_buffers(&self, command_buffers: Vec<CommandBuffer>) {
        let mut handles = Vec::with_capacity(command_buffers.len());
        let mut inner = self.shared.inner.lock();

        for mut cmd in command_buffers {
            debug_assert!(
                Arc::ptr_eq(&cmd.pool, &self.shared),
                "command buffer freed through a foreign pool"
            );
            if inner.retire(cmd.id).is_some() {
                inner.slots[cmd.id.slot as usize].handle = vk::CommandBuffer::null();
                inner.vacant.push(cmd.id.slot);
                handles.push(cmd.handle);
            }
            // Dropping `cmd` is now a no-op.
            cmd.handle = vk::CommandBuffer::null();
        }

        if !handles.is_empty() {
            // SAFETY: none of the handles is borrowed any more.
            unsafe {
                self.shared
                    .device
                    .free_command_buffers(self.shared.handle, &handles);
            }
        }
    }

    /// Reset every buffer allocated from this pool.
    ///
    /// No buffer of this pool may be pending execution.
    pub fn reset(&self) -> Result<()> {
        let _inner = self.shared.inner.lock();
        // SAFETY: externally synchronized through `inner`.
        unsafe { self.shared.device.reset_command_pool(self.shared.handle) }
    }
}

/// A borrowed command buffer. Dropping it returns it to its pool.
pub struct CommandBuffer {
    pool: Arc<PoolShared>,
    id: CommandBufferId,
    handle: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
}

impl CommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn id(&self) -> CommandBufferId {
        self.id
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    fn device(&self) -> &SharedDevice {
        &self.pool.device
    }

    /// Begin recording.
    pub fn begin(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        // SAFETY: the buffer is uniquely borrowed.
        unsafe { self.device().begin_command_buffer(self.handle, flags) }
    }

    /// End recording.
    pub fn end(&self) -> Result<()> {
        // SAFETY: the buffer is uniquely borrowed.
        unsafe { self.device().end_command_buffer(self.handle) }
    }

    /// Reset the buffer if the pool resets buffers individually.
    pub fn reset(&self) -> Result<()> {
        match self.pool.strategy {
            // SAFETY: the buffer is uniquely borrowed and not pending.
            ResetStrategy::Individual => unsafe { self.device().reset_command_buffer(self.handle) },
            ResetStrategy::Pool => Ok(()),
        }
    }

    /// Submit this buffer alone to the pool's queue.
    ///
    /// Any command buffers listed in `batch` are replaced by this one.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush(&self, batch: SubmitBatch<'_>, fence: vk::Fence) -> Result<()> {
        let handles = [self.handle];
        let batch = SubmitBatch {
            command_buffers: &handles,
            ..batch
        };
        // SAFETY: recording has ended and the queue belongs to the pool's family.
        unsafe { self.device().queue_submit(self.pool.queue, &batch, fence) }
    }

    /// Copy the first `size` bytes of `src` into `dst`.
    pub fn copy_buffer(&self, src: &Buffer, dst: &Buffer, size: vk::DeviceSize) {
        self.copy_buffer_region(
            src,
            dst,
            vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            },
        );
    }

    pub fn copy_buffer_region(&self, src: &Buffer, dst: &Buffer, region: vk::BufferCopy) {
        debug_assert!(region.src_offset + region.size <= src.size());
        debug_assert!(region.dst_offset + region.size <= dst.size());
        // SAFETY: both buffers are alive for the duration of the call; the
        // caller keeps them alive until the submission completes.
        unsafe {
            self.device()
                .cmd_copy_buffer(self.handle, src.handle(), dst.handle(), &[region]);
        }
    }

    /// Copy tightly packed texel data from `staging` into every level and
    /// layer of `resource`'s view. The image must be in
    /// `TRANSFER_DST_OPTIMAL`.
    pub fn update_image(&self, resource: &ImageResource, staging: &Buffer) -> Result<()> {
        let image = resource.image();
        let texel = format_bytes_per_pixel(image.format()).ok_or_else(|| {
            GpuError::Unsupported(format!("No texel size known for {:?}", image.format()))
        })?;
        let regions = full_copy_regions(
            &resource.view().desc().subresource_range,
            image.extent(),
            texel,
        );
        let required = staging_bytes_required(&regions, texel);
        if required > staging.size() {
            return Err(GpuError::InvalidState(format!(
                "Staging buffer holds {} bytes, image copy reads {}",
                staging.size(),
                required
            )));
        }

        // SAFETY: every region lies inside `staging`; see `copy_buffer_region`.
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                self.handle,
                staging.handle(),
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
        }
        Ok(())
    }

    /// Record a layout transition over the resource view's subresource range.
    pub fn set_image_layout(&self, resource: &ImageResource, transition: LayoutTransition) {
        self.set_image_layout_range(
            resource.image().handle(),
            resource.view().desc().subresource_range,
            transition,
        );
    }

    /// Record a layout transition over an explicit range.
    pub fn set_image_layout_range(
        &self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        transition: LayoutTransition,
    ) {
        let barrier = transition.image_barrier(image, range);
        // SAFETY: recording on a uniquely borrowed buffer.
        unsafe {
            self.device().cmd_pipeline_barrier(
                self.handle,
                transition.src_stage,
                transition.dst_stage,
                std::slice::from_ref(&barrier),
            );
        }
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.handle == vk::CommandBuffer::null() {
            return;
        }
        self.pool.recycle(self.id);
        self.handle = vk::CommandBuffer::null();
    }
}

/// One copy region per (layer, level) of `range`, tightly packed in layer
/// major order. Level `m` has the base width and height shifted right by `m`.
pub fn full_copy_regions(
    range: &vk::ImageSubresourceRange,
    base_extent: vk::Extent3D,
    bytes_per_pixel: vk::DeviceSize,
) -> Vec<vk::BufferImageCopy> {
    let mut regions = Vec::with_capacity((range.layer_count * range.level_count) as usize);
    let mut offset: vk::DeviceSize = 0;

    for layer in 0..range.layer_count {
        for level in 0..range.level_count {
            let extent = vk::Extent3D {
                width: (base_extent.width >> level).max(1),
                height: (base_extent.height >> level).max(1),
                depth: 1,
            };
            regions.push(vk::BufferImageCopy {
                buffer_offset: offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: range.aspect_mask,
                    mip_level: range.base_mip_level + level,
                    base_array_layer: range.base_array_layer + layer,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: extent,
            });
            offset += u64::from(extent.width) * u64::from(extent.height) * bytes_per_pixel;
        }
    }
    regions
}

/// Bytes of the source buffer read by `regions`.
pub fn staging_bytes_required(
    regions: &[vk::BufferImageCopy],
    bytes_per_pixel: vk::DeviceSize,
) -> vk::DeviceSize {
    regions
        .iter()
        .map(|r| {
            let e = r.image_extent;
            r.buffer_offset
                + u64::from(e.width) * u64::from(e.height) * u64::from(e.depth) * bytes_per_pixel
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use crate::memory::DeviceMemoryAllocator;

    fn pool(strategy: ResetStrategy) -> (Arc<HeadlessDevice>, CommandPool) {
        let device = Arc::new(HeadlessDevice::new());
        let pool = CommandPool::new(
            device.clone(),
            device.graphics_queue(),
            0,
            strategy,
            vk::CommandPoolCreateFlags::empty(),
        )
        .unwrap();
        (device, pool)
    }

    #[test]
    fn released_buffer_is_reused_before_allocating() {
        let (device, pool) = pool(ResetStrategy::Individual);

        let first = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        let handle = first.handle();
        drop(first);

        assert_eq!(pool.recycled_count(vk::CommandBufferLevel::PRIMARY), 1);
        assert_eq!(device.stats().command_buffer_resets, 1);

        let second = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        assert_eq!(second.handle(), handle);
        assert_eq!(device.stats().command_buffers_allocated, 1);
        assert_eq!(pool.recycled_count(vk::CommandBufferLevel::PRIMARY), 0);
    }

    #[test]
    fn free_lists_are_split_by_level() {
        let (device, pool) = pool(ResetStrategy::Individual);

        let secondary = pool
            .allocate_command_buffer(vk::CommandBufferLevel::SECONDARY)
            .unwrap();
        let secondary_handle = secondary.handle();
        drop(secondary);

        let primary = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        assert_ne!(primary.handle(), secondary_handle);
        assert_eq!(device.stats().command_buffers_allocated, 2);
        assert_eq!(pool.recycled_count(vk::CommandBufferLevel::SECONDARY), 1);

        let secondary = pool
            .allocate_command_buffer(vk::CommandBufferLevel::SECONDARY)
            .unwrap();
        assert_eq!(secondary.handle(), secondary_handle);
    }

    #[test]
    fn batch_allocation_drains_free_list_first() {
        let (device, pool) = pool(ResetStrategy::Individual);

        let buffers = pool
            .allocate_command_buffers(2, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        drop(buffers);
        assert_eq!(device.stats().command_buffers_allocated, 2);

        let buffers = pool
            .allocate_command_buffers(5, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        assert_eq!(buffers.len(), 5);
        assert_eq!(device.stats().command_buffers_allocated, 5);
    }

    #[test]
    fn freed_buffer_goes_back_to_device() {
        let (device, pool) = pool(ResetStrategy::Individual);

        let cmd = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        let id = cmd.id();
        pool.free_command_buffer(cmd);

        assert!(!pool.is_current(id));
        assert_eq!(pool.recycled_count(vk::CommandBufferLevel::PRIMARY), 0);
        assert_eq!(device.stats().command_buffers_freed, 1);
        assert_eq!(device.command_buffers_in_pool(pool.handle()), 0);
    }

    #[test]
    fn stale_id_is_detected_after_recycle() {
        let (_device, pool) = pool(ResetStrategy::Individual);

        let cmd = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        let stale = cmd.id();
        assert!(pool.is_current(stale));
        drop(cmd);
        assert!(!pool.is_current(stale));

        let cmd = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        assert_ne!(cmd.id(), stale);
        assert!(pool.is_current(cmd.id()));
        assert!(!pool.is_current(stale));
    }

    #[test]
    fn pool_strategy_skips_individual_reset() {
        let (device, pool) = pool(ResetStrategy::Pool);

        let cmd = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        cmd.end().unwrap();
        cmd.reset().unwrap();
        drop(cmd);
        assert_eq!(device.stats().command_buffer_resets, 0);

        pool.reset().unwrap();
        assert_eq!(device.stats().command_pool_resets, 1);
    }

    #[test]
    fn flush_executes_recorded_copy() {
        let (device, pool) = pool(ResetStrategy::Individual);
        let allocator = DeviceMemoryAllocator::new(device.clone(), "test");
        let staging = allocator.allocate_staging_buffer(16).unwrap();
        let vertices = allocator.allocate_vertex_buffer(16).unwrap();
        staging.update(&[3; 16], 0).unwrap();

        let cmd = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        cmd.copy_buffer(&staging, &vertices, 16);
        cmd.end().unwrap();
        cmd.flush(SubmitBatch::default(), vk::Fence::null()).unwrap();

        assert_eq!(device.buffer_contents(vertices.handle()).unwrap(), vec![3; 16]);
    }

    #[test]
    fn copy_regions_cover_layers_and_levels() {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 3,
            base_array_layer: 0,
            layer_count: 2,
        };
        let extent = vk::Extent3D {
            width: 8,
            height: 4,
            depth: 1,
        };
        let regions = full_copy_regions(&range, extent, 4);

        assert_eq!(regions.len(), 6);
        assert_eq!(regions[1].image_extent.width, 4);
        assert_eq!(regions[1].image_extent.height, 2);
        assert_eq!(regions[1].buffer_offset, 8 * 4 * 4);
        // 8x4 + 4x2 + 2x1 texels per layer.
        assert_eq!(regions[3].buffer_offset, (32 + 8 + 2) * 4);
        assert_eq!(regions[3].image_subresource.base_array_layer, 1);
        assert_eq!(regions[3].image_subresource.mip_level, 0);
    }

    #[test]
    fn layout_transitions_reach_the_device() {
        let (device, pool) = pool(ResetStrategy::Individual);
        let allocator = DeviceMemoryAllocator::new(device.clone(), "test");
        let meta = crate::image::ImageMeta::two_dim(4, 4, vk::Format::R8G8B8A8_SRGB, 1);
        let texture = ImageResource::create_empty_two_dim(&allocator, &meta).unwrap();
        let staging = allocator.allocate_staging_buffer(64).unwrap();

        let cmd = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        cmd.set_image_layout(
            &texture,
            LayoutTransition::new(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )
            .with_stages(
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::TRANSFER,
            ),
        );
        cmd.update_image(&texture, &staging).unwrap();
        cmd.set_image_layout(
            &texture,
            LayoutTransition::new(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        );
        cmd.end().unwrap();

        let barriers = device.barriers();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].src_access, vk::AccessFlags::empty());
        assert_eq!(barriers[0].dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barriers[0].src_stage, vk::PipelineStageFlags::HOST);
        assert_eq!(barriers[1].src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barriers[1].dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(barriers[1].image, texture.image().handle());

        let copies = device.image_copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].regions.len(), 1);
        assert_eq!(copies[0].layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn short_staging_buffer_is_rejected() {
        let (device, pool) = pool(ResetStrategy::Individual);
        let allocator = DeviceMemoryAllocator::new(device.clone(), "test");
        let meta = crate::image::ImageMeta::two_dim(4, 4, vk::Format::R8G8B8A8_UNORM, 3);
        let texture = ImageResource::create_empty_two_dim(&allocator, &meta).unwrap();
        // 4x4 + 2x2 + 1x1 texels.
        let staging = allocator.allocate_staging_buffer(4).unwrap();

        let cmd = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        assert!(matches!(
            cmd.update_image(&texture, &staging),
            Err(GpuError::InvalidState(_))
        ));
        assert!(device.image_copies().is_empty());

        let exact = allocator.allocate_staging_buffer(84).unwrap();
        cmd.update_image(&texture, &exact).unwrap();
        assert_eq!(device.image_copies().len(), 1);
    }

    #[test]
    fn staging_size_covers_last_region() {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 3,
            base_array_layer: 0,
            layer_count: 6,
        };
        let extent = vk::Extent3D {
            width: 4,
            height: 4,
            depth: 1,
        };
        let regions = full_copy_regions(&range, extent, 4);
        assert_eq!(staging_bytes_required(&regions, 4), 6 * 84);
        assert_eq!(staging_bytes_required(&[], 4), 0);
    }
}
