//! GPU context management.

use ash::vk;

use crate::barrier::LayoutTransition;
use crate::buffer::Buffer;
use crate::command::{
    full_copy_regions, staging_bytes_required, CommandBuffer, CommandPool, ResetStrategy,
};
use crate::config::GpuConfig;
use crate::descriptors::{DescriptorAllocator, DescriptorLayoutCache};
use crate::device::{SharedDevice, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::image::{format_bytes_per_pixel, ImageResource};
use crate::memory::{BufferDesc, DeviceMemoryAllocator, MemoryUsage};

/// Device, queue and the shared allocators built on them.
pub struct GpuContext {
    device: SharedDevice,
    config: GpuConfig,
    graphics_queue: vk::Queue,
    graphics_queue_family: u32,
    memory: DeviceMemoryAllocator,
    transient_pool: CommandPool,
    layout_cache: DescriptorLayoutCache,
}

impl GpuContext {
    /// Get the device.
    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Buffer and image allocator.
    pub fn memory(&self) -> &DeviceMemoryAllocator {
        &self.memory
    }

    /// Layout cache shared by every descriptor builder of this context.
    pub fn layout_cache(&self) -> &DescriptorLayoutCache {
        &self.layout_cache
    }

    /// New descriptor allocator using the configured pool sizes.
    pub fn create_descriptor_allocator(&self) -> DescriptorAllocator {
        DescriptorAllocator::with_pool_config(
            self.device.clone(),
            self.config.descriptor_pool_size,
            self.config.descriptor_size_factors.clone(),
        )
    }

    /// New command pool on the graphics queue.
    pub fn create_command_pool(&self, strategy: ResetStrategy) -> Result<CommandPool> {
        CommandPool::new(
            self.device.clone(),
            self.graphics_queue,
            self.graphics_queue_family,
            strategy,
            vk::CommandPoolCreateFlags::empty(),
        )
    }

    /// Borrow a primary buffer from the transient pool and begin it for a
    /// single submission.
    pub fn begin_one_time_commands(&self) -> Result<CommandBuffer> {
        let cmd = self
            .transient_pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        Ok(cmd)
    }

    /// End, submit and wait for `cmd`, then free it.
    ///
    /// Blocks until the queue is idle. Meant for setup and streaming, not the
    /// steady-state frame loop.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_one_time_commands(&self, cmd: CommandBuffer) -> Result<()> {
        cmd.end()?;
        cmd.flush(SubmitBatch::default(), vk::Fence::null())?;
        // SAFETY: the queue is only used from the recording thread.
        unsafe { self.device.queue_wait_idle(self.graphics_queue)? };
        self.transient_pool.free_command_buffer(cmd);
        Ok(())
    }

    /// Record with `f` and execute synchronously.
    pub fn execute_one_time<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&CommandBuffer) -> Result<()>,
    {
        let cmd = self.begin_one_time_commands()?;
        f(&cmd)?;
        self.end_one_time_commands(cmd)
    }

    /// Create a device-local buffer holding `data`, filled through a
    /// staging copy.
    pub fn create_buffer_with_data(&self, data: &[u8], usage: MemoryUsage) -> Result<Buffer> {
        if usage.persistently_mapped() {
            let buffer = self
                .memory
                .allocate_buffer(&BufferDesc::new(data.len() as vk::DeviceSize, usage))?;
            buffer.update(data, 0)?;
            return Ok(buffer);
        }

        let size = data.len() as vk::DeviceSize;
        let staging = self.memory.allocate_staging_buffer(size)?;
        staging.update(data, 0)?;

        let buffer = self.memory.allocate_buffer(
            &BufferDesc::new(size, usage).with_extra_usage(vk::BufferUsageFlags::TRANSFER_DST),
        )?;
        self.execute_one_time(|cmd| {
            cmd.copy_buffer(&staging, &buffer, size);
            Ok(())
        })?;
        Ok(buffer)
    }

    /// Upload tightly packed texels into every level and layer of `resource`
    /// and leave it in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn upload_image(&self, resource: &ImageResource, texels: &[u8]) -> Result<()> {
        if texels.is_empty() {
            return Err(GpuError::InvalidState("No texel data to upload".to_string()));
        }
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
        if (texels.len() as vk::DeviceSize) < required {
            return Err(GpuError::InvalidState(format!(
                "Image needs {} bytes of texel data, got {}",
                required,
                texels.len()
            )));
        }
        let staging = self
            .memory
            .allocate_staging_buffer(texels.len() as vk::DeviceSize)?;
        staging.update(texels, 0)?;

        self.execute_one_time(|cmd| {
            cmd.set_image_layout(
                resource,
                LayoutTransition::new(
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )
                .with_stages(
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::TRANSFER,
                ),
            );
            cmd.update_image(resource, &staging)?;
            cmd.set_image_layout(
                resource,
                LayoutTransition::new(
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
                .with_stages(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                ),
            );
            Ok(())
        })
    }

    /// Wait for device to be idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: no other thread submits while the context is alive.
        unsafe { self.device.device_wait_idle() }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        // Pools and caches are destroyed right after; nothing may be pending.
        if let Err(e) = self.wait_idle() {
            tracing::error!("Failed to idle device during shutdown: {e}");
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    device: SharedDevice,
    config: GpuConfig,
    graphics_queue: vk::Queue,
    graphics_queue_family: u32,
}

impl GpuContextBuilder {
    /// Start from a device created by the caller.
    pub fn new(device: SharedDevice) -> Self {
        Self {
            device,
            config: GpuConfig::default(),
            graphics_queue: vk::Queue::null(),
            graphics_queue_family: 0,
        }
    }

    pub fn config(mut self, config: GpuConfig) -> Self {
        self.config = config;
        self
    }

    /// Queue used for frame and one-time submissions.
    pub fn graphics_queue(mut self, queue: vk::Queue, family_index: u32) -> Self {
        self.graphics_queue = queue;
        self.graphics_queue_family = family_index;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        if self.graphics_queue == vk::Queue::null() {
            return Err(GpuError::InvalidState(
                "No graphics queue configured".to_string(),
            ));
        }

        let memory = DeviceMemoryAllocator::new(self.device.clone(), self.config.app_name.clone());
        let transient_pool = CommandPool::new(
            self.device.clone(),
            self.graphics_queue,
            self.graphics_queue_family,
            ResetStrategy::Individual,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let layout_cache = DescriptorLayoutCache::new(self.device.clone());

        tracing::info!(
            "GPU context ready: {} frames in flight, {} descriptor sets per pool",
            self.config.frames_in_flight,
            self.config.descriptor_pool_size
        );

        Ok(GpuContext {
            device: self.device,
            config: self.config,
            graphics_queue: self.graphics_queue,
            graphics_queue_family: self.graphics_queue_family,
            memory,
            transient_pool,
            layout_cache,
        })
    }
}

/// Context on a fresh [`HeadlessDevice`](crate::headless::HeadlessDevice).
#[cfg(any(test, feature = "headless"))]
pub fn headless_context(
    config: GpuConfig,
) -> Result<(std::sync::Arc<crate::headless::HeadlessDevice>, GpuContext)> {
    let device = std::sync::Arc::new(crate::headless::HeadlessDevice::new());
    let queue = device.graphics_queue();
    let context = GpuContextBuilder::new(device.clone())
        .config(config)
        .graphics_queue(queue, 0)
        .build()?;
    Ok((device, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use std::sync::Arc;

    #[test]
    fn build_requires_a_queue() {
        let device: SharedDevice = Arc::new(HeadlessDevice::new());
        assert!(GpuContextBuilder::new(device).build().is_err());
    }

    #[test]
    fn one_time_commands_are_freed_after_idle_wait() {
        let (device, ctx) = headless_context(GpuConfig::default()).unwrap();

        let cmd = ctx.begin_one_time_commands().unwrap();
        ctx.end_one_time_commands(cmd).unwrap();

        let stats = device.stats();
        assert_eq!(stats.submits, 1);
        assert_eq!(stats.queue_idle_waits, 1);
        assert_eq!(stats.command_buffers_freed, 1);
    }

    #[test]
    fn vertex_data_goes_through_staging() {
        let (device, ctx) = headless_context(GpuConfig::default()).unwrap();
        let data: Vec<u8> = (0..64).collect();

        let vertices = ctx.create_buffer_with_data(&data, MemoryUsage::Vertex).unwrap();

        assert!(!vertices.is_persistently_mapped());
        assert_eq!(device.buffer_contents(vertices.handle()).unwrap(), data);
        // The staging buffer is gone once the upload returns.
        assert_eq!(device.stats().buffers_alive, 1);
    }

    #[test]
    fn image_upload_transitions_to_shader_read() {
        let (device, ctx) = headless_context(GpuConfig::default()).unwrap();
        let meta = crate::image::ImageMeta::two_dim(4, 4, vk::Format::R8G8B8A8_SRGB, 1);
        let texture = ImageResource::create_empty_two_dim(ctx.memory(), &meta).unwrap();

        ctx.upload_image(&texture, &[255; 64]).unwrap();

        let barriers = device.barriers();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barriers[0].src_access, vk::AccessFlags::empty());
        assert_eq!(barriers[0].dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barriers[1].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barriers[1].src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barriers[1].dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn short_texel_data_is_rejected_before_recording() {
        let (device, ctx) = headless_context(GpuConfig::default()).unwrap();
        let meta = crate::image::ImageMeta::two_dim(4, 4, vk::Format::R8G8B8A8_UNORM, 3);
        let texture = ImageResource::create_empty_two_dim(ctx.memory(), &meta).unwrap();

        let err = ctx.upload_image(&texture, &[0; 4]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(device.image_copies().is_empty());
        assert!(device.barriers().is_empty());
        assert_eq!(device.stats().submits, 0);

        ctx.upload_image(&texture, &[0; 84]).unwrap();
        assert_eq!(device.image_copies()[0].regions.len(), 3);
    }
}
