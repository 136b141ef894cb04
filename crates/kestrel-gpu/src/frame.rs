//! Frames in flight.
//!
//! [`FrameRing`] owns one [`FrameResource`] per frame in flight and drives
//! the per-frame sequence:
//!
//! 1. wait on the slot's fence (the previous use of the slot has finished),
//! 2. recycle what that use left behind (transient descriptor pools,
//!    deferred deletions),
//! 3. acquire a presentable image, rebuilding the target if it went stale,
//! 4. reset the fence and start recording,
//! 5. submit, signalling `render_finished` and the fence,
//! 6. present, waiting on `render_finished`.

use ash::vk;

use crate::buffer::Buffer;
use crate::command::{CommandBuffer, CommandPool, ResetStrategy};
use crate::context::GpuContext;
use crate::deferred::{DeferredDeletionQueue, DeferredResource};
use crate::descriptors::{DescriptorAllocation, DescriptorAllocator, DescriptorLayoutCache};
use crate::device::{AcquiredImage, SharedDevice, SubmitBatch};
use crate::error::{ErrorSeverity, GpuError, Result};
use crate::memory::DeviceMemoryAllocator;
use crate::sync::{Fence, FenceStatus, Semaphore};

/// Rebuild attempts per acquire before giving up.
const MAX_REBUILD_ATTEMPTS: u32 = 8;

/// Presentation surface consumed by the ring.
pub trait PresentTarget {
    /// Current swapchain handle.
    fn swapchain(&self) -> vk::SwapchainKHR;

    /// Number of presentable images.
    fn image_count(&self) -> u32;

    /// Recreate the swapchain and everything that depends on it. Called with
    /// the device idle.
    fn rebuild(&mut self) -> Result<()>;

    /// Consume a pending resize request from the window layer.
    fn take_resize_request(&mut self) -> bool {
        false
    }
}

/// Swapchain of a [`HeadlessDevice`](crate::headless::HeadlessDevice).
#[cfg(any(test, feature = "headless"))]
pub struct HeadlessTarget {
    device: std::sync::Arc<crate::headless::HeadlessDevice>,
    swapchain: vk::SwapchainKHR,
    image_count: u32,
    rebuilds: usize,
    resize_requested: bool,
}

#[cfg(any(test, feature = "headless"))]
impl HeadlessTarget {
    pub fn new(device: std::sync::Arc<crate::headless::HeadlessDevice>, image_count: u32) -> Self {
        let swapchain = device.create_swapchain(image_count);
        Self {
            device,
            swapchain,
            image_count,
            rebuilds: 0,
            resize_requested: false,
        }
    }

    /// Simulate a window resize.
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }
}

#[cfg(any(test, feature = "headless"))]
impl PresentTarget for HeadlessTarget {
    fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    fn image_count(&self) -> u32 {
        self.image_count
    }

    fn rebuild(&mut self) -> Result<()> {
        self.device.destroy_swapchain(self.swapchain);
        self.swapchain = self.device.create_swapchain(self.image_count);
        self.rebuilds += 1;
        Ok(())
    }

    fn take_resize_request(&mut self) -> bool {
        std::mem::take(&mut self.resize_requested)
    }
}

#[cfg(any(test, feature = "headless"))]
impl Drop for HeadlessTarget {
    fn drop(&mut self) {
        self.device.destroy_swapchain(self.swapchain);
    }
}

/// What the per-slot init closure gets to work with.
pub struct FrameSetup<'a> {
    pub slot: usize,
    pub memory: &'a DeviceMemoryAllocator,
    pub layout_cache: &'a DescriptorLayoutCache,
    /// Long-lived sets; never reset by the ring.
    pub descriptors: &'a mut DescriptorAllocator,
}

/// Per-slot resources produced by the init closure.
#[derive(Default)]
pub struct FrameBindings {
    pub uniform_buffers: Vec<Buffer>,
    pub descriptor_sets: Vec<DescriptorAllocation>,
}

/// Everything one frame in flight owns.
pub struct FrameResource {
    pub command_buffer: CommandBuffer,
    pub image_acquired: Semaphore,
    pub render_finished: Semaphore,
    pub in_flight: Fence,
    pub uniform_buffers: Vec<Buffer>,
    pub descriptor_sets: Vec<DescriptorAllocation>,
    /// Sets valid for one use of this slot. Reset once the slot's fence
    /// has signaled.
    pub transient_descriptors: DescriptorAllocator,
    pool: CommandPool,
}

impl FrameResource {
    fn new(ctx: &GpuContext, bindings: FrameBindings) -> Result<Self> {
        let device = ctx.device();
        let pool = ctx.create_command_pool(ctx.config().command_reset_strategy)?;
        let command_buffer = pool.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;

        Ok(Self {
            command_buffer,
            image_acquired: Semaphore::new(device.clone())?,
            render_finished: Semaphore::new(device.clone())?,
            // Signaled so the first wait on this slot returns at once.
            in_flight: Fence::new(device.clone(), true)?,
            uniform_buffers: bindings.uniform_buffers,
            descriptor_sets: bindings.descriptor_sets,
            transient_descriptors: ctx.create_descriptor_allocator(),
            pool,
        })
    }

    fn reset_commands(&self) -> Result<()> {
        match self.pool.reset_strategy() {
            ResetStrategy::Individual => self.command_buffer.reset(),
            ResetStrategy::Pool => self.pool.reset(),
        }
    }
}

/// Identifies the frame being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameToken {
    pub slot: usize,
    pub image_index: u32,
    pub frame_number: u64,
    suboptimal: bool,
}

/// Counters kept by the ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_submitted: u64,
    pub frames_presented: u64,
    pub target_rebuilds: u64,
    pub fence_spins: u64,
}

/// Ring of frame resources indexed by a wrapping frame counter.
pub struct FrameRing {
    device: SharedDevice,
    queue: vk::Queue,
    fence_timeout_ns: u64,
    frames: Vec<FrameResource>,
    frame_index: usize,
    frame_number: u64,
    deferred: DeferredDeletionQueue,
    stats: FrameStats,
    // Backs `FrameResource::descriptor_sets`; dropped after the frames.
    static_descriptors: DescriptorAllocator,
}

impl FrameRing {
    /// Build one frame resource per frame in flight. `init` runs once per
    /// slot to create that slot's uniform buffers and descriptor sets.
    pub fn new<F>(ctx: &GpuContext, mut init: F) -> Result<Self>
    where
        F: FnMut(FrameSetup<'_>) -> Result<FrameBindings>,
    {
        let config = ctx.config();
        let mut static_descriptors = ctx.create_descriptor_allocator();
        let mut frames = Vec::with_capacity(config.frames_in_flight);

        for slot in 0..config.frames_in_flight {
            let bindings = init(FrameSetup {
                slot,
                memory: ctx.memory(),
                layout_cache: ctx.layout_cache(),
                descriptors: &mut static_descriptors,
            })?;
            frames.push(FrameResource::new(ctx, bindings)?);
        }
        tracing::debug!("Created frame ring with {} slots", frames.len());

        Ok(Self {
            device: ctx.device().clone(),
            queue: ctx.graphics_queue(),
            fence_timeout_ns: config.fence_timeout_ns,
            frames,
            frame_index: 0,
            frame_number: 0,
            deferred: DeferredDeletionQueue::new(config.frames_in_flight),
            stats: FrameStats::default(),
            static_descriptors,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Slot that the next `begin_frame` uses.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Number of frames begun so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn frame(&self, token: &FrameToken) -> &FrameResource {
        &self.frames[token.slot]
    }

    pub fn frame_mut(&mut self, token: &FrameToken) -> &mut FrameResource {
        &mut self.frames[token.slot]
    }

    /// Slot resources by index.
    pub fn slot(&self, index: usize) -> Option<&FrameResource> {
        self.frames.get(index)
    }

    /// Long-lived descriptor allocator shared by all slots.
    pub fn static_descriptors(&mut self) -> &mut DescriptorAllocator {
        &mut self.static_descriptors
    }

    /// Destroy `resource` once no frame in flight can still reference it.
    pub fn retire(&mut self, resource: impl Into<DeferredResource>) {
        self.deferred.queue(resource, self.frame_number);
    }

    pub fn pending_deletions(&self) -> usize {
        self.deferred.pending_count()
    }

    /// Wait for the current slot, acquire an image and begin recording.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self, target: &mut dyn PresentTarget) -> Result<FrameToken> {
        let slot = self.frame_index;

        self.wait_for_slot(slot)?;
        {
            let frame = &mut self.frames[slot];
            frame
                .transient_descriptors
                .reset_pools_after(&[&frame.in_flight])?;
        }
        self.deferred.process(self.frame_number);

        let acquired = self.acquire(slot, target)?;

        let frame = &self.frames[slot];
        frame.reset_commands()?;
        frame
            .command_buffer
            .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        // Unsignal last so any earlier failure leaves the slot waitable.
        frame.in_flight.reset()?;

        Ok(FrameToken {
            slot,
            image_index: acquired.index,
            frame_number: self.frame_number,
            suboptimal: acquired.suboptimal,
        })
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fence = &self.frames[slot].in_flight;
        while fence.wait(self.fence_timeout_ns)? == FenceStatus::TimedOut {
            self.stats.fence_spins += 1;
            tracing::warn!(
                "Frame slot {} still busy after {} ns, waiting again",
                slot,
                self.fence_timeout_ns
            );
        }
        Ok(())
    }

    fn acquire(&mut self, slot: usize, target: &mut dyn PresentTarget) -> Result<AcquiredImage> {
        let semaphore = self.frames[slot].image_acquired.handle();
        for _ in 0..MAX_REBUILD_ATTEMPTS {
            // SAFETY: the semaphore is unsignaled; its last wait was the
            // previous submit of this slot, which has completed.
            let result = unsafe {
                self.device
                    .acquire_next_image(target.swapchain(), semaphore, u64::MAX)
            };
            match result {
                Ok(image) => return Ok(image),
                Err(e) if e.severity() == ErrorSeverity::Recoverable => {
                    tracing::warn!("Swapchain out of date on acquire, rebuilding");
                    self.rebuild(target)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(GpuError::SwapchainOutOfDate)
    }

    fn rebuild(&mut self, target: &mut dyn PresentTarget) -> Result<()> {
        // SAFETY: called between frames from the recording thread.
        unsafe { self.device.device_wait_idle()? };
        target.rebuild()?;
        self.stats.target_rebuilds += 1;
        Ok(())
    }

    /// End recording and submit the frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&mut self, token: &FrameToken) -> Result<()> {
        debug_assert_eq!(token.frame_number, self.frame_number, "stale frame token");
        let frame = &self.frames[token.slot];
        frame.command_buffer.end()?;

        let wait = [frame.image_acquired.handle()];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal = [frame.render_finished.handle()];
        frame.command_buffer.flush(
            SubmitBatch {
                command_buffers: &[],
                wait_semaphores: &wait,
                wait_stages: &stages,
                signal_semaphores: &signal,
            },
            frame.in_flight.handle(),
        )?;
        self.stats.frames_submitted += 1;
        Ok(())
    }

    /// Present the frame's image. Stale or suboptimal swapchains and resize
    /// requests rebuild the target instead of failing.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&mut self, token: &FrameToken, target: &mut dyn PresentTarget) -> Result<()> {
        let wait = [self.frames[token.slot].render_finished.handle()];
        // SAFETY: the image was acquired for this token and rendering was submitted.
        let result = unsafe {
            self.device
                .queue_present(self.queue, target.swapchain(), token.image_index, &wait)
        };

        let stale = match result {
            Ok(suboptimal) => {
                self.stats.frames_presented += 1;
                suboptimal || token.suboptimal
            }
            Err(e) if e.severity() == ErrorSeverity::Recoverable => true,
            Err(e) => return Err(e),
        };

        if stale || target.take_resize_request() {
            tracing::warn!("Swapchain stale after present, rebuilding");
            self.rebuild(target)?;
        }
        Ok(())
    }

    /// Move on to the next slot.
    pub fn advance(&mut self) {
        self.frame_index = (self.frame_index + 1) % self.frames.len();
        self.frame_number += 1;
    }

    /// Wait for the device and release every deferred resource.
    pub fn shutdown(&mut self) -> Result<()> {
        // SAFETY: no submission is issued concurrently.
        unsafe { self.device.device_wait_idle()? };
        self.deferred.flush();
        Ok(())
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Failed to shut down frame ring: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuConfig;
    use crate::context::headless_context;
    use crate::descriptors::DescriptorBuilder;
    use crate::headless::HeadlessDevice;
    use std::sync::Arc;

    fn uniform_init(setup: FrameSetup<'_>) -> Result<FrameBindings> {
        let uniforms = setup.memory.allocate_uniform_buffer(64)?;
        let set = DescriptorBuilder::begin(setup.layout_cache, setup.descriptors)
            .bind_buffer(
                0,
                uniforms.descriptor_info(),
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .build()?;
        Ok(FrameBindings {
            uniform_buffers: vec![uniforms],
            descriptor_sets: vec![set],
        })
    }

    fn ring(config: GpuConfig) -> (Arc<HeadlessDevice>, GpuContext, FrameRing, HeadlessTarget) {
        let (device, ctx) = headless_context(config).unwrap();
        let ring = FrameRing::new(&ctx, uniform_init).unwrap();
        let target = HeadlessTarget::new(device.clone(), 3);
        (device, ctx, ring, target)
    }

    fn run_frame(ring: &mut FrameRing, target: &mut HeadlessTarget) -> FrameToken {
        let token = ring.begin_frame(target).unwrap();
        ring.submit(&token).unwrap();
        ring.present(&token, target).unwrap();
        ring.advance();
        token
    }

    #[test]
    fn slots_share_one_uniform_layout() {
        let (_device, ctx, ring, _target) = ring(GpuConfig::default());
        assert_eq!(ring.frames_in_flight(), 2);
        assert_eq!(ctx.layout_cache().len(), 1);

        let a = ring.slot(0).unwrap().descriptor_sets[0];
        let b = ring.slot(1).unwrap().descriptor_sets[0];
        assert_eq!(a.layout, b.layout);
        assert_ne!(a.set, b.set);
    }

    #[test]
    fn slots_rotate_and_reuse_their_command_buffers() {
        let (device, _ctx, mut ring, mut target) = ring(GpuConfig::default());

        let mut handles = Vec::new();
        for frame in 0..6u64 {
            let token = ring.begin_frame(&mut target).unwrap();
            assert_eq!(token.slot, (frame % 2) as usize);
            assert_eq!(token.frame_number, frame);
            assert_eq!(token.image_index, (frame % 3) as u32);
            handles.push(ring.frame(&token).command_buffer.handle());
            ring.submit(&token).unwrap();
            ring.present(&token, &mut target).unwrap();
            ring.advance();
        }

        assert_eq!(handles[0], handles[2]);
        assert_eq!(handles[1], handles[5]);
        assert_ne!(handles[0], handles[1]);
        // One primary buffer per slot plus none for one-time work.
        assert_eq!(device.stats().command_buffers_allocated, 2);
        assert_eq!(ring.stats().frames_presented, 6);
    }

    #[test]
    fn fence_is_unsignaled_while_recording() {
        let (_device, _ctx, mut ring, mut target) = ring(GpuConfig::default());

        let token = ring.begin_frame(&mut target).unwrap();
        assert!(!ring.frame(&token).in_flight.is_signaled().unwrap());

        ring.submit(&token).unwrap();
        assert!(ring.frame(&token).in_flight.is_signaled().unwrap());
    }

    #[test]
    fn failed_begin_leaves_slot_fence_signaled() {
        let (device, _ctx, mut ring, mut target) = ring(GpuConfig::default());
        device.fail_next_begin(vk::Result::ERROR_OUT_OF_HOST_MEMORY);

        let err = ring.begin_frame(&mut target).unwrap_err();
        assert!(matches!(
            err,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
        assert!(ring.slot(0).unwrap().in_flight.is_signaled().unwrap());

        let token = ring.begin_frame(&mut target).unwrap();
        assert_eq!(token.slot, 0);
        assert!(!ring.frame(&token).in_flight.is_signaled().unwrap());
    }

    #[test]
    fn out_of_date_acquire_rebuilds_and_retries() {
        let (device, _ctx, mut ring, mut target) = ring(GpuConfig::default());
        device.expire_swapchain_on_acquire(2);

        run_frame(&mut ring, &mut target);

        assert_eq!(target.rebuild_count(), 2);
        assert_eq!(ring.stats().target_rebuilds, 2);
        assert_eq!(ring.stats().frames_presented, 1);
    }

    #[test]
    fn stale_present_and_resize_rebuild_the_target() {
        let (device, _ctx, mut ring, mut target) = ring(GpuConfig::default());

        device.expire_swapchain_on_present(1);
        run_frame(&mut ring, &mut target);
        assert_eq!(target.rebuild_count(), 1);

        target.request_resize();
        run_frame(&mut ring, &mut target);
        assert_eq!(target.rebuild_count(), 2);

        device.set_present_suboptimal(true);
        run_frame(&mut ring, &mut target);
        assert_eq!(target.rebuild_count(), 3);
    }

    #[test]
    fn transient_descriptors_reset_per_slot_use() {
        let (device, ctx, mut ring, mut target) = ring(GpuConfig::default());

        for _ in 0..4 {
            let token = ring.begin_frame(&mut target).unwrap();
            let uniforms = ring.frame(&token).uniform_buffers[0].descriptor_info();
            DescriptorBuilder::begin(
                ctx.layout_cache(),
                &mut ring.frame_mut(&token).transient_descriptors,
            )
            .bind_buffer(
                0,
                uniforms,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .build()
            .unwrap();
            ring.submit(&token).unwrap();
            ring.present(&token, &mut target).unwrap();
            ring.advance();
        }

        // One static pool plus one transient pool per slot, reused after reset.
        assert_eq!(device.stats().descriptor_pools_created, 3);
        assert!(device.stats().descriptor_pool_resets >= 2);
    }

    #[test]
    fn retired_resources_wait_for_frames_in_flight() {
        let (device, ctx, mut ring, mut target) = ring(GpuConfig::default());
        let buffers_before = device.stats().buffers_alive;

        run_frame(&mut ring, &mut target);
        ring.retire(ctx.memory().allocate_vertex_buffer(128).unwrap());
        assert_eq!(device.stats().buffers_alive, buffers_before + 1);

        run_frame(&mut ring, &mut target);
        run_frame(&mut ring, &mut target);
        assert_eq!(ring.pending_deletions(), 1);

        run_frame(&mut ring, &mut target);
        assert_eq!(ring.pending_deletions(), 0);
        assert_eq!(device.stats().buffers_alive, buffers_before);
    }

    #[test]
    fn pool_reset_strategy_resets_whole_pool() {
        let config = GpuConfig::default().with_command_reset_strategy(ResetStrategy::Pool);
        let (device, _ctx, mut ring, mut target) = ring(config);

        for _ in 0..3 {
            run_frame(&mut ring, &mut target);
        }
        assert_eq!(device.stats().command_pool_resets, 3);
        assert_eq!(device.stats().command_buffer_resets, 0);
    }
}
