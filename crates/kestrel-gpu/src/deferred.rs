//! Deferred resource destruction for multi-frame-in-flight rendering.
//!
//! A resource released while earlier frames may still read it is parked here
//! with the frame number it was released on, and dropped only once
//! `frames_in_flight` further frames have completed.

use std::collections::VecDeque;

use crate::buffer::Buffer;
use crate::image::ImageResource;

/// A resource whose destruction is deferred.
pub enum DeferredResource {
    Buffer(Buffer),
    Image(ImageResource),
}

impl From<Buffer> for DeferredResource {
    fn from(buffer: Buffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<ImageResource> for DeferredResource {
    fn from(image: ImageResource) -> Self {
        Self::Image(image)
    }
}

struct PendingDeletion {
    resource: DeferredResource,
    frame_queued: u64,
}

/// FIFO of resources waiting for their last frame to retire.
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    frames_in_flight: usize,
}

impl DeferredDeletionQueue {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Park `resource`, released during frame `frame_number`.
    pub fn queue(&mut self, resource: impl Into<DeferredResource>, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            resource: resource.into(),
            frame_queued: frame_number,
        });
    }

    /// Drop every resource released more than `frames_in_flight` frames
    /// before `current_frame_number`. Returns how many were dropped.
    ///
    /// Call after waiting on the fence of the frame slot being reused.
    pub fn process(&mut self, current_frame_number: u64) -> usize {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        // Frame numbers are non-decreasing, so only the front can mature.
        let mut released = 0;
        while self
            .pending
            .front()
            .is_some_and(|p| p.frame_queued < cutoff)
        {
            if let Some(pending) = self.pending.pop_front() {
                drop(pending.resource);
                released += 1;
            }
        }
        if released > 0 {
            tracing::trace!("Released {} deferred resources", released);
        }
        released
    }

    /// Drop everything now. Only valid once the device is idle.
    pub fn flush(&mut self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Change the retirement distance, e.g. after the ring is resized.
    pub fn set_frames_in_flight(&mut self, frames_in_flight: usize) {
        self.frames_in_flight = frames_in_flight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use crate::memory::DeviceMemoryAllocator;
    use std::sync::Arc;

    #[test]
    fn resources_outlive_frames_in_flight() {
        let device = Arc::new(HeadlessDevice::new());
        let allocator = DeviceMemoryAllocator::new(device.clone(), "test");
        let mut queue = DeferredDeletionQueue::new(2);

        queue.queue(allocator.allocate_vertex_buffer(64).unwrap(), 10);
        assert_eq!(queue.process(11), 0);
        assert_eq!(queue.process(12), 0);
        assert_eq!(device.stats().buffers_alive, 1);

        assert_eq!(queue.process(13), 1);
        assert_eq!(device.stats().buffers_alive, 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn flush_releases_everything() {
        let device = Arc::new(HeadlessDevice::new());
        let allocator = DeviceMemoryAllocator::new(device.clone(), "test");
        let mut queue = DeferredDeletionQueue::new(3);

        let meta = crate::image::ImageMeta::two_dim(8, 8, ash::vk::Format::R8G8B8A8_UNORM, 1);
        queue.queue(ImageResource::create_empty_two_dim(&allocator, &meta).unwrap(), 0);
        queue.queue(allocator.allocate_uniform_buffer(16).unwrap(), 1);
        assert_eq!(queue.pending_count(), 2);

        queue.flush();
        assert_eq!(device.stats().buffers_alive, 0);
        assert_eq!(device.stats().images_alive, 0);
    }
}
