//! Synchronization primitives.

use ash::vk;

use crate::device::SharedDevice;
use crate::error::Result;

/// Outcome of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// Host-waitable signal of completed device work.
pub struct Fence {
    device: SharedDevice,
    handle: vk::Fence,
}

impl Fence {
    /// Create a fence. A signaled fence lets the first wait return at once.
    pub fn new(device: SharedDevice, signaled: bool) -> Result<Self> {
        // SAFETY: plain creation.
        let handle = unsafe { device.create_fence(signaled)? };
        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Wait up to `timeout_ns` nanoseconds.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout_ns: u64) -> Result<FenceStatus> {
        // SAFETY: owned fence.
        let signaled = unsafe { self.device.wait_for_fences(&[self.handle], timeout_ns)? };
        Ok(if signaled {
            FenceStatus::Signaled
        } else {
            FenceStatus::TimedOut
        })
    }

    /// Wait until signaled, retrying every `timeout_ns`, then reset.
    ///
    /// A timeout is not an error; the wait is repeated until the device
    /// finishes or reports a failure.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_and_reset(&self, timeout_ns: u64) -> Result<()> {
        let mut attempts = 0u32;
        while self.wait(timeout_ns)? == FenceStatus::TimedOut {
            attempts += 1;
            tracing::warn!(
                "Fence {:?} not signaled after {} waits of {} ns, still waiting",
                self.handle,
                attempts,
                timeout_ns
            );
        }
        self.reset()
    }

    /// Non-blocking query.
    pub fn is_signaled(&self) -> Result<bool> {
        // SAFETY: owned fence.
        unsafe { self.device.fence_status(self.handle) }
    }

    /// Return the fence to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        // SAFETY: owned fence; callers do not reset fences of pending submissions.
        unsafe { self.device.reset_fences(&[self.handle]) }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // SAFETY: owned fence.
        unsafe { self.device.destroy_fence(self.handle) };
    }
}

/// Device-side ordering signal between queue operations.
pub struct Semaphore {
    device: SharedDevice,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: SharedDevice) -> Result<Self> {
        // SAFETY: plain creation.
        let handle = unsafe { device.create_semaphore()? };
        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: owned semaphore.
        unsafe { self.device.destroy_semaphore(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{RawDevice, SubmitBatch};
    use crate::headless::HeadlessDevice;
    use std::sync::Arc;

    #[test]
    fn signaled_fence_does_not_block() {
        let device = Arc::new(HeadlessDevice::new());
        let fence = Fence::new(device, true).unwrap();
        assert_eq!(fence.wait(0).unwrap(), FenceStatus::Signaled);
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let device = Arc::new(HeadlessDevice::new());
        let fence = Fence::new(device, false).unwrap();
        assert_eq!(fence.wait(1_000).unwrap(), FenceStatus::TimedOut);
    }

    #[test]
    fn reused_fence_has_no_stale_signal() {
        let device = Arc::new(HeadlessDevice::new());
        let fence = Fence::new(device.clone(), true).unwrap();

        for _ in 0..3 {
            fence.wait_and_reset(1_000_000).unwrap();
            assert_eq!(fence.wait(0).unwrap(), FenceStatus::TimedOut);
            assert!(!fence.is_signaled().unwrap());

            unsafe {
                device
                    .queue_submit(device.graphics_queue(), &SubmitBatch::default(), fence.handle())
                    .unwrap();
            }
            assert!(fence.is_signaled().unwrap());
        }
    }

    #[test]
    fn primitives_are_destroyed_on_drop() {
        let device = Arc::new(HeadlessDevice::new());
        let fence = Fence::new(device.clone(), false).unwrap();
        let handle = fence.handle();
        drop(fence);
        assert!(unsafe { device.fence_status(handle) }.is_err());

        let semaphore = Semaphore::new(device.clone()).unwrap();
        assert_ne!(semaphore.handle(), vk::Semaphore::null());
    }
}
