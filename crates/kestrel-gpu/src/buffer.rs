//! Buffers and host access to their memory.

use std::ptr::NonNull;

use ash::vk;

use crate::device::SharedDevice;
use crate::error::Result;
use crate::memory::{Allocation, MemoryUsage};

/// A buffer and the memory bound to it.
///
/// Either persistently mapped (the pointer is valid for the whole life of the
/// buffer) or unmapped by default, in which case host access goes through a
/// scoped map/unmap inside [`Buffer::update`] and [`Buffer::read`].
pub struct Buffer {
    device: SharedDevice,
    handle: vk::Buffer,
    allocation: Allocation,
    usage: MemoryUsage,
    size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

// SAFETY: the mapped pointer targets device memory owned by this buffer and is
// only dereferenced through `&self`/`&mut self` methods of the owner.
unsafe impl Send for Buffer {}

impl Buffer {
    pub(crate) fn new(
        device: SharedDevice,
        handle: vk::Buffer,
        allocation: Allocation,
        usage: MemoryUsage,
        size: vk::DeviceSize,
        mapped: Option<NonNull<u8>>,
    ) -> Self {
        Self {
            device,
            handle,
            allocation,
            usage,
            size,
            mapped,
        }
    }

    /// Native handle.
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Requested size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> MemoryUsage {
        self.usage
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn is_persistently_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Contents of a persistently mapped buffer.
    pub fn mapped_bytes(&self) -> Option<&[u8]> {
        self.mapped.map(|ptr| {
            // SAFETY: the mapping covers `size` bytes for the life of `self`.
            unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size as usize) }
        })
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// Persistently mapped buffers get a plain memory copy. Other host-visible
    /// buffers are mapped, written, flushed and unmapped. Non-coherent memory
    /// is always flushed so the device sees the write once a later barrier
    /// orders its reads after it.
    ///
    /// `offset + data.len()` must not exceed [`Self::size`]; this is only
    /// checked in debug builds.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update(&self, data: &[u8], offset: vk::DeviceSize) -> Result<()> {
        let len = data.len() as vk::DeviceSize;
        debug_assert!(
            offset + len <= self.size,
            "buffer update out of range: {offset} + {len} > {}",
            self.size
        );
        debug_assert!(
            self.allocation.is_host_visible(),
            "updating a buffer that is not host visible"
        );

        let token = self.allocation.token;
        match self.mapped {
            Some(ptr) => {
                // SAFETY: in range by the precondition above.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        ptr.as_ptr().add(offset as usize),
                        data.len(),
                    );
                }
                if !self.allocation.is_coherent() {
                    // SAFETY: the allocation is live and mapped.
                    unsafe { self.device.flush_memory(token, offset, len)? };
                }
            }
            None => {
                // SAFETY: the allocation belongs to this buffer and is unmapped here.
                unsafe {
                    let ptr = self.device.map_memory(token)?;
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        ptr.as_ptr().add(offset as usize),
                        data.len(),
                    );
                    let flushed = self.device.flush_memory(token, offset, len);
                    self.device.unmap_memory(token);
                    flushed?;
                }
            }
        }
        Ok(())
    }

    /// Copy a plain-old-data value into the buffer at `offset`.
    pub fn update_pod<T: bytemuck::Pod>(&self, value: &T, offset: vk::DeviceSize) -> Result<()> {
        self.update(bytemuck::bytes_of(value), offset)
    }

    /// Copy `out.len()` bytes starting at `offset` out of the buffer.
    ///
    /// The buffer must be host visible; only checked in debug builds.
    pub fn read(&self, offset: vk::DeviceSize, out: &mut [u8]) -> Result<()> {
        let len = out.len() as vk::DeviceSize;
        debug_assert!(
            offset + len <= self.size,
            "buffer read out of range: {offset} + {len} > {}",
            self.size
        );
        debug_assert!(
            self.allocation.is_host_visible(),
            "reading a buffer that is not host visible"
        );

        match self.mapped {
            // SAFETY: in range by the precondition above; the mapping lives
            // as long as the allocation.
            Some(ptr) => unsafe {
                std::ptr::copy_nonoverlapping(
                    ptr.as_ptr().add(offset as usize),
                    out.as_mut_ptr(),
                    out.len(),
                );
            },
            // SAFETY: in range by the precondition above; the temporary
            // mapping is released before returning.
            None => unsafe {
                let token = self.allocation.token;
                let ptr = self.device.map_memory(token)?;
                std::ptr::copy_nonoverlapping(
                    ptr.as_ptr().add(offset as usize),
                    out.as_mut_ptr(),
                    out.len(),
                );
                self.device.unmap_memory(token);
            },
        }
        Ok(())
    }

    /// Descriptor info covering the whole buffer.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle,
            offset: 0,
            range: self.size,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.handle != vk::Buffer::null() {
            // SAFETY: the handle and allocation are owned by this buffer.
            unsafe {
                self.device
                    .destroy_buffer(self.handle, self.allocation.token);
            }
            self.handle = vk::Buffer::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::headless::HeadlessDevice;
    use crate::memory::DeviceMemoryAllocator;

    fn allocator() -> (Arc<HeadlessDevice>, DeviceMemoryAllocator) {
        let device = Arc::new(HeadlessDevice::new());
        let allocator = DeviceMemoryAllocator::new(device.clone(), "test");
        (device, allocator)
    }

    #[test]
    fn uniform_update_reads_back_through_mapping() {
        let (_device, allocator) = allocator();
        let buffer = allocator.allocate_uniform_buffer(64).unwrap();
        let data: Vec<u8> = (0..48).collect();

        buffer.update(&data, 0).unwrap();

        let mapped = buffer.mapped_bytes().unwrap();
        assert_eq!(&mapped[..data.len()], data.as_slice());
    }

    #[test]
    fn update_at_offset_leaves_prefix_untouched() {
        let (_device, allocator) = allocator();
        let buffer = allocator.allocate_staging_buffer(16).unwrap();

        buffer.update(&[0xAB; 4], 8).unwrap();

        let mapped = buffer.mapped_bytes().unwrap();
        assert_eq!(&mapped[..8], &[0; 8]);
        assert_eq!(&mapped[8..12], &[0xAB; 4]);
    }

    #[test]
    fn scoped_update_flushes_non_coherent_memory() {
        let (device, allocator) = allocator();
        let buffer = allocator.allocate_readback_buffer(32).unwrap();
        assert!(!buffer.is_persistently_mapped());

        buffer.update(&[7; 32], 0).unwrap();
        assert_eq!(device.stats().flushes, 1);

        let mut out = [0u8; 32];
        buffer.read(0, &mut out).unwrap();
        assert_eq!(out, [7; 32]);
    }

    #[test]
    fn pod_update_writes_bytes() {
        let (_device, allocator) = allocator();
        let buffer = allocator.allocate_uniform_buffer(16).unwrap();

        buffer.update_pod(&[1.0f32, 2.0, 3.0, 4.0], 0).unwrap();

        let mapped = buffer.mapped_bytes().unwrap();
        assert_eq!(&mapped[4..8], &2.0f32.to_ne_bytes());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    #[cfg(debug_assertions)]
    fn out_of_range_update_asserts() {
        let (_device, allocator) = allocator();
        let buffer = allocator.allocate_uniform_buffer(8).unwrap();
        let _ = buffer.update(&[0; 16], 0);
    }
}
