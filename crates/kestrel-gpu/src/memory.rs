//! GPU memory management.
//!
//! [`DeviceMemoryAllocator`] turns a size and a usage intent into a
//! [`Buffer`] or [`Image`] whose memory placement and mapping policy are
//! fixed by that intent.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::buffer::Buffer;
use crate::device::{AllocationDesc, AllocationInfo, AllocationToken, SharedDevice};
use crate::error::Result;
use crate::image::Image;

/// What a buffer or image will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Host-written transfer source, persistently mapped.
    Staging,
    /// Device-local vertex data filled through a staging copy.
    Vertex,
    /// Device-local index data filled through a staging copy.
    Index,
    /// Host-written uniform data, persistently mapped.
    Uniform,
    /// Device-written, host-read transfer target. Mapped on demand.
    Readback,
    /// Device-local storage without CPU access.
    DeviceOnly,
}

impl MemoryUsage {
    /// Memory location requested from the sub-allocator.
    pub fn location(self) -> MemoryLocation {
        match self {
            Self::Staging | Self::Uniform => MemoryLocation::CpuToGpu,
            Self::Readback => MemoryLocation::GpuToCpu,
            Self::Vertex | Self::Index | Self::DeviceOnly => MemoryLocation::GpuOnly,
        }
    }

    /// Whether the memory stays mapped for the lifetime of the resource.
    pub fn persistently_mapped(self) -> bool {
        matches!(self, Self::Staging | Self::Uniform)
    }

    /// Buffer usage flags implied by this intent.
    pub fn buffer_usage(self) -> vk::BufferUsageFlags {
        match self {
            Self::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Readback => vk::BufferUsageFlags::TRANSFER_DST,
            Self::DeviceOnly => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
        }
    }
}

/// Memory owned by exactly one buffer or image.
///
/// Released by the owner's `Drop`, never shared.
#[derive(Debug)]
pub struct Allocation {
    pub(crate) token: AllocationToken,
    size: vk::DeviceSize,
    memory_flags: vk::MemoryPropertyFlags,
}

impl Allocation {
    pub(crate) fn from_info(info: &AllocationInfo) -> Self {
        Self {
            token: info.token,
            size: info.size,
            memory_flags: info.memory_flags,
        }
    }

    /// Size of the allocation in bytes. May exceed the requested size.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Memory property flags of the backing memory type.
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    /// Whether the host can map this memory.
    pub fn is_host_visible(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Whether host writes are visible to the device without a flush.
    pub fn is_coherent(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// Parameters of a general buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: MemoryUsage,
    /// Usage flags added on top of the ones implied by `usage`.
    pub extra_usage: vk::BufferUsageFlags,
}

impl BufferDesc {
    pub fn new(size: vk::DeviceSize, usage: MemoryUsage) -> Self {
        Self {
            size,
            usage,
            extra_usage: vk::BufferUsageFlags::empty(),
        }
    }

    pub fn with_extra_usage(mut self, flags: vk::BufferUsageFlags) -> Self {
        self.extra_usage |= flags;
        self
    }
}

/// Creates buffers and images with memory configured for their intended use.
#[derive(Clone)]
pub struct DeviceMemoryAllocator {
    device: SharedDevice,
    name_prefix: String,
}

impl DeviceMemoryAllocator {
    /// Create an allocator on `device`. `name_prefix` labels every allocation.
    pub fn new(device: SharedDevice, name_prefix: impl Into<String>) -> Self {
        Self {
            device,
            name_prefix: name_prefix.into(),
        }
    }

    /// The device resources are created on.
    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    /// Allocate a buffer described by `desc`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate_buffer(&self, desc: &BufferDesc) -> Result<Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage.buffer_usage() | desc.extra_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let name = format!("{} {:?} buffer", self.name_prefix, desc.usage);
        let alloc_desc = AllocationDesc {
            name: &name,
            location: desc.usage.location(),
            persistent_map: desc.usage.persistently_mapped(),
            dedicated: false,
        };

        // SAFETY: the create info is valid and the buffer is owned by the returned wrapper.
        let (handle, info) = unsafe { self.device.create_buffer(&info, &alloc_desc)? };
        tracing::trace!("Allocated {} ({} bytes)", name, info.size);

        Ok(Buffer::new(
            self.device.clone(),
            handle,
            Allocation::from_info(&info),
            desc.usage,
            desc.size,
            info.mapped,
        ))
    }

    /// Host-visible transfer source, persistently mapped.
    pub fn allocate_staging_buffer(&self, size: vk::DeviceSize) -> Result<Buffer> {
        self.allocate_buffer(&BufferDesc::new(size, MemoryUsage::Staging))
    }

    /// Device-local vertex buffer.
    pub fn allocate_vertex_buffer(&self, size: vk::DeviceSize) -> Result<Buffer> {
        self.allocate_buffer(&BufferDesc::new(size, MemoryUsage::Vertex))
    }

    /// Device-local index buffer.
    pub fn allocate_index_buffer(&self, size: vk::DeviceSize) -> Result<Buffer> {
        self.allocate_buffer(&BufferDesc::new(size, MemoryUsage::Index))
    }

    /// Host-visible uniform buffer, persistently mapped.
    pub fn allocate_uniform_buffer(&self, size: vk::DeviceSize) -> Result<Buffer> {
        self.allocate_buffer(&BufferDesc::new(size, MemoryUsage::Uniform))
    }

    /// Host-readable transfer target.
    pub fn allocate_readback_buffer(&self, size: vk::DeviceSize) -> Result<Buffer> {
        self.allocate_buffer(&BufferDesc::new(size, MemoryUsage::Readback))
    }

    /// Allocate an image with memory placed according to `usage`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
        usage: MemoryUsage,
        dedicated: bool,
    ) -> Result<Image> {
        let name = format!("{} {:?} image", self.name_prefix, usage);
        let alloc_desc = AllocationDesc {
            name: &name,
            location: usage.location(),
            persistent_map: usage.persistently_mapped(),
            dedicated,
        };

        // SAFETY: the create info is valid and the image is owned by the returned wrapper.
        let (handle, info) = unsafe { self.device.create_image(create_info, &alloc_desc)? };
        tracing::trace!(
            "Allocated {} {}x{} {:?}",
            name,
            create_info.extent.width,
            create_info.extent.height,
            create_info.format
        );

        Ok(Image::new(
            self.device.clone(),
            handle,
            Allocation::from_info(&info),
            create_info,
        ))
    }

    /// Device-local image without CPU access, filled through staging copies.
    pub fn allocate_device_only_image(&self, create_info: &vk::ImageCreateInfo<'_>) -> Result<Image> {
        self.allocate_image(create_info, MemoryUsage::DeviceOnly, false)
    }
}
