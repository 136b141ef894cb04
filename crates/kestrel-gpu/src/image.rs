//! Images, image views and the image resources built from them.

use ash::vk;

use crate::device::SharedDevice;
use crate::error::Result;
use crate::memory::{Allocation, DeviceMemoryAllocator};

/// Size of one texel for the formats the transfer path supports.
pub fn format_bytes_per_pixel(format: vk::Format) -> Option<vk::DeviceSize> {
    match format {
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        vk::Format::R8G8B8A8_SRGB | vk::Format::R8G8B8A8_UNORM => Some(4),
        _ => None,
    }
}

/// An image and the memory bound to it.
pub struct Image {
    device: SharedDevice,
    handle: vk::Image,
    allocation: Allocation,
    extent: vk::Extent3D,
    format: vk::Format,
    mip_levels: u32,
    array_layers: u32,
}

impl Image {
    pub(crate) fn new(
        device: SharedDevice,
        handle: vk::Image,
        allocation: Allocation,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Self {
        Self {
            device,
            handle,
            allocation,
            extent: create_info.extent,
            format: create_info.format,
            mip_levels: create_info.mip_levels,
            array_layers: create_info.array_layers,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    /// Extent of mip level 0.
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Color subresource range covering every level and layer.
    pub fn full_color_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.handle != vk::Image::null() {
            // SAFETY: the handle and allocation are owned by this image.
            unsafe {
                self.device.destroy_image(self.handle, self.allocation.token);
            }
            self.handle = vk::Image::null();
        }
    }
}

/// Parameters of an image view.
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl ImageViewDesc {
    /// 2D view over all `mip_levels` of layer 0.
    pub fn two_dim(
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Self {
        Self {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            },
        }
    }

    /// Cube view over six layers.
    pub fn cube(
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Self {
        Self {
            image,
            view_type: vk::ImageViewType::CUBE,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 6,
            },
        }
    }

    fn create_info(&self) -> vk::ImageViewCreateInfo<'static> {
        vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(self.view_type)
            .format(self.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(self.subresource_range)
    }
}

/// A typed view into an image.
pub struct ImageView {
    device: SharedDevice,
    handle: vk::ImageView,
    desc: ImageViewDesc,
}

impl ImageView {
    /// Create a view. The image must outlive the view.
    pub fn new(device: SharedDevice, desc: ImageViewDesc) -> Result<Self> {
        // SAFETY: the create info references a live image of this device.
        let handle = unsafe { device.create_image_view(&desc.create_info())? };
        Ok(Self {
            device,
            handle,
            desc,
        })
    }

    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }

    pub fn desc(&self) -> &ImageViewDesc {
        &self.desc
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        if self.handle != vk::ImageView::null() {
            // SAFETY: owned handle.
            unsafe { self.device.destroy_image_view(self.handle) };
        }
    }
}

/// Shape of an image resource.
#[derive(Debug, Clone, Copy)]
pub struct ImageMeta {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
}

impl ImageMeta {
    pub fn two_dim(width: u32, height: u32, format: vk::Format, mip_levels: u32) -> Self {
        Self {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            mip_levels,
        }
    }
}

/// An image together with the view used to sample or attach it.
pub struct ImageResource {
    // Declared first so the view is destroyed before its image.
    view: ImageView,
    image: Image,
}

impl ImageResource {
    pub fn new(image: Image, view: ImageView) -> Self {
        Self { view, image }
    }

    /// Sampled, transfer-destination 2D image with a view over every level.
    pub fn create_empty_two_dim(allocator: &DeviceMemoryAllocator, meta: &ImageMeta) -> Result<Self> {
        let info = sampled_image_info(meta, 1, vk::ImageCreateFlags::empty());
        let image = allocator.allocate_device_only_image(&info)?;
        let view = ImageView::new(
            allocator.device().clone(),
            ImageViewDesc::two_dim(
                image.handle(),
                meta.format,
                vk::ImageAspectFlags::COLOR,
                meta.mip_levels,
            ),
        )?;
        Ok(Self::new(image, view))
    }

    /// Sampled, transfer-destination cube map with six layers.
    pub fn create_empty_cubic(allocator: &DeviceMemoryAllocator, meta: &ImageMeta) -> Result<Self> {
        let info = sampled_image_info(meta, 6, vk::ImageCreateFlags::CUBE_COMPATIBLE);
        let image = allocator.allocate_device_only_image(&info)?;
        let view = ImageView::new(
            allocator.device().clone(),
            ImageViewDesc::cube(
                image.handle(),
                meta.format,
                vk::ImageAspectFlags::COLOR,
                meta.mip_levels,
            ),
        )?;
        Ok(Self::new(image, view))
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn view(&self) -> &ImageView {
        &self.view
    }

    /// Descriptor info for sampling in `layout`.
    pub fn descriptor_info(&self, sampler: vk::Sampler, layout: vk::ImageLayout) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler,
            image_view: self.view.handle(),
            image_layout: layout,
        }
    }
}

fn sampled_image_info(
    meta: &ImageMeta,
    array_layers: u32,
    flags: vk::ImageCreateFlags,
) -> vk::ImageCreateInfo<'static> {
    vk::ImageCreateInfo::default()
        .flags(flags)
        .image_type(vk::ImageType::TYPE_2D)
        .format(meta.format)
        .extent(meta.extent)
        .mip_levels(meta.mip_levels)
        .array_layers(array_layers)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use std::sync::Arc;

    #[test]
    fn bytes_per_pixel_known_formats() {
        assert_eq!(format_bytes_per_pixel(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(format_bytes_per_pixel(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(format_bytes_per_pixel(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(format_bytes_per_pixel(vk::Format::D32_SFLOAT), None);
    }

    #[test]
    fn cube_view_spans_six_layers() {
        let desc = ImageViewDesc::cube(
            vk::Image::null(),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageAspectFlags::COLOR,
            3,
        );
        assert_eq!(desc.view_type, vk::ImageViewType::CUBE);
        assert_eq!(desc.subresource_range.layer_count, 6);
        assert_eq!(desc.subresource_range.level_count, 3);

        let two_dim = ImageViewDesc::two_dim(
            vk::Image::null(),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageAspectFlags::COLOR,
            1,
        );
        assert_eq!(two_dim.subresource_range.layer_count, 1);
    }

    #[test]
    fn empty_cubic_resource() {
        let device = Arc::new(HeadlessDevice::new());
        let allocator = DeviceMemoryAllocator::new(device.clone(), "test");
        let meta = ImageMeta::two_dim(16, 16, vk::Format::R8G8B8A8_UNORM, 2);

        let resource = ImageResource::create_empty_cubic(&allocator, &meta).unwrap();
        assert_eq!(resource.image().array_layers(), 6);
        assert_eq!(resource.image().mip_levels(), 2);
        assert_eq!(resource.view().desc().view_type, vk::ImageViewType::CUBE);
        assert_eq!(device.stats().image_views_alive, 1);

        drop(resource);
        assert_eq!(device.stats().image_views_alive, 0);
        assert_eq!(device.stats().images_alive, 0);
    }
}
