//! Image layout transitions.
//!
//! Access masks are derived from the layouts alone. Layouts missing from the
//! table contribute no access bits.

use ash::vk;

/// Access that must be complete before an image leaves `layout`.
pub fn src_access_mask(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        // UNDEFINED and anything else.
        _ => vk::AccessFlags::empty(),
    }
}

/// Access masks for a transition from `old_layout` to `new_layout`, as
/// `(src, dst)`.
///
/// Entering `SHADER_READ_ONLY_OPTIMAL` from a layout with no source access
/// assumes a prior host or transfer write.
pub fn access_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags) {
    let mut src = src_access_mask(old_layout);
    let dst = match new_layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            if src.is_empty() {
                src = vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE;
            }
            vk::AccessFlags::SHADER_READ
        }
        _ => vk::AccessFlags::empty(),
    };
    (src, dst)
}

/// A layout change plus the pipeline stages it synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// Transition that waits on and blocks all commands.
    pub fn new(old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        Self {
            old_layout,
            new_layout,
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
        }
    }

    pub fn with_stages(mut self, src: vk::PipelineStageFlags, dst: vk::PipelineStageFlags) -> Self {
        self.src_stage = src;
        self.dst_stage = dst;
        self
    }

    /// Barrier for `image` over `range`. Queue ownership is not transferred.
    pub fn image_barrier(
        &self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
    ) -> vk::ImageMemoryBarrier<'static> {
        let (src, dst) = access_masks(self.old_layout, self.new_layout);
        vk::ImageMemoryBarrier::default()
            .src_access_mask(src)
            .dst_access_mask(dst)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_sequence_masks() {
        let (src, dst) = access_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);

        let (src, dst) = access_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn shader_read_from_undefined_assumes_host_or_transfer_write() {
        let (src, dst) = access_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(
            src,
            vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn color_attachment_round_trip() {
        assert_eq!(
            access_masks(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL
            ),
            (
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::TRANSFER_READ
            )
        );
        assert_eq!(
            access_masks(
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            ),
            (
                vk::AccessFlags::SHADER_READ,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            )
        );
    }

    #[test]
    fn unknown_layouts_add_nothing() {
        assert_eq!(
            access_masks(vk::ImageLayout::GENERAL, vk::ImageLayout::PRESENT_SRC_KHR),
            (vk::AccessFlags::empty(), vk::AccessFlags::empty())
        );
    }

    #[test]
    fn barrier_ignores_queue_families() {
        let barrier = LayoutTransition::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .image_barrier(vk::Image::null(), vk::ImageSubresourceRange::default());
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
    }
}
