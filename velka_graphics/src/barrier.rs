//! Image layout transitions.
//!
//! The policy is a table from `(old layout, new layout, stage)` to pipeline
//! stage masks and access masks. Images track their current layout per mip
//! level so subsequent barriers always see the layout the GPU observes next.

use ash::vk;

use crate::{image::Image, types::Stage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TransitionMasks {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Resolve the stage and access masks for a layout transition.
/// Returns `None` for layouts outside the policy table.
pub(crate) fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    stage: Stage,
) -> Option<TransitionMasks> {
    let shader_stage = {
        let flags = stage.to_vulkan_pipeline_stage_flags();
        if flags.is_empty() {
            vk::PipelineStageFlags::ALL_COMMANDS
        } else {
            flags
        }
    };

    let (src_stage, src_access) = match old_layout {
        vk::ImageLayout::UNDEFINED => (
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (shader_stage, vk::AccessFlags::SHADER_READ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        _ => return None,
    };

    let (dst_stage, dst_access) = match new_layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (shader_stage, vk::AccessFlags::SHADER_READ),
        _ => return None,
    };

    Some(TransitionMasks {
        src_stage,
        dst_stage,
        src_access,
        dst_access,
    })
}

/// Record a layout transition for a raw image handle.
pub(crate) fn image_memory_barrier_raw(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    stage: Stage,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    base_mip_level: u32,
    level_count: u32,
) {
    if new_layout == old_layout {
        return;
    }

    let masks = match transition_masks(old_layout, new_layout, stage) {
        Some(masks) => masks,
        None => {
            log::warn!(
                "invalid transition {:?} -> {:?}",
                old_layout,
                new_layout
            );
            return;
        }
    };

    let aspect_mask = if new_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::COLOR
    };

    let imb = vk::ImageMemoryBarrier::default()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask)
                .base_mip_level(base_mip_level)
                .level_count(level_count)
                .base_array_layer(0)
                .layer_count(1),
        );

    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&imb),
        );
    }
}

/// Record a layout transition for a tracked image and update its per-level
/// layout array.
pub(crate) fn image_memory_barrier(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: &Image,
    new_layout: vk::ImageLayout,
    base_mip_level: u32,
    level_count: u32,
) {
    let mut layouts = image.layouts.lock();
    let old_layout = layouts[base_mip_level as usize];

    image_memory_barrier_raw(
        device,
        cb,
        image.handle,
        image.stage,
        old_layout,
        new_layout,
        base_mip_level,
        level_count,
    );

    for layout in layouts
        .iter_mut()
        .skip(base_mip_level as usize)
        .take(level_count as usize)
    {
        *layout = new_layout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_to_color_attachment() {
        let masks = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Stage::Fragment,
        )
        .unwrap();
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masks.src_access, vk::AccessFlags::empty());
        assert_eq!(
            masks.dst_stage,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(masks.dst_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
    }

    #[test]
    fn transfer_dst_to_shader_read_uses_consuming_stage() {
        let masks = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Stage::Fragment,
        )
        .unwrap();
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(masks.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(masks.dst_access, vk::AccessFlags::SHADER_READ);

        let masks = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Stage::VertexFragment,
        )
        .unwrap();
        assert_eq!(
            masks.dst_stage,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER
        );
    }

    #[test]
    fn depth_attachment_transition() {
        let masks = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Stage::Depth,
        )
        .unwrap();
        assert_eq!(
            masks.dst_stage,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        );
        assert_eq!(
            masks.dst_access,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn compute_stage_round_trip() {
        let masks = transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Stage::Compute,
        )
        .unwrap();
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_READ);
    }

    #[test]
    fn unknown_layouts_are_rejected() {
        assert!(transition_masks(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Stage::Fragment,
        )
        .is_none());
        assert!(transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
            Stage::Fragment,
        )
        .is_none());
    }
}
