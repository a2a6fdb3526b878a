//! The presenting renderer: swapchain, per-image fences and framebuffers,
//! rotating acquire/submit semaphore pairs, frame timestamps, and
//! resize/recreate handling.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use crate::{
    barrier::{image_memory_barrier, image_memory_barrier_raw},
    command::CommandBufferSet,
    engine::EngineShared,
    image::Image,
    memory::Memory,
    renderer::{Renderer, RendererKind},
    types::{ImageFormat, QueueId, RendererMode, Stage},
};

/// Acquire timeout. Android supports only an infinite timeout; on desktop a
/// bounded wait avoids deadlock during window resizes.
#[cfg(target_os = "android")]
const ACQUIRE_TIMEOUT_NS: u64 = u64::MAX;
#[cfg(not(target_os = "android"))]
const ACQUIRE_TIMEOUT_NS: u64 = 250_000_000;

struct MsaaTarget {
    image: vk::Image,
    memory: Option<Memory>,
    view: vk::ImageView,
}

struct SwapchainBits {
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    extent: vk::Extent2D,
    image_count: u32,
    images: Vec<vk::Image>,
    fences: Vec<vk::Fence>,
}

struct DefaultState {
    resize: bool,

    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    extent: vk::Extent2D,
    image_count: u32,
    /// Image index of the frame being recorded.
    frame: u32,
    images: Vec<vk::Image>,
    fences: Vec<vk::Fence>,

    render_pass: vk::RenderPass,

    depth_image: Option<Arc<Image>>,
    msaa: Option<MsaaTarget>,

    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,

    commands: CommandBufferSet,

    /// Timestamp stamped when each image was last acquired.
    ts_array: Vec<f64>,

    /// Acquire/submit pairs rotate independently of the image index: the
    /// acquire semaphore must be picked before the image index is known.
    semaphore_index: u32,
    acquire_semaphores: Vec<vk::Semaphore>,
    submit_semaphores: Vec<vk::Semaphore>,
}

pub(crate) struct DefaultRenderer {
    state: Mutex<Option<DefaultState>>,
}

fn create_swapchain(engine: &EngineShared, expected_count: u32) -> Result<SwapchainBits> {
    let surface_loader = engine
        .surface_loader()
        .ok_or_else(|| anyhow::anyhow!("headless engine has no surface"))?;
    let surface = engine.surface();
    let physical_device = engine.physical_device();

    let caps = unsafe {
        surface_loader
            .get_physical_device_surface_capabilities(physical_device, surface)
            .context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR failed")?
    };

    let mut min_image_count = 3;
    if caps.max_image_count > 0 && min_image_count > caps.max_image_count {
        min_image_count = caps.max_image_count;
    } else if min_image_count < caps.min_image_count {
        min_image_count = caps.min_image_count;
    }

    let formats = unsafe {
        surface_loader
            .get_physical_device_surface_formats(physical_device, surface)
            .context("vkGetPhysicalDeviceSurfaceFormatsKHR failed")?
    };
    let surface_format = formats
        .iter()
        .find(|sf| {
            sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                && (sf.format == vk::Format::R8G8B8A8_UNORM
                    || sf.format == vk::Format::B8G8R8A8_UNORM)
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("no surface formats"))?;

    let present_modes = unsafe {
        surface_loader
            .get_physical_device_surface_present_modes(physical_device, surface)
            .context("vkGetPhysicalDeviceSurfacePresentModesKHR failed")?
    };
    let present_mode = present_modes
        .iter()
        .find(|pm| **pm == vk::PresentModeKHR::FIFO)
        .or_else(|| present_modes.first())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("no present modes"))?;

    let pre_transform = if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    };

    let extent = caps.current_extent;

    let queue_family_indices = [engine.queue_family_index()];
    let swapchain_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(min_image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .queue_family_indices(&queue_family_indices)
        .pre_transform(pre_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true);

    let swapchain_loader = engine.swapchain_loader().unwrap();
    let swapchain = unsafe {
        swapchain_loader
            .create_swapchain(&swapchain_info, None)
            .context("vkCreateSwapchainKHR failed")?
    };

    let destroy_on_fail = |swapchain, fences: &mut Vec<vk::Fence>| unsafe {
        for fence in fences.drain(..) {
            engine.device().destroy_fence(fence, None);
        }
        swapchain_loader.destroy_swapchain(swapchain, None);
    };

    let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
        Ok(images) => images,
        Err(err) => {
            destroy_on_fail(swapchain, &mut Vec::new());
            return Err(err).context("vkGetSwapchainImagesKHR failed");
        }
    };
    let image_count = images.len() as u32;

    // the semaphore rotation and command buffers are sized by the image
    // count, so it must hold constant across resizes
    if expected_count != 0 && expected_count != image_count {
        log::error!("image count changed {expected_count} -> {image_count}");
        destroy_on_fail(swapchain, &mut Vec::new());
        return Err(anyhow::anyhow!("swapchain image count changed"));
    }

    let mut fences = Vec::with_capacity(images.len());
    for _ in 0..images.len() {
        let fence_info =
            vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        match unsafe { engine.device().create_fence(&fence_info, None) } {
            Ok(fence) => fences.push(fence),
            Err(err) => {
                destroy_on_fail(swapchain, &mut fences);
                return Err(err).context("vkCreateFence failed");
            }
        }
    }

    Ok(SwapchainBits {
        swapchain,
        format: surface_format.format,
        color_space: surface_format.color_space,
        extent,
        image_count,
        images,
        fences,
    })
}

/// With MSAA the subpass renders into a 4x multisampled attachment and
/// resolves into the presentable color attachment; without it the color
/// attachment is rendered directly.
fn create_render_pass(
    engine: &EngineShared,
    format: vk::Format,
) -> Result<vk::RenderPass> {
    let msaa = engine.msaa_sample_count() == 4;
    let samples = if msaa {
        vk::SampleCountFlags::TYPE_4
    } else {
        vk::SampleCountFlags::TYPE_1
    };
    let color_load_op = if msaa {
        vk::AttachmentLoadOp::DONT_CARE
    } else {
        vk::AttachmentLoadOp::CLEAR
    };

    let attachments = [
        vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(color_load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        vk::AttachmentDescription::default()
            .format(vk::Format::D24_UNORM_S8_UINT)
            .samples(samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        vk::AttachmentDescription::default()
            .format(format)
            .samples(samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
    ];

    let color_reference = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_reference = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let msaa_reference = vk::AttachmentReference::default()
        .attachment(2)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .depth_stencil_attachment(&depth_reference);

    let attachment_count;
    if msaa {
        attachment_count = 3;
        subpass = subpass
            .color_attachments(std::slice::from_ref(&msaa_reference))
            .resolve_attachments(std::slice::from_ref(&color_reference));
    } else {
        attachment_count = 2;
        subpass = subpass.color_attachments(std::slice::from_ref(&color_reference));
    }

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments[..attachment_count])
        .subpasses(std::slice::from_ref(&subpass));

    let render_pass = unsafe {
        engine
            .device()
            .create_render_pass(&render_pass_info, None)
            .context("vkCreateRenderPass failed")?
    };

    Ok(render_pass)
}

fn create_msaa(
    engine: &Arc<EngineShared>,
    format: vk::Format,
    extent: vk::Extent2D,
) -> Result<Option<MsaaTarget>> {
    if engine.msaa_sample_count() == 1 {
        return Ok(None);
    }

    // one transient multisampled image backs every frame; only one frame
    // renders at a time and the host never observes it
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_4)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(
            vk::ImageUsageFlags::TRANSIENT_ATTACHMENT | vk::ImageUsageFlags::COLOR_ATTACHMENT,
        )
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe {
        engine
            .device()
            .create_image(&image_info, None)
            .context("vkCreateImage failed")?
    };

    let memory = match engine.mm.alloc_image(engine, image, true, true) {
        Ok(memory) => memory,
        Err(err) => {
            unsafe { engine.device().destroy_image(image, None) };
            return Err(err);
        }
    };

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    let view = match unsafe { engine.device().create_image_view(&view_info, None) } {
        Ok(view) => view,
        Err(err) => {
            engine.mm.free(engine, memory);
            unsafe { engine.device().destroy_image(image, None) };
            return Err(err).context("vkCreateImageView failed");
        }
    };

    Ok(Some(MsaaTarget {
        image,
        memory: Some(memory),
        view,
    }))
}

/// Build the depth image, MSAA target, swapchain image views, and
/// framebuffers for the current swapchain.
fn build_attachments(engine: &Arc<EngineShared>, state: &mut DefaultState) -> Result<()> {
    let depth_format = if engine.msaa_sample_count() == 4 {
        ImageFormat::Depth4x
    } else {
        ImageFormat::Depth1x
    };
    let depth_image = Image::new(
        engine.clone(),
        state.extent.width,
        state.extent.height,
        1,
        depth_format,
        false,
        Stage::Depth,
        None,
    )?;

    let msaa = create_msaa(engine, state.format, state.extent)?;

    let mut views = Vec::with_capacity(state.images.len());
    let mut framebuffers = Vec::with_capacity(state.images.len());

    let unwind = |engine: &EngineShared,
                  views: &mut Vec<vk::ImageView>,
                  framebuffers: &mut Vec<vk::Framebuffer>| unsafe {
        for framebuffer in framebuffers.drain(..) {
            engine.device().destroy_framebuffer(framebuffer, None);
        }
        for view in views.drain(..) {
            engine.device().destroy_image_view(view, None);
        }
    };

    for image in &state.images {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(*image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(state.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        let view = match unsafe { engine.device().create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                unwind(engine, &mut views, &mut framebuffers);
                destroy_msaa(engine, msaa);
                return Err(err).context("vkCreateImageView failed");
            }
        };
        views.push(view);

        let mut attachments = vec![view, depth_image.view];
        if let Some(msaa) = &msaa {
            attachments.push(msaa.view);
        }

        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(state.render_pass)
            .attachments(&attachments)
            .width(state.extent.width)
            .height(state.extent.height)
            .layers(1);

        match unsafe { engine.device().create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(err) => {
                unwind(engine, &mut views, &mut framebuffers);
                destroy_msaa(engine, msaa);
                return Err(err).context("vkCreateFramebuffer failed");
            }
        }
    }

    state.depth_image = Some(depth_image);
    state.msaa = msaa;
    state.views = views;
    state.framebuffers = framebuffers;
    Ok(())
}

fn destroy_msaa(engine: &EngineShared, msaa: Option<MsaaTarget>) {
    if let Some(mut msaa) = msaa {
        unsafe {
            engine.device().destroy_image_view(msaa.view, None);
        }
        if let Some(memory) = msaa.memory.take() {
            engine.mm.free(engine, memory);
        }
        unsafe {
            engine.device().destroy_image(msaa.image, None);
        }
    }
}

fn teardown_attachments(engine: &EngineShared, state: &mut DefaultState) {
    unsafe {
        for framebuffer in state.framebuffers.drain(..) {
            engine.device().destroy_framebuffer(framebuffer, None);
        }
        for view in state.views.drain(..) {
            engine.device().destroy_image_view(view, None);
        }
    }
    destroy_msaa(engine, state.msaa.take());
    state.depth_image = None;
}

fn teardown_swapchain(engine: &EngineShared, state: &mut DefaultState) {
    unsafe {
        for fence in state.fences.drain(..) {
            engine.device().destroy_fence(fence, None);
        }
    }
    state.images.clear();
    if state.swapchain != vk::SwapchainKHR::null() {
        if let Some(loader) = engine.swapchain_loader() {
            unsafe { loader.destroy_swapchain(state.swapchain, None) };
        }
        state.swapchain = vk::SwapchainKHR::null();
    }
}

fn install_swapchain(state: &mut DefaultState, bits: SwapchainBits) {
    state.swapchain = bits.swapchain;
    state.format = bits.format;
    state.color_space = bits.color_space;
    state.extent = bits.extent;
    state.image_count = bits.image_count;
    state.images = bits.images;
    state.fences = bits.fences;
    state.frame = 0;
}

/// Destroy and rebuild everything that depends on the surface extent.
fn resize_locked(engine: &Arc<EngineShared>, state: &mut DefaultState) -> Result<()> {
    unsafe {
        let _ = engine.device().device_wait_idle();
    }

    teardown_attachments(engine, state);
    teardown_swapchain(engine, state);

    let bits = create_swapchain(engine, state.image_count)?;
    install_swapchain(state, bits);
    build_attachments(engine, state)?;

    state.resize = false;
    Ok(())
}

impl DefaultRenderer {
    fn with_state<R>(&self, f: impl FnOnce(&DefaultState) -> R, fallback: R) -> R {
        match self.state.lock().as_ref() {
            Some(state) => f(state),
            None => fallback,
        }
    }

    pub(crate) fn surface_size(&self) -> (u32, u32) {
        self.with_state(|s| (s.extent.width, s.extent.height), (0, 0))
    }

    pub(crate) fn frame(&self) -> u32 {
        self.with_state(|s| s.frame, 0)
    }

    pub(crate) fn image_count(&self) -> u32 {
        self.with_state(|s| s.image_count, 1)
    }

    pub(crate) fn ts_current(&self) -> f64 {
        self.with_state(|s| s.ts_array[s.frame as usize], 0.0)
    }

    pub(crate) fn render_pass(&self) -> vk::RenderPass {
        self.with_state(|s| s.render_pass, vk::RenderPass::null())
    }

    pub(crate) fn framebuffer(&self) -> vk::Framebuffer {
        self.with_state(|s| s.framebuffers[s.frame as usize], vk::Framebuffer::null())
    }

    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        self.with_state(|s| s.commands.get(s.frame), vk::CommandBuffer::null())
    }

    /// Inline teardown, used by the engine at shutdown and by the last
    /// dropper when the renderer outlived the engine.
    pub(crate) fn destroy(&self, engine: &EngineShared) {
        let mut guard = self.state.lock();
        let mut state = match guard.take() {
            Some(state) => state,
            None => return,
        };

        unsafe {
            for semaphore in state
                .acquire_semaphores
                .drain(..)
                .chain(state.submit_semaphores.drain(..))
            {
                engine.device().destroy_semaphore(semaphore, None);
            }
        }
        state.commands.destroy(engine.device());
        teardown_attachments(engine, &mut state);
        unsafe {
            engine.device().destroy_render_pass(state.render_pass, None);
        }
        teardown_swapchain(engine, &mut state);
    }
}

impl Renderer {
    pub(crate) fn new_default(engine: Arc<EngineShared>) -> Result<Arc<Renderer>> {
        let bits = create_swapchain(&engine, 0)?;
        let image_count = bits.image_count;

        // partial construction unwinds through the state teardown helpers
        let mut state = DefaultState {
            resize: false,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            extent: vk::Extent2D::default(),
            image_count: 0,
            frame: 0,
            images: Vec::new(),
            fences: Vec::new(),
            render_pass: vk::RenderPass::null(),
            depth_image: None,
            msaa: None,
            views: Vec::new(),
            framebuffers: Vec::new(),
            commands: CommandBufferSet::empty(),
            ts_array: vec![0.0; image_count as usize],
            semaphore_index: 0,
            acquire_semaphores: Vec::new(),
            submit_semaphores: Vec::new(),
        };
        install_swapchain(&mut state, bits);

        let unwind = |engine: &EngineShared, state: &mut DefaultState| {
            unsafe {
                for semaphore in state
                    .acquire_semaphores
                    .drain(..)
                    .chain(state.submit_semaphores.drain(..))
                {
                    engine.device().destroy_semaphore(semaphore, None);
                }
                state.commands.destroy(engine.device());
                teardown_attachments(engine, state);
                if state.render_pass != vk::RenderPass::null() {
                    engine.device().destroy_render_pass(state.render_pass, None);
                }
                teardown_swapchain(engine, state);
            }
        };

        let built = (|| -> Result<()> {
            state.render_pass = create_render_pass(&engine, state.format)?;
            state.commands = CommandBufferSet::new(&engine, image_count, false)?;
            build_attachments(&engine, &mut state)?;

            for _ in 0..image_count {
                let semaphore_info = vk::SemaphoreCreateInfo::default();
                unsafe {
                    state
                        .acquire_semaphores
                        .push(engine.device().create_semaphore(&semaphore_info, None)?);
                    state
                        .submit_semaphores
                        .push(engine.device().create_semaphore(&semaphore_info, None)?);
                }
            }
            Ok(())
        })();

        if let Err(err) = built {
            unwind(&engine, &mut state);
            return Err(err);
        }

        engine.set_image_count(state.image_count);

        let kind = RendererKind::Default(DefaultRenderer {
            state: Mutex::new(Some(state)),
        });
        Ok(Renderer::with_kind(engine, kind))
    }

    fn default_kind(&self) -> &DefaultRenderer {
        match &self.kind {
            RendererKind::Default(default) => default,
            _ => unreachable!(),
        }
    }

    pub(crate) fn default_begin(&self, mode: RendererMode, clear_color: [f32; 4]) -> bool {
        let default = self.default_kind();
        let mut guard = default.state.lock();
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return false,
        };
        let engine = &self.engine;

        if state.resize {
            if let Err(err) = resize_locked(engine, state) {
                log::warn!("resize failed: {err}");
                return false;
            }
        }

        // a failed frame still consumes its semaphore pair
        let semaphore_index = state.semaphore_index;
        let acquire_semaphore = state.acquire_semaphores[semaphore_index as usize];
        let fail = |state: &mut DefaultState| {
            state.semaphore_index = (semaphore_index + 1) % state.image_count;
        };

        let swapchain_loader = engine.swapchain_loader().unwrap();
        let acquired = unsafe {
            swapchain_loader.acquire_next_image(
                state.swapchain,
                ACQUIRE_TIMEOUT_NS,
                acquire_semaphore,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((frame, _suboptimal)) => {
                state.frame = frame;
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                state.resize = true;
                fail(state);
                return false;
            }
            Err(err) => {
                log::warn!("acquire failed: {err}");
                fail(state);
                return false;
            }
        }

        // a size change can slip past acquire; compare against the surface
        let caps = unsafe {
            engine
                .surface_loader()
                .unwrap()
                .get_physical_device_surface_capabilities(
                    engine.physical_device(),
                    engine.surface(),
                )
        };
        match caps {
            Ok(caps) => {
                if caps.current_extent.width != state.extent.width
                    || caps.current_extent.height != state.extent.height
                {
                    state.resize = true;
                    fail(state);
                    return false;
                }
            }
            Err(err) => {
                log::error!("vkGetPhysicalDeviceSurfaceCapabilitiesKHR failed: {err}");
                fail(state);
                return false;
            }
        }

        // wait for the frame that last used this image to retire
        let fence = state.fences[state.frame as usize];
        unsafe {
            let _ = engine
                .device()
                .wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX);
            let _ = engine.device().reset_fences(std::slice::from_ref(&fence));
        }

        // expire the completed frame and stamp the new one
        engine.expire_timestamp(state.ts_array[state.frame as usize]);
        state.ts_array[state.frame as usize] = engine.timestamp();

        let cb = state.commands.get(state.frame);
        unsafe {
            if engine
                .device()
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .is_err()
            {
                fail(state);
                return false;
            }

            let begin_info = vk::CommandBufferBeginInfo::default();
            if engine.device().begin_command_buffer(cb, &begin_info).is_err() {
                fail(state);
                return false;
            }
        }

        image_memory_barrier_raw(
            engine.device(),
            cb,
            state.images[state.frame as usize],
            Stage::Depth,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            0,
            1,
        );
        if let Some(depth_image) = &state.depth_image {
            image_memory_barrier(
                engine.device(),
                cb,
                depth_image,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                0,
                1,
            );
        }

        // secondary renderers initialize viewport and scissor themselves
        if mode == RendererMode::Draw {
            let viewport = vk::Viewport::default()
                .width(state.extent.width as f32)
                .height(state.extent.height as f32)
                .min_depth(0.0)
                .max_depth(1.0);
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: state.extent,
            };
            unsafe {
                engine
                    .device()
                    .cmd_set_viewport(cb, 0, std::slice::from_ref(&viewport));
                engine
                    .device()
                    .cmd_set_scissor(cb, 0, std::slice::from_ref(&scissor));
            }
        }

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
        ];
        let clear_count = if engine.msaa_sample_count() == 4 { 3 } else { 2 };

        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(state.render_pass)
            .framebuffer(state.framebuffers[state.frame as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: state.extent,
            })
            .clear_values(&clear_values[..clear_count]);

        let contents = match mode {
            RendererMode::Draw => vk::SubpassContents::INLINE,
            RendererMode::Execute => vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        };

        unsafe {
            engine
                .device()
                .cmd_begin_render_pass(cb, &render_pass_begin, contents);
        }

        true
    }

    pub(crate) fn default_end(&self) {
        let default = self.default_kind();
        let mut guard = default.state.lock();
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return,
        };
        let engine = &self.engine;

        let semaphore_index = state.semaphore_index;
        let acquire_semaphore = state.acquire_semaphores[semaphore_index as usize];
        let submit_semaphore = state.submit_semaphores[semaphore_index as usize];
        state.semaphore_index = (semaphore_index + 1) % state.image_count;

        let cb = state.commands.get(state.frame);
        unsafe {
            engine.device().cmd_end_render_pass(cb);
            let _ = engine.device().end_command_buffer(cb);
        }

        let mut waits = vec![acquire_semaphore];
        waits.extend(self.take_wait_semaphores());
        let wait_stages =
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; waits.len()];

        let fence = state.fences[state.frame as usize];
        if !engine.queue_submit(
            QueueId::Foreground,
            cb,
            &waits,
            &wait_stages,
            Some(submit_semaphore),
            fence,
        ) {
            return;
        }

        let swapchains = [state.swapchain];
        let image_indices = [state.frame];
        let wait_semaphores = [submit_semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match engine.present(&present_info) {
            Ok(_suboptimal) => {}
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                state.resize = true;
            }
            Err(err) => {
                log::warn!("present failed: {err}");
            }
        }
    }

    /// Wait for the device and expire every in-flight frame, so pending
    /// destructions can proceed.
    pub(crate) fn device_wait_idle(&self) {
        unsafe {
            let _ = self.engine.device().device_wait_idle();
        }

        let default = self.default_kind();
        let guard = default.state.lock();
        if let Some(state) = guard.as_ref() {
            for ts in &state.ts_array {
                self.engine.expire_timestamp(*ts);
            }
        }
    }

    pub(crate) fn destroy_default(&self) {
        unsafe {
            let _ = self.engine.device().device_wait_idle();
        }
        self.default_kind().destroy(&self.engine);
    }

    /// Tear down the surface-dependent half, leaving render pass, command
    /// buffers, and semaphores in place. Pairs with
    /// `rebuild_swapchain_state`.
    pub(crate) fn destroy_swapchain_state(&self) {
        let default = self.default_kind();
        let mut guard = default.state.lock();
        if let Some(state) = guard.as_mut() {
            teardown_attachments(&self.engine, state);
            teardown_swapchain(&self.engine, state);
        }
    }

    pub(crate) fn rebuild_swapchain_state(&self) -> Result<()> {
        let default = self.default_kind();
        let mut guard = default.state.lock();
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return Err(anyhow::anyhow!("renderer destroyed")),
        };

        let bits = create_swapchain(&self.engine, state.image_count)?;
        install_swapchain(state, bits);
        build_attachments(&self.engine, state)?;
        state.resize = false;
        Ok(())
    }
}
