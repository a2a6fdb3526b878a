//! One-shot render-to-texture: render into a private color attachment, blit
//! into the caller's image, and wait synchronously.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use crate::{
    barrier::image_memory_barrier,
    command::CommandBufferSet,
    engine::{EngineShared, RendererParts},
    image::Image,
    renderer::{Renderer, RendererKind},
    types::{ImageFormat, QueueId, RendererMode, Stage},
};

pub(crate) struct ImageRenderer {
    pub(crate) width: u32,
    pub(crate) height: u32,
    fence: vk::Fence,
    pub(crate) render_pass: vk::RenderPass,
    depth_image: Option<Arc<Image>>,
    src_image: Option<Arc<Image>>,
    pub(crate) framebuffer: vk::Framebuffer,
    pub(crate) commands: CommandBufferSet,
    /// Caller's destination image for the in-flight pass.
    dst_image: Mutex<Option<Arc<Image>>>,
}

fn create_render_pass(engine: &EngineShared, format: ImageFormat) -> Result<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(format.to_vulkan_format())
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        vk::AttachmentDescription::default()
            .format(vk::Format::D24_UNORM_S8_UINT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];

    let color_reference = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_reference = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_reference))
        .depth_stencil_attachment(&depth_reference);

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass));

    let render_pass = unsafe {
        engine
            .device()
            .create_render_pass(&render_pass_info, None)
            .context("vkCreateRenderPass failed")?
    };

    Ok(render_pass)
}

impl ImageRenderer {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Result<ImageRenderer> {
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe {
            engine
                .device()
                .create_fence(&fence_info, None)
                .context("vkCreateFence failed")?
        };

        let render_pass = match create_render_pass(&engine, format) {
            Ok(render_pass) => render_pass,
            Err(err) => {
                unsafe { engine.device().destroy_fence(fence, None) };
                return Err(err);
            }
        };

        let unwind = |err: anyhow::Error| {
            unsafe {
                engine.device().destroy_render_pass(render_pass, None);
                engine.device().destroy_fence(fence, None);
            }
            err
        };

        let depth_image = Image::new(
            engine.clone(),
            width,
            height,
            1,
            ImageFormat::Depth1x,
            false,
            Stage::Depth,
            None,
        )
        .map_err(unwind)?;

        let src_image = Image::new(
            engine.clone(),
            width,
            height,
            1,
            format,
            false,
            Stage::Fragment,
            None,
        )
        .map_err(unwind)?;

        let attachments = [src_image.view, depth_image.view];
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(width)
            .height(height)
            .layers(1);
        let framebuffer = match unsafe {
            engine.device().create_framebuffer(&framebuffer_info, None)
        } {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                return Err(unwind(
                    anyhow::Error::new(err).context("vkCreateFramebuffer failed"),
                ))
            }
        };

        let commands = match CommandBufferSet::new(&engine, 1, false) {
            Ok(commands) => commands,
            Err(err) => {
                unsafe { engine.device().destroy_framebuffer(framebuffer, None) };
                return Err(unwind(err));
            }
        };

        Ok(ImageRenderer {
            width,
            height,
            fence,
            render_pass,
            depth_image: Some(depth_image),
            src_image: Some(src_image),
            framebuffer,
            commands,
            dst_image: Mutex::new(None),
        })
    }

    pub(crate) fn take_parts(&mut self) -> Option<RendererParts> {
        let depth_image = self.depth_image.take()?;
        let src_image = self.src_image.take()?;
        Some(RendererParts::Image {
            fence: self.fence,
            render_pass: self.render_pass,
            framebuffer: self.framebuffer,
            commands: std::mem::replace(
                &mut self.commands,
                CommandBufferSet::empty(),
            ),
            depth_image,
            src_image,
        })
    }
}

impl Renderer {
    fn image_kind(&self) -> &ImageRenderer {
        match &self.kind {
            RendererKind::Image(image) => image,
            _ => unreachable!(),
        }
    }

    pub(crate) fn image_begin(
        &self,
        mode: RendererMode,
        image: &Arc<Image>,
        clear_color: [f32; 4],
    ) -> bool {
        let renderer = self.image_kind();
        let engine = &self.engine;
        let src_image = renderer.src_image.as_ref().unwrap();
        let depth_image = renderer.depth_image.as_ref().unwrap();

        if image.width != src_image.width
            || image.height != src_image.height
            || image.depth != src_image.depth
            || image.format != src_image.format
        {
            log::warn!("destination image does not match the renderer target");
            debug_assert!(false);
            return false;
        }

        let cb = renderer.commands.get(0);
        unsafe {
            if engine
                .device()
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .is_err()
            {
                return false;
            }

            let begin_info = vk::CommandBufferBeginInfo::default();
            if engine.device().begin_command_buffer(cb, &begin_info).is_err() {
                return false;
            }
        }

        image_memory_barrier(
            engine.device(),
            cb,
            src_image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            0,
            1,
        );
        image_memory_barrier(
            engine.device(),
            cb,
            depth_image,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            0,
            1,
        );

        if mode == RendererMode::Draw {
            let viewport = vk::Viewport::default()
                .width(src_image.width as f32)
                .height(src_image.height as f32)
                .min_depth(0.0)
                .max_depth(1.0);
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: src_image.width,
                    height: src_image.height,
                },
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
        ];

        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(renderer.render_pass)
            .framebuffer(renderer.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: src_image.width,
                    height: src_image.height,
                },
            })
            .clear_values(&clear_values);

        let contents = match mode {
            RendererMode::Draw => vk::SubpassContents::INLINE,
            RendererMode::Execute => vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        };

        unsafe {
            engine
                .device()
                .cmd_begin_render_pass(cb, &render_pass_begin, contents);
        }

        *renderer.dst_image.lock() = Some(image.clone());

        true
    }

    pub(crate) fn image_end(&self) {
        let renderer = self.image_kind();
        let engine = &self.engine;
        let src_image = renderer.src_image.as_ref().unwrap();

        let dst_image = match renderer.dst_image.lock().take() {
            Some(dst_image) => dst_image,
            None => return,
        };

        let cb = renderer.commands.get(0);
        unsafe {
            engine.device().cmd_end_render_pass(cb);
        }

        // the destination may still be read by an in-flight frame
        engine.renderer_wait_for_timestamp(dst_image.ts.get());

        image_memory_barrier(
            engine.device(),
            cb,
            src_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            0,
            1,
        );
        image_memory_barrier(
            engine.device(),
            cb,
            &dst_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            0,
            1,
        );

        let blit = vk::ImageBlit::default()
            .src_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .src_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src_image.width as i32,
                    y: src_image.height as i32,
                    z: 1,
                },
            ])
            .dst_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .dst_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst_image.width as i32,
                    y: dst_image.height as i32,
                    z: 1,
                },
            ]);

        unsafe {
            engine.device().cmd_blit_image(
                cb,
                src_image.handle,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&blit),
                vk::Filter::NEAREST,
            );
        }

        if dst_image.mip_levels > 1 {
            engine.mipmap_image(&dst_image, cb);
        }

        // the render pass cannot provide the final layout because mip
        // generation runs after it ends; the tracked per-level layouts must
        // stay consistent
        image_memory_barrier(
            engine.device(),
            cb,
            &dst_image,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            0,
            dst_image.mip_levels,
        );

        unsafe {
            let _ = engine.device().end_command_buffer(cb);
            let _ = engine
                .device()
                .reset_fences(std::slice::from_ref(&renderer.fence));
        }

        let waits = self.take_wait_semaphores();
        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; waits.len()];
        if !engine.queue_submit(
            QueueId::Background,
            cb,
            &waits,
            &wait_stages,
            None,
            renderer.fence,
        ) {
            log::warn!("image renderer submit failed");
            return;
        }

        let waited = unsafe {
            engine
                .device()
                .wait_for_fences(std::slice::from_ref(&renderer.fence), true, u64::MAX)
        };
        if waited.is_err() {
            log::warn!("vkWaitForFences failed");
            engine.queue_wait_idle(QueueId::Background);
        }
    }
}
