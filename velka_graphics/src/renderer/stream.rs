//! Producer of a ring of images for a consumer renderer. Each image owns a
//! semaphore the producer signals at submit and hands to the consumer's
//! wait list, so a produced image is complete before the consumer's render
//! pass begins.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;

use crate::{
    barrier::image_memory_barrier,
    command::CommandBufferSet,
    engine::{RendererParts, TsCell},
    image::Image,
    renderer::{Renderer, RendererKind},
    types::{ImageFormat, QueueId, RendererMode, RendererType, Stage},
};

pub(crate) struct ImageStreamRenderer {
    pub(crate) consumer: Arc<Renderer>,
    /// One target image per consumer frame.
    images: Vec<Arc<Image>>,
    /// Single-level views for the framebuffers; the images' own views span
    /// every mip level.
    views: Vec<vk::ImageView>,
    pub(crate) render_pass: vk::RenderPass,
    depth_image: Option<Arc<Image>>,
    framebuffers: Vec<vk::Framebuffer>,
    commands: CommandBufferSet,
    pub(crate) ts: TsCell,
}

fn create_render_pass(
    engine: &crate::engine::EngineShared,
    format: ImageFormat,
) -> Result<vk::RenderPass> {
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

impl ImageStreamRenderer {
    pub(crate) fn new(
        consumer: Arc<Renderer>,
        width: u32,
        height: u32,
        format: ImageFormat,
        mipmap: bool,
        stage: Stage,
    ) -> Result<ImageStreamRenderer> {
        let engine = consumer.engine.clone();
        let image_count = consumer.image_count();

        let mut images = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            let image = Image::new(
                engine.clone(),
                width,
                height,
                1,
                format,
                mipmap,
                stage,
                None,
            )?;
            // the semaphore signaled when rendering into this image completes
            image.create_semaphore()?;
            images.push(image);
        }

        let mut views = Vec::with_capacity(image_count as usize);
        for image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image.handle)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.to_vulkan_format())
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
                    for view in views.drain(..) {
                        unsafe { engine.device().destroy_image_view(view, None) };
                    }
                    return Err(err).context("vkCreateImageView failed");
                }
            };
            views.push(view);
        }

        let render_pass = match create_render_pass(&engine, format) {
            Ok(render_pass) => render_pass,
            Err(err) => {
                for view in views.drain(..) {
                    unsafe { engine.device().destroy_image_view(view, None) };
                }
                return Err(err);
            }
        };

        let unwind = |views: &mut Vec<vk::ImageView>,
                      framebuffers: &mut Vec<vk::Framebuffer>| unsafe {
            for framebuffer in framebuffers.drain(..) {
                engine.device().destroy_framebuffer(framebuffer, None);
            }
            for view in views.drain(..) {
                engine.device().destroy_image_view(view, None);
            }
            engine.device().destroy_render_pass(render_pass, None);
        };

        let depth_image = match Image::new(
            engine.clone(),
            width,
            height,
            1,
            ImageFormat::Depth1x,
            false,
            Stage::Depth,
            None,
        ) {
            Ok(depth_image) => depth_image,
            Err(err) => {
                unwind(&mut views, &mut Vec::new());
                return Err(err);
            }
        };

        let mut framebuffers = Vec::with_capacity(image_count as usize);
        for view in &views {
            let attachments = [*view, depth_image.view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(width)
                .height(height)
                .layers(1);

            match unsafe { engine.device().create_framebuffer(&framebuffer_info, None) } {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(err) => {
                    unwind(&mut views, &mut framebuffers);
                    return Err(err).context("vkCreateFramebuffer failed");
                }
            }
        }

        let commands = match CommandBufferSet::new(&engine, image_count, false) {
            Ok(commands) => commands,
            Err(err) => {
                unwind(&mut views, &mut framebuffers);
                return Err(err);
            }
        };

        Ok(ImageStreamRenderer {
            consumer,
            images,
            views,
            render_pass,
            depth_image: Some(depth_image),
            framebuffers,
            commands,
            ts: TsCell::new(),
        })
    }

    pub(crate) fn surface_size(&self) -> (u32, u32) {
        let frame = self.consumer.frame() as usize;
        let image = &self.images[frame.min(self.images.len() - 1)];
        (image.width, image.height)
    }

    pub(crate) fn framebuffer(&self) -> vk::Framebuffer {
        let frame = self.consumer.frame() as usize;
        self.framebuffers[frame.min(self.framebuffers.len() - 1)]
    }

    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        self.commands.get(self.consumer.frame())
    }

    pub(crate) fn take_parts(&mut self) -> Option<RendererParts> {
        let depth_image = self.depth_image.take()?;
        Some(RendererParts::Stream {
            ts: self.ts.get(),
            render_pass: self.render_pass,
            framebuffers: std::mem::take(&mut self.framebuffers),
            views: std::mem::take(&mut self.views),
            commands: std::mem::replace(&mut self.commands, CommandBufferSet::empty()),
            depth_image,
            images: std::mem::take(&mut self.images),
        })
    }
}

impl Renderer {
    fn stream_kind(&self) -> &ImageStreamRenderer {
        match &self.kind {
            RendererKind::Stream(stream) => stream,
            _ => unreachable!(),
        }
    }

    /// Fence synchronization is unnecessary here: the stream's begin runs
    /// after the consumer's begin, and the consumer has already waited for
    /// this frame slot to retire.
    pub(crate) fn stream_begin(
        &self,
        mode: RendererMode,
        clear_color: [f32; 4],
    ) -> Option<Arc<Image>> {
        let stream = self.stream_kind();
        let engine = &self.engine;

        let frame = stream.consumer.frame();
        let image = stream.images[frame as usize].clone();
        let depth_image = stream.depth_image.as_ref()?;

        let cb = stream.commands.get(frame);
        unsafe {
            if engine
                .device()
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .is_err()
            {
                return None;
            }

            let begin_info = vk::CommandBufferBeginInfo::default();
            if engine.device().begin_command_buffer(cb, &begin_info).is_err() {
                return None;
            }
        }

        image_memory_barrier(
            engine.device(),
            cb,
            &image,
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
                .width(image.width as f32)
                .height(image.height as f32)
                .min_depth(0.0)
                .max_depth(1.0);
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: image.width,
                    height: image.height,
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
            .render_pass(stream.render_pass)
            .framebuffer(stream.framebuffers[frame as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: image.width,
                    height: image.height,
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

        if let Some(semaphore) = image.semaphore() {
            stream.consumer.add_wait_semaphore(semaphore);
        }

        stream.ts.set(stream.consumer.ts_current());

        Some(image)
    }

    pub(crate) fn stream_end(&self) {
        let stream = self.stream_kind();
        let engine = &self.engine;

        let frame = stream.consumer.frame();
        let image = &stream.images[frame as usize];

        let cb = stream.commands.get(frame);
        unsafe {
            engine.device().cmd_end_render_pass(cb);
        }

        if image.mip_levels > 1 {
            engine.mipmap_image(image, cb);
        }

        // the final layout is applied here rather than by the render pass so
        // the tracked per-level layouts stay consistent across mip generation
        image_memory_barrier(
            engine.device(),
            cb,
            image,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            0,
            image.mip_levels,
        );

        unsafe {
            let _ = engine.device().end_command_buffer(cb);
        }

        let queue = if stream.consumer.renderer_type() == RendererType::Default {
            QueueId::Foreground
        } else {
            QueueId::Background
        };

        let waits = self.take_wait_semaphores();
        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; waits.len()];
        if !engine.queue_submit(
            queue,
            cb,
            &waits,
            &wait_stages,
            image.semaphore(),
            vk::Fence::null(),
        ) {
            log::warn!("image stream submit failed");
        }
    }
}
