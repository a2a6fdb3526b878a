//! Secondary command-buffer recording under a primary renderer's current
//! render pass.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    command::CommandBufferSet,
    engine::{RendererParts, TsCell},
    renderer::{Renderer, RendererKind},
};

pub(crate) struct SecondaryRenderer {
    pub(crate) executor: Arc<Renderer>,
    /// One secondary command buffer per executor frame.
    commands: CommandBufferSet,
    pub(crate) ts: TsCell,
    destroyed: bool,
}

impl SecondaryRenderer {
    pub(crate) fn new(executor: Arc<Renderer>) -> Result<SecondaryRenderer> {
        let engine = executor.engine.clone();
        let commands = CommandBufferSet::new(&engine, executor.image_count(), true)?;

        Ok(SecondaryRenderer {
            executor,
            commands,
            ts: TsCell::new(),
            destroyed: false,
        })
    }

    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        self.commands.get(self.executor.frame())
    }

    pub(crate) fn take_parts(&mut self) -> Option<RendererParts> {
        if self.destroyed {
            return None;
        }
        self.destroyed = true;
        Some(RendererParts::Secondary {
            ts: self.ts.get(),
            commands: std::mem::replace(&mut self.commands, CommandBufferSet::empty()),
        })
    }
}

impl Renderer {
    fn secondary_kind(&self) -> &SecondaryRenderer {
        match &self.kind {
            RendererKind::Secondary(secondary) => secondary,
            _ => unreachable!(),
        }
    }

    /// Inherit the executor's current render pass and framebuffer and begin
    /// recording with RENDER_PASS_CONTINUE.
    pub(crate) fn secondary_begin(&self) -> bool {
        let secondary = self.secondary_kind();
        let engine = &self.engine;

        let frame = secondary.executor.frame();
        let cb = secondary.commands.get(frame);

        unsafe {
            if engine
                .device()
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .is_err()
            {
                return false;
            }
        }

        let inheritance = vk::CommandBufferInheritanceInfo::default()
            .render_pass(secondary.executor.render_pass())
            .subpass(0)
            .framebuffer(secondary.executor.framebuffer());

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
            .inheritance_info(&inheritance);

        unsafe {
            if engine.device().begin_command_buffer(cb, &begin_info).is_err() {
                return false;
            }
        }

        let (width, height) = secondary.executor.surface_size();
        let viewport = vk::Viewport::default()
            .width(width as f32)
            .height(height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };
        unsafe {
            engine
                .device()
                .cmd_set_viewport(cb, 0, std::slice::from_ref(&viewport));
            engine
                .device()
                .cmd_set_scissor(cb, 0, std::slice::from_ref(&scissor));
        }

        secondary.ts.set(secondary.executor.ts_current());

        true
    }

    /// Only ends the command buffer; the executor submits it.
    pub(crate) fn secondary_end(&self) {
        let secondary = self.secondary_kind();
        let cb = secondary.command_buffer();
        unsafe {
            let _ = self.engine.device().end_command_buffer(cb);
        }
    }
}
