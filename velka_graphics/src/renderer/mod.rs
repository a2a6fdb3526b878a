//! Renderers: on-screen presentation, off-screen to an image, off-screen to
//! a rolling image stream, and secondary command-buffer recording under a
//! primary.
//!
//! A renderer is handed out as `Arc<Renderer>` and is internally mutable; a
//! single renderer's `begin`/`end` pair must still be serialized by the
//! caller, while different renderers may record in parallel.

pub(crate) mod default;
pub(crate) mod image;
pub(crate) mod secondary;
pub(crate) mod stream;

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;

use crate::{
    buffer::Buffer,
    engine::EngineShared,
    image::Image,
    pipeline::GraphicsPipeline,
    types::{
        BufferUsage, ImageFormat, IndexType, RendererMode, RendererType, Stage, UpdateMode,
    },
    uniform::{UniformAttachment, UniformSet},
};

pub(crate) const MAX_VERTEX_BUFFERS: usize = 16;

/// Frame-rate counter: recomputed each second, reset after two idle seconds.
pub(crate) struct Fps {
    fps: u32,
    t0: f64,
    frames: u32,
}

impl Fps {
    fn new() -> Self {
        Self {
            fps: 0,
            t0: 0.0,
            frames: 0,
        }
    }

    pub(crate) fn update(&mut self, t: f64) {
        let dt0 = t - self.t0;
        self.frames += 1;

        if dt0 >= 2.0 {
            self.fps = 60;
            self.t0 = t;
            self.frames = 0;
        } else if dt0 >= 1.0 {
            self.fps = (self.frames as f64 / dt0 + 0.5) as u32;
            self.t0 = t;
            self.frames = 0;
        }
    }

    pub(crate) fn fps(&self) -> u32 {
        self.fps
    }
}

struct RendererBase {
    mode: Option<RendererMode>,
    bound: Option<Arc<GraphicsPipeline>>,
    fps: Fps,
}

pub(crate) enum RendererKind {
    Default(default::DefaultRenderer),
    Image(image::ImageRenderer),
    Stream(stream::ImageStreamRenderer),
    Secondary(secondary::SecondaryRenderer),
}

pub struct Renderer {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) kind: RendererKind,
    base: Mutex<RendererBase>,
    /// Semaphores contributed by upstream image-stream renderers, waited at
    /// this renderer's submit and cleared by `end`.
    waits: Mutex<Vec<vk::Semaphore>>,
}

impl Renderer {
    pub(crate) fn with_kind(engine: Arc<EngineShared>, kind: RendererKind) -> Arc<Renderer> {
        Arc::new(Renderer {
            engine,
            kind,
            base: Mutex::new(RendererBase {
                mode: None,
                bound: None,
                fps: Fps::new(),
            }),
            waits: Mutex::new(Vec::new()),
        })
    }

    pub fn renderer_type(&self) -> RendererType {
        match &self.kind {
            RendererKind::Default(_) => RendererType::Default,
            RendererKind::Image(_) => RendererType::Image,
            RendererKind::Stream(_) => RendererType::ImageStream,
            RendererKind::Secondary(_) => RendererType::Secondary,
        }
    }

    /// The renderer that ultimately schedules this renderer's commands.
    fn updater_type(&self) -> RendererType {
        match &self.kind {
            RendererKind::Stream(stream) => stream.consumer.updater_type(),
            RendererKind::Secondary(secondary) => secondary.executor.updater_type(),
            _ => self.renderer_type(),
        }
    }

    /// The update mode buffers must use to be updated from this renderer.
    pub fn update_mode(&self) -> UpdateMode {
        match &self.kind {
            RendererKind::Default(_) => UpdateMode::Asynchronous,
            RendererKind::Image(_) => UpdateMode::Synchronous,
            RendererKind::Stream(stream) => stream.consumer.update_mode(),
            RendererKind::Secondary(secondary) => secondary.executor.update_mode(),
        }
    }

    pub fn fps(&self) -> u32 {
        self.base.lock().fps.fps()
    }

    pub fn surface_size(&self) -> (u32, u32) {
        match &self.kind {
            RendererKind::Default(default) => default.surface_size(),
            RendererKind::Image(image) => (image.width, image.height),
            RendererKind::Stream(stream) => stream.surface_size(),
            RendererKind::Secondary(secondary) => secondary.executor.surface_size(),
        }
    }

    pub fn msaa_sample_count(&self) -> u32 {
        match &self.kind {
            RendererKind::Default(_) => self.engine.msaa_sample_count(),
            RendererKind::Secondary(secondary) => secondary.executor.msaa_sample_count(),
            _ => 1,
        }
    }

    /// Swapchain frame index, inherited through stream and secondary
    /// renderers.
    pub(crate) fn frame(&self) -> u32 {
        match &self.kind {
            RendererKind::Default(default) => default.frame(),
            RendererKind::Stream(stream) => stream.consumer.frame(),
            RendererKind::Secondary(secondary) => secondary.executor.frame(),
            RendererKind::Image(_) => 0,
        }
    }

    pub(crate) fn image_count(&self) -> u32 {
        match &self.kind {
            RendererKind::Default(default) => default.image_count(),
            RendererKind::Stream(stream) => stream.consumer.image_count(),
            RendererKind::Secondary(secondary) => secondary.executor.image_count(),
            RendererKind::Image(_) => 1,
        }
    }

    /// Timestamp of the frame currently being recorded; zero for renderers
    /// outside the default renderer's frame domain.
    pub(crate) fn ts_current(&self) -> f64 {
        match &self.kind {
            RendererKind::Default(default) => default.ts_current(),
            RendererKind::Stream(stream) => stream.consumer.ts_current(),
            RendererKind::Secondary(secondary) => secondary.executor.ts_current(),
            RendererKind::Image(_) => 0.0,
        }
    }

    pub(crate) fn render_pass(&self) -> vk::RenderPass {
        match &self.kind {
            RendererKind::Default(default) => default.render_pass(),
            RendererKind::Image(image) => image.render_pass,
            RendererKind::Stream(stream) => stream.render_pass,
            RendererKind::Secondary(secondary) => secondary.executor.render_pass(),
        }
    }

    pub(crate) fn framebuffer(&self) -> vk::Framebuffer {
        match &self.kind {
            RendererKind::Default(default) => default.framebuffer(),
            RendererKind::Image(image) => image.framebuffer,
            RendererKind::Stream(stream) => stream.framebuffer(),
            RendererKind::Secondary(secondary) => secondary.executor.framebuffer(),
        }
    }

    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        match &self.kind {
            RendererKind::Default(default) => default.command_buffer(),
            RendererKind::Image(image) => image.commands.get(0),
            RendererKind::Stream(stream) => stream.command_buffer(),
            RendererKind::Secondary(secondary) => secondary.command_buffer(),
        }
    }

    /// Append a semaphore this renderer's submit must wait on. Secondary
    /// renderers forward to their executor since the executor submits.
    pub(crate) fn add_wait_semaphore(&self, semaphore: vk::Semaphore) {
        if semaphore == vk::Semaphore::null() {
            return;
        }

        if let RendererKind::Secondary(secondary) = &self.kind {
            secondary.executor.add_wait_semaphore(semaphore);
            return;
        }

        let mut waits = self.waits.lock();
        if !waits.contains(&semaphore) {
            waits.push(semaphore);
        }
    }

    pub(crate) fn take_wait_semaphores(&self) -> Vec<vk::Semaphore> {
        std::mem::take(&mut *self.waits.lock())
    }

    fn begin_common(&self, mode: RendererMode) {
        let mut base = self.base.lock();
        base.mode = Some(mode);
        let t = self.engine.timestamp();
        base.fps.update(t);
    }

    fn shutdown_guard(&self) -> bool {
        if self.engine.is_shutdown() {
            log::error!("begin after shutdown");
            return false;
        }
        true
    }

    /// Begin a swapchain frame. A false return means the frame is dropped
    /// and the caller retries next tick.
    pub fn begin_default(&self, mode: RendererMode, clear_color: [f32; 4]) -> bool {
        debug_assert!(matches!(self.kind, RendererKind::Default(_)));

        if !self.shutdown_guard() {
            return false;
        }

        if !self.default_begin(mode, clear_color) {
            return false;
        }

        self.begin_common(mode);
        true
    }

    /// Begin a one-shot render into `image`.
    pub fn begin_image(
        &self,
        mode: RendererMode,
        image: &Arc<Image>,
        clear_color: [f32; 4],
    ) -> bool {
        debug_assert!(matches!(self.kind, RendererKind::Image(_)));

        if !self.shutdown_guard() {
            return false;
        }

        if !self.image_begin(mode, image, clear_color) {
            return false;
        }

        self.begin_common(mode);
        true
    }

    /// Begin a stream frame; returns the image being produced for the
    /// consumer's current frame.
    pub fn begin_image_stream(
        &self,
        mode: RendererMode,
        clear_color: [f32; 4],
    ) -> Option<Arc<Image>> {
        debug_assert!(matches!(self.kind, RendererKind::Stream(_)));

        if !self.shutdown_guard() {
            return None;
        }

        let image = self.stream_begin(mode, clear_color)?;

        self.begin_common(mode);
        Some(image)
    }

    pub fn begin_secondary(&self) -> bool {
        debug_assert!(matches!(self.kind, RendererKind::Secondary(_)));

        if !self.shutdown_guard() {
            return false;
        }

        if !self.secondary_begin() {
            return false;
        }

        self.begin_common(RendererMode::Draw);
        true
    }

    /// Finish recording: submit (or hand off) and reset the bound pipeline
    /// and wait-semaphore list.
    pub fn end(&self) {
        match &self.kind {
            RendererKind::Default(_) => self.default_end(),
            RendererKind::Image(_) => self.image_end(),
            RendererKind::Stream(_) => self.stream_end(),
            RendererKind::Secondary(_) => self.secondary_end(),
        }

        let mut base = self.base.lock();
        base.bound = None;
        base.mode = None;
        self.waits.lock().clear();
    }

    fn check_update(&self, buffer: &Buffer) -> bool {
        if buffer.usage == BufferUsage::Storage {
            log::warn!("invalid storage update");
            return false;
        }

        let updater = self.updater_type();
        match buffer.update {
            UpdateMode::Static => {
                log::warn!("invalid static update mode");
                false
            }
            UpdateMode::Asynchronous if updater != RendererType::Default => {
                log::warn!("invalid updater {updater:?}");
                false
            }
            UpdateMode::Synchronous if updater == RendererType::Default => {
                log::warn!("invalid updater {updater:?}");
                false
            }
            _ => true,
        }
    }

    /// Re-upload a buffer's contents for the frame being recorded.
    pub fn update_buffer(&self, buffer: &Arc<Buffer>, bytes: &[u8]) {
        debug_assert_eq!(self.base.lock().mode, Some(RendererMode::Draw));
        debug_assert!(self.check_update(buffer));
        debug_assert!(!bytes.is_empty() && bytes.len() <= buffer.size());

        let mut index = 0;
        if buffer.update == UpdateMode::Asynchronous {
            if matches!(buffer.usage, BufferUsage::Vertex | BufferUsage::Index) {
                // rotate so the write cannot race a queued read of the
                // previous frame's contents
                index = buffer.rotate_vbib(self.engine.image_count());
            } else {
                index = self.frame();
            }
        }

        buffer.write_memory(index, 0, bytes);
    }

    /// Re-bind `*Ref` attachments for the frame being recorded.
    pub fn update_uniform_set_refs(&self, us: &Arc<UniformSet>, ua_array: &[UniformAttachment]) {
        debug_assert_eq!(self.base.lock().mode, Some(RendererMode::Draw));
        us.update_refs(self.frame(), ua_array);
    }

    pub fn bind_graphics_pipeline(&self, gp: &Arc<GraphicsPipeline>) {
        debug_assert_eq!(self.base.lock().mode, Some(RendererMode::Draw));
        debug_assert!(
            std::ptr::eq(Arc::as_ptr(&gp.renderer), self),
            "pipeline bound to a different renderer"
        );

        let cb = self.command_buffer();
        unsafe {
            self.engine.device().cmd_bind_pipeline(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                gp.handle,
            );
        }
        self.base.lock().bound = Some(gp.clone());

        gp.ts.set(self.ts_current());
    }

    pub fn bind_uniform_sets(&self, us_array: &[&Arc<UniformSet>]) {
        let bound = self.base.lock().bound.clone();
        let gp = match bound {
            Some(gp) => gp,
            None => {
                log::warn!("bind_uniform_sets without a bound pipeline");
                return;
            }
        };

        if us_array.is_empty() || us_array.len() > crate::engine::MAX_BOUND_USF {
            log::error!("invalid uniform set count {}", us_array.len());
            return;
        }

        let ts = self.ts_current();
        let frame = self.frame();

        let descriptor_sets = us_array
            .iter()
            .map(|us| {
                us.touch(ts);
                us.descriptor_set(frame)
            })
            .collect::<Vec<_>>();

        let first = us_array[0].set_index();
        let cb = self.command_buffer();
        unsafe {
            self.engine.device().cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                gp.pipeline_layout.handle,
                first,
                &descriptor_sets,
                &[],
            );
        }
    }

    pub fn viewport(&self, x: f32, y: f32, width: f32, height: f32) {
        debug_assert_eq!(self.base.lock().mode, Some(RendererMode::Draw));

        let viewport = vk::Viewport::default()
            .x(x)
            .y(y)
            .width(width)
            .height(height)
            .min_depth(0.0)
            .max_depth(1.0);

        let cb = self.command_buffer();
        unsafe {
            self.engine
                .device()
                .cmd_set_viewport(cb, 0, std::slice::from_ref(&viewport));
        }
    }

    pub fn scissor(&self, x: i32, y: i32, width: u32, height: u32) {
        debug_assert_eq!(self.base.lock().mode, Some(RendererMode::Draw));

        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x, y },
            extent: vk::Extent2D { width, height },
        };

        let cb = self.command_buffer();
        unsafe {
            self.engine
                .device()
                .cmd_set_scissor(cb, 0, std::slice::from_ref(&scissor));
        }
    }

    /// Clear the depth attachment over the given rect.
    pub fn clear_depth(&self, x: i32, y: i32, width: u32, height: u32) {
        debug_assert_eq!(self.base.lock().mode, Some(RendererMode::Draw));

        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x, y },
                extent: vk::Extent2D { width, height },
            },
            base_array_layer: 0,
            layer_count: 1,
        };

        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        };

        let cb = self.command_buffer();
        unsafe {
            self.engine.device().cmd_clear_attachments(
                cb,
                std::slice::from_ref(&attachment),
                std::slice::from_ref(&rect),
            );
        }
    }

    fn bind_vertex_buffers(&self, cb: vk::CommandBuffer, vertex_buffers: &[&Arc<Buffer>]) {
        let handles = vertex_buffers
            .iter()
            .map(|buffer| {
                debug_assert_eq!(buffer.usage, BufferUsage::Vertex);
                buffer.vbib_handle()
            })
            .collect::<Vec<_>>();
        let offsets = vec![0u64; handles.len()];

        unsafe {
            self.engine
                .device()
                .cmd_bind_vertex_buffers(cb, 0, &handles, &offsets);
        }
    }

    pub fn draw(&self, vertex_count: u32, vertex_buffers: &[&Arc<Buffer>]) {
        debug_assert_eq!(self.base.lock().mode, Some(RendererMode::Draw));
        debug_assert!(!vertex_buffers.is_empty());
        debug_assert!(vertex_buffers.len() <= MAX_VERTEX_BUFFERS);

        let cb = self.command_buffer();
        self.bind_vertex_buffers(cb, vertex_buffers);
        unsafe {
            self.engine.device().cmd_draw(cb, vertex_count, 1, 0, 0);
        }

        let ts = self.ts_current();
        if ts != 0.0 {
            for buffer in vertex_buffers {
                buffer.ts.set(ts);
            }
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        index_type: IndexType,
        index_buffer: &Arc<Buffer>,
        vertex_buffers: &[&Arc<Buffer>],
    ) {
        debug_assert_eq!(self.base.lock().mode, Some(RendererMode::Draw));
        debug_assert_eq!(index_buffer.usage, BufferUsage::Index);
        debug_assert!(!vertex_buffers.is_empty());
        debug_assert!(vertex_buffers.len() <= MAX_VERTEX_BUFFERS);

        let cb = self.command_buffer();
        unsafe {
            self.engine.device().cmd_bind_index_buffer(
                cb,
                index_buffer.vbib_handle(),
                0,
                index_type.to_vulkan_index_type(),
            );
        }
        self.bind_vertex_buffers(cb, vertex_buffers);
        unsafe {
            self.engine
                .device()
                .cmd_draw_indexed(cb, index_count, 1, 0, 0, 0);
        }

        let ts = self.ts_current();
        if ts != 0.0 {
            for buffer in vertex_buffers {
                buffer.ts.set(ts);
            }
            index_buffer.ts.set(ts);
        }
    }

    /// Replay secondary command buffers recorded under this renderer's
    /// current render pass.
    pub fn execute(&self, secondaries: &[&Arc<Renderer>]) {
        debug_assert_eq!(self.base.lock().mode, Some(RendererMode::Execute));

        let command_buffers = secondaries
            .iter()
            .map(|secondary| {
                debug_assert!(matches!(secondary.kind, RendererKind::Secondary(_)));
                secondary.command_buffer()
            })
            .collect::<Vec<_>>();

        let cb = self.command_buffer();
        unsafe {
            self.engine.device().cmd_execute_commands(cb, &command_buffers);
        }
    }

    pub(crate) fn new_image(
        engine: Arc<EngineShared>,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Result<Arc<Renderer>> {
        let kind = RendererKind::Image(image::ImageRenderer::new(
            engine.clone(),
            width,
            height,
            format,
        )?);
        Ok(Renderer::with_kind(engine, kind))
    }

    pub(crate) fn new_image_stream(
        consumer: Arc<Renderer>,
        width: u32,
        height: u32,
        format: ImageFormat,
        mipmap: bool,
        stage: Stage,
    ) -> Result<Arc<Renderer>> {
        let engine = consumer.engine.clone();
        let kind = RendererKind::Stream(stream::ImageStreamRenderer::new(
            consumer, width, height, format, mipmap, stage,
        )?);
        Ok(Renderer::with_kind(engine, kind))
    }

    pub(crate) fn new_secondary(executor: Arc<Renderer>) -> Result<Arc<Renderer>> {
        debug_assert!(!matches!(executor.kind, RendererKind::Secondary(_)));

        let engine = executor.engine.clone();
        let kind = RendererKind::Secondary(secondary::SecondaryRenderer::new(executor)?);
        Ok(Renderer::with_kind(engine, kind))
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        match &mut self.kind {
            // the engine destroys the default renderer's state explicitly;
            // anything left here covers a renderer that outlived it
            RendererKind::Default(default) => default.destroy(&self.engine),
            RendererKind::Image(image) => {
                if let Some(parts) = image.take_parts() {
                    self.engine
                        .delete_object(crate::engine::DestructObject::Renderer(parts));
                }
            }
            RendererKind::Stream(stream) => {
                if let Some(parts) = stream.take_parts() {
                    self.engine
                        .delete_object(crate::engine::DestructObject::Renderer(parts));
                }
            }
            RendererKind::Secondary(secondary) => {
                if let Some(parts) = secondary.take_parts() {
                    self.engine
                        .delete_object(crate::engine::DestructObject::Renderer(parts));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_updates_each_second() {
        let mut fps = Fps::new();
        // 120 frames over the first second
        for i in 1..=120 {
            fps.update(i as f64 / 120.0);
        }
        assert_eq!(fps.fps(), 120);

        // 30 frames over the next second
        for i in 1..=30 {
            fps.update(1.0 + i as f64 / 30.0);
        }
        assert_eq!(fps.fps(), 30);
    }

    #[test]
    fn fps_resets_after_idle() {
        let mut fps = Fps::new();
        for i in 1..=60 {
            fps.update(i as f64 / 60.0);
        }
        assert_eq!(fps.fps(), 60);

        // a long gap resets instead of reporting a stale average
        fps.update(10.0);
        assert_eq!(fps.fps(), 60);
    }
}
