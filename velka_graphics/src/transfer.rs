//! Host <-> device copies on the background queue.
//!
//! Staging buffers are cached by size and fence/command-buffer instances are
//! pooled, so steady-state uploads allocate nothing. All operations are
//! synchronous: they submit, wait on a fence, and return.

use std::collections::HashMap;

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use crate::{
    barrier::image_memory_barrier,
    buffer::Buffer,
    command::CommandBufferSet,
    engine::EngineShared,
    image::Image,
    memory::Memory,
    types::QueueId,
};

/// A host-visible staging buffer.
pub(crate) struct XferBuffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) memory: Memory,
}

impl XferBuffer {
    pub(crate) fn new(
        engine: &EngineShared,
        size: usize,
        data: Option<&[u8]>,
    ) -> Result<XferBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            engine
                .device()
                .create_buffer(&buffer_info, None)
                .context("vkCreateBuffer failed")?
        };

        let memory = match engine
            .mm
            .alloc_buffer(engine, buffer, false, size as vk::DeviceSize, data)
        {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { engine.device().destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        Ok(XferBuffer { buffer, memory })
    }

    pub(crate) fn destroy(self, engine: &EngineShared) {
        engine.mm.free(engine, self.memory);
        unsafe { engine.device().destroy_buffer(self.buffer, None) };
    }
}

/// A fence plus a single-shot command buffer.
pub(crate) struct XferInstance {
    pub(crate) fence: vk::Fence,
    pub(crate) commands: CommandBufferSet,
}

impl XferInstance {
    pub(crate) fn new(engine: &EngineShared) -> Result<XferInstance> {
        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe {
            engine
                .device()
                .create_fence(&fence_info, None)
                .context("vkCreateFence failed")?
        };

        let commands = match CommandBufferSet::new(engine, 1, false) {
            Ok(commands) => commands,
            Err(err) => {
                unsafe { engine.device().destroy_fence(fence, None) };
                return Err(err);
            }
        };

        Ok(XferInstance { fence, commands })
    }

    pub(crate) fn destroy(self, engine: &EngineShared) {
        self.commands.destroy(engine.device());
        unsafe { engine.device().destroy_fence(self.fence, None) };
    }

    /// Reset the fence and the command buffer and begin recording.
    pub(crate) fn begin(&self, engine: &EngineShared) -> Result<vk::CommandBuffer> {
        let cb = self.commands.get(0);
        unsafe {
            engine
                .device()
                .reset_fences(std::slice::from_ref(&self.fence))?;
            engine
                .device()
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())?;

            let begin_info = vk::CommandBufferBeginInfo::default();
            engine.device().begin_command_buffer(cb, &begin_info)?;
        }
        Ok(cb)
    }

    /// End recording, submit on the background queue, and wait.
    pub(crate) fn submit_and_wait(&self, engine: &EngineShared) -> bool {
        let cb = self.commands.get(0);
        unsafe {
            if engine.device().end_command_buffer(cb).is_err() {
                return false;
            }
        }

        if !engine.queue_submit(QueueId::Background, cb, &[], &[], None, self.fence) {
            return false;
        }

        let waited = unsafe {
            engine
                .device()
                .wait_for_fences(std::slice::from_ref(&self.fence), true, u64::MAX)
        };
        if waited.is_err() {
            log::warn!("vkWaitForFences failed");
            engine.queue_wait_idle(QueueId::Background);
        }
        true
    }
}

struct XferState {
    shutdown: bool,
    /// Idle staging buffers keyed by size.
    buffers: HashMap<usize, Vec<XferBuffer>>,
    instances: Vec<XferInstance>,
}

pub(crate) struct TransferManager {
    state: Mutex<XferState>,
}

impl TransferManager {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(XferState {
                shutdown: false,
                buffers: HashMap::new(),
                instances: Vec::new(),
            }),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
    }

    /// Destroy the caches. Called once at engine teardown.
    pub(crate) fn destroy(&self, engine: &EngineShared) {
        let mut state = self.state.lock();
        for instance in state.instances.drain(..) {
            instance.destroy(engine);
        }
        let buffers = std::mem::take(&mut state.buffers);
        drop(state);
        for (_, list) in buffers {
            for buffer in list {
                buffer.destroy(engine);
            }
        }
    }

    /// Grab an idle staging buffer of exactly `size` bytes, else create one.
    /// Returns `None` after shutdown.
    fn take_buffer(
        &self,
        engine: &EngineShared,
        size: usize,
        data: Option<&[u8]>,
    ) -> Option<XferBuffer> {
        let mut state = self.state.lock();
        if state.shutdown {
            return None;
        }

        if let Some(list) = state.buffers.get_mut(&size) {
            if let Some(xb) = list.pop() {
                drop(state);
                if let Some(data) = data {
                    engine
                        .mm
                        .write(engine, &xb.memory, size as vk::DeviceSize, 0, data);
                }
                return Some(xb);
            }
        }
        drop(state);

        match XferBuffer::new(engine, size, data) {
            Ok(xb) => Some(xb),
            Err(err) => {
                log::error!("staging buffer creation failed: {err}");
                None
            }
        }
    }

    fn take_instance(&self, engine: &EngineShared) -> Option<XferInstance> {
        let mut state = self.state.lock();
        if let Some(instance) = state.instances.pop() {
            return Some(instance);
        }
        drop(state);

        match XferInstance::new(engine) {
            Ok(instance) => Some(instance),
            Err(err) => {
                log::error!("transfer instance creation failed: {err}");
                None
            }
        }
    }

    fn put_back(&self, size: usize, buffer: XferBuffer, instance: XferInstance) {
        let mut state = self.state.lock();
        state.instances.push(instance);
        state.buffers.entry(size).or_default().push(buffer);
    }

    /// Copy host memory into a device-local storage buffer.
    pub(crate) fn write_storage(
        &self,
        engine: &EngineShared,
        buffer: &Buffer,
        size: usize,
        offset: usize,
        data: &[u8],
    ) -> bool {
        debug_assert!(size + offset <= buffer.size());
        self.blit_storage(engine, buffer, size, offset, Some(data), None)
    }

    /// Copy a device-local storage buffer back into host memory.
    pub(crate) fn read_storage(
        &self,
        engine: &EngineShared,
        buffer: &Buffer,
        size: usize,
        offset: usize,
        data: &mut [u8],
    ) -> bool {
        debug_assert!(size + offset <= buffer.size());
        self.blit_storage(engine, buffer, size, offset, None, Some(data))
    }

    fn blit_storage(
        &self,
        engine: &EngineShared,
        buffer: &Buffer,
        size: usize,
        offset: usize,
        write: Option<&[u8]>,
        read: Option<&mut [u8]>,
    ) -> bool {
        let xb = match self.take_buffer(engine, size, write) {
            Some(xb) => xb,
            None => return false,
        };
        let xi = match self.take_instance(engine) {
            Some(xi) => xi,
            None => {
                xb.destroy(engine);
                return false;
            }
        };

        let submitted = (|| -> Result<()> {
            let cb = xi.begin(engine)?;

            let region = if write.is_some() {
                vk::BufferCopy::default()
                    .src_offset(0)
                    .dst_offset(offset as vk::DeviceSize)
                    .size(size as vk::DeviceSize)
            } else {
                vk::BufferCopy::default()
                    .src_offset(offset as vk::DeviceSize)
                    .dst_offset(0)
                    .size(size as vk::DeviceSize)
            };

            unsafe {
                if write.is_some() {
                    engine.device().cmd_copy_buffer(
                        cb,
                        xb.buffer,
                        buffer.handle(0),
                        std::slice::from_ref(&region),
                    );
                } else {
                    engine.device().cmd_copy_buffer(
                        cb,
                        buffer.handle(0),
                        xb.buffer,
                        std::slice::from_ref(&region),
                    );
                }
            }

            if !xi.submit_and_wait(engine) {
                return Err(anyhow::anyhow!("submit failed"));
            }
            Ok(())
        })();

        // a failed submit destroys both so neither cache leaks a handle the
        // GPU might still touch
        if submitted.is_err() {
            xi.destroy(engine);
            xb.destroy(engine);
            return false;
        }

        if let Some(read) = read {
            engine
                .mm
                .read(engine, &xb.memory, size as vk::DeviceSize, 0, read);
        }

        self.put_back(size, xb, xi);
        true
    }

    /// Upload `pixels` into the base level, generating the mip chain when
    /// the image has one. The image ends in its shader-read state.
    pub(crate) fn write_image(
        &self,
        engine: &EngineShared,
        image: &Image,
        pixels: &[u8],
    ) -> bool {
        if self.state.lock().shutdown {
            return false;
        }

        // F16 source pixels arrive in F32 and are converted on the GPU by
        // blitting through an F32 intermediate
        if image.format.is_f16() {
            return self.write_image_f16(engine, image, pixels);
        }

        let size = image.size();
        let xb = match self.take_buffer(engine, size, Some(pixels)) {
            Some(xb) => xb,
            None => return false,
        };
        let xi = match self.take_instance(engine) {
            Some(xi) => xi,
            None => {
                xb.destroy(engine);
                return false;
            }
        };

        let submitted = (|| -> Result<()> {
            let cb = xi.begin(engine)?;
            let device = engine.device();

            image_memory_barrier(
                device,
                cb,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                0,
                image.mip_levels,
            );

            let region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: image.width,
                    height: image.height,
                    depth: image.depth,
                });

            unsafe {
                device.cmd_copy_buffer_to_image(
                    cb,
                    xb.buffer,
                    image.handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&region),
                );
            }

            if image.mip_levels > 1 {
                engine.mipmap_image(image, cb);
            }

            image_memory_barrier(
                device,
                cb,
                image,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                0,
                image.mip_levels,
            );

            if !xi.submit_and_wait(engine) {
                return Err(anyhow::anyhow!("submit failed"));
            }
            Ok(())
        })();

        if submitted.is_err() {
            xi.destroy(engine);
            xb.destroy(engine);
            return false;
        }

        self.put_back(size, xb, xi);
        true
    }

    fn write_image_f16(&self, engine: &EngineShared, image: &Image, pixels: &[u8]) -> bool {
        let tmp = match Image::new(
            image.engine.clone(),
            image.width,
            image.height,
            image.depth,
            image.format.f32_variant(),
            image.mip_levels > 1,
            image.stage,
            Some(pixels),
        ) {
            Ok(tmp) => tmp,
            Err(err) => {
                log::error!("F16 intermediate failed: {err}");
                return false;
            }
        };

        let xi = match self.take_instance(engine) {
            Some(xi) => xi,
            None => return false,
        };

        let submitted = (|| -> Result<()> {
            let cb = xi.begin(engine)?;
            let device = engine.device();

            image_memory_barrier(
                device,
                cb,
                &tmp,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                0,
                tmp.mip_levels,
            );
            image_memory_barrier(
                device,
                cb,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                0,
                image.mip_levels,
            );

            let extent = |value: u32, level: u32| ((value >> level).max(1)) as i32;
            for level in 0..image.mip_levels {
                let offsets = [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: extent(image.width, level),
                        y: extent(image.height, level),
                        z: extent(image.depth, level),
                    },
                ];
                let blit = vk::ImageBlit::default()
                    .src_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(level)
                            .base_array_layer(0)
                            .layer_count(1),
                    )
                    .src_offsets(offsets)
                    .dst_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(level)
                            .base_array_layer(0)
                            .layer_count(1),
                    )
                    .dst_offsets(offsets);

                unsafe {
                    device.cmd_blit_image(
                        cb,
                        tmp.handle,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        image.handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        std::slice::from_ref(&blit),
                        vk::Filter::NEAREST,
                    );
                }
            }

            image_memory_barrier(
                device,
                cb,
                image,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                0,
                image.mip_levels,
            );

            if !xi.submit_and_wait(engine) {
                return Err(anyhow::anyhow!("submit failed"));
            }
            Ok(())
        })();

        if submitted.is_err() {
            xi.destroy(engine);
            return false;
        }

        let mut state = self.state.lock();
        state.instances.push(xi);
        true
    }
}
