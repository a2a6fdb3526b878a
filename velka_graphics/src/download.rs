//! Image read-back, symmetric to the transfer manager's upload path.

use std::collections::HashMap;

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;

use crate::{
    barrier::image_memory_barrier,
    engine::EngineShared,
    image::Image,
    transfer::{XferBuffer, XferInstance},
};

struct DownloadState {
    shutdown: bool,
    buffers: HashMap<usize, Vec<XferBuffer>>,
    instances: Vec<XferInstance>,
}

pub(crate) struct ImageDownloader {
    state: Mutex<DownloadState>,
}

impl ImageDownloader {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DownloadState {
                shutdown: false,
                buffers: HashMap::new(),
                instances: Vec::new(),
            }),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
    }

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

    /// Copy the base level of `image` into `pixels`. Assumes shader-read
    /// layout and restores it afterwards.
    pub(crate) fn download(
        &self,
        engine: &EngineShared,
        image: &Image,
        pixels: &mut [u8],
    ) -> bool {
        let size = image.size();
        debug_assert!(pixels.len() >= size);

        let (xb, xi) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return false;
            }
            let xb = state
                .buffers
                .get_mut(&size)
                .and_then(|list| list.pop());
            let xi = state.instances.pop();
            (xb, xi)
        };

        let xb = match xb {
            Some(xb) => xb,
            None => match XferBuffer::new(engine, size, None) {
                Ok(xb) => xb,
                Err(err) => {
                    log::error!("download buffer creation failed: {err}");
                    return false;
                }
            },
        };
        let xi = match xi {
            Some(xi) => xi,
            None => match XferInstance::new(engine) {
                Ok(xi) => xi,
                Err(err) => {
                    log::error!("download instance creation failed: {err}");
                    xb.destroy(engine);
                    return false;
                }
            },
        };

        let submitted = (|| -> Result<()> {
            let cb = xi.begin(engine)?;
            let device = engine.device();

            image_memory_barrier(
                device,
                cb,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
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
                device.cmd_copy_image_to_buffer(
                    cb,
                    image.handle,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    xb.buffer,
                    std::slice::from_ref(&region),
                );
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

        engine.mm.read(
            engine,
            &xb.memory,
            size as vk::DeviceSize,
            0,
            &mut pixels[..size],
        );

        let mut state = self.state.lock();
        state.instances.push(xi);
        state.buffers.entry(size).or_default().push(xb);
        true
    }
}
