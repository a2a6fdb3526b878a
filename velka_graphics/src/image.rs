use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use crate::{
    engine::{DestructObject, EngineShared, TsCell},
    memory::Memory,
    types::{ImageFormat, Stage},
};

/// Compute the mip chain length for a `width x height` image. Mipmapping
/// requires power-of-two dimensions.
pub(crate) fn mip_levels_for(width: u32, height: u32, mipmap: bool) -> Result<u32> {
    if !mipmap {
        return Ok(1);
    }

    if width == 0 || height == 0 || !width.is_power_of_two() || !height.is_power_of_two() {
        return Err(anyhow::anyhow!(
            "mipmap requires power-of-two dimensions, got {width}x{height}"
        ));
    }

    let n = 32 - width.leading_zeros();
    let m = 32 - height.leading_zeros();
    Ok(n.max(m))
}

/// A typed wrapper over a `VkImage` with its view, sub-allocation, and a
/// per-mip-level layout record.
pub struct Image {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth: u32,
    pub(crate) format: ImageFormat,
    pub(crate) stage: Stage,
    pub(crate) mip_levels: u32,
    /// Current layout of each mip level, as the GPU will observe it next.
    pub(crate) layouts: Mutex<Vec<vk::ImageLayout>>,
    pub(crate) handle: vk::Image,
    pub(crate) memory: Mutex<Option<Memory>>,
    pub(crate) view: vk::ImageView,
    /// Created on demand for image-stream hand-off.
    pub(crate) semaphore: Mutex<Option<vk::Semaphore>>,
    pub(crate) ts: TsCell,
}

impl Image {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        width: u32,
        height: u32,
        depth: u32,
        format: ImageFormat,
        mipmap: bool,
        stage: Stage,
        pixels: Option<&[u8]>,
    ) -> Result<Arc<Image>> {
        if width == 0 || height == 0 || depth == 0 {
            return Err(anyhow::anyhow!("invalid extent {width}x{height}x{depth}"));
        }
        debug_assert!(!(mipmap && format.is_depth()));

        let mip_levels = mip_levels_for(width, height, mipmap)?;

        let (usage, aspect_mask) = if format.is_depth() {
            (
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            )
        } else {
            let mut usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
            if mip_levels > 1 {
                // mip levels are generated iteratively by blitting
                usage |= vk::ImageUsageFlags::TRANSFER_SRC;
            }
            if pixels.is_none() {
                // enable render-to-texture
                usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
            // read-back goes through a transfer copy
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
            (usage, vk::ImageAspectFlags::COLOR)
        };

        let image_type = if depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let view_type = if depth > 1 {
            vk::ImageViewType::TYPE_3D
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(format.to_vulkan_format())
            .extent(vk::Extent3D {
                width,
                height,
                depth,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(if format == ImageFormat::Depth4x {
                vk::SampleCountFlags::TYPE_4
            } else {
                vk::SampleCountFlags::TYPE_1
            })
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = unsafe {
            engine
                .device()
                .create_image(&image_info, None)
                .context("vkCreateImage failed")?
        };

        // depth and other host-invisible attachments prefer transient memory
        let transient = format.is_depth();
        let memory = match engine.mm.alloc_image(&engine, handle, true, transient) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { engine.device().destroy_image(handle, None) };
                return Err(err);
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(view_type)
            .format(format.to_vulkan_format())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask)
                    .base_mip_level(0)
                    .level_count(mip_levels)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        let view = match unsafe { engine.device().create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                engine.mm.free(&engine, memory);
                unsafe { engine.device().destroy_image(handle, None) };
                return Err(err).context("vkCreateImageView failed");
            }
        };

        let image = Arc::new(Image {
            engine,
            width,
            height,
            depth,
            format,
            stage,
            mip_levels,
            layouts: Mutex::new(vec![vk::ImageLayout::UNDEFINED; mip_levels as usize]),
            handle,
            memory: Mutex::new(Some(memory)),
            view,
            semaphore: Mutex::new(None),
            ts: TsCell::new(),
        });

        if let Some(pixels) = pixels {
            if !format.is_depth() && !image.engine.xfer.write_image(&image.engine, &image, pixels)
            {
                return Err(anyhow::anyhow!("image upload failed"));
            }
        }

        Ok(image)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn extent(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.depth)
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Byte size of the base level as the host sees it.
    pub fn size(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.depth as usize
            * self.format.bytes_per_texel()
    }

    /// Read the base level back into `pixels`. The image must be in its
    /// shader-read state.
    pub fn download(&self, pixels: &mut [u8]) -> Result<()> {
        if self.engine.downloader.download(&self.engine, self, pixels) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("image download failed"))
        }
    }

    /// Semaphore the producer signals when rendering into this image
    /// completes. Created on first use.
    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut semaphore = self.semaphore.lock();
        if let Some(semaphore) = *semaphore {
            return Ok(semaphore);
        }

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let created = unsafe {
            self.engine
                .device()
                .create_semaphore(&semaphore_info, None)
                .context("vkCreateSemaphore failed")?
        };
        *semaphore = Some(created);
        Ok(created)
    }

    pub(crate) fn semaphore(&self) -> Option<vk::Semaphore> {
        *self.semaphore.lock()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let memory = self.memory.lock().take();
        let semaphore = self.semaphore.lock().take();
        self.engine.delete_object(DestructObject::Image {
            ts: self.ts.get(),
            handle: self.handle,
            view: self.view,
            memory,
            semaphore,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_mipmap_is_single_level() {
        assert_eq!(mip_levels_for(640, 480, false).unwrap(), 1);
        assert_eq!(mip_levels_for(1, 1, false).unwrap(), 1);
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_levels_for(256, 256, true).unwrap(), 9);
        assert_eq!(mip_levels_for(256, 16, true).unwrap(), 9);
        assert_eq!(mip_levels_for(1, 1, true).unwrap(), 1);
        assert_eq!(mip_levels_for(2, 1, true).unwrap(), 2);
        assert_eq!(mip_levels_for(1024, 512, true).unwrap(), 11);
    }

    #[test]
    fn mipmap_requires_power_of_two() {
        assert!(mip_levels_for(640, 480, true).is_err());
        assert!(mip_levels_for(256, 100, true).is_err());
        assert!(mip_levels_for(0, 256, true).is_err());
    }
}
