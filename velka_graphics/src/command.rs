use anyhow::{Context, Result};
use ash::vk;

use crate::engine::EngineShared;

/// One command pool plus a fixed array of command buffers allocated from it,
/// usually one per swapchain image.
pub(crate) struct CommandBufferSet {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandBufferSet {
    pub(crate) fn new(engine: &EngineShared, count: u32, secondary: bool) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(engine.queue_family_index());

        let pool = unsafe {
            engine
                .device()
                .create_command_pool(&pool_info, None)
                .context("vkCreateCommandPool failed")?
        };

        let level = if secondary {
            vk::CommandBufferLevel::SECONDARY
        } else {
            vk::CommandBufferLevel::PRIMARY
        };

        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);

        let buffers = unsafe {
            match engine.device().allocate_command_buffers(&allocate_info) {
                Ok(buffers) => buffers,
                Err(err) => {
                    engine.device().destroy_command_pool(pool, None);
                    return Err(err).context("vkAllocateCommandBuffers failed");
                }
            }
        };

        Ok(Self { pool, buffers })
    }

    /// Placeholder for a set whose handles have been moved out.
    pub(crate) fn empty() -> Self {
        Self {
            pool: vk::CommandPool::null(),
            buffers: Vec::new(),
        }
    }

    pub(crate) fn get(&self, index: u32) -> vk::CommandBuffer {
        self.buffers[index as usize]
    }

    pub(crate) fn destroy(&self, device: &ash::Device) {
        if self.pool == vk::CommandPool::null() {
            return;
        }
        unsafe {
            device.free_command_buffers(self.pool, &self.buffers);
            device.destroy_command_pool(self.pool, None);
        }
    }
}
