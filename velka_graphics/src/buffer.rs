use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use crate::{
    engine::{DestructObject, EngineShared, TsCell},
    memory::Memory,
    types::{BufferUsage, UpdateMode},
};

/// A typed wrapper over one or more `VkBuffer`s.
///
/// `Asynchronous` buffers are replicated once per swapchain image; uniform
/// replicas are selected by frame index, while vertex/index replicas rotate
/// on every update so a CPU write cannot race a queued GPU read of the
/// previous frame's contents.
pub struct Buffer {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) update: UpdateMode,
    pub(crate) usage: BufferUsage,
    size: usize,
    pub(crate) handles: Mutex<Vec<vk::Buffer>>,
    pub(crate) memories: Mutex<Vec<Memory>>,
    /// Replica selected for the next vertex/index bind.
    pub(crate) vbib_index: AtomicU32,
    pub(crate) ts: TsCell,
}

impl Buffer {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        update: UpdateMode,
        usage: BufferUsage,
        size: usize,
        seed: Option<&[u8]>,
    ) -> Result<Arc<Buffer>> {
        let count = if update == UpdateMode::Asynchronous {
            engine.image_count()
        } else {
            1
        };

        let device_local = usage == BufferUsage::Storage;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size as vk::DeviceSize)
            .usage(usage.to_vulkan_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let mut handles = Vec::with_capacity(count as usize);
        let mut memories = Vec::with_capacity(count as usize);

        let unwind = |engine: &EngineShared,
                          handles: &mut Vec<vk::Buffer>,
                          memories: &mut Vec<Memory>| {
            for memory in memories.drain(..) {
                engine.mm.free(engine, memory);
            }
            for handle in handles.drain(..) {
                unsafe { engine.device().destroy_buffer(handle, None) };
            }
        };

        for _ in 0..count {
            let handle = match unsafe { engine.device().create_buffer(&buffer_info, None) } {
                Ok(handle) => handle,
                Err(err) => {
                    unwind(&engine, &mut handles, &mut memories);
                    return Err(err).context("vkCreateBuffer failed");
                }
            };
            handles.push(handle);

            // device-local storage is seeded through the transfer manager
            let map_seed = if device_local { None } else { seed };
            match engine.mm.alloc_buffer(
                &engine,
                handle,
                device_local,
                size as vk::DeviceSize,
                map_seed,
            ) {
                Ok(memory) => memories.push(memory),
                Err(err) => {
                    unwind(&engine, &mut handles, &mut memories);
                    return Err(err);
                }
            }
        }

        let buffer = Arc::new(Buffer {
            engine,
            update,
            usage,
            size,
            handles: Mutex::new(handles),
            memories: Mutex::new(memories),
            vbib_index: AtomicU32::new(0),
            ts: TsCell::new(),
        });

        if let (Some(seed), true) = (seed, device_local) {
            if !buffer
                .engine
                .xfer
                .write_storage(&buffer.engine, &buffer, seed.len(), 0, seed)
            {
                return Err(anyhow::anyhow!("storage seed upload failed"));
            }
        }

        Ok(buffer)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn update_mode(&self) -> UpdateMode {
        self.update
    }

    /// Handle of replica `index`, clamped for non-replicated buffers.
    pub(crate) fn handle(&self, index: u32) -> vk::Buffer {
        let handles = self.handles.lock();
        let index = (index as usize).min(handles.len() - 1);
        handles[index]
    }

    pub(crate) fn vbib_handle(&self) -> vk::Buffer {
        self.handle(self.vbib_index.load(Ordering::Relaxed))
    }

    /// Rotate to the next vertex/index replica and return its index.
    pub(crate) fn rotate_vbib(&self, count: u32) -> u32 {
        let next = (self.vbib_index.load(Ordering::Relaxed) + 1) % count;
        self.vbib_index.store(next, Ordering::Relaxed);
        next
    }

    /// Write `bytes` into replica `index` through the sub-allocator.
    pub(crate) fn write_memory(&self, index: u32, offset: usize, bytes: &[u8]) {
        let memories = self.memories.lock();
        let index = (index as usize).min(memories.len() - 1);
        self.engine.mm.write(
            &self.engine,
            &memories[index],
            bytes.len() as vk::DeviceSize,
            offset as vk::DeviceSize,
            bytes,
        );
    }

    pub(crate) fn read_memory(&self, index: u32, offset: usize, bytes: &mut [u8]) {
        let memories = self.memories.lock();
        let index = (index as usize).min(memories.len() - 1);
        self.engine.mm.read(
            &self.engine,
            &memories[index],
            bytes.len() as vk::DeviceSize,
            offset as vk::DeviceSize,
            bytes,
        );
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let buffers = std::mem::take(&mut *self.handles.lock());
        let memories = std::mem::take(&mut *self.memories.lock());
        self.engine.delete_object(DestructObject::Buffer {
            ts: self.ts.get(),
            buffers,
            memories,
        });
    }
}
