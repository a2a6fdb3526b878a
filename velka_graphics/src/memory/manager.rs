use std::{collections::HashMap, sync::atomic::Ordering};

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::{Condvar, Mutex};

use crate::engine::EngineShared;

use super::{
    chunk::{Chunk, CHUNK_STRIPES},
    pool::{compute_pool_count, Pool, PoolKey},
    Memory,
};

/// Aggregate allocation statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub count_chunks: usize,
    pub count_slots: usize,
    pub size_chunks: usize,
    pub size_slots: usize,
}

struct Stripe {
    mutex: Mutex<()>,
    cond: Condvar,
}

/// Owns the pool map and serializes pool and chunk access.
pub(crate) struct MemoryManager {
    /// The pool map. Doubles as the manager mutex: pool `locked` flags are
    /// only touched while this lock is held.
    pools: Mutex<PoolMap>,
    pool_cond: Condvar,
    stripes: [Stripe; CHUNK_STRIPES],
    pub(crate) info: Mutex<MemoryInfo>,
}

struct PoolMap {
    map: HashMap<PoolKey, std::sync::Arc<Pool>>,
    shutdown: bool,
}

impl MemoryManager {
    pub(crate) fn new() -> Self {
        Self {
            pools: Mutex::new(PoolMap {
                map: HashMap::new(),
                shutdown: false,
            }),
            pool_cond: Condvar::new(),
            stripes: std::array::from_fn(|_| Stripe {
                mutex: Mutex::new(()),
                cond: Condvar::new(),
            }),
            info: Mutex::new(MemoryInfo::default()),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.pools.lock().shutdown = true;
    }

    pub(crate) fn memory_info(&self) -> MemoryInfo {
        *self.info.lock()
    }

    /// Allocate and bind memory for a buffer. Host-visible unless
    /// `device_local`; an optional seed is written before binding.
    pub(crate) fn alloc_buffer(
        &self,
        engine: &EngineShared,
        buffer: vk::Buffer,
        device_local: bool,
        size: vk::DeviceSize,
        seed: Option<&[u8]>,
    ) -> Result<Memory> {
        let requirements =
            unsafe { engine.device().get_buffer_memory_requirements(buffer) };

        let flags = if device_local {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        } else {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        };

        let memory = self.alloc(engine, &requirements, flags)?;

        if let Some(seed) = seed {
            self.write(engine, &memory, size, 0, seed);
        }

        self.chunk_lock(&memory.chunk);
        let bound = unsafe {
            engine
                .device()
                .bind_buffer_memory(buffer, memory.chunk.memory, memory.offset)
        };
        self.chunk_unlock(&memory.chunk);

        if let Err(err) = bound {
            log::error!("vkBindBufferMemory failed: {err}");
            self.free(engine, memory);
            return Err(err).context("vkBindBufferMemory failed");
        }

        Ok(memory)
    }

    /// Allocate and bind memory for an image. `transient` requests
    /// lazily-allocated memory, falling back to plain device-local; this is
    /// used for attachments the host never observes (depth and MSAA).
    pub(crate) fn alloc_image(
        &self,
        engine: &EngineShared,
        image: vk::Image,
        device_local: bool,
        transient: bool,
    ) -> Result<Memory> {
        let requirements = unsafe { engine.device().get_image_memory_requirements(image) };

        let mut flags = vk::MemoryPropertyFlags::empty();
        if device_local {
            flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        }
        if transient {
            let lazy = vk::MemoryPropertyFlags::LAZILY_ALLOCATED;
            if engine
                .memory_type_index(requirements.memory_type_bits, lazy)
                .is_some()
            {
                flags = lazy;
            } else {
                flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
            }
        }

        let memory = self.alloc(engine, &requirements, flags)?;

        self.chunk_lock(&memory.chunk);
        let bound = unsafe {
            engine
                .device()
                .bind_image_memory(image, memory.chunk.memory, memory.offset)
        };
        self.chunk_unlock(&memory.chunk);

        if let Err(err) = bound {
            log::error!("vkBindImageMemory failed: {err}");
            self.free(engine, memory);
            return Err(err).context("vkBindImageMemory failed");
        }

        Ok(memory)
    }

    fn alloc(
        &self,
        engine: &EngineShared,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Memory> {
        let mt_index = engine
            .memory_type_index(requirements.memory_type_bits, flags)
            .ok_or_else(|| anyhow::anyhow!("invalid memory type"))?;

        // the pool stride is the smallest power-of-two multiple of the
        // alignment that fits the request
        let mut stride = requirements.alignment.max(1);
        while stride < requirements.size {
            stride *= 2;
        }

        let key = PoolKey { mt_index, stride };

        let mut pools = self.pools.lock();
        let (pool, created) = loop {
            let mut created = false;
            let pool = match pools.map.get(&key) {
                Some(pool) => pool.clone(),
                None => {
                    let pool = Pool::new(key, compute_pool_count(stride));
                    pools.map.insert(key, pool.clone());
                    created = true;
                    pool
                }
            };

            // the pool may have been destroyed while waiting, so the lock
            // must be retried from a fresh look-up
            if pool.locked.load(Ordering::Relaxed) {
                self.pool_cond.wait(&mut pools);
                continue;
            }
            pool.locked.store(true, Ordering::Relaxed);
            break (pool, created);
        };
        drop(pools);

        let result = pool.alloc(engine.device(), &self.info);

        let mut pools = self.pools.lock();
        pool.locked.store(false, Ordering::Relaxed);
        self.pool_cond.notify_all();
        if result.is_err() && created {
            pools.map.remove(&key);
        }
        drop(pools);

        result
    }

    /// Return a slot to its chunk. An emptied chunk is destroyed; a pool
    /// whose last chunk is gone is removed from the map.
    pub(crate) fn free(&self, engine: &EngineShared, memory: Memory) {
        let key = memory.chunk.key;

        let mut pools = self.pools.lock();
        let shutdown = pools.shutdown;
        let pool = loop {
            let pool = match pools.map.get(&key) {
                Some(pool) => pool.clone(),
                None => {
                    log::warn!("free without pool");
                    return;
                }
            };

            if pool.locked.load(Ordering::Relaxed) {
                self.pool_cond.wait(&mut pools);
                continue;
            }
            pool.locked.store(true, Ordering::Relaxed);
            break pool;
        };
        drop(pools);

        let (emptied_chunk, pool_empty) = pool.free(memory, shutdown, &self.info);

        let mut pools = self.pools.lock();
        pool.locked.store(false, Ordering::Relaxed);
        self.pool_cond.notify_all();
        if pool_empty {
            pools.map.remove(&key);
        }
        drop(pools);

        // the chunk is unreachable from the manager once detached, so it can
        // be destroyed without any lock held
        if let Some(chunk) = emptied_chunk {
            chunk.destroy(engine.device());
        }
    }

    /// Map-and-copy host bytes into a slot. `size + offset` must fit the
    /// pool stride; zero-size writes are rejected. A no-op after shutdown.
    pub(crate) fn write(
        &self,
        engine: &EngineShared,
        memory: &Memory,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) {
        if self.pools.lock().shutdown {
            return;
        }

        let chunk = &memory.chunk;
        self.chunk_lock(chunk);

        if size == 0 || size + offset > chunk.key.stride {
            log::error!(
                "invalid size={size}, offset={offset}, stride={}",
                chunk.key.stride
            );
            self.chunk_unlock(chunk);
            return;
        }

        unsafe {
            match engine.device().map_memory(
                chunk.memory,
                memory.offset + offset,
                size,
                vk::MemoryMapFlags::empty(),
            ) {
                Ok(data) => {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        data.cast::<u8>(),
                        size as usize,
                    );
                    engine.device().unmap_memory(chunk.memory);
                }
                Err(err) => log::warn!("vkMapMemory failed: {err}"),
            }
        }

        self.chunk_unlock(chunk);
    }

    /// Map-and-copy a slot back into host memory.
    pub(crate) fn read(
        &self,
        engine: &EngineShared,
        memory: &Memory,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
        bytes: &mut [u8],
    ) {
        if self.pools.lock().shutdown {
            return;
        }

        let chunk = &memory.chunk;
        self.chunk_lock(chunk);

        if size == 0 || size + offset > chunk.key.stride {
            log::error!(
                "invalid size={size}, offset={offset}, stride={}",
                chunk.key.stride
            );
            self.chunk_unlock(chunk);
            return;
        }

        unsafe {
            match engine.device().map_memory(
                chunk.memory,
                memory.offset + offset,
                size,
                vk::MemoryMapFlags::empty(),
            ) {
                Ok(data) => {
                    std::ptr::copy_nonoverlapping(
                        data.cast::<u8>(),
                        bytes.as_mut_ptr(),
                        size as usize,
                    );
                    engine.device().unmap_memory(chunk.memory);
                }
                Err(err) => log::warn!("vkMapMemory failed: {err}"),
            }
        }

        self.chunk_unlock(chunk);
    }

    fn chunk_lock(&self, chunk: &Chunk) {
        let stripe = &self.stripes[chunk.updater];
        let mut guard = stripe.mutex.lock();
        while chunk.locked.load(Ordering::Relaxed) {
            stripe.cond.wait(&mut guard);
        }
        chunk.locked.store(true, Ordering::Relaxed);
    }

    fn chunk_unlock(&self, chunk: &Chunk) {
        let stripe = &self.stripes[chunk.updater];
        {
            let _guard = stripe.mutex.lock();
            chunk.locked.store(false, Ordering::Relaxed);
        }
        stripe.cond.notify_all();
    }

    /// Destroy any chunks still alive. Called once at engine teardown, after
    /// the destruction worker has drained.
    pub(crate) fn destroy(&self, device: &ash::Device) {
        let mut pools = self.pools.lock();
        for (_, pool) in pools.map.drain() {
            for chunk in pool.drain() {
                log::warn!(
                    "leaked chunk: stride={}, count={}",
                    chunk.key.stride,
                    chunk.count
                );
                unsafe {
                    device.free_memory(chunk.memory, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // the spec's stride invariant: a power-of-two multiple of the alignment
    // that is >= the allocation size
    fn stride_for(alignment: vk::DeviceSize, size: vk::DeviceSize) -> vk::DeviceSize {
        let mut stride = alignment.max(1);
        while stride < size {
            stride *= 2;
        }
        stride
    }

    #[test]
    fn stride_is_power_of_two_multiple_of_alignment() {
        for (alignment, size) in [(256, 1), (256, 256), (256, 300), (64, 10000), (1, 7)] {
            let stride = stride_for(alignment, size);
            assert!(stride >= size);
            assert!(stride >= alignment);
            let multiple = stride / alignment.max(1);
            assert_eq!(stride % alignment.max(1), 0);
            assert!(multiple.is_power_of_two());
            // minimality: halving drops below the size (unless already at
            // the alignment)
            if stride > alignment {
                assert!(stride / 2 < size);
            }
        }
    }

    #[test]
    fn memory_info_starts_empty() {
        let mm = MemoryManager::new();
        assert_eq!(mm.memory_info(), MemoryInfo::default());
    }
}
