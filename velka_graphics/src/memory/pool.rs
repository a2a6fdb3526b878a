use std::sync::{
    atomic::AtomicBool,
    Arc,
};

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;

use super::{
    chunk::Chunk,
    manager::MemoryInfo,
    Memory,
};

/// Pools are keyed by the memory type they allocate from and the slot stride.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub(crate) mt_index: u32,
    pub(crate) stride: vk::DeviceSize,
}

/// A list of chunks with identical `(count, stride, memory type)`.
pub(crate) struct Pool {
    pub(crate) key: PoolKey,
    pub(crate) count: u32,
    /// Serializes pool mutation. Only read or written while holding the
    /// manager's pool-map mutex; waiters block on the manager's pool condvar
    /// and must re-look-up the pool after waking.
    pub(crate) locked: AtomicBool,
    chunks: Mutex<Vec<Arc<Chunk>>>,
}

/// Slot count for a new pool: `count * stride` lands in [2 MB, 16 MB],
/// with at least one slot.
pub(crate) fn compute_pool_count(stride: vk::DeviceSize) -> u32 {
    const MB: vk::DeviceSize = 1024 * 1024;

    let mut count: vk::DeviceSize = 256;
    let size = stride * count;
    if size >= 16 * MB {
        count = 16 * MB / stride;
    } else if size < 2 * MB {
        count = 2 * MB / stride;
    }

    if count == 0 {
        count = 1;
    }

    count as u32
}

impl Pool {
    pub(crate) fn new(key: PoolKey, count: u32) -> Arc<Self> {
        Arc::new(Self {
            key,
            count,
            locked: AtomicBool::new(false),
            chunks: Mutex::new(Vec::new()),
        })
    }

    /// Allocate a slot from any chunk with capacity, creating a chunk when
    /// all existing chunks are full. The caller holds the pool lock.
    pub(crate) fn alloc(
        &self,
        device: &ash::Device,
        info: &Mutex<MemoryInfo>,
    ) -> Result<Memory> {
        let mut chunks = self.chunks.lock();

        for chunk in chunks.iter() {
            if chunk.slots.lock().available(self.count) > 0 {
                if let Some(memory) = chunk.alloc() {
                    let mut info = info.lock();
                    info.count_slots += 1;
                    info.size_slots += self.key.stride as usize;
                    return Ok(memory);
                }
            }
        }

        let chunk = Chunk::new(device, self.key, self.count)?;
        {
            let mut info = info.lock();
            info.count_chunks += 1;
            info.size_chunks += chunk.size();
        }

        let memory = match chunk.alloc() {
            Some(memory) => memory,
            None => {
                let mut info = info.lock();
                info.count_chunks -= 1;
                info.size_chunks -= chunk.size();
                drop(info);
                chunk.destroy(device);
                return Err(anyhow::anyhow!("empty chunk refused allocation"));
            }
        };

        chunks.push(chunk);

        {
            let mut info = info.lock();
            info.count_slots += 1;
            info.size_slots += self.key.stride as usize;
        }

        Ok(memory)
    }

    /// Return a slot to its chunk. An emptied chunk is detached and handed
    /// back for destruction. Returns `(emptied chunk, pool now empty)`.
    /// The caller holds the pool lock.
    pub(crate) fn free(
        &self,
        memory: Memory,
        shutdown: bool,
        info: &Mutex<MemoryInfo>,
    ) -> (Option<Arc<Chunk>>, bool) {
        let Memory { chunk, offset } = memory;

        {
            let mut info = info.lock();
            info.count_slots -= 1;
            info.size_slots -= self.key.stride as usize;
        }

        let emptied = chunk.slots.lock().free(offset, shutdown);

        let mut chunks = self.chunks.lock();
        let mut detached = None;
        if emptied {
            if let Some(index) = chunks.iter().position(|c| Arc::ptr_eq(c, &chunk)) {
                chunks.remove(index);
            }
            let mut info = info.lock();
            info.count_chunks -= 1;
            info.size_chunks -= chunk.size();
            detached = Some(chunk);
        }

        (detached, chunks.is_empty())
    }

    /// Detach every remaining chunk. Used at engine teardown.
    pub(crate) fn drain(&self) -> Vec<Arc<Chunk>> {
        std::mem::take(&mut *self.chunks.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: vk::DeviceSize = 1024 * 1024;

    #[test]
    fn pool_count_bounds() {
        // count * stride stays within [2 MB, 16 MB] for sane strides
        for stride in [64, 256, 4096, 65536, MB] {
            let count = compute_pool_count(stride);
            let size = stride * vk::DeviceSize::from(count);
            assert!(size >= 2 * MB, "stride={stride} size={size}");
            assert!(size <= 16 * MB, "stride={stride} size={size}");
        }
    }

    #[test]
    fn huge_stride_gets_single_slot() {
        assert_eq!(compute_pool_count(32 * MB), 1);
        assert_eq!(compute_pool_count(16 * MB), 1);
    }

    #[test]
    fn small_strides_fill_two_megabytes() {
        assert_eq!(compute_pool_count(64), 2 * MB as u32 / 64);
        // the default 256-slot count applies in the middle band
        assert_eq!(compute_pool_count(16 * 1024), 256);
    }
}
