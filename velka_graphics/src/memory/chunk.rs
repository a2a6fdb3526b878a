use std::sync::{atomic::AtomicBool, Arc};

use anyhow::{Context, Result};
use ash::vk::{self, Handle};
use parking_lot::Mutex;

use super::{pool::PoolKey, Memory};

/// Number of stripes for chunk locking. A chunk picks its stripe by hashing
/// its backing allocation handle, so unrelated chunks rarely contend.
pub(crate) const CHUNK_STRIPES: usize = 8;

/// One `vkAllocateMemory` of `count * stride` bytes, sub-divided into slots.
pub(crate) struct Chunk {
    pub(crate) key: PoolKey,
    pub(crate) count: u32,
    pub(crate) memory: vk::DeviceMemory,
    /// Stripe index in `[0, CHUNK_STRIPES)`.
    pub(crate) updater: usize,
    /// Map/copy exclusion flag. Only read or written while holding the
    /// manager's stripe mutex for `updater`.
    pub(crate) locked: AtomicBool,
    pub(crate) slots: Mutex<ChunkSlots>,
}

/// Slot bookkeeping: a high-water mark plus a free list of retired offsets.
#[derive(Default)]
pub(crate) struct ChunkSlots {
    pub(crate) slot: u32,
    pub(crate) usecount: u32,
    pub(crate) free: Vec<vk::DeviceSize>,
}

impl ChunkSlots {
    /// Slots still available: retired offsets plus never-used slots.
    pub(crate) fn available(&self, count: u32) -> u32 {
        self.free.len() as u32 + (count - self.slot)
    }

    /// Take a slot offset, preferring retired slots.
    pub(crate) fn alloc(&mut self, count: u32, stride: vk::DeviceSize) -> Option<vk::DeviceSize> {
        if let Some(offset) = self.free.pop() {
            self.usecount += 1;
            return Some(offset);
        }

        if self.slot == count {
            return None;
        }

        let offset = vk::DeviceSize::from(self.slot) * stride;
        self.slot += 1;
        self.usecount += 1;
        Some(offset)
    }

    /// Return a slot. During shutdown the offset is discarded instead of
    /// retained for reuse. Returns true when the chunk has emptied.
    pub(crate) fn free(&mut self, offset: vk::DeviceSize, shutdown: bool) -> bool {
        self.usecount -= 1;
        if !shutdown {
            self.free.push(offset);
        }
        self.usecount == 0
    }
}

impl Chunk {
    pub(crate) fn new(device: &ash::Device, key: PoolKey, count: u32) -> Result<Arc<Self>> {
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(key.stride * vk::DeviceSize::from(count))
            .memory_type_index(key.mt_index);

        let memory = unsafe {
            device
                .allocate_memory(&alloc_info, None)
                .context("vkAllocateMemory failed")?
        };

        let updater = (memory.as_raw().count_ones() as usize) % CHUNK_STRIPES;

        Ok(Arc::new(Self {
            key,
            count,
            memory,
            updater,
            locked: AtomicBool::new(false),
            slots: Mutex::new(ChunkSlots::default()),
        }))
    }

    pub(crate) fn size(&self) -> usize {
        (self.key.stride * vk::DeviceSize::from(self.count)) as usize
    }

    /// Take a slot from this chunk, or `None` when full.
    pub(crate) fn alloc(self: &Arc<Self>) -> Option<Memory> {
        let offset = self.slots.lock().alloc(self.count, self.key.stride)?;
        Some(Memory {
            chunk: self.clone(),
            offset,
        })
    }

    /// Release the backing allocation. Called exactly once by the manager,
    /// after the chunk is unreachable from its pool.
    pub(crate) fn destroy(&self, device: &ash::Device) {
        debug_assert_eq!(self.slots.lock().usecount, 0);
        unsafe {
            device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_prefer_retired_offsets() {
        let stride = 256;
        let count = 4;
        let mut slots = ChunkSlots::default();

        let a = slots.alloc(count, stride).unwrap();
        let b = slots.alloc(count, stride).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 256);
        assert_eq!(slots.usecount, 2);

        assert!(!slots.free(a, false));
        assert_eq!(slots.available(count), 3);

        // the retired offset comes back before the high-water mark moves
        let c = slots.alloc(count, stride).unwrap();
        assert_eq!(c, a);
        assert_eq!(slots.slot, 2);
    }

    #[test]
    fn chunk_empties_when_last_slot_returns() {
        let mut slots = ChunkSlots::default();
        let a = slots.alloc(2, 64).unwrap();
        let b = slots.alloc(2, 64).unwrap();
        assert!(!slots.free(a, false));
        assert!(slots.free(b, false));
        assert_eq!(slots.free.len(), 2);
    }

    #[test]
    fn shutdown_free_discards_slots() {
        let mut slots = ChunkSlots::default();
        let a = slots.alloc(2, 64).unwrap();
        assert!(slots.free(a, true));
        assert!(slots.free.is_empty());
    }

    #[test]
    fn full_chunk_refuses_allocation() {
        let mut slots = ChunkSlots::default();
        assert!(slots.alloc(1, 64).is_some());
        assert!(slots.alloc(1, 64).is_none());
        assert_eq!(slots.available(1), 0);
    }
}
