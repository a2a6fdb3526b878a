//! Slab-pooled device memory.
//!
//! Raw device memory is carved into fixed-stride slots. A [`chunk::Chunk`] is
//! one `vkAllocateMemory` of `count * stride` bytes; a [`pool::Pool`] groups
//! chunks with identical `(memory type, stride)`; the [`MemoryManager`] maps
//! pool keys to pools and serializes pool mutation. A [`Memory`] is a handle
//! to one slot.

pub(crate) mod chunk;
pub(crate) mod manager;
pub(crate) mod pool;

use std::sync::Arc;

use ash::vk;

pub use manager::MemoryInfo;
pub(crate) use manager::MemoryManager;

/// A sub-allocation: an owning chunk plus a byte offset within it.
/// Not an allocation itself; freeing goes through the memory manager.
pub(crate) struct Memory {
    pub(crate) chunk: Arc<chunk::Chunk>,
    pub(crate) offset: vk::DeviceSize,
}
