//! Fixed-block packet buffer pool.
//!
//! The pool owns a growable chain of blocks, each a contiguous array of
//! packet-sized buffers tracked by a free-index stack. `allocate` hands out a
//! reference-counted `Slot`; when the last reference drops the buffer returns
//! to its block's free list. Empty blocks are retained until an explicit
//! `prune`.

use crate::logging::{self, Logger};
use crate::support::{Error, ErrorKind, ProtocolResult};
use crate::sync::{LockCell, LockStrategy};
use std::fmt;
use std::slice;
use std::sync::Arc;

struct Block {
    data: Box<[u8]>,
    free: Vec<u16>,
}

impl Block {
    fn new(buffer_size: usize, block_capacity: usize) -> ProtocolResult<Block> {
        let total = buffer_size * block_capacity;

        let mut data = Vec::new();
        data.try_reserve_exact(total).map_err(|_| {
            Error::new(
                ErrorKind::InsufficientBufferSize,
                "unable to allocate a new pool block",
            )
        })?;
        data.resize(total, 0);

        // Hand buffers out from index 0 upward.
        let free = (0..block_capacity as u16).rev().collect();

        Ok(Block {
            data: data.into_boxed_slice(),
            free,
        })
    }
}

struct PoolCore {
    blocks: Vec<Option<Block>>,
    allocated: usize,
}

struct PoolInner {
    core: LockCell<PoolCore>,
    buffer_size: usize,
    block_capacity: usize,
    log: Logger,
}

impl PoolInner {
    fn release(&self, block: usize, index: u16) {
        let mut core = self.core.lock();

        let entry = core.blocks[block]
            .as_mut()
            .expect("Released a slot into a pruned block");
        entry.free.push(index);

        core.allocated -= 1;
    }
}

/// Shared handle to the packet pool. Cloning is cheap; all clones allocate
/// from the same block chain.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// A pool handing out `buffer_size` byte buffers in blocks of
    /// `block_capacity`. With `LockStrategy::SingleThread` the pool must not
    /// be shared across threads.
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        buffer_size: usize,
        block_capacity: usize,
        strategy: LockStrategy,
        log: L,
    ) -> Pool {
        assert!(buffer_size > 0, "Pool buffer size must be non-zero");
        assert!(block_capacity > 0, "Pool block capacity must be non-zero");
        assert!(
            block_capacity <= u16::max_value() as usize,
            "Pool block capacity must fit the free index width"
        );

        Pool {
            inner: Arc::new(PoolInner {
                core: LockCell::new(
                    PoolCore {
                        blocks: Vec::new(),
                        allocated: 0,
                    },
                    strategy,
                ),
                buffer_size,
                block_capacity,
                log: logging::child(log),
            }),
        }
    }

    /// Allocate a slot. Grows the block chain when every existing block is
    /// full; fails only if the host is out of memory.
    pub fn allocate(&self) -> ProtocolResult<Slot> {
        let inner = &self.inner;
        let mut core = inner.core.lock();

        let block_idx = match core
            .blocks
            .iter()
            .position(|entry| entry.as_ref().map_or(false, |block| !block.free.is_empty()))
        {
            Some(idx) => idx,
            None => {
                let block = Block::new(inner.buffer_size, inner.block_capacity)?;

                let idx = match core.blocks.iter().position(Option::is_none) {
                    Some(gap) => {
                        core.blocks[gap] = Some(block);
                        gap
                    }
                    None => {
                        core.blocks.push(Some(block));
                        core.blocks.len() - 1
                    }
                };

                logging::debug!(inner.log, "pool grown";
                                "context" => "allocate",
                                "block" => idx,
                                "block_capacity" => inner.block_capacity);
                idx
            }
        };

        let entry = core.blocks[block_idx]
            .as_mut()
            .expect("Allocation targeted a pruned block");
        let index = entry.free.pop().expect("Allocation targeted a full block");
        let ptr = unsafe {
            entry
                .data
                .as_mut_ptr()
                .add(index as usize * inner.buffer_size)
        };

        core.allocated += 1;

        Ok(Slot {
            inner: Arc::new(SlotInner {
                pool: inner.clone(),
                block: block_idx,
                index,
                ptr,
                capacity: inner.buffer_size,
            }),
        })
    }

    /// Number of slots currently allocated.
    #[inline]
    pub fn size(&self) -> usize {
        self.inner.core.lock().allocated
    }

    /// Total buffer count across live blocks.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.blocks() * self.inner.block_capacity
    }

    /// Number of live blocks.
    #[inline]
    pub fn blocks(&self) -> usize {
        self.inner
            .core
            .lock()
            .blocks
            .iter()
            .filter(|entry| entry.is_some())
            .count()
    }

    /// Free buffers available without growing.
    #[inline]
    pub fn available(&self) -> usize {
        self.inner
            .core
            .lock()
            .blocks
            .iter()
            .filter_map(|entry| entry.as_ref())
            .map(|block| block.free.len())
            .sum()
    }

    /// Capacity of the buffers handed out by this pool.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Deallocates blocks that are entirely free.
    pub fn prune(&self) {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let block_capacity = inner.block_capacity;

        for (idx, entry) in core.blocks.iter_mut().enumerate() {
            let empty = entry
                .as_ref()
                .map_or(false, |block| block.free.len() == block_capacity);

            if empty {
                *entry = None;
                logging::debug!(inner.log, "pool block pruned";
                                "context" => "prune",
                                "block" => idx);
            }
        }
    }
}

struct SlotInner {
    pool: Arc<PoolInner>,
    block: usize,
    index: u16,
    ptr: *mut u8,
    capacity: usize,
}

impl Drop for SlotInner {
    #[inline]
    fn drop(&mut self) {
        self.pool.release(self.block, self.index);
    }
}

// The buffer behind `ptr` is exclusively owned by this slot while allocated,
// and the block that backs it cannot be pruned until the slot is released.
// Cross-thread sharing follows the pool's lock strategy contract.
unsafe impl Send for SlotInner {}
unsafe impl Sync for SlotInner {}

/// Reference-counted handle to one pool buffer. Clones share the buffer;
/// the buffer returns to the pool when the last clone drops.
#[derive(Clone)]
pub struct Slot {
    inner: Arc<SlotInner>,
}

impl Slot {
    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.inner.ptr, self.inner.capacity) }
    }

    /// Mutable view of the buffer. Only valid while this is the sole
    /// reference; packets are filled in place before they are shared.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert_eq!(
            Arc::strong_count(&self.inner),
            1,
            "Mutated a slot that is already shared"
        );

        unsafe { slice::from_raw_parts_mut(self.inner.ptr, self.inner.capacity) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.inner.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of live references to this buffer.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Slot(block: {}, index: {}, capacity: {})",
            self.inner.block, self.inner.index, self.inner.capacity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUFFER_SIZE: usize = 128;
    const BLOCK_CAPACITY: usize = 4;

    fn pool() -> Pool {
        Pool::new(BUFFER_SIZE, BLOCK_CAPACITY, LockStrategy::SingleThread, None)
    }

    #[test]
    fn test_allocate_write_read() {
        let pool = pool();

        let mut slot = pool.allocate().unwrap();

        assert_eq!(slot.capacity(), BUFFER_SIZE);
        assert_eq!(slot.data().len(), BUFFER_SIZE);

        slot.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(&slot.data()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_release_recycles_buffer() {
        let pool = pool();

        let first = pool.allocate().unwrap();
        assert_eq!(pool.size(), 1);

        drop(first);
        assert_eq!(pool.size(), 0);

        // The pool keeps a single block, so the recycled buffer satisfies
        // the next allocation without growth.
        let _second = pool.allocate().unwrap();
        assert_eq!(pool.blocks(), 1);
    }

    #[test]
    fn test_clone_shares_buffer() {
        let pool = pool();

        let slot = pool.allocate().unwrap();
        let shared = slot.clone();

        assert_eq!(slot.ref_count(), 2);
        assert_eq!(pool.size(), 1);

        drop(slot);
        assert_eq!(pool.size(), 1);

        drop(shared);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_growth_and_prune() {
        let pool = pool();

        // One more allocation than a single block holds.
        let mut slots: Vec<_> = (0..=BLOCK_CAPACITY).map(|_| pool.allocate().unwrap()).collect();

        assert_eq!(pool.blocks(), 2);
        assert_eq!(pool.capacity(), 2 * BLOCK_CAPACITY);
        assert_eq!(pool.size(), BLOCK_CAPACITY + 1);

        // Drop all but one; empty blocks survive until pruned.
        slots.truncate(1);
        assert_eq!(pool.blocks(), 2);

        pool.prune();
        assert_eq!(pool.blocks(), 1);

        slots.clear();
        pool.prune();
        assert_eq!(pool.blocks(), 0);
        assert_eq!(pool.capacity(), 0);
    }

    #[test]
    fn test_capacity_accounting() {
        let pool = pool();

        let mut capacity = pool.capacity();
        let mut slots = Vec::new();

        for _ in 0..BLOCK_CAPACITY * 3 {
            slots.push(pool.allocate().unwrap());

            // Capacity never shrinks across allocations and the books
            // always balance.
            assert!(pool.capacity() >= capacity);
            capacity = pool.capacity();

            assert_eq!(pool.size() + pool.available(), pool.capacity());
        }
    }

    #[test]
    fn test_buffers_are_distinct() {
        let pool = pool();

        let mut slots: Vec<_> = (0..BLOCK_CAPACITY).map(|_| pool.allocate().unwrap()).collect();

        for (value, slot) in slots.iter_mut().enumerate() {
            slot.data_mut()[0] = value as u8;
        }

        for (value, slot) in slots.iter().enumerate() {
            assert_eq!(slot.data()[0], value as u8);
        }
    }

    #[test]
    fn test_atomic_strategy_roundtrip() {
        let pool = Pool::new(BUFFER_SIZE, BLOCK_CAPACITY, LockStrategy::Atomic, None);

        let slot = pool.allocate().unwrap();
        assert_eq!(pool.size(), 1);

        drop(slot);
        assert_eq!(pool.size(), 0);
    }
}
