// buffer pool part of a channel.
//
// a fixed array of atomic slots holding spare default-capacity ring buffers,
// so channels churn through buffers without hitting the allocator. claim and
// release are single atomic swaps; no locks. the tracker/cursor state that
// accompanies a buffer lives on the channel and is explicitly reset at bind
// time, so a recycled buffer carries no stale accounting.

use super::ring::{RingBuffer, DEFAULT_CAPACITY};
use std::{
    ptr::null_mut,
    sync::atomic::{
        AtomicPtr,
        Ordering::{AcqRel, Relaxed},
    },
};

const POOL_SLOTS: usize = 16;

pub(crate) struct BufferPool {
    slots: [AtomicPtr<RingBuffer>; POOL_SLOTS],
}

// process-wide pool for pooled (default-capacity) channels. channels with a
// custom capacity allocate directly and never touch this.
pub(crate) static BUFFER_POOL: BufferPool = BufferPool::new();

impl BufferPool {
    const fn new() -> Self {
        BufferPool {
            slots: [const { AtomicPtr::new(null_mut()) }; POOL_SLOTS],
        }
    }

    // claim a pooled buffer, or allocate a fresh one if the pool is dry.
    pub(crate) fn borrow(&self) -> Box<RingBuffer> {
        for slot in &self.slots {
            // cheap pre-check avoids a swap on empty slots
            if slot.load(Relaxed).is_null() {
                continue;
            }
            let ptr = slot.swap(null_mut(), AcqRel);
            if !ptr.is_null() {
                trace!("reusing pooled ring buffer");
                // safety: the swap transferred sole ownership to us.
                return unsafe { Box::from_raw(ptr) };
            }
        }
        trace!("allocating new ring buffer");
        Box::new(RingBuffer::new(DEFAULT_CAPACITY))
    }

    // hand a buffer back. dropped on the floor if every slot is taken.
    pub(crate) fn recycle(&self, buffer: Box<RingBuffer>) {
        debug_assert_eq!(buffer.nominal(), DEFAULT_CAPACITY);
        let ptr = Box::into_raw(buffer);
        for slot in &self.slots {
            if slot
                .compare_exchange(null_mut(), ptr, AcqRel, Relaxed)
                .is_ok()
            {
                return;
            }
        }
        // safety: no slot accepted the pointer, so we still own it.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            let ptr = slot.swap(null_mut(), AcqRel);
            if !ptr.is_null() {
                // safety: sole ownership, same as borrow.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_buffer_is_reused() {
        let pool = BufferPool::new();
        let first = pool.borrow();
        let first_addr = first.as_ref() as *const RingBuffer as usize;
        pool.recycle(first);
        let second = pool.borrow();
        assert_eq!(second.as_ref() as *const RingBuffer as usize, first_addr);
    }

    #[test]
    fn overflow_is_dropped_not_leaked() {
        let pool = BufferPool::new();
        let keep: Vec<_> = (0..POOL_SLOTS + 2).map(|_| pool.borrow()).collect();
        for buffer in keep {
            // the last two recycles find no free slot and drop
            pool.recycle(buffer);
        }
        for _ in 0..POOL_SLOTS {
            let _ = pool.borrow();
        }
    }
}
