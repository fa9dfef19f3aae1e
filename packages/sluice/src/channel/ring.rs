// ring storage part of a channel.
//
// a fixed block of `nominal + RESERVED_SIZE` bytes. the nominal range is the
// ring proper; the reserved tail past it stages multi-byte values that would
// otherwise straddle the wrap point, so scalar encode/decode is always a
// single contiguous memory access:
//
//   - a read whose bytes wrap first `roll`s the wrapped front bytes into the
//     tail, making [read_pos, read_pos + width) contiguous.
//   - a write whose bytes wrap is written contiguously past the nominal
//     limit into the tail, then `carry` copies the overflow back to the
//     front before the write is committed.
//
// the raw accessors are unsafe: the caller must hold a capacity-tracker
// claim covering the touched range, and must be inside the Reading/Writing
// state that keeps the buffer bound. under that protocol the reader and
// writer never touch overlapping bytes, even when running in parallel.

use std::cell::UnsafeCell;

// sized for the widest supported scalar (u64 / f64 are 8 bytes). a value of
// any supported width can therefore always be staged contiguously.
pub(crate) const RESERVED_SIZE: usize = 8;

// nominal capacity of pooled buffers. together with the reserved tail this
// makes the allocation an even 4096 bytes.
pub(crate) const DEFAULT_CAPACITY: usize = 4088;

pub(crate) struct RingBuffer {
    bytes: UnsafeCell<Box<[u8]>>,
    nominal: usize,
}

// safety: all mutation goes through the unsafe accessors below, whose
// contract guarantees disjoint ranges for concurrent callers.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub(crate) fn new(nominal: usize) -> Self {
        assert!(nominal >= RESERVED_SIZE, "capacity too small");
        RingBuffer {
            bytes: UnsafeCell::new(vec![0u8; nominal + RESERVED_SIZE].into_boxed_slice()),
            nominal,
        }
    }

    pub(crate) fn nominal(&self) -> usize {
        self.nominal
    }

    fn ptr(&self) -> *mut u8 {
        // safety: we only ever take the base pointer here; actual access is
        // range-checked and claim-guarded by the unsafe callers.
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    // borrow `len` bytes starting at `pos` (which may extend into the
    // reserved tail, never past it).
    //
    // safety: the caller must hold a read claim covering the range, and the
    // returned slice must not outlive that claim.
    pub(crate) unsafe fn slice(&self, pos: usize, len: usize) -> &[u8] {
        debug_assert!(pos + len <= self.nominal + RESERVED_SIZE);
        std::slice::from_raw_parts(self.ptr().add(pos), len)
    }

    // mutably borrow `len` bytes starting at `pos`.
    //
    // safety: the caller must hold a write claim covering the range, and the
    // returned slice must not outlive that claim.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, pos: usize, len: usize) -> &mut [u8] {
        debug_assert!(pos + len <= self.nominal + RESERVED_SIZE);
        std::slice::from_raw_parts_mut(self.ptr().add(pos), len)
    }

    // copy `src` into the ring at `pos`.
    //
    // safety: same contract as slice_mut.
    pub(crate) unsafe fn copy_in(&self, pos: usize, src: &[u8]) {
        self.slice_mut(pos, src.len()).copy_from_slice(src);
    }

    // copy `dst.len()` bytes out of the ring at `pos`.
    //
    // safety: same contract as slice.
    pub(crate) unsafe fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        dst.copy_from_slice(self.slice(pos, dst.len()));
    }

    // stage the first `n` bytes of the ring into the reserved tail, so a
    // read that wraps becomes contiguous.
    //
    // safety: the caller must hold a read claim covering both the wrapped
    // front bytes and the range being read.
    pub(crate) unsafe fn roll(&self, n: usize) {
        debug_assert!(n <= RESERVED_SIZE);
        let ptr = self.ptr();
        std::ptr::copy_nonoverlapping(ptr, ptr.add(self.nominal), n);
    }

    // copy bytes staged past the nominal limit back to the front of the
    // ring. `end` is the position one past the last staged byte.
    //
    // safety: the caller must hold a write claim covering both the staged
    // tail bytes and the front bytes they land on.
    pub(crate) unsafe fn carry(&self, end: usize) {
        debug_assert!(end > self.nominal && end <= self.nominal + RESERVED_SIZE);
        let ptr = self.ptr();
        std::ptr::copy_nonoverlapping(ptr.add(self.nominal), ptr, end - self.nominal);
    }
}

// wrap a cursor back into the nominal range after advancing it.
pub(crate) fn carry_index(nominal: usize, idx: usize) -> usize {
    if idx >= nominal {
        idx - nominal
    } else {
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_moves_staged_tail_to_front() {
        let ring = RingBuffer::new(16);
        unsafe {
            // a 4-byte value written at position 14 straddles the wrap
            ring.copy_in(14, &[0xde, 0xad, 0xbe, 0xef]);
            ring.carry(18);
            assert_eq!(ring.slice(14, 2), &[0xde, 0xad]);
            assert_eq!(ring.slice(0, 2), &[0xbe, 0xef]);
        }
    }

    #[test]
    fn roll_makes_wrapped_read_contiguous() {
        let ring = RingBuffer::new(16);
        unsafe {
            ring.copy_in(14, &[0x01, 0x02]);
            ring.copy_in(0, &[0x03, 0x04]);
            ring.roll(2);
            assert_eq!(ring.slice(14, 4), &[0x01, 0x02, 0x03, 0x04]);
        }
    }

    #[test]
    fn carry_index_wraps_once() {
        assert_eq!(carry_index(16, 15), 15);
        assert_eq!(carry_index(16, 16), 0);
        assert_eq!(carry_index(16, 19), 3);
    }
}
