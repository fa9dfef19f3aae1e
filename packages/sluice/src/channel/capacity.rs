// capacity tracker part of a channel.
//
// three atomic counters account for every byte of the ring: bytes available
// for read, bytes available for write, and bytes written but not yet flushed
// (not yet visible to the reader). bytes claimed by an in-flight operation
// are debited from a counter and belong to nobody until the matching
// complete_* call credits them back to the opposing side, so at all times:
//
//     read + write + pending + claimed == total
//
// every mutation is a compare-and-swap retry loop. no locks. this makes all
// operations safe to call from either the reader or the writer thread.

use std::sync::atomic::{
    AtomicUsize,
    Ordering::{AcqRel, Acquire, Release},
};

pub(crate) struct RingCapacity {
    avail_read: AtomicUsize,
    avail_write: AtomicUsize,
    pending_flush: AtomicUsize,
    total: usize,
}

impl RingCapacity {
    // construct in the fully-locked state: no bytes readable, no bytes
    // writable. a fresh channel has no buffer bound, so nothing may be
    // claimed until reset_for_write runs at bind time.
    pub(crate) fn new(total: usize) -> Self {
        RingCapacity {
            avail_read: AtomicUsize::new(0),
            avail_write: AtomicUsize::new(0),
            pending_flush: AtomicUsize::new(0),
            total,
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn available_for_read(&self) -> usize {
        self.avail_read.load(Acquire)
    }

    pub(crate) fn available_for_write(&self) -> usize {
        self.avail_write.load(Acquire)
    }

    // claim up to n readable bytes. returns how many were claimed, possibly
    // zero. a short claim is a normal partial success, never an error.
    pub(crate) fn try_read_at_most(&self, n: usize) -> usize {
        loop {
            let avail = self.avail_read.load(Acquire);
            let claim = avail.min(n);
            if claim == 0 {
                return 0;
            }
            if self
                .avail_read
                .compare_exchange(avail, avail - claim, AcqRel, Acquire)
                .is_ok()
            {
                return claim;
            }
        }
    }

    // claim exactly n readable bytes, or nothing.
    pub(crate) fn try_read_exact(&self, n: usize) -> bool {
        loop {
            let avail = self.avail_read.load(Acquire);
            if avail < n {
                return false;
            }
            if self
                .avail_read
                .compare_exchange(avail, avail - n, AcqRel, Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    // claim all readable bytes if at least n are available, else nothing.
    pub(crate) fn try_read_at_least(&self, n: usize) -> usize {
        loop {
            let avail = self.avail_read.load(Acquire);
            if avail < n || avail == 0 {
                return 0;
            }
            if self
                .avail_read
                .compare_exchange(avail, 0, AcqRel, Acquire)
                .is_ok()
            {
                return avail;
            }
        }
    }

    // commit a claimed read, crediting the bytes back to the write side.
    // also used to return the unused tail of a partially-consumed write
    // claim.
    pub(crate) fn complete_read(&self, n: usize) {
        if n == 0 {
            return;
        }
        loop {
            let avail = self.avail_write.load(Acquire);
            let new = avail + n;
            assert!(
                new <= self.total,
                "completed read of {} bytes overflows capacity",
                n,
            );
            if self
                .avail_write
                .compare_exchange(avail, new, AcqRel, Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    // claim up to n writable bytes.
    pub(crate) fn try_write_at_most(&self, n: usize) -> usize {
        loop {
            let avail = self.avail_write.load(Acquire);
            let claim = avail.min(n);
            if claim == 0 {
                return 0;
            }
            if self
                .avail_write
                .compare_exchange(avail, avail - claim, AcqRel, Acquire)
                .is_ok()
            {
                return claim;
            }
        }
    }

    // claim exactly n writable bytes, or nothing.
    pub(crate) fn try_write_exact(&self, n: usize) -> bool {
        loop {
            let avail = self.avail_write.load(Acquire);
            if avail < n {
                return false;
            }
            if self
                .avail_write
                .compare_exchange(avail, avail - n, AcqRel, Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    // claim all writable bytes if at least n are available, else nothing.
    pub(crate) fn try_write_at_least(&self, n: usize) -> usize {
        loop {
            let avail = self.avail_write.load(Acquire);
            if avail < n || avail == 0 {
                return 0;
            }
            if self
                .avail_write
                .compare_exchange(avail, 0, AcqRel, Acquire)
                .is_ok()
            {
                return avail;
            }
        }
    }

    // commit a claimed write. the bytes stay invisible to the reader until
    // flush promotes them. also used to return the unused tail of a
    // partially-consumed read claim.
    pub(crate) fn complete_write(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.pending_flush.fetch_add(n, AcqRel);
    }

    // return the unused tail of a read claim directly to the readable
    // count. the bytes were already visible, so they bypass the flush
    // stage.
    pub(crate) fn return_read(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.avail_read.fetch_add(n, AcqRel);
    }

    // promote all pending bytes into the readable count. returns whether any
    // bytes are readable afterwards.
    pub(crate) fn flush(&self) -> bool {
        let pending = self.pending_flush.swap(0, AcqRel);
        if pending == 0 {
            self.avail_read.load(Acquire) > 0
        } else {
            self.avail_read.fetch_add(pending, AcqRel) + pending > 0
        }
    }

    // nothing readable, nothing pending, nothing claimed.
    pub(crate) fn is_empty(&self) -> bool {
        self.avail_write.load(Acquire) == self.total
    }

    pub(crate) fn is_full(&self) -> bool {
        self.avail_write.load(Acquire) == 0
    }

    // one-way gate to hand the buffer back to the pool: succeeds only when
    // the buffer is fully drained with nothing claimed and nothing pending.
    // afterwards no claim can succeed until reset_for_write.
    pub(crate) fn try_lock_for_release(&self) -> bool {
        loop {
            if self.avail_read.load(Acquire) != 0 || self.pending_flush.load(Acquire) != 0 {
                return false;
            }
            let avail = self.avail_write.load(Acquire);
            if avail != self.total {
                return false;
            }
            if self
                .avail_write
                .compare_exchange(avail, 0, AcqRel, Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    // error-path lock: stops further write claims without honoring
    // outstanding state. only valid once the channel is closing with a
    // failure cause.
    pub(crate) fn force_lock_for_release(&self) {
        self.avail_write.swap(0, AcqRel);
    }

    // rearm the tracker for a freshly bound (or unlocked) buffer. callers
    // must hold exclusive access to the buffer binding.
    pub(crate) fn reset_for_write(&self) {
        self.avail_read.store(0, Release);
        self.pending_flush.store(0, Release);
        self.avail_write.store(self.total, Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_claims_never_overclaim() {
        let cap = RingCapacity::new(16);
        cap.reset_for_write();

        assert_eq!(cap.try_write_at_most(10), 10);
        assert_eq!(cap.try_write_at_most(10), 6);
        assert_eq!(cap.try_write_at_most(10), 0);

        cap.complete_write(16);
        assert!(cap.flush());
        assert_eq!(cap.available_for_read(), 16);

        assert_eq!(cap.try_read_at_most(100), 16);
        assert_eq!(cap.try_read_at_most(1), 0);
        cap.complete_read(16);
        assert!(cap.is_empty());
    }

    #[test]
    fn exact_claims_are_all_or_nothing() {
        let cap = RingCapacity::new(8);
        cap.reset_for_write();

        assert!(!cap.try_write_exact(9));
        assert!(cap.try_write_exact(8));
        assert!(!cap.try_write_exact(1));
        cap.complete_write(8);
        cap.flush();

        assert!(!cap.try_read_exact(9));
        assert!(cap.try_read_exact(3));
        assert!(cap.try_read_exact(5));
        assert!(!cap.try_read_exact(1));
    }

    #[test]
    fn unflushed_bytes_stay_invisible() {
        let cap = RingCapacity::new(8);
        cap.reset_for_write();

        assert_eq!(cap.try_write_at_most(4), 4);
        cap.complete_write(4);
        assert_eq!(cap.available_for_read(), 0);
        assert!(cap.flush());
        assert_eq!(cap.available_for_read(), 4);
    }

    #[test]
    fn lock_for_release_requires_fully_drained() {
        let cap = RingCapacity::new(8);
        cap.reset_for_write();

        // claimed bytes block the lock
        assert_eq!(cap.try_write_at_most(2), 2);
        assert!(!cap.try_lock_for_release());
        cap.complete_write(2);

        // pending bytes block the lock
        assert!(!cap.try_lock_for_release());
        cap.flush();

        // readable bytes block the lock
        assert!(!cap.try_lock_for_release());
        assert!(cap.try_read_exact(2));
        cap.complete_read(2);

        assert!(cap.try_lock_for_release());
        // locked: no further claims succeed
        assert_eq!(cap.try_write_at_most(1), 0);
        assert!(!cap.try_lock_for_release());
    }

    #[test]
    fn returned_read_claim_stays_visible() {
        let cap = RingCapacity::new(8);
        cap.reset_for_write();
        assert_eq!(cap.try_write_at_most(8), 8);
        cap.complete_write(8);
        cap.flush();

        // claim everything, consume 2, hand the rest back
        assert_eq!(cap.try_read_at_least(1), 8);
        cap.complete_read(2);
        cap.return_read(6);
        assert_eq!(cap.available_for_read(), 6);
        assert_eq!(cap.available_for_write(), 2);
    }

    #[test]
    fn returned_reservation_is_not_lost() {
        let cap = RingCapacity::new(8);
        cap.reset_for_write();

        let locked = cap.try_write_at_least(1);
        assert_eq!(locked, 8);
        // use 3 of the 8, return the rest
        cap.complete_write(3);
        cap.complete_read(locked - 3);
        assert_eq!(cap.available_for_write(), 5);
        cap.flush();
        assert_eq!(cap.available_for_read(), 3);
    }
}
