// continuation slot part of a channel.
//
// a single-occupancy register for one suspended operation's waker. each
// channel holds exactly two: one for the at-most-one pending read, one for
// the at-most-one pending write. the slot is a tiny state machine driven by
// compare-and-swap:
//
//     Empty --install--> Busy --publish--> Full
//     Full --take-->     Busy --publish--> Empty
//
// installing over a foreign occupant is a protocol violation (a second
// concurrent reader or writer) and panics rather than silently queueing.
// the resumer that wins the Full -> Busy race owns the waker, so resumption
// is exactly-once by construction; a losing resumer observes Empty or Busy
// and does nothing.

use std::{
    cell::UnsafeCell,
    sync::atomic::{
        AtomicU8,
        Ordering::{AcqRel, Acquire, Release},
    },
    task::Waker,
};

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const FULL: u8 = 2;

pub(crate) struct WakerSlot {
    state: AtomicU8,
    // initialized iff state is FULL. the thread that transitions FULL -> BUSY
    // claims the right to take it; the thread that transitions EMPTY -> BUSY
    // claims the right to store it.
    waker: UnsafeCell<Option<Waker>>,
}

// safety: the waker cell is only touched by whichever thread holds the BUSY
// transition, per the protocol above.
unsafe impl Send for WakerSlot {}
unsafe impl Sync for WakerSlot {}

impl WakerSlot {
    pub(crate) const fn new() -> Self {
        WakerSlot {
            state: AtomicU8::new(EMPTY),
            waker: UnsafeCell::new(None),
        }
    }

    // whether a suspended operation is currently parked here.
    pub(crate) fn is_installed(&self) -> bool {
        self.state.load(Acquire) == FULL
    }

    // park a waker in the slot. panics if a foreign operation already
    // occupies it. after a successful install the caller must re-check its
    // wakeup predicate and uninstall if it already holds, to close the race
    // where the predicate became true between the first check and the
    // install.
    pub(crate) fn install(&self, waker: &Waker, what: &'static str) {
        loop {
            match self
                .state
                .compare_exchange(EMPTY, BUSY, AcqRel, Acquire)
            {
                Ok(_) => {
                    // safety: we hold the EMPTY -> BUSY transition.
                    unsafe { *self.waker.get() = Some(waker.clone()) };
                    self.state.store(FULL, Release);
                    return;
                }
                Err(BUSY) => {
                    // occupant is mid-transition; it resolves in a few
                    // instructions either way
                    std::hint::spin_loop();
                }
                Err(_) => panic!("{what} operation is already in progress"),
            }
        }
    }

    // swap the parked waker for a fresh one, for repolls of the same
    // suspended operation. returns false if the slot emptied in the
    // meantime (we were resumed concurrently); the caller should re-check
    // its predicate and re-install if still unsatisfied.
    pub(crate) fn update(&self, waker: &Waker) -> bool {
        loop {
            match self
                .state
                .compare_exchange(FULL, BUSY, AcqRel, Acquire)
            {
                Ok(_) => {
                    // safety: we hold the FULL -> BUSY transition.
                    unsafe { *self.waker.get() = Some(waker.clone()) };
                    self.state.store(FULL, Release);
                    return true;
                }
                Err(EMPTY) => return false,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    // take the parked waker, if any. the winner of the FULL -> BUSY race is
    // the unique resumer.
    pub(crate) fn take(&self) -> Option<Waker> {
        loop {
            match self
                .state
                .compare_exchange(FULL, BUSY, AcqRel, Acquire)
            {
                Ok(_) => {
                    // safety: we hold the FULL -> BUSY transition.
                    let waker = unsafe { (*self.waker.get()).take() };
                    self.state.store(EMPTY, Release);
                    return waker;
                }
                // Empty: nothing parked. Busy: either an install about to
                // re-check its predicate, or another resumer that already
                // owns the waker. in both cases resumption is not ours.
                Err(EMPTY) | Err(BUSY) => return None,
                Err(_) => unreachable!(),
            }
        }
    }

    // take and wake. returns whether a parked operation was resumed.
    pub(crate) fn resume(&self) -> bool {
        if let Some(waker) = self.take() {
            waker.wake();
            true
        } else {
            false
        }
    }
}
