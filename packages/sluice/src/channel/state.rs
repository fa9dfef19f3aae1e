// channel lifecycle state machine part of a channel.
//
// a single atomic byte encodes which sides are currently inside a critical
// section against the ring buffer, whether the buffer holds unread bytes,
// and whether the channel has terminated. the table:
//
//     IdleEmpty ------ no buffer bound, nothing to read
//     IdleNonEmpty --- buffer bound, may hold readable bytes, nobody inside
//     Reading -------- reader inside its critical section
//     Writing -------- writer inside its critical section
//     ReadingWriting - both inside at once
//     Releasing ------ transient: buffer being unbound and recycled
//     Terminated ----- closed with nothing left to read; buffer gone
//
// Releasing exists so the release path can take the buffer pointer with
// exclusivity: a side that observes it retries its entry rather than
// entering a critical section against a buffer that may be gone by the
// time it dereferences it.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ChannelState {
    IdleEmpty = 0,
    IdleNonEmpty = 1,
    Reading = 2,
    Writing = 3,
    ReadingWriting = 4,
    Releasing = 5,
    Terminated = 6,
}

use ChannelState::*;

// outcome of attempting to enter a critical section from a given state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StartOp {
    // CAS to the given state and proceed
    Enter(ChannelState),
    // nothing to do from this state (empty / terminated)
    None,
    // transient state, re-load and try again
    Retry,
    // a second concurrent operation on the same side
    Violation,
}

impl ChannelState {
    pub(crate) fn try_start_reading(self) -> StartOp {
        match self {
            IdleNonEmpty => StartOp::Enter(Reading),
            Writing => StartOp::Enter(ReadingWriting),
            IdleEmpty | Terminated => StartOp::None,
            Releasing => StartOp::Retry,
            Reading | ReadingWriting => StartOp::Violation,
        }
    }

    pub(crate) fn try_start_writing(self) -> StartOp {
        match self {
            // entering from IdleEmpty is the bind point: the winner of this
            // CAS must attach a buffer before touching positions
            IdleEmpty | IdleNonEmpty => StartOp::Enter(Writing),
            Reading => StartOp::Enter(ReadingWriting),
            Terminated => StartOp::None,
            Releasing => StartOp::Retry,
            Writing | ReadingWriting => StartOp::Violation,
        }
    }

    pub(crate) fn stop_reading(self) -> ChannelState {
        match self {
            Reading => IdleNonEmpty,
            ReadingWriting => Writing,
            _ => unreachable!("stop_reading from {:?}", self),
        }
    }

    pub(crate) fn stop_writing(self) -> ChannelState {
        match self {
            Writing => IdleNonEmpty,
            ReadingWriting => Reading,
            _ => unreachable!("stop_writing from {:?}", self),
        }
    }

    pub(crate) fn is_idle(self) -> bool {
        matches!(self, IdleEmpty | IdleNonEmpty)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => IdleEmpty,
            1 => IdleNonEmpty,
            2 => Reading,
            3 => Writing,
            4 => ReadingWriting,
            5 => Releasing,
            6 => Terminated,
            _ => unreachable!(),
        }
    }
}

use std::sync::atomic::{
    AtomicU8,
    Ordering::{AcqRel, Acquire},
};

pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) const fn new(state: ChannelState) -> Self {
        AtomicState(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Acquire))
    }

    pub(crate) fn compare_exchange(
        &self,
        current: ChannelState,
        new: ChannelState,
    ) -> Result<(), ChannelState> {
        self.0
            .compare_exchange(current as u8, new as u8, AcqRel, Acquire)
            .map(|_| ())
            .map_err(ChannelState::from_u8)
    }

    pub(crate) fn store(&self, state: ChannelState) {
        self.0.store(state as u8, std::sync::atomic::Ordering::Release);
    }
}
