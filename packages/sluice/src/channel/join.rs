// joining / delegation part of a channel.
//
// joining redirects one channel's write path straight into another channel's
// ring. while the source still holds buffered bytes, a splice loop moves
// them ring-to-ring without an intermediate copy; once the source is drained
// its buffer is released (forced, no close required) and subsequent writes
// resolve the delegation chain and land in the destination directly.
//
// completion fires exactly once, whether the source drains normally or an
// error on either side cuts the join short. a failure cause crosses the
// join in both directions by closing the other channel with the same cause.

use super::{
    core::{Channel, Inner},
    error::{ChannelClosedError, WriteError},
    ring::RingBuffer,
    slot::WakerSlot,
    state::ChannelState,
};
use std::{
    future::Future,
    pin::Pin,
    ptr::null_mut,
    sync::atomic::{
        AtomicBool,
        Ordering::{AcqRel, Acquire},
    },
    task::{Context, Poll},
};

pub(crate) struct JoiningState {
    pub(crate) delegated_to: Channel,
    pub(crate) delegate_close: bool,
    done: AtomicBool,
    waiter: WakerSlot,
}

impl JoiningState {
    fn new(delegated_to: Channel, delegate_close: bool) -> Self {
        JoiningState {
            delegated_to,
            delegate_close,
            done: AtomicBool::new(false),
            waiter: WakerSlot::new(),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.done.load(Acquire)
    }

    // fire the completion signal. the swap makes it exactly-once no matter
    // how many paths race here.
    pub(crate) fn complete(&self) {
        if !self.done.swap(true, AcqRel) {
            trace!("join completed");
            self.waiter.resume();
        }
    }

    fn completion(&self) -> JoinCompletion<'_> {
        JoinCompletion { joined: self }
    }
}

struct JoinCompletion<'a> {
    joined: &'a JoiningState,
}

impl Future for JoinCompletion<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.joined.is_complete() {
            return Poll::Ready(());
        }
        if !self.joined.waiter.update(cx.waker()) {
            self.joined.waiter.install(cx.waker(), "join wait");
        }
        if self.joined.is_complete() {
            self.joined.waiter.take();
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl Channel {
    // record the delegation on `self` (the source). the pointer is
    // write-once; a second join on the same channel is a protocol
    // violation.
    fn setup_delegate_to(&self, delegate: &Channel, delegate_close: bool) -> &JoiningState {
        assert!(!self.ptr_eq(delegate), "cannot join a channel to itself");
        let joined = Box::into_raw(Box::new(JoiningState::new(delegate.clone(), delegate_close)));
        if self
            .0
            .joining
            .compare_exchange(null_mut(), joined, AcqRel, Acquire)
            .is_err()
        {
            // safety: nothing else ever saw this pointer.
            drop(unsafe { Box::from_raw(joined) });
            panic!("channel is already joined");
        }
        trace!(delegate_close, "joining byte channel");
        // safety: write-once, freed only when the last handle drops.
        let joined = unsafe { &*joined };
        match self.0.closed() {
            None => self.flush(),
            Some(closed) => match &closed.cause {
                Some(cause) => {
                    delegate.close_inner(Some(cause.clone()));
                }
                None if delegate_close && self.0.state.load() == ChannelState::Terminated => {
                    delegate.close_inner(None);
                }
                None => delegate.flush(),
            },
        }
        joined
    }

    // finish the join if the source has nothing left to give: release its
    // (drained) buffer, propagate close/flush to the delegate, and unpark
    // both sides so they observe the delegation.
    pub(crate) fn try_complete_joining(&self, joined: &JoiningState) -> bool {
        if !self.try_release_buffer(true) {
            return false;
        }
        self.ensure_closed_joined(joined);
        self.0.read_op.resume();
        // unguarded on purpose: the parked writer must wake up to delegate
        self.0.write_op.resume();
        true
    }

    // propagate the source's close across the join. when the delegate is
    // mid-write we are inside the splice loop and bytes are still in
    // flight, so a graceful close is deferred to the loop's finalization.
    pub(crate) fn ensure_closed_joined(&self, joined: &JoiningState) {
        let Some(closed) = self.0.closed() else {
            return;
        };
        if !joined.delegate_close {
            joined.delegated_to.flush();
            joined.complete();
            return;
        }
        let delegate_writing = matches!(
            joined.delegated_to.0.state.load(),
            ChannelState::Writing | ChannelState::ReadingWriting
        );
        if closed.cause.is_some() || !delegate_writing {
            joined.delegated_to.close_inner(closed.cause.clone());
        } else {
            joined.delegated_to.flush();
        }
        joined.complete();
    }

    // wait for this channel to be fully closed. on a joined channel that
    // means waiting for the join to complete.
    pub(crate) async fn await_close(&self) {
        if self.0.closed().is_some() {
            return;
        }
        if let Some(joined) = self.0.joining() {
            joined.completion().await;
        }
    }

    // join `src` into `self`: self becomes the delegate for all of src's
    // current and future bytes. returns once src is fully closed and
    // propagated.
    pub(crate) async fn join_from_impl(
        &self,
        src: &Channel,
        delegate_close: bool,
    ) -> Result<(), WriteError> {
        if src.0.closed().is_some() && src.0.state.load() == ChannelState::Terminated {
            if delegate_close {
                self.close_inner(src.0.closed_cause());
            }
            return Ok(());
        }
        if self.0.closed().is_some() {
            if src.0.closed().is_none() {
                // joining into a closed destination is a write
                if let Some(err) = self.write_closed_error() {
                    return Err(err);
                }
            }
            return Ok(());
        }
        let joined = src.setup_delegate_to(self, delegate_close);
        if src.try_complete_joining(joined) {
            src.await_close().await;
            return Ok(());
        }
        self.copy_direct(src, u64::MAX, Some(joined)).await?;
        if delegate_close && src.is_closed_for_read() {
            self.close_inner(None);
            return Ok(());
        }
        self.flush();
        src.await_close().await;
        Ok(())
    }

    // splice loop: move up to `limit` bytes from src's ring into ours,
    // suspending outside the critical sections whenever src runs dry or we
    // run out of space. a failure on src closes us with the same cause.
    pub(crate) async fn copy_direct(
        &self,
        src: &Channel,
        limit: u64,
        joined: Option<&JoiningState>,
    ) -> Result<u64, WriteError> {
        if let Some(cause) = src.0.closed_cause() {
            // the failure crosses the join; src's own close path fires the
            // completion signal
            self.close_inner(Some(cause));
            return Ok(0);
        }
        if src.is_closed_for_read() {
            if let Some(joined) = joined {
                assert!(src.try_complete_joining(joined));
            }
            return Ok(0);
        }
        if let Some(joined) = joined {
            if src.try_complete_joining(joined) {
                return Ok(0);
            }
        }
        let mut copied = 0u64;
        while copied < limit {
            // pump ring-to-ring until we fill up or src runs dry
            let moved = self.writing(|dst, dst_buffer| {
                let mut part = 0u64;
                while copied + part < limit {
                    match splice_chunk(dst, dst_buffer, src, limit - copied - part) {
                        Ok(0) => break,
                        Ok(n) => part += n as u64,
                        Err(()) => break,
                    }
                }
                part
            })?;
            // Ok(None): we are joined ourselves and fall through to the
            // write suspension below
            if let Some(part) = moved {
                copied += part;
            }
            // we are the src's reader, so re-surface a failure that landed
            // mid-pump
            if let Some(cause) = src.0.closed_cause() {
                self.close_inner(Some(cause.clone()));
                return Err(WriteError::Closed(ChannelClosedError { cause }));
            }
            if let Some(joined) = joined {
                if src.try_complete_joining(joined) {
                    break;
                }
                // promote anything the src writer staged but never flushed
                if src.0.capacity.flush() {
                    src.0.resume_write_op();
                    continue;
                }
            }
            if copied >= limit {
                break;
            }
            self.flush();
            if self.0.capacity.available_for_write() == 0
                && self.0.state.load() != ChannelState::IdleEmpty
            {
                self.write_suspend(1).await?;
                continue;
            }
            if src.0.capacity.available_for_read() == 0 {
                match src.read_suspend(1).await {
                    Ok(true) => {
                        if let Some(joined) = joined {
                            if src.try_complete_joining(joined) {
                                break;
                            }
                        }
                    }
                    Ok(false) => {
                        // src hit end of stream
                        match joined {
                            Some(joined) => {
                                if src.try_complete_joining(joined) {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    Err(err) => {
                        self.close_inner(Some(err.cause.clone()));
                        return Err(WriteError::Closed(err));
                    }
                }
            }
            if self.0.joining().is_some() {
                self.write_suspend(1).await?;
            }
        }
        if self.0.auto_flush {
            self.flush();
        }
        Ok(copied)
    }
}

// move one contiguous chunk from src's readable run into dst's claimed
// writable run. called inside dst's write critical section; enters (and
// leaves) src's read critical section itself. Ok(0) when either side has no
// room, Err(()) when src has nothing left to read from at all.
fn splice_chunk(
    dst: &Inner,
    dst_buffer: &RingBuffer,
    src: &Channel,
    limit: u64,
) -> Result<usize, ()> {
    let moved = src
        .reading(|src_inner, src_buffer| {
            let dst_pos = dst.write_pos.load(Acquire);
            let dst_run = dst.capacity.total() - dst_pos;
            let src_pos = src_inner.read_pos.load(Acquire);
            let src_run = src_inner.capacity.total() - src_pos;
            let want = (limit.min(usize::MAX as u64) as usize)
                .min(dst_run)
                .min(src_run)
                .min(src_inner.capacity.available_for_read());
            let n = dst.capacity.try_write_at_most(want);
            if n == 0 {
                return 0;
            }
            // we are the source's only reader, so its readable count
            // cannot have shrunk under us
            assert!(
                src_inner.capacity.try_read_exact(n),
                "joined source lost readable bytes"
            );
            // safety: both claims cover their contiguous runs
            unsafe {
                dst_buffer
                    .slice_mut(dst_pos, n)
                    .copy_from_slice(src_buffer.slice(src_pos, n));
            }
            src_inner.consumed(n);
            dst.produced(n);
            n
        })
        .map_err(|_| ())?;
    moved.ok_or(())
}
