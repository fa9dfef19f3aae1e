// core engine of a channel.
//
// ties the leaf parts together: entering and leaving critical sections
// against the state machine, binding and releasing the ring buffer, moving
// bytes under capacity claims, flushing, closing, and parking/resuming the
// at-most-one suspended operation per direction.
//
// locking discipline: there are no locks. a side that wants the buffer CASes
// the state machine into its Reading/Writing tag, works against bytes its
// capacity claim covers, then CASes back out. the reader and the writer can
// be inside at the same time (ReadingWriting) because their claims never
// overlap. everything else (close marker, joining pointer, cursors, totals)
// is a single atomic word.

use super::{
    capacity::RingCapacity,
    error::{
        ChannelClosedError, CloseCause, ClosedForWriteError, ReadError, WriteError,
    },
    join::JoiningState,
    pool::BUFFER_POOL,
    ring::{carry_index, RingBuffer},
    slot::WakerSlot,
    state::{AtomicState, ChannelState, StartOp},
};
use std::{
    future::Future,
    pin::Pin,
    ptr::null_mut,
    sync::{
        atomic::{
            AtomicPtr, AtomicU64, AtomicUsize,
            Ordering::{AcqRel, Acquire, Release},
        },
        Arc,
    },
    task::{Context, Poll},
};

// close marker. written once behind an atomic pointer; freed when the last
// channel handle drops.
pub(crate) struct Closed {
    pub(crate) cause: Option<CloseCause>,
}

pub(crate) struct Inner {
    pub(crate) state: AtomicState,
    pub(crate) capacity: RingCapacity,
    // bound ring buffer. stored only by the writer after winning the bind,
    // taken only after winning a transition into Releasing, dereferenced
    // only inside a Reading/Writing critical section.
    pub(crate) buffer: AtomicPtr<RingBuffer>,
    // cursors into the ring. read_pos is advanced only by the reader,
    // write_pos only by the writer, each inside its critical section.
    pub(crate) read_pos: AtomicUsize,
    pub(crate) write_pos: AtomicUsize,
    pub(crate) total_read: AtomicU64,
    pub(crate) total_written: AtomicU64,
    pub(crate) closed: AtomicPtr<Closed>,
    pub(crate) joining: AtomicPtr<JoiningState>,
    pub(crate) read_op: WakerSlot,
    pub(crate) write_op: WakerSlot,
    pub(crate) auto_flush: bool,
    // whether the buffer comes from / returns to the shared pool
    pub(crate) pooled: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let buffer = std::mem::replace(self.buffer.get_mut(), null_mut());
        if !buffer.is_null() {
            // safety: no handles remain, so the pointer is exclusively ours.
            let buffer = unsafe { Box::from_raw(buffer) };
            if self.pooled {
                BUFFER_POOL.recycle(buffer);
            }
        }
        let closed = std::mem::replace(self.closed.get_mut(), null_mut());
        if !closed.is_null() {
            // safety: as above.
            drop(unsafe { Box::from_raw(closed) });
        }
        let joining = std::mem::replace(self.joining.get_mut(), null_mut());
        if !joining.is_null() {
            // safety: as above.
            drop(unsafe { Box::from_raw(joining) });
        }
    }
}

impl Inner {
    pub(crate) fn closed(&self) -> Option<&Closed> {
        let ptr = self.closed.load(Acquire);
        if ptr.is_null() {
            None
        } else {
            // safety: the marker is write-once and freed only in drop, when
            // no borrows of self can exist.
            Some(unsafe { &*ptr })
        }
    }

    pub(crate) fn closed_cause(&self) -> Option<CloseCause> {
        self.closed().and_then(|closed| closed.cause.clone())
    }

    pub(crate) fn joining(&self) -> Option<&JoiningState> {
        let ptr = self.joining.load(Acquire);
        if ptr.is_null() {
            None
        } else {
            // safety: write-once, freed only in drop.
            Some(unsafe { &*ptr })
        }
    }

    pub(crate) fn resume_read_op(&self) {
        self.read_op.resume();
    }

    // a joined source's writer stays parked until the source terminates and
    // delegation resolves; waking it earlier would just make it re-park.
    pub(crate) fn resume_write_op(&self) {
        if self.closed().is_none() && self.joining().is_some() {
            let state = self.state.load();
            if !matches!(
                state,
                ChannelState::Writing | ChannelState::ReadingWriting | ChannelState::Terminated
            ) {
                return;
            }
        }
        self.write_op.resume();
    }

    // commit `n` consumed bytes: advance the read cursor, credit the space
    // back to the writer, and wake it if it is parked.
    pub(crate) fn consumed(&self, n: usize) {
        if n == 0 {
            return;
        }
        let pos = self.read_pos.load(Acquire);
        self.read_pos
            .store(carry_index(self.capacity.total(), pos + n), Release);
        self.capacity.complete_read(n);
        self.total_read.fetch_add(n as u64, AcqRel);
        self.resume_write_op();
    }

    // commit `n` produced bytes: advance the write cursor and stage the
    // bytes for the next flush.
    pub(crate) fn produced(&self, n: usize) {
        if n == 0 {
            return;
        }
        let pos = self.write_pos.load(Acquire);
        self.write_pos
            .store(carry_index(self.capacity.total(), pos + n), Release);
        self.capacity.complete_write(n);
        self.total_written.fetch_add(n as u64, AcqRel);
    }

    // copy as many readable bytes as fit into dst. handles the wrap by
    // committing one contiguous run at a time.
    pub(crate) fn read_chunk(&self, buffer: &RingBuffer, dst: &mut [u8]) -> usize {
        let claimed = self.capacity.try_read_at_most(dst.len());
        let mut copied = 0;
        while copied < claimed {
            let pos = self.read_pos.load(Acquire);
            let run = (self.capacity.total() - pos).min(claimed - copied);
            // safety: the claim covers the run and we are inside Reading
            unsafe { buffer.copy_out(pos, &mut dst[copied..copied + run]) };
            self.consumed(run);
            copied += run;
        }
        claimed
    }

    // copy as many bytes of src as there is space for.
    pub(crate) fn write_chunk(&self, buffer: &RingBuffer, src: &[u8]) -> usize {
        let claimed = self.capacity.try_write_at_most(src.len());
        let mut copied = 0;
        while copied < claimed {
            let pos = self.write_pos.load(Acquire);
            let run = (self.capacity.total() - pos).min(claimed - copied);
            // safety: the claim covers the run and we are inside Writing
            unsafe { buffer.copy_in(pos, &src[copied..copied + run]) };
            self.produced(run);
            copied += run;
        }
        claimed
    }

    // decode an N-byte value at the read cursor, or None if fewer than N
    // bytes are readable. a value that straddles the wrap is first staged
    // into the reserved tail so the copy is contiguous.
    pub(crate) fn read_scalar_chunk<const N: usize>(
        &self,
        buffer: &RingBuffer,
    ) -> Option<[u8; N]> {
        if !self.capacity.try_read_exact(N) {
            return None;
        }
        let pos = self.read_pos.load(Acquire);
        let total = self.capacity.total();
        let mut out = [0u8; N];
        // safety: the exact claim covers pos..pos+N (wrapping), and rolling
        // the wrapped front bytes stays within the claim
        unsafe {
            if total - pos < N {
                buffer.roll(N - (total - pos));
            }
            buffer.copy_out(pos, &mut out);
        }
        self.consumed(N);
        Some(out)
    }

    // encode an N-byte value at the write cursor, or false if fewer than N
    // bytes of space are free. a value that straddles the wrap is written
    // contiguously into the reserved tail and carried back to the front
    // before commit, so the reader never observes it torn.
    pub(crate) fn write_scalar_chunk<const N: usize>(
        &self,
        buffer: &RingBuffer,
        bytes: [u8; N],
    ) -> bool {
        if !self.capacity.try_write_exact(N) {
            return false;
        }
        let pos = self.write_pos.load(Acquire);
        let total = self.capacity.total();
        // safety: the exact claim covers pos..pos+N (wrapping), which is
        // exactly the staged range plus the carried front bytes
        unsafe {
            buffer.copy_in(pos, &bytes);
            let end = pos + N;
            if end > total {
                buffer.carry(end);
            }
        }
        self.produced(N);
        true
    }

    // lend the readable run to f, which reports how many bytes it consumed.
    // the rest of the claim goes straight back to the readable count. None
    // if fewer than `min` bytes are readable.
    pub(crate) fn read_window<R>(
        &self,
        buffer: &RingBuffer,
        min: usize,
        f: impl FnOnce(&[u8]) -> (usize, R),
    ) -> Option<R> {
        let claimed = self.capacity.try_read_at_least(min);
        if claimed == 0 {
            return None;
        }
        let pos = self.read_pos.load(Acquire);
        let run = (self.capacity.total() - pos).min(claimed);
        // safety: the claim covers the run; the slice dies with f
        let (consumed, result) = f(unsafe { buffer.slice(pos, run) });
        assert!(consumed <= run, "consumed more bytes than the window held");
        self.consumed(consumed);
        self.capacity.return_read(claimed - consumed);
        Some(result)
    }

    // lend the writable run to f, which reports how many bytes it wrote.
    // the rest of the claim is credited back, never lost. the run can be
    // shorter than `min` right at the wrap point.
    pub(crate) fn write_window<R>(
        &self,
        buffer: &RingBuffer,
        min: usize,
        f: impl FnOnce(&mut [u8]) -> (usize, R),
    ) -> Option<R> {
        let claimed = self.capacity.try_write_at_least(min);
        if claimed == 0 {
            return None;
        }
        let pos = self.write_pos.load(Acquire);
        let run = (self.capacity.total() - pos).min(claimed);
        // safety: the claim covers the run; the slice dies with f
        let (written, result) = f(unsafe { buffer.slice_mut(pos, run) });
        assert!(written <= run, "wrote more bytes than the window held");
        self.produced(written);
        self.capacity.complete_read(claimed - written);
        Some(result)
    }

    // scan the readable bytes for `delim`. everything before the match (or
    // the whole run if there is none) is appended to out; the delimiter is
    // consumed but not appended. None if nothing is readable.
    pub(crate) fn scan_chunk(
        &self,
        buffer: &RingBuffer,
        delim: u8,
        out: &mut Vec<u8>,
    ) -> Option<bool> {
        let claimed = self.capacity.try_read_at_least(1);
        if claimed == 0 {
            return None;
        }
        let pos = self.read_pos.load(Acquire);
        let run = (self.capacity.total() - pos).min(claimed);
        // safety: the claim covers the run
        let window = unsafe { buffer.slice(pos, run) };
        let (consumed, found) = match window.iter().position(|&b| b == delim) {
            Some(i) => {
                out.extend_from_slice(&window[..i]);
                (i + 1, true)
            }
            None => {
                out.extend_from_slice(window);
                (run, false)
            }
        };
        self.consumed(consumed);
        self.capacity.return_read(claimed - consumed);
        Some(found)
    }

    // take and recycle the bound buffer. caller must have won a transition
    // into Releasing (or hold &mut via drop).
    fn unbind_buffer(&self) {
        let ptr = self.buffer.swap(null_mut(), AcqRel);
        if !ptr.is_null() {
            trace!("releasing ring buffer");
            // safety: the Releasing transition grants sole ownership.
            let buffer = unsafe { Box::from_raw(ptr) };
            if self.pooled {
                BUFFER_POOL.recycle(buffer);
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct Channel(pub(crate) Arc<Inner>);

impl Channel {
    pub(crate) fn new(capacity: usize, auto_flush: bool, pooled: bool) -> Self {
        Channel(Arc::new(Inner {
            state: AtomicState::new(ChannelState::IdleEmpty),
            capacity: RingCapacity::new(capacity),
            buffer: AtomicPtr::new(null_mut()),
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            total_read: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            closed: AtomicPtr::new(null_mut()),
            joining: AtomicPtr::new(null_mut()),
            read_op: WakerSlot::new(),
            write_op: WakerSlot::new(),
            auto_flush,
            pooled,
        }))
    }

    pub(crate) fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn is_closed_for_read(&self) -> bool {
        self.0.closed().is_some() && self.0.state.load() == ChannelState::Terminated
    }

    pub(crate) fn is_closed_for_write(&self) -> bool {
        self.0.closed().is_some()
    }


    // ==== critical sections ====


    // run f inside the read critical section. Ok(None) means there is no
    // buffer to read from (never bound, or terminated). a failure cause
    // surfaces before f runs, so f never observes a cancelled channel.
    pub(crate) fn reading<R>(
        &self,
        f: impl FnOnce(&Inner, &RingBuffer) -> R,
    ) -> Result<Option<R>, ReadError> {
        let inner = &*self.0;
        loop {
            let state = inner.state.load();
            match state.try_start_reading() {
                StartOp::Enter(next) => {
                    if inner.state.compare_exchange(state, next).is_ok() {
                        break;
                    }
                }
                StartOp::None => return Ok(None),
                StartOp::Retry => std::hint::spin_loop(),
                StartOp::Violation => panic!("read operation is already in progress"),
            }
        }
        let result = match inner.closed_cause() {
            Some(cause) => Err(ChannelClosedError { cause }.into()),
            None => {
                let buffer = inner.buffer.load(Acquire);
                debug_assert!(!buffer.is_null());
                // safety: the Reading tag keeps the buffer bound until we
                // stop reading below
                Ok(Some(f(inner, unsafe { &*buffer })))
            }
        };
        self.restore_after_read();
        self.try_terminate();
        result
    }

    // run f inside the write critical section, following delegation to a
    // joined destination first. Ok(None) means writing is barred right now
    // (joined but the source has not drained yet); the caller suspends and
    // retries.
    pub(crate) fn writing<R>(
        &self,
        f: impl FnOnce(&Inner, &RingBuffer) -> R,
    ) -> Result<Option<R>, WriteError> {
        let current = match self.resolve_delegation() {
            Some(delegate) => delegate,
            None => self.clone(),
        };
        let inner = &*current.0;
        loop {
            if inner.joining().is_some() {
                return Ok(None);
            }
            let state = inner.state.load();
            match state.try_start_writing() {
                StartOp::Enter(_) if state == ChannelState::IdleEmpty => {
                    if current.try_bind_and_enter() {
                        break;
                    }
                    // a close won the bind race
                    return match current.write_closed_error() {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                }
                StartOp::Enter(next) => {
                    if inner.state.compare_exchange(state, next).is_ok() {
                        break;
                    }
                }
                StartOp::None => {
                    return match current.write_closed_error() {
                        Some(err) => Err(err),
                        // terminated without a close marker: a joined source
                        // whose delegation has not resolved yet
                        None => Ok(None),
                    };
                }
                StartOp::Retry => std::hint::spin_loop(),
                StartOp::Violation => panic!("write operation is already in progress"),
            }
        }
        // a close may have landed between delegation resolution and entry
        if let Some(err) = current.write_closed_error() {
            current.restore_after_write();
            current.try_terminate();
            return Err(err);
        }
        let before = inner.total_written.load(Acquire);
        let buffer = inner.buffer.load(Acquire);
        debug_assert!(!buffer.is_null());
        // safety: the Writing tag keeps the buffer bound until we stop
        // writing below
        let result = f(inner, unsafe { &*buffer });
        if inner.capacity.is_full() || inner.auto_flush {
            current.flush();
        }
        if !current.ptr_eq(self) {
            let delta = inner.total_written.load(Acquire) - before;
            self.0.total_written.fetch_add(delta, AcqRel);
        }
        current.restore_after_write();
        current.try_terminate();
        Ok(Some(result))
    }

    // walk the delegation chain. writes route to the delegate only once the
    // joined channel has fully drained and terminated.
    pub(crate) fn resolve_delegation(&self) -> Option<Channel> {
        let mut current = self.clone();
        loop {
            let next = {
                let joined = current.0.joining()?;
                if joined.is_complete() {
                    // joining finished; the channel is closed and writes
                    // must fail here rather than leak into the delegate
                    return None;
                }
                if current.0.state.load() != ChannelState::Terminated {
                    return None;
                }
                joined.delegated_to.clone()
            };
            if next.0.joining().is_none() {
                return Some(next);
            }
            current = next;
        }
    }

    // claim bind exclusivity, then allocate (or borrow) a buffer, publish
    // it, and enter Writing. returns false if a close terminated the
    // channel first.
    fn try_bind_and_enter(&self) -> bool {
        let inner = &*self.0;
        // the buffer pointer, cursors, and capacity counters may only be
        // touched after winning this transition; a loser must not publish
        // anything
        if let Err(loser) = inner
            .state
            .compare_exchange(ChannelState::IdleEmpty, ChannelState::Releasing)
        {
            if loser == ChannelState::Terminated {
                // a close won the bind race
                return false;
            }
            // any other transition out of IdleEmpty is a second writer
            panic!("write operation is already in progress");
        }
        let buffer = if inner.pooled {
            BUFFER_POOL.borrow()
        } else {
            Box::new(RingBuffer::new(inner.capacity.total()))
        };
        trace!("binding ring buffer");
        inner.read_pos.store(0, Release);
        inner.write_pos.store(0, Release);
        inner.buffer.store(Box::into_raw(buffer), Release);
        inner.capacity.reset_for_write();
        inner.state.store(ChannelState::Writing);
        true
    }

    fn restore_after_read(&self) {
        let inner = &*self.0;
        loop {
            let state = inner.state.load();
            if inner.state.compare_exchange(state, state.stop_reading()).is_ok() {
                break;
            }
        }
        self.try_release_idle();
    }

    fn restore_after_write(&self) {
        let inner = &*self.0;
        loop {
            let state = inner.state.load();
            if inner.state.compare_exchange(state, state.stop_writing()).is_ok() {
                break;
            }
        }
        self.try_release_idle();
    }

    // hand a fully drained buffer back to the pool, leaving the channel
    // IdleEmpty for the next bind.
    fn try_release_idle(&self) {
        let inner = &*self.0;
        if inner.state.load() != ChannelState::IdleNonEmpty || !inner.capacity.is_empty() {
            return;
        }
        if !inner.capacity.try_lock_for_release() {
            return;
        }
        if inner
            .state
            .compare_exchange(ChannelState::IdleNonEmpty, ChannelState::Releasing)
            .is_ok()
        {
            inner.unbind_buffer();
            inner.state.store(ChannelState::IdleEmpty);
            inner.resume_write_op();
        } else {
            // a side re-entered between the lock and the swap; undo the lock
            // so its claims can proceed
            inner.capacity.reset_for_write();
            inner.resume_write_op();
        }
    }

    // terminate-path release. `forced` permits releasing a drained buffer
    // even without a close marker, which is how a joined source leaves its
    // buffer behind.
    pub(crate) fn try_release_buffer(&self, forced: bool) -> bool {
        let inner = &*self.0;
        loop {
            match inner.state.load() {
                ChannelState::Terminated => return true,
                ChannelState::IdleEmpty => {
                    if inner
                        .state
                        .compare_exchange(ChannelState::IdleEmpty, ChannelState::Terminated)
                        .is_ok()
                    {
                        return true;
                    }
                }
                ChannelState::IdleNonEmpty => {
                    let closed = inner.closed().is_some();
                    let failure = inner.closed_cause().is_some();
                    let mut locked = inner.capacity.try_lock_for_release();
                    if !locked && failure {
                        // outstanding claims no longer matter once the
                        // channel failed
                        inner.capacity.force_lock_for_release();
                        locked = true;
                    }
                    if !(locked && (closed || forced)) {
                        if locked {
                            inner.capacity.reset_for_write();
                            inner.resume_write_op();
                        }
                        return false;
                    }
                    if inner
                        .state
                        .compare_exchange(ChannelState::IdleNonEmpty, ChannelState::Releasing)
                        .is_ok()
                    {
                        inner.unbind_buffer();
                        inner.state.store(ChannelState::Terminated);
                        inner.resume_write_op();
                        return true;
                    }
                    // a side re-entered; undo the lock unless the channel
                    // failed, in which case claims stay dead
                    if !failure {
                        inner.capacity.reset_for_write();
                        inner.resume_write_op();
                    }
                }
                ChannelState::Releasing => std::hint::spin_loop(),
                _ => return false,
            }
        }
    }

    pub(crate) fn try_terminate(&self) -> bool {
        let inner = &*self.0;
        if inner.closed().is_none() || !self.try_release_buffer(false) {
            return false;
        }
        if let Some(joined) = inner.joining() {
            self.ensure_closed_joined(joined);
        }
        inner.resume_read_op();
        inner.resume_write_op();
        true
    }


    // ==== flush / close ====


    pub(crate) fn flush(&self) {
        self.flush_impl(1);
    }

    // promote pending bytes and resume whichever parked side is now
    // satisfied. min_write is the space threshold a parked writer asked for.
    pub(crate) fn flush_impl(&self, min_write: usize) {
        let inner = &*self.0;
        if let Some(joined) = inner.joining() {
            joined.delegated_to.flush_impl(1);
        }
        if inner.state.load() == ChannelState::Terminated {
            return;
        }
        inner.capacity.flush();
        let avail_read = inner.capacity.available_for_read();
        let avail_write = inner.capacity.available_for_write();
        if avail_read >= 1 {
            inner.resume_read_op();
        }
        if avail_write >= min_write
            && (inner.joining().is_none() || inner.state.load() == ChannelState::Terminated)
        {
            inner.write_op.resume();
        }
    }

    pub(crate) fn close_inner(&self, cause: Option<CloseCause>) -> bool {
        let inner = &*self.0;
        let failure = cause.is_some();
        let marker = Box::into_raw(Box::new(Closed { cause }));
        if inner
            .closed
            .compare_exchange(null_mut(), marker, AcqRel, Acquire)
            .is_err()
        {
            // lost the race; the first close already recorded its marker
            // safety: nothing else ever saw this pointer.
            drop(unsafe { Box::from_raw(marker) });
            return false;
        }
        trace!(failure, "closing byte channel");
        inner.capacity.flush();
        if inner.state.load() == ChannelState::IdleEmpty
            || inner.capacity.is_empty()
            || failure
        {
            self.try_terminate();
        }
        inner.resume_read_op();
        inner.write_op.resume();
        if inner.state.load() == ChannelState::Terminated {
            if let Some(joined) = inner.joining() {
                self.ensure_closed_joined(joined);
            }
        }
        true
    }

    pub(crate) fn cancel(&self, cause: Option<anyhow::Error>) -> bool {
        let cause = cause.unwrap_or_else(|| anyhow::anyhow!("byte channel was cancelled"));
        self.close_inner(Some(Arc::new(cause)))
    }


    // ==== suspension ====


    pub(crate) fn read_suspend(&self, size: usize) -> ReadSuspend<'_> {
        ReadSuspend { chan: self, size, installed: false }
    }

    pub(crate) fn write_suspend(&self, size: usize) -> WriteSuspend<'_> {
        WriteSuspend { chan: self, size, installed: false }
    }

    fn read_suspend_predicate(&self, size: usize) -> bool {
        let inner = &*self.0;
        if inner.capacity.available_for_read() >= size {
            return false;
        }
        // a joined channel with a parked writer and an idle state will
        // never see more bytes here; they flow through the delegate
        !(inner.joining().is_some()
            && inner.write_op.is_installed()
            && inner.state.load().is_idle())
    }

    // outcome of a read suspension: whether `size` bytes are now readable.
    // a failure cause preempts everything, including bytes still buffered.
    fn read_verdict(&self, size: usize) -> Result<bool, ChannelClosedError> {
        let inner = &*self.0;
        if let Some(closed) = inner.closed() {
            if let Some(cause) = &closed.cause {
                return Err(ChannelClosedError { cause: cause.clone() });
            }
            inner.capacity.flush();
        }
        Ok(inner.capacity.available_for_read() >= size)
    }

    fn write_suspend_predicate(&self, size: usize) -> bool {
        let inner = &*self.0;
        if inner.closed().is_some() {
            return false;
        }
        let state = inner.state.load();
        match inner.joining() {
            // IdleEmpty never suspends: the writer should bind instead
            None => {
                inner.capacity.available_for_write() < size
                    && state != ChannelState::IdleEmpty
            }
            // joined: parked until the source terminates and delegation
            // resolves (or somebody is actively splicing)
            Some(_) => !matches!(
                state,
                ChannelState::Terminated | ChannelState::Writing | ChannelState::ReadingWriting
            ),
        }
    }

    pub(crate) fn write_closed_error(&self) -> Option<WriteError> {
        let closed = self.0.closed()?;
        Some(match &closed.cause {
            Some(cause) => WriteError::Closed(ChannelClosedError { cause: cause.clone() }),
            None => WriteError::ClosedForWrite(ClosedForWriteError),
        })
    }

    fn should_resume_read_op(&self) -> bool {
        self.0.joining().is_some() && self.0.state.load().is_idle()
    }
}

// future for a read waiting on `size` readable bytes. resolves to whether
// the bytes are there (false only after a graceful close ran short).
pub(crate) struct ReadSuspend<'a> {
    chan: &'a Channel,
    size: usize,
    installed: bool,
}

impl ReadSuspend<'_> {
    fn uninstall(&mut self) {
        if self.installed {
            self.chan.0.read_op.take();
            self.installed = false;
        }
    }
}

impl Future for ReadSuspend<'_> {
    type Output = Result<bool, ChannelClosedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let chan = this.chan;
        let inner = &*chan.0;
        loop {
            if !chan.read_suspend_predicate(this.size) || inner.closed().is_some() {
                this.uninstall();
                return Poll::Ready(chan.read_verdict(this.size));
            }
            if this.installed {
                if !inner.read_op.update(cx.waker()) {
                    // resumed concurrently; re-evaluate
                    this.installed = false;
                    continue;
                }
            } else {
                inner.read_op.install(cx.waker(), "read");
                this.installed = true;
            }
            // the predicate may have flipped between the check above and
            // the install; re-checking closes the lost-wakeup race
            if !chan.read_suspend_predicate(this.size) || inner.closed().is_some() {
                continue;
            }
            return Poll::Pending;
        }
    }
}

impl Drop for ReadSuspend<'_> {
    fn drop(&mut self) {
        self.uninstall();
    }
}

// future for a write waiting on `size` bytes of space (or, when joined, on
// the delegation resolving).
pub(crate) struct WriteSuspend<'a> {
    chan: &'a Channel,
    size: usize,
    installed: bool,
}

impl WriteSuspend<'_> {
    fn uninstall(&mut self) {
        if self.installed {
            self.chan.0.write_op.take();
            self.installed = false;
        }
    }
}

impl Future for WriteSuspend<'_> {
    type Output = Result<(), WriteError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let chan = this.chan;
        let inner = &*chan.0;
        loop {
            if !chan.write_suspend_predicate(this.size) {
                this.uninstall();
                return Poll::Ready(match chan.write_closed_error() {
                    Some(err) => Err(err),
                    None => Ok(()),
                });
            }
            if this.installed {
                if !inner.write_op.update(cx.waker()) {
                    this.installed = false;
                    continue;
                }
            } else {
                inner.write_op.install(cx.waker(), "write");
                this.installed = true;
            }
            // genuinely parking: flush so a parked reader can drain the
            // space we wait for, and nudge a joined channel's reader
            chan.flush_impl(this.size);
            if chan.should_resume_read_op() {
                inner.resume_read_op();
            }
            if !chan.write_suspend_predicate(this.size) {
                continue;
            }
            return Poll::Pending;
        }
    }
}

impl Drop for WriteSuspend<'_> {
    fn drop(&mut self) {
        self.uninstall();
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_loses_to_a_close_quietly() {
        let chan = Channel::new(64, true, false);
        chan.close_inner(None);
        assert!(!chan.try_bind_and_enter());
        // the loser must not have published a buffer
        assert!(chan.0.buffer.load(Acquire).is_null());
        assert_eq!(chan.0.state.load(), ChannelState::Terminated);
    }

    #[test]
    #[should_panic(expected = "write operation is already in progress")]
    fn bind_against_a_live_writer_panics() {
        let chan = Channel::new(64, true, false);
        chan.0.state.store(ChannelState::Writing);
        chan.try_bind_and_enter();
    }

    #[test]
    fn bind_winner_holds_the_buffer_alone() {
        let chan = Channel::new(64, true, false);
        assert!(chan.try_bind_and_enter());
        let bound = chan.0.buffer.load(Acquire);
        assert!(!bound.is_null());
        assert_eq!(chan.0.state.load(), ChannelState::Writing);
        assert_eq!(chan.0.capacity.available_for_write(), 64);
        chan.restore_after_write();
    }
}
