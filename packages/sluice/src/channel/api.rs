// public surface of a channel.

use super::{
    core::Channel,
    error::{
        CloseCause, EndOfStreamError, InvalidUtf8Error, LineTooLongError, ReadError,
        WriteError,
    },
    ring::{DEFAULT_CAPACITY, RESERVED_SIZE},
};
use bytes::{Bytes, BytesMut};
use std::sync::{atomic::Ordering::Acquire, Arc};

/// Asynchronous single-reader / single-writer byte channel over a fixed
/// capacity ring buffer.
///
/// Exactly one read operation and one write operation may be outstanding at
/// a time; starting a second concurrent operation on the same side panics.
/// A reader and a writer may run truly concurrently, including from
/// different threads, because they always touch disjoint byte ranges of the
/// ring. Operations that cannot proceed suspend (without blocking a thread)
/// until the other side makes room or data, or the channel closes.
///
/// Cloning the handle is cheap and shares the channel; typical use hands
/// one clone to the producing task and one to the consuming task.
#[derive(Clone)]
pub struct ByteChannel {
    chan: Channel,
}

impl ByteChannel {
    /// Construct with the pooled default capacity (4088 bytes).
    ///
    /// With `auto_flush` set every completed write is immediately visible to
    /// the reader; otherwise bytes stay invisible until [`flush`][Self::flush]
    /// (or until the buffer fills up).
    pub fn new(auto_flush: bool) -> Self {
        ByteChannel { chan: Channel::new(DEFAULT_CAPACITY, auto_flush, true) }
    }

    /// Construct with a custom capacity, allocated outside the buffer pool.
    ///
    /// Panics if `capacity` is smaller than the widest supported scalar
    /// (8 bytes).
    pub fn with_capacity(capacity: usize, auto_flush: bool) -> Self {
        assert!(capacity >= RESERVED_SIZE, "capacity too small");
        ByteChannel { chan: Channel::new(capacity, auto_flush, false) }
    }


    // ==== typed scalar reads (big-endian) ====


    async fn read_scalar<const N: usize>(&self) -> Result<[u8; N], ReadError> {
        loop {
            let chunk = self
                .chan
                .reading(|inner, buffer| inner.read_scalar_chunk::<N>(buffer))?;
            if let Some(bytes) = chunk.flatten() {
                return Ok(bytes);
            }
            if !self.chan.read_suspend(N).await? {
                let avail = self.chan.0.capacity.available_for_read();
                return Err(EndOfStreamError { expected: N - avail.min(N) }.into());
            }
        }
    }

    pub async fn read_u8(&self) -> Result<u8, ReadError> {
        Ok(self.read_scalar::<1>().await?[0])
    }

    pub async fn read_u16(&self) -> Result<u16, ReadError> {
        Ok(u16::from_be_bytes(self.read_scalar().await?))
    }

    pub async fn read_u32(&self) -> Result<u32, ReadError> {
        Ok(u32::from_be_bytes(self.read_scalar().await?))
    }

    pub async fn read_u64(&self) -> Result<u64, ReadError> {
        Ok(u64::from_be_bytes(self.read_scalar().await?))
    }

    pub async fn read_i8(&self) -> Result<i8, ReadError> {
        Ok(self.read_u8().await? as i8)
    }

    pub async fn read_i16(&self) -> Result<i16, ReadError> {
        Ok(i16::from_be_bytes(self.read_scalar().await?))
    }

    pub async fn read_i32(&self) -> Result<i32, ReadError> {
        Ok(i32::from_be_bytes(self.read_scalar().await?))
    }

    pub async fn read_i64(&self) -> Result<i64, ReadError> {
        Ok(i64::from_be_bytes(self.read_scalar().await?))
    }

    pub async fn read_f32(&self) -> Result<f32, ReadError> {
        Ok(f32::from_bits(self.read_u32().await?))
    }

    pub async fn read_f64(&self) -> Result<f64, ReadError> {
        Ok(f64::from_bits(self.read_u64().await?))
    }


    // ==== bulk reads ====


    /// Read exactly `dst.len()` bytes, suspending as needed.
    ///
    /// Fails with [`EndOfStreamError`] naming the shortfall if the channel
    /// closes gracefully first.
    pub async fn read_fully(&self, dst: &mut [u8]) -> Result<(), ReadError> {
        let mut copied = 0;
        while copied < dst.len() {
            let n = self
                .chan
                .reading(|inner, buffer| inner.read_chunk(buffer, &mut dst[copied..]))?
                .unwrap_or(0);
            copied += n;
            if copied == dst.len() {
                break;
            }
            if !self.chan.read_suspend(1).await? {
                return Err(EndOfStreamError { expected: dst.len() - copied }.into());
            }
        }
        Ok(())
    }

    /// Read whatever is available into `dst`, suspending only while the
    /// channel is open but empty. `None` means end of stream: no byte will
    /// ever arrive again.
    pub async fn read_available(&self, dst: &mut [u8]) -> Result<Option<usize>, ReadError> {
        if dst.is_empty() {
            return Ok(Some(0));
        }
        loop {
            let n = self
                .chan
                .reading(|inner, buffer| inner.read_chunk(buffer, dst))?
                .unwrap_or(0);
            if n > 0 {
                return Ok(Some(n));
            }
            if !self.chan.read_suspend(1).await? {
                return Ok(None);
            }
        }
    }

    /// Consume and drop up to `max` bytes. The result is short of `max`
    /// only at end of stream.
    pub async fn discard(&self, max: u64) -> Result<u64, ReadError> {
        let mut discarded = 0u64;
        while discarded < max {
            let n = self
                .chan
                .reading(|inner, _buffer| {
                    let want = (max - discarded).min(usize::MAX as u64) as usize;
                    let n = inner.capacity.try_read_at_most(want);
                    inner.consumed(n);
                    n
                })?
                .unwrap_or(0);
            discarded += n as u64;
            if discarded >= max {
                break;
            }
            if !self.chan.read_suspend(1).await? {
                break;
            }
        }
        Ok(discarded)
    }

    /// Scan for `delim`, appending everything before it to `out`. The
    /// delimiter is consumed but not appended.
    ///
    /// Returns the number of bytes appended, or `None` at end of stream
    /// with nothing read. End of stream before a match yields the partial
    /// tail. Scanning more than `limit` bytes without a match fails with
    /// [`LineTooLongError`].
    pub async fn read_until(
        &self,
        delim: u8,
        out: &mut Vec<u8>,
        limit: usize,
    ) -> Result<Option<usize>, ReadError> {
        let start = out.len();
        loop {
            let found = self
                .chan
                .reading(|inner, buffer| inner.scan_chunk(buffer, delim, out))?
                .flatten();
            if out.len() - start > limit {
                return Err(LineTooLongError { limit }.into());
            }
            match found {
                Some(true) => return Ok(Some(out.len() - start)),
                // the run was clipped at the wrap point; more bytes may be
                // readable right away
                Some(false) => continue,
                None => {
                    if !self.chan.read_suspend(1).await? {
                        return if out.len() > start {
                            Ok(Some(out.len() - start))
                        } else {
                            Ok(None)
                        };
                    }
                }
            }
        }
    }

    /// Read one `\n`-terminated line as UTF-8, stripping a trailing `\r`.
    /// `None` at end of stream with nothing read.
    pub async fn read_line(&self, limit: usize) -> Result<Option<String>, ReadError> {
        let mut line = Vec::new();
        match self.read_until(b'\n', &mut line, limit).await? {
            None => Ok(None),
            Some(_) => {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                match String::from_utf8(line) {
                    Ok(line) => Ok(Some(line)),
                    Err(_) => Err(InvalidUtf8Error.into()),
                }
            }
        }
    }

    /// Lend the readable run (at least `min` bytes, clipped at the wrap
    /// point) to `f` for in-place parsing; `f` returns how many bytes it
    /// consumed. `None` if fewer than `min` bytes are readable right now.
    ///
    /// `min = 0` always runs `f`, with an empty window if need be; consuming
    /// zero bytes makes this a peek.
    pub fn try_read_with(
        &self,
        min: usize,
        f: impl FnOnce(&[u8]) -> usize,
    ) -> Result<Option<usize>, ReadError> {
        let mut f = Some(f);
        let consumed = self
            .chan
            .reading(|inner, buffer| {
                inner.read_window(buffer, min.max(1), |window| {
                    let consumed = (f.take().unwrap())(window);
                    (consumed, consumed)
                })
            })?
            .flatten();
        match consumed {
            Some(consumed) => Ok(Some(consumed)),
            None if min == 0 => {
                let consumed = match f.take() {
                    Some(f) => f(&[]),
                    None => 0,
                };
                assert_eq!(consumed, 0, "consumed more bytes than the window held");
                Ok(Some(0))
            }
            None => Ok(None),
        }
    }

    /// Suspending form of [`try_read_with`][Self::try_read_with]: waits for
    /// `min` readable bytes first. Fails with [`EndOfStreamError`] if the
    /// channel closes before `min` bytes arrive.
    ///
    /// Panics if `min` exceeds the channel capacity, which could never be
    /// satisfied.
    pub async fn read_with(
        &self,
        min: usize,
        f: impl FnOnce(&[u8]) -> usize,
    ) -> Result<usize, ReadError> {
        assert!(
            min <= self.chan.0.capacity.total(),
            "requested bytes exceed channel capacity",
        );
        let mut f = Some(f);
        loop {
            let consumed = self
                .chan
                .reading(|inner, buffer| {
                    inner.read_window(buffer, min.max(1), |window| {
                        let consumed = (f.take().unwrap())(window);
                        (consumed, consumed)
                    })
                })?
                .flatten();
            if let Some(consumed) = consumed {
                return Ok(consumed);
            }
            if min == 0 {
                let consumed = match f.take() {
                    Some(f) => f(&[]),
                    None => 0,
                };
                assert_eq!(consumed, 0, "consumed more bytes than the window held");
                return Ok(0);
            }
            if !self.chan.read_suspend(min).await? {
                let avail = self.chan.0.capacity.available_for_read();
                return Err(EndOfStreamError { expected: min - avail.min(min) }.into());
            }
        }
    }

    /// Drain up to `limit` bytes into a freshly allocated [`Bytes`],
    /// suspending between refills; short of `limit` only at end of stream.
    pub async fn read_remaining(&self, limit: u64) -> Result<Bytes, ReadError> {
        let mut out = BytesMut::new();
        let mut buf = [0u8; 4096];
        let mut remaining = limit;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            match self.read_available(&mut buf[..want]).await? {
                Some(n) => {
                    out.extend_from_slice(&buf[..n]);
                    remaining -= n as u64;
                }
                None => break,
            }
        }
        Ok(out.freeze())
    }

    /// Read exactly `size` bytes into a freshly allocated [`Bytes`].
    pub async fn read_packet(&self, size: usize) -> Result<Bytes, ReadError> {
        let mut packet = BytesMut::zeroed(size);
        self.read_fully(&mut packet).await?;
        Ok(packet.freeze())
    }

    /// Wait until at least `min` bytes are readable. `false` once the
    /// channel closed gracefully with fewer remaining.
    ///
    /// Panics if `min` exceeds the channel capacity, which could never be
    /// satisfied.
    pub async fn await_content(&self, min: usize) -> Result<bool, ReadError> {
        assert!(
            min <= self.chan.0.capacity.total(),
            "requested bytes exceed channel capacity",
        );
        Ok(self.chan.read_suspend(min).await?)
    }


    // ==== typed scalar writes (big-endian) ====


    async fn write_scalar<const N: usize>(&self, bytes: [u8; N]) -> Result<(), WriteError> {
        loop {
            let wrote = self
                .chan
                .writing(|inner, buffer| inner.write_scalar_chunk(buffer, bytes))?
                .unwrap_or(false);
            if wrote {
                return Ok(());
            }
            self.chan.write_suspend(N).await?;
        }
    }

    pub async fn write_u8(&self, value: u8) -> Result<(), WriteError> {
        self.write_scalar([value]).await
    }

    pub async fn write_u16(&self, value: u16) -> Result<(), WriteError> {
        self.write_scalar(value.to_be_bytes()).await
    }

    pub async fn write_u32(&self, value: u32) -> Result<(), WriteError> {
        self.write_scalar(value.to_be_bytes()).await
    }

    pub async fn write_u64(&self, value: u64) -> Result<(), WriteError> {
        self.write_scalar(value.to_be_bytes()).await
    }

    pub async fn write_i8(&self, value: i8) -> Result<(), WriteError> {
        self.write_u8(value as u8).await
    }

    pub async fn write_i16(&self, value: i16) -> Result<(), WriteError> {
        self.write_scalar(value.to_be_bytes()).await
    }

    pub async fn write_i32(&self, value: i32) -> Result<(), WriteError> {
        self.write_scalar(value.to_be_bytes()).await
    }

    pub async fn write_i64(&self, value: i64) -> Result<(), WriteError> {
        self.write_scalar(value.to_be_bytes()).await
    }

    pub async fn write_f32(&self, value: f32) -> Result<(), WriteError> {
        self.write_u32(value.to_bits()).await
    }

    pub async fn write_f64(&self, value: f64) -> Result<(), WriteError> {
        self.write_u64(value.to_bits()).await
    }


    // ==== bulk writes ====


    /// Write all of `src`, suspending as needed.
    pub async fn write_fully(&self, src: &[u8]) -> Result<(), WriteError> {
        let mut written = 0;
        while written < src.len() {
            let n = self
                .chan
                .writing(|inner, buffer| inner.write_chunk(buffer, &src[written..]))?
                .unwrap_or(0);
            written += n;
            if written < src.len() {
                self.chan.write_suspend(1).await?;
            }
        }
        Ok(())
    }

    /// Write as much of `src` as there is space for without losing it,
    /// suspending only while the channel is open but full.
    pub async fn write_available(&self, src: &[u8]) -> Result<usize, WriteError> {
        if src.is_empty() {
            return Ok(0);
        }
        loop {
            let n = self
                .chan
                .writing(|inner, buffer| inner.write_chunk(buffer, src))?
                .unwrap_or(0);
            if n > 0 {
                return Ok(n);
            }
            self.chan.write_suspend(1).await?;
        }
    }

    /// Lend a writable window of at least `min` claimed bytes to `f`
    /// (clipped at the wrap point, so the window itself can be shorter);
    /// `f` returns how many it wrote. The unused remainder of the claim
    /// goes back to the tracker. `None` if fewer than `min` bytes of space
    /// are free right now.
    pub fn try_write_with(
        &self,
        min: usize,
        f: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<Option<usize>, WriteError> {
        assert!(min >= 1, "write window needs min >= 1");
        let mut f = Some(f);
        let written = self
            .chan
            .writing(|inner, buffer| {
                inner.write_window(buffer, min, |window| {
                    let written = (f.take().unwrap())(window);
                    (written, written)
                })
            })?
            .flatten();
        Ok(written)
    }

    /// Suspending form of [`try_write_with`][Self::try_write_with]: waits
    /// for `min` bytes of space first.
    ///
    /// Panics if `min` exceeds the channel capacity, which could never be
    /// satisfied.
    pub async fn write_with(
        &self,
        min: usize,
        f: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<usize, WriteError> {
        assert!(min >= 1, "write window needs min >= 1");
        assert!(
            min <= self.chan.0.capacity.total(),
            "requested bytes exceed channel capacity",
        );
        let mut f = Some(f);
        loop {
            let written = self
                .chan
                .writing(|inner, buffer| {
                    inner.write_window(buffer, min, |window| {
                        let written = (f.take().unwrap())(window);
                        (written, written)
                    })
                })?
                .flatten();
            if let Some(written) = written {
                return Ok(written);
            }
            self.chan.write_suspend(min).await?;
        }
    }

    /// Write an entire packet.
    pub async fn write_packet(&self, packet: Bytes) -> Result<(), WriteError> {
        self.write_fully(&packet).await
    }


    // ==== lifecycle ====


    /// Make every byte written so far visible to the reader and wake
    /// whichever parked side is now satisfied. Idempotent, callable from
    /// any thread, a no-op once terminated.
    pub fn flush(&self) {
        self.chan.flush();
    }

    /// Close the channel. `None` is a graceful close: buffered bytes stay
    /// readable and the reader then sees end of stream. `Some(cause)` is a
    /// failure: the cause is replayed to every subsequent and currently
    /// suspended operation on both sides.
    ///
    /// The first close wins and returns true; later calls are no-ops
    /// returning false.
    pub fn close(&self, cause: Option<anyhow::Error>) -> bool {
        self.chan.close_inner(cause.map(Arc::new))
    }

    /// Close as a failure, defaulting to a cancellation cause.
    pub fn cancel(&self, cause: Option<anyhow::Error>) -> bool {
        self.chan.cancel(cause)
    }

    /// Whether every byte has been read out of a closed channel.
    pub fn is_closed_for_read(&self) -> bool {
        self.chan.is_closed_for_read()
    }

    /// Whether the channel no longer accepts writes.
    pub fn is_closed_for_write(&self) -> bool {
        self.chan.is_closed_for_write()
    }

    /// The failure cause, if the channel was closed with one.
    pub fn closed_cause(&self) -> Option<CloseCause> {
        self.chan.0.closed_cause()
    }

    pub fn available_for_read(&self) -> usize {
        self.chan.0.capacity.available_for_read()
    }

    pub fn available_for_write(&self) -> usize {
        self.chan.0.capacity.available_for_write()
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.chan.0.total_read.load(Acquire)
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.chan.0.total_written.load(Acquire)
    }


    // ==== joining ====


    /// Splice `src` into this channel: all of `src`'s current and future
    /// bytes flow directly into this channel's ring, with no intermediate
    /// copy. Resolves once `src` is fully closed and propagated. With
    /// `delegate_close`, closing `src` closes this channel too.
    ///
    /// Panics if `src` is already joined, or if `src` is this channel.
    pub async fn join_from(
        &self,
        src: &ByteChannel,
        delegate_close: bool,
    ) -> Result<(), WriteError> {
        self.chan.join_from_impl(&src.chan, delegate_close).await
    }

    /// [`join_from`][Self::join_from] seen from the source's end.
    pub async fn join_to(
        &self,
        dst: &ByteChannel,
        delegate_close: bool,
    ) -> Result<(), WriteError> {
        dst.chan.join_from_impl(&self.chan, delegate_close).await
    }

    /// Move up to `limit` bytes from this channel into `dst` ring-to-ring,
    /// without joining. Returns the number of bytes moved, short only when
    /// this channel ends.
    pub async fn copy_to(&self, dst: &ByteChannel, limit: u64) -> Result<u64, WriteError> {
        dst.chan.copy_direct(&self.chan, limit, None).await
    }
}
