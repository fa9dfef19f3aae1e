// channel error types.

use std::sync::Arc;
use thiserror::Error;

/// Failure cause recorded by `close(Some(..))` or `cancel`.
///
/// Stored behind an `Arc` so the same cause can be replayed to every
/// subsequent and currently-suspended operation on both sides.
pub type CloseCause = Arc<anyhow::Error>;


// ==== base error types ====


/// Error for a read that required more bytes than will ever arrive
///
/// Raised when the channel is closed gracefully before an exact-size read
/// request could be satisfied.
#[derive(Debug, Clone, Error)]
#[error("EOF while {expected} more bytes expected")]
pub struct EndOfStreamError {
    /// Number of bytes still missing when the channel closed.
    pub expected: usize,
}

/// Error for writing into a channel after `close` or `cancel`
#[derive(Debug, Clone, Error)]
#[error("byte channel was closed for write")]
pub struct ClosedForWriteError;

/// Error for using a channel that was closed with a failure cause
///
/// The cause is whatever was passed to `close(Some(cause))` or `cancel`, and
/// is identical for every operation that observes it.
#[derive(Debug, Clone, Error)]
#[error("byte channel was closed: {cause}")]
pub struct ChannelClosedError {
    /// The recorded failure cause.
    pub cause: CloseCause,
}

/// Error for a delimiter scan that exceeded its byte limit before a match
#[derive(Debug, Clone, Error)]
#[error("delimiter not found within limit of {limit} bytes")]
pub struct LineTooLongError {
    /// The limit that was exceeded.
    pub limit: usize,
}

/// Error for line bytes that are not valid UTF-8
#[derive(Debug, Clone, Error)]
#[error("line is not valid UTF-8")]
pub struct InvalidUtf8Error;


// ==== compound error types ====


macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Error for reading from the channel
#[derive(Debug, Clone, Error)]
pub enum ReadError {
    /// The channel closed gracefully with too few bytes remaining
    #[error(transparent)]
    EndOfStream(EndOfStreamError),
    /// The channel was closed with a failure cause
    #[error(transparent)]
    Closed(ChannelClosedError),
    /// A delimiter scan ran past its limit
    #[error(transparent)]
    LineTooLong(LineTooLongError),
    /// Line-oriented read produced bytes that are not UTF-8
    #[error(transparent)]
    InvalidUtf8(InvalidUtf8Error),
}

compound_from!(ReadError {
    EndOfStream(EndOfStreamError),
    Closed(ChannelClosedError),
    LineTooLong(LineTooLongError),
    InvalidUtf8(InvalidUtf8Error),
});

/// Error for writing into the channel
#[derive(Debug, Clone, Error)]
pub enum WriteError {
    /// The channel was closed gracefully; no further writes are accepted
    #[error(transparent)]
    ClosedForWrite(ClosedForWriteError),
    /// The channel was closed with a failure cause
    #[error(transparent)]
    Closed(ChannelClosedError),
}

compound_from!(WriteError {
    ClosedForWrite(ClosedForWriteError),
    Closed(ChannelClosedError),
});
