#[macro_use]
extern crate tracing;

pub extern crate bytes;

mod channel;

pub use crate::channel::api::*;

/// Error types
pub mod error {
    pub use crate::channel::error::*;
}
