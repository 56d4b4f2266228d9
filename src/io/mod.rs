//! Socket abstraction for the relay.
//!
//! This module provides:
//! - `Socket` trait, a `&self` socket so both relay directions can share one handle
//! - `StreamSocket`, the tokio TCP implementation with cancellable close
//! - `send_fully` for short-write recovery

mod copy;
mod socket;

#[cfg(test)]
pub mod mocks;

pub use copy::send_fully;
pub use socket::{Socket, SocketKind, SocketRef, StreamSocket};
