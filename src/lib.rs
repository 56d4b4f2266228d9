//! ssrelay-rs
//!
//! A local SOCKS5 endpoint that relays each client connection through an
//! encrypted tunnel server, optionally reached via a forward SOCKS5 or HTTP
//! proxy.

pub mod cli;
pub mod common;
pub mod config;
pub mod connectors;
pub mod context;
pub mod crypto;
pub mod io;
pub mod relay;
pub mod server;
pub mod stats;
pub mod strategy;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::Config;
pub use context::TargetAddress;
pub use relay::{ConnectionHandler, ConnectionRegistry, RelayServices};
pub use server::RelayServer;
