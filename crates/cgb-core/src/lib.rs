//! Channel guard bot for a voice server's query interface.
//!
//! The bot logs in over the query interface, joins one channel and reacts to
//! clients arriving there: a permission check against an allow-list of server
//! groups, then one of two configured actions. The query transport itself is
//! a port ([`ports::QueryTransport`]) implemented by adapter crates.

pub mod actions;
pub mod config;
pub mod domain;
pub mod errors;
pub mod guard;
pub mod keepalive;
pub mod logging;
pub mod ports;
pub mod session;

#[cfg(test)]
mod fake;

pub use errors::{Error, Result};
