//! File-spool RPC bridge between an MCP server and the RenderDoc UI extension.
//!
//! RenderDoc's embedded Python cannot open sockets, so both sides exchange JSON messages through
//! a shared directory. This crate provides:
//! - the spool itself, with atomic publication and claim-by-rename reads,
//! - id correlation that discards stale responses,
//! - a heartbeat monitor that tells a busy remote side from a dead one,
//! - lifecycle counters and diagnostics snapshots, queryable while a call is in flight,
//! - [`ClientBridge`] (caller side) and [`RemoteHost`] (poller/executor side).
//!
//! For the MCP stdio server built on top of it, see the `renderdog-mcp` crate.

mod client;
mod config;
mod correlation;
mod diagnostics;
mod error;
mod executor;
mod heartbeat;
mod protocol;
mod remote;
mod spool;
mod tracker;

pub use client::*;
pub use config::*;
pub use correlation::*;
pub use diagnostics::*;
pub use error::*;
pub use executor::*;
pub use heartbeat::*;
pub use protocol::*;
pub use remote::*;
pub use spool::*;
pub use tracker::*;
