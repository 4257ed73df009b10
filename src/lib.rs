//! Toolgate - one HTTP endpoint in front of many stdio tool servers
//!
//! This library provides a gateway that:
//! - Spawns configured tool servers as child processes speaking JSON-RPC over stdio
//! - Gives each SSE client a session spliced to one backend
//! - Answers `tools/list` and `tools/call` across every running backend
//! - Correlates gateway-issued requests with their responses by id, with a timeout

pub mod config;
pub mod error;
pub mod gateway;
pub mod jsonrpc;
pub mod process;
pub mod proxy;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;
