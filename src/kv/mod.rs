//! External KV registry access.
//!
//! The peer registry lives in a Redis-compatible store. [`KvClient`] speaks
//! just enough RESP2 over the crate's own socket façade — so KV round trips
//! are fiber suspension points like all other I/O — and [`KvPool`] holds a
//! fixed number of single-connection handles behind a non-blocking lease.
//!
//! The store is never load-bearing for liveness: every caller treats an
//! exhausted pool or an unreachable server as a degraded (status 300)
//! response, not a failure of the server itself.

mod client;
mod pool;

pub use client::{KvClient, Reply};
pub use pool::{KvLease, KvPool};
