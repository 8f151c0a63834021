//! Fiber-based UDP/TCP hole-punching rendezvous server.
//!
//! Peers register their externally observed addresses over TCP, keep the
//! registration alive over UDP, and ask the server to introduce them to each
//! other so they can attempt a direct connection across their NATs.
//!
//! The interesting part of the crate is the substrate underneath the two
//! protocol services:
//!
//! - [`fiber`] — stackful cooperative coroutines scheduled M:N over a pool of
//!   worker threads,
//! - [`reactor`] — an edge-triggered epoll loop integrating a per-reactor
//!   timer wheel, which wakes fibers when their descriptors become ready,
//! - [`hook`] — fiber-aware replacements for the blocking socket calls that
//!   suspend the calling fiber instead of the thread on would-block,
//! - [`net`] — an owned socket façade routing through the hook layer, so
//!   service code reads as plain blocking I/O.
//!
//! On top of that sit [`protocol`] (the fixed-header little-endian wire
//! format), [`kv`] (the connection pool talking to the external registry
//! store) and [`service`] (the TCP directory session and the UDP keep-alive
//! and introduction handler).

pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod kv;
pub mod logger;
pub mod net;
pub mod protocol;
pub mod reactor;
pub mod service;

pub use error::{Error, Result};

/// Re-export of the reactor handle, the type most callers interact with.
pub use reactor::IoManager;
