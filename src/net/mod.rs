//! Socket layer: the owned descriptor façade and the TCP accept
//! dispatcher. Everything routes through the [`crate::hook`] layer, so
//! calls made from fibers suspend instead of blocking their worker.

mod addr;
mod socket;
mod tcp_server;

pub use addr::Address;
pub use socket::{SockType, Socket};
pub use tcp_server::TcpServer;
