//! Directory services: the TCP registration/lookup session and the UDP
//! keep-alive and introduction handler. Both are plain straight-line fiber
//! code over the socket façade and the KV pool.

pub mod peer;
pub mod session;
pub mod udp;

pub use udp::UdpService;
