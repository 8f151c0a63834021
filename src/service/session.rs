//! TCP directory session.
//!
//! One session per accepted connection, running as a fiber on the I/O
//! reactor. The read loop blocks (cooperatively) on the framed stream;
//! request handling leases a KV connection per request and degrades to
//! status 300 when the registry is unavailable. A malformed frame drops
//! the connection; a recv timeout (the configured `tcp.recv_timeout`)
//! quietly ends the session.

use std::sync::Arc;

use crate::error::Result;
use crate::kv::KvPool;
use crate::net::{Address, Socket};
use crate::protocol::{self, command, PeerInfo, Response, Status};
use crate::service::peer::{self, fields};

/// Entry point used as the [`crate::net::TcpServer`] session handler.
pub fn serve(sock: Socket, kv: Arc<KvPool>) {
    let peer_addr = sock.remote_addr();
    log::info!(
        "session start: fd {} client {}",
        sock.fd(),
        peer_addr.map(|a| a.to_string()).unwrap_or_else(|| "?".into())
    );
    let mut session = Session {
        sock,
        kv,
        registered_uuid: None,
    };
    session.run();
    log::info!("session end: fd {}", session.sock.fd());
}

struct Session {
    sock: Socket,
    kv: Arc<KvPool>,
    /// uuid this connection registered, for idempotent refresh and for
    /// excluding the caller from directory listings.
    registered_uuid: Option<String>,
}

impl Session {
    fn run(&mut self) {
        let mut header = [0u8; protocol::HEADER_SIZE];
        loop {
            match self.sock.recv_exact(&mut header) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("fd {}: client closed", self.sock.fd());
                    return;
                }
                Err(e) => {
                    if !e.is_timeout() {
                        log::warn!("fd {}: recv failed: {}", self.sock.fd(), e);
                    }
                    return;
                }
            }
            let (cmd, _send_time, len) = match protocol::parse_header(&header) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("fd {}: {}; dropping connection", self.sock.fd(), e);
                    return;
                }
            };
            let mut payload = vec![0u8; len];
            if len > 0 {
                match self.sock.recv_exact(&mut payload) {
                    Ok(true) => {}
                    _ => return,
                }
            }

            let outcome = match cmd {
                command::SEND_PEER_INFO => self.on_send_peer_info(&payload),
                command::GET_PEER_INFO => self.on_get_peer_info(),
                command::CONNECT_TO_PEER => self.on_connect_to_peer(),
                other => {
                    log::warn!("fd {}: unknown command 0x{:04x}", self.sock.fd(), other);
                    continue;
                }
            };
            if let Err(e) = outcome {
                log::warn!("fd {}: request failed: {}", self.sock.fd(), e);
                return;
            }
        }
    }

    fn remote(&self) -> Address {
        self.sock
            .remote_addr()
            .expect("accepted socket has a peer address")
    }

    /// Register or refresh this peer: derive its uuid from name and source
    /// IP, store the TCP endpoint and hand the uuid back.
    fn on_send_peer_info(&mut self, payload: &[u8]) -> Result<()> {
        let info = PeerInfo::decode(payload)?;
        let remote = self.remote();
        let ip = remote.ip().to_string();
        let uuid = peer::derive_uuid(&info.peer_name, &ip);
        log::debug!(
            "fd {}: register {:?} from {} -> {}",
            self.sock.fd(),
            info.peer_name,
            remote,
            uuid
        );

        let mut response = Response::ok(command::R_SEND_PEER_INFO);
        match self.kv.get() {
            Some(mut kv) => {
                if let Some(old) = self.registered_uuid.take() {
                    // refresh: retire the previous registration
                    let _ = kv.del(&old);
                }
                let port = remote.port().to_string();
                if kv
                    .hset_multi(
                        &uuid,
                        &[
                            (fields::NAME, info.peer_name.as_str()),
                            (fields::TCPHOST, ip.as_str()),
                            (fields::TCPPORT, port.as_str()),
                        ],
                    )
                    .is_err()
                {
                    response = Response::with_status(
                        command::R_SEND_PEER_INFO,
                        Status::RedisServerError,
                    );
                }
            }
            None => {
                response =
                    Response::with_status(command::R_SEND_PEER_INFO, Status::RedisServerError);
            }
        }
        self.registered_uuid = Some(uuid.clone());

        let assigned = PeerInfo {
            host_binary: 0,
            port_binary: 0,
            uuid,
            peer_name: info.peer_name,
        };
        let wire = protocol::encode_reply(command::R_SEND_PEER_INFO, response, &[assigned]);
        self.sock.send_all(&wire)
    }

    /// List every registered peer (excluding the caller) that has a known
    /// UDP endpoint.
    fn on_get_peer_info(&mut self) -> Result<()> {
        let mut response = Response::ok(command::R_GET_PEER_INFO);
        let mut peers = Vec::new();

        match self.kv.get() {
            None => {
                response =
                    Response::with_status(command::R_GET_PEER_INFO, Status::RedisServerError);
            }
            Some(mut kv) => match kv.keys("*") {
                Err(e) => {
                    log::warn!("fd {}: key enumeration failed: {}", self.sock.fd(), e);
                    response =
                        Response::with_status(command::R_GET_PEER_INFO, Status::RedisServerError);
                }
                Ok(uuids) => {
                    for uuid in uuids {
                        if self.registered_uuid.as_deref() == Some(uuid.as_str()) {
                            continue;
                        }
                        let record = match kv.hgetall(&uuid) {
                            Ok(record) => record,
                            Err(_) => continue,
                        };
                        let name = record.get(fields::NAME);
                        let udphost = record.get(fields::UDPHOST);
                        let udpport = record.get(fields::UDPPORT);
                        let (name, udphost, udpport) = match (name, udphost, udpport) {
                            (Some(n), Some(h), Some(p)) => (n, h, p),
                            // no UDP endpoint yet: not reachable, skip
                            _ => continue,
                        };
                        let port: u16 = match udpport.parse() {
                            Ok(port) => port,
                            Err(_) => continue,
                        };
                        let addr = match Address::parse(udphost, port) {
                            Ok(addr) => addr,
                            Err(_) => continue,
                        };
                        peers.push(PeerInfo {
                            host_binary: addr.host_binary(),
                            port_binary: addr.port_binary(),
                            uuid,
                            peer_name: name.clone(),
                        });
                    }
                }
            },
        }

        let wire = protocol::encode_reply(command::R_GET_PEER_INFO, response, &peers);
        self.sock.send_all(&wire)
    }

    /// TCP-side connect request: the real introduction runs over the UDP
    /// path, so this just acknowledges.
    fn on_connect_to_peer(&mut self) -> Result<()> {
        let wire = protocol::encode_reply(
            command::R_CONNECT_TO_PEER,
            Response::ok(command::R_CONNECT_TO_PEER),
            &[],
        );
        self.sock.send_all(&wire)
    }
}
