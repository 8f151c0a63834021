//! UDP keep-alive and introduction service.
//!
//! Peers that registered over TCP report their external UDP endpoint here
//! (`SEND_PEER_INFO` with their assigned uuid), keep it fresh with
//! `HEARTBEAT_DETECT`, and ask the server to introduce them to another live
//! peer with `CONNECT_TO_PEER`. An introduction is one `CONNECT_TO_ME`
//! frame sent to the target's recorded address, carrying the initiator's
//! externally observed endpoint — after that, hole punching is the
//! clients' business.
//!
//! Liveness is in-process only: a map uuid → (last address, last seen ms),
//! swept once a second. An entry older than `udp.disconnection_timeout_ms`
//! is evicted and its `udphost`/`udpport` fields are removed from the KV
//! record. KV calls run outside the map lock, and eviction happens after
//! the KV cleanup completed, re-checking the timestamp so a peer that
//! revived mid-sweep is kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::OnceCell;

use crate::clock;
use crate::config::Config;
use crate::error::Result;
use crate::kv::KvPool;
use crate::logger;
use crate::net::{Address, SockType, Socket};
use crate::protocol::{self, command, PeerInfo, Response, Status};
use crate::reactor::IoManager;
use crate::service::peer::fields;

const SWEEP_PERIOD_MS: u64 = 1000;

pub struct UdpService {
    sock: Socket,
    io_worker: Arc<IoManager>,
    process_worker: Arc<IoManager>,
    kv: Arc<KvPool>,
    /// uuid → (last observed address, last seen monotonic ms).
    liveness: Mutex<HashMap<String, (Address, u64)>>,
    disconnection_timeout_ms: u64,
    sweep_timer: AtomicU64,
    stop: AtomicBool,
    weak_self: OnceCell<Weak<UdpService>>,
}

impl UdpService {
    pub fn new(
        cfg: &Config,
        io_worker: Arc<IoManager>,
        process_worker: Arc<IoManager>,
        kv: Arc<KvPool>,
    ) -> Result<Arc<UdpService>> {
        let sock = Socket::new(SockType::Dgram)?;
        let svc = Arc::new(UdpService {
            sock,
            io_worker,
            process_worker,
            kv,
            liveness: Mutex::new(HashMap::new()),
            disconnection_timeout_ms: cfg.lookup::<u32>("udp.disconnection_timeout_ms", 3000)
                as u64,
            sweep_timer: AtomicU64::new(0),
            stop: AtomicBool::new(true),
            weak_self: OnceCell::new(),
        });
        svc.weak_self
            .set(Arc::downgrade(&svc))
            .ok()
            .expect("weak_self set twice");
        Ok(svc)
    }

    pub fn bind(&self, addr: Address) -> Result<()> {
        self.sock.bind(addr)
    }

    pub fn local_addr(&self) -> Option<Address> {
        self.sock.local_addr()
    }

    /// Schedule the datagram loop on the I/O reactor and the liveness
    /// sweep on the work reactor. Idempotent.
    pub fn start(&self) {
        if !self.stop.swap(false, Ordering::SeqCst) {
            return;
        }
        let weak = match self.weak_self.get() {
            Some(weak) => weak.clone(),
            None => return,
        };
        if let Some(svc) = weak.upgrade() {
            self.io_worker.schedule(move || svc.read_loop());
        }

        let id = self.process_worker.add_timer(
            SWEEP_PERIOD_MS,
            move || {
                if let Some(svc) = weak.upgrade() {
                    svc.sweep();
                }
            },
            SWEEP_PERIOD_MS,
        );
        self.sweep_timer.store(id, Ordering::SeqCst);
    }

    /// Cancel the sweep and tear the socket down. The cancel+close pair
    /// runs as a task on the I/O reactor so it serializes with the read
    /// fiber's re-arming.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.process_worker
            .cancel_timer(self.sweep_timer.load(Ordering::SeqCst));
        let svc = match self.weak_self.get().and_then(Weak::upgrade) {
            Some(svc) => svc,
            None => return,
        };
        self.io_worker.schedule(move || {
            svc.io_worker.cancel_all(svc.sock.fd());
            svc.sock.close();
        });
    }

    /// Number of live peers. Diagnostics/test hook.
    pub fn live_peers(&self) -> usize {
        self.liveness.lock().unwrap().len()
    }

    pub fn is_live(&self, uuid: &str) -> bool {
        self.liveness.lock().unwrap().contains_key(uuid)
    }

    fn read_loop(self: Arc<Self>) {
        log::info!(
            "udp service listening on {}",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "<unbound>".into())
        );
        let mut buf = vec![0u8; 64 * 1024];
        while !self.stop.load(Ordering::SeqCst) {
            let (n, from) = match self.sock.recvfrom(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    log::error!("udp recvfrom failed: {}", e);
                    break;
                }
            };
            if n == 0 {
                continue;
            }
            self.handle_datagram(&buf[..n], from);
        }
        log::info!("udp read loop exits");
    }

    fn handle_datagram(&self, data: &[u8], from: Address) {
        if log::log_enabled!(logger::DUMP_LEVEL) {
            log::debug!("udp {} -> {} bytes:{}", from, data.len(), logger::hex_dump(data));
        }
        let frame = match protocol::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                // UDP: skip the datagram, keep serving
                log::warn!("udp {}: {}", from, e);
                return;
            }
        };
        match frame.cmd {
            command::SEND_PEER_INFO => self.on_register(frame.payload, from),
            command::HEARTBEAT_DETECT => self.on_heartbeat(frame.payload, from),
            command::CONNECT_TO_PEER => self.on_introduce(frame.payload, from),
            other => log::warn!("udp {}: unknown command 0x{:04x}", from, other),
        }
    }

    fn reply(&self, flag: u16, status: Status, to: Address) {
        let wire = protocol::encode_reply(flag, Response::with_status(flag, status), &[]);
        if let Err(e) = self.sock.sendto(&wire, to) {
            log::warn!("udp reply to {} failed: {}", to, e);
        }
    }

    /// First UDP contact: record the observed endpoint in the liveness map
    /// and, when the uuid is registered, in the KV record.
    fn on_register(&self, payload: &[u8], from: Address) {
        let info = match PeerInfo::decode(payload) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("udp {}: {}", from, e);
                return;
            }
        };
        let uuid = info.uuid;
        log::debug!("udp register {} from {}", uuid, from);
        self.liveness
            .lock()
            .unwrap()
            .insert(uuid.clone(), (from, clock::monotonic_ms()));

        let status = match self.kv.get() {
            Some(mut kv) => match kv.exists(&uuid) {
                Ok(true) => {
                    let ip = from.ip().to_string();
                    let port = from.port().to_string();
                    match kv.hset_multi(
                        &uuid,
                        &[(fields::UDPHOST, ip.as_str()), (fields::UDPPORT, port.as_str())],
                    ) {
                        Ok(()) => Status::Ok,
                        Err(_) => Status::RedisServerError,
                    }
                }
                Ok(false) => Status::NoContent,
                Err(_) => Status::RedisServerError,
            },
            None => Status::RedisServerError,
        };
        self.reply(command::R_SEND_PEER_INFO, status, from);
    }

    /// Heartbeat: refresh a live peer, reject one the registry or the
    /// sweep has forgotten.
    fn on_heartbeat(&self, payload: &[u8], from: Address) {
        let info = match PeerInfo::decode(payload) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("udp {}: {}", from, e);
                return;
            }
        };
        let uuid = info.uuid;

        // registry is authoritative: a deleted uuid is dropped from
        // liveness immediately
        if let Some(mut kv) = self.kv.get() {
            if matches!(kv.exists(&uuid), Ok(false)) {
                self.liveness.lock().unwrap().remove(&uuid);
                self.reply(command::R_HEARTBEAT_DETECT, Status::NoContent, from);
                return;
            }
        }

        let known = {
            let mut liveness = self.liveness.lock().unwrap();
            match liveness.get_mut(&uuid) {
                Some(entry) => {
                    *entry = (from, clock::monotonic_ms());
                    true
                }
                None => false,
            }
        };
        if !known {
            self.reply(command::R_HEARTBEAT_DETECT, Status::NoContent, from);
            return;
        }

        if let Some(mut kv) = self.kv.get() {
            let ip = from.ip().to_string();
            let port = from.port().to_string();
            let _ = kv.hset_multi(
                &uuid,
                &[(fields::UDPHOST, ip.as_str()), (fields::UDPPORT, port.as_str())],
            );
        }
        self.reply(command::R_HEARTBEAT_DETECT, Status::Ok, from);
    }

    /// Introduction: relay the initiator's observed endpoint to the live
    /// target, `CONNECT_TO_ME`.
    fn on_introduce(&self, payload: &[u8], from: Address) {
        if payload.len() < 2 * protocol::PEER_INFO_SIZE {
            log::warn!("udp {}: short introduction payload", from);
            return;
        }
        let initiator = match PeerInfo::decode(&payload[..protocol::PEER_INFO_SIZE]) {
            Ok(info) => info,
            Err(_) => return,
        };
        let target = match PeerInfo::decode(&payload[protocol::PEER_INFO_SIZE..]) {
            Ok(info) => info,
            Err(_) => return,
        };

        let target_addr = self
            .liveness
            .lock()
            .unwrap()
            .get(&target.uuid)
            .map(|(addr, _)| *addr);
        let target_addr = match target_addr {
            Some(addr) => addr,
            None => {
                log::debug!(
                    "udp introduce: target {} not live, telling {}",
                    target.uuid,
                    from
                );
                self.reply(command::R_CONNECT_TO_PEER, Status::NotFound, from);
                return;
            }
        };

        log::info!(
            "udp introduce: {} at {} -> {} at {}",
            initiator.uuid,
            from,
            target.uuid,
            target_addr
        );
        let intro = PeerInfo {
            host_binary: from.host_binary(),
            port_binary: from.port_binary(),
            uuid: initiator.uuid,
            peer_name: initiator.peer_name,
        };
        let wire = protocol::encode(command::CONNECT_TO_ME, &intro.encode());
        if let Err(e) = self.sock.sendto(&wire, target_addr) {
            log::warn!("udp introduce: send to {} failed: {}", target_addr, e);
        }
        self.reply(command::R_CONNECT_TO_PEER, Status::Ok, from);
    }

    /// 1 Hz eviction pass over the liveness map.
    fn sweep(&self) {
        let cutoff = clock::monotonic_ms().saturating_sub(self.disconnection_timeout_ms);
        let expired: Vec<String> = {
            let liveness = self.liveness.lock().unwrap();
            liveness
                .iter()
                .filter(|(_, (_, seen))| *seen < cutoff)
                .map(|(uuid, _)| uuid.clone())
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        // KV cleanup first, outside the lock
        match self.kv.get() {
            Some(mut kv) => {
                for uuid in &expired {
                    match kv.exists(uuid) {
                        Ok(true) => {
                            let _ = kv.hdel(uuid, &[fields::UDPHOST, fields::UDPPORT]);
                        }
                        _ => log::warn!("sweep: uuid {} not in the registry", uuid),
                    }
                }
            }
            None => log::warn!("sweep: kv pool exhausted, evicting from memory only"),
        }

        let mut evicted = 0;
        {
            let mut liveness = self.liveness.lock().unwrap();
            for uuid in &expired {
                // skip peers that revived while the KV calls were running
                if let Some((_, seen)) = liveness.get(uuid) {
                    if *seen < cutoff {
                        liveness.remove(uuid);
                        evicted += 1;
                    }
                }
            }
        }
        log::debug!("sweep: evicted {} peer(s)", evicted);
    }
}
