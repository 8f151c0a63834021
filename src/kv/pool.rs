//! Fixed-size KV connection pool.
//!
//! A pool holds `redis.redis_amount` single-connection slots. Leasing never
//! blocks: when every slot is busy (or the store refuses the connection
//! attempt) the caller simply gets `None` and degrades. The lease guard
//! returns the handle on drop, on every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::OnceCell;

use crate::config::Config;
use crate::kv::KvClient;
use crate::net::Address;

const CONNECT_TIMEOUT_MS: u64 = 2000;

struct Slot {
    client: Option<KvClient>,
    in_use: bool,
}

pub struct KvPool {
    addr: Address,
    auth: Option<String>,
    slots: Mutex<Vec<Slot>>,
    weak_self: OnceCell<Weak<KvPool>>,
}

impl KvPool {
    /// Build from the `redis.*` config keys. Connections are established
    /// lazily, at first lease, so an unreachable store does not slow down
    /// startup.
    pub fn from_config(cfg: &Config) -> Arc<KvPool> {
        let size = cfg.lookup::<u32>("redis.redis_amount", 4).max(1) as usize;
        let host = cfg.lookup_str("redis.redis_host", "127.0.0.1");
        let port = cfg.lookup::<u32>("redis.redis_port", 6379) as u16;
        let auth = if cfg.contains("redis.redis_auth") {
            Some(cfg.lookup_str("redis.redis_auth", ""))
        } else {
            None
        };
        let addr = Address::parse(&host, port).unwrap_or_else(|_| {
            log::error!("redis.redis_host {:?} is not an IPv4 address, using loopback", host);
            Address::parse("127.0.0.1", port).unwrap()
        });
        Self::new(addr, auth, size)
    }

    pub fn new(addr: Address, auth: Option<String>, size: usize) -> Arc<KvPool> {
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            slots.push(Slot {
                client: None,
                in_use: false,
            });
        }
        let pool = Arc::new(KvPool {
            addr,
            auth,
            slots: Mutex::new(slots),
            weak_self: OnceCell::new(),
        });
        pool.weak_self
            .set(Arc::downgrade(&pool))
            .ok()
            .expect("weak_self set twice");
        pool
    }

    /// Lease a connection without waiting. `None` when the pool is
    /// exhausted or the store cannot be reached.
    pub fn get(&self) -> Option<KvLease> {
        let pool = self.weak_self.get().and_then(Weak::upgrade)?;
        let (idx, existing) = {
            let mut slots = self.slots.lock().unwrap();
            let idx = slots.iter().position(|s| !s.in_use)?;
            slots[idx].in_use = true;
            (idx, slots[idx].client.take())
        };
        let client = match existing {
            Some(client) => Some(client),
            None => {
                match KvClient::connect(self.addr, self.auth.as_deref(), CONNECT_TIMEOUT_MS) {
                    Ok(client) => Some(client),
                    Err(e) => {
                        log::warn!("kv pool: connect failed: {}", e);
                        None
                    }
                }
            }
        };
        match client {
            Some(client) => Some(KvLease {
                pool,
                idx,
                client: Some(client),
            }),
            None => {
                self.release(idx, None);
                None
            }
        }
    }

    fn release(&self, idx: usize, client: Option<KvClient>) {
        let mut slots = self.slots.lock().unwrap();
        slots[idx].client = client;
        slots[idx].in_use = false;
    }

    #[cfg(test)]
    fn busy_count(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.in_use).count()
    }
}

/// RAII lease over one pooled connection.
pub struct KvLease {
    pool: Arc<KvPool>,
    idx: usize,
    client: Option<KvClient>,
}

impl Deref for KvLease {
    type Target = KvClient;

    fn deref(&self) -> &KvClient {
        self.client.as_ref().expect("leased client already returned")
    }
}

impl DerefMut for KvLease {
    fn deref_mut(&mut self) -> &mut KvClient {
        self.client.as_mut().expect("leased client already returned")
    }
}

impl Drop for KvLease {
    fn drop(&mut self) {
        self.pool.release(self.idx, self.client.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_pool(size: usize) -> Arc<KvPool> {
        // a port nothing listens on; connect fails fast on loopback
        KvPool::new(Address::parse("127.0.0.1", 1).unwrap(), None, size)
    }

    #[test]
    fn exhausted_or_unreachable_pool_leases_none() {
        let pool = unreachable_pool(2);
        assert!(pool.get().is_none());
        // the failed attempt released its slot
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn pool_size_comes_from_config() {
        let cfg = Config::from_pairs(vec![
            ("redis.redis_amount", "2"),
            ("redis.redis_host", "127.0.0.1"),
            ("redis.redis_port", "1"),
        ]);
        let pool = KvPool::from_config(&cfg);
        assert_eq!(pool.slots.lock().unwrap().len(), 2);
    }
}
