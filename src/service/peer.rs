//! Peer identity and registry schema.

use md5::{Digest, Md5};

/// Field names of a peer's KV hash, keyed by uuid.
pub mod fields {
    pub const NAME: &str = "name";
    pub const TCPHOST: &str = "tcphost";
    pub const TCPPORT: &str = "tcpport";
    pub const UDPHOST: &str = "udphost";
    pub const UDPPORT: &str = "udpport";
}

/// Deterministic peer id: the MD5 hex digest of `name + "+" + tcp_ip`.
/// Equal inputs always yield the same uuid; re-registering from the same
/// address is idempotent by construction.
pub fn derive_uuid(name: &str, ip: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(name.as_bytes());
    hasher.update(b"+");
    hasher.update(ip.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_is_a_pure_function_of_name_and_ip() {
        let a = derive_uuid("alice", "198.51.100.7");
        let b = derive_uuid("alice", "198.51.100.7");
        assert_eq!(a, b);
        assert_ne!(a, derive_uuid("alice", "198.51.100.8"));
        assert_ne!(a, derive_uuid("bob", "198.51.100.7"));
    }

    #[test]
    fn uuid_matches_md5_of_the_composed_key() {
        // md5("alice+198.51.100.7")
        assert_eq!(
            derive_uuid("alice", "198.51.100.7"),
            "effaffb30c8f6120939b0b81b61aa1a0"
        );
        assert_eq!(derive_uuid("alice", "198.51.100.7").len(), 32);
    }
}
