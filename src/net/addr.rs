//! IPv4 endpoint wrapper converting between the std types and
//! `sockaddr_in`.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use crate::error::{Error, Result};

/// An IPv4 `host:port` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(SocketAddrV4);

impl Address {
    pub fn new(ip: Ipv4Addr, port: u16) -> Address {
        Address(SocketAddrV4::new(ip, port))
    }

    /// Parse a dotted-quad host. Hostname resolution is not part of this
    /// server's configuration surface.
    pub fn parse(host: &str, port: u16) -> Result<Address> {
        let ip = Ipv4Addr::from_str(host)
            .map_err(|_| Error::ConfigInvalid(format!("invalid IPv4 host {:?}", host)))?;
        Ok(Address::new(ip, port))
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// The IP in network byte order, as carried in `PeerInfo.host_binary`.
    pub fn host_binary(&self) -> u32 {
        u32::from_le_bytes(self.ip().octets())
    }

    /// The port in network byte order, as carried in
    /// `PeerInfo.port_binary`.
    pub fn port_binary(&self) -> u16 {
        self.port().to_be()
    }

    /// Rebuild an endpoint from the network-byte-order wire fields.
    pub fn from_binary(host_binary: u32, port_binary: u16) -> Address {
        Address::new(
            Ipv4Addr::from(host_binary.to_le_bytes()),
            u16::from_be(port_binary),
        )
    }

    pub fn to_sockaddr(&self) -> libc::sockaddr_in {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = self.port().to_be();
        sa.sin_addr.s_addr = u32::from(self.ip()).to_be();
        sa
    }

    pub fn from_sockaddr(sa: &libc::sockaddr_in) -> Address {
        Address::new(
            Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
            u16::from_be(sa.sin_port),
        )
    }
}

impl From<SocketAddrV4> for Address {
    fn from(sa: SocketAddrV4) -> Address {
        Address(sa)
    }
}

impl From<Address> for SocketAddrV4 {
    fn from(addr: Address) -> SocketAddrV4 {
        addr.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip() {
        let addr = Address::parse("198.51.100.7", 12000).unwrap();
        let sa = addr.to_sockaddr();
        assert_eq!(u16::from_be(sa.sin_port), 12000);
        assert_eq!(Address::from_sockaddr(&sa), addr);
    }

    #[test]
    fn binary_fields_round_trip() {
        let addr = Address::parse("10.1.2.3", 4242).unwrap();
        let rebuilt = Address::from_binary(addr.host_binary(), addr.port_binary());
        assert_eq!(rebuilt, addr);
        // the LE encoding of host_binary writes the octets in address order
        assert_eq!(addr.host_binary().to_le_bytes(), [10, 1, 2, 3]);
    }

    #[test]
    fn rejects_bad_host() {
        assert!(Address::parse("example.com", 80).is_err());
    }
}
