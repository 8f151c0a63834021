//! Owned socket façade.
//!
//! A [`Socket`] owns its descriptor for the descriptor's whole open period:
//! dropping or closing the façade cancels any reactor interest (through the
//! hook layer) and releases the descriptor, which upholds the rule that a
//! descriptor outlives every registration referring to it.
//!
//! All operations are thin wrappers over [`crate::hook`], so the same
//! `Socket` works from a fiber (suspending on would-block) and from a plain
//! thread (degrading to blocking behaviour).

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::fd::TimeoutKind;
use crate::hook;
use crate::net::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Dgram,
}

impl SockType {
    fn raw(self) -> libc::c_int {
        match self {
            SockType::Stream => libc::SOCK_STREAM,
            SockType::Dgram => libc::SOCK_DGRAM,
        }
    }
}

pub struct Socket {
    fd: AtomicI32,
    ty: SockType,
    connected: AtomicBool,
    local: Mutex<Option<Address>>,
    remote: Mutex<Option<Address>>,
}

const INVALID_SOCKET: libc::c_int = -1;

impl Socket {
    /// Create a fresh AF_INET socket of the given type. Stream sockets get
    /// `SO_REUSEADDR`, `TCP_NODELAY` and `SO_KEEPALIVE` applied up front.
    pub fn new(ty: SockType) -> Result<Socket> {
        let fd = hook::socket(libc::AF_INET, ty.raw(), 0)?;
        let sock = Socket {
            fd: AtomicI32::new(fd),
            ty,
            connected: AtomicBool::new(false),
            local: Mutex::new(None),
            remote: Mutex::new(None),
        };
        if ty == SockType::Stream {
            sock.init_stream_options()?;
        }
        Ok(sock)
    }

    /// Wrap an accepted descriptor. The FD entry was created by
    /// `hook::accept`.
    pub(crate) fn from_accepted(fd: RawFd, remote: Address) -> Socket {
        let sock = Socket {
            fd: AtomicI32::new(fd),
            ty: SockType::Stream,
            connected: AtomicBool::new(true),
            local: Mutex::new(None),
            remote: Mutex::new(Some(remote)),
        };
        if let Err(e) = sock.init_stream_options() {
            log::warn!("fd {}: stream option setup failed: {}", fd, e);
        }
        sock
    }

    fn init_stream_options(&self) -> Result<()> {
        let fd = self.fd();
        let one: libc::c_int = 1;
        hook::set_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &one)?;
        hook::set_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, &one)?;
        hook::set_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &one)?;
        Ok(())
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd() != INVALID_SOCKET
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn sock_type(&self) -> SockType {
        self.ty
    }

    pub fn bind(&self, addr: Address) -> Result<()> {
        let sa = addr.to_sockaddr();
        let rc = unsafe {
            libc::bind(
                self.fd(),
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = Error::last_os();
            log::error!("bind {} on fd {} failed: {}", addr, self.fd(), err);
            return Err(err);
        }
        *self.local.lock().unwrap() = Some(addr);
        Ok(())
    }

    pub fn listen(&self, backlog: libc::c_int) -> Result<()> {
        let rc = unsafe { libc::listen(self.fd(), backlog) };
        if rc != 0 {
            let err = Error::last_os();
            log::error!("listen on fd {} failed: {}", self.fd(), err);
            return Err(err);
        }
        Ok(())
    }

    /// Accept one connection; suspends the calling fiber until a client
    /// arrives (or the recv timeout set on the listener fires).
    pub fn accept(&self) -> Result<Socket> {
        let (fd, remote) = hook::accept(self.fd())?;
        log::debug!("fd {}: accepted client {} on fd {}", self.fd(), remote, fd);
        Ok(Socket::from_accepted(fd, remote))
    }

    /// Connect with the hook layer's default deadline.
    pub fn connect(&self, addr: Address) -> Result<()> {
        self.connect_with_timeout(addr, hook::DEFAULT_CONNECT_TIMEOUT_MS)
    }

    pub fn connect_with_timeout(&self, addr: Address, timeout_ms: u64) -> Result<()> {
        *self.remote.lock().unwrap() = Some(addr);
        hook::connect_with_timeout(self.fd(), &addr, timeout_ms).map_err(|e| {
            log::error!("fd {} connect to {} failed: {}", self.fd(), addr, e);
            Error::Syscall(e)
        })?;
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.refresh_local_addr();
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(hook::recv(self.fd(), buf, 0)?)
    }

    /// Read exactly `buf.len()` bytes. `Ok(false)` reports clean EOF before
    /// the first byte; a mid-record EOF is a malformed-frame error.
    pub fn recv_exact(&self, buf: &mut [u8]) -> Result<bool> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.recv(&mut buf[done..])?;
            if n == 0 {
                if done == 0 {
                    return Ok(false);
                }
                return Err(Error::FrameMalformed("connection closed mid-record"));
            }
            done += n;
        }
        Ok(true)
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(hook::send(self.fd(), buf, 0)?)
    }

    /// Write the whole buffer, suspending as needed.
    pub fn send_all(&self, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            done += self.send(&buf[done..])?;
        }
        Ok(())
    }

    pub fn recvfrom(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        Ok(hook::recvfrom(self.fd(), buf, 0)?)
    }

    pub fn sendto(&self, buf: &[u8], addr: Address) -> Result<usize> {
        Ok(hook::sendto(self.fd(), buf, 0, &addr)?)
    }

    /// Record + forward a per-direction timeout (see
    /// [`hook::set_socket_timeout`]).
    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) -> Result<()> {
        Ok(hook::set_socket_timeout(self.fd(), kind, ms)?)
    }

    pub fn set_keep_alive(&self, on: bool) -> Result<()> {
        let v: libc::c_int = if on { 1 } else { 0 };
        Ok(hook::set_option(
            self.fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &v,
        )?)
    }

    pub fn local_addr(&self) -> Option<Address> {
        let cached = *self.local.lock().unwrap();
        match cached {
            Some(addr) => Some(addr),
            None => self.refresh_local_addr(),
        }
    }

    fn refresh_local_addr(&self) -> Option<Address> {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd(),
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return None;
        }
        let addr = Address::from_sockaddr(&sa);
        *self.local.lock().unwrap() = Some(addr);
        Some(addr)
    }

    pub fn remote_addr(&self) -> Option<Address> {
        *self.remote.lock().unwrap()
    }

    /// Idempotent close: cancels reactor interest and releases the
    /// descriptor.
    pub fn close(&self) {
        let fd = self.fd.swap(INVALID_SOCKET, Ordering::SeqCst);
        if fd == INVALID_SOCKET {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = hook::close(fd) {
            log::warn!("close fd {} failed: {}", fd, e);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd())
            .field("type", &self.ty)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn close_is_idempotent() {
        let sock = Socket::new(SockType::Dgram).unwrap();
        assert!(sock.is_valid());
        sock.close();
        assert!(!sock.is_valid());
        sock.close();
        assert!(!sock.is_valid());
    }

    #[test]
    fn bind_records_the_local_address() {
        let sock = Socket::new(SockType::Dgram).unwrap();
        let addr = Address::new(Ipv4Addr::LOCALHOST, 0);
        sock.bind(addr).unwrap();
        // port 0 binding: the kernel-assigned port is visible via
        // getsockname
        let local = sock.refresh_local_addr().unwrap();
        assert_eq!(local.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn dgram_loopback_round_trip() {
        // hook disabled on the test thread: plain syscalls, but the fd is
        // system-nonblocking, so poll until readable
        let a = Socket::new(SockType::Dgram).unwrap();
        let b = Socket::new(SockType::Dgram).unwrap();
        a.bind(Address::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        b.bind(Address::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let to = a.refresh_local_addr().unwrap();

        b.sendto(b"ping", to).unwrap();

        let mut pfd = libc::pollfd {
            fd: a.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        assert!(unsafe { libc::poll(&mut pfd, 1, 2000) } > 0);

        let mut buf = [0u8; 16];
        let (n, from) = a.recvfrom(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(Some(from), b.refresh_local_addr());
    }
}
