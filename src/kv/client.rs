//! Minimal RESP2 client.
//!
//! Commands are written as arrays of bulk strings, replies parsed into
//! [`Reply`]. Connection-level failures surface as
//! [`Error::KvUnavailable`]; one transparent reconnect-and-retry is
//! attempted per command, mirroring how the registry is expected to come
//! and go without taking the directory down.

use std::collections::HashMap;
use std::str;

use crate::error::{Error, Result};
use crate::fd::TimeoutKind;
use crate::net::{Address, SockType, Socket};

/// Socket deadlines for registry round trips, so a wedged store cannot
/// park a service fiber forever.
const KV_IO_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    /// `None` is the RESP nil bulk.
    Bulk(Option<Vec<u8>>),
    /// `None` is the RESP nil array.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Bulk or simple payload as a string.
    pub fn as_string(&self) -> Option<String> {
        match self {
            Reply::Simple(s) => Some(s.clone()),
            Reply::Bulk(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(n) => Some(*n),
            _ => None,
        }
    }
}

pub struct KvClient {
    sock: Socket,
    addr: Address,
    auth: Option<String>,
    rbuf: Vec<u8>,
    rpos: usize,
}

impl KvClient {
    /// Connect, authenticate when a password is configured, and verify the
    /// link with a PING.
    pub fn connect(addr: Address, auth: Option<&str>, timeout_ms: u64) -> Result<KvClient> {
        let sock = Self::open_socket(addr, timeout_ms)?;
        let mut client = KvClient {
            sock,
            addr,
            auth: auth.map(str::to_owned),
            rbuf: Vec::new(),
            rpos: 0,
        };
        client.handshake()?;
        Ok(client)
    }

    fn open_socket(addr: Address, timeout_ms: u64) -> Result<Socket> {
        let sock = Socket::new(SockType::Stream)?;
        sock.connect_with_timeout(addr, timeout_ms)
            .map_err(|e| Error::KvUnavailable(format!("connect {}: {}", addr, e)))?;
        sock.set_timeout(TimeoutKind::Recv, KV_IO_TIMEOUT_MS)?;
        sock.set_timeout(TimeoutKind::Send, KV_IO_TIMEOUT_MS)?;
        Ok(sock)
    }

    fn handshake(&mut self) -> Result<()> {
        if let Some(pwd) = self.auth.clone() {
            let reply = self.raw_command(&[b"AUTH", pwd.as_bytes()])?;
            if let Reply::Error(e) = reply {
                return Err(Error::KvUnavailable(format!("auth rejected: {}", e)));
            }
        }
        match self.raw_command(&[b"PING"])? {
            Reply::Simple(ref s) if s == "PONG" => Ok(()),
            other => Err(Error::KvUnavailable(format!("unexpected PING reply: {:?}", other))),
        }
    }

    /// Drop the connection and establish a fresh one.
    pub fn reconnect(&mut self) -> Result<()> {
        self.sock.close();
        self.sock = Self::open_socket(self.addr, KV_IO_TIMEOUT_MS)?;
        self.rbuf.clear();
        self.rpos = 0;
        self.handshake()
    }

    /// Run one command. A connection-level failure triggers a single
    /// reconnect and retry before giving up.
    pub fn command(&mut self, args: &[&[u8]]) -> Result<Reply> {
        match self.raw_command(args) {
            Ok(reply) => Ok(reply),
            Err(_) => {
                self.reconnect()?;
                self.raw_command(args)
            }
        }
    }

    fn raw_command(&mut self, args: &[&[u8]]) -> Result<Reply> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        self.sock
            .send_all(&out)
            .map_err(|e| Error::KvUnavailable(format!("send: {}", e)))?;
        self.read_reply()
    }

    fn read_reply(&mut self) -> Result<Reply> {
        let line = self.read_line()?;
        if line.is_empty() {
            return Err(Error::KvUnavailable("empty reply line".into()));
        }
        let kind = line[0];
        let rest = &line[1..];
        match kind {
            b'+' => Ok(Reply::Simple(
                String::from_utf8_lossy(rest).into_owned(),
            )),
            b'-' => Ok(Reply::Error(String::from_utf8_lossy(rest).into_owned())),
            b':' => Ok(Reply::Int(parse_int(rest)?)),
            b'$' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    return Ok(Reply::Bulk(None));
                }
                let mut body = self.read_exact(len as usize + 2)?;
                body.truncate(len as usize);
                Ok(Reply::Bulk(Some(body)))
            }
            b'*' => {
                let count = parse_int(rest)?;
                if count < 0 {
                    return Ok(Reply::Array(None));
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.read_reply()?);
                }
                Ok(Reply::Array(Some(items)))
            }
            other => Err(Error::KvUnavailable(format!(
                "unknown reply marker 0x{:02x}",
                other
            ))),
        }
    }

    /// Buffered line read up to CRLF (exclusive).
    fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            let buf = &self.rbuf[self.rpos..];
            if let Some(at) = buf.windows(2).position(|w| w == b"\r\n") {
                let line = buf[..at].to_vec();
                self.rpos += at + 2;
                self.compact();
                return Ok(line);
            }
            self.fill()?;
        }
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.rbuf.len() - self.rpos < n {
            self.fill()?;
        }
        let body = self.rbuf[self.rpos..self.rpos + n].to_vec();
        self.rpos += n;
        self.compact();
        Ok(body)
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let n = self
            .sock
            .recv(&mut chunk)
            .map_err(|e| Error::KvUnavailable(format!("recv: {}", e)))?;
        if n == 0 {
            return Err(Error::KvUnavailable("connection closed".into()));
        }
        self.rbuf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn compact(&mut self) {
        if self.rpos == self.rbuf.len() {
            self.rbuf.clear();
            self.rpos = 0;
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // typed command surface
    ////////////////////////////////////////////////////////////////////////

    pub fn ping(&mut self) -> Result<bool> {
        Ok(matches!(self.command(&[b"PING"])?, Reply::Simple(ref s) if s == "PONG"))
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match self.command(&[b"SET", key.as_bytes(), value.as_bytes()])? {
            Reply::Error(e) => Err(Error::KvUnavailable(e)),
            _ => Ok(()),
        }
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.command(&[b"GET", key.as_bytes()])?.as_string())
    }

    pub fn exists(&mut self, key: &str) -> Result<bool> {
        Ok(self.command(&[b"EXISTS", key.as_bytes()])?.as_int() == Some(1))
    }

    pub fn del(&mut self, key: &str) -> Result<bool> {
        Ok(self.command(&[b"DEL", key.as_bytes()])?.as_int() == Some(1))
    }

    pub fn expire(&mut self, key: &str, seconds: u64) -> Result<bool> {
        let secs = seconds.to_string();
        Ok(self
            .command(&[b"EXPIRE", key.as_bytes(), secs.as_bytes()])?
            .as_int()
            == Some(1))
    }

    pub fn keys(&mut self, pattern: &str) -> Result<Vec<String>> {
        match self.command(&[b"KEYS", pattern.as_bytes()])? {
            Reply::Array(Some(items)) => {
                Ok(items.iter().filter_map(Reply::as_string).collect())
            }
            Reply::Error(e) => Err(Error::KvUnavailable(e)),
            _ => Ok(Vec::new()),
        }
    }

    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        let reply = self.command(&[b"HSET", key.as_bytes(), field.as_bytes(), value.as_bytes()])?;
        match reply {
            Reply::Error(e) => Err(Error::KvUnavailable(e)),
            _ => Ok(()),
        }
    }

    /// HSET with several field/value pairs in one round trip.
    pub fn hset_multi(&mut self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(2 + fields.len() * 2);
        args.push(b"HSET");
        args.push(key.as_bytes());
        for (field, value) in fields {
            args.push(field.as_bytes());
            args.push(value.as_bytes());
        }
        match self.command(&args)? {
            Reply::Error(e) => Err(Error::KvUnavailable(e)),
            _ => Ok(()),
        }
    }

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .command(&[b"HGET", key.as_bytes(), field.as_bytes()])?
            .as_string())
    }

    pub fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        match self.command(&[b"HGETALL", key.as_bytes()])? {
            Reply::Array(Some(items)) => {
                let mut map = HashMap::with_capacity(items.len() / 2);
                let mut it = items.into_iter();
                while let (Some(field), Some(value)) = (it.next(), it.next()) {
                    if let (Some(f), Some(v)) = (field.as_string(), value.as_string()) {
                        map.insert(f, v);
                    }
                }
                Ok(map)
            }
            Reply::Error(e) => Err(Error::KvUnavailable(e)),
            _ => Ok(HashMap::new()),
        }
    }

    pub fn hdel(&mut self, key: &str, fields: &[&str]) -> Result<()> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(2 + fields.len());
        args.push(b"HDEL");
        args.push(key.as_bytes());
        for field in fields {
            args.push(field.as_bytes());
        }
        match self.command(&args)? {
            Reply::Error(e) => Err(Error::KvUnavailable(e)),
            _ => Ok(()),
        }
    }

}

fn parse_int(bytes: &[u8]) -> Result<i64> {
    str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::KvUnavailable("malformed integer in reply".into()))
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("KvClient").field("addr", &self.addr).finish()
    }
}
