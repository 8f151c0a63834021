//! Test doubles shared by the integration tests: a tiny in-process
//! RESP2 server backed by a hash map, plus small helpers for driving the
//! wire protocol from plain blocking client sockets.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub type HashStore = Arc<Mutex<HashMap<String, HashMap<String, String>>>>;

/// A just-enough RESP server: hashes only, every key is a hash. Supports
/// the commands the crate's KV client issues.
pub struct MiniKv {
    pub port: u16,
    pub store: HashStore,
}

impl MiniKv {
    pub fn spawn() -> MiniKv {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mini kv");
        let port = listener.local_addr().unwrap().port();
        let store: HashStore = Arc::new(Mutex::new(HashMap::new()));
        let accept_store = store.clone();
        thread::spawn(move || {
            for conn in listener.incoming() {
                let conn = match conn {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let store = accept_store.clone();
                thread::spawn(move || serve_conn(conn, store));
            }
        });
        MiniKv { port, store }
    }

    pub fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        self.store.lock().unwrap().get(key).cloned()
    }
}

fn serve_conn(conn: TcpStream, store: HashStore) {
    let mut reader = BufReader::new(match conn.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    });
    let mut writer = conn;
    loop {
        let args = match read_command(&mut reader) {
            Some(args) => args,
            None => return,
        };
        let reply = dispatch(&args, &store);
        if writer.write_all(&reply).is_err() {
            return;
        }
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> Option<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    Some(line.trim_end().to_owned())
}

fn read_command(reader: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
    let head = read_line(reader)?;
    if !head.starts_with('*') {
        return None;
    }
    let count: usize = head[1..].parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let len_line = read_line(reader)?;
        if !len_line.starts_with('$') {
            return None;
        }
        let len: usize = len_line[1..].parse().ok()?;
        let mut body = vec![0u8; len + 2];
        reader.read_exact(&mut body).ok()?;
        body.truncate(len);
        args.push(String::from_utf8_lossy(&body).into_owned());
    }
    Some(args)
}

fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", s.len(), s).into_bytes()
}

fn dispatch(args: &[String], store: &HashStore) -> Vec<u8> {
    if args.is_empty() {
        return b"-ERR empty command\r\n".to_vec();
    }
    let cmd = args[0].to_ascii_uppercase();
    let mut store = store.lock().unwrap();
    match cmd.as_str() {
        "PING" => b"+PONG\r\n".to_vec(),
        "AUTH" => b"+OK\r\n".to_vec(),
        "EXISTS" => {
            let n = store.contains_key(&args[1]) as i32;
            format!(":{}\r\n", n).into_bytes()
        }
        "DEL" => {
            let n = store.remove(&args[1]).is_some() as i32;
            format!(":{}\r\n", n).into_bytes()
        }
        "KEYS" => {
            let keys: Vec<&String> = store.keys().collect();
            let mut out = format!("*{}\r\n", keys.len()).into_bytes();
            for key in keys {
                out.extend_from_slice(&bulk(key));
            }
            out
        }
        "HSET" => {
            let hash = store.entry(args[1].clone()).or_default();
            let mut added = 0;
            for pair in args[2..].chunks(2) {
                if pair.len() == 2 && hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                    added += 1;
                }
            }
            format!(":{}\r\n", added).into_bytes()
        }
        "HGET" => match store.get(&args[1]).and_then(|h| h.get(&args[2])) {
            Some(v) => bulk(v),
            None => b"$-1\r\n".to_vec(),
        },
        "HGETALL" => match store.get(&args[1]) {
            None => b"*0\r\n".to_vec(),
            Some(hash) => {
                let mut out = format!("*{}\r\n", hash.len() * 2).into_bytes();
                for (f, v) in hash {
                    out.extend_from_slice(&bulk(f));
                    out.extend_from_slice(&bulk(v));
                }
                out
            }
        },
        "HDEL" => {
            let mut removed = 0;
            if let Some(hash) = store.get_mut(&args[1]) {
                for field in &args[2..] {
                    if hash.remove(field).is_some() {
                        removed += 1;
                    }
                }
            }
            format!(":{}\r\n", removed).into_bytes()
        }
        "SET" => {
            let hash = store.entry(args[1].clone()).or_default();
            hash.insert("__value".into(), args[2].clone());
            b"+OK\r\n".to_vec()
        }
        "GET" => match store.get(&args[1]).and_then(|h| h.get("__value")) {
            Some(v) => bulk(v),
            None => b"$-1\r\n".to_vec(),
        },
        "EXPIRE" => b":1\r\n".to_vec(),
        _ => b"-ERR unknown command\r\n".to_vec(),
    }
}

/// Read one protocol frame (header + payload) from a blocking stream.
pub fn read_frame(stream: &mut TcpStream) -> (u16, Vec<u8>) {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).expect("frame header");
    assert_eq!(&header[..4], &[0x82, 0x73, 0x64, 0x55], "frame magic");
    let cmd = u16::from_le_bytes([header[4], header[5]]);
    let len = u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).expect("frame payload");
    (cmd, payload)
}

/// Generous client-side read timeout so a server bug fails the test
/// instead of hanging it.
pub fn client_stream(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}
