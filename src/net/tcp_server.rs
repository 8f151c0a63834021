//! TCP accept dispatcher.
//!
//! A [`TcpServer`] binds a listener, runs the accept loop as a fiber on the
//! (single-threaded) accept reactor, applies the configured per-client
//! socket options to each child and hands the connection to the I/O reactor
//! through the server's session handler. The split keeps slow session work
//! — KV round trips in particular — off the accept path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;

use crate::config::Config;
use crate::error::Result;
use crate::fd::TimeoutKind;
use crate::net::{Address, SockType, Socket};
use crate::reactor::IoManager;

type SessionHandler = Box<dyn Fn(Socket) + Send + Sync>;

pub struct TcpServer {
    listener: Socket,
    accept_worker: Arc<IoManager>,
    io_worker: Arc<IoManager>,
    handler: SessionHandler,
    stop: AtomicBool,
    recv_timeout_ms: u64,
    send_timeout_ms: u64,
    keep_alive: bool,
    weak_self: OnceCell<Weak<TcpServer>>,
}

impl TcpServer {
    /// Build the listener. `handler` runs once per accepted connection, on
    /// the I/O reactor, inside a fiber.
    pub fn new<H>(
        cfg: &Config,
        accept_worker: Arc<IoManager>,
        io_worker: Arc<IoManager>,
        handler: H,
    ) -> Result<Arc<TcpServer>>
    where
        H: Fn(Socket) + Send + Sync + 'static,
    {
        let listener = Socket::new(SockType::Stream)?;
        let server = Arc::new(TcpServer {
            listener,
            accept_worker,
            io_worker,
            handler: Box::new(handler),
            stop: AtomicBool::new(true),
            recv_timeout_ms: cfg.lookup::<u64>("tcp.recv_timeout", 1000),
            send_timeout_ms: cfg.lookup::<u64>("tcp.send_timeout", 2000),
            keep_alive: cfg.lookup::<u16>("tcp.keep_alive_time", 30) > 0,
            weak_self: OnceCell::new(),
        });
        server
            .weak_self
            .set(Arc::downgrade(&server))
            .ok()
            .expect("weak_self set twice");
        Ok(server)
    }

    pub fn bind(&self, addr: Address) -> Result<()> {
        self.listener.bind(addr)
    }

    pub fn listen(&self, backlog: libc::c_int) -> Result<()> {
        self.listener.listen(backlog)
    }

    pub fn local_addr(&self) -> Option<Address> {
        self.listener.local_addr()
    }

    /// Schedule the accept loop. Idempotent.
    pub fn start(&self) {
        if !self.stop.swap(false, Ordering::SeqCst) {
            return;
        }
        let server = match self.weak_self.get().and_then(Weak::upgrade) {
            Some(server) => server,
            None => return,
        };
        self.accept_worker.schedule(move || server.accept_loop());
    }

    /// Stop accepting. The cancel+close pair runs as a task on the accept
    /// reactor, serialized with the accept fiber, so a woken accept cannot
    /// re-arm against a half-closed listener.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        let server = match self.weak_self.get().and_then(Weak::upgrade) {
            Some(server) => server,
            None => return,
        };
        self.accept_worker.schedule(move || {
            server.accept_worker.cancel_all(server.listener.fd());
            server.listener.close();
        });
    }

    fn accept_loop(self: Arc<Self>) {
        log::info!(
            "tcp server listening on {}",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "<unbound>".into())
        );
        while !self.stop.load(Ordering::SeqCst) {
            let client = match self.listener.accept() {
                Ok(client) => client,
                Err(e) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    log::error!("accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.setup_client(&client) {
                log::warn!("client fd {} option setup failed: {}", client.fd(), e);
            }
            let server = self.clone();
            self.io_worker.schedule(move || (server.handler)(client));
        }
        log::info!("tcp accept loop exits");
    }

    fn setup_client(&self, client: &Socket) -> Result<()> {
        client.set_timeout(TimeoutKind::Recv, self.recv_timeout_ms)?;
        client.set_timeout(TimeoutKind::Send, self.send_timeout_ms)?;
        client.set_keep_alive(self.keep_alive)?;
        Ok(())
    }
}
