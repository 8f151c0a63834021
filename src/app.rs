//! Process assembly: CLI, configuration, logging, the three reactors and
//! the two services.
//!
//! Reactor layout (all sizes from config):
//! - `accept-worker` (1 thread): the TCP accept fiber;
//! - `io-worker`: client sockets — TCP session fibers and the UDP read
//!   fiber;
//! - `process-worker` (caller-inclusive): business-side timers such as the
//!   liveness sweep. The main thread enters this reactor's root slot and
//!   serves it for the life of the process.

use std::path::Path;

use clap::Parser;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::kv::KvPool;
use crate::logger;
use crate::net::{Address, TcpServer};
use crate::reactor::IoManager;
use crate::service::{session, UdpService};

#[derive(Debug, Parser)]
#[command(
    name = "rendezvousd",
    about = "Fiber-based UDP/TCP hole-punching rendezvous server"
)]
struct Args {
    /// Path to the JSON configuration document.
    #[arg(short = 'c', long = "config", default_value = "./config/rendezvous.json")]
    config: String,

    /// Detach and run in the background.
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,
}

/// Run the server. Returns only on clean shutdown; configuration and bind
/// errors are fatal.
pub fn run() -> Result<()> {
    let args = Args::parse();

    if args.daemon {
        supervise()?;
    }

    let cfg = if Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        eprintln!(
            "config {} not found, continuing with built-in defaults",
            args.config
        );
        Config::default()
    };
    logger::init(&cfg)?;

    let event_batch = cfg.lookup::<u32>("epoll.event_size", 5000) as usize;
    let io_workers = cfg.lookup::<u32>("worker.io_worker_num", 4).max(1) as usize;
    let process_workers = cfg.lookup::<u32>("worker.process_worker_num", 4).max(1) as usize;

    let accept_worker = IoManager::with_event_batch(1, false, "accept-worker", event_batch)?;
    let io_worker = IoManager::with_event_batch(io_workers, false, "io-worker", event_batch)?;
    let process_worker =
        IoManager::with_event_batch(process_workers, true, "process-worker", event_batch)?;
    log::info!(
        "workers up: accept 1, io {}, process {} (caller-inclusive)",
        io_workers,
        process_workers
    );

    let kv = KvPool::from_config(&cfg);

    let tcp_addr = Address::parse(
        &cfg.lookup_str("tcp.host", "0.0.0.0"),
        cfg.lookup::<u16>("tcp.port", 12000),
    )?;
    let udp_addr = Address::parse(
        &cfg.lookup_str("udp.host", "0.0.0.0"),
        cfg.lookup::<u16>("udp.port", 12500),
    )?;

    let session_kv = kv.clone();
    let tcp = TcpServer::new(
        &cfg,
        accept_worker.clone(),
        io_worker.clone(),
        move |client| session::serve(client, session_kv.clone()),
    )?;
    tcp.bind(tcp_addr)?;
    tcp.listen(1024)?;

    let udp = UdpService::new(&cfg, io_worker.clone(), process_worker.clone(), kv)?;
    udp.bind(udp_addr)?;

    tcp.start();
    udp.start();
    log::info!("rendezvous server up: tcp {} udp {}", tcp_addr, udp_addr);

    // serve the work reactor on this thread until the scheduler stops
    process_worker.run_root();

    log::info!("shutting down");
    udp.stop();
    tcp.stop();
    accept_worker.stop();
    io_worker.stop();
    Ok(())
}

/// Daemon mode: detach from the terminal, then run the server in a child
/// process under a respawn supervisor. The supervisor re-forks the worker
/// whenever it dies, except on a clean exit or SIGKILL, which end the
/// whole service.
///
/// Returns `Ok(())` only in the worker child, which then continues into
/// normal startup; the supervisor process exits from inside.
fn supervise() -> Result<()> {
    if unsafe { libc::daemon(1, 0) } != 0 {
        return Err(Error::last_os());
    }
    loop {
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            eprintln!("rendezvousd: fork failed: {}", std::io::Error::last_os_error());
            std::process::exit(1);
        }
        if pid == 0 {
            return Ok(());
        }

        let mut status: libc::c_int = 0;
        if unsafe { libc::waitpid(pid, &mut status, 0) } < 0 {
            eprintln!(
                "rendezvousd: waitpid({}) failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
            std::process::exit(1);
        }
        if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
            std::process::exit(0);
        }
        if libc::WIFSIGNALED(status) && libc::WTERMSIG(status) == libc::SIGKILL {
            eprintln!("rendezvousd: worker {} was killed, not respawning", pid);
            std::process::exit(0);
        }
        eprintln!("rendezvousd: worker {} died (status {}), respawning", pid, status);
    }
}
