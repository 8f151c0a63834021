//! Cooperative suspension: sleep, recv deadlines and connect, exercised
//! through fibers running on a single-threaded reactor.

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rendezvous::fd::TimeoutKind;
use rendezvous::hook;
use rendezvous::net::{Address, SockType, Socket};
use rendezvous::reactor::Interest;
use rendezvous::IoManager;

fn wait_until<F: Fn() -> bool>(cond: F, ms: u64) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(ms) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn sleeping_fiber_does_not_block_its_worker() {
    let iom = IoManager::new(1, false, "coop-sleep").unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    iom.schedule(move || {
        hook::sleep(Duration::from_millis(80));
        o.lock().unwrap().push('A');
    });
    let o = order.clone();
    iom.schedule(move || {
        o.lock().unwrap().push('B');
    });

    // B runs while A sleeps on the shared worker
    assert!(wait_until(|| order.lock().unwrap().len() == 2, 2000));
    assert_eq!(*order.lock().unwrap(), vec!['B', 'A']);
    iom.stop();
}

#[test]
fn recv_deadline_cancels_the_wait_with_etimedout() {
    let iom = IoManager::new(1, false, "coop-timeout").unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    // keep the connection open but never send anything
    let guard = thread::spawn(move || {
        let conn = listener.accept();
        thread::sleep(Duration::from_secs(2));
        drop(conn);
    });

    let outcome: Arc<Mutex<Option<(Duration, std::io::Error)>>> = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    iom.schedule(move || {
        let sock = Socket::new(SockType::Stream).unwrap();
        let addr = Address::parse("127.0.0.1", port).unwrap();
        sock.connect(addr).unwrap();
        sock.set_timeout(TimeoutKind::Recv, 100).unwrap();

        let fd = sock.fd();
        let started = Instant::now();
        let mut buf = [0u8; 32];
        let err = match sock.recv(&mut buf) {
            Err(rendezvous::Error::Syscall(e)) => e,
            other => panic!("expected a syscall error, got {:?}", other),
        };
        let elapsed = started.elapsed();

        // the descriptor is not poisoned: the reactor kept no interest
        // and a write still goes through
        assert!(!rendezvous::reactor::current()
            .unwrap()
            .has_event(fd, Interest::READ));
        sock.send(b"still alive").unwrap();

        *o.lock().unwrap() = Some((elapsed, err));
    });

    assert!(wait_until(|| outcome.lock().unwrap().is_some(), 3000));
    let (elapsed, err) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    assert!(
        elapsed >= Duration::from_millis(80) && elapsed < Duration::from_millis(1000),
        "deadline fired at {:?}",
        elapsed
    );

    iom.stop();
    drop(guard);
}

#[test]
fn fiber_connect_and_echo_round_trip() {
    let iom = IoManager::new(2, false, "coop-echo").unwrap();

    // plain blocking echo peer on its own thread
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).unwrap();
        conn.write_all(&buf[..n]).unwrap();
    });

    let done = Arc::new(AtomicUsize::new(0));
    let d = done.clone();
    iom.schedule(move || {
        let sock = Socket::new(SockType::Stream).unwrap();
        let addr = Address::parse("127.0.0.1", port).unwrap();
        sock.connect_with_timeout(addr, 2000).unwrap();
        sock.send_all(b"over the fiber").unwrap();

        let mut buf = [0u8; 64];
        let mut got = 0;
        while got < b"over the fiber".len() {
            got += sock.recv(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf[..got], b"over the fiber");
        d.store(1, Ordering::SeqCst);
    });

    assert!(wait_until(|| done.load(Ordering::SeqCst) == 1, 3000));
    iom.stop();
}

#[test]
fn many_concurrent_sleepers_share_one_worker() {
    let iom = IoManager::new(1, false, "coop-many").unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    for _ in 0..20 {
        let done = done.clone();
        iom.schedule(move || {
            hook::sleep(Duration::from_millis(50));
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(|| done.load(Ordering::SeqCst) == 20, 3000));
    // serially this would take a second; cooperatively it is one sleep
    assert!(started.elapsed() < Duration::from_millis(600));
    iom.stop();
}
