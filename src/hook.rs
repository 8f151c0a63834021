//! Fiber-aware replacements for blocking syscalls.
//!
//! Worker threads run with the hook enabled (a thread-local flag raised on
//! scheduler entry). An intercepted call made from a fiber on such a thread
//! never blocks the OS thread: on `EAGAIN` it registers interest with the
//! current reactor, optionally arms a timeout timer bound to a liveness
//! token, and suspends the fiber. When the reactor observes readiness — or
//! the timer cancels the wait — the fiber resumes and retries.
//!
//! Called with the hook disabled (any non-worker thread), every function
//! here degrades to the plain syscall, which is exactly what test drivers
//! and startup code want.

use std::cell::Cell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::fd::{self, TimeoutKind};
use crate::fiber::{self, scheduler};
use crate::net::Address;
use crate::reactor::{self, Interest};

/// Connect deadline applied when the caller does not pick one.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether intercepted calls on this thread cooperate with the reactor.
#[inline]
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

#[inline]
pub fn set_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

/// Liveness token an armed timeout observes. Dropping the token (the
/// operation completed) nullifies the timer; the timer stamping `cancelled`
/// first wins the race and the wait reports that errno instead.
struct TimerToken {
    cancelled: AtomicI32,
}

#[inline]
fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn check(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// The generic I/O template every recv/send flavour goes through.
///
/// `op` performs one non-blocking attempt and returns the raw syscall
/// result. The policy: pass through when the hook cannot or must not help;
/// retry on `EINTR`; on `EAGAIN` arm the recorded timeout (if any) and
/// suspend on the reactor until readiness or cancellation.
fn do_io<F>(fd: RawFd, interest: Interest, kind: TimeoutKind, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    if !is_enabled() {
        return check(op());
    }
    let entry = match fd::table().get(fd, false) {
        Some(entry) => entry,
        None => return check(op()),
    };
    if entry.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return check(op());
    }

    let timeout = entry.timeout(kind);
    loop {
        let mut n = op();
        while n < 0 && last_errno() == libc::EINTR {
            n = op();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            return Err(err);
        }

        let iom = match reactor::current() {
            Some(iom) => iom,
            // no reactor on this thread: surface the would-block
            None => return Err(err),
        };

        let token = Arc::new(TimerToken {
            cancelled: AtomicI32::new(0),
        });
        let timer = match timeout {
            Some(ms) if ms > 0 => {
                let observer = Arc::downgrade(&token);
                let canceller = iom.clone();
                Some(iom.add_condition_timer(
                    ms,
                    move || {
                        if let Some(token) = observer.upgrade() {
                            if token.cancelled.load(Ordering::SeqCst) == 0 {
                                token.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                                canceller.cancel_event(fd, interest);
                            }
                        }
                    },
                    Arc::downgrade(&token),
                    0,
                ))
            }
            _ => None,
        };

        match iom.add_event(fd, interest, None) {
            Err(e) => {
                if let Some(id) = timer {
                    iom.cancel_timer(id);
                }
                log::error!("fd {} {:?} wait registration failed: {}", fd, interest, e);
                return Err(io::Error::new(io::ErrorKind::Other, e));
            }
            Ok(()) => {
                fiber::yield_to_hold();
                if let Some(id) = timer {
                    iom.cancel_timer(id);
                }
                let cancelled = token.cancelled.load(Ordering::SeqCst);
                if cancelled != 0 {
                    return Err(io::Error::from_raw_os_error(cancelled));
                }
                // the descriptor may have been closed while we slept; the
                // number could already belong to someone else
                if entry.is_closed() {
                    return Err(io::Error::from_raw_os_error(libc::EBADF));
                }
                // readiness: loop and retry the call
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// sleeping
////////////////////////////////////////////////////////////////////////////////

/// Cooperative sleep: arms a one-shot timer that re-queues the calling
/// fiber, then yields. Outside fiber context this is a plain thread sleep.
pub fn sleep(dur: Duration) {
    let ms = dur.as_millis() as u64;
    if !is_enabled() {
        std::thread::sleep(dur);
        return;
    }
    let iom = reactor::current();
    let cur = fiber::current();
    let sched = scheduler::current();
    match (iom, cur, sched) {
        (Some(iom), Some(cur), Some(sched)) => {
            iom.add_timer(
                ms,
                move || {
                    sched.schedule_fiber(cur.clone(), None);
                },
                0,
            );
            fiber::yield_to_hold();
        }
        _ => std::thread::sleep(dur),
    }
}

/// Microsecond flavour; fiber-context granularity is the timer wheel's
/// millisecond.
pub fn usleep(micros: u64) {
    sleep(Duration::from_micros(micros));
}

////////////////////////////////////////////////////////////////////////////////
// socket lifecycle
////////////////////////////////////////////////////////////////////////////////

/// `socket(2)` plus eager FD-table registration, which also switches the
/// descriptor to the mandatory system non-blocking mode.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    fd::table().get(fd, true);
    Ok(fd)
}

/// Cooperative `connect(2)` with the default deadline.
pub fn connect(fd: RawFd, addr: &Address) -> io::Result<()> {
    connect_with_timeout(fd, addr, DEFAULT_CONNECT_TIMEOUT_MS)
}

/// Cooperative `connect(2)`. An in-progress connect suspends the fiber on
/// Write readiness; the deadline cancels the wait and reports `ETIMEDOUT`.
pub fn connect_with_timeout(fd: RawFd, addr: &Address, timeout_ms: u64) -> io::Result<()> {
    let sa = addr.to_sockaddr();
    let raw_connect = || unsafe {
        libc::connect(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };

    let entry = fd::table().get(fd, false);
    let cooperative = is_enabled()
        && entry
            .as_ref()
            .map(|e| e.is_socket() && !e.user_nonblock())
            .unwrap_or(false);
    if let Some(entry) = &entry {
        if entry.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
    }
    if !cooperative {
        // a tracked socket is system-nonblocking even without the hook, so
        // wait for the handshake the blocking way
        if raw_connect() == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
        return wait_connect_blocking(fd, timeout_ms);
    }

    if raw_connect() == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let iom = match reactor::current() {
        Some(iom) => iom,
        None => return Err(err),
    };
    let token = Arc::new(TimerToken {
        cancelled: AtomicI32::new(0),
    });
    let timer = if timeout_ms > 0 {
        let observer = Arc::downgrade(&token);
        let canceller = iom.clone();
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                if let Some(token) = observer.upgrade() {
                    if token.cancelled.load(Ordering::SeqCst) == 0 {
                        token.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                        canceller.cancel_event(fd, Interest::WRITE);
                    }
                }
            },
            Arc::downgrade(&token),
            0,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Interest::WRITE, None) {
        Ok(()) => {
            fiber::yield_to_hold();
            if let Some(id) = timer {
                iom.cancel_timer(id);
            }
            let cancelled = token.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                return Err(io::Error::from_raw_os_error(cancelled));
            }
        }
        Err(e) => {
            if let Some(id) = timer {
                iom.cancel_timer(id);
            }
            log::error!("connect wait registration on fd {} failed: {}", fd, e);
            return Err(io::Error::new(io::ErrorKind::Other, e));
        }
    }

    match socket_error(fd)? {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

/// Connect completion for non-fiber callers: poll(2) on writability.
fn wait_connect_blocking(fd: RawFd, timeout_ms: u64) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout = if timeout_ms == 0 {
        -1
    } else {
        timeout_ms as libc::c_int
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
        break;
    }
    match socket_error(fd)? {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

/// Cooperative `accept(2)`. The child descriptor gets its own FD entry.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, Address)> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let n = do_io(fd, Interest::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(
            fd,
            &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        ) as libc::ssize_t
    })?;
    let child = n as RawFd;
    fd::table().get(child, true);
    Ok((child, Address::from_sockaddr(&sa)))
}

/// Close: cancel any reactor interest, drop the FD entry, close the
/// descriptor.
pub fn close(fd: RawFd) -> io::Result<()> {
    if fd::table().get(fd, false).is_some() {
        if let Some(iom) = reactor::current() {
            iom.cancel_all(fd);
        }
        fd::table().del(fd);
    }
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

////////////////////////////////////////////////////////////////////////////////
// data transfer
////////////////////////////////////////////////////////////////////////////////

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Interest::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<(usize, Address)> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let n = do_io(fd, Interest::READ, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    })?;
    Ok((n, Address::from_sockaddr(&sa)))
}

/// # Safety
///
/// `msg` must point to a valid `msghdr` whose buffers stay alive across the
/// (possibly suspending) call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Interest::READ, TimeoutKind::Recv, || {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Interest::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags | libc::MSG_NOSIGNAL,
        )
    })
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: libc::c_int, addr: &Address) -> io::Result<usize> {
    let sa = addr.to_sockaddr();
    do_io(fd, Interest::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags | libc::MSG_NOSIGNAL,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })
}

/// # Safety
///
/// See [`recvmsg`].
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, Interest::WRITE, TimeoutKind::Send, || {
        libc::sendmsg(fd, msg, flags | libc::MSG_NOSIGNAL)
    })
}

////////////////////////////////////////////////////////////////////////////////
// descriptor options
////////////////////////////////////////////////////////////////////////////////

/// User-visible non-blocking control (the `ioctl(FIONBIO)` /
/// `fcntl(F_SETFL)` semantics): a tracked socket only records the intent —
/// the descriptor itself stays system-nonblocking — while anything else
/// gets a real flag flip.
pub fn set_user_nonblock(fd: RawFd, on: bool) -> io::Result<()> {
    if let Some(entry) = fd::table().get(fd, false) {
        if entry.is_socket() && !entry.is_closed() {
            entry.set_user_nonblock(on);
            return Ok(());
        }
    }
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The non-blocking bit the application believes it set (the
/// `fcntl(F_GETFL)` read side).
pub fn user_nonblock(fd: RawFd) -> bool {
    if let Some(entry) = fd::table().get(fd, false) {
        if entry.is_socket() && !entry.is_closed() {
            return entry.user_nonblock();
        }
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    flags >= 0 && (flags & libc::O_NONBLOCK) != 0
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO`: recorded in the FD entry for the suspension
/// deadline *and* forwarded to the kernel.
pub fn set_socket_timeout(fd: RawFd, kind: TimeoutKind, ms: u64) -> io::Result<()> {
    if let Some(entry) = fd::table().get(fd, false) {
        entry.set_timeout(kind, ms);
    }
    let tv = libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    };
    let opt = match kind {
        TimeoutKind::Recv => libc::SO_RCVTIMEO,
        TimeoutKind::Send => libc::SO_SNDTIMEO,
    };
    set_option(fd, libc::SOL_SOCKET, opt, &tv)
}

/// Typed `setsockopt(2)`.
pub fn set_option<T>(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Pending socket error (`getsockopt(SO_ERROR)`), used to finish a
/// non-blocking connect.
pub fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 {
        Ok(err)
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_flag_is_per_thread() {
        assert!(!is_enabled());
        set_enabled(true);
        assert!(is_enabled());
        let other = std::thread::spawn(|| is_enabled()).join().unwrap();
        assert!(!other);
        set_enabled(false);
    }

    #[test]
    fn socket_creates_a_tracked_nonblocking_entry() {
        let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        let entry = fd::table().get(fd, false).expect("entry exists");
        assert!(entry.is_socket());
        assert!(entry.sys_nonblock());
        close(fd).unwrap();
        assert!(fd::table().get(fd, false).is_none());
    }

    #[test]
    fn user_nonblock_is_remembered_not_applied() {
        let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        set_user_nonblock(fd, true).unwrap();
        assert!(user_nonblock(fd));
        // the kernel-side flag is still forced on regardless of user intent
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        set_user_nonblock(fd, false).unwrap();
        assert!(!user_nonblock(fd));
        close(fd).unwrap();
    }

    #[test]
    fn socket_timeouts_are_recorded_and_forwarded() {
        let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        set_socket_timeout(fd, TimeoutKind::Recv, 1500).unwrap();
        let entry = fd::table().get(fd, false).unwrap();
        assert_eq!(entry.timeout(TimeoutKind::Recv), Some(1500));

        let mut tv: libc::timeval = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::timeval>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &mut tv as *mut libc::timeval as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(tv.tv_sec, 1);
        assert_eq!(tv.tv_usec, 500_000);
        close(fd).unwrap();
    }
}
