//! Process-wide file-descriptor table.
//!
//! The hook layer consults this table on every intercepted call. An entry is
//! created lazily the first time a descriptor is observed: the descriptor is
//! `fstat`-probed, and sockets are switched to `O_NONBLOCK` once and for all
//! (the *system* non-block flag). The *user* non-block flag tracks what the
//! application asked for — a user-nonblocking socket bypasses the fiber
//! suspension machinery entirely and sees raw `EAGAIN`s.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Which configured timeout an I/O operation consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

pub struct FdEntry {
    fd: libc::c_int,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    /// Milliseconds; -1 means no deadline.
    recv_timeout: AtomicI64,
    send_timeout: AtomicI64,
}

impl FdEntry {
    fn new(fd: libc::c_int) -> FdEntry {
        let mut is_socket = false;
        unsafe {
            let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
            if libc::fstat(fd, st.as_mut_ptr()) == 0 {
                let st = st.assume_init();
                is_socket = (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
            }
        }

        let mut sys_nonblock = false;
        if is_socket {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags >= 0 && (flags & libc::O_NONBLOCK) == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }

        FdEntry {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicI64::new(-1),
            send_timeout: AtomicI64::new(-1),
        }
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Recorded timeout in ms for the given direction, `None` when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let raw = match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::SeqCst),
            TimeoutKind::Send => self.send_timeout.load(Ordering::SeqCst),
        };
        if raw < 0 {
            None
        } else {
            Some(raw as u64)
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        let slot = match kind {
            TimeoutKind::Recv => &self.recv_timeout,
            TimeoutKind::Send => &self.send_timeout,
        };
        slot.store(ms as i64, Ordering::SeqCst);
    }
}

/// Descriptor → entry table, grown geometrically like the reactor's context
/// table. Entries are created on demand and dropped on `close`.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            slots: RwLock::new(vec![None; 256]),
        }
    }

    /// Look up `fd`, creating the entry when `create` is set.
    pub fn get(&self, fd: libc::c_int, create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                if let Some(entry) = &slots[idx] {
                    return Some(entry.clone());
                }
            }
            if !create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let grown = (idx + 1).max(slots.len() * 3 / 2);
            slots.resize(grown, None);
        }
        // another thread may have won the race under the write lock
        if let Some(entry) = &slots[idx] {
            return Some(entry.clone());
        }
        let entry = Arc::new(FdEntry::new(fd));
        slots[idx] = Some(entry.clone());
        Some(entry)
    }

    /// Drop the entry on close. Late holders observe `is_closed`.
    pub fn del(&self, fd: libc::c_int) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(entry) = slot.take() {
                entry.closed.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

static FD_TABLE: Lazy<FdTable> = Lazy::new(FdTable::new);

/// The process-wide table.
pub fn table() -> &'static FdTable {
    &FD_TABLE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_socket() -> libc::c_int {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn socket_entries_are_forced_nonblocking() {
        let fd = udp_socket();
        let table = FdTable::new();
        let entry = table.get(fd, true).unwrap();
        assert!(entry.is_socket());
        assert!(entry.sys_nonblock());
        assert!(!entry.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn lookup_without_create_misses() {
        let table = FdTable::new();
        assert!(table.get(12345, false).is_none());
        assert!(table.get(-1, true).is_none());
    }

    #[test]
    fn timeouts_are_per_direction() {
        let fd = udp_socket();
        let table = FdTable::new();
        let entry = table.get(fd, true).unwrap();
        assert_eq!(entry.timeout(TimeoutKind::Recv), None);
        entry.set_timeout(TimeoutKind::Recv, 1000);
        entry.set_timeout(TimeoutKind::Send, 2000);
        assert_eq!(entry.timeout(TimeoutKind::Recv), Some(1000));
        assert_eq!(entry.timeout(TimeoutKind::Send), Some(2000));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn del_marks_closed_for_late_holders() {
        let fd = udp_socket();
        let table = FdTable::new();
        let entry = table.get(fd, true).unwrap();
        table.del(fd);
        assert!(entry.is_closed());
        assert!(table.get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn table_grows_geometrically() {
        let fd = udp_socket();
        // dup to a large descriptor number to force growth
        let big = unsafe { libc::fcntl(fd, libc::F_DUPFD, 700) };
        assert!(big >= 700);
        let table = FdTable::new();
        assert!(table.get(big, true).is_some());
        unsafe {
            libc::close(fd);
            libc::close(big);
        }
    }
}
