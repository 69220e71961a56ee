use std::fs;
use std::os::unix::fs::FileExt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use dashmap::DashMap;
use nix::errno::Errno;
use socktap_common::{Result, SocktapError};
use tracing::debug;

use crate::socket::Socket;

/// pidfd_open(2); the libc crate carries the syscall number but no wrapper.
pub fn pidfd_open(pid: u32) -> nix::Result<RawFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0u32) };
    Errno::result(ret).map(|fd| fd as RawFd)
}

/// pidfd_getfd(2): duplicate a descriptor owned by another process into
/// this one. This is how a target descriptor we have never seen before is
/// identified by its inode.
pub fn pidfd_getfd(pidfd: RawFd, target_fd: i32) -> nix::Result<RawFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd, target_fd, 0u32) };
    Errno::result(ret).map(|fd| fd as RawFd)
}

/// Read from the target's memory through /proc/<tid>/mem.
pub fn read_mem(tid: u32, addr: u64, len: usize) -> Result<Vec<u8>> {
    let file = fs::File::open(format!("/proc/{}/mem", tid))?;
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, addr)?;
    Ok(buf)
}

/// Write into the target's memory through /proc/<tid>/mem.
pub fn write_mem(tid: u32, addr: u64, data: &[u8]) -> Result<()> {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(format!("/proc/{}/mem", tid))?;
    file.write_all_at(data, addr)?;
    Ok(())
}

/// Map from a target descriptor number to its shadow socket, for one
/// process (thread group).
pub struct FdTable {
    pub tgid: u32,
    pidfd: RawFd,
    fds: DashMap<i32, Arc<Socket>>,
}

impl FdTable {
    fn new(tgid: u32, pidfd: RawFd) -> Arc<FdTable> {
        Arc::new(FdTable {
            tgid,
            pidfd,
            fds: DashMap::new(),
        })
    }

    pub fn get(&self, fd: i32) -> Option<Arc<Socket>> {
        self.fds.get(&fd).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, fd: i32, sock: Arc<Socket>) {
        self.fds.insert(fd, sock);
    }

    pub fn remove(&self, fd: i32) -> Option<Arc<Socket>> {
        self.fds.remove(&fd).map(|(_, sock)| sock)
    }

    /// Grab a tracer-side duplicate of the target's descriptor, or None
    /// when the descriptor does not exist over there.
    pub fn grab(&self, fd: i32) -> Option<RawFd> {
        match pidfd_getfd(self.pidfd, fd) {
            Ok(raw) => Some(raw),
            Err(e) => {
                debug!("pidfd_getfd failed: tgid={} fd={} err={}", self.tgid, fd, e);
                None
            }
        }
    }
}

impl Drop for FdTable {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.pidfd);
    }
}

/// All processes the tracer has seen, keyed by thread group id. The
/// notification carries a thread id; /proc maps it to its group.
pub struct ProcessTable {
    procs: DashMap<u32, Arc<FdTable>>,
    tids: DashMap<u32, u32>,
}

impl ProcessTable {
    pub fn new(root_pid: u32, root_pidfd: RawFd) -> ProcessTable {
        let table = ProcessTable {
            procs: DashMap::new(),
            tids: DashMap::new(),
        };
        table.procs.insert(root_pid, FdTable::new(root_pid, root_pidfd));
        table
    }

    /// Descriptor table of the process owning `tid`, opened on demand for
    /// processes the target forked after startup.
    pub fn table_for(&self, tid: u32) -> Result<Arc<FdTable>> {
        let tgid = self.tgid_of(tid)?;
        if let Some(table) = self.procs.get(&tgid) {
            return Ok(Arc::clone(table.value()));
        }
        let pidfd = pidfd_open(tgid)
            .map_err(|e| SocktapError::ProcessError(format!("pidfd_open {}: {}", tgid, e)))?;
        let table = FdTable::new(tgid, pidfd);
        debug!("tracking new process: tgid={}", tgid);
        // a racing insert wins; our extra pidfd is closed by the drop
        let entry = self.procs.entry(tgid).or_insert(table);
        Ok(Arc::clone(entry.value()))
    }

    fn tgid_of(&self, tid: u32) -> Result<u32> {
        if let Some(tgid) = self.tids.get(&tid) {
            return Ok(*tgid);
        }
        let status = fs::read_to_string(format!("/proc/{}/status", tid))?;
        let tgid = status
            .lines()
            .find_map(|line| line.strip_prefix("Tgid:"))
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| {
                SocktapError::ProcessError(format!("no Tgid line in /proc/{}/status", tid))
            })?;
        self.tids.insert(tid, tgid);
        Ok(tgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tgid_of_self() {
        let pidfd = pidfd_open(std::process::id()).unwrap();
        let table = ProcessTable::new(std::process::id(), pidfd);
        assert_eq!(table.tgid_of(std::process::id()).unwrap(), std::process::id());
        // cached second lookup
        assert_eq!(table.tgid_of(std::process::id()).unwrap(), std::process::id());
    }

    #[test]
    fn test_read_own_memory() {
        let data = *b"socktap";
        let got = read_mem(std::process::id(), data.as_ptr() as u64, data.len()).unwrap();
        assert_eq!(got, b"socktap");
    }

    #[test]
    fn test_write_own_memory() {
        let buf = vec![0u8; 4];
        write_mem(std::process::id(), buf.as_ptr() as u64, b"tap!").unwrap();
        assert_eq!(buf, b"tap!");
    }
}
