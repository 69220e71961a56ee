use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use libseccomp::ScmpNotifReq;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::socket::SockFlag;
use nix::sys::stat::fstat;
use socktap_common::{Domain, Event, EventSink, Result, SocktapError};
use tokio::task;
use tracing::{debug, info, warn};

use crate::fd::Fd;
use crate::inode::InodeTable;
use crate::process::{read_mem, write_mem, ProcessTable};
use crate::seccomp::NotifyFd;
use crate::socket::Socket;

/// Socket address family constants as they appear on the wire
const AF_INET: u16 = libc::AF_INET as u16;
const AF_INET6: u16 = libc::AF_INET6 as u16;

/// Low nibble of the socket(2) type argument; the rest is flags.
const SOCK_TYPE_MASK: i32 = 0xf;

/// Largest sockaddr the engine will read from target memory.
const MAX_SOCKADDR_LEN: usize = 128;

/// How a handled notification is answered.
enum Reply {
    /// Complete the syscall with a return value.
    Val(i64),
    /// Complete the syscall with an errno.
    Errno(i32),
    /// Let the kernel execute the syscall natively.
    Continue,
    /// Already completed (atomic fd install), or target gone.
    Done,
}

/// Syscall dispatcher: reads seccomp notifications, resolves the target's
/// descriptor to a shadow socket, runs the façade, and answers.
pub struct Engine {
    sink: EventSink,
    notify: NotifyFd,
    itab: Arc<InodeTable>,
    procs: ProcessTable,
}

impl Engine {
    pub fn new(sink: EventSink, notify_fd: RawFd, root_pid: u32, root_pidfd: RawFd) -> Arc<Engine> {
        Arc::new(Engine {
            sink,
            notify: NotifyFd::new(notify_fd),
            itab: InodeTable::new(),
            procs: ProcessTable::new(root_pid, root_pidfd),
        })
    }

    /// Notification loop. Each notification is handled on its own task so
    /// a blocking connect or accept never stalls the dispatcher.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("dispatcher running: notify_fd={}", self.notify.raw());

        let mut failures = 0u32;
        loop {
            let fd = self.notify.raw();
            let received =
                task::spawn_blocking(move || libseccomp::ScmpNotifReq::receive(fd)).await;
            let req = match received {
                Ok(Ok(req)) => {
                    failures = 0;
                    req
                }
                Ok(Err(e)) => {
                    // ENOENT here means the blocked syscall went away before
                    // we picked it up; treat persistent failure as fatal.
                    failures += 1;
                    if failures > 16 {
                        return Err(e.into());
                    }
                    debug!("notification receive failed: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(SocktapError::ProcessError(format!(
                        "notification receive task failed: {}",
                        e
                    )));
                }
            };

            let engine = Arc::clone(&self);
            task::spawn(async move {
                let id = req.id;
                let nr = i64::from(i32::from(req.data.syscall));
                let reply = match engine.handle(&req).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        // infrastructure failure: never fatal to the target
                        warn!("handler failed: syscall={} tid={} err={}", nr, req.pid, e);
                        Reply::Errno(libc::ENOSYS)
                    }
                };
                engine.finish(id, reply);
            });
        }
    }

    fn finish(&self, id: u64, reply: Reply) {
        let result = match reply {
            Reply::Done => return,
            Reply::Val(val) => self.notify.reply_value(id, val),
            Reply::Errno(errno) => self.notify.reply_errno(id, errno),
            Reply::Continue => self.notify.reply_continue(id),
        };
        if let Err(e) = result {
            debug!("reply for notification {} failed (target gone?): {}", id, e);
        }
    }

    async fn handle(&self, req: &ScmpNotifReq) -> Result<Reply> {
        let nr = i64::from(i32::from(req.data.syscall));
        match nr {
            libc::SYS_socket => self.sys_socket(req),
            libc::SYS_connect => self.sys_connect(req).await,
            libc::SYS_bind => self.sys_bind(req),
            libc::SYS_listen => self.sys_listen(req).await,
            #[cfg(target_arch = "x86_64")]
            libc::SYS_accept => self.sys_accept(req, 0).await,
            libc::SYS_accept4 => self.sys_accept(req, req.data.args[3] as i32).await,
            libc::SYS_getsockname => self.sys_sockname(req, true),
            libc::SYS_getpeername => self.sys_sockname(req, false),
            libc::SYS_getsockopt => self.sys_getsockopt(req),
            libc::SYS_close => self.sys_close(req),
            libc::SYS_dup => self.sys_dup(req, None, 0, false),
            #[cfg(target_arch = "x86_64")]
            libc::SYS_dup2 => self.sys_dup(req, Some(req.data.args[1] as i32), 0, false),
            libc::SYS_dup3 => {
                self.sys_dup(req, Some(req.data.args[1] as i32), req.data.args[2] as i32, true)
            }
            _ => {
                warn!("unexpected intercepted syscall {} from tid {}", nr, req.pid);
                Ok(Reply::Continue)
            }
        }
    }

    /// Template for the events of one socket.
    fn socket_template(&self, tgid: u32, domain: Domain) -> Event {
        let mut tmpl = Event::new();
        tmpl.set("protocol", "tcp");
        tmpl.set("pid", tgid.to_string());
        tmpl.set("domain", domain.to_string());
        tmpl
    }

    /// Resolve a target descriptor to its shadow socket. Unknown
    /// descriptors are identified by inode via pidfd_getfd + fstat, which
    /// is how dup(2)- and SCM_RIGHTS-shared descriptors join an existing
    /// inode as a fresh alias. None means "not one of ours".
    fn resolve(
        &self,
        tid: u32,
        fd: i32,
    ) -> Result<Option<(Arc<crate::process::FdTable>, Arc<Socket>)>> {
        let table = self.procs.table_for(tid)?;
        if let Some(sock) = table.get(fd) {
            return Ok(Some((table, sock)));
        }
        let Some(raw) = table.grab(fd) else {
            return Ok(None);
        };
        let stat = match fstat(raw) {
            Ok(stat) => stat,
            Err(_) => {
                let _ = nix::unistd::close(raw);
                return Ok(None);
            }
        };
        match self.itab.get(stat.st_ino) {
            Some(inode) if !inode.state().is_closed() => {
                let tmpl = self.socket_template(table.tgid, inode.domain);
                let sock = Socket::adopt(self.sink.clone(), tmpl, inode, Fd::new(raw));
                table.insert(fd, Arc::clone(&sock));
                debug!("discovered alias: tgid={} fd={} inode={}", table.tgid, fd, sock.inode.number);
                Ok(Some((table, sock)))
            }
            _ => {
                let _ = nix::unistd::close(raw);
                Ok(None)
            }
        }
    }

    /// Bookkeeping close of a shadow socket; drops the inode table entry
    /// once the last alias is gone.
    fn finish_close(&self, sock: &Arc<Socket>) {
        let _ = sock.close();
        if sock.inode.state().is_closed() {
            self.itab.remove(sock.inode.number);
        }
    }

    fn sys_socket(&self, req: &ScmpNotifReq) -> Result<Reply> {
        let raw_domain = req.data.args[0] as i32;
        let typ = req.data.args[1] as i32;
        let protocol = req.data.args[2] as i32;

        // Shadow only inet stream sockets; everything else runs natively.
        let Some(domain) = Domain::from_raw(raw_domain) else {
            return Ok(Reply::Continue);
        };
        if typ & SOCK_TYPE_MASK != libc::SOCK_STREAM {
            return Ok(Reply::Continue);
        }
        if protocol != 0 && protocol != libc::IPPROTO_TCP {
            return Ok(Reply::Continue);
        }

        let table = self.procs.table_for(req.pid)?;
        let mut extra = SockFlag::empty();
        if typ & libc::SOCK_NONBLOCK != 0 {
            extra |= SockFlag::SOCK_NONBLOCK;
        }
        let tmpl = self.socket_template(table.tgid, domain);
        let sock = Socket::create(self.sink.clone(), tmpl, domain, extra)?;
        self.itab.insert(&sock.inode);

        let cloexec = typ & libc::SOCK_CLOEXEC != 0;
        match self.notify.install_fd(req.id, sock.fd.raw(), cloexec) {
            Ok(target_fd) => {
                table.insert(target_fd, Arc::clone(&sock));
                debug!(
                    "installed socket: tgid={} fd={} inode={}",
                    table.tgid, target_fd, sock.inode.number
                );
                Ok(Reply::Done)
            }
            Err(e) => {
                debug!("socket install failed (target gone?): {}", e);
                self.finish_close(&sock);
                Ok(Reply::Done)
            }
        }
    }

    /// Read and decode the sockaddr argument from target memory.
    fn read_sockaddr(&self, req: &ScmpNotifReq, ptr: u64, len: u64) -> Result<Option<SocketAddr>> {
        let len = (len as usize).min(MAX_SOCKADDR_LEN);
        if ptr == 0 || len < 2 {
            return Ok(None);
        }
        let buf = read_mem(req.pid, ptr, len)?;
        if !self.notify.id_valid(req.id) {
            // syscall aborted between the read and now; the buffer may be junk
            return Ok(None);
        }
        Ok(parse_sockaddr(&buf))
    }

    async fn sys_connect(&self, req: &ScmpNotifReq) -> Result<Reply> {
        let fd = req.data.args[0] as i32;
        let Some((_, sock)) = self.resolve(req.pid, fd)? else {
            return Ok(Reply::Continue);
        };
        let Some(addr) = self.read_sockaddr(req, req.data.args[1], req.data.args[2])? else {
            return Ok(Reply::Errno(libc::EINVAL));
        };
        let outcome = sock.connect(addr).await?;
        Ok(match outcome {
            Ok(val) => Reply::Val(val),
            Err(errno) => Reply::Errno(errno),
        })
    }

    fn sys_bind(&self, req: &ScmpNotifReq) -> Result<Reply> {
        let fd = req.data.args[0] as i32;
        let Some((_, sock)) = self.resolve(req.pid, fd)? else {
            return Ok(Reply::Continue);
        };
        let Some(addr) = self.read_sockaddr(req, req.data.args[1], req.data.args[2])? else {
            return Ok(Reply::Errno(libc::EINVAL));
        };
        let outcome = sock.bind(addr)?;
        Ok(match outcome {
            Ok(val) => Reply::Val(val),
            Err(errno) => Reply::Errno(errno),
        })
    }

    async fn sys_listen(&self, req: &ScmpNotifReq) -> Result<Reply> {
        let fd = req.data.args[0] as i32;
        let backlog = req.data.args[1] as i32;
        let Some((_, sock)) = self.resolve(req.pid, fd)? else {
            return Ok(Reply::Continue);
        };
        let outcome = sock.listen(backlog).await?;
        Ok(match outcome {
            Ok(val) => Reply::Val(val),
            Err(errno) => Reply::Errno(errno),
        })
    }

    async fn sys_accept(&self, req: &ScmpNotifReq, raw_flags: i32) -> Result<Reply> {
        let fd = req.data.args[0] as i32;
        let addr_ptr = req.data.args[1];
        let len_ptr = req.data.args[2];
        let Some((table, sock)) = self.resolve(req.pid, fd)? else {
            return Ok(Reply::Continue);
        };

        let flags = SockFlag::from_bits_truncate(raw_flags);
        let outcome = sock.accept(flags).await?;
        let (child, peer) = match outcome {
            Ok(pair) => pair,
            Err(errno) => return Ok(Reply::Errno(errno)),
        };

        self.itab.insert(&child.inode);
        if addr_ptr != 0 && len_ptr != 0 {
            if !self.notify.id_valid(req.id) {
                self.finish_close(&child);
                return Ok(Reply::Done);
            }
            if let Err(e) = self.write_addr(req.pid, addr_ptr, len_ptr, &peer) {
                debug!("writing accept peer address failed: {}", e);
            }
        }

        let cloexec = raw_flags & libc::SOCK_CLOEXEC != 0;
        match self.notify.install_fd(req.id, child.fd.raw(), cloexec) {
            Ok(target_fd) => {
                table.insert(target_fd, Arc::clone(&child));
                debug!(
                    "installed accepted socket: tgid={} fd={} inode={} peer={}",
                    table.tgid, target_fd, child.inode.number, peer
                );
                Ok(Reply::Done)
            }
            Err(e) => {
                debug!("accept install failed (target gone?): {}", e);
                self.finish_close(&child);
                Ok(Reply::Done)
            }
        }
    }

    fn sys_sockname(&self, req: &ScmpNotifReq, local: bool) -> Result<Reply> {
        let fd = req.data.args[0] as i32;
        let Some((_, sock)) = self.resolve(req.pid, fd)? else {
            return Ok(Reply::Continue);
        };
        let addr = if local {
            match sock.bind_addr() {
                Ok(opt) => opt.unwrap_or_else(|| sock.inode.domain.unspecified()),
                Err(errno) => return Ok(Reply::Errno(errno)),
            }
        } else {
            match sock.peer_addr() {
                Ok(addr) => addr,
                Err(errno) => return Ok(Reply::Errno(errno)),
            }
        };
        if !self.notify.id_valid(req.id) {
            return Ok(Reply::Done);
        }
        self.write_addr(req.pid, req.data.args[1], req.data.args[2], &addr)?;
        Ok(Reply::Val(0))
    }

    /// Only SO_ERROR is shadowed: it must report the latched outcome of an
    /// asynchronous dial. Every other option runs against the real socket.
    fn sys_getsockopt(&self, req: &ScmpNotifReq) -> Result<Reply> {
        let level = req.data.args[1] as i32;
        let optname = req.data.args[2] as i32;
        if level != libc::SOL_SOCKET || optname != libc::SO_ERROR {
            return Ok(Reply::Continue);
        }
        let fd = req.data.args[0] as i32;
        let Some((_, sock)) = self.resolve(req.pid, fd)? else {
            return Ok(Reply::Continue);
        };
        let errno = sock.so_error();

        let optval_ptr = req.data.args[3];
        let optlen_ptr = req.data.args[4];
        if optval_ptr == 0 || optlen_ptr == 0 {
            return Ok(Reply::Errno(libc::EFAULT));
        }
        if !self.notify.id_valid(req.id) {
            return Ok(Reply::Done);
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&read_mem(req.pid, optlen_ptr, 4)?);
        let cap = u32::from_ne_bytes(len_buf) as usize;
        let value = errno.to_ne_bytes();
        let n = cap.min(value.len());
        if n > 0 {
            write_mem(req.pid, optval_ptr, &value[..n])?;
        }
        write_mem(req.pid, optlen_ptr, &(n as u32).to_ne_bytes())?;
        Ok(Reply::Val(0))
    }

    /// Bookkeeping for close(2); the kernel then runs the target's close
    /// natively, so the descriptor really leaves its table and a second
    /// close earns EBADF from the kernel itself.
    fn sys_close(&self, req: &ScmpNotifReq) -> Result<Reply> {
        let fd = req.data.args[0] as i32;
        let table = self.procs.table_for(req.pid)?;
        if let Some(sock) = table.remove(fd) {
            self.finish_close(&sock);
        }
        Ok(Reply::Continue)
    }

    /// dup(2) family. The alias gets its own tracer-side descriptor of the
    /// same open file and is installed into the target at the kernel-chosen
    /// (dup) or caller-chosen (dup2/dup3) number.
    fn sys_dup(
        &self,
        req: &ScmpNotifReq,
        newfd: Option<i32>,
        flags: i32,
        dup3: bool,
    ) -> Result<Reply> {
        let oldfd = req.data.args[0] as i32;
        if dup3 && newfd == Some(oldfd) {
            return Ok(Reply::Errno(libc::EINVAL));
        }
        let Some((table, sock)) = self.resolve(req.pid, oldfd)? else {
            return Ok(Reply::Continue);
        };
        if let Some(new) = newfd {
            if new == oldfd {
                // dup2 over itself just validates the descriptor
                return Ok(Reply::Val(new as i64));
            }
            if let Some(replaced) = table.remove(new) {
                // dup2/dup3 silently close whatever sat at newfd
                self.finish_close(&replaced);
            }
        }

        let raw = match fcntl(sock.fd.raw(), FcntlArg::F_DUPFD_CLOEXEC(3)) {
            Ok(raw) => raw,
            Err(e) => return Ok(Reply::Errno(e as i32)),
        };
        let tmpl = self.socket_template(table.tgid, sock.inode.domain);
        let alias = Socket::adopt(self.sink.clone(), tmpl, Arc::clone(&sock.inode), Fd::new(raw));

        let cloexec = flags & libc::O_CLOEXEC != 0;
        let installed = match newfd {
            None => self.notify.install_fd(req.id, alias.fd.raw(), cloexec),
            Some(new) => self.notify.install_fd_at(req.id, alias.fd.raw(), new, cloexec),
        };
        match installed {
            Ok(target_fd) => {
                table.insert(target_fd, alias);
                debug!("installed dup alias: tgid={} oldfd={} newfd={}", table.tgid, oldfd, target_fd);
                Ok(Reply::Done)
            }
            Err(e) => {
                debug!("dup install failed (target gone?): {}", e);
                self.finish_close(&alias);
                Ok(Reply::Done)
            }
        }
    }

    /// Write a sockaddr out-parameter pair (buffer + length) the way the
    /// kernel does: truncate to the caller's capacity, report the full
    /// length written.
    fn write_addr(&self, tid: u32, addr_ptr: u64, len_ptr: u64, addr: &SocketAddr) -> Result<()> {
        if addr_ptr == 0 || len_ptr == 0 {
            return Ok(());
        }
        let encoded = encode_sockaddr(addr);
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&read_mem(tid, len_ptr, 4)?);
        let cap = u32::from_ne_bytes(len_buf) as usize;
        let n = cap.min(encoded.len());
        if n > 0 {
            write_mem(tid, addr_ptr, &encoded[..n])?;
        }
        write_mem(tid, len_ptr, &(encoded.len() as u32).to_ne_bytes())?;
        Ok(())
    }
}

/// Decode a sockaddr_in/sockaddr_in6 read from target memory.
pub(crate) fn parse_sockaddr(buf: &[u8]) -> Option<SocketAddr> {
    if buf.len() < 2 {
        return None;
    }
    let family = u16::from_ne_bytes([buf[0], buf[1]]);
    match family {
        AF_INET => {
            if buf.len() < 8 {
                return None;
            }
            let port = u16::from_be_bytes([buf[2], buf[3]]);
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        AF_INET6 => {
            if buf.len() < 28 {
                return None;
            }
            let port = u16::from_be_bytes([buf[2], buf[3]]);
            let flowinfo = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[8..24]);
            let scope_id = u32::from_ne_bytes([buf[24], buf[25], buf[26], buf[27]]);
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(ip),
                port,
                flowinfo,
                scope_id,
            )))
        }
        _ => None,
    }
}

/// Encode a sockaddr_in/sockaddr_in6 for writing into target memory.
pub(crate) fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = vec![0u8; 16];
            buf[0..2].copy_from_slice(&AF_INET.to_ne_bytes());
            buf[2..4].copy_from_slice(&v4.port().to_be_bytes());
            buf[4..8].copy_from_slice(&v4.ip().octets());
            buf
        }
        SocketAddr::V6(v6) => {
            let mut buf = vec![0u8; 28];
            buf[0..2].copy_from_slice(&AF_INET6.to_ne_bytes());
            buf[2..4].copy_from_slice(&v6.port().to_be_bytes());
            buf[4..8].copy_from_slice(&v6.flowinfo().to_ne_bytes());
            buf[8..24].copy_from_slice(&v6.ip().octets());
            buf[24..28].copy_from_slice(&v6.scope_id().to_ne_bytes());
            buf
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_v4_round_trip() {
        let addr: SocketAddr = "93.184.216.34:80".parse().unwrap();
        let buf = encode_sockaddr(&addr);
        assert_eq!(buf.len(), 16);
        assert_eq!(parse_sockaddr(&buf), Some(addr));
    }

    #[test]
    fn test_sockaddr_v6_round_trip() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let buf = encode_sockaddr(&addr);
        assert_eq!(buf.len(), 28);
        assert_eq!(parse_sockaddr(&buf), Some(addr));
    }

    #[test]
    fn test_parse_rejects_short_and_foreign() {
        assert_eq!(parse_sockaddr(&[]), None);
        assert_eq!(parse_sockaddr(&[0]), None);

        // truncated sockaddr_in
        let addr: SocketAddr = "1.2.3.4:5".parse().unwrap();
        let buf = encode_sockaddr(&addr);
        assert_eq!(parse_sockaddr(&buf[..6]), None);

        // AF_UNIX
        let unix = (libc::AF_UNIX as u16).to_ne_bytes();
        assert_eq!(parse_sockaddr(&[unix[0], unix[1], 0, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn test_parse_port_is_network_order() {
        let addr: SocketAddr = "127.0.0.1:258".parse().unwrap(); // 0x0102
        let buf = encode_sockaddr(&addr);
        assert_eq!(buf[2], 0x01);
        assert_eq!(buf[3], 0x02);
    }
}
