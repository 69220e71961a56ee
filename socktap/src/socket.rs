use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lazy_static::lazy_static;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::socket::{
    accept4, bind, connect, getpeername, listen, setsockopt, socket, sockopt, SockFlag,
    SockProtocol, SockType, SockaddrStorage,
};
use nix::sys::stat::fstat;
use socktap_common::{normalize, Domain, Event, EventSink, Result, SocktapError, SysOutcome, SysRet};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tracing::{debug, error, warn};

use crate::fd::Fd;
use crate::inode::Inode;
use crate::proxy::Proxy;
use crate::state::{Listening, State};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// One target-side descriptor of a shadowed TCP socket. Several sockets may
/// alias the same [`Inode`]; state lives there, identity lives here.
pub struct Socket {
    id: u64,
    tmpl: Event,
    sink: EventSink,
    pub inode: Arc<Inode>,
    pub fd: Arc<Fd>,
}

impl Socket {
    /// Wrap an existing tracer-side descriptor as a new alias of `inode`.
    pub fn adopt(sink: EventSink, tmpl: Event, inode: Arc<Inode>, fd: Arc<Fd>) -> Arc<Socket> {
        let sock = Arc::new(Socket {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            tmpl,
            sink,
            inode,
            fd,
        });
        sock.inode.add_alias(sock.id);
        sock
    }

    /// Create a fresh kernel TCP socket and its shadow. The descriptor gets
    /// SOCK_CLOEXEC in our table regardless of what the target asked for;
    /// the target's own CLOEXEC preference is applied at install time.
    pub fn create(
        sink: EventSink,
        tmpl: Event,
        domain: Domain,
        extra: SockFlag,
    ) -> Result<Arc<Socket>> {
        let raw = socket(
            domain.family(),
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | extra,
            SockProtocol::Tcp,
        )?;
        let stat = match fstat(raw) {
            Ok(stat) => stat,
            Err(e) => {
                let _ = nix::unistd::close(raw);
                return Err(e.into());
            }
        };

        let inode = Inode::new(domain, stat.st_ino, State::Passive { bind: None, errno: None });
        let sock = Socket::adopt(sink, tmpl, inode, Fd::new(raw));
        debug!("created socket: inode={} fd={} domain={}", sock.inode.number, raw, domain);
        Ok(sock)
    }

    fn is_blocking(&self) -> Result<bool> {
        let flags = fcntl(self.fd.raw(), FcntlArg::F_GETFL)?;
        Ok(flags & libc::O_NONBLOCK == 0)
    }

    /// Connect the socket to `peer`.
    ///
    /// The target's real kernel socket is connected to a dummy loopback
    /// listener so that it looks and behaves like a connected socket, while
    /// the dial to the real peer runs concurrently. For a blocking socket
    /// the call returns only once the dial outcome is known; for a
    /// non-blocking socket it returns whatever the loopback connect yielded
    /// (typically 0 or EINPROGRESS) and the outcome is latched for
    /// getsockopt(SO_ERROR).
    pub async fn connect(&self, peer: SocketAddr) -> Result<SysRet> {
        let Some(_r) = self.fd.try_ref() else {
            return Ok(Err(libc::EBADF));
        };

        let prev = self.inode.state();
        let prev_bind = match &*prev {
            State::Passive { bind, .. } => bind.clone(),
            State::Connected { .. } => return Ok(Err(libc::EISCONN)),
            State::Connecting { .. } => {
                return Ok(Err(if self.is_blocking()? {
                    libc::EALREADY
                } else {
                    libc::EINPROGRESS
                }));
            }
            // Linux rejects connect on a listening socket with EISCONN:
            // __inet_stream_connect requires sk_state == TCP_CLOSE.
            State::Listening(_) => return Ok(Err(libc::EISCONN)),
            State::Closed => return Ok(Err(libc::EBADF)),
        };

        let is_blocking = self.is_blocking()?;

        // Park an ephemeral bind if the target never bound, so getsockname
        // answers consistently between the target's connect and the final
        // state CAS.
        let created_bind = prev_bind.is_none();
        let (bind_fd, bind_addr) = match prev_bind {
            Some(bind_fd) => {
                let addr = match prev.bind_addr() {
                    Ok(addr) => addr,
                    Err(errno) => return Ok(Err(errno)),
                };
                (bind_fd, addr)
            }
            None => {
                let bind_fd = temp_bind_socket(self.inode.domain)?;
                match bind_ephemeral(self.inode.domain, &bind_fd, false) {
                    Ok(addr) => (bind_fd, Some(addr)),
                    Err(e) => {
                        close_parked(&bind_fd);
                        return Err(e);
                    }
                }
            }
        };

        debug!(
            "attempting connect: inode={} peer={} bind={:?} blocking={}",
            self.inode.number, peer, bind_addr, is_blocking
        );

        let mid = Arc::new(State::Connecting { bind: Arc::clone(&bind_fd), peer });
        if !self.inode.transition(&prev, Arc::clone(&mid)) {
            if created_bind {
                close_parked(&bind_fd);
            }
            return Ok(Err(libc::ERESTART));
        }

        let dummy = DummyListener::new(self.inode.domain).await?;
        let dummy_addr = dummy.addr;
        let begin = Instant::now();

        // The dummy accept and the external dial race concurrently; the
        // Connected publication is gated on both.
        let accept_task = task::spawn(async move {
            dummy.lis.accept().await.map(|(stream, _)| stream)
        });
        let dial_domain = self.inode.domain;
        let dial_task =
            task::spawn(async move { dial_external(dial_domain, bind_addr, peer).await });

        let (errno_tx, errno_rx) = oneshot::channel::<i32>();
        let inode = Arc::clone(&self.inode);
        let tmpl = self.tmpl.clone();
        let sink = self.sink.clone();
        task::spawn(async move {
            let process = accept_task.await;
            let external = dial_task.await;

            let mut errno = 0i32;
            let mut next = None;
            let mut proxy = None;

            // Check the dummy accept before the dial: the former almost
            // never fails while the dial fails in many ordinary ways.
            match (process, external) {
                (Ok(Ok(process)), Ok(Ok(external))) => {
                    match Proxy::new(tmpl, sink, process, external, true, begin) {
                        Ok(p) => {
                            proxy = Some(Arc::clone(&p));
                            next = Some(Arc::new(State::Connected { proxy: p }));
                        }
                        Err(e) => {
                            error!("failed to assemble proxy pair: {}", e);
                            errno = libc::ENOSYS;
                        }
                    }
                }
                (Ok(Ok(process)), Ok(Err(e))) => {
                    debug!(
                        "external dial failed: peer={} err={} took_us={}",
                        peer,
                        e,
                        begin.elapsed().as_micros()
                    );
                    drop(process);
                    match e.raw_os_error() {
                        Some(raw) => {
                            errno = raw;
                            next = Some(Arc::new(State::Passive {
                                bind: Some(Arc::clone(&bind_fd)),
                                errno: Some(raw),
                            }));
                        }
                        None => {
                            error!("external dial error carries no errno: {}", e);
                            errno = libc::ENOSYS;
                        }
                    }
                }
                (accept_err, _) => {
                    error!("dummy listener accept failed: {:?}", accept_err.map(|r| r.map(|_| ())));
                    errno = libc::ENOSYS;
                }
            }

            let mut should_close_bind = true;
            if let Some(next) = next {
                if !inode.transition(&mid, Arc::clone(&next)) {
                    errno = libc::ERESTART;
                } else {
                    match &*next {
                        State::Passive { .. } => {
                            // The latched errno keeps a reference to the
                            // parked bind so a later getsockopt(SO_ERROR)
                            // and getsockname still answer correctly.
                            should_close_bind = false;
                        }
                        State::Connected { proxy } => {
                            task::spawn(Arc::clone(proxy).start());
                        }
                        _ => {}
                    }
                }
            }

            // Report as early as possible: a blocking connect is waiting.
            let _ = errno_tx.send(errno);

            if errno != 0 {
                if let Some(p) = proxy {
                    p.discard();
                }
            }
            if should_close_bind {
                // The parked bind may already be closed by a racing close();
                // the one-shot closing bit makes that a non-event here.
                close_parked(&bind_fd);
            }
        });

        // Connect the target's real socket to the dummy listener. Its
        // return value is what the target sees as the connect(2) result.
        // Note the known fidelity gap: the loopback handshake completes in
        // microseconds no matter how far the real peer is, and a failed
        // dial surfaces as ECONNREFUSED unless SO_ERROR is also consulted.
        let dummy_errno = match connect(self.fd.raw(), &SockaddrStorage::from(dummy_addr)) {
            Ok(()) => 0,
            Err(e) => e as i32,
        };

        if is_blocking {
            let errno = errno_rx.await.unwrap_or(libc::ENOSYS);
            if errno != 0 {
                return Ok(Err(errno));
            }
            debug!("connected blocking socket: inode={} peer={}", self.inode.number, peer);
        } else {
            debug!(
                "started non-blocking connect: inode={} peer={} errno={}",
                self.inode.number, peer, dummy_errno
            );
        }

        if dummy_errno == 0 {
            Ok(Ok(0))
        } else {
            Ok(Err(dummy_errno))
        }
    }

    /// Bind the socket to `addr` by parking the address on a throwaway real
    /// socket, which both validates the address and reserves it.
    pub fn bind(&self, addr: SocketAddr) -> Result<SysRet> {
        let Some(_r) = self.fd.try_ref() else {
            return Ok(Err(libc::EBADF));
        };

        let prev = self.inode.state();
        let prev_bind = match &*prev {
            State::Passive { bind, .. } => bind.clone(),
            State::Connected { .. } | State::Connecting { .. } | State::Listening(_) => {
                return Ok(Err(libc::EINVAL));
            }
            State::Closed => return Ok(Err(libc::EBADF)),
        };

        if !self.inode.domain.matches(&addr) {
            return Ok(Err(libc::EINVAL));
        }

        let created = prev_bind.is_none();
        let bind_fd = match &prev_bind {
            Some(bind_fd) => Arc::clone(bind_fd),
            None => temp_bind_socket(self.inode.domain)?,
        };
        let Some(_bind_ref) = bind_fd.try_ref() else {
            return Ok(Err(libc::EBADF));
        };

        if let Err(e) = bind(bind_fd.raw(), &SockaddrStorage::from(addr)) {
            if created {
                close_parked(&bind_fd);
            }
            let next = Arc::new(State::Passive { bind: prev_bind, errno: Some(e as i32) });
            if !self.inode.transition(&prev, next) {
                return Ok(Err(libc::ERESTART));
            }
            return Ok(Err(e as i32));
        }

        let next = Arc::new(State::Passive { bind: Some(Arc::clone(&bind_fd)), errno: None });
        if !self.inode.transition(&prev, next) {
            if created {
                close_parked(&bind_fd);
            }
            return Ok(Err(libc::ERESTART));
        }

        debug!("bound socket: inode={} addr={}", self.inode.number, addr);
        Ok(Ok(0))
    }

    /// Start listening. The target's own socket becomes the loopback-side
    /// listener (bound to an ephemeral loopback address), and a real
    /// external listener takes over the parked bind address.
    pub async fn listen(&self, backlog: i32) -> Result<SysRet> {
        let Some(_r) = self.fd.try_ref() else {
            return Ok(Err(libc::EBADF));
        };

        let prev = self.inode.state();
        match &*prev {
            State::Passive { .. } => {}
            State::Connected { .. } | State::Connecting { .. } => return Ok(Err(libc::EINVAL)),
            State::Listening(_) => return Ok(Ok(0)),
            State::Closed => return Ok(Err(libc::EBADF)),
        }
        let State::Passive { bind: prev_bind, .. } = &*prev else {
            unreachable!()
        };

        // The kernel quietly raises tiny backlogs too; eight keeps the
        // loopback side from refusing bursts the external side accepted.
        let backlog = backlog.max(8);

        let ephemeral = bind_ephemeral(self.inode.domain, &self.fd, true)?;
        listen(self.fd.raw(), backlog as usize)?;

        let bind_addr = match prev.bind_addr() {
            Ok(addr) => addr,
            Err(errno) => return Ok(Err(errno)),
        };

        let lis = match external_listener(self.inode.domain, bind_addr, backlog as u32).await {
            Ok(lis) => lis,
            Err(e) => match e.raw_os_error() {
                Some(raw) => return Ok(Err(raw)),
                None => return Err(e.into()),
            },
        };

        // Close the parked bind only after the external listener is live,
        // so no other program can squeeze into the port in between.
        if let Some(bind_fd) = prev_bind {
            close_parked(bind_fd);
        }

        let local = lis.local_addr().map_err(SocktapError::from)?;
        let next = Arc::new(State::Listening(Listening::new(local)));
        let State::Listening(listening) = &*next else {
            unreachable!()
        };
        let shutdown = Arc::clone(&listening.shutdown);
        if !self.inode.transition(&prev, Arc::clone(&next)) {
            drop(lis);
            return Ok(Err(libc::ERESTART));
        }

        // Separate accept and dispatch loops so the channel in between acts
        // as both a fixed-size buffer and a rate limiter.
        let (buffer_tx, mut buffer_rx) = mpsc::channel::<TcpStream>(backlog as usize * 2);

        let state = Arc::clone(&next);
        let inode_nr = self.inode.number;
        task::spawn(async move {
            // accept loop
            let State::Listening(listening) = &*state else {
                unreachable!()
            };
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    res = lis.accept() => match res {
                        Ok((external, peer)) => {
                            debug!("external connection accepted: inode={} peer={}", inode_nr, peer);
                            if buffer_tx.send(external).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("failed to accept incoming connection: inode={} err={}", inode_nr, e);
                            break;
                        }
                    },
                }
            }
            listening.active.store(false, Ordering::Release);
            // dropping lis closes the external listener
        });

        let state = Arc::clone(&next);
        let tmpl = self.tmpl.clone();
        let sink = self.sink.clone();
        task::spawn(async move {
            // dispatch loop
            while let Some(external) = buffer_rx.recv().await {
                let state = Arc::clone(&state);
                let tmpl = tmpl.clone();
                let sink = sink.clone();
                task::spawn(async move {
                    let process = match TcpStream::connect(ephemeral).await {
                        Ok(process) => process,
                        Err(e) => {
                            // not fatal: the target probably went away
                            debug!("failed to dial loopback ephemeral address: {}", e);
                            return;
                        }
                    };
                    let proxy = match Proxy::new(tmpl, sink, process, external, false, Instant::now()) {
                        Ok(proxy) => proxy,
                        Err(e) => {
                            debug!("failed to assemble inbound proxy pair: {}", e);
                            return;
                        }
                    };
                    let addr = proxy.process_local();
                    let State::Listening(listening) = &*state else {
                        unreachable!()
                    };
                    if listening.sender_for(addr).try_send(proxy).is_err() {
                        warn!("accept rendezvous refused dispatched connection: addr={}", addr);
                    } else {
                        debug!("dispatcher enqueued accepted connection: addr={}", addr);
                    }
                });
            }
        });

        debug!(
            "marked socket as listening: inode={} external={} backlog={}",
            self.inode.number, local, backlog
        );
        Ok(Ok(0))
    }

    /// Accept one connection. Blocks (on a blocking socket) until the
    /// dispatcher has paired the external accept with a process-side dial.
    /// On success returns the new shadow socket and the peer address the
    /// target must be told.
    pub async fn accept(&self, flags: SockFlag) -> Result<SysOutcome<(Arc<Socket>, SocketAddr)>> {
        let Some(_r) = self.fd.try_ref() else {
            return Ok(Err(libc::EBADF));
        };

        let cur = self.inode.state();
        let listening = match &*cur {
            State::Listening(l) => l,
            State::Closed => return Ok(Err(libc::EBADF)),
            _ => return Ok(Err(libc::EINVAL)),
        };
        if !listening.active.load(Ordering::Acquire) {
            return Ok(Err(libc::EINVAL));
        }

        let raw = self.fd.raw();
        let accepted = task::spawn_blocking(move || accept4(raw, flags | SockFlag::SOCK_CLOEXEC))
            .await
            .map_err(|e| SocktapError::ProcessError(format!("accept task failed: {}", e)))?;
        let ret = match accepted {
            Ok(ret) => ret,
            // accept(2) failure leaves the socket state untouched
            Err(e) => return Ok(Err(e as i32)),
        };

        let peer = match getpeername::<SockaddrStorage>(ret) {
            Ok(ss) => match crate::state::storage_to_addr(&ss) {
                Some(addr) => normalize(addr),
                None => {
                    let _ = nix::unistd::close(ret);
                    return Err(SocktapError::NetworkError(
                        "accepted connection has a non-inet peer".into(),
                    ));
                }
            },
            Err(e) => {
                let _ = nix::unistd::close(ret);
                return Ok(Err(e as i32));
            }
        };

        let Some(mut rx) = listening.receiver_for(peer) else {
            let _ = nix::unistd::close(ret);
            return Err(SocktapError::ProcessError(format!(
                "accept rendezvous for {} already consumed",
                peer
            )));
        };
        let Some(proxy) = rx.recv().await else {
            let _ = nix::unistd::close(ret);
            return Err(SocktapError::ProcessError(
                "accept rendezvous channel closed".into(),
            ));
        };
        if proxy.process_local() != peer {
            panic!(
                "dialed process-side local does not match accepted connection: {} != {}",
                proxy.process_local(),
                peer
            );
        }
        debug!("accepter dequeued connection: inode={} addr={}", self.inode.number, peer);

        let stat = match fstat(ret) {
            Ok(stat) => stat,
            Err(e) => {
                let _ = nix::unistd::close(ret);
                return Err(e.into());
            }
        };

        let inode = Inode::new(
            self.inode.domain,
            stat.st_ino,
            State::Connected { proxy: Arc::clone(&proxy) },
        );
        let child = Socket::adopt(self.sink.clone(), self.tmpl.clone(), inode, Fd::new(ret));
        debug!("created socket: method=accept inode={} fd={}", child.inode.number, ret);

        task::spawn(proxy.start());
        Ok(Ok((child, peer)))
    }

    /// Close this alias. The last alias drives the inode to `Closed` and
    /// releases whatever the previous state owned.
    pub fn close(&self) -> SysRet {
        let Some(_r) = self.fd.closing_ref() else {
            return Err(libc::EBADF);
        };

        if let Err(errno) = self.fd.close_raw() {
            // close(2) errors other than already-closed are non-fatal
            if errno == libc::EBADF {
                return Err(errno);
            }
            warn!("close socket fd: inode={} errno={}", self.inode.number, errno);
        }

        if !self.inode.remove_alias(self.id) {
            return Ok(0);
        }

        let prev = loop {
            let prev = self.inode.state();
            if prev.is_closed() {
                panic!("final close for inode {}: state is already closed", self.inode.number);
            }
            if self.inode.transition(&prev, Arc::new(State::Closed)) {
                break prev;
            }
        };

        match &*prev {
            State::Passive { bind: Some(bind_fd), .. } => close_parked(bind_fd),
            State::Passive { bind: None, .. } => {}
            State::Connecting { bind, .. } => close_parked(bind),
            State::Connected { proxy } => proxy.close_tcp(),
            State::Listening(l) => {
                // If the accept loop already bailed, the listener is gone;
                // don't signal it twice.
                if l.active
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    l.shutdown.notify_one();
                }
            }
            State::Closed => unreachable!(),
        }

        debug!("closed socket: inode={}", self.inode.number);
        Ok(0)
    }

    /// Target-visible local address.
    pub fn bind_addr(&self) -> SysOutcome<Option<SocketAddr>> {
        let Some(_r) = self.fd.try_ref() else {
            return Err(libc::EBADF);
        };
        self.inode.state().bind_addr()
    }

    /// Target-visible peer address.
    pub fn peer_addr(&self) -> SysOutcome<SocketAddr> {
        let Some(_r) = self.fd.try_ref() else {
            return Err(libc::EBADF);
        };
        self.inode.state().peer_addr()
    }

    /// Pending SO_ERROR value. Mirrors the kernel's clear-on-read: the
    /// latched errno is reported exactly once.
    pub fn so_error(&self) -> i32 {
        let Some(_r) = self.fd.try_ref() else {
            return libc::EBADF;
        };
        loop {
            let cur = self.inode.state();
            match &*cur {
                State::Passive { bind, errno: Some(errno) } => {
                    let errno = *errno;
                    let next = Arc::new(State::Passive { bind: bind.clone(), errno: None });
                    if self.inode.transition(&cur, next) {
                        return errno;
                    }
                    // lost the CAS; re-read and try again
                }
                _ => return 0,
            }
        }
    }
}

/// Close a parked bind socket. A racing path may have closed it already;
/// the one-shot closing bit decides who actually runs close(2).
fn close_parked(bind_fd: &Arc<Fd>) {
    if let Some(_r) = bind_fd.closing_ref() {
        if let Err(errno) = bind_fd.close_raw() {
            debug!("close temp bind socket: errno={}", errno);
        }
    }
}

/// Dial the real peer, from the parked bind address when there is one.
/// SO_REUSEADDR and SO_REUSEPORT let the dial share the parked reservation.
async fn dial_external(
    domain: Domain,
    bind_addr: Option<SocketAddr>,
    peer: SocketAddr,
) -> std::io::Result<TcpStream> {
    let sock = match domain {
        Domain::V4 => TcpSocket::new_v4()?,
        Domain::V6 => TcpSocket::new_v6()?,
    };
    sock.set_reuseaddr(true)?;
    sock.set_reuseport(true)?;
    if let Some(addr) = bind_addr {
        sock.bind(addr)?;
    }
    sock.connect(peer).await
}

/// A real loopback TCP listener bound to port 0 in the right family. The
/// target's kernel socket is connected here so the target sees an
/// indistinguishable established socket.
struct DummyListener {
    lis: TcpListener,
    addr: SocketAddr,
}

impl DummyListener {
    async fn new(domain: Domain) -> Result<DummyListener> {
        let lis = TcpListener::bind(SocketAddr::new(domain.loopback_ip(), 0)).await?;
        let addr = lis.local_addr()?;
        Ok(DummyListener { lis, addr })
    }
}

/// External listener for a listening socket: the parked bind address when
/// the target bound one, a fresh loopback ephemeral otherwise. A wildcard
/// v6 bind keeps the kernel's usual dual-stack behavior.
async fn external_listener(
    domain: Domain,
    bind_addr: Option<SocketAddr>,
    backlog: u32,
) -> std::io::Result<TcpListener> {
    let addr = bind_addr.unwrap_or_else(|| SocketAddr::new(domain.loopback_ip(), 0));
    let sock = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    sock.set_reuseaddr(true)?;
    sock.set_reuseport(true)?;
    sock.bind(addr)?;
    sock.listen(backlog)
}

/// Fresh TCP socket used only as a parking spot for an address bind.
/// SO_REUSEADDR and SO_REUSEPORT are set so the reservation can be shared
/// with the dial or listener that later takes it over.
fn temp_bind_socket(domain: Domain) -> Result<Arc<Fd>> {
    let raw = socket(
        domain.family(),
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )?;
    let fd = Fd::new(raw);
    if let Err(e) = setsockopt(raw, sockopt::ReuseAddr, &true) {
        return Err(e.into());
    }
    if let Err(e) = setsockopt(raw, sockopt::ReusePort, &true) {
        return Err(e.into());
    }
    Ok(fd)
}

/// Bind a descriptor to an ephemeral port, on a loopback interface address
/// when asked, and report the kernel-assigned address.
fn bind_ephemeral(domain: Domain, fd: &Arc<Fd>, loopback: bool) -> Result<SocketAddr> {
    let Some(_r) = fd.try_ref() else {
        return Err(nix::Error::EBADF.into());
    };

    let ip = if loopback {
        loopback_addr(domain).unwrap_or_else(|_| domain.unspecified_ip())
    } else {
        domain.unspecified_ip()
    };
    let requested = SocketAddr::new(ip, 0);
    bind(fd.raw(), &SockaddrStorage::from(requested))?;

    let assigned = nix::sys::socket::getsockname::<SockaddrStorage>(fd.raw())?;
    crate::state::storage_to_addr(&assigned).ok_or_else(|| {
        SocktapError::NetworkError(format!("unexpected sockaddr family binding {}", requested))
    })
}

lazy_static! {
    /// Loopback interface addresses by domain. The interface list is
    /// stable for the lifetime of the tracer, so enumerate once.
    static ref LOOPBACK_ADDRS: Mutex<HashMap<Domain, IpAddr>> = Mutex::new(HashMap::new());
}

/// Find a loopback interface address of the right family.
fn loopback_addr(domain: Domain) -> Result<IpAddr> {
    if let Some(ip) = LOOPBACK_ADDRS.lock().unwrap().get(&domain) {
        return Ok(*ip);
    }

    for ifaddr in nix::ifaddrs::getifaddrs()? {
        let Some(ss) = ifaddr.address else { continue };
        let ip = if let Some(sin) = ss.as_sockaddr_in() {
            if domain != Domain::V4 {
                continue;
            }
            IpAddr::V4(Ipv4Addr::from(sin.ip()))
        } else if let Some(sin6) = ss.as_sockaddr_in6() {
            if domain != Domain::V6 {
                continue;
            }
            IpAddr::V6(sin6.ip())
        } else {
            continue;
        };
        if ip.is_loopback() {
            LOOPBACK_ADDRS.lock().unwrap().insert(domain, ip);
            return Ok(ip);
        }
    }
    Err(SocktapError::NetworkError(format!(
        "no loopback interface address for domain {}",
        domain
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use socktap_common::EventSink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_sink() -> (EventSink, mpsc::Receiver<Event>) {
        EventSink::channel(64)
    }

    fn new_socket(domain: Domain) -> (Arc<Socket>, mpsc::Receiver<Event>) {
        let (sink, rx) = test_sink();
        let sock = Socket::create(sink, Event::new(), domain, SockFlag::empty()).unwrap();
        (sock, rx)
    }

    fn write_target(sock: &Arc<Socket>, data: &'static [u8]) {
        let raw = sock.fd.raw();
        let n = nix::unistd::write(raw, data).unwrap();
        assert_eq!(n, data.len());
    }

    async fn read_target(sock: &Arc<Socket>, len: usize) -> Vec<u8> {
        let raw = sock.fd.raw();
        task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let mut off = 0;
            while off < len {
                let n = nix::unistd::read(raw, &mut buf[off..]).unwrap();
                assert!(n > 0, "unexpected EOF from target socket");
                off += n;
            }
            buf
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_blocking_connect_round_trip() {
        let lis = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = lis.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = lis.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"world!").await.unwrap();
            buf
        });

        let (sock, _events) = new_socket(Domain::V4);
        assert_eq!(sock.connect(peer).await.unwrap(), Ok(0));
        assert_eq!(sock.inode.state().tag(), "connected");
        assert_eq!(sock.peer_addr(), Ok(peer));

        write_target(&sock, b"hello");
        assert_eq!(server.await.unwrap(), *b"hello");
        assert_eq!(read_target(&sock, 6).await, b"world!");

        assert_eq!(sock.close(), Ok(0));
        assert_eq!(sock.inode.state().tag(), "closed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connect_refused_latches_errno() {
        // grab a free port, then close it so nothing is listening there
        let refused = {
            let lis = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            lis.local_addr().unwrap()
        };

        let (sock, _events) = new_socket(Domain::V4);
        assert_eq!(sock.connect(refused).await.unwrap(), Err(libc::ECONNREFUSED));
        assert_eq!(sock.inode.state().tag(), "passive");

        // SO_ERROR reports the latched errno exactly once
        assert_eq!(sock.so_error(), libc::ECONNREFUSED);
        assert_eq!(sock.so_error(), 0);

        assert_eq!(sock.close(), Ok(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_nonblocking_connect_failure() {
        let refused = {
            let lis = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            lis.local_addr().unwrap()
        };

        let (sock, _events) = new_socket(Domain::V4);
        fcntl(sock.fd.raw(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).unwrap();

        let ret = sock.connect(refused).await.unwrap();
        assert!(
            ret == Ok(0) || ret == Err(libc::EINPROGRESS),
            "unexpected non-blocking connect result: {:?}",
            ret
        );

        // the dial outcome lands asynchronously
        for _ in 0..200 {
            if sock.inode.state().tag() == "passive" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(sock.inode.state().tag(), "passive");
        assert_eq!(sock.so_error(), libc::ECONNREFUSED);
        assert_eq!(sock.so_error(), 0);

        assert_eq!(sock.close(), Ok(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connect_states_reject() {
        let lis = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = lis.local_addr().unwrap();
        let accepter = tokio::spawn(async move { lis.accept().await });

        let (sock, _events) = new_socket(Domain::V4);
        assert_eq!(sock.connect(peer).await.unwrap(), Ok(0));
        assert_eq!(sock.connect(peer).await.unwrap(), Err(libc::EISCONN));
        let _ = accepter.await;
        sock.close().unwrap();
        assert_eq!(sock.close(), Err(libc::EBADF));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bind_getsockname() {
        let (sock, _events) = new_socket(Domain::V4);
        assert_eq!(sock.bind_addr(), Ok(None));

        let ret = sock.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(ret, Ok(0));

        let addr = sock.bind_addr().unwrap().unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(addr.port(), 0);

        // family mismatch
        let ret = sock.bind("[::1]:0".parse().unwrap()).unwrap();
        assert_eq!(ret, Err(libc::EINVAL));

        sock.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bind_conflict_latches_errno() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap();

        let (sock, _events) = new_socket(Domain::V4);
        let ret = sock.bind(taken).unwrap();
        assert_eq!(ret, Err(libc::EADDRINUSE));
        assert_eq!(sock.so_error(), libc::EADDRINUSE);
        sock.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_listen_accept_round_trip() {
        let (sock, _events) = new_socket(Domain::V4);
        sock.bind("127.0.0.1:0".parse().unwrap()).unwrap().unwrap();
        let addr = sock.bind_addr().unwrap().unwrap();

        assert_eq!(sock.listen(4).await.unwrap(), Ok(0));
        assert_eq!(sock.inode.state().tag(), "listening");
        // external listener reachable on the bound port
        assert_eq!(sock.bind_addr().unwrap().unwrap(), addr);

        let mut peer_conn = TcpStream::connect(addr).await.unwrap();

        let (child, reported) = sock.accept(SockFlag::empty()).await.unwrap().unwrap();
        assert!(reported.ip().is_loopback());
        assert_eq!(child.inode.state().tag(), "connected");

        peer_conn.write_all(b"ping").await.unwrap();
        assert_eq!(read_target(&child, 4).await, b"ping");

        write_target(&child, b"pong");
        let mut buf = [0u8; 4];
        peer_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        child.close().unwrap();
        sock.close().unwrap();
        assert_eq!(sock.inode.state().tag(), "closed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_listen_is_idempotent() {
        let (sock, _events) = new_socket(Domain::V4);
        sock.bind("127.0.0.1:0".parse().unwrap()).unwrap().unwrap();
        assert_eq!(sock.listen(4).await.unwrap(), Ok(0));
        assert_eq!(sock.listen(16).await.unwrap(), Ok(0));
        sock.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_alias_close_keeps_state() {
        let (sock, _events) = new_socket(Domain::V4);
        sock.bind("127.0.0.1:0".parse().unwrap()).unwrap().unwrap();

        let dup = fcntl(sock.fd.raw(), FcntlArg::F_DUPFD_CLOEXEC(3)).unwrap();
        let alias = Socket::adopt(
            sock.sink.clone(),
            Event::new(),
            Arc::clone(&sock.inode),
            Fd::new(dup),
        );

        assert_eq!(alias.close(), Ok(0));
        assert_eq!(sock.inode.state().tag(), "passive");
        assert!(sock.bind_addr().unwrap().is_some());

        assert_eq!(sock.close(), Ok(0));
        assert_eq!(sock.inode.state().tag(), "closed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connect_single_winner() {
        let lis = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = lis.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if lis.accept().await.is_err() {
                    break;
                }
            }
        });

        let (sock, _events) = new_socket(Domain::V4);
        let dup = fcntl(sock.fd.raw(), FcntlArg::F_DUPFD_CLOEXEC(3)).unwrap();
        let alias = Socket::adopt(
            sock.sink.clone(),
            Event::new(),
            Arc::clone(&sock.inode),
            Fd::new(dup),
        );

        let a = Arc::clone(&sock);
        let b = Arc::clone(&alias);
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.connect(peer).await.unwrap() }),
            tokio::spawn(async move { b.connect(peer).await.unwrap() }),
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        let ok = [ra, rb].iter().filter(|r| **r == Ok(0)).count();
        assert_eq!(ok, 1, "exactly one connect must win: {:?} {:?}", ra, rb);
        let loser = if ra == Ok(0) { rb } else { ra };
        assert!(
            matches!(loser, Err(e) if e == libc::ERESTART || e == libc::EISCONN || e == libc::EALREADY),
            "unexpected loser result: {:?}",
            loser
        );
        assert_eq!(sock.inode.state().tag(), "connected");

        alias.close().unwrap();
        sock.close().unwrap();
    }
}
