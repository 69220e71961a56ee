use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::sys::socket::{getsockname, SockaddrStorage};
use socktap_common::SysOutcome;
use tokio::sync::{mpsc, Notify};

use crate::fd::Fd;
use crate::proxy::Proxy;

/// Shadow of a socket's logical status. Immutable by construction: a writer
/// builds a fresh value and races a single CAS on the owning inode, so the
/// transition diagram is auditable from the call sites alone.
pub enum State {
    /// Initial state. May park a bind on a throwaway real socket and may
    /// hold a latched errno from a failed asynchronous dial for a later
    /// getsockopt(SO_ERROR).
    Passive {
        bind: Option<Arc<Fd>>,
        errno: Option<i32>,
    },
    /// The external dial is in flight; the parked bind keeps getsockname
    /// stable until the outcome is known.
    Connecting { bind: Arc<Fd>, peer: SocketAddr },
    /// A proxy pair is live.
    Connected { proxy: Arc<Proxy> },
    /// An external listener is accepting.
    Listening(Listening),
    /// Terminal.
    Closed,
}

pub struct Listening {
    /// Cleared exactly once, by whichever of the accept loop and the final
    /// close gets there first.
    pub active: AtomicBool,
    /// External listener address, as the remote world sees it.
    pub local: SocketAddr,
    /// Wakes the accept loop so it drops the listener.
    pub shutdown: Arc<Notify>,
    backlog: DashMap<SocketAddr, Rendezvous>,
}

/// Per-peer-address slot pairing a dispatched proxy with the accept(2)
/// caller. Load-or-store semantics: either side may arrive first; the
/// second to arrive removes the slot.
struct Rendezvous {
    tx: mpsc::Sender<Arc<Proxy>>,
    rx: Mutex<Option<mpsc::Receiver<Arc<Proxy>>>>,
}

impl Rendezvous {
    fn new() -> Rendezvous {
        let (tx, rx) = mpsc::channel(1);
        Rendezvous {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl Listening {
    pub fn new(local: SocketAddr) -> Listening {
        Listening {
            active: AtomicBool::new(true),
            local,
            shutdown: Arc::new(Notify::new()),
            backlog: DashMap::new(),
        }
    }

    /// Dispatcher side of the rendezvous for the given process-side local
    /// address. The channel holds one slot, so the send never waits.
    pub fn sender_for(&self, addr: SocketAddr) -> mpsc::Sender<Arc<Proxy>> {
        match self.backlog.entry(addr) {
            Entry::Occupied(slot) => {
                let r = slot.remove();
                r.tx.clone()
            }
            Entry::Vacant(slot) => {
                let r = Rendezvous::new();
                let tx = r.tx.clone();
                slot.insert(r);
                tx
            }
        }
    }

    /// Accepter side of the rendezvous.
    pub fn receiver_for(&self, addr: SocketAddr) -> Option<mpsc::Receiver<Arc<Proxy>>> {
        match self.backlog.entry(addr) {
            Entry::Occupied(slot) => {
                let r = slot.remove();
                let rx = r.rx.lock().unwrap().take();
                rx
            }
            Entry::Vacant(slot) => {
                let r = Rendezvous::new();
                let rx = r.rx.lock().unwrap().take();
                slot.insert(r);
                rx
            }
        }
    }
}

impl State {
    pub fn tag(&self) -> &'static str {
        match self {
            State::Passive { .. } => "passive",
            State::Connecting { .. } => "connecting",
            State::Connected { .. } => "connected",
            State::Listening(_) => "listening",
            State::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, State::Closed)
    }

    /// Address the remote world sees for this socket, if it has one yet.
    pub fn bind_addr(&self) -> SysOutcome<Option<SocketAddr>> {
        match self {
            State::Passive { bind: None, .. } => Ok(None),
            State::Passive { bind: Some(bind), .. } => sockname(bind).map(Some),
            State::Connecting { bind, .. } => sockname(bind).map(Some),
            State::Connected { proxy } => Ok(Some(proxy.external_local())),
            State::Listening(l) => Ok(Some(l.local)),
            State::Closed => Err(libc::EBADF),
        }
    }

    pub fn peer_addr(&self) -> SysOutcome<SocketAddr> {
        match self {
            State::Connected { proxy } => Ok(proxy.external_peer()),
            State::Closed => Err(libc::EBADF),
            _ => Err(libc::ENOTCONN),
        }
    }
}

/// getsockname on a parked bind socket, as a target-visible outcome.
fn sockname(fd: &Arc<Fd>) -> SysOutcome<SocketAddr> {
    let Some(_r) = fd.try_ref() else {
        return Err(libc::EBADF);
    };
    match getsockname::<SockaddrStorage>(fd.raw()) {
        Ok(ss) => storage_to_addr(&ss).ok_or(libc::EAFNOSUPPORT),
        Err(e) => Err(e as i32),
    }
}

pub(crate) fn storage_to_addr(ss: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = ss.as_sockaddr_in() {
        return Some(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(sin.ip()),
            sin.port(),
        )));
    }
    if let Some(sin6) = ss.as_sockaddr_in6() {
        return Some(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_round_trip() {
        for text in ["93.184.216.34:80", "[2001:db8::2]:443"] {
            let addr: SocketAddr = text.parse().unwrap();
            let ss = SockaddrStorage::from(addr);
            assert_eq!(storage_to_addr(&ss), Some(addr));
        }
    }

    #[test]
    fn test_peer_addr_by_state() {
        let passive = State::Passive { bind: None, errno: None };
        assert_eq!(passive.peer_addr(), Err(libc::ENOTCONN));
        assert_eq!(State::Closed.peer_addr(), Err(libc::EBADF));
        assert_eq!(State::Closed.bind_addr(), Err(libc::EBADF));
        assert_eq!(passive.bind_addr(), Ok(None));
    }

    #[tokio::test]
    async fn test_rendezvous_dispatcher_first() {
        let l = Listening::new("127.0.0.1:1".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let tx = l.sender_for(addr);
        let (proxy, _streams) = crate::proxy::tests::loopback_proxy().await;
        tx.try_send(proxy).unwrap();

        let mut rx = l.receiver_for(addr).unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_rendezvous_accepter_first() {
        let l = Listening::new("127.0.0.1:1".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        let mut rx = l.receiver_for(addr).unwrap();
        let tx = l.sender_for(addr);
        let (proxy, _streams) = crate::proxy::tests::loopback_proxy().await;
        tx.try_send(proxy).unwrap();
        assert!(rx.recv().await.is_some());
    }
}
