use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use socktap_common::{normalize, Event, EventSink, Result};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::debug;

/// Bidirectional byte pump between the target-facing loopback connection
/// (`process`) and the real connection to the outside world (`external`),
/// instrumented through the event sink.
pub struct Proxy {
    tmpl: Event,
    sink: EventSink,
    begin: Instant,
    dialed: bool,
    /// One-shot token coordinating who closes the TCP pair: whichever of
    /// the pump and the final socket close loses the CAS does the closing.
    skip_close_tcp: AtomicBool,
    conns: Mutex<Option<(TcpStream, TcpStream)>>,
    process_local: SocketAddr,
    external_local: SocketAddr,
    external_peer: SocketAddr,
}

impl Proxy {
    pub fn new(
        tmpl: Event,
        sink: EventSink,
        process: TcpStream,
        external: TcpStream,
        dialed: bool,
        begin: Instant,
    ) -> Result<Arc<Proxy>> {
        let process_local = normalize(process.local_addr()?);
        let external_local = external.local_addr()?;
        let external_peer = external.peer_addr()?;
        Ok(Arc::new(Proxy {
            tmpl,
            sink,
            begin,
            dialed,
            skip_close_tcp: AtomicBool::new(false),
            conns: Mutex::new(Some((process, external))),
            process_local,
            external_local,
            external_peer,
        }))
    }

    /// Local address of the process-side connection; the accept dispatcher
    /// keys its rendezvous on this.
    pub fn process_local(&self) -> SocketAddr {
        self.process_local
    }

    /// Address the remote peer sees for this socket.
    pub fn external_local(&self) -> SocketAddr {
        self.external_local
    }

    pub fn external_peer(&self) -> SocketAddr {
        self.external_peer
    }

    /// Pump bytes until EOF or error on either side, then emit the event
    /// record. The TCP pair is closed by exactly one of this function and
    /// [`Proxy::close_tcp`], decided by the `skip_close_tcp` CAS.
    pub async fn start(self: Arc<Self>) {
        let taken = self.conns.lock().unwrap().take();
        let Some((mut process, mut external)) = taken else {
            debug!("proxy pair already torn down, nothing to pump");
            return;
        };

        let mut ev = self.tmpl.clone();
        ev.set("direction", if self.dialed { "outbound" } else { "inbound" });
        ev.set("local_addr", self.external_local.to_string());
        ev.set("remote_addr", self.external_peer.to_string());

        match copy_bidirectional(&mut process, &mut external).await {
            Ok((bytes_tx, bytes_rx)) => {
                ev.set("bytes_tx", bytes_tx.to_string());
                ev.set("bytes_rx", bytes_rx.to_string());
            }
            Err(e) => {
                ev.set("error", e.to_string());
            }
        }
        ev.set("duration_us", self.begin.elapsed().as_micros().to_string());
        self.sink.send(ev);

        if self
            .skip_close_tcp
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // The target still owns its descriptor; keep the pair open
            // until its close(2) arrives.
            *self.conns.lock().unwrap() = Some((process, external));
        }
        // Otherwise close() already flagged; dropping both ends here
        // finishes the teardown.
    }

    /// Close both TCP sides exactly once, coordinated with [`Proxy::start`].
    pub fn close_tcp(&self) {
        if self
            .skip_close_tcp
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // The pump is still draining; it closes both sides when done.
            return;
        }
        self.conns.lock().unwrap().take();
    }

    /// Tear down a pair that was never published (error paths before the
    /// Connected CAS); no close coordination is needed yet.
    pub fn discard(&self) {
        self.conns.lock().unwrap().take();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One connected loopback stream pair.
    async fn stream_pair() -> (TcpStream, TcpStream) {
        let lis = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = lis.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = lis.accept().await.unwrap();
        (client, server)
    }

    /// A proxy over two loopback pairs, plus the far ends of each pair.
    pub(crate) async fn loopback_proxy() -> (Arc<Proxy>, (TcpStream, TcpStream)) {
        let (process, process_far) = stream_pair().await;
        let (external, external_far) = stream_pair().await;
        let (sink, _rx) = EventSink::channel(8);
        let proxy = Proxy::new(Event::new(), sink, process, external, true, Instant::now()).unwrap();
        (proxy, (process_far, external_far))
    }

    #[tokio::test]
    async fn test_pump_round_trip() {
        let (process, mut process_far) = stream_pair().await;
        let (external, mut external_far) = stream_pair().await;
        let (sink, mut events) = EventSink::channel(8);
        let proxy =
            Proxy::new(Event::new(), sink, process, external, true, Instant::now()).unwrap();

        let pump = tokio::spawn(Arc::clone(&proxy).start());

        process_far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        external_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        external_far.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        process_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        // EOF both directions ends the pump
        drop(process_far);
        drop(external_far);
        pump.await.unwrap();

        let ev = events.recv().await.unwrap();
        assert_eq!(ev.get("direction"), Some("outbound"));
        assert_eq!(ev.get("bytes_tx"), Some("5"));
        assert_eq!(ev.get("bytes_rx"), Some("6"));
        assert!(ev.get("duration_us").is_some());
    }

    #[tokio::test]
    async fn test_close_after_pump_drops_pair() {
        let (proxy, (process_far, external_far)) = loopback_proxy().await;
        // close first: pump sees the flag and drops the pair on completion
        proxy.close_tcp();
        drop(process_far);
        drop(external_far);
        Arc::clone(&proxy).start().await;
        assert!(proxy.conns.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pump_then_close() {
        let (proxy, (process_far, external_far)) = loopback_proxy().await;
        drop(process_far);
        drop(external_far);
        Arc::clone(&proxy).start().await;
        // the pump kept the pair for the eventual close(2)
        assert!(proxy.conns.lock().unwrap().is_some());
        proxy.close_tcp();
        assert!(proxy.conns.lock().unwrap().is_none());
    }
}
