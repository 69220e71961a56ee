use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One structured trace record. A template is attached to every shadowed
/// socket at creation; the proxy clones it and stamps the per-connection
/// fields before emission.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Event {
    #[serde(flatten)]
    fields: BTreeMap<String, String>,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Write-only handle to the event channel. Sending never blocks the byte
/// pump: when the drain falls behind, records are dropped and counted
/// against the log instead.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSink { tx }, rx)
    }

    pub fn send(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("event sink full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event sink closed, dropping record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let mut ev = Event::new();
        ev.set("protocol", "tcp");
        ev.set("bytes_tx", 42.to_string());
        assert_eq!(ev.get("protocol"), Some("tcp"));
        assert_eq!(ev.get("bytes_tx"), Some("42"));
        assert_eq!(ev.get("missing"), None);
    }

    #[test]
    fn test_template_clone_is_independent() {
        let mut tmpl = Event::new();
        tmpl.set("protocol", "tcp");
        let mut ev = tmpl.clone();
        ev.set("bytes_tx", "7");
        assert_eq!(tmpl.get("bytes_tx"), None);
        assert_eq!(ev.get("protocol"), Some("tcp"));
    }

    #[test]
    fn test_serialize_flat() {
        let mut ev = Event::new();
        ev.set("b", "2");
        ev.set("a", "1");
        let json = serde_json::to_string(&ev).unwrap();
        assert_eq!(json, r#"{"a":"1","b":"2"}"#);
    }

    #[tokio::test]
    async fn test_sink_delivery() {
        let (sink, mut rx) = EventSink::channel(4);
        let mut ev = Event::new();
        ev.set("protocol", "tcp");
        sink.send(ev);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.get("protocol"), Some("tcp"));
    }

    #[test]
    fn test_sink_full_drops() {
        let (sink, rx) = EventSink::channel(1);
        sink.send(Event::new());
        sink.send(Event::new());
        drop(rx);
        // second send was dropped, nothing to assert beyond not panicking
    }
}
