//! Router event ring and the default message processor.
//!
//! Peers report router events as JSON requests:
//!
//! ```json
//! {"type": "router_event", "mbody": {"etype": 1, "ipaddress": "...",
//!   "macaddress": "...", "name": "...", "extra": "...", "tstamp": 0}}
//! ```
//!
//! The last [`EVENT_RING_SIZE`] events are kept; a control client pulls
//! them one at a time with [`EventRing::next_event`].

use super::MessageProcessor;
use crate::addr::NetworkAddrPair;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const EVENT_RING_SIZE: usize = 8;

/// One recorded router event. Field names on the wire follow the
/// existing consumers of `next_event`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "EType")]
    pub etype: i64,
    #[serde(rename = "EName")]
    pub name: String,
    #[serde(rename = "EIPAddress")]
    pub ip_address: String,
    #[serde(rename = "EMACAddress")]
    pub mac_address: String,
    #[serde(rename = "Extra")]
    pub extra: String,
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "Tstamp")]
    pub tstamp: i64,
}

/// Fixed-size ring; recording overwrites the oldest slot.
#[derive(Debug)]
pub struct EventRing {
    inner: Mutex<RingInner>,
}

#[derive(Debug)]
struct RingInner {
    slots: Vec<Option<Event>>,
    next: usize,
}

impl EventRing {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                slots: vec![None; EVENT_RING_SIZE],
                next: 0,
            }),
        }
    }

    pub fn record(&self, mut event: Event) {
        event.active = true;
        let mut inner = self.inner.lock();
        let at = inner.next;
        inner.slots[at] = Some(event);
        inner.next = (at + 1) % EVENT_RING_SIZE;
    }

    /// Oldest active event as JSON, marking it consumed. Empty string when
    /// nothing is pending.
    pub fn next_event(&self) -> String {
        let mut inner = self.inner.lock();
        let start = inner.next;
        let found = (0..EVENT_RING_SIZE)
            .map(|i| (start + i) % EVENT_RING_SIZE)
            .find(|&i| inner.slots[i].as_ref().is_some_and(|e| e.active));
        let Some(slot) = found else {
            return String::new();
        };
        let Some(event) = inner.slots[slot].as_mut() else {
            return String::new();
        };
        event.active = false;
        let snapshot = Event {
            active: true,
            ..event.clone()
        };
        drop(inner);

        match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize event");
                String::new()
            }
        }
    }

    pub fn active_len(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|e| e.as_ref().is_some_and(|e| e.active))
            .count()
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct Request {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Deserialize)]
struct RouterEventRequest {
    mbody: RouterEventBody,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RouterEventBody {
    etype: i64,
    ipaddress: String,
    macaddress: String,
    name: String,
    extra: String,
    tstamp: i64,
}

fn fail_status(error: impl std::fmt::Display) -> String {
    serde_json::json!({ "status": "fail", "error": error.to_string() }).to_string()
}

/// Default processor: records router events and answers everything
/// else with an empty reply.
#[derive(Debug, Clone)]
pub struct RouterEventProcessor {
    events: Arc<EventRing>,
}

impl RouterEventProcessor {
    pub fn new(events: Arc<EventRing>) -> Self {
        Self { events }
    }
}

impl MessageProcessor for RouterEventProcessor {
    fn process(&self, from: NetworkAddrPair, payload: &[u8]) -> String {
        let request: Request = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(from = %from, error = %e, "Malformed message request");
                return fail_status(e);
            }
        };

        match request.kind.as_str() {
            "router_event" => {
                let body = match serde_json::from_slice::<RouterEventRequest>(payload) {
                    Ok(request) => request.mbody,
                    Err(e) => return fail_status(e),
                };
                debug!(from = %from, etype = body.etype, name = %body.name, "Router event");
                self.events.record(Event {
                    etype: body.etype,
                    name: body.name,
                    ip_address: body.ipaddress,
                    mac_address: body.macaddress,
                    extra: body.extra,
                    active: true,
                    tstamp: body.tstamp,
                });
                String::new()
            }
            other => {
                debug!(from = %from, kind = other, "Unhandled message type");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from() -> NetworkAddrPair {
        NetworkAddrPair::new("10.1.0.2".parse().unwrap(), 1)
    }

    fn event(name: &str) -> Event {
        Event {
            etype: 1,
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_next_event_consumes_in_order() {
        let ring = EventRing::new();
        assert_eq!(ring.next_event(), "");

        ring.record(event("a"));
        ring.record(event("b"));
        assert_eq!(ring.active_len(), 2);

        let first: Event = serde_json::from_str(&ring.next_event()).unwrap();
        assert_eq!(first.name, "a");
        let second: Event = serde_json::from_str(&ring.next_event()).unwrap();
        assert_eq!(second.name, "b");
        assert_eq!(ring.next_event(), "");
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let ring = EventRing::new();
        for i in 0..EVENT_RING_SIZE + 2 {
            ring.record(event(&format!("e{}", i)));
        }
        assert_eq!(ring.active_len(), EVENT_RING_SIZE);
        let oldest: Event = serde_json::from_str(&ring.next_event()).unwrap();
        assert_eq!(oldest.name, "e2");
    }

    #[test]
    fn test_event_json_field_names() {
        let ring = EventRing::new();
        ring.record(Event {
            etype: 3,
            name: "laptop".into(),
            ip_address: "192.168.1.20".into(),
            mac_address: "aa:bb:cc:dd:ee:ff".into(),
            extra: "x".into(),
            active: false,
            tstamp: 1700000000,
        });
        let json: serde_json::Value = serde_json::from_str(&ring.next_event()).unwrap();
        assert_eq!(json["EType"], 3);
        assert_eq!(json["EName"], "laptop");
        assert_eq!(json["EIPAddress"], "192.168.1.20");
        assert_eq!(json["EMACAddress"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(json["Active"], true);
        assert_eq!(json["Tstamp"], 1700000000);
    }

    #[test]
    fn test_processor_records_router_events() {
        let ring = Arc::new(EventRing::new());
        let processor = RouterEventProcessor::new(ring.clone());

        let reply = processor.process(
            from(),
            br#"{"type":"router_event","mbody":{"etype":2,"name":"phone","ipaddress":"192.168.1.9"}}"#,
        );
        assert_eq!(reply, "");
        let recorded: Event = serde_json::from_str(&ring.next_event()).unwrap();
        assert_eq!(recorded.etype, 2);
        assert_eq!(recorded.name, "phone");
        assert_eq!(recorded.ip_address, "192.168.1.9");

        assert_eq!(processor.process(from(), br#"{"type":"get_clients"}"#), "");
        assert_eq!(ring.active_len(), 0);
    }

    #[test]
    fn test_processor_reports_parse_errors() {
        let processor = RouterEventProcessor::new(Arc::new(EventRing::new()));
        let reply: serde_json::Value =
            serde_json::from_str(&processor.process(from(), b"not json")).unwrap();
        assert_eq!(reply["status"], "fail");
        assert!(reply["error"].as_str().is_some_and(|e| !e.is_empty()));
    }
}
