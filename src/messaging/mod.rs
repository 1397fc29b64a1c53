//! Reliable request/response messaging over established tunnels.
//!
//! Each peer gets a [`MessageManager`] with [`MAX_MESSAGES_PER_IP`] slots.
//! A request occupies one slot for its whole life: it is sent, retried on
//! ACK timeout up to the configured number of attempts, and completes when
//! the peer's ACK for that slot arrives carrying the reply body. ACKs are
//! not themselves acknowledged.
//!
//! Inbound requests are handed to a [`MessageProcessor`]; its reply string
//! is returned in the ACK.

mod events;
mod header;

pub use events::{Event, EventRing, RouterEventProcessor, EVENT_RING_SIZE};
pub use header::{checksum, MessageHeader, FLAG_ACK, MESSAGE_HEADER_LEN, MESSAGE_VERSION};

use crate::addr::NetworkAddrPair;
use crate::config::MessagingConfig;
use crate::header::{MessageType, SUBTYPE_NON_TUN_ACK, SUBTYPE_NON_TUN_MAIN};
use crate::transport::EncWriter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// In-flight requests per peer.
pub const MAX_MESSAGES_PER_IP: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessagingError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("no tunnel ready to {0}, handshake started")]
    NotReady(NetworkAddrPair),

    #[error("all {MAX_MESSAGES_PER_IP} message slots to {0} are busy")]
    Busy(NetworkAddrPair),

    #[error("no ack from {pair} after {attempts} attempts")]
    Timeout { pair: NetworkAddrPair, attempts: u32 },

    #[error("message to {0} was cancelled")]
    Cancelled(NetworkAddrPair),
}

/// Turns an inbound request body into the reply body.
pub trait MessageProcessor: Send + Sync {
    fn process(&self, from: NetworkAddrPair, payload: &[u8]) -> String;
}

#[derive(Default)]
struct Slot {
    busy: bool,
    waiter: Option<oneshot::Sender<Vec<u8>>>,
}

/// Slot table for one peer.
pub struct MessageManager {
    slots: [Slot; MAX_MESSAGES_PER_IP],
}

impl MessageManager {
    fn new() -> Self {
        Self {
            slots: Default::default(),
        }
    }

    fn acquire(&mut self) -> Option<u32> {
        let index = self.slots.iter().position(|s| !s.busy)?;
        self.slots[index].busy = true;
        Some(index as u32)
    }

    fn arm(&mut self, seq: u32) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.slots[seq as usize].waiter = Some(tx);
        rx
    }

    fn release(&mut self, seq: u32) {
        self.slots[seq as usize] = Slot::default();
    }

    fn complete(&mut self, seq: u32, reply: Vec<u8>) -> bool {
        match self.slots[seq as usize].waiter.take() {
            Some(waiter) => waiter.send(reply).is_ok(),
            None => false,
        }
    }

    fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.busy).count()
    }
}

/// Messaging endpoint shared by every tunnel of the engine.
pub struct Messaging {
    ack_timeout: Duration,
    max_attempts: u32,
    managers: Mutex<HashMap<NetworkAddrPair, MessageManager>>,
    processor: Arc<dyn MessageProcessor>,
    events: Arc<EventRing>,
}

/// Frees the slot when the request finishes or its future is dropped.
struct SlotGuard<'a> {
    messaging: &'a Messaging,
    pair: NetworkAddrPair,
    seq: u32,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut managers = self.messaging.managers.lock();
        if let Some(manager) = managers.get_mut(&self.pair) {
            manager.release(self.seq);
            if manager.in_flight() == 0 {
                managers.remove(&self.pair);
            }
        }
    }
}

impl Messaging {
    /// Messaging with the router event processor.
    pub fn new(config: &MessagingConfig) -> Self {
        let events = Arc::new(EventRing::new());
        let processor = Arc::new(RouterEventProcessor::new(events.clone()));
        Self::with_processor(config, processor, events)
    }

    pub fn with_processor(
        config: &MessagingConfig,
        processor: Arc<dyn MessageProcessor>,
        events: Arc<EventRing>,
    ) -> Self {
        Self {
            ack_timeout: Duration::from_secs(config.ack_timeout_secs),
            max_attempts: config.max_attempts.max(1),
            managers: Mutex::new(HashMap::new()),
            processor,
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventRing> {
        &self.events
    }

    /// Requests currently waiting for an ACK from `pair`.
    pub fn in_flight(&self, pair: NetworkAddrPair) -> usize {
        self.managers
            .lock()
            .get(&pair)
            .map(MessageManager::in_flight)
            .unwrap_or(0)
    }

    /// Send `payload` to `pair` and wait for the reply body. The caller
    /// checks that a tunnel is ready first.
    pub async fn send(
        &self,
        enc: &dyn EncWriter,
        pair: NetworkAddrPair,
        payload: &[u8],
    ) -> Result<Vec<u8>, MessagingError> {
        let seq = self
            .managers
            .lock()
            .entry(pair)
            .or_insert_with(MessageManager::new)
            .acquire()
            .ok_or(MessagingError::Busy(pair))?;
        let _guard = SlotGuard {
            messaging: self,
            pair,
            seq,
        };

        let frame = MessageHeader::request(seq, payload).encode_with(payload);
        for attempt in 1..=self.max_attempts {
            let rx = match self.managers.lock().get_mut(&pair) {
                Some(manager) => manager.arm(seq),
                None => return Err(MessagingError::Cancelled(pair)),
            };
            enc.send_message_to_vpn_addr(MessageType::NonTunMessage, SUBTYPE_NON_TUN_MAIN, pair, &frame);
            trace!(to = %pair, seq, attempt, "Message sent");

            match tokio::time::timeout(self.ack_timeout, rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => return Err(MessagingError::Cancelled(pair)),
                Err(_) => debug!(to = %pair, seq, attempt, "Message ack timed out"),
            }
        }

        Err(MessagingError::Timeout {
            pair,
            attempts: self.max_attempts,
        })
    }

    /// Handle a decrypted NonTunMessage from `from`.
    pub fn handle_inbound(&self, enc: &dyn EncWriter, from: NetworkAddrPair, payload: &[u8]) {
        let (header, body) = match MessageHeader::decode(payload) {
            Ok(parts) => parts,
            Err(e) => {
                debug!(from = %from, error = %e, "Malformed message");
                return;
            }
        };
        if !header.verify(body) {
            debug!(from = %from, seq = header.seq, "Message checksum mismatch, dropping");
            return;
        }

        if header.is_ack() {
            if header.ack as usize >= MAX_MESSAGES_PER_IP {
                debug!(from = %from, ack = header.ack, "Message ack out of range, dropping");
                return;
            }
            let delivered = self
                .managers
                .lock()
                .get_mut(&from)
                .is_some_and(|m| m.complete(header.ack, body.to_vec()));
            if !delivered {
                trace!(from = %from, ack = header.ack, "Late or duplicate message ack");
            }
            return;
        }

        if header.seq as usize >= MAX_MESSAGES_PER_IP {
            debug!(from = %from, seq = header.seq, "Message seq out of range, dropping");
            return;
        }
        let reply = self.processor.process(from, body);
        let ack = MessageHeader::ack(header.seq, reply.as_bytes()).encode_with(reply.as_bytes());
        enc.send_message_to_vpn_addr(MessageType::NonTunMessage, SUBTYPE_NON_TUN_ACK, from, &ack);
    }

    /// Fail every outstanding request to `pair`.
    pub fn cancel(&self, pair: NetworkAddrPair) {
        if let Some(manager) = self.managers.lock().get_mut(&pair) {
            for slot in manager.slots.iter_mut() {
                slot.waiter.take();
            }
        }
    }
}

impl std::fmt::Debug for Messaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messaging")
            .field("ack_timeout", &self.ack_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("peers", &self.managers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingEnc;

    struct Echo;

    impl MessageProcessor for Echo {
        fn process(&self, _from: NetworkAddrPair, payload: &[u8]) -> String {
            format!("echo:{}", String::from_utf8_lossy(payload))
        }
    }

    fn pair() -> NetworkAddrPair {
        NetworkAddrPair::new("10.1.0.2".parse().unwrap(), 1)
    }

    fn messaging() -> Arc<Messaging> {
        Arc::new(Messaging::with_processor(
            &MessagingConfig::default(),
            Arc::new(Echo),
            Arc::new(EventRing::new()),
        ))
    }

    fn ack_frame(seq: u32, body: &[u8]) -> Vec<u8> {
        MessageHeader::ack(seq, body).encode_with(body)
    }

    #[test]
    fn test_request_is_answered_with_ack() {
        let m = messaging();
        let enc = RecordingEnc::default();
        let request = MessageHeader::request(4, b"ping").encode_with(b"ping");

        m.handle_inbound(&enc, pair(), &request);

        let sent = enc.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subtype, SUBTYPE_NON_TUN_ACK);
        let (header, body) = MessageHeader::decode(&sent[0].payload).unwrap();
        assert!(header.is_ack());
        assert_eq!(header.ack, 4);
        assert_eq!(body, b"echo:ping");
        assert!(header.verify(body));
    }

    #[test]
    fn test_bad_frames_are_dropped() {
        let m = messaging();
        let enc = RecordingEnc::default();

        let mut corrupt = MessageHeader::request(1, b"ping").encode_with(b"ping");
        corrupt[MESSAGE_HEADER_LEN] ^= 0xff;
        m.handle_inbound(&enc, pair(), &corrupt);

        let out_of_range = MessageHeader::request(MAX_MESSAGES_PER_IP as u32, b"x").encode_with(b"x");
        m.handle_inbound(&enc, pair(), &out_of_range);

        m.handle_inbound(&enc, pair(), b"short");
        // ACKs are never acknowledged.
        m.handle_inbound(&enc, pair(), &ack_frame(0, b""));

        assert!(enc.take_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_completes_on_ack() {
        let m = messaging();
        let enc = Arc::new(RecordingEnc::default());

        let task = {
            let (m, enc) = (m.clone(), enc.clone());
            tokio::spawn(async move { m.send(enc.as_ref(), pair(), b"hello").await })
        };
        tokio::task::yield_now().await;

        let sent = enc.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MessageType::NonTunMessage);
        assert_eq!(sent[0].subtype, SUBTYPE_NON_TUN_MAIN);
        let (header, body) = MessageHeader::decode(&sent[0].payload).unwrap();
        assert_eq!((header.seq, header.ack), (0, 0));
        assert_eq!(body, b"hello");
        assert_eq!(m.in_flight(pair()), 1);

        m.handle_inbound(enc.as_ref(), pair(), &ack_frame(0, b"world"));
        assert_eq!(task.await.unwrap(), Ok(b"world".to_vec()));
        assert_eq!(m.in_flight(pair()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_then_times_out() {
        let m = messaging();
        let enc = Arc::new(RecordingEnc::default());

        let started = tokio::time::Instant::now();
        let result = m.send(enc.as_ref(), pair(), b"hello").await;
        assert_eq!(
            result,
            Err(MessagingError::Timeout {
                pair: pair(),
                attempts: 3
            })
        );
        assert_eq!(enc.take_messages().len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(24));
        assert_eq!(m.in_flight(pair()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_bounded() {
        let m = messaging();
        let enc = Arc::new(RecordingEnc::default());

        let mut tasks = Vec::new();
        for _ in 0..MAX_MESSAGES_PER_IP {
            let (m, enc) = (m.clone(), enc.clone());
            tasks.push(tokio::spawn(async move {
                m.send(enc.as_ref(), pair(), b"x").await
            }));
        }
        tokio::task::yield_now().await;
        assert_eq!(m.in_flight(pair()), MAX_MESSAGES_PER_IP);

        assert_eq!(
            m.send(enc.as_ref(), pair(), b"x").await,
            Err(MessagingError::Busy(pair()))
        );

        // Every slot has a distinct seq.
        let mut seqs: Vec<u32> = enc
            .take_messages()
            .iter()
            .map(|s| MessageHeader::decode(&s.payload).unwrap().0.seq)
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..MAX_MESSAGES_PER_IP as u32).collect::<Vec<_>>());

        for seq in 0..MAX_MESSAGES_PER_IP as u32 {
            m.handle_inbound(enc.as_ref(), pair(), &ack_frame(seq, b"ok"));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(b"ok".to_vec()));
        }
        assert_eq!(m.in_flight(pair()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_waiters() {
        let m = messaging();
        let enc = Arc::new(RecordingEnc::default());

        let task = {
            let (m, enc) = (m.clone(), enc.clone());
            tokio::spawn(async move { m.send(enc.as_ref(), pair(), b"x").await })
        };
        tokio::task::yield_now().await;
        m.cancel(pair());
        assert_eq!(task.await.unwrap(), Err(MessagingError::Cancelled(pair())));
    }
}
