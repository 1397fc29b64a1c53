//! Cryptographic session for one tunnel.
//!
//! A `ConnectionState` starts life holding an in-progress Noise IX
//! handshake. Once the handshake completes it holds one transport cipher
//! per direction, the send counter and the receive replay window.
//!
//! ## Framing
//!
//! Every encrypted packet is `header || AEAD(payload)`. The header's
//! message counter is the AEAD nonce and the encoded header is the AEAD
//! additional data, so tampering with any header field fails
//! authentication. Stage 1 and stage 2 of the handshake use counters 1 and
//! 2; transport packets start at 3.
//!
//! ## Readiness
//!
//! Until `ready` flips, outbound packets are parked in the queue. The flip
//! and the drain happen under the queue lock, and enqueuers re-check
//! `ready` under that lock, so no packet can be parked after the drain.

use crate::cert::{CertState, Certificate};
use crate::header::{Header, MessageType, HANDSHAKE_STAGE2_COUNTER, HEADER_LEN};
use crate::noise::{CipherState, HandshakeState, NoiseError, ReplayWindow};
use parking_lot::Mutex;
use secp256k1::PublicKey;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Packets parked beyond this many are dropped.
pub const MAX_CACHED_PACKETS: usize = 100;

/// Errors from session encrypt/decrypt.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("noise error: {0}")]
    Noise(#[from] NoiseError),

    #[error("session keys not established")]
    NoKeys,

    #[error("handshake state already consumed")]
    HandshakeConsumed,

    #[error("message counter exhausted, session must be re-keyed")]
    CounterExhausted,

    #[error("counter {0} replayed or outside the window")]
    Replay(u64),

    #[error("packet too short: {0} bytes")]
    TooShort(usize),
}

/// A packet parked while the session is not ready.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedPacket {
    pub msg_type: MessageType,
    pub subtype: u8,
    pub payload: Vec<u8>,
}

struct SessionKeys {
    send: CipherState,
    recv: CipherState,
}

/// Per-tunnel cryptographic state.
pub struct ConnectionState {
    initiator: bool,
    cert_state: Arc<CertState>,
    handshake: Mutex<Option<HandshakeState>>,
    keys: OnceLock<SessionKeys>,
    peer_cert: OnceLock<Certificate>,
    message_counter: AtomicU64,
    window: Mutex<ReplayWindow>,
    ready: AtomicBool,
    queue: Mutex<Vec<CachedPacket>>,
}

impl ConnectionState {
    pub fn new(cert_state: Arc<CertState>, initiator: bool) -> Self {
        let keypair = cert_state.keypair;
        let handshake = if initiator {
            HandshakeState::new_initiator(keypair)
        } else {
            HandshakeState::new_responder(keypair)
        };

        Self {
            initiator,
            cert_state,
            handshake: Mutex::new(Some(handshake)),
            keys: OnceLock::new(),
            peer_cert: OnceLock::new(),
            message_counter: AtomicU64::new(HANDSHAKE_STAGE2_COUNTER),
            window: Mutex::new(ReplayWindow::new()),
            ready: AtomicBool::new(false),
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn cert_state(&self) -> &Arc<CertState> {
        &self.cert_state
    }

    // === Handshake ===

    fn with_handshake<T>(
        &self,
        f: impl FnOnce(&mut HandshakeState) -> Result<T, NoiseError>,
    ) -> Result<T, ConnectionError> {
        let mut guard = self.handshake.lock();
        let hs = guard.as_mut().ok_or(ConnectionError::HandshakeConsumed)?;
        Ok(f(hs)?)
    }

    /// Build the Noise part of the stage 1 packet.
    pub fn write_stage1(&self, payload: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.with_handshake(|hs| hs.write_message_1(payload))
    }

    /// Consume a stage 1 message, returning the initiator's payload.
    pub fn read_stage1(&self, message: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.with_handshake(|hs| hs.read_message_1(message))
    }

    /// Build the Noise part of the stage 2 packet.
    pub fn write_stage2(&self, payload: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.with_handshake(|hs| hs.write_message_2(payload))
    }

    /// Consume a stage 2 message, returning the responder's payload.
    pub fn read_stage2(&self, message: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.with_handshake(|hs| hs.read_message_2(message))
    }

    /// Static key the peer presented, once their message has been read.
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.handshake
            .lock()
            .as_ref()
            .and_then(|hs| hs.remote_static().copied())
    }

    /// Finish the handshake: derive transport keys and pin the peer's
    /// certificate. The handshake state is consumed.
    pub fn establish(&self, peer_cert: Certificate) -> Result<(), ConnectionError> {
        let hs = self
            .handshake
            .lock()
            .take()
            .ok_or(ConnectionError::HandshakeConsumed)?;
        let (send, recv, _remote) = hs.into_ciphers()?;
        let _ = self.keys.set(SessionKeys { send, recv });
        let _ = self.peer_cert.set(peer_cert);
        Ok(())
    }

    pub fn has_keys(&self) -> bool {
        self.keys.get().is_some()
    }

    pub fn peer_cert(&self) -> Option<&Certificate> {
        self.peer_cert.get()
    }

    // === Counter ===

    /// Reserve the next packet counter. Never hands out a value twice.
    pub fn next_counter(&self) -> Result<u64, ConnectionError> {
        self.message_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_add(1))
            .map(|prev| prev + 1)
            .map_err(|_| ConnectionError::CounterExhausted)
    }

    /// Last counter handed out.
    pub fn message_counter(&self) -> u64 {
        self.message_counter.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_message_counter(&self, value: u64) {
        self.message_counter.store(value, Ordering::Release);
    }

    // === Transport ===

    /// Encrypt `payload` under a fresh counter. The counter field of
    /// `header` is overwritten; the full packet is returned.
    pub fn encrypt(&self, mut header: Header, payload: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let keys = self.keys.get().ok_or(ConnectionError::NoKeys)?;
        let counter = self.next_counter()?;
        header.message_counter = counter;

        let aad = header.encode();
        let ciphertext = keys.send.seal(counter, &aad, payload)?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(&aad);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Authenticate and decrypt a full packet whose header was already
    /// parsed. Replays are rejected before any crypto runs and the window
    /// only advances for packets that authenticate.
    pub fn decrypt(&self, packet: &[u8], header: &Header) -> Result<Vec<u8>, ConnectionError> {
        if packet.len() < HEADER_LEN {
            return Err(ConnectionError::TooShort(packet.len()));
        }
        let keys = self.keys.get().ok_or(ConnectionError::NoKeys)?;
        let counter = header.message_counter;

        if !self.window.lock().check(counter) {
            return Err(ConnectionError::Replay(counter));
        }

        let plaintext = keys
            .recv
            .open(counter, &packet[..HEADER_LEN], &packet[HEADER_LEN..])?;

        if !self.window.lock().accept(counter) {
            return Err(ConnectionError::Replay(counter));
        }
        Ok(plaintext)
    }

    // === Readiness and queue ===

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Park `packet` unless the session is ready, in which case it is
    /// handed back for immediate sending.
    pub fn queue_if_not_ready(&self, packet: CachedPacket) -> Option<CachedPacket> {
        if self.is_ready() {
            return Some(packet);
        }
        let mut queue = self.queue.lock();
        if self.is_ready() {
            return Some(packet);
        }
        if queue.len() < MAX_CACHED_PACKETS {
            queue.push(packet);
        }
        None
    }

    /// Flip to ready and take everything parked so far.
    pub fn mark_ready(&self) -> Vec<CachedPacket> {
        let mut queue = self.queue.lock();
        self.ready.store(true, Ordering::Release);
        std::mem::take(&mut *queue)
    }

    /// Take the parked packets without changing readiness.
    pub fn take_queued(&self) -> Vec<CachedPacket> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Park packets moved over from another session.
    pub fn requeue(&self, packets: Vec<CachedPacket>) {
        let mut queue = self.queue.lock();
        let room = MAX_CACHED_PACKETS.saturating_sub(queue.len());
        queue.extend(packets.into_iter().take(room));
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("initiator", &self.initiator)
            .field("ready", &self.is_ready())
            .field("has_keys", &self.has_keys())
            .field("message_counter", &self.message_counter())
            .finish()
    }
}
