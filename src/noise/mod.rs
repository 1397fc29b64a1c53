//! Noise IX Protocol for Tunnel Establishment
//!
//! Implements the Noise Protocol Framework IX pattern using secp256k1.
//! Neither side knows the other's static key in advance; both statics are
//! exchanged during the handshake and checked against the certificate
//! provider afterwards.
//!
//! ## Handshake Pattern
//!
//! ```text
//!   -> e, s                  (initiator ephemeral + static, in the clear)
//!   <- e, ee, se, s, es      (responder ephemeral + encrypted static)
//! ```
//!
//! Each message carries a payload. The stage 1 payload travels in the
//! clear because no key has been mixed yet; the stage 2 payload is
//! encrypted under the handshake chaining key.
//!
//! After the handshake both parties derive one cipher per direction. The
//! transport phase does not use the internal nonce: the packet counter
//! from the wire header is the nonce and the header itself is the AAD.

mod handshake;
mod replay;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use std::fmt;
use thiserror::Error;

pub use handshake::HandshakeState;
pub use replay::ReplayWindow;

/// Protocol name for Noise IX with secp256k1.
pub(crate) const PROTOCOL_NAME: &[u8] = b"Noise_IX_secp256k1_ChaChaPoly_SHA256";

/// Maximum message size for noise transport messages.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Size of the AEAD tag.
pub const TAG_SIZE: usize = 16;

/// Size of a public key (compressed secp256k1).
pub const PUBKEY_SIZE: usize = 33;

/// Minimum size of handshake message 1: ephemeral (33) + static (33).
pub const HANDSHAKE_MSG1_MIN_SIZE: usize = PUBKEY_SIZE + PUBKEY_SIZE;

/// Minimum size of handshake message 2: ephemeral (33) + encrypted static
/// (33 + 16 tag) + payload tag (16).
pub const HANDSHAKE_MSG2_MIN_SIZE: usize = PUBKEY_SIZE + PUBKEY_SIZE + TAG_SIZE + TAG_SIZE;

/// Replay window size in packets.
pub const REPLAY_WINDOW_SIZE: usize = 1024;

/// Errors from Noise protocol operations.
#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("handshake not complete")]
    HandshakeNotComplete,

    #[error("wrong handshake state: expected {expected}, got {got}")]
    WrongState { expected: String, got: String },

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("nonce overflow")]
    NonceOverflow,

    #[error("replay detected: counter {0} already seen or too old")]
    ReplayDetected(u64),

    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] secp256k1::Error),
}

/// Role in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    /// We initiated the connection.
    Initiator,
    /// They initiated the connection.
    Responder,
}

impl fmt::Display for HandshakeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeRole::Initiator => write!(f, "initiator"),
            HandshakeRole::Responder => write!(f, "responder"),
        }
    }
}

/// Handshake state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Initial state, ready to send/receive message 1.
    Initial,
    /// Message 1 sent/received, ready for message 2.
    Message1Done,
    /// Handshake complete, ready for transport.
    Complete,
}

impl fmt::Display for HandshakeProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeProgress::Initial => write!(f, "initial"),
            HandshakeProgress::Message1Done => write!(f, "message1_done"),
            HandshakeProgress::Complete => write!(f, "complete"),
        }
    }
}

/// One direction of a Noise session.
///
/// During the handshake the cipher keeps its own nonce and is driven
/// through `encrypt`/`decrypt`. Transport packets use [`CipherState::seal`]
/// and [`CipherState::open`] with the packet counter as nonce; those never
/// touch the internal nonce.
#[derive(Clone)]
pub struct CipherState {
    key: Option<[u8; 32]>,
    nonce: u64,
}

impl CipherState {
    pub(crate) fn new(key: [u8; 32]) -> Self {
        Self {
            key: Some(key),
            nonce: 0,
        }
    }

    pub(super) fn empty() -> Self {
        Self { key: None, nonce: 0 }
    }

    pub(super) fn initialize_key(&mut self, key: [u8; 32]) {
        self.key = Some(key);
        self.nonce = 0;
    }

    /// Handshake-phase encrypt. Without a key the bytes pass through.
    pub(super) fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.key.is_none() {
            return Ok(plaintext.to_vec());
        }
        let counter = self.next_nonce()?;
        self.seal(counter, &[], plaintext)
    }

    /// Handshake-phase decrypt. Without a key the bytes pass through.
    pub(super) fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.key.is_none() {
            return Ok(ciphertext.to_vec());
        }
        let counter = self.next_nonce()?;
        self.open(counter, &[], ciphertext)
    }

    /// Encrypt a transport packet. `counter` must never repeat under this
    /// key; `aad` is authenticated but not encrypted.
    pub fn seal(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let max = MAX_MESSAGE_SIZE - TAG_SIZE;
        if plaintext.len() > max {
            return Err(NoiseError::MessageTooLarge {
                size: plaintext.len(),
                max,
            });
        }
        self.aead()?
            .encrypt(&counter_nonce(counter), Payload { msg: plaintext, aad })
            .map_err(|_| NoiseError::EncryptionFailed)
    }

    /// Authenticate and decrypt a transport packet sealed with the same
    /// counter and `aad`.
    pub fn open(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(NoiseError::MessageTooShort {
                expected: TAG_SIZE,
                got: ciphertext.len(),
            });
        }
        self.aead()?
            .decrypt(&counter_nonce(counter), Payload { msg: ciphertext, aad })
            .map_err(|_| NoiseError::DecryptionFailed)
    }

    fn aead(&self) -> Result<ChaCha20Poly1305, NoiseError> {
        let key = self.key.as_ref().ok_or(NoiseError::HandshakeNotComplete)?;
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| NoiseError::EncryptionFailed)
    }

    fn next_nonce(&mut self) -> Result<u64, NoiseError> {
        let n = self.nonce;
        self.nonce = n.checked_add(1).ok_or(NoiseError::NonceOverflow)?;
        Ok(n)
    }

    /// Handshake-phase nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }
}

/// 96-bit nonce: four zero bytes then the little-endian counter.
fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    *Nonce::from_slice(&nonce)
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .field("has_key", &self.has_key())
            .finish_non_exhaustive()
    }
}
