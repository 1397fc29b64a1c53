use super::{
    CipherState, HandshakeProgress, HandshakeRole, NoiseError, HANDSHAKE_MSG1_MIN_SIZE,
    HANDSHAKE_MSG2_MIN_SIZE, PROTOCOL_NAME, PUBKEY_SIZE, TAG_SIZE,
};
use hkdf::Hkdf;
use secp256k1::{ecdh::shared_secret_point, Keypair, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt;

/// Symmetric state during handshake.
///
/// Maintains the chaining key (ck), handshake hash (h), and current cipher.
struct SymmetricState {
    /// Chaining key for key derivation.
    ck: [u8; 32],
    /// Handshake hash for transcript binding.
    h: [u8; 32],
    /// Current cipher state for encrypting handshake payloads.
    cipher: CipherState,
}

impl SymmetricState {
    /// Initialize with protocol name.
    fn initialize() -> Self {
        // Names longer than the hash output are hashed, shorter ones padded.
        let h = if PROTOCOL_NAME.len() <= 32 {
            let mut h = [0u8; 32];
            h[..PROTOCOL_NAME.len()].copy_from_slice(PROTOCOL_NAME);
            h
        } else {
            let mut hasher = Sha256::new();
            hasher.update(PROTOCOL_NAME);
            hasher.finalize().into()
        };

        Self {
            ck: h,
            h,
            cipher: CipherState::empty(),
        }
    }

    /// Mix data into the handshake hash.
    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    /// Mix key material into the chaining key.
    fn mix_key(&mut self, input_key_material: &[u8]) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), input_key_material);
        let mut output = [0u8; 64];
        hk.expand(&[], &mut output)
            .expect("64 bytes is valid output length");

        self.ck.copy_from_slice(&output[..32]);

        let mut key = [0u8; 32];
        key.copy_from_slice(&output[32..64]);
        self.cipher.initialize_key(key);
    }

    /// Encrypt and mix into hash. Before the first `mix_key` this is a
    /// plaintext pass-through that still binds the bytes to the transcript.
    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = self.cipher.encrypt(plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypt and mix ciphertext into hash.
    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let plaintext = self.cipher.decrypt(ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Split into two cipher states for transport.
    fn split(&self) -> (CipherState, CipherState) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), &[]);
        let mut output = [0u8; 64];
        hk.expand(&[], &mut output)
            .expect("64 bytes is valid output length");

        let mut k1 = [0u8; 32];
        let mut k2 = [0u8; 32];
        k1.copy_from_slice(&output[..32]);
        k2.copy_from_slice(&output[32..64]);

        (CipherState::new(k1), CipherState::new(k2))
    }
}

/// Handshake state for Noise IX.
pub struct HandshakeState {
    /// Our role in the handshake.
    role: HandshakeRole,
    /// Current progress.
    progress: HandshakeProgress,
    /// Symmetric state.
    symmetric: SymmetricState,
    /// Our static keypair.
    static_keypair: Keypair,
    /// Our ephemeral keypair (generated when we write our message).
    ephemeral_keypair: Option<Keypair>,
    /// Remote static public key, learned from their handshake message.
    remote_static: Option<PublicKey>,
    /// Remote ephemeral public key (learned during handshake).
    remote_ephemeral: Option<PublicKey>,
    /// Secp256k1 context.
    secp: Secp256k1<secp256k1::All>,
}

impl HandshakeState {
    /// Create a new handshake as initiator.
    pub fn new_initiator(static_keypair: Keypair) -> Self {
        Self::new(HandshakeRole::Initiator, static_keypair)
    }

    /// Create a new handshake as responder.
    pub fn new_responder(static_keypair: Keypair) -> Self {
        Self::new(HandshakeRole::Responder, static_keypair)
    }

    fn new(role: HandshakeRole, static_keypair: Keypair) -> Self {
        let mut symmetric = SymmetricState::initialize();
        // Empty prologue.
        symmetric.mix_hash(&[]);

        Self {
            role,
            progress: HandshakeProgress::Initial,
            symmetric,
            static_keypair,
            ephemeral_keypair: None,
            remote_static: None,
            remote_ephemeral: None,
            secp: Secp256k1::new(),
        }
    }

    /// Get our role.
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Get current progress.
    pub fn progress(&self) -> HandshakeProgress {
        self.progress
    }

    /// Check if handshake is complete.
    pub fn is_complete(&self) -> bool {
        self.progress == HandshakeProgress::Complete
    }

    /// Get the remote static key (available once their message was read).
    pub fn remote_static(&self) -> Option<&PublicKey> {
        self.remote_static.as_ref()
    }

    /// Our static public key.
    pub fn local_static(&self) -> PublicKey {
        self.static_keypair.public_key()
    }

    /// Generate ephemeral keypair.
    fn generate_ephemeral(&mut self) -> Keypair {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let keypair = Keypair::from_secret_key(&self.secp, &secret_key);
        self.ephemeral_keypair = Some(keypair);
        keypair
    }

    /// Perform ECDH between our secret and their public key.
    ///
    /// Only the x-coordinate of the shared point is hashed so the result is
    /// independent of point parity.
    fn ecdh(&self, our_secret: &SecretKey, their_public: &PublicKey) -> [u8; 32] {
        let point = shared_secret_point(their_public, our_secret);
        let mut hasher = Sha256::new();
        hasher.update(&point[..32]);
        hasher.finalize().into()
    }

    fn expect_state(
        &self,
        role: HandshakeRole,
        progress: HandshakeProgress,
    ) -> Result<(), NoiseError> {
        if self.role != role {
            return Err(NoiseError::WrongState {
                expected: role.to_string(),
                got: self.role.to_string(),
            });
        }
        if self.progress != progress {
            return Err(NoiseError::WrongState {
                expected: progress.to_string(),
                got: self.progress.to_string(),
            });
        }
        Ok(())
    }

    /// Write message 1 (initiator only).
    ///
    /// Message 1 contains:
    /// - e: ephemeral public key (33 bytes)
    /// - s: our static public key (33 bytes, no key mixed yet)
    /// - payload (plaintext, bound to the transcript hash)
    pub fn write_message_1(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Initiator, HandshakeProgress::Initial)?;

        let ephemeral = self.generate_ephemeral();
        let e_pub = ephemeral.public_key().serialize();

        let mut message = Vec::with_capacity(HANDSHAKE_MSG1_MIN_SIZE + payload.len());

        // -> e
        message.extend_from_slice(&e_pub);
        self.symmetric.mix_hash(&e_pub);

        // -> s
        let our_static = self.static_keypair.public_key().serialize();
        let static_out = self.symmetric.encrypt_and_hash(&our_static)?;
        message.extend_from_slice(&static_out);

        let payload_out = self.symmetric.encrypt_and_hash(payload)?;
        message.extend_from_slice(&payload_out);

        self.progress = HandshakeProgress::Message1Done;

        Ok(message)
    }

    /// Read message 1 (responder only), returning the initiator's payload.
    pub fn read_message_1(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Responder, HandshakeProgress::Initial)?;
        if message.len() < HANDSHAKE_MSG1_MIN_SIZE {
            return Err(NoiseError::MessageTooShort {
                expected: HANDSHAKE_MSG1_MIN_SIZE,
                got: message.len(),
            });
        }

        // -> e
        let e_pub = &message[..PUBKEY_SIZE];
        let re = PublicKey::from_slice(e_pub).map_err(|_| NoiseError::InvalidPublicKey)?;
        self.remote_ephemeral = Some(re);
        self.symmetric.mix_hash(e_pub);

        // -> s
        let static_in = &message[PUBKEY_SIZE..HANDSHAKE_MSG1_MIN_SIZE];
        let rs_bytes = self.symmetric.decrypt_and_hash(static_in)?;
        let rs = PublicKey::from_slice(&rs_bytes).map_err(|_| NoiseError::InvalidPublicKey)?;
        self.remote_static = Some(rs);

        let payload = self
            .symmetric
            .decrypt_and_hash(&message[HANDSHAKE_MSG1_MIN_SIZE..])?;

        self.progress = HandshakeProgress::Message1Done;

        Ok(payload)
    }

    /// Write message 2 (responder only).
    ///
    /// Message 2 contains:
    /// - e: ephemeral public key (33 bytes)
    /// - encrypted s: our static public key (33 + 16 tag bytes)
    /// - encrypted payload (payload + 16 tag bytes)
    pub fn write_message_2(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Responder, HandshakeProgress::Message1Done)?;

        let (re, rs) = match (self.remote_ephemeral, self.remote_static) {
            (Some(re), Some(rs)) => (re, rs),
            _ => return Err(NoiseError::HandshakeNotComplete),
        };

        let ephemeral = self.generate_ephemeral();
        let e_pub = ephemeral.public_key().serialize();

        let mut message = Vec::with_capacity(HANDSHAKE_MSG2_MIN_SIZE + payload.len());

        // <- e
        message.extend_from_slice(&e_pub);
        self.symmetric.mix_hash(&e_pub);

        // <- ee
        let ee = self.ecdh(&ephemeral.secret_key(), &re);
        self.symmetric.mix_key(&ee);

        // <- se: initiator static with our ephemeral
        let se = self.ecdh(&ephemeral.secret_key(), &rs);
        self.symmetric.mix_key(&se);

        // <- s
        let our_static = self.static_keypair.public_key().serialize();
        let encrypted_static = self.symmetric.encrypt_and_hash(&our_static)?;
        message.extend_from_slice(&encrypted_static);

        // <- es: initiator ephemeral with our static
        let es = self.ecdh(&self.static_keypair.secret_key(), &re);
        self.symmetric.mix_key(&es);

        let encrypted_payload = self.symmetric.encrypt_and_hash(payload)?;
        message.extend_from_slice(&encrypted_payload);

        self.progress = HandshakeProgress::Complete;

        Ok(message)
    }

    /// Read message 2 (initiator only), returning the responder's payload.
    pub fn read_message_2(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Initiator, HandshakeProgress::Message1Done)?;
        if message.len() < HANDSHAKE_MSG2_MIN_SIZE {
            return Err(NoiseError::MessageTooShort {
                expected: HANDSHAKE_MSG2_MIN_SIZE,
                got: message.len(),
            });
        }
        let ephemeral = self
            .ephemeral_keypair
            .ok_or(NoiseError::HandshakeNotComplete)?;

        // <- e
        let e_pub = &message[..PUBKEY_SIZE];
        let re = PublicKey::from_slice(e_pub).map_err(|_| NoiseError::InvalidPublicKey)?;
        self.remote_ephemeral = Some(re);
        self.symmetric.mix_hash(e_pub);

        // <- ee
        let ee = self.ecdh(&ephemeral.secret_key(), &re);
        self.symmetric.mix_key(&ee);

        // <- se: our static with their ephemeral
        let se = self.ecdh(&self.static_keypair.secret_key(), &re);
        self.symmetric.mix_key(&se);

        // <- s
        let static_end = PUBKEY_SIZE + PUBKEY_SIZE + TAG_SIZE;
        let rs_bytes = self
            .symmetric
            .decrypt_and_hash(&message[PUBKEY_SIZE..static_end])?;
        let rs = PublicKey::from_slice(&rs_bytes).map_err(|_| NoiseError::InvalidPublicKey)?;
        self.remote_static = Some(rs);

        // <- es: our ephemeral with their static
        let es = self.ecdh(&ephemeral.secret_key(), &rs);
        self.symmetric.mix_key(&es);

        let payload = self.symmetric.decrypt_and_hash(&message[static_end..])?;

        self.progress = HandshakeProgress::Complete;

        Ok(payload)
    }

    /// Complete the handshake and return `(send, recv)` transport ciphers
    /// plus the authenticated remote static key.
    pub fn into_ciphers(self) -> Result<(CipherState, CipherState, PublicKey), NoiseError> {
        if !self.is_complete() {
            return Err(NoiseError::HandshakeNotComplete);
        }
        let remote_static = self.remote_static.ok_or(NoiseError::HandshakeNotComplete)?;

        let (c1, c2) = self.symmetric.split();

        // Initiator sends with c1, receives with c2
        let (send, recv) = match self.role {
            HandshakeRole::Initiator => (c1, c2),
            HandshakeRole::Responder => (c2, c1),
        };

        Ok((send, recv, remote_static))
    }

    /// Get the handshake hash (for channel binding, available after complete).
    pub fn handshake_hash(&self) -> [u8; 32] {
        self.symmetric.h
    }
}

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeState")
            .field("role", &self.role)
            .field("progress", &self.progress)
            .field("has_ephemeral", &self.ephemeral_keypair.is_some())
            .field("has_remote_static", &self.remote_static.is_some())
            .field("has_remote_ephemeral", &self.remote_ephemeral.is_some())
            .finish()
    }
}
