//! # Client Payload Encryption
//!
//! Each authenticated client gets fresh key material in its auth response.
//! Both ends derive a ChaCha20-Poly1305 key from it with SHA-256.
//!
//! The 12-byte nonce is a direction byte followed by the frame sequence
//! number. Each direction has its own strictly increasing sequence, so a
//! (direction, sequence) pair is never sealed twice under one key.
//!
//! ```text
//! nonce = [direction, 0, 0, 0, 0, 0, 0, 0, seq_be(4)]
//! key   = SHA-256("session-gateway/v1" || subtract || modulus || key[10])
//! ```

use crate::error::{GatewayError, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;

/// Bytes of raw key in the key material triple
pub const KEY_LEN: usize = 10;

/// Poly1305 tag appended to every sealed payload
pub const TAG_LEN: usize = 16;

const KDF_LABEL: &[u8] = b"session-gateway/v1";

/// Key material handed to a client in its auth response
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub subtract: u8,
    pub modulus: u8,
    pub key: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Fresh material; every byte is in `1..=255`.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut key = [0u8; KEY_LEN];
        for byte in key.iter_mut() {
            *byte = rng.random_range(1..=u8::MAX);
        }
        Self {
            subtract: rng.random_range(1..=u8::MAX),
            modulus: rng.random_range(1..=u8::MAX),
            key,
        }
    }

    /// Placeholder sent with failed auth responses
    pub fn zeroed() -> Self {
        Self {
            subtract: 0,
            modulus: 0,
            key: [0u8; KEY_LEN],
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Which way a payload travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Client to gateway
    Upstream = 0x01,
    /// Gateway to client
    Downstream = 0x02,
}

/// AEAD bound to one client's key material
#[derive(Clone)]
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(material: &KeyMaterial) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KDF_LABEL);
        hasher.update([material.subtract, material.modulus]);
        hasher.update(material.key);
        let derived: [u8; 32] = hasher.finalize().into();
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&derived)),
        }
    }

    fn nonce(direction: Direction, sequence: u32) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0] = direction as u8;
        nonce[8..].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }

    pub fn seal(&self, direction: Direction, sequence: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(direction, sequence);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| GatewayError::EncryptionFailure)
    }

    pub fn open(&self, direction: Direction, sequence: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(direction, sequence);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| GatewayError::DecryptionFailure)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionCipher")
    }
}
