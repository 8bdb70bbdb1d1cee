//! AES-256-GCM sealing for frame payloads.
//!
//! Sealed layout: `[12-byte random nonce][ciphertext ++ 16-byte tag]`.
//! Both peers must hold the same [`SharedKey`]; there is no key exchange.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ChannelError;

/// Nonce size for AES-GCM (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag appended by AES-GCM.
pub const TAG_SIZE: usize = 16;

/// Symmetric key length in bytes.
pub const KEY_SIZE: usize = 32;

/// Associated data bound into every frame.
const ASSOCIATED_DATA: [u8; 255] = [0u8; 255];

/// Pre-shared symmetric key, provisioned out of band.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; KEY_SIZE]);

impl SharedKey {
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let mut bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| anyhow::anyhow!("Invalid key encoding: {e}"))?;
        let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!("Key must be {KEY_SIZE} bytes, got {}", bytes.len())
        })?;
        bytes.zeroize();
        Ok(Self(key))
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

/// Authenticated cipher used by the frame codec.
pub trait Cipher: Send + Sync {
    /// Seal `plaintext`, returning ciphertext with its integrity tag.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError>;

    /// Open a sealed buffer. Any tampering yields `AuthenticationFailed`.
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, ChannelError>;
}

/// AES-256-GCM with a random nonce per frame.
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &SharedKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl Cipher for AesGcmCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &ASSOCIATED_DATA,
                },
            )
            .map_err(|_| ChannelError::SealFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ChannelError::AuthenticationFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &ASSOCIATED_DATA,
                },
            )
            .map_err(|_| ChannelError::AuthenticationFailed)
    }
}
