//! Private key sealing for WgVault
//!
//! Device private keys are sealed with ChaCha20-Poly1305 before they
//! touch the database and opened only transiently when a client
//! configuration is rendered. Storage form is base64(nonce || ct).

use crate::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Seals and opens device private keys with a server-held key.
#[derive(Clone)]
pub struct KeySealer {
    cipher: ChaCha20Poly1305,
}

impl KeySealer {
    /// Build a sealer from a 32-byte key given as 64 hex characters.
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(key_hex)
            .map_err(|e| Error::InvalidConfig(format!("encryption key is not hex: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidConfig("encryption key must be 32 bytes".to_string()))?;
        Ok(Self::from_bytes(&key))
    }

    pub fn from_bytes(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Seal a plaintext private key. A fresh random nonce is drawn for
    /// every call.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("seal failed: {}", e)))?;

        use base64::{engine::general_purpose::STANDARD, Engine};
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Open a sealed private key.
    pub fn open(&self, sealed: &str) -> Result<String> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let bytes = STANDARD
            .decode(sealed)
            .map_err(|e| Error::Crypto(format!("sealed key is not base64: {}", e)))?;

        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Crypto("sealed key too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Crypto("sealed key failed authentication".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto("sealed key is not valid UTF-8".to_string()))
    }
}

impl std::fmt::Debug for KeySealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("KeySealer").finish_non_exhaustive()
    }
}

/// Generate a random 32-byte sealing key as hex, for bootstrap tooling.
pub fn generate_sealing_key_hex() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> KeySealer {
        KeySealer::from_bytes(&[7u8; 32])
    }

    #[test]
    fn seal_open_round_trip() {
        let s = sealer();
        let sealed = s.seal("gI6EdUSYvn8ugXOt8QQD6Yc+JyiZxIhp3GInSWRfWGE=").unwrap();
        let opened = s.open(&sealed).unwrap();
        assert_eq!(opened, "gI6EdUSYvn8ugXOt8QQD6Yc+JyiZxIhp3GInSWRfWGE=");
    }

    #[test]
    fn nonce_is_unique_per_seal() {
        let s = sealer();
        let a = s.seal("same input").unwrap();
        let b = s.seal("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let s = sealer();
        let sealed = s.seal("secret").unwrap();
        let mut bytes = STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(s.open(&STANDARD.encode(bytes)).is_err());
    }

    #[test]
    fn wrong_key_rejected() {
        let sealed = sealer().seal("secret").unwrap();
        let other = KeySealer::from_bytes(&[8u8; 32]);
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn from_hex_validates_length() {
        assert!(KeySealer::from_hex("deadbeef").is_err());
        assert!(KeySealer::from_hex(&generate_sealing_key_hex()).is_ok());
    }
}
