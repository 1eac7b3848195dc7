//! WireGuard key material
//!
//! Uses x25519-dalek for key generation; keys are carried base64
//! encoded as the `wg` tooling expects them.

use rand::rngs::OsRng;
use wgvault_common::{Error, Result};

/// WireGuard key pair
#[derive(Clone)]
pub struct WgKeyPair {
    /// Base64-encoded private key. Sealed before persistence.
    pub private_key: String,
    /// Base64-encoded public key.
    pub public_key: String,
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Private half never appears in logs or debug output.
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Generate a WireGuard keypair via x25519.
pub fn generate_keypair() -> Result<WgKeyPair> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use rand::RngCore;

    let mut private_key_bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut private_key_bytes)
        .map_err(|e| Error::KeyGeneration(format!("system RNG unavailable: {}", e)))?;

    // Curve25519 key clamping
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    // Public key via x25519 base point multiplication
    use x25519_dalek::{PublicKey, StaticSecret};
    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    Ok(WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_shape() {
        let kp = generate_keypair().unwrap();
        assert_eq!(kp.private_key.len(), 44); // base64 of 32 bytes
        assert_eq!(kp.public_key.len(), 44);
        assert_ne!(kp.private_key, kp.public_key);
    }

    #[test]
    fn private_key_is_clamped() {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let kp = generate_keypair().unwrap();
        let bytes = STANDARD.decode(&kp.private_key).unwrap();
        assert_eq!(bytes[0] & 7, 0);
        assert_eq!(bytes[31] & 128, 0);
        assert_eq!(bytes[31] & 64, 64);
    }

    #[test]
    fn debug_hides_private_key() {
        let kp = generate_keypair().unwrap();
        let rendered = format!("{:?}", kp);
        assert!(!rendered.contains(&kp.private_key));
        assert!(rendered.contains(&kp.public_key));
    }
}
