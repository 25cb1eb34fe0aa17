//! Identity keys.
//!
//! An identity is a secp256k1 secret key. Its public key is the 32-byte
//! x-only BIP-340 key, rendered as lowercase hex everywhere it travels
//! (event `pubkey`, bounty `owner`/`sender`/`receiver`).

use crate::error::{Error, Result};
use k256::schnorr::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;

/// Hex-encoded x-only public key.
pub type PublicKeyHex = String;

/// A local signing identity.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    public_key: PublicKeyHex,
}

impl Identity {
    /// Generate a fresh identity from the OS random number generator.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Load an identity from a 32-byte hex secret.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())?;
        Self::from_secret_bytes(&bytes)
    }

    /// Load an identity from raw secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let signing_key =
            SigningKey::from_bytes(bytes).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = hex::encode(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            public_key,
        }
    }

    /// Hex public key of this identity.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Hex secret, for persistence.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Raw secret scalar bytes, used for ECDH.
    pub(crate) fn secret_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.signing_key.to_bytes());
        out
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Parse a hex x-only public key.
pub fn parse_public_key(public_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(public_key)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_hex_roundtrip_preserves_public_key() {
        let identity = Identity::generate();
        let restored = Identity::from_secret_hex(&identity.secret_hex()).unwrap();
        assert_eq!(identity.public_key(), restored.public_key());
        assert_eq!(identity.public_key().len(), 64);
    }

    #[test]
    fn rejects_short_secret() {
        assert!(Identity::from_secret_hex("abcd").is_err());
    }

    #[test]
    fn public_key_parses() {
        let identity = Identity::generate();
        assert!(parse_public_key(identity.public_key()).is_ok());
        assert!(parse_public_key("zz").is_err());
    }
}
