//! Payload envelopes.
//!
//! Two independent envelope families:
//!
//! - **Scope envelope**: symmetric XChaCha20-Poly1305 keyed by a key derived
//!   from the root secret and the shared scope id. Wraps board metadata and
//!   task payload JSON. Legacy events carry cleartext JSON, which
//!   [`open_scope_or_plaintext`] accepts as a fallback.
//! - **Bounty envelope**: wraps an opaque ecash token. The `funder` scheme is
//!   keyed by the funder's root secret alone (hidden until revealed); the
//!   `recipient` scheme is keyed by an ECDH secret between sender and
//!   receiver, so only those two identities can open it.
//!
//! Sealed bytes are `base64(nonce || ciphertext)` with a 24-byte nonce.

use crate::error::{Error, Result};
use crate::keys::Identity;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// XChaCha20 nonce length.
pub const NONCE_LEN: usize = 24;

const SCOPE_CONTEXT: &str = "taskrelay 2024-06 scope envelope v1";
const FUNDER_CONTEXT: &str = "taskrelay 2024-06 bounty funder v1";
const RECIPIENT_CONTEXT: &str = "taskrelay 2024-06 bounty recipient v1";

/// Symmetric key for one scope.
#[derive(Clone, PartialEq, Eq)]
pub struct ScopeKey([u8; 32]);

impl ScopeKey {
    /// Derive the key for `scope_id` under `root_secret`.
    ///
    /// An empty root secret yields a key any holder of the scope id can derive.
    pub fn derive(root_secret: &[u8], scope_id: &str) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(SCOPE_CONTEXT);
        hasher.update(&(root_secret.len() as u64).to_le_bytes());
        hasher.update(root_secret);
        hasher.update(scope_id.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScopeKey({}...)", &hex::encode(self.0)[..8])
    }
}

/// Encrypt a scope payload.
pub fn seal_scope(key: &ScopeKey, plaintext: &str) -> Result<String> {
    seal(key.as_bytes(), plaintext.as_bytes())
}

/// Decrypt a scope payload.
pub fn open_scope(key: &ScopeKey, content: &str) -> Result<String> {
    let bytes = open(key.as_bytes(), content)?;
    String::from_utf8(bytes).map_err(|e| Error::Decryption(e.to_string()))
}

/// Decrypt a scope payload, falling back to cleartext JSON.
///
/// Returns the JSON text and whether it came out of an envelope.
pub fn open_scope_or_plaintext(key: &ScopeKey, content: &str) -> Result<(String, bool)> {
    match open_scope(key, content) {
        Ok(plaintext) => Ok((plaintext, true)),
        Err(err) => {
            let trimmed = content.trim_start();
            if trimmed.starts_with('{')
                && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
            {
                trace!("envelope did not open ({}), using cleartext payload", err);
                Ok((content.to_string(), false))
            } else {
                Err(err)
            }
        }
    }
}

/// Which key protects a bounty token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BountyScheme {
    /// Only the funder's root secret opens it.
    Funder,
    /// Sender/receiver ECDH; only those two parties open it.
    Recipient,
}

/// Encrypted-at-rest bounty token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BountyEnvelope {
    pub scheme: BountyScheme,
    pub data: String,
}

impl BountyEnvelope {
    /// Hide a token under the funder's root secret.
    pub fn seal_for_funder(root_secret: &[u8], token: &str) -> Result<Self> {
        let key = blake3::derive_key(FUNDER_CONTEXT, root_secret);
        Ok(Self {
            scheme: BountyScheme::Funder,
            data: seal(&key, token.as_bytes())?,
        })
    }

    /// Encrypt a token end to end for `recipient`.
    pub fn seal_for_recipient(sender: &Identity, recipient: &str, token: &str) -> Result<Self> {
        let key = recipient_key(sender, recipient)?;
        Ok(Self {
            scheme: BountyScheme::Recipient,
            data: seal(&key, token.as_bytes())?,
        })
    }

    /// Open a `funder` envelope.
    pub fn open_as_funder(&self, root_secret: &[u8]) -> Result<String> {
        if self.scheme != BountyScheme::Funder {
            return Err(Error::Decryption("envelope is not a funder envelope".into()));
        }
        let key = blake3::derive_key(FUNDER_CONTEXT, root_secret);
        into_utf8(open(&key, &self.data)?)
    }

    /// Open a `recipient` envelope; `peer` is the other party's public key.
    pub fn open_with_peer(&self, identity: &Identity, peer: &str) -> Result<String> {
        if self.scheme != BountyScheme::Recipient {
            return Err(Error::Decryption(
                "envelope is not a recipient envelope".into(),
            ));
        }
        let key = recipient_key(identity, peer)?;
        into_utf8(open(&key, &self.data)?)
    }
}

fn recipient_key(identity: &Identity, peer: &str) -> Result<[u8; 32]> {
    let x_only = hex::decode(peer)?;
    if x_only.len() != 32 {
        return Err(Error::InvalidKey(format!(
            "expected 32-byte public key, got {}",
            x_only.len()
        )));
    }
    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(&x_only);
    let public =
        k256::PublicKey::from_sec1_bytes(&sec1).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let secret = k256::SecretKey::from_slice(&identity.secret_bytes())
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    Ok(blake3::derive_key(
        RECIPIENT_CONTEXT,
        shared.raw_secret_bytes().as_slice(),
    ))
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<String> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

fn open(key: &[u8; 32], content: &str) -> Result<Vec<u8>> {
    let raw = BASE64
        .decode(content.trim())
        .map_err(|e| Error::Decryption(e.to_string()))?;
    if raw.len() <= NONCE_LEN {
        return Err(Error::Decryption("ciphertext too short".into()));
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decryption("authentication failed".into()))
}

fn into_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::Decryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_envelope_opens_with_same_derivation() {
        let key = ScopeKey::derive(b"", "board-123");
        let sealed = seal_scope(&key, r#"{"title":"x"}"#).unwrap();
        assert_ne!(sealed, r#"{"title":"x"}"#);

        let other_client = ScopeKey::derive(b"", "board-123");
        assert_eq!(open_scope(&other_client, &sealed).unwrap(), r#"{"title":"x"}"#);
    }

    #[test]
    fn scope_key_depends_on_root_and_scope() {
        let a = ScopeKey::derive(b"root", "board");
        assert_ne!(a, ScopeKey::derive(b"", "board"));
        assert_ne!(a, ScopeKey::derive(b"root", "board2"));
        // length prefix keeps ("ab","c") and ("a","bc") apart
        assert_ne!(
            ScopeKey::derive(b"ab", "c"),
            ScopeKey::derive(b"a", "bc")
        );
    }

    #[test]
    fn wrong_scope_key_fails() {
        let sealed = seal_scope(&ScopeKey::derive(b"", "a"), "{}").unwrap();
        assert!(open_scope(&ScopeKey::derive(b"", "b"), &sealed).is_err());
    }

    #[test]
    fn plaintext_fallback_accepts_legacy_json_only() {
        let key = ScopeKey::derive(b"", "a");
        let (json, encrypted) = open_scope_or_plaintext(&key, r#"{"title":"legacy"}"#).unwrap();
        assert!(!encrypted);
        assert_eq!(json, r#"{"title":"legacy"}"#);

        assert!(open_scope_or_plaintext(&key, "bm90IGpzb24=").is_err());
        assert!(open_scope_or_plaintext(&key, "{broken").is_err());
    }

    #[test]
    fn funder_envelope_is_private_to_root_secret() {
        let env = BountyEnvelope::seal_for_funder(b"funder-root", "cashuAtoken").unwrap();
        assert_eq!(env.scheme, BountyScheme::Funder);
        assert_eq!(env.open_as_funder(b"funder-root").unwrap(), "cashuAtoken");
        assert!(env.open_as_funder(b"someone-else").is_err());
    }

    #[test]
    fn recipient_envelope_opens_for_both_parties_only() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let carol = Identity::generate();

        let env = BountyEnvelope::seal_for_recipient(&alice, bob.public_key(), "cashuBtoken")
            .unwrap();
        assert_eq!(
            env.open_with_peer(&bob, alice.public_key()).unwrap(),
            "cashuBtoken"
        );
        assert_eq!(
            env.open_with_peer(&alice, bob.public_key()).unwrap(),
            "cashuBtoken"
        );
        assert!(env.open_with_peer(&carol, alice.public_key()).is_err());
    }

    #[test]
    fn schemes_never_cross_decrypt() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let recipient = BountyEnvelope::seal_for_recipient(&alice, bob.public_key(), "t").unwrap();
        assert!(recipient.open_as_funder(b"").is_err());

        let funder = BountyEnvelope::seal_for_funder(b"", "t").unwrap();
        assert!(funder.open_with_peer(&bob, alice.public_key()).is_err());
    }

    #[test]
    fn envelope_serializes_scheme_lowercase() {
        let env = BountyEnvelope {
            scheme: BountyScheme::Recipient,
            data: "abc".into(),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, r#"{"scheme":"recipient","data":"abc"}"#);
    }
}
