//! Signed relay events.
//!
//! Events follow the relay network's canonical shape:
//!
//! ```text
//! { id, kind, pubkey, created_at, tags, content, sig }
//! ```
//!
//! `id` is the SHA-256 of the compact JSON array
//! `[0, pubkey, created_at, kind, tags, content]` and `sig` is a BIP-340
//! Schnorr signature over that id by `pubkey`.

use crate::error::{Error, Result};
use crate::keys::{parse_public_key, Identity};
use k256::schnorr::Signature;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind used for scope (board) metadata events.
pub const KIND_SCOPE_METADATA: u32 = 30300;

/// Kind used for entity (task) events.
pub const KIND_ENTITY: u32 = 30301;

/// Tag list as carried on the wire.
pub type Tags = Vec<Vec<String>>;

/// An immutable, signed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Tags,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }

    /// Check that the id matches the content hash and the signature verifies.
    pub fn verify(&self) -> Result<()> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if expected != self.id {
            return Err(Error::IdMismatch {
                expected,
                actual: self.id.clone(),
            });
        }

        let verifying_key = parse_public_key(&self.pubkey)?;
        let id_bytes = hex::decode(&self.id)?;
        let sig_bytes = hex::decode(&self.sig)?;
        let signature = Signature::try_from(sig_bytes.as_slice())
            .map_err(|_| Error::InvalidSignature(self.id.clone()))?;
        verifying_key
            .verify_raw(&id_bytes, &signature)
            .map_err(|_| Error::InvalidSignature(self.id.clone()))
    }
}

/// An event that has not been timestamped or signed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub kind: u32,
    pub tags: Tags,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(kind: u32, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Append a `[name, value]` tag.
    pub fn tag(mut self, name: &str, value: impl Into<String>) -> Self {
        self.tags.push(vec![name.to_string(), value.into()]);
        self
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }

    /// Finalize with a timestamp and sign with `identity`.
    pub fn sign(self, identity: &Identity, created_at: u64) -> Result<Event> {
        let pubkey = identity.public_key().to_string();
        let id = compute_id(&pubkey, created_at, self.kind, &self.tags, &self.content)?;
        let id_bytes = hex::decode(&id)?;

        let mut aux = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut aux);
        let signature = identity
            .signing_key()
            .sign_raw(&id_bytes, &aux)
            .map_err(|e| Error::Signing(e.to_string()))?;

        Ok(Event {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(signature.to_bytes()),
        })
    }
}

/// Compute the canonical event id.
pub fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &Tags,
    content: &str,
) -> Result<String> {
    let canonical = serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content))?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

fn tag_value<'a>(tags: &'a Tags, name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.first().map(String::as_str) == Some(name))
        .and_then(|tag| tag.get(1))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(identity: &Identity) -> Event {
        UnsignedEvent::new(KIND_ENTITY, "{\"title\":\"Buy milk\"}")
            .tag("d", "task-1")
            .tag("b", "scope")
            .tag("status", "open")
            .sign(identity, 1_700_000_000)
            .unwrap()
    }

    #[test]
    fn signed_event_verifies() {
        let identity = Identity::generate();
        let event = sample(&identity);
        assert_eq!(event.pubkey, identity.public_key());
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        event.verify().unwrap();
    }

    #[test]
    fn tampered_content_fails_id_check() {
        let identity = Identity::generate();
        let mut event = sample(&identity);
        event.content = "{\"title\":\"Buy beer\"}".into();
        assert!(matches!(event.verify(), Err(Error::IdMismatch { .. })));
    }

    #[test]
    fn forged_pubkey_fails_signature_check() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let mut event = sample(&identity);
        event.pubkey = other.public_key().to_string();
        event.id = compute_id(
            &event.pubkey,
            event.created_at,
            event.kind,
            &event.tags,
            &event.content,
        )
        .unwrap();
        assert!(matches!(event.verify(), Err(Error::InvalidSignature(_))));
    }

    #[test]
    fn tag_lookup_returns_first_value() {
        let identity = Identity::generate();
        let event = sample(&identity);
        assert_eq!(event.tag_value("d"), Some("task-1"));
        assert_eq!(event.tag_value("status"), Some("open"));
        assert_eq!(event.tag_value("col"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

        #[test]
        fn any_edit_after_signing_is_detected(
            content in ".{0,64}",
            scope in "[a-f0-9]{1,16}",
            created_at in 1u64..4_000_000_000,
            shift in 1u64..1000,
            extra in "[a-z]{1,8}",
        ) {
            let identity = Identity::generate();
            let event = UnsignedEvent::new(KIND_ENTITY, content.clone())
                .tag("b", scope)
                .sign(&identity, created_at)
                .unwrap();
            prop_assert!(event.verify().is_ok());

            let mut edited = event.clone();
            edited.content = format!("{}{}", content, extra);
            prop_assert!(edited.verify().is_err());

            let mut backdated = event.clone();
            backdated.created_at = created_at - shift.min(created_at);
            prop_assert!(backdated.verify().is_err());

            let mut retagged = event;
            retagged.tags.push(vec!["status".into(), extra]);
            prop_assert!(retagged.verify().is_err());
        }
    }

    #[test]
    fn canonical_form_matches_wire_serialization() {
        let id = compute_id("ab", 1, 30301, &vec![vec!["d".into(), "x".into()]], "hi").unwrap();
        let expected = hex::encode(Sha256::digest(br#"[0,"ab",1,30301,[["d","x"]],"hi"]"#));
        assert_eq!(id, expected);
    }
}
