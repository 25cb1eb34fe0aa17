//! Scope tags and the per-client keyring.

use sha2::{Digest, Sha256};
use std::fmt;
use taskrelay_protocol::ScopeKey;

/// Public tag for a shared board: `hex(sha256(shared_board_id))`.
///
/// The tag travels in the `b`/`d` event tags; the shared board id itself
/// never leaves the client except inside encrypted payloads.
pub fn scope_tag(shared_board_id: &str) -> String {
    hex::encode(Sha256::digest(shared_board_id.as_bytes()))
}

/// Root secret mixed into every scope key and the funder bounty envelope.
#[derive(Clone, Default)]
pub struct Keyring {
    root_secret: Vec<u8>,
}

impl Keyring {
    pub fn new(root_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            root_secret: root_secret.into(),
        }
    }

    pub fn root_secret(&self) -> &[u8] {
        &self.root_secret
    }

    /// Symmetric key for a shared board's payloads.
    pub fn scope_key(&self, shared_board_id: &str) -> ScopeKey {
        ScopeKey::derive(&self.root_secret, shared_board_id)
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("root_secret", &format_args!("<{} bytes>", self.root_secret.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_tag_is_sha256_hex() {
        let tag = scope_tag("board-1");
        assert_eq!(tag.len(), 64);
        assert_eq!(tag, scope_tag("board-1"));
        assert_ne!(tag, scope_tag("board-2"));
        assert_eq!(
            scope_tag(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn debug_hides_root_secret() {
        let keyring = Keyring::new(b"very secret".to_vec());
        let printed = format!("{:?}", keyring);
        assert!(!printed.contains("very secret"));
        assert!(printed.contains("11 bytes"));
    }

    #[test]
    fn scope_key_depends_on_root_secret() {
        let a = Keyring::new(b"a".to_vec()).scope_key("board");
        let b = Keyring::new(b"b".to_vec()).scope_key("board");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
