//! Key/value persistence.
//!
//! The engine persists only what cannot be rebuilt from relays: the relay
//! list, the root secret, the identity and snapshots of the local replica.
//! Logical clocks and the pending set are never stored.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use taskrelay_protocol::Identity;
use tracing::info;

use crate::error::{Result, SyncError};

pub const KEY_RELAYS: &str = "relays";
pub const KEY_ROOT_SECRET: &str = "root_secret";
pub const KEY_IDENTITY: &str = "identity";
pub const KEY_BOARDS: &str = "boards";
pub const KEY_TASKS: &str = "tasks";

/// Minimal load/save interface.
pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| SyncError::Storage("memory store poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| SyncError::Storage("memory store poisoned".into()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| SyncError::Storage("memory store poisoned".into()))?
            .remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SyncError::Storage(format!("invalid key {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl KeyValueStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        // Write then rename so a crash never leaves a truncated file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Store a JSON value under `key`.
pub fn save_json<T: serde::Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    store.save(key, &serde_json::to_string_pretty(value)?)
}

/// Read a JSON value stored under `key`.
pub fn load_json<T: serde::de::DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.load(key)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| SyncError::Storage(format!("corrupt {}: {}", key, e))),
        None => Ok(None),
    }
}

pub fn load_relays(store: &dyn KeyValueStore) -> Result<Option<Vec<String>>> {
    load_json(store, KEY_RELAYS)
}

pub fn save_relays(store: &dyn KeyValueStore, relays: &[String]) -> Result<()> {
    save_json(store, KEY_RELAYS, &relays)
}

pub fn load_root_secret(store: &dyn KeyValueStore) -> Result<Option<String>> {
    load_json(store, KEY_ROOT_SECRET)
}

pub fn save_root_secret(store: &dyn KeyValueStore, secret: &str) -> Result<()> {
    save_json(store, KEY_ROOT_SECRET, &secret)
}

/// Use `configured` if given, else the stored identity, else a new one
/// which is saved for next time.
pub fn load_or_create_identity(store: &dyn KeyValueStore, configured: Option<&str>) -> Result<Identity> {
    if let Some(secret) = configured {
        return Ok(Identity::from_secret_hex(secret.trim())?);
    }
    if let Some(secret) = load_json::<String>(store, KEY_IDENTITY)? {
        return Ok(Identity::from_secret_hex(&secret)?);
    }
    let identity = Identity::generate();
    save_json(store, KEY_IDENTITY, &identity.secret_hex())?;
    info!("Generated new identity {}", identity.public_key());
    Ok(identity)
}
