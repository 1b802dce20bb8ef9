//! Durable storage for offline license metadata and per-origin provisioning
//! flags.
//!
//! Records are keyed by `(origin, session token)`. Every operation finishes
//! before the promise that depends on it resolves, so a resolved offline
//! update means the keyset id is on disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::cdm::KeySetId;
use crate::session::SessionToken;
use crate::utils::{ensure_parent_dir, unix_now};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record exists but cannot be used.
    #[error("Corrupt record for {token} in origin '{origin}': {detail}")]
    Corrupt {
        origin: String,
        token: SessionToken,
        detail: String,
    },

    #[error("Failed to persist store: {0}")]
    Persist(#[from] tempfile::PersistError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persisted metadata of one offline license.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRecord {
    pub key_set_id: KeySetId,
    pub mime_type: String,
    /// Seconds since the Unix epoch.
    pub stored_at: u64,
}

impl LicenseRecord {
    pub fn new(key_set_id: KeySetId, mime_type: impl Into<String>) -> Self {
        Self {
            key_set_id,
            mime_type: mime_type.into(),
            stored_at: unix_now(),
        }
    }
}

/// Durable key-value storage used by the session manager.
pub trait PersistentStore {
    fn save_keyset(
        &mut self,
        origin: &str,
        token: SessionToken,
        record: &LicenseRecord,
    ) -> StoreResult<()>;

    /// `Ok(None)` when nothing is stored; [`StoreError::Corrupt`] when a
    /// record exists but is unusable.
    fn load_keyset(&self, origin: &str, token: SessionToken) -> StoreResult<Option<LicenseRecord>>;

    /// Clearing a record that does not exist succeeds.
    fn clear_keyset(&mut self, origin: &str, token: SessionToken) -> StoreResult<()>;

    fn mark_origin_provisioned(&mut self, origin: &str) -> StoreResult<()>;

    fn is_origin_provisioned(&self, origin: &str) -> StoreResult<bool>;
}

/// Store kept only in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    licenses: HashMap<(String, SessionToken), LicenseRecord>,
    provisioned: HashSet<String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.licenses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.licenses.is_empty()
    }
}

impl PersistentStore for MemoryStore {
    fn save_keyset(
        &mut self,
        origin: &str,
        token: SessionToken,
        record: &LicenseRecord,
    ) -> StoreResult<()> {
        self.licenses
            .insert((origin.to_string(), token), record.clone());
        Ok(())
    }

    fn load_keyset(&self, origin: &str, token: SessionToken) -> StoreResult<Option<LicenseRecord>> {
        let Some(record) = self.licenses.get(&(origin.to_string(), token)) else {
            return Ok(None);
        };
        if record.key_set_id.is_empty() {
            return Err(StoreError::Corrupt {
                origin: origin.to_string(),
                token,
                detail: "empty keyset id".to_string(),
            });
        }
        Ok(Some(record.clone()))
    }

    fn clear_keyset(&mut self, origin: &str, token: SessionToken) -> StoreResult<()> {
        self.licenses.remove(&(origin.to_string(), token));
        Ok(())
    }

    fn mark_origin_provisioned(&mut self, origin: &str) -> StoreResult<()> {
        self.provisioned.insert(origin.to_string());
        Ok(())
    }

    fn is_origin_provisioned(&self, origin: &str) -> StoreResult<bool> {
        Ok(self.provisioned.contains(origin))
    }
}

/// On-disk license entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLicense {
    /// Base64 (standard alphabet) keyset id.
    pub key_set_id: String,
    pub mime_type: String,
    #[serde(default)]
    pub stored_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginEntry {
    #[serde(default)]
    pub provisioned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_at: Option<u64>,
    #[serde(default)]
    pub licenses: BTreeMap<SessionToken, StoredLicense>,
}

impl OriginEntry {
    fn is_empty(&self) -> bool {
        !self.provisioned && self.licenses.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    origins: BTreeMap<String, OriginEntry>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            origins: BTreeMap::new(),
        }
    }
}

/// Store backed by one JSON file, rewritten atomically on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    document: StoreDocument,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let document = match fs::read(&path) {
            Ok(data) if data.iter().all(u8::is_ascii_whitespace) => StoreDocument::default(),
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };
        if document.version != STORE_VERSION {
            log!(
                warn,
                "Store {} has version {}, expected {}",
                path.display(),
                document.version,
                STORE_VERSION
            );
        }
        log!(
            debug,
            "Opened store {} with {} origin(s)",
            path.display(),
            document.origins.len()
        );
        Ok(Self { path, document })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn origins(&self) -> impl Iterator<Item = (&str, &OriginEntry)> {
        self.document
            .origins
            .iter()
            .map(|(name, entry)| (name.as_str(), entry))
    }

    #[must_use]
    pub fn origin(&self, origin: &str) -> Option<&OriginEntry> {
        self.document.origins.get(origin)
    }

    /// Apply `update` to a copy of the document, write it out, and only then
    /// adopt it.
    fn commit<F>(&mut self, update: F) -> StoreResult<()>
    where
        F: FnOnce(&mut StoreDocument),
    {
        let mut next = self.document.clone();
        update(&mut next);
        next.origins.retain(|_, entry| !entry.is_empty());

        ensure_parent_dir(&self.path)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, &next)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(&self.path)?;

        self.document = next;
        Ok(())
    }
}

impl PersistentStore for FileStore {
    fn save_keyset(
        &mut self,
        origin: &str,
        token: SessionToken,
        record: &LicenseRecord,
    ) -> StoreResult<()> {
        let stored = StoredLicense {
            key_set_id: BASE64_STANDARD.encode(record.key_set_id.as_bytes()),
            mime_type: record.mime_type.clone(),
            stored_at: record.stored_at,
        };
        self.commit(|doc| {
            doc.origins
                .entry(origin.to_string())
                .or_default()
                .licenses
                .insert(token, stored);
        })?;
        log!(debug, "Saved keyset for {} in origin '{}'", token, origin);
        Ok(())
    }

    fn load_keyset(&self, origin: &str, token: SessionToken) -> StoreResult<Option<LicenseRecord>> {
        let Some(stored) = self
            .document
            .origins
            .get(origin)
            .and_then(|entry| entry.licenses.get(&token))
        else {
            return Ok(None);
        };

        let corrupt = |detail: String| StoreError::Corrupt {
            origin: origin.to_string(),
            token,
            detail,
        };
        let key_set_id = BASE64_STANDARD
            .decode(&stored.key_set_id)
            .map_err(|e| corrupt(format!("keyset id is not base64: {}", e)))?;
        if key_set_id.is_empty() {
            return Err(corrupt("empty keyset id".to_string()));
        }
        Ok(Some(LicenseRecord {
            key_set_id: KeySetId::new(key_set_id),
            mime_type: stored.mime_type.clone(),
            stored_at: stored.stored_at,
        }))
    }

    fn clear_keyset(&mut self, origin: &str, token: SessionToken) -> StoreResult<()> {
        let present = self
            .document
            .origins
            .get(origin)
            .is_some_and(|entry| entry.licenses.contains_key(&token));
        if !present {
            return Ok(());
        }
        self.commit(|doc| {
            if let Some(entry) = doc.origins.get_mut(origin) {
                entry.licenses.remove(&token);
            }
        })?;
        log!(debug, "Cleared keyset for {} in origin '{}'", token, origin);
        Ok(())
    }

    fn mark_origin_provisioned(&mut self, origin: &str) -> StoreResult<()> {
        let now = unix_now();
        self.commit(|doc| {
            let entry = doc.origins.entry(origin.to_string()).or_default();
            entry.provisioned = true;
            entry.provisioned_at = Some(now);
        })
    }

    fn is_origin_provisioned(&self, origin: &str) -> StoreResult<bool> {
        Ok(self
            .document
            .origins
            .get(origin)
            .is_some_and(|entry| entry.provisioned))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{FileStore, LicenseRecord, MemoryStore, PersistentStore, StoreError};
    use crate::cdm::KeySetId;
    use crate::session::SessionToken;

    fn record(bytes: &[u8]) -> LicenseRecord {
        LicenseRecord::new(KeySetId::new(bytes.to_vec()), "video/mp4")
    }

    #[test]
    fn memory_store_is_namespaced_by_origin() {
        let mut store = MemoryStore::new();
        let token = SessionToken::generate();
        store
            .save_keyset("https://a.example", token, &record(b"ks"))
            .expect("save");

        assert!(store
            .load_keyset("https://b.example", token)
            .expect("load other origin")
            .is_none());
        let loaded = store
            .load_keyset("https://a.example", token)
            .expect("load")
            .expect("present");
        assert_eq!(loaded.key_set_id.as_bytes(), b"ks");

        store.clear_keyset("https://a.example", token).expect("clear");
        store.clear_keyset("https://a.example", token).expect("clear twice");
        assert!(store.is_empty());
    }

    #[test]
    fn memory_store_reports_empty_keyset_as_corrupt() {
        let mut store = MemoryStore::new();
        let token = SessionToken::generate();
        store.save_keyset("", token, &record(b"")).expect("save");
        assert!(matches!(
            store.load_keyset("", token),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("licenses.json");
        let token = SessionToken::generate();

        {
            let mut store = FileStore::open(&path).expect("open new");
            store
                .save_keyset("https://a.example", token, &record(&[0, 1, 2, 255]))
                .expect("save");
            store
                .mark_origin_provisioned("https://a.example")
                .expect("mark provisioned");
        }

        let store = FileStore::open(&path).expect("reopen");
        let loaded = store
            .load_keyset("https://a.example", token)
            .expect("load")
            .expect("present");
        assert_eq!(loaded.key_set_id.as_bytes(), &[0, 1, 2, 255]);
        assert_eq!(loaded.mime_type, "video/mp4");
        assert!(store.is_origin_provisioned("https://a.example").expect("flag"));
        assert!(!store.is_origin_provisioned("https://b.example").expect("flag"));
    }

    #[test]
    fn file_store_clear_removes_empty_origin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("licenses.json");
        let token = SessionToken::generate();

        let mut store = FileStore::open(&path).expect("open");
        store.save_keyset("o", token, &record(b"ks")).expect("save");
        assert_eq!(store.origins().count(), 1);

        store.clear_keyset("o", token).expect("clear");
        assert_eq!(store.origins().count(), 0);
        assert!(store.load_keyset("o", token).expect("load").is_none());

        let reopened = FileStore::open(&path).expect("reopen");
        assert_eq!(reopened.origins().count(), 0);
    }

    #[test]
    fn file_store_distinguishes_corrupt_from_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("licenses.json");
        let token = SessionToken::generate();
        let json = format!(
            r#"{{"version":1,"origins":{{"o":{{"licenses":{{"{}":{{"key_set_id":"***","mime_type":"video/mp4"}}}}}}}}}}"#,
            token
        );
        fs::write(&path, json).expect("write fixture");

        let store = FileStore::open(&path).expect("open");
        assert!(matches!(
            store.load_keyset("o", token),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(store
            .load_keyset("o", SessionToken::generate())
            .expect("absent")
            .is_none());
    }

    #[test]
    fn file_store_rejects_unparsable_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("licenses.json");
        fs::write(&path, "{ not json").expect("write fixture");
        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        // The store path is a directory, so persisting over it fails.
        let path = dir.path().join("occupied");
        fs::create_dir(&path).expect("mkdir");
        let token = SessionToken::generate();

        let mut store = FileStore::open(dir.path().join("missing.json")).expect("open");
        store.path = path;
        assert!(store.save_keyset("o", token, &record(b"ks")).is_err());
        assert!(store.load_keyset("o", token).expect("load").is_none());
    }
}
