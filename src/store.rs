//! Durable storage for the session record.
//!
//! The session manager is the only writer. Every transition produces one full
//! snapshot, written atomically so a crash leaves either the previous or the
//! next record on disk, never a torn one.

use sessionsafe_types::session::SessionRecord;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Session record could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Session storage is unavailable: {0}")]
    Unavailable(String),
}

/// Persists a single session record.
pub trait SessionStore: Send + Sync {
    /// Replaces the stored record.
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Returns the stored record, if any.
    fn load(&self) -> Result<Option<SessionRecord>, StoreError>;

    /// Removes the stored record. Succeeds if there is none.
    fn clear(&self) -> Result<(), StoreError>;
}

impl<T: SessionStore + ?Sized> SessionStore for std::sync::Arc<T> {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        (**self).save(record)
    }

    fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
        (**self).load()
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
}

/// JSON file storage.
///
/// Writes go to a sibling temp file which is fsynced and renamed over the
/// target. On Unix the file is created with `0600` permissions since the
/// record carries the session's private key.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn create_private(path: &Path) -> std::io::Result<fs::File> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = Zeroizing::new(serde_json::to_vec_pretty(record)?);

        let temp_path = self.temp_path();
        let mut file = Self::create_private(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;

        // A leftover temp file keeps its old mode; `mode` applies only on creation.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        tracing::debug!(path = %self.path.display(), nonce = record.nonce, "Session record saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&contents)?;
        Ok(Some(record))
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Session record cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process storage holding the serialized record.
///
/// Round-trips through JSON so it behaves like the file store, including
/// serialization failures.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    bytes: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Zeroizing<Vec<u8>>>>, StoreError> {
        self.bytes
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let json = Zeroizing::new(serde_json::to_vec(record)?);
        *self.slot()? = Some(json);
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
        match self.slot()?.as_ref() {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot()? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes};
    use sessionsafe_types::amount::Amount;
    use sessionsafe_types::session::{ActionRecord, KeyMaterial, SessionId, SessionStatus};
    use sessionsafe_types::timestamp::UnixTimestamp;

    fn record() -> SessionRecord {
        SessionRecord {
            version: SessionRecord::CURRENT_VERSION,
            session_id: SessionId::new([1u8; 32]),
            status: SessionStatus::Open,
            collateral: Amount::parse("10.00").unwrap(),
            balance: Amount::parse("9.98").unwrap(),
            nonce: 1,
            actions: vec![ActionRecord {
                nonce: 0,
                description: "API Call: /v1/quote".into(),
                cost: Amount::parse("0.02").unwrap(),
                signature: Bytes::from(vec![0x1b; 65]),
                timestamp: UnixTimestamp::from_secs(1_700_000_000),
            }],
            signer: Address::repeat_byte(0x33),
            signing_key: Some(KeyMaterial::new([0x07; 32])),
            pending_withdrawal: None,
            withdrawal: None,
        }
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("session.json"));
        assert!(store.load().unwrap().is_none());

        store.save(&record()).unwrap();
        assert_eq!(store.load().unwrap(), Some(record()));
        assert!(!store.temp_path().exists());

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_file_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("nested/session.json"));
        store.save(&record()).unwrap();

        let mut next = record();
        next.status = SessionStatus::Closing;
        store.save(&next).unwrap();
        assert_eq!(store.load().unwrap().unwrap().status, SessionStatus::Closing);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("session.json"));
        store.save(&record()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"{not json").unwrap();
        let store = FileSessionStore::new(path);
        assert!(matches!(store.load(), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySessionStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&record()).unwrap();
        assert_eq!(store.load().unwrap(), Some(record()));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
