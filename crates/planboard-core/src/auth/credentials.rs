//! Durable storage for the session record.
//!
//! The credential and its claims are one record and are always written
//! together: a reader sees the old pair or the new pair, never a mix.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};

use crate::config::{Config, StorageBackend};
use crate::models::IdentityClaims;

const SERVICE_NAME: &str = "planboard";

/// Keychain account holding the session record
const KEYRING_ACCOUNT: &str = "session";

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// Lock file serializing writers across processes
const LOCK_FILE: &str = "session.lock";

/// Opaque bearer credential. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Absent when the server manages the session through a cookie.
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub claims: Option<IdentityClaims>,
    pub saved_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn new(credential: Option<Credential>, claims: IdentityClaims) -> Self {
        Self {
            credential,
            claims: Some(claims),
            saved_at: Utc::now(),
        }
    }

    /// The same write, as opposed to a later one by any client.
    pub fn is_same_record(&self, other: &StoredSession) -> bool {
        self.saved_at == other.saved_at && self.credential == other.credential
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize session")
    }

    fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("Failed to parse stored session")
    }
}

/// Persistence for one session per client.
///
/// `get` returns `Ok(None)` when nothing is stored and an error when the
/// stored record cannot be read. Several clients may share one store, so
/// a client ending its own session uses `clear_if` with the record it
/// wrote or restored.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<Option<StoredSession>>;

    /// Replace the record, returning what was written.
    fn set(&self, credential: Option<&Credential>, claims: &IdentityClaims) -> Result<StoredSession>;

    fn clear(&self) -> Result<()>;

    /// Remove the record only while it is still `expected`. An unreadable
    /// record is removed too. Returns whether anything was removed.
    fn clear_if(&self, expected: &StoredSession) -> Result<bool>;
}

/// Open the store selected by configuration.
pub fn open(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match config.storage {
        StorageBackend::File => Arc::new(FileCredentialStore::new(config.data_dir()?)),
        StorageBackend::Keyring => Arc::new(
            KeyringCredentialStore::new(SERVICE_NAME).with_lock_dir(config.data_dir()?),
        ),
        StorageBackend::Memory => Arc::new(MemoryCredentialStore::new()),
    };
    Ok(store)
}

// ============================================================================
// Cross-process lock
// ============================================================================

/// Advisory lock on a file next to the record. Every write and every
/// compare-then-clear runs while it is held.
struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(LOCK_FILE),
        }
    }

    fn hold<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create session directory")?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("Failed to open lock file {}", self.path.display()))?;
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock.write().context("Failed to lock session store")?;
        f()
    }
}

// ============================================================================
// File backing
// ============================================================================

pub struct FileCredentialStore {
    path: PathBuf,
    lock: SessionLock,
}

impl FileCredentialStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            lock: SessionLock::in_dir(&dir),
            path: dir.join(SESSION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    fn remove(&self) -> Result<()> {
        remove_if_exists(&self.path).context("Failed to remove session file")
    }

    /// Write to a private temporary sibling, then rename over the record.
    fn replace(&self, contents: &str) -> Result<()> {
        let tmp = self.temp_path();
        remove_if_exists(&tmp).context("Failed to remove stale session temp file")?;

        let written = write_private(&tmp, contents)
            .context("Failed to write session file")
            .and_then(|()| fs::rename(&tmp, &self.path).context("Failed to replace session file"));
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Result<Option<StoredSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(&self.path).context("Failed to read session file")?;
        StoredSession::from_json(&contents).map(Some)
    }

    fn set(&self, credential: Option<&Credential>, claims: &IdentityClaims) -> Result<StoredSession> {
        let record = StoredSession::new(credential.cloned(), claims.clone());
        let contents = record.to_json()?;

        // Rename is atomic on the same filesystem.
        self.lock.hold(|| self.replace(&contents))?;
        Ok(record)
    }

    fn clear(&self) -> Result<()> {
        self.lock.hold(|| self.remove())
    }

    fn clear_if(&self, expected: &StoredSession) -> Result<bool> {
        self.lock.hold(|| match self.get() {
            Ok(Some(current)) if !current.is_same_record(expected) => Ok(false),
            Ok(None) => Ok(false),
            Ok(Some(_)) | Err(_) => {
                self.remove()?;
                Ok(true)
            }
        })
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create `path` readable by the owner only, before any byte is written.
fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()
}

// ============================================================================
// Keychain backing
// ============================================================================

/// Keeps the whole record in a single OS keychain entry.
pub struct KeyringCredentialStore {
    service: String,
    lock: Option<SessionLock>,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            lock: None,
        }
    }

    /// Serialize writers from other processes through a lock file in `dir`.
    pub fn with_lock_dir(mut self, dir: PathBuf) -> Self {
        self.lock = Some(SessionLock::in_dir(&dir));
        self
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match &self.lock {
            Some(lock) => lock.hold(f),
            None => f(),
        }
    }

    fn delete(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, KEYRING_ACCOUNT).context("Failed to create keyring entry")
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self) -> Result<Option<StoredSession>> {
        match self.entry()?.get_password() {
            Ok(contents) => StoredSession::from_json(&contents).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve session from keychain"),
        }
    }

    fn set(&self, credential: Option<&Credential>, claims: &IdentityClaims) -> Result<StoredSession> {
        let record = StoredSession::new(credential.cloned(), claims.clone());
        let contents = record.to_json()?;
        self.locked(|| {
            self.entry()?
                .set_password(&contents)
                .context("Failed to store session in keychain")
        })?;
        Ok(record)
    }

    fn clear(&self) -> Result<()> {
        self.locked(|| self.delete())
    }

    fn clear_if(&self, expected: &StoredSession) -> Result<bool> {
        self.locked(|| match self.get() {
            Ok(Some(current)) if !current.is_same_record(expected) => Ok(false),
            Ok(None) => Ok(false),
            Ok(Some(_)) | Err(_) => {
                self.delete()?;
                Ok(true)
            }
        })
    }
}

// ============================================================================
// In-memory backing
// ============================================================================

/// Process-local store. Holds the serialized record so reads go through the
/// same parsing path as the durable backings.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with raw record contents, valid or not.
    pub fn with_raw(contents: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(contents.into())),
        }
    }

    pub fn raw(&self) -> Option<String> {
        self.slot().clone()
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<StoredSession>> {
        match self.raw() {
            Some(contents) => StoredSession::from_json(&contents).map(Some),
            None => Ok(None),
        }
    }

    fn set(&self, credential: Option<&Credential>, claims: &IdentityClaims) -> Result<StoredSession> {
        let record = StoredSession::new(credential.cloned(), claims.clone());
        *self.slot() = Some(record.to_json()?);
        Ok(record)
    }

    fn clear(&self) -> Result<()> {
        *self.slot() = None;
        Ok(())
    }

    fn clear_if(&self, expected: &StoredSession) -> Result<bool> {
        let mut slot = self.slot();
        let Some(contents) = slot.as_deref() else {
            return Ok(false);
        };
        match StoredSession::from_json(contents) {
            Ok(current) if !current.is_same_record(expected) => Ok(false),
            _ => {
                *slot = None;
                Ok(true)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
