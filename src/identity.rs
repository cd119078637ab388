//! Voter identity resolution and local persistent storage
//!
//! A voter is identified by their account id when signed in, otherwise by
//! an anonymous token generated once and kept in local storage. Storage
//! failures fail soft: a fresh token is returned and regenerated next time.

use crate::config::IdentityConfig;
use crate::types::VoterId;
use crate::{Result, storage_error};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Local storage key of the anonymous token
pub const VOTER_TOKEN_KEY: &str = "voter_token";

/// Client-local key/value persistence
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Storage that lives as long as the process
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| storage_error!("Memory storage read error"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| storage_error!("Memory storage write error"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| storage_error!("Memory storage write error"))?;
        entries.remove(key);
        Ok(())
    }
}

/// Storage persisted as a JSON object in a single file
///
/// Writes go to a sibling temp file and are renamed into place.
pub struct FileStorage {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| storage_error!("File storage lock poisoned"))?;
        let mut entries = self.load()?;
        apply(&mut entries);
        self.store(&entries)
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| storage_error!("File storage lock poisoned"))?;
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Resolves the voter identity for the current browsing session
pub struct IdentityResolver {
    storage: Arc<dyn LocalStorage>,
    account: RwLock<Option<VoterId>>,
    /// Held from reading the token to persisting a new one
    issuing: Mutex<()>,
}

impl IdentityResolver {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            storage,
            account: RwLock::new(None),
            issuing: Mutex::new(()),
        }
    }

    /// Resolver backed by process memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// File-backed when a storage path is configured, in-memory otherwise
    pub fn from_config(config: &IdentityConfig) -> Self {
        match &config.storage_path {
            Some(path) => Self::new(Arc::new(FileStorage::new(path.clone()))),
            None => Self::in_memory(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn LocalStorage> {
        &self.storage
    }

    /// Use an authenticated account id from now on
    pub fn sign_in(&self, account_id: &str) -> Result<()> {
        let account = VoterId::new(account_id)?;
        let mut current = self
            .account
            .write()
            .map_err(|_| storage_error!("Identity state write error"))?;
        *current = Some(account);
        Ok(())
    }

    /// Fall back to the anonymous token
    pub fn sign_out(&self) {
        if let Ok(mut current) = self.account.write() {
            *current = None;
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.account
            .read()
            .map(|current| current.is_some())
            .unwrap_or(false)
    }

    /// The current voter identity
    ///
    /// The account id takes precedence over the anonymous token.
    pub fn resolve(&self) -> VoterId {
        if let Ok(current) = self.account.read() {
            if let Some(account) = current.as_ref() {
                return account.clone();
            }
        }
        self.anonymous_token()
    }

    /// The persisted anonymous token, created on first use
    pub fn anonymous_token(&self) -> VoterId {
        let _issuing = match self.issuing.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match self.storage.get(VOTER_TOKEN_KEY) {
            Ok(Some(raw)) => match VoterId::new(raw) {
                Ok(token) => return token,
                Err(_) => tracing::warn!("⚠️ Ignoring blank stored voter token"),
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("⚠️ Voter token storage unavailable, using ephemeral token: {}", e);
                return VoterId::anonymous();
            }
        }

        let token = VoterId::anonymous();
        if let Err(e) = self.storage.set(VOTER_TOKEN_KEY, token.as_str()) {
            tracing::warn!("⚠️ Failed to persist voter token: {}", e);
        } else {
            tracing::debug!("🆔 New anonymous voter token {}", token.fingerprint());
        }
        token
    }
}
