//! Durable key-value storage for credentials and rate-limit bookkeeping.
//!
//! The session manager and OTP rate limiter only ever talk to the
//! [`CredentialStore`] trait. The app injects [`FileStore`] on device;
//! tests inject [`MemoryStore`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ApiError, Result};

/// Storage keys. Names are kept stable across app releases so an upgrade
/// does not log existing users out.
pub mod keys {
    /// Access token (bearer credential).
    pub const ACCESS_TOKEN: &str = "authToken";
    /// Refresh token.
    pub const REFRESH_TOKEN: &str = "refreshToken";
    /// Cached patient profile (JSON).
    pub const CURRENT_PATIENT: &str = "currentPatient";
    /// Per-phone OTP rate-limit record (JSON), suffixed with the
    /// normalized phone number.
    pub const OTP_ATTEMPTS_PREFIX: &str = "otpAttempts:";
}

/// Device-local key-value store for credentials.
///
/// Single-writer-at-a-time per key; interleaved writers resolve
/// last-write-wins.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store. State dies with the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// File-backed store: one JSON object per device, loaded at open and
/// rewritten on every mutation.
///
/// Writes go through a temp file and a rename so a crash mid-write leaves
/// the previous snapshot intact.
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or create) the store at `path`. A missing file is an empty
    /// store, not an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| ApiError::Storage(format!("corrupt store file: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(ApiError::Storage(e.to_string())),
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    async fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        let raw = serde_json::to_string(entries)
            .map_err(|e| ApiError::Storage(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| ApiError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ApiError::Storage(e.to_string()))
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        self.persist(&entries).await
    }
}
