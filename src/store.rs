//! Persisted credentials: access token, refresh token, cached profile.
//!
//! DESIGN
//! ======
//! The three values are one unit: they are saved together and cleared
//! together. `FileStore` keeps them in a single JSON file written via
//! temp-file + rename, so a reader never observes a half-written or
//! half-cleared session.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::types::User;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
}

impl StoredSession {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.user.is_none()
    }
}

pub trait CredentialStore: Send + Sync {
    /// Load the stored session. A missing store loads as empty.
    fn load(&self) -> Result<StoredSession, ClientError>;

    fn save(&self, session: &StoredSession) -> Result<(), ClientError>;

    /// Remove every stored value at once. Idempotent.
    fn clear(&self) -> Result<(), ClientError>;
}

// =============================================================================
// MEMORY
// =============================================================================

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoredSession>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(session: StoredSession) -> Self {
        Self { inner: Mutex::new(session) }
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Result<StoredSession, ClientError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, session: &StoredSession) -> Result<(), ClientError> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = session.clone();
        Ok(())
    }

    fn clear(&self) -> Result<(), ClientError> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = StoredSession::default();
        Ok(())
    }
}

// =============================================================================
// FILE
// =============================================================================

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CredentialStore for FileStore {
    fn load(&self) -> Result<StoredSession, ClientError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoredSession::default()),
            Err(e) => return Err(store_error(&self.path, &e)),
        };
        serde_json::from_slice(&raw).map_err(|e| store_error(&self.path, &e))
    }

    fn save(&self, session: &StoredSession) -> Result<(), ClientError> {
        let body = serde_json::to_vec_pretty(session).map_err(|e| store_error(&self.path, &e))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| store_error(parent, &e))?;
        }
        let tmp = self.temp_path();
        std::fs::write(&tmp, body).map_err(|e| store_error(&tmp, &e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| store_error(&self.path, &e))
    }

    fn clear(&self) -> Result<(), ClientError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(&self.path, &e)),
        }
    }
}

fn store_error(path: &Path, err: &dyn std::fmt::Display) -> ClientError {
    ClientError::Store(format!("{}: {err}", path.display()))
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
