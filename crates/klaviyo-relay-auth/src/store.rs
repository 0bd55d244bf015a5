//! Credential Store: the on-disk snapshot of an authenticated session.
//!
//! One JSON document per account. Writes go to a sibling temp file that is
//! renamed over the target, so readers never observe a half-written file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cookies::StoredCookie;
use crate::error::{AuthError, Result};

/// Format version written into every snapshot.
pub const STORE_VERSION: &str = "1";

// ============================================================================
// SessionState
// ============================================================================

/// Serialized form of a logged-in session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(rename = "baseURL", alias = "baseUrl")]
    pub base_url: String,
    /// Request timeout in milliseconds.
    pub timeout: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub with_credentials: bool,
    pub max_redirects: usize,
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
    pub saved_at: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    STORE_VERSION.to_string()
}

impl SessionState {
    /// Summary for display.
    pub fn info(&self) -> StoreInfo {
        let age_secs = (Utc::now() - self.saved_at).num_seconds().max(0) as u64;
        StoreInfo {
            saved_at: self.saved_at,
            age_secs,
            cookie_count: self.cookies.len(),
            base_url: self.base_url.clone(),
        }
    }
}

/// Snapshot summary shown by `status`.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub saved_at: DateTime<Utc>,
    pub age_secs: u64,
    pub cookie_count: usize,
    pub base_url: String,
}

impl StoreInfo {
    pub fn age_display(&self) -> String {
        let hours = self.age_secs / 3600;
        let minutes = (self.age_secs % 3600) / 60;
        format!("{}h {}m ago", hours, minutes)
    }
}

// ============================================================================
// CredentialStore
// ============================================================================

/// File-backed Credential Store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Create a store at `path`. Nothing is touched until the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a snapshot exists.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read and parse the snapshot.
    pub fn load(&self) -> Result<SessionState> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            AuthError::Store(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            AuthError::Serialization(format!(
                "Failed to parse {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Write the snapshot atomically.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                AuthError::Store(format!("Failed to create store directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(state).map_err(|e| {
            AuthError::Serialization(format!("Failed to serialize session: {}", e))
        })?;

        let tmp = self.temp_path();
        std::fs::write(&tmp, json)
            .map_err(|e| AuthError::Store(format!("Failed to write {}: {}", tmp.display(), e)))?;

        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(AuthError::Store(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            )));
        }

        tracing::info!(
            path = %self.path.display(),
            cookies = state.cookies.len(),
            "Session saved"
        );
        Ok(())
    }

    /// Last modification time, if the file exists.
    pub fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session.json".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
    }
}
