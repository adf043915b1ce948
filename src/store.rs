//! Account Store
//!
//! Persistiert den SIP-Account als JSON. Der Session Manager selbst liest
//! und schreibt den Store nie; die App lädt den Account beim Start und
//! übergibt ihn per `configure_account`.
//!
//! ## Verwendung
//! ```no_run
//! use sip_session_manager::store::{AccountStore, FileAccountStore};
//!
//! let store = FileAccountStore::open_default()?;
//! if let Some(account) = store.load()? {
//!     println!("Account: {:?}", account);
//! }
//! # Ok::<(), sip_session_manager::store::StoreError>(())
//! ```

use crate::config::AccountConfig;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Could not determine app data directory")]
    NoDataDirectory,

    #[error("Account file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Account file is corrupt: {0}")]
    Format(#[from] serde_json::Error),
}

// ============================================================================
// ACCOUNT STORE
// ============================================================================

/// Key-Value-Ablage für den einen SIP-Account
pub trait AccountStore {
    /// `None` wenn noch kein Account gespeichert wurde
    fn load(&self) -> Result<Option<AccountConfig>, StoreError>;
    fn save(&self, account: &AccountConfig) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// Account als JSON-Datei
#[derive(Debug, Clone)]
pub struct FileAccountStore {
    path: PathBuf,
}

impl FileAccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Datei im App-Datenverzeichnis
    ///
    /// - Windows: `%APPDATA%/hausverwaltung/sip-session/data/account.json`
    /// - macOS: `~/Library/Application Support/com.hausverwaltung.sip-session/account.json`
    /// - Linux: `~/.local/share/sip-session/account.json`
    pub fn open_default() -> Result<Self, StoreError> {
        let dirs = directories::ProjectDirs::from("com", "hausverwaltung", "sip-session")
            .ok_or(StoreError::NoDataDirectory)?;
        Ok(Self::new(dirs.data_dir().join("account.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AccountStore for FileAccountStore {
    fn load(&self) -> Result<Option<AccountConfig>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)?;
        let account = serde_json::from_str(&json)?;
        tracing::debug!("Loaded account from {:?}", self.path);
        Ok(Some(account))
    }

    fn save(&self, account: &AccountConfig) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&self.path, serde_json::to_string_pretty(account)?)?;

        // Enthält das Passwort
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        tracing::info!("Account saved to {:?}", self.path);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;

    fn temp_store() -> FileAccountStore {
        let path = std::env::temp_dir()
            .join(format!("sip-session-{}", uuid::Uuid::new_v4()))
            .join("account.json");
        FileAccountStore::new(path)
    }

    #[test]
    fn test_save_and_load() {
        let store = temp_store();
        assert!(store.load().unwrap().is_none());

        let account = AccountConfig::new("4711", "geheim", "pbx.example.com")
            .with_transport(Transport::Tls);
        store.save(&account).unwrap();
        assert_eq!(store.load().unwrap(), Some(account));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_corrupt_file() {
        let store = temp_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        assert!(matches!(store.load(), Err(StoreError::Format(_))));
    }
}
