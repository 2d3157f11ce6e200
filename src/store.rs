//! The persistent encrypted store: one CMS envelope file per secret key
//! under `storage.dir`.
//!
//! Writes go to a temporary file in the target directory and are renamed
//! into place, so a concurrent reader observes either the previous envelope
//! or the new one, never a torn file. File modes derive from the configured
//! storage umask rather than process-wide umask state, which worker threads
//! could not touch safely.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::catalog::TokenCatalog;
use crate::envelope;
use crate::error::{KeeperError, Result};

const DEFAULT_UMASK: u32 = 0o077;

pub struct SecretStore {
    dir: PathBuf,
    file_mode: u32,
}

/// Secret keys are word characters only. The protocol parser already
/// enforces this; the store refuses anything else on its own so no caller
/// can smuggle a path component through.
pub fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl SecretStore {
    /// Open (creating if needed, intermediates included) the storage
    /// directory. `umask` masks the mode of every file created below it.
    pub fn open(dir: &Path, umask: Option<u32>) -> Result<SecretStore> {
        fs::create_dir_all(dir).map_err(|e| {
            KeeperError::Store(format!("cannot create storage dir {}: {e}", dir.display()))
        })?;
        Ok(SecretStore {
            dir: dir.to_path_buf(),
            file_mode: 0o666 & !umask.unwrap_or(DEFAULT_UMASK),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, key: &str) -> Result<PathBuf> {
        if !valid_key(key) {
            return Err(KeeperError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }

    /// True iff a readable slot for `key` exists.
    pub fn exists(&self, key: &str) -> bool {
        self.slot_path(key)
            .map(|path| fs::metadata(path).map(|m| m.is_file()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Envelope-encrypt `value` to the current token and atomically replace
    /// the slot.
    pub fn put(&self, catalog: &TokenCatalog, key: &str, value: &[u8]) -> Result<()> {
        let path = self.slot_path(key)?;
        let pem = envelope::seal(catalog.select_for_encrypt()?, value)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| KeeperError::Store(format!("cannot create temp slot: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(self.file_mode))
                .map_err(|e| KeeperError::Store(format!("cannot set slot mode: {e}")))?;
        }
        tmp.write_all(&pem)
            .and_then(|_| tmp.flush())
            .map_err(|e| KeeperError::Store(format!("cannot write slot '{key}': {e}")))?;
        tmp.persist(&path)
            .map_err(|e| KeeperError::Store(format!("cannot persist slot '{key}': {e}")))?;

        debug!(key, bytes = value.len(), "slot written");
        Ok(())
    }

    /// Read and decrypt a slot. `Ok(None)` means the key does not exist;
    /// a slot that exists but no token can open is an error.
    pub fn get(&self, catalog: &TokenCatalog, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.slot_path(key)?;
        let pem = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KeeperError::Store(format!(
                    "cannot read slot '{key}': {e}"
                )))
            }
        };
        envelope::open(catalog, &pem, key).map(Some)
    }

    /// Every valid slot name currently present, for cache preloading.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .map_err(|e| KeeperError::Store(format!("cannot scan storage dir: {e}")))?
        {
            let entry = entry.map_err(|e| KeeperError::Store(e.to_string()))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if valid_key(name) {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
