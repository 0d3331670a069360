// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Local key cache: one `<name>.key` file per catalog entry.
//!
//! ## Match Policy
//!
//! A stored key is considered current when its file **contains** the secret
//! ([`KeyMatch::Contains`]). This is the historical behaviour and the
//! default: files written by older tooling may carry a trailing newline or
//! other framing around the secret. It also means a file that happens to
//! contain another key as a substring is treated as up to date.
//! [`KeyMatch::Exact`] switches to byte equality for deployments that do not
//! need the compatibility.
//!
//! Key files are written with mode `0600` and replaced atomically via a
//! temporary file and rename. No backup of the previous content is kept.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use super::StoragePaths;

/// Permission bits for stored keys.
const KEY_FILE_MODE: u32 = 0o600;

/// Permission bits for the storage directory.
const STORAGE_DIR_MODE: u32 = 0o700;

/// Error type for local key cache operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyCacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid key name: {0:?}")]
    InvalidName(String),
}

pub type KeyCacheResult<T> = Result<T, KeyCacheError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> KeyCacheError + '_ {
    move |source| KeyCacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// How an existing key file is compared against the current secret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyMatch {
    /// File content contains the secret as a substring.
    #[default]
    Contains,
    /// File content equals the secret.
    Exact,
}

impl KeyMatch {
    fn matches(self, content: &[u8], secret: &[u8]) -> bool {
        match self {
            KeyMatch::Exact => content == secret,
            KeyMatch::Contains => {
                secret.is_empty() || content.windows(secret.len()).any(|w| w == secret)
            }
        }
    }
}

impl std::str::FromStr for KeyMatch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "contains" => Ok(KeyMatch::Contains),
            "exact" => Ok(KeyMatch::Exact),
            other => Err(format!("unknown key match policy '{other}'")),
        }
    }
}

/// A key already materialised on local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalKeyEntry {
    pub name: String,
    pub content: Vec<u8>,
    pub path: PathBuf,
}

/// Result of [`KeyCache::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyPresent,
    Written,
}

/// Idempotent on-disk store of secrets keyed by name.
#[derive(Debug, Clone)]
pub struct KeyCache {
    paths: StoragePaths,
    policy: KeyMatch,
}

impl KeyCache {
    pub fn new(paths: StoragePaths, policy: KeyMatch) -> Self {
        Self { paths, policy }
    }

    /// Get the storage paths.
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Create the storage directory (mode `0700`) if it does not exist.
    ///
    /// Safe to call multiple times.
    pub fn initialize(&self) -> KeyCacheResult<()> {
        let root = self.paths.root();
        fs::create_dir_all(root).map_err(io_err(root))?;
        #[cfg(unix)]
        fs::set_permissions(root, fs::Permissions::from_mode(STORAGE_DIR_MODE))
            .map_err(io_err(root))?;
        Ok(())
    }

    /// Path of the file backing `name`, rejecting names that would escape
    /// the storage root.
    pub fn key_path(&self, name: &str) -> KeyCacheResult<PathBuf> {
        validate_name(name)?;
        Ok(self.paths.key_file(name))
    }

    /// Read a stored key, if present.
    pub fn read_entry(&self, name: &str) -> KeyCacheResult<Option<LocalKeyEntry>> {
        let path = self.key_path(name)?;
        match fs::read(&path) {
            Ok(content) => Ok(Some(LocalKeyEntry {
                name: name.to_string(),
                content,
                path,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeyCacheError::Io { path, source: e }),
        }
    }

    /// Whether the stored copy of `name` already holds `secret`.
    pub fn has_key(&self, name: &str, secret: &str) -> KeyCacheResult<bool> {
        Ok(self
            .read_entry(name)?
            .is_some_and(|entry| self.policy.matches(&entry.content, secret.as_bytes())))
    }

    /// Write `secret` as the content of `name`, replacing any previous value.
    pub fn store_key(&self, name: &str, secret: &str) -> KeyCacheResult<PathBuf> {
        let path = self.key_path(name)?;
        let temp_path = self.paths.key_temp_file(name);

        let written = write_temp(&temp_path, secret)
            .and_then(|()| fs::rename(&temp_path, &path).map_err(io_err(&path)));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        Ok(path)
    }

    /// Store `secret` under `name` unless an up-to-date copy already exists.
    pub fn ensure(&self, name: &str, secret: &str) -> KeyCacheResult<EnsureOutcome> {
        if self.has_key(name, secret)? {
            tracing::debug!(key = %name, "Key already stored locally");
            return Ok(EnsureOutcome::AlreadyPresent);
        }
        let path = self.store_key(name, secret)?;
        tracing::info!(key = %name, path = %path.display(), "Wrote key to local storage");
        Ok(EnsureOutcome::Written)
    }
}

/// Write `secret` to `temp_path` at the key file mode and flush it to disk.
fn write_temp(temp_path: &Path, secret: &str) -> KeyCacheResult<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(KEY_FILE_MODE);
    let mut file = options.open(temp_path).map_err(io_err(temp_path))?;
    // The mode passed to open() only applies to newly created files.
    #[cfg(unix)]
    file.set_permissions(fs::Permissions::from_mode(KEY_FILE_MODE))
        .map_err(io_err(temp_path))?;
    file.write_all(secret.as_bytes()).map_err(io_err(temp_path))?;
    file.sync_all().map_err(io_err(temp_path))?;
    Ok(())
}

fn validate_name(name: &str) -> KeyCacheResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(KeyCacheError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache(policy: KeyMatch) -> (KeyCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = KeyCache::new(StoragePaths::new(dir.path().join("keys")), policy);
        cache.initialize().expect("Failed to initialize test cache");
        (cache, dir)
    }

    #[test]
    fn missing_key_is_not_known() {
        let (cache, _dir) = test_cache(KeyMatch::Contains);
        assert!(!cache.has_key("db-prod", "SECRET").unwrap());
        assert!(cache.read_entry("db-prod").unwrap().is_none());
    }

    #[test]
    fn store_then_has_key() {
        let (cache, _dir) = test_cache(KeyMatch::Contains);
        let path = cache.store_key("db-prod", "SECRETVALUE").unwrap();
        assert_eq!(path, cache.paths().key_file("db-prod"));
        assert!(cache.has_key("db-prod", "SECRETVALUE").unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"SECRETVALUE");
    }

    #[test]
    fn contains_policy_accepts_substring() {
        let (cache, _dir) = test_cache(KeyMatch::Contains);
        cache.store_key("db-prod", "abcXYZ").unwrap();
        assert!(cache.has_key("db-prod", "XYZ").unwrap());
        assert!(!cache.has_key("db-prod", "XYZW").unwrap());
    }

    #[test]
    fn exact_policy_rejects_substring() {
        let (cache, _dir) = test_cache(KeyMatch::Exact);
        cache.store_key("db-prod", "abcXYZ").unwrap();
        assert!(!cache.has_key("db-prod", "XYZ").unwrap());
        assert!(cache.has_key("db-prod", "abcXYZ").unwrap());
    }

    #[test]
    fn ensure_does_not_rewrite_known_key() {
        let (cache, _dir) = test_cache(KeyMatch::Contains);
        assert_eq!(
            cache.ensure("db-prod", "SECRET").unwrap(),
            EnsureOutcome::Written
        );
        let path = cache.paths().key_file("db-prod");
        let before = fs::metadata(&path).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(
            cache.ensure("db-prod", "SECRET").unwrap(),
            EnsureOutcome::AlreadyPresent
        );
        let after = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn ensure_overwrites_changed_key() {
        let (cache, _dir) = test_cache(KeyMatch::Contains);
        cache.ensure("db-prod", "OLD").unwrap();
        assert_eq!(
            cache.ensure("db-prod", "NEW").unwrap(),
            EnsureOutcome::Written
        );
        let entry = cache.read_entry("db-prod").unwrap().unwrap();
        assert_eq!(entry.content, b"NEW");
        assert!(!cache.paths().key_temp_file("db-prod").exists());
    }

    #[cfg(unix)]
    #[test]
    fn stored_key_is_owner_only() {
        let (cache, _dir) = test_cache(KeyMatch::Contains);
        let path = cache.store_key("db-prod", "SECRET").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn rejects_path_traversal_names() {
        let (cache, _dir) = test_cache(KeyMatch::Contains);
        for name in ["../escape", "a/b", "", ".hidden"] {
            assert!(matches!(
                cache.store_key(name, "x"),
                Err(KeyCacheError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn key_match_parses() {
        assert_eq!("contains".parse::<KeyMatch>().unwrap(), KeyMatch::Contains);
        assert_eq!("EXACT".parse::<KeyMatch>().unwrap(), KeyMatch::Exact);
        assert!("fuzzy".parse::<KeyMatch>().is_err());
    }

    #[test]
    fn failed_store_removes_temp_file() {
        let (cache, dir) = test_cache(KeyMatch::Contains);
        // A non-empty directory where the key file belongs makes the rename fail.
        let blocker = dir.path().join("keys").join("db-prod.key");
        fs::create_dir_all(blocker.join("inner")).unwrap();

        assert!(matches!(
            cache.store_key("db-prod", "SECRET"),
            Err(KeyCacheError::Io { .. })
        ));
        assert!(!cache.paths().key_temp_file("db-prod").exists());
    }
}
