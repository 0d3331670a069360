// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path constants and utilities for the local key storage layout.

use std::path::{Path, PathBuf};

/// Default directory holding materialised keys.
pub const DEFAULT_STORAGE_ROOT: &str = "/etc/keymaster/keys";

/// Extension of every stored key file.
pub const KEY_EXTENSION: &str = "key";

/// Storage path utilities for the local key directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DEFAULT_STORAGE_ROOT)
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory for all stored keys.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name of a stored key (`<name>.key`).
    pub fn key_file_name(name: &str) -> String {
        format!("{name}.{KEY_EXTENSION}")
    }

    /// Path to a specific key file.
    pub fn key_file(&self, name: &str) -> PathBuf {
        self.root.join(Self::key_file_name(name))
    }

    /// Scratch path used while atomically replacing a key file.
    pub fn key_temp_file(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{name}.{KEY_EXTENSION}.tmp"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_use_keymaster_root() {
        let paths = StoragePaths::default();
        assert_eq!(paths.root(), Path::new("/etc/keymaster/keys"));
    }

    #[test]
    fn key_paths_are_correct() {
        let paths = StoragePaths::new("/tmp/test-keys");
        assert_eq!(
            paths.key_file("db-prod"),
            PathBuf::from("/tmp/test-keys/db-prod.key")
        );
        assert_eq!(
            paths.key_temp_file("db-prod"),
            PathBuf::from("/tmp/test-keys/.db-prod.key.tmp")
        );
        assert_eq!(StoragePaths::key_file_name("api-staging"), "api-staging.key");
    }
}
