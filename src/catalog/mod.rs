// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Catalog
//!
//! The catalog is a directory of encrypted items, one JSON file each:
//!
//! ```text
//! {catalog_dir}/{catalog_name}/
//!   db-prod.json        # { "id": "db-prod", "destination": {..}, "key": {..} }
//!   api-staging.json
//! ```
//!
//! Item names end in `-<environment>`; a node only decrypts the items of its
//! own environment. A usable item must decrypt to string `destination` and
//! `key` fields. Anything else is reported and skipped.

pub mod decrypt;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::KeyRecord;

pub use decrypt::{EncryptedValue, MasterKey};

/// Field holding the destination selector.
pub const DESTINATION_FIELD: &str = "destination";

/// Field holding the secret.
pub const KEY_FIELD: &str = "key";

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("master key not found at '{}'", path.display())]
    MissingMasterKey { path: PathBuf },

    #[error("master key is empty")]
    EmptyMasterKey,

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported encrypted field format (cipher {cipher}, version {version})")]
    UnsupportedFormat { cipher: String, version: u32 },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("catalog item {item} is missing fields: {}", missing.join(", "))]
    MissingFields {
        item: String,
        missing: Vec<&'static str>,
    },

    #[error("catalog item {item}: field '{field}' is not a string")]
    InvalidField { item: String, field: &'static str },

    #[error("catalog item {item}: field '{field}': {source}")]
    Field {
        item: String,
        field: String,
        #[source]
        source: Box<CatalogError>,
    },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

// =============================================================================
// Items
// =============================================================================

/// A catalog item as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedItem {
    pub id: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, EncryptedValue>,
}

impl EncryptedItem {
    /// Seal a set of plaintext fields into a new item.
    pub fn seal(
        id: impl Into<String>,
        fields: &BTreeMap<String, serde_json::Value>,
        master: &MasterKey,
    ) -> CatalogResult<Self> {
        let mut sealed = BTreeMap::new();
        for (name, value) in fields {
            sealed.insert(name.clone(), master.seal_value(value)?);
        }
        Ok(Self {
            id: id.into(),
            fields: sealed,
        })
    }

    /// Decrypt every field.
    pub fn open(&self, master: &MasterKey) -> CatalogResult<BTreeMap<String, serde_json::Value>> {
        let mut plain = BTreeMap::new();
        for (name, field) in &self.fields {
            let value = master.open_value(field).map_err(|e| CatalogError::Field {
                item: self.id.clone(),
                field: name.clone(),
                source: Box::new(e),
            })?;
            plain.insert(name.clone(), value);
        }
        Ok(plain)
    }

    /// Decrypt and validate into a [`KeyRecord`].
    pub fn to_key_record(&self, master: &MasterKey) -> CatalogResult<KeyRecord> {
        let plain = self.open(master)?;

        let missing: Vec<&'static str> = [DESTINATION_FIELD, KEY_FIELD]
            .into_iter()
            .filter(|f| !plain.contains_key(*f))
            .collect();
        if !missing.is_empty() {
            return Err(CatalogError::MissingFields {
                item: self.id.clone(),
                missing,
            });
        }

        let string_field = |field: &'static str| -> CatalogResult<String> {
            plain
                .get(field)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| CatalogError::InvalidField {
                    item: self.id.clone(),
                    field,
                })
        };

        Ok(KeyRecord::new(
            self.id.clone(),
            string_field(DESTINATION_FIELD)?,
            string_field(KEY_FIELD)?,
        ))
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Whether an item name belongs to `environment` (`<name>-<environment>`).
pub fn belongs_to_environment(item: &str, environment: &str) -> bool {
    item.strip_suffix(environment)
        .is_some_and(|rest| rest.ends_with('-'))
}

/// A named catalog on local disk.
#[derive(Debug, Clone)]
pub struct Catalog {
    dir: PathBuf,
}

impl Catalog {
    pub fn new(catalog_dir: impl AsRef<Path>, catalog_name: &str) -> Self {
        Self {
            dir: catalog_dir.as_ref().join(catalog_name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_path(&self, item: &str) -> PathBuf {
        self.dir.join(format!("{item}.json"))
    }

    /// List all item names, sorted. A missing catalog is empty.
    pub fn item_names(&self) -> CatalogResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CatalogError::Io {
                    path: self.dir.clone(),
                    source: e,
                })
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CatalogError::Io {
                path: self.dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Item names for one environment, sorted.
    pub fn environment_items(&self, environment: &str) -> CatalogResult<Vec<String>> {
        Ok(self
            .item_names()?
            .into_iter()
            .filter(|name| belongs_to_environment(name, environment))
            .collect())
    }

    /// Read one encrypted item.
    pub fn load_item(&self, item: &str) -> CatalogResult<EncryptedItem> {
        let path = self.item_path(item);
        let bytes = fs::read(&path).map_err(|e| CatalogError::Io {
            path: path.clone(),
            source: e,
        })?;
        let mut parsed: EncryptedItem = serde_json::from_slice(&bytes)?;
        // The file name is authoritative for the key name.
        parsed.id = item.to_string();
        Ok(parsed)
    }

    /// Read and decrypt one item into a [`KeyRecord`].
    pub fn load_key(&self, item: &str, master: &MasterKey) -> CatalogResult<KeyRecord> {
        self.load_item(item)?.to_key_record(master)
    }

    /// Write an item (used by operators and tests to populate a catalog).
    pub fn write_item(&self, item: &EncryptedItem) -> CatalogResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| CatalogError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        let path = self.item_path(&item.id);
        let json = serde_json::to_vec_pretty(item)?;
        fs::write(&path, json).map_err(|e| CatalogError::Io { path, source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn environment_suffix_matching() {
        assert!(belongs_to_environment("db-prod", "prod"));
        assert!(belongs_to_environment("web-db-prod", "prod"));
        assert!(!belongs_to_environment("db-preprod", "prod"));
        assert!(!belongs_to_environment("prod", "prod"));
        assert!(!belongs_to_environment("db-prod-old", "prod"));
    }

    #[test]
    fn lists_environment_items_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path(), "keymaster");
        let master = MasterKey::from_secret(b"m").unwrap();
        for id in ["web-prod", "db-prod", "db-staging"] {
            let item = EncryptedItem::seal(id, &fields(&[("key", json!("k"))]), &master).unwrap();
            catalog.write_item(&item).unwrap();
        }
        fs::write(catalog.dir().join("notes.txt"), "ignored").unwrap();

        assert_eq!(
            catalog.environment_items("prod").unwrap(),
            vec!["db-prod".to_string(), "web-prod".to_string()]
        );
        assert_eq!(catalog.item_names().unwrap().len(), 3);
    }

    #[test]
    fn missing_catalog_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path(), "absent");
        assert!(catalog.item_names().unwrap().is_empty());
    }

    #[test]
    fn load_key_decrypts_record() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path(), "keymaster");
        let master = MasterKey::from_secret(b"m").unwrap();
        let item = EncryptedItem::seal(
            "db-prod",
            &fields(&[
                ("destination", json!("role:db AND env:prod")),
                ("key", json!("SECRETVALUE")),
            ]),
            &master,
        )
        .unwrap();
        catalog.write_item(&item).unwrap();

        let record = catalog.load_key("db-prod", &master).unwrap();
        assert_eq!(record.name, "db-prod");
        assert_eq!(record.destination_spec, "role:db AND env:prod");
        assert_eq!(record.secret, "SECRETVALUE");
    }

    #[test]
    fn missing_fields_are_reported() {
        let master = MasterKey::from_secret(b"m").unwrap();
        let item =
            EncryptedItem::seal("db-prod", &fields(&[("key", json!("S"))]), &master).unwrap();
        match item.to_key_record(&master) {
            Err(CatalogError::MissingFields { item, missing }) => {
                assert_eq!(item, "db-prod");
                assert_eq!(missing, vec!["destination"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn non_string_key_is_invalid() {
        let master = MasterKey::from_secret(b"m").unwrap();
        let item = EncryptedItem::seal(
            "db-prod",
            &fields(&[("destination", json!("role:db")), ("key", json!(42))]),
            &master,
        )
        .unwrap();
        assert!(matches!(
            item.to_key_record(&master),
            Err(CatalogError::InvalidField { field: "key", .. })
        ));
    }
}
