// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Distribution history: when each (key, destination) pair last received a
//! successful transfer.
//!
//! ## Lookup Keys
//!
//! A [`LookupKey`] is the SHA-256 of the length-prefixed tuple
//! `(master secret, key name, address, instance id)`, hex encoded. Including
//! the master secret ties history to the active master key: after a
//! rotation every lookup key changes and the whole fleet is redistributed
//! once.
//!
//! ## Table Layout
//!
//! - `distribution_history`: lookup_key -> JSON [`HistoryEntry`]
//!
//! Each successful transfer is committed in its own write transaction.
//! redb holds an exclusive lock on the database file while it is open, so
//! two overlapping runs cannot both write history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// =============================================================================
// Table Definitions
// =============================================================================

/// lookup_key -> serialized HistoryEntry (JSON bytes).
const DISTRIBUTION_HISTORY: TableDefinition<&str, &[u8]> =
    TableDefinition::new("distribution_history");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("cannot create history directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history lock poisoned")]
    Poisoned,

    #[error("history database unavailable: {0}")]
    Unavailable(String),
}

impl HistoryError {
    /// True when another process currently holds the history database.
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            HistoryError::RedbDatabase(redb::DatabaseError::DatabaseAlreadyOpen)
        )
    }
}

pub type HistoryResult<T> = Result<T, HistoryError>;

// =============================================================================
// Lookup Keys
// =============================================================================

/// Deterministic identifier of one (secret, endpoint) distribution relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupKey(String);

impl LookupKey {
    /// Derive the lookup key for a key name sent to `address`/`instance_id`
    /// under the given master secret.
    pub fn derive(master_secret: &[u8], key_name: &str, address: &str, instance_id: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [
            master_secret,
            key_name.as_bytes(),
            address.as_bytes(),
            instance_id.as_bytes(),
        ] {
            // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        LookupKey(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LookupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// History Contract
// =============================================================================

/// Persisted record for one lookup key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub last_distribution: DateTime<Utc>,
}

/// Whether a pair last distributed at `last` is due again at `now`.
///
/// Never-distributed pairs are always due. The boundary is inclusive: a pair
/// exactly `interval` old is due.
pub fn is_due(last: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => {
            let interval = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
            now.signed_duration_since(last) >= interval
        }
    }
}

/// Durable mapping from lookup key to last successful distribution.
///
/// Implementations only change an entry through [`record_success`], which
/// callers invoke after a transfer succeeded.
///
/// [`record_success`]: DistributionHistory::record_success
pub trait DistributionHistory {
    fn last_distribution(&self, key: &LookupKey) -> HistoryResult<Option<DateTime<Utc>>>;

    fn record_success(&self, key: &LookupKey, at: DateTime<Utc>) -> HistoryResult<()>;

    fn due_for(&self, key: &LookupKey, interval: Duration, now: DateTime<Utc>) -> HistoryResult<bool> {
        Ok(is_due(self.last_distribution(key)?, interval, now))
    }
}

// =============================================================================
// RedbHistory
// =============================================================================

/// Distribution history persisted in an embedded redb database.
pub struct RedbHistory {
    db: Database,
}

impl RedbHistory {
    /// Open (or create) the history database at the given path.
    pub fn open(path: &Path) -> HistoryResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let db = Database::create(path)?;

        // Pre-create the table so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DISTRIBUTION_HISTORY)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Number of recorded lookup keys.
    pub fn len(&self) -> HistoryResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DISTRIBUTION_HISTORY)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> HistoryResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl DistributionHistory for RedbHistory {
    fn last_distribution(&self, key: &LookupKey) -> HistoryResult<Option<DateTime<Utc>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DISTRIBUTION_HISTORY)?;
        match table.get(key.as_str())? {
            Some(value) => {
                let entry: HistoryEntry = serde_json::from_slice(value.value())?;
                Ok(Some(entry.last_distribution))
            }
            None => Ok(None),
        }
    }

    fn record_success(&self, key: &LookupKey, at: DateTime<Utc>) -> HistoryResult<()> {
        let json = serde_json::to_vec(&HistoryEntry {
            last_distribution: at,
        })?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DISTRIBUTION_HISTORY)?;
            table.insert(key.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

// =============================================================================
// MemoryHistory
// =============================================================================

/// Process-local history, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    entries: Mutex<HashMap<LookupKey, HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DistributionHistory for MemoryHistory {
    fn last_distribution(&self, key: &LookupKey) -> HistoryResult<Option<DateTime<Utc>>> {
        let entries = self.entries.lock().map_err(|_| HistoryError::Poisoned)?;
        Ok(entries.get(key).map(|e| e.last_distribution))
    }

    fn record_success(&self, key: &LookupKey, at: DateTime<Utc>) -> HistoryResult<()> {
        let mut entries = self.entries.lock().map_err(|_| HistoryError::Poisoned)?;
        entries.insert(
            key.clone(),
            HistoryEntry {
                last_distribution: at,
            },
        );
        Ok(())
    }
}

// =============================================================================
// HistoryStore
// =============================================================================

/// History used by a run: the redb database, or nothing when it could not be
/// opened. An unavailable store fails every lookup, so keys are still cached
/// locally but no pair is distributed.
pub enum HistoryStore {
    Redb(RedbHistory),
    Unavailable { reason: String },
}

impl HistoryStore {
    /// Open the redb history, degrading to [`HistoryStore::Unavailable`] on
    /// any failure except another run holding the database.
    pub fn open(path: &Path) -> HistoryResult<Self> {
        match RedbHistory::open(path) {
            Ok(db) => Ok(HistoryStore::Redb(db)),
            Err(e) if e.is_locked() => Err(e),
            Err(e) => Ok(HistoryStore::Unavailable {
                reason: e.to_string(),
            }),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, HistoryStore::Redb(_))
    }
}

impl DistributionHistory for HistoryStore {
    fn last_distribution(&self, key: &LookupKey) -> HistoryResult<Option<DateTime<Utc>>> {
        match self {
            HistoryStore::Redb(db) => db.last_distribution(key),
            HistoryStore::Unavailable { reason } => Err(HistoryError::Unavailable(reason.clone())),
        }
    }

    fn record_success(&self, key: &LookupKey, at: DateTime<Utc>) -> HistoryResult<()> {
        match self {
            HistoryStore::Redb(db) => db.record_success(key, at),
            HistoryStore::Unavailable { reason } => Err(HistoryError::Unavailable(reason.clone())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
