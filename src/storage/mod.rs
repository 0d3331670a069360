// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Local persistence for the distribution engine.
//!
//! ## Storage Layout
//!
//! ```text
//! /etc/keymaster/keys/
//!   {name}.key                  # One file per catalog entry, mode 0600
//! /var/lib/keymaster/
//!   history.redb                # Distribution history (redb)
//! ```
//!
//! Key files hold the plain secret with no envelope. They are the source
//! the transport copies to remote nodes, which store them under the same
//! layout.

pub mod history;
pub mod key_cache;
pub mod paths;

pub use history::{
    is_due, DistributionHistory, HistoryEntry, HistoryError, HistoryResult, LookupKey,
    HistoryStore, MemoryHistory, RedbHistory,
};
pub use key_cache::{EnsureOutcome, KeyCache, KeyCacheError, KeyCacheResult, KeyMatch, LocalKeyEntry};
pub use paths::StoragePaths;
