// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Process-level errors: failures that stop the binary before or outside a
//! scheduler run. Everything inside a run is isolated per key or per pair
//! and only reported.

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::storage::{HistoryError, KeyCacheError};

#[derive(Debug, thiserror::Error)]
pub enum KeymasterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("directory setup failed: {0}")]
    Directory(#[from] DirectoryError),

    #[error("history unavailable: {0}")]
    History(#[from] HistoryError),

    #[error("local key storage unavailable: {0}")]
    KeyCache(#[from] KeyCacheError),

    #[error("client provisioning failed: {0}")]
    Client(#[from] ClientError),
}
