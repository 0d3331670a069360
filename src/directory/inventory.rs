// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! File-backed node inventory.
//!
//! The inventory is a JSON array of node documents. It is re-read on every
//! search so nodes that register between runs are picked up.

use std::path::{Path, PathBuf};

use serde_json::Value;

use super::query::Query;
use super::{DirectoryError, DirectoryResult, NodeDirectory};
use crate::models::NodeRecord;

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Static(Vec<Value>),
}

/// Node directory answering searches from an inventory document.
#[derive(Debug, Clone)]
pub struct InventoryDirectory {
    source: Source,
}

impl InventoryDirectory {
    /// Inventory loaded from `path` on every search.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        Self {
            source: Source::File(path.as_ref().to_path_buf()),
        }
    }

    /// Fixed in-memory inventory.
    pub fn from_nodes(nodes: &[NodeRecord]) -> DirectoryResult<Self> {
        let docs = nodes
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: Source::Static(docs),
        })
    }

    async fn documents(&self) -> DirectoryResult<Vec<Value>> {
        match &self.source {
            Source::Static(docs) => Ok(docs.clone()),
            Source::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| DirectoryError::Io {
                    path: path.clone(),
                    source: e,
                })?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}

impl NodeDirectory for InventoryDirectory {
    async fn search(&self, query: &str) -> DirectoryResult<Vec<NodeRecord>> {
        let parsed = Query::parse(query)?;
        let mut nodes = Vec::new();
        for doc in self.documents().await? {
            if !parsed.matches(&doc) {
                continue;
            }
            match serde_json::from_value::<NodeRecord>(doc) {
                Ok(node) => nodes.push(node),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed inventory node"),
            }
        }
        Ok(nodes)
    }
}
