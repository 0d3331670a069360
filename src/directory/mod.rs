// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Destination Resolver
//!
//! Turns destination selectors into endpoint addresses and confirms the
//! identity of each endpoint through a node directory.
//!
//! Address resolution and identity confirmation are separate lookups: a
//! node can be resolvable before it has registered its keymaster UUID, and
//! keys are only sent to endpoints with a confirmed identity. An address
//! that is later reassigned to another instance gets a fresh history entry
//! because the UUID is part of the lookup key.

pub mod http;
pub mod inventory;
pub mod query;

use std::future::Future;
use std::io;
use std::path::PathBuf;

use crate::models::{InstanceId, NodeRecord};

pub use http::HttpDirectory;
pub use inventory::InventoryDirectory;
pub use query::Query;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("invalid search query: {0:?}")]
    InvalidQuery(String),

    #[error("invalid directory URL: {0}")]
    InvalidUrl(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("directory returned status {0}")]
    Status(u16),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

// =============================================================================
// Directory Contract
// =============================================================================

/// A searchable catalog of nodes.
pub trait NodeDirectory {
    fn search(&self, query: &str) -> impl Future<Output = DirectoryResult<Vec<NodeRecord>>> + Send;
}

/// The directory selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredDirectory {
    Inventory(InventoryDirectory),
    Http(HttpDirectory),
    /// No search backend (solo mode). Every search is empty.
    Disabled,
}

impl NodeDirectory for ConfiguredDirectory {
    async fn search(&self, query: &str) -> DirectoryResult<Vec<NodeRecord>> {
        match self {
            ConfiguredDirectory::Inventory(d) => d.search(query).await,
            ConfiguredDirectory::Http(d) => d.search(query).await,
            ConfiguredDirectory::Disabled => Ok(Vec::new()),
        }
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves destinations and identities against a [`NodeDirectory`].
#[derive(Debug, Clone)]
pub struct DestinationResolver<D> {
    directory: D,
    environment: String,
    search_enabled: bool,
}

impl<D: NodeDirectory> DestinationResolver<D> {
    pub fn new(directory: D, environment: impl Into<String>, search_enabled: bool) -> Self {
        Self {
            directory,
            environment: environment.into(),
            search_enabled,
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Search, honouring solo mode.
    pub async fn search(&self, query: &str) -> DirectoryResult<Vec<NodeRecord>> {
        if !self.search_enabled {
            tracing::warn!("Search is disabled in solo mode");
            return Ok(Vec::new());
        }
        self.directory.search(query).await
    }

    /// Addresses of every node matching `destination_spec`, deduplicated.
    ///
    /// Nodes without any address are skipped. An empty result is logged,
    /// not an error.
    pub async fn resolve(&self, destination_spec: &str) -> DirectoryResult<Vec<String>> {
        let nodes = self.search(destination_spec).await?;

        let mut addresses: Vec<String> = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match node.preferred_address() {
                Some(addr) if !addresses.iter().any(|a| a == addr) => {
                    addresses.push(addr.to_string())
                }
                Some(_) => {}
                None => tracing::debug!(node = %node.name, "Node has no address, skipping"),
            }
        }

        if addresses.is_empty() {
            tracing::info!(destination = %destination_spec, "Destination search returned empty results");
        }
        Ok(addresses)
    }

    /// Instance id declared by the node at `address` in this environment.
    ///
    /// Returns [`InstanceId::Unknown`] when nothing matches, the node has
    /// not registered, search is disabled, or the directory fails.
    pub async fn identity_of(&self, address: &str) -> InstanceId {
        if !self.search_enabled {
            tracing::warn!("Search is disabled in solo mode");
            return InstanceId::Unknown;
        }

        // Resolution prefers the LAN address, so fall back to it when the
        // public address does not match.
        for field in ["ipaddress", "network.lanip"] {
            let query = format!("{field}:{address} AND chef_environment:{}", self.environment);
            match self.directory.search(&query).await {
                Ok(nodes) => {
                    if let Some(node) = nodes.first() {
                        return node.instance_id();
                    }
                }
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "Identity lookup failed");
                    return InstanceId::Unknown;
                }
            }
        }

        tracing::info!(address = %address, "Identity search returned empty result");
        InstanceId::Unknown
    }
}
