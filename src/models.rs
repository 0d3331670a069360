// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Distribution Data Models
//!
//! Types shared between the catalog, the directory resolver, the history
//! store and the scheduler.
//!
//! ## Model Categories
//!
//! - **Keys**: [`KeyRecord`] decrypted from one catalog entry
//! - **Destinations**: [`Endpoint`] and its [`InstanceId`]
//! - **Directory**: [`NodeRecord`] as returned by a node search
//! - **Tasks**: [`DistributionTask`] for one (key, endpoint) evaluation

use serde::{Deserialize, Serialize};

/// Sentinel reported for endpoints that have not announced an identity.
pub const NO_INSTANCE: &str = "none";

// =============================================================================
// Key Records
// =============================================================================

/// A decrypted catalog entry.
///
/// Lives only for the duration of a run. The secret is never printed by
/// the `Debug` implementation.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyRecord {
    /// Catalog item name, e.g. `db-prod`. Also the local file stem.
    pub name: String,
    /// Directory selector naming the nodes that receive this key.
    pub destination_spec: String,
    /// Raw secret material.
    pub secret: String,
}

impl KeyRecord {
    pub fn new(
        name: impl Into<String>,
        destination_spec: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            destination_spec: destination_spec.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("name", &self.name)
            .field("destination_spec", &self.destination_spec)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// Identity a destination node has declared to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceId {
    /// Node has a registered keymaster UUID.
    Known(String),
    /// Node has not registered yet, or search is unavailable.
    Unknown,
}

impl InstanceId {
    /// Build from a declared directory attribute.
    ///
    /// A missing value and the literal `"none"` both mean unknown.
    pub fn from_declared(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() && v != NO_INSTANCE => InstanceId::Known(v.to_string()),
            _ => InstanceId::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, InstanceId::Known(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            InstanceId::Known(id) => id,
            InstanceId::Unknown => NO_INSTANCE,
        }
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub instance_id: InstanceId,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, instance_id: InstanceId) -> Self {
        Self {
            address: address.into(),
            instance_id,
        }
    }
}

/// A candidate transfer evaluated once per run.
#[derive(Debug, Clone, Copy)]
pub struct DistributionTask<'a> {
    pub key: &'a KeyRecord,
    pub endpoint: &'a Endpoint,
}

// =============================================================================
// Directory Records
// =============================================================================

/// Network attributes of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAttributes {
    /// Private/LAN address, preferred for distribution when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lanip: Option<String>,
}

/// Keymaster attributes a node publishes about itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeymasterAttributes {
    /// Client instance id generated on first provisioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Server SSH public key, published by keymaster servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// A node as returned by a directory search.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub chef_environment: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keymaster: Option<KeymasterAttributes>,
}

impl NodeRecord {
    /// Address to distribute to: the LAN address if declared, else `ipaddress`.
    pub fn preferred_address(&self) -> Option<&str> {
        self.network
            .as_ref()
            .and_then(|n| n.lanip.as_deref())
            .or(self.ipaddress.as_deref())
    }

    pub fn instance_id(&self) -> InstanceId {
        InstanceId::from_declared(self.keymaster.as_ref().and_then(|k| k.uuid.as_deref()))
    }

    pub fn public_key(&self) -> Option<&str> {
        self.keymaster.as_ref().and_then(|k| k.public_key.as_deref())
    }
}
