// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the application. Configuration is loaded from the environment
//! at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `KEYMASTER_MODE` | `server`, `client` or `both` | `server` |
//! | `KEYMASTER_ENVIRONMENT` | Environment this node belongs to | `_default` |
//! | `KEYMASTER_STORAGE_PATH` | Directory holding `<name>.key` files | `/etc/keymaster/keys` |
//! | `KEYMASTER_MASTER_KEY` | Master secret file | `/etc/keymaster/keymaster.key` |
//! | `KEYMASTER_CATALOG_DIR` | Root of encrypted catalogs | `/etc/keymaster/catalog` |
//! | `KEYMASTER_CATALOG_NAME` | Catalog to read | `keymaster` |
//! | `KEYMASTER_USER` | Remote account receiving keys | `keymaster` |
//! | `KEYMASTER_DISTRIBUTE_EVERY_SECS` | Redistribution interval | `25200` (7 h) |
//! | `KEYMASTER_PRIVATE_KEY` | SSH identity for transfers | `/home/<user>/.ssh/<user>.priv.key` |
//! | `KEYMASTER_HISTORY_DB` | Distribution history database | `/var/lib/keymaster/history.redb` |
//! | `KEYMASTER_INVENTORY` | JSON node inventory file | unset |
//! | `KEYMASTER_DIRECTORY_URL` | HTTP directory base URL | unset |
//! | `KEYMASTER_SOLO` | Disable directory search | `true` when no directory is set |
//! | `KEYMASTER_KEY_MATCH` | `contains` or `exact` | `contains` |
//! | `KEYMASTER_RUN_EVERY_SECS` | Loop period; run once when unset | unset |
//! | `KEYMASTER_NODE_UUID_PATH` | Client identity file | `/etc/keymaster/uuid` |
//! | `KEYMASTER_AUTHORIZED_KEYS` | Client authorized_keys file | `/home/<user>/.ssh/authorized_keys` |
//! | `KEYMASTER_CLIENT_ENABLE` | Run client provisioning | `true` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::time::Duration;

use crate::directory::{ConfiguredDirectory, DirectoryResult, HttpDirectory, InventoryDirectory};
use crate::storage::KeyMatch;

pub const MODE_ENV: &str = "KEYMASTER_MODE";
pub const ENVIRONMENT_ENV: &str = "KEYMASTER_ENVIRONMENT";
pub const STORAGE_PATH_ENV: &str = "KEYMASTER_STORAGE_PATH";
pub const MASTER_KEY_ENV: &str = "KEYMASTER_MASTER_KEY";
pub const CATALOG_DIR_ENV: &str = "KEYMASTER_CATALOG_DIR";
pub const CATALOG_NAME_ENV: &str = "KEYMASTER_CATALOG_NAME";
pub const USER_ENV: &str = "KEYMASTER_USER";
pub const DISTRIBUTE_EVERY_ENV: &str = "KEYMASTER_DISTRIBUTE_EVERY_SECS";
pub const PRIVATE_KEY_ENV: &str = "KEYMASTER_PRIVATE_KEY";
pub const HISTORY_DB_ENV: &str = "KEYMASTER_HISTORY_DB";
pub const INVENTORY_ENV: &str = "KEYMASTER_INVENTORY";
pub const DIRECTORY_URL_ENV: &str = "KEYMASTER_DIRECTORY_URL";
pub const SOLO_ENV: &str = "KEYMASTER_SOLO";
pub const KEY_MATCH_ENV: &str = "KEYMASTER_KEY_MATCH";
pub const RUN_EVERY_ENV: &str = "KEYMASTER_RUN_EVERY_SECS";
pub const NODE_UUID_PATH_ENV: &str = "KEYMASTER_NODE_UUID_PATH";
pub const AUTHORIZED_KEYS_ENV: &str = "KEYMASTER_AUTHORIZED_KEYS";
pub const CLIENT_ENABLE_ENV: &str = "KEYMASTER_CLIENT_ENABLE";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_ENVIRONMENT: &str = "_default";
pub const DEFAULT_STORAGE_PATH: &str = crate::storage::paths::DEFAULT_STORAGE_ROOT;
pub const DEFAULT_MASTER_KEY: &str = "/etc/keymaster/keymaster.key";
pub const DEFAULT_CATALOG_DIR: &str = "/etc/keymaster/catalog";
pub const DEFAULT_CATALOG_NAME: &str = "keymaster";
pub const DEFAULT_USER: &str = "keymaster";
pub const DEFAULT_HISTORY_DB: &str = "/var/lib/keymaster/history.redb";
pub const DEFAULT_NODE_UUID_PATH: &str = "/etc/keymaster/uuid";

/// Default redistribution interval: 420 minutes.
pub const DEFAULT_DISTRIBUTE_EVERY: Duration = Duration::from_secs(7 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which roles this process performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Decrypt, store and distribute keys.
    Server,
    /// Register identity and authorize servers.
    Client,
    Both,
}

impl Mode {
    pub fn runs_server(self) -> bool {
        matches!(self, Mode::Server | Mode::Both)
    }

    pub fn runs_client(self) -> bool {
        matches!(self, Mode::Client | Mode::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub environment: String,
    pub storage_path: PathBuf,
    pub master_key_path: PathBuf,
    pub catalog_dir: PathBuf,
    pub catalog_name: String,
    pub user: String,
    pub distribute_every: Duration,
    pub private_key_path: PathBuf,
    pub history_db: PathBuf,
    pub inventory_path: Option<PathBuf>,
    pub directory_url: Option<String>,
    pub solo: bool,
    pub key_match: KeyMatch,
    pub run_every: Option<Duration>,
    pub node_uuid_path: PathBuf,
    pub authorized_keys_path: PathBuf,
    pub client_enable: bool,
    pub log_format: LogFormat,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let path_or = |name: &str, default: &str| PathBuf::from(get(name).unwrap_or_else(|| default.to_string()));

        let mode = match get(MODE_ENV).as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("server") => Mode::Server,
            Some("client") => Mode::Client,
            Some("both") => Mode::Both,
            Some(other) => return Err(invalid(MODE_ENV, other, "expected server, client or both")),
        };

        let user = get(USER_ENV).unwrap_or_else(|| DEFAULT_USER.to_string());
        let home = PathBuf::from(format!("/home/{user}"));

        let inventory_path = get(INVENTORY_ENV).map(PathBuf::from);
        let directory_url = get(DIRECTORY_URL_ENV);
        let solo = match get(SOLO_ENV) {
            Some(v) => parse_bool(SOLO_ENV, &v)?,
            None => inventory_path.is_none() && directory_url.is_none(),
        };

        let key_match = match get(KEY_MATCH_ENV) {
            Some(v) => v
                .parse::<KeyMatch>()
                .map_err(|reason| invalid(KEY_MATCH_ENV, &v, &reason))?,
            None => KeyMatch::default(),
        };

        let log_format = match get(LOG_FORMAT_ENV).as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            mode,
            environment: get(ENVIRONMENT_ENV).unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            storage_path: path_or(STORAGE_PATH_ENV, DEFAULT_STORAGE_PATH),
            master_key_path: path_or(MASTER_KEY_ENV, DEFAULT_MASTER_KEY),
            catalog_dir: path_or(CATALOG_DIR_ENV, DEFAULT_CATALOG_DIR),
            catalog_name: get(CATALOG_NAME_ENV).unwrap_or_else(|| DEFAULT_CATALOG_NAME.to_string()),
            distribute_every: match get(DISTRIBUTE_EVERY_ENV) {
                Some(v) => parse_secs(DISTRIBUTE_EVERY_ENV, &v)?,
                None => DEFAULT_DISTRIBUTE_EVERY,
            },
            private_key_path: get(PRIVATE_KEY_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(".ssh").join(format!("{user}.priv.key"))),
            history_db: path_or(HISTORY_DB_ENV, DEFAULT_HISTORY_DB),
            inventory_path,
            directory_url,
            solo,
            key_match,
            run_every: get(RUN_EVERY_ENV)
                .map(|v| parse_secs(RUN_EVERY_ENV, &v))
                .transpose()?,
            node_uuid_path: path_or(NODE_UUID_PATH_ENV, DEFAULT_NODE_UUID_PATH),
            authorized_keys_path: get(AUTHORIZED_KEYS_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(".ssh").join("authorized_keys")),
            client_enable: match get(CLIENT_ENABLE_ENV) {
                Some(v) => parse_bool(CLIENT_ENABLE_ENV, &v)?,
                None => true,
            },
            log_format,
            user,
        })
    }

    /// Build the directory backend this configuration selects.
    ///
    /// An inventory file takes precedence over an HTTP directory.
    pub fn directory(&self) -> DirectoryResult<ConfiguredDirectory> {
        if let Some(path) = &self.inventory_path {
            return Ok(ConfiguredDirectory::Inventory(InventoryDirectory::from_file(path)));
        }
        if let Some(url) = &self.directory_url {
            return Ok(ConfiguredDirectory::Http(HttpDirectory::new(url)?));
        }
        Ok(ConfiguredDirectory::Disabled)
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(var: &'static str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "expected a boolean")),
    }
}

fn parse_secs(var: &'static str, value: &str) -> ConfigResult<Duration> {
    let secs: u64 = value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| invalid(var, value, &e.to_string()))?;
    if secs == 0 {
        return Err(invalid(var, value, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}
