// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Client Provisioning
//!
//! A node that receives keys needs two things before any server will send
//! it anything:
//!
//! 1. A stable instance id (UUID), published to the directory under
//!    `keymaster.uuid`. Servers refuse to distribute to addresses without
//!    one.
//! 2. An `authorized_keys` file trusting the SSH public keys of the
//!    keymaster servers of its environment.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::directory::{DestinationResolver, DirectoryError, NodeDirectory};

/// Role searched for when locating keymaster servers.
pub const SERVER_ROLE: &str = "keymaster";

const AUTHORIZED_KEYS_MODE: u32 = 0o400;
const UUID_FILE_MODE: u32 = 0o644;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("stored node id at {} is not a UUID: {value:?}", path.display())]
    InvalidUuid { path: PathBuf, value: String },

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

pub type ClientResult<T> = Result<T, ClientError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ClientError + '_ {
    move |source| ClientError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Return this node's instance id, generating and persisting one on first use.
pub fn ensure_node_uuid(path: &Path) -> ClientResult<Uuid> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let value = content.trim();
            return Uuid::parse_str(value).map_err(|_| ClientError::InvalidUuid {
                path: path.to_path_buf(),
                value: value.to_string(),
            });
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ClientError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }

    let id = Uuid::new_v4();
    write_file(path, format!("{id}\n").as_bytes(), UUID_FILE_MODE)?;
    tracing::info!(uuid = %id, path = %path.display(), "Generated keymaster node id");
    Ok(id)
}

/// Read the public half of the server's SSH identity (`<private>.pub`).
pub fn read_public_key(private_key_path: &Path) -> ClientResult<Option<String>> {
    let mut public = private_key_path.as_os_str().to_owned();
    public.push(".pub");
    let public = PathBuf::from(public);

    match fs::read_to_string(&public) {
        Ok(key) => Ok(Some(key.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ClientError::Io {
            path: public,
            source: e,
        }),
    }
}

/// Render authorized_keys content for the given public keys, sorted and
/// deduplicated.
pub fn render_authorized_keys(public_keys: &[String]) -> String {
    let mut keys: Vec<&str> = public_keys
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();
    keys.sort_unstable();
    keys.dedup();

    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('\n');
    }
    out
}

/// Outcome of [`provision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// No keymaster server found; authorized_keys was left alone.
    NoServer { node_id: Uuid },
    /// authorized_keys already trusted exactly these servers.
    Unchanged { node_id: Uuid, servers: usize },
    /// authorized_keys was rewritten.
    Updated { node_id: Uuid, servers: usize },
}

/// Prepare this node to receive keys.
///
/// Makes sure the node has an id, then searches for keymaster servers of
/// the node's environment and trusts their public keys.
pub async fn provision<D: NodeDirectory>(
    resolver: &DestinationResolver<D>,
    node_uuid_path: &Path,
    authorized_keys_path: &Path,
) -> ClientResult<ProvisionOutcome> {
    let node_id = ensure_node_uuid(node_uuid_path)?;

    let query = format!(
        "roles:{SERVER_ROLE} AND chef_environment:{}",
        resolver.environment()
    );
    let public_keys: Vec<String> = resolver
        .search(&query)
        .await?
        .iter()
        .filter_map(|node| node.public_key().map(str::to_string))
        .collect();

    if public_keys.is_empty() {
        tracing::error!(
            environment = %resolver.environment(),
            "No keymaster server found, client not provisioned"
        );
        return Ok(ProvisionOutcome::NoServer { node_id });
    }

    let content = render_authorized_keys(&public_keys);
    let servers = public_keys.len();

    let current = match fs::read_to_string(authorized_keys_path) {
        Ok(current) => Some(current),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(io_err(authorized_keys_path)(e)),
    };
    if current.as_deref() == Some(content.as_str()) {
        return Ok(ProvisionOutcome::Unchanged { node_id, servers });
    }

    write_file(authorized_keys_path, content.as_bytes(), AUTHORIZED_KEYS_MODE)?;
    tracing::info!(
        path = %authorized_keys_path.display(),
        servers,
        "Updated keymaster authorized_keys"
    );
    Ok(ProvisionOutcome::Updated { node_id, servers })
}

/// Atomically replace `path` with `data` at the given mode.
fn write_file(path: &Path, data: &[u8], mode: u32) -> ClientResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let temp_path = path.with_extension("tmp");
    {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&temp_path).map_err(io_err(&temp_path))?;
        file.write_all(data).map_err(io_err(&temp_path))?;
        file.flush().map_err(io_err(&temp_path))?;
    }
    #[cfg(unix)]
    fs::set_permissions(&temp_path, fs::Permissions::from_mode(mode)).map_err(io_err(&temp_path))?;
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&temp_path, path).map_err(io_err(path))?;
    Ok(())
}
