// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Transport
//!
//! Copies one stored key file to one remote node. The outcome is a plain
//! success flag: retries are the scheduler's business, driven by the
//! distribution history.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

/// Everything needed to copy one key to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Local key file to copy.
    pub secret_path: PathBuf,
    /// Remote account receiving the file.
    pub target_user: String,
    /// Remote address.
    pub target_address: String,
    /// Remote directory the file lands in.
    pub storage_root: PathBuf,
    /// SSH identity used to authenticate.
    pub private_key_path: PathBuf,
}

impl TransferRequest {
    /// `user@address:storage_root/`, with IPv6 addresses in brackets.
    pub fn destination(&self) -> String {
        let root = self.storage_root.to_string_lossy();
        let root = root.trim_end_matches('/');
        let address = &self.target_address;
        if address.contains(':') && !address.starts_with('[') {
            format!("{}@[{}]:{}/", self.target_user, address, root)
        } else {
            format!("{}@{}:{}/", self.target_user, address, root)
        }
    }
}

/// Pluggable key copy mechanism.
pub trait Transport {
    /// Copy the key. Returns `true` only if the copy completed successfully.
    fn send(&self, request: &TransferRequest) -> impl Future<Output = bool> + Send;
}

/// Transport shelling out to `scp` in non-interactive mode.
///
/// Host keys are not verified: destinations are discovered dynamically and
/// have no known_hosts entries.
#[derive(Debug, Clone)]
pub struct ScpTransport {
    program: PathBuf,
}

impl Default for ScpTransport {
    fn default() -> Self {
        Self::new("scp")
    }
}

impl ScpTransport {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }

    /// Arguments passed to the copy program.
    pub fn args(request: &TransferRequest) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "NumberOfPasswordPrompts=0".to_string(),
            "-i".to_string(),
            request.private_key_path.to_string_lossy().into_owned(),
            request.secret_path.to_string_lossy().into_owned(),
            request.destination(),
        ]
    }
}

impl Transport for ScpTransport {
    async fn send(&self, request: &TransferRequest) -> bool {
        tracing::info!(
            address = %request.target_address,
            file = %request.secret_path.display(),
            "Distributing key"
        );

        let output = Command::new(&self.program)
            .args(Self::args(request))
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(
                    address = %request.target_address,
                    status = ?output.status.code(),
                    stderr = %stderr.trim(),
                    "Key distribution failed"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    address = %request.target_address,
                    program = %self.program.display(),
                    error = %e,
                    "Key distribution could not be launched"
                );
                false
            }
        }
    }
}
