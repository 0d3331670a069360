// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;

use keymaster::catalog::Catalog;
use keymaster::client;
use keymaster::config::{Config, LogFormat};
use keymaster::directory::DestinationResolver;
use keymaster::error::KeymasterError;
use keymaster::scheduler::{DistributionPolicy, DistributionScheduler};
use keymaster::storage::{HistoryStore, KeyCache, StoragePaths};
use keymaster::transport::ScpTransport;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("keymaster: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.log_format);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Keymaster failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn run(config: Config) -> Result<(), KeymasterError> {
    info!(
        mode = ?config.mode,
        environment = %config.environment,
        solo = config.solo,
        "Keymaster starting"
    );

    let resolver = DestinationResolver::new(
        config.directory()?,
        config.environment.clone(),
        !config.solo,
    );

    if config.mode.runs_client() {
        if config.client_enable {
            match client::provision(
                &resolver,
                &config.node_uuid_path,
                &config.authorized_keys_path,
            )
            .await
            {
                Ok(outcome) => info!(outcome = ?outcome, "Client provisioning complete"),
                Err(e) if config.mode.runs_server() => {
                    error!(error = %e, "Client provisioning failed, continuing with distribution")
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            info!("Client provisioning disabled");
        }
    }

    if !config.mode.runs_server() {
        return Ok(());
    }

    match client::read_public_key(&config.private_key_path)? {
        Some(public_key) => info!(public_key = %public_key, "Server public key ready for publication"),
        None => warn!(
            path = %config.private_key_path.display(),
            "No public key next to the distribution identity"
        ),
    }

    let history = match HistoryStore::open(&config.history_db) {
        Ok(HistoryStore::Unavailable { reason }) => {
            error!(
                path = %config.history_db.display(),
                error = %reason,
                "History database unavailable, keys will be cached but not distributed"
            );
            HistoryStore::Unavailable { reason }
        }
        Ok(history) => history,
        Err(e) if e.is_locked() => {
            warn!(
                path = %config.history_db.display(),
                "Another keymaster run holds the history database, skipping"
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let cache = KeyCache::new(StoragePaths::new(&config.storage_path), config.key_match);
    cache.initialize()?;

    let scheduler = DistributionScheduler::new(
        Catalog::new(&config.catalog_dir, &config.catalog_name),
        &config.master_key_path,
        cache,
        resolver,
        ScpTransport::default(),
        history,
        DistributionPolicy {
            user: config.user.clone(),
            interval: config.distribute_every,
            private_key_path: config.private_key_path.clone(),
        },
    );

    match config.run_every {
        None => {
            scheduler.run_once().await;
        }
        Some(period) => {
            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    signal_token.cancel();
                }
            });
            scheduler.run(period, shutdown).await;
        }
    }

    Ok(())
}
