// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Distribution Scheduler
//!
//! Decides, for every (key, destination) pair, whether a transfer is due,
//! performs it, and records the outcome.
//!
//! ## Strategy
//!
//! Each run:
//! 1. Loads the master key and decrypts every catalog item of the current
//!    environment. Items missing `destination` or `key` are skipped.
//! 2. Makes sure each key is stored locally (no rewrite if already current).
//! 3. Resolves the key's destinations fresh from the directory.
//! 4. Looks up each endpoint's instance id. Endpoints without one are
//!    skipped and get no history entry, so they are retried next run.
//! 5. Derives the lookup key and asks the history whether the pair is due.
//! 6. Sends due pairs. Only successful transfers are recorded, so a failure
//!    is retried on the next run.
//!
//! Every failure is isolated to its key or pair. A missing master key skips
//! the run without error. Work is sequential; the run ends once every pair
//! has been evaluated.
//!
//! ## Shutdown
//!
//! [`DistributionScheduler::run`] repeats runs on a fixed period and stops
//! when its `tokio_util::sync::CancellationToken` is cancelled.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{Catalog, MasterKey};
use crate::directory::{DestinationResolver, NodeDirectory};
use crate::models::{DistributionTask, Endpoint, KeyRecord};
use crate::storage::{DistributionHistory, EnsureOutcome, KeyCache, LookupKey};
use crate::transport::{TransferRequest, Transport};

/// Where transfers go and how often they repeat.
#[derive(Debug, Clone)]
pub struct DistributionPolicy {
    /// Remote account receiving keys.
    pub user: String,
    /// Minimum age of the last success before a pair is sent again.
    pub interval: Duration,
    /// SSH identity used by the transport.
    pub private_key_path: PathBuf,
}

/// Outcome of evaluating one (key, endpoint) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    IdentityUnknown,
    NotDue,
    Transferred,
    Failed,
    /// History could not be read; the pair was left alone.
    HistoryUnavailable,
}

/// Counters for one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub master_key_unavailable: bool,
    pub catalog_unavailable: bool,
    pub keys_decrypted: usize,
    pub malformed_entries: usize,
    pub keys_written: usize,
    pub keys_already_present: usize,
    pub local_store_failures: usize,
    pub resolution_failures: usize,
    pub empty_resolutions: usize,
    pub identity_unknown: usize,
    pub not_due: usize,
    pub transferred: usize,
    pub transfer_failures: usize,
    pub history_failures: usize,
}

impl RunReport {
    fn record(&mut self, outcome: PairOutcome) {
        match outcome {
            PairOutcome::IdentityUnknown => self.identity_unknown += 1,
            PairOutcome::NotDue => self.not_due += 1,
            PairOutcome::Transferred => self.transferred += 1,
            PairOutcome::Failed => self.transfer_failures += 1,
            PairOutcome::HistoryUnavailable => self.history_failures += 1,
        }
    }
}

/// Orchestrates decryption, local caching, resolution and transfer.
pub struct DistributionScheduler<D, T, H> {
    catalog: Catalog,
    master_key_path: PathBuf,
    cache: KeyCache,
    resolver: DestinationResolver<D>,
    transport: T,
    history: H,
    policy: DistributionPolicy,
}

impl<D, T, H> DistributionScheduler<D, T, H>
where
    D: NodeDirectory,
    T: Transport,
    H: DistributionHistory,
{
    pub fn new(
        catalog: Catalog,
        master_key_path: impl Into<PathBuf>,
        cache: KeyCache,
        resolver: DestinationResolver<D>,
        transport: T,
        history: H,
        policy: DistributionPolicy,
    ) -> Self {
        Self {
            catalog,
            master_key_path: master_key_path.into(),
            cache,
            resolver,
            transport,
            history,
            policy,
        }
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the scheduler every `period` until the cancellation token is
    /// triggered.
    pub async fn run(self, period: Duration, shutdown: CancellationToken) {
        info!(
            period_secs = period.as_secs(),
            interval_secs = self.policy.interval.as_secs(),
            "Distribution scheduler starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Distribution scheduler shutting down");
                return;
            }

            self.run_once().await;

            tokio::select! {
                _ = tokio::time::sleep(period) => {},
                _ = shutdown.cancelled() => {
                    info!("Distribution scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// Execute one run at the current time.
    pub async fn run_once(&self) -> RunReport {
        self.run_once_at(Utc::now()).await
    }

    /// Execute one run, treating `now` as the current time for history.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> RunReport {
        let mut report = RunReport::default();

        let master = match MasterKey::load(&self.master_key_path) {
            Ok(master) => master,
            Err(e) => {
                error!(error = %e, "Master key unavailable, skipping distribution");
                report.master_key_unavailable = true;
                return report;
            }
        };

        let keys = self.decrypt_catalog(&master, &mut report);

        for key in &keys {
            self.process_key(key, &master, now, &mut report).await;
        }

        info!(
            keys = report.keys_decrypted,
            written = report.keys_written,
            transferred = report.transferred,
            not_due = report.not_due,
            identity_unknown = report.identity_unknown,
            failures = report.transfer_failures,
            "Distribution run complete"
        );
        report
    }

    /// Decrypt every catalog item of this environment, skipping bad ones.
    fn decrypt_catalog(&self, master: &MasterKey, report: &mut RunReport) -> Vec<KeyRecord> {
        let environment = self.resolver.environment();
        let items = match self.catalog.environment_items(environment) {
            Ok(items) => items,
            Err(e) => {
                error!(
                    catalog = %self.catalog.dir().display(),
                    error = %e,
                    "Cannot list catalog"
                );
                report.catalog_unavailable = true;
                return Vec::new();
            }
        };

        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            info!(item = %item, "Decrypting catalog entry");
            match self.catalog.load_key(&item, master) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    error!(item = %item, error = %e, "Skipping catalog entry");
                    report.malformed_entries += 1;
                }
            }
        }
        report.keys_decrypted = keys.len();
        keys
    }

    async fn process_key(
        &self,
        key: &KeyRecord,
        master: &MasterKey,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) {
        match self.cache.ensure(&key.name, &key.secret) {
            Ok(EnsureOutcome::Written) => report.keys_written += 1,
            Ok(EnsureOutcome::AlreadyPresent) => report.keys_already_present += 1,
            Err(e) => {
                error!(key = %key.name, error = %e, "Cannot store key locally");
                report.local_store_failures += 1;
                return;
            }
        }

        let addresses = match self.resolver.resolve(&key.destination_spec).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(
                    key = %key.name,
                    destination = %key.destination_spec,
                    error = %e,
                    "Destination resolution failed"
                );
                report.resolution_failures += 1;
                return;
            }
        };
        if addresses.is_empty() {
            report.empty_resolutions += 1;
            return;
        }

        for address in addresses {
            let instance_id = self.resolver.identity_of(&address).await;
            let endpoint = Endpoint::new(address, instance_id);
            let task = DistributionTask {
                key,
                endpoint: &endpoint,
            };
            let outcome = self.evaluate(task, master, now).await;
            report.record(outcome);
        }
    }

    /// Evaluate one pair: gate on identity, consult history, transfer.
    pub async fn evaluate(
        &self,
        task: DistributionTask<'_>,
        master: &MasterKey,
        now: DateTime<Utc>,
    ) -> PairOutcome {
        let DistributionTask { key, endpoint } = task;

        if !endpoint.instance_id.is_known() {
            info!(
                key = %key.name,
                address = %endpoint.address,
                "Destination has no keymaster id yet, skipping"
            );
            return PairOutcome::IdentityUnknown;
        }

        let lookup = LookupKey::derive(
            master.material(),
            &key.name,
            &endpoint.address,
            endpoint.instance_id.as_str(),
        );

        match self.history.due_for(&lookup, self.policy.interval, now) {
            Ok(true) => {}
            Ok(false) => return PairOutcome::NotDue,
            Err(e) => {
                warn!(key = %key.name, address = %endpoint.address, error = %e, "History read failed");
                return PairOutcome::HistoryUnavailable;
            }
        }

        let request = TransferRequest {
            secret_path: self.cache.paths().key_file(&key.name),
            target_user: self.policy.user.clone(),
            target_address: endpoint.address.clone(),
            storage_root: self.cache.paths().root().to_path_buf(),
            private_key_path: self.policy.private_key_path.clone(),
        };

        if !self.transport.send(&request).await {
            warn!(
                key = %key.name,
                address = %endpoint.address,
                "Distribution failed, will retry next run"
            );
            return PairOutcome::Failed;
        }

        if let Err(e) = self.history.record_success(&lookup, now) {
            // The copy happened; the pair will simply be sent again next run.
            error!(key = %key.name, address = %endpoint.address, error = %e, "Cannot record distribution");
        } else {
            info!(
                key = %key.name,
                address = %endpoint.address,
                instance_id = %endpoint.instance_id,
                "Key distributed"
            );
        }
        PairOutcome::Transferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use chrono::TimeDelta;
    use serde_json::json;

    use crate::catalog::EncryptedItem;
    use crate::directory::InventoryDirectory;
    use crate::models::{InstanceId, KeymasterAttributes, NodeRecord};
    use crate::storage::{HistoryStore, KeyMatch, MemoryHistory, StoragePaths};

    const MASTER: &[u8] = b"master-secret-1";
    const INTERVAL: Duration = Duration::from_secs(100);

    struct RecordingTransport {
        succeed: bool,
        calls: Mutex<Vec<TransferRequest>>,
    }

    impl RecordingTransport {
        fn new(succeed: bool) -> Self {
            Self {
                succeed,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<TransferRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Transport for RecordingTransport {
        async fn send(&self, request: &TransferRequest) -> bool {
            self.calls.lock().unwrap().push(request.clone());
            self.succeed
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Self {
                dir: tempfile::tempdir().unwrap(),
            };
            fixture.set_master(MASTER);
            fixture
        }

        fn master_path(&self) -> PathBuf {
            self.dir.path().join("keymaster.key")
        }

        fn set_master(&self, secret: &[u8]) {
            std::fs::write(self.master_path(), secret).unwrap();
        }

        fn catalog(&self) -> Catalog {
            Catalog::new(self.dir.path().join("catalog"), "keymaster")
        }

        fn keys_dir(&self) -> PathBuf {
            self.dir.path().join("keys")
        }

        fn add_item(&self, id: &str, fields: &[(&str, serde_json::Value)]) {
            let master = MasterKey::load(&self.master_path()).unwrap();
            let plain: BTreeMap<String, serde_json::Value> = fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            let item = EncryptedItem::seal(id, &plain, &master).unwrap();
            self.catalog().write_item(&item).unwrap();
        }

        fn scheduler(
            &self,
            nodes: &[NodeRecord],
            succeed: bool,
        ) -> DistributionScheduler<InventoryDirectory, RecordingTransport, MemoryHistory> {
            self.scheduler_with_history(nodes, succeed, MemoryHistory::new())
        }

        fn scheduler_with_history<H: DistributionHistory>(
            &self,
            nodes: &[NodeRecord],
            succeed: bool,
            history: H,
        ) -> DistributionScheduler<InventoryDirectory, RecordingTransport, H> {
            let cache = KeyCache::new(StoragePaths::new(self.keys_dir()), KeyMatch::Contains);
            cache.initialize().unwrap();
            DistributionScheduler::new(
                self.catalog(),
                self.master_path(),
                cache,
                DestinationResolver::new(InventoryDirectory::from_nodes(nodes).unwrap(), "prod", true),
                RecordingTransport::new(succeed),
                history,
                DistributionPolicy {
                    user: "keymaster".to_string(),
                    interval: INTERVAL,
                    private_key_path: PathBuf::from("/home/keymaster/.ssh/keymaster.priv.key"),
                },
            )
        }
    }

    fn db_node(ip: &str, uuid: Option<&str>) -> NodeRecord {
        NodeRecord {
            name: format!("db-{ip}"),
            chef_environment: "prod".to_string(),
            roles: vec!["db".to_string()],
            ipaddress: Some(ip.to_string()),
            network: None,
            keymaster: Some(KeymasterAttributes {
                uuid: uuid.map(str::to_string),
                public_key: None,
            }),
        }
    }

    fn db_prod(fixture: &Fixture) {
        fixture.add_item(
            "db-prod",
            &[
                ("destination", json!("role:db AND env:prod")),
                ("key", json!("SECRETVALUE")),
            ],
        );
    }

    fn lookup(master: &[u8], address: &str, uuid: &str) -> LookupKey {
        let master = MasterKey::from_secret(master).unwrap();
        LookupKey::derive(master.material(), "db-prod", address, uuid)
    }

    #[tokio::test]
    async fn distributes_new_key_and_records_history() {
        let fixture = Fixture::new();
        db_prod(&fixture);
        let scheduler = fixture.scheduler(&[db_node("10.0.0.5", Some("u1"))], true);
        let now = Utc::now();

        let report = scheduler.run_once_at(now).await;

        assert_eq!(report.keys_decrypted, 1);
        assert_eq!(report.keys_written, 1);
        assert_eq!(report.transferred, 1);

        let calls = scheduler.transport().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target_address, "10.0.0.5");
        assert_eq!(calls[0].secret_path, fixture.keys_dir().join("db-prod.key"));
        assert_eq!(calls[0].storage_root, fixture.keys_dir());
        assert_eq!(calls[0].target_user, "keymaster");

        assert_eq!(
            std::fs::read_to_string(fixture.keys_dir().join("db-prod.key")).unwrap(),
            "SECRETVALUE"
        );
        assert_eq!(
            scheduler
                .history()
                .last_distribution(&lookup(MASTER, "10.0.0.5", "u1"))
                .unwrap(),
            Some(now)
        );
    }

    #[tokio::test]
    async fn fresh_pair_is_not_resent_until_interval() {
        let fixture = Fixture::new();
        db_prod(&fixture);
        let scheduler = fixture.scheduler(&[db_node("10.0.0.5", Some("u1"))], true);
        let now = Utc::now();

        scheduler.run_once_at(now).await;
        let report = scheduler.run_once_at(now + TimeDelta::seconds(99)).await;
        assert_eq!(report.not_due, 1);
        assert_eq!(report.keys_already_present, 1);
        assert_eq!(scheduler.transport().calls().len(), 1);

        let report = scheduler.run_once_at(now + TimeDelta::seconds(100)).await;
        assert_eq!(report.transferred, 1);
        assert_eq!(scheduler.transport().calls().len(), 2);
    }

    #[tokio::test]
    async fn endpoint_without_identity_is_skipped() {
        let fixture = Fixture::new();
        db_prod(&fixture);
        let scheduler = fixture.scheduler(&[db_node("10.0.0.5", None)], true);

        let report = scheduler.run_once_at(Utc::now()).await;

        assert_eq!(report.identity_unknown, 1);
        assert!(scheduler.transport().calls().is_empty());
        assert!(scheduler.history().is_empty());
        // The key is still stored locally.
        assert_eq!(report.keys_written, 1);
    }

    #[tokio::test]
    async fn failed_transfer_leaves_history_untouched() {
        let fixture = Fixture::new();
        db_prod(&fixture);
        let scheduler = fixture.scheduler(&[db_node("10.0.0.5", Some("u1"))], false);
        let now = Utc::now();

        let report = scheduler.run_once_at(now).await;
        assert_eq!(report.transfer_failures, 1);
        assert!(scheduler.history().is_empty());

        let report = scheduler.run_once_at(now).await;
        assert_eq!(report.transfer_failures, 1);
        assert_eq!(scheduler.transport().calls().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_history_still_caches_keys() {
        let fixture = Fixture::new();
        db_prod(&fixture);
        let history = HistoryStore::Unavailable {
            reason: "permission denied".to_string(),
        };
        let scheduler =
            fixture.scheduler_with_history(&[db_node("10.0.0.5", Some("u1"))], true, history);

        let report = scheduler.run_once_at(Utc::now()).await;

        assert_eq!(report.keys_written, 1);
        assert_eq!(report.history_failures, 1);
        assert!(scheduler.transport().calls().is_empty());
        assert_eq!(
            std::fs::read_to_string(fixture.keys_dir().join("db-prod.key")).unwrap(),
            "SECRETVALUE"
        );
    }

    #[tokio::test]
    async fn master_key_rotation_forces_redistribution() {
        let fixture = Fixture::new();
        db_prod(&fixture);
        let scheduler = fixture.scheduler(&[db_node("10.0.0.5", Some("u1"))], true);
        let now = Utc::now();
        scheduler.run_once_at(now).await;

        // Rotate and re-seal the catalog under the new master key.
        fixture.set_master(b"master-secret-2");
        db_prod(&fixture);

        let report = scheduler.run_once_at(now + TimeDelta::seconds(1)).await;
        assert_eq!(report.transferred, 1);
        assert_eq!(scheduler.transport().calls().len(), 2);
        assert_eq!(scheduler.history().len(), 2);
        assert!(scheduler
            .history()
            .last_distribution(&lookup(b"master-secret-2", "10.0.0.5", "u1"))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn missing_master_key_skips_run() {
        let fixture = Fixture::new();
        db_prod(&fixture);
        std::fs::remove_file(fixture.master_path()).unwrap();
        let scheduler = fixture.scheduler(&[db_node("10.0.0.5", Some("u1"))], true);

        let report = scheduler.run_once_at(Utc::now()).await;

        assert!(report.master_key_unavailable);
        assert!(scheduler.transport().calls().is_empty());
        assert!(!fixture.keys_dir().join("db-prod.key").exists());
    }

    #[tokio::test]
    async fn malformed_entries_do_not_abort_run() {
        let fixture = Fixture::new();
        fixture.add_item("broken-prod", &[("key", json!("NODEST"))]);
        db_prod(&fixture);
        let scheduler = fixture.scheduler(&[db_node("10.0.0.5", Some("u1"))], true);

        let report = scheduler.run_once_at(Utc::now()).await;

        assert_eq!(report.malformed_entries, 1);
        assert_eq!(report.transferred, 1);
        assert!(!fixture.keys_dir().join("broken-prod.key").exists());
    }

    #[tokio::test]
    async fn other_environments_are_ignored() {
        let fixture = Fixture::new();
        fixture.add_item(
            "db-staging",
            &[("destination", json!("role:db")), ("key", json!("STAGING"))],
        );
        let scheduler = fixture.scheduler(&[db_node("10.0.0.5", Some("u1"))], true);

        let report = scheduler.run_once_at(Utc::now()).await;

        assert_eq!(report.keys_decrypted, 0);
        assert!(scheduler.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn empty_destination_is_informational() {
        let fixture = Fixture::new();
        fixture.add_item(
            "web-prod",
            &[("destination", json!("role:web")), ("key", json!("W"))],
        );
        let scheduler = fixture.scheduler(&[db_node("10.0.0.5", Some("u1"))], true);

        let report = scheduler.run_once_at(Utc::now()).await;

        assert_eq!(report.empty_resolutions, 1);
        assert_eq!(report.keys_written, 1);
        assert!(scheduler.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn evaluate_gates_unknown_identity_regardless_of_history() {
        let fixture = Fixture::new();
        let scheduler = fixture.scheduler(&[], true);
        let master = MasterKey::from_secret(MASTER).unwrap();
        let key = KeyRecord::new("db-prod", "role:db", "S");
        let endpoint = Endpoint::new("10.0.0.5", InstanceId::Unknown);

        let outcome = scheduler
            .evaluate(
                DistributionTask {
                    key: &key,
                    endpoint: &endpoint,
                },
                &master,
                Utc::now(),
            )
            .await;

        assert_eq!(outcome, PairOutcome::IdentityUnknown);
        assert!(scheduler.transport().calls().is_empty());
        assert!(scheduler.history().is_empty());
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let fixture = Fixture::new();
        let scheduler = fixture.scheduler(&[], true);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), scheduler.run(Duration::from_secs(3600), shutdown))
            .await
            .expect("scheduler should stop once cancelled");
    }
}
