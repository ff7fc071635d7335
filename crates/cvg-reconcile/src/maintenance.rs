use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cvg_storage::StorageEngine;
use cvg_types::{
    CurrentDatabases, CvgError, PatchSet, PlanSnapshot, ReconcileErrors, ServerId, SyncError,
};

use crate::agency::{CurrentSink, PlanSource};
use crate::collection::CollectionReconciler;
use crate::current::CurrentReporter;
use crate::database::DatabaseReconciler;
use crate::scope::ScopeLocks;

/// `[sync]` section of the node configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Pause between maintenance passes.
    pub interval_ms: u64,
    /// Current prefix patch paths are written against.
    pub current_root: String,
    /// Delete Current entries for databases this server no longer hosts.
    pub retract_stale: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            interval_ms: 1_000,
            current_root: "/arango/Current".to_string(),
            retract_stale: false,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Outcome of one maintenance pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub databases: ReconcileErrors,
    /// Collection-pass errors per database; databases without errors are absent.
    pub collections: BTreeMap<String, ReconcileErrors>,
    pub current: PatchSet,
    /// The pass stopped early; `current` is empty.
    pub cancelled: bool,
}

impl PassReport {
    /// Nothing failed and nothing was left undone.
    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.databases.is_empty() && self.collections.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.databases.len() + self.collections.values().map(ReconcileErrors::len).sum::<usize>()
    }
}

/// Drives the reconcilers for one server.
pub struct Maintenance<E> {
    engine: Arc<E>,
    databases: DatabaseReconciler<E>,
    collections: Arc<CollectionReconciler<E>>,
    reporter: CurrentReporter<E>,
}

impl<E: StorageEngine> Maintenance<E> {
    pub fn new(engine: Arc<E>, server: ServerId, config: &SyncConfig) -> Self {
        let locks = Arc::new(ScopeLocks::new());
        Maintenance {
            databases: DatabaseReconciler::new(engine.clone(), locks.clone()),
            collections: Arc::new(CollectionReconciler::new(engine.clone(), server.clone(), locks)),
            reporter: CurrentReporter::new(engine.clone(), server, config.current_root.clone())
                .with_retract_stale(config.retract_stale),
            engine,
        }
    }

    pub fn server(&self) -> &ServerId {
        self.collections.server()
    }

    /// One full pass: databases, then the shards of every local database
    /// (in parallel, one task per database), then Current.
    ///
    /// Only a failure to list local databases fails the pass; everything
    /// else is reported per entity.
    pub async fn run_pass(
        &self,
        plan: &PlanSnapshot,
        observed: &CurrentDatabases,
        cancel: &CancellationToken,
    ) -> Result<PassReport, CvgError> {
        let mut report = PassReport {
            databases: self.databases.reconcile_until(&plan.databases, cancel).await,
            ..Default::default()
        };
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let local = self.engine.list_databases().await?;
        let mut tasks = JoinSet::new();
        for db in local {
            let planned = plan.collections_for(&db.name).cloned().unwrap_or_default();
            let collections = self.collections.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let errors = collections.reconcile_until(&db.name, &planned, &cancel).await;
                (db.name, errors)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((db, errors)) if !errors.is_empty() => {
                    report.collections.insert(db, errors);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "collection pass task failed");
                    let mut errors = ReconcileErrors::new();
                    errors.record("", SyncError::Mutation(CvgError::Storage(err.to_string())));
                    report.collections.insert(String::new(), errors);
                }
            }
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        report.current = self.reporter.compute_updates(&report.databases, observed).await?;
        Ok(report)
    }

    /// Fetch Plan and Current, run a pass and write the resulting patch set.
    pub async fn run_once<A>(
        &self,
        agency: &A,
        cancel: &CancellationToken,
    ) -> Result<PassReport, CvgError>
    where
        A: PlanSource + CurrentSink,
    {
        let plan = agency.plan().await?;
        let observed = agency.current().await?;
        let report = self.run_pass(&plan, &observed, cancel).await?;

        if !report.current.is_empty() {
            agency.apply(&report.current).await?;
            info!(writes = report.current.len(), "reported local state to Current");
        }
        if report.is_clean() {
            debug!("maintenance pass converged");
        } else {
            warn!(
                errors = report.error_count(),
                cancelled = report.cancelled,
                "maintenance pass left work undone"
            );
        }
        Ok(report)
    }

    /// Run passes every `interval` until `cancel` fires. Passes never overlap.
    pub async fn run<A>(&self, agency: &A, interval: Duration, cancel: CancellationToken)
    where
        A: PlanSource + CurrentSink,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.run_once(agency, &cancel).await {
                warn!(error = %err, "maintenance pass failed");
            }
        }
        info!("maintenance loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvg_storage::{EngineOp, MemEngine};
    use cvg_types::{PatchOp, ShardRole};
    use serde_json::json;

    fn plan(value: serde_json::Value) -> PlanSnapshot {
        PlanSnapshot::from_json(&value).unwrap()
    }

    fn maintenance(engine: &Arc<MemEngine>) -> Maintenance<MemEngine> {
        Maintenance::new(engine.clone(), ServerId::from("repltest"), &SyncConfig::default())
    }

    fn one_shard(server: &str) -> serde_json::Value {
        json!({
            "Databases": {
                "_system": {"id": 1, "name": "_system"},
                "test": {"id": 2, "name": "test"}
            },
            "Collections": {"test": {"100001": {
                "id": "100001", "name": "c", "status": 3,
                "shards": {"s100001": [server]}
            }}}
        })
    }

    #[tokio::test]
    async fn full_pass_converges_and_reports() {
        let engine = Arc::new(MemEngine::new());
        let cancel = CancellationToken::new();
        let report = maintenance(&engine)
            .run_pass(&plan(one_shard("repltest")), &CurrentDatabases::new(), &cancel)
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(engine.shard("test", "s100001").await.unwrap().role, ShardRole::Leader);
        assert!(matches!(
            report.current.get("/arango/Current/Databases/test/repltest"),
            Some(PatchOp::Set { .. })
        ));
    }

    #[tokio::test]
    async fn databases_absent_from_collections_lose_their_shards() {
        let engine = Arc::new(MemEngine::new());
        let m = maintenance(&engine);
        let cancel = CancellationToken::new();
        m.run_pass(&plan(one_shard("repltest")), &CurrentDatabases::new(), &cancel).await.unwrap();

        let no_collections = json!({"Databases": {"test": {"id": 2, "name": "test"}}});
        m.run_pass(&plan(no_collections), &CurrentDatabases::new(), &cancel).await.unwrap();
        assert!(engine.shard("test", "s100001").await.is_none());
        assert_eq!(engine.database_names().await, vec!["_system", "test"]);
    }

    #[tokio::test]
    async fn errors_are_collected_per_database() {
        let engine = Arc::new(MemEngine::new());
        engine.fail_on(EngineOp::CreateShard, "s100001").await;
        let cancel = CancellationToken::new();
        let report = maintenance(&engine)
            .run_pass(&plan(one_shard("repltest")), &CurrentDatabases::new(), &cancel)
            .await
            .unwrap();

        assert!(!report.is_clean());
        assert_eq!(report.error_count(), 1);
        assert!(report.collections["test"].contains("s100001"));
    }

    #[tokio::test]
    async fn cancelled_pass_writes_nothing() {
        let engine = Arc::new(MemEngine::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = maintenance(&engine)
            .run_pass(&plan(one_shard("repltest")), &CurrentDatabases::new(), &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert!(report.current.is_empty());
        assert_eq!(engine.database_names().await, vec!["_system"]);
    }

    #[test]
    fn sync_config_defaults() {
        let config: SyncConfig = serde_json::from_value(json!({"retract_stale": true})).unwrap();
        assert_eq!(config.interval_ms, 1_000);
        assert_eq!(config.current_root, "/arango/Current");
        assert!(config.retract_stale);
        assert_eq!(SyncConfig { interval_ms: 0, ..config }.interval(), Duration::from_millis(1));
    }
}
