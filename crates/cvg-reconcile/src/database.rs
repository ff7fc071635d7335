use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cvg_storage::StorageEngine;
use cvg_types::{CvgError, DatabasePlan, Planned, ReconcileErrors, SyncError, SYSTEM_DATABASE};

use crate::diff::{absent_from, record};
use crate::scope::ScopeLocks;

const SCOPE: &str = "databases";

/// Makes the set of local databases equal the set named in the Plan.
///
/// `_system` is never created or dropped here. A database whose Plan entry
/// cannot be read is reported as a creation failure and left alone: it is
/// neither created nor dropped.
pub struct DatabaseReconciler<E> {
    engine: Arc<E>,
    locks: Arc<ScopeLocks>,
}

impl<E: StorageEngine> DatabaseReconciler<E> {
    pub fn new(engine: Arc<E>, locks: Arc<ScopeLocks>) -> Self {
        Self { engine, locks }
    }

    pub async fn reconcile(&self, planned: &Planned<DatabasePlan>) -> ReconcileErrors {
        self.reconcile_until(planned, &CancellationToken::new()).await
    }

    /// Like [`reconcile`](Self::reconcile), stopping between databases once
    /// `cancel` fires.
    pub async fn reconcile_until(
        &self,
        planned: &Planned<DatabasePlan>,
        cancel: &CancellationToken,
    ) -> ReconcileErrors {
        let mut errors = ReconcileErrors::new();

        for (name, detail) in &planned.malformed {
            if name != SYSTEM_DATABASE {
                let err = CvgError::InvalidArgument(format!("unreadable Plan entry: {detail}"));
                record(&mut errors, SCOPE, name, SyncError::Creation(err));
            }
        }

        let local = match self.engine.list_databases().await {
            Ok(local) => local,
            Err(err) => {
                for name in planned.entries.keys().filter(|n| *n != SYSTEM_DATABASE) {
                    record(&mut errors, SCOPE, name, SyncError::Creation(err.clone()));
                }
                return errors;
            }
        };
        let local_names: Vec<&str> = local.iter().map(|db| db.name.as_str()).collect();

        let wanted = planned
            .entries
            .keys()
            .map(String::as_str)
            .filter(|name| *name != SYSTEM_DATABASE);
        let mut created = 0usize;
        for name in absent_from(wanted, local_names.iter().copied()) {
            if cancel.is_cancelled() {
                debug!("database pass cancelled");
                return errors;
            }
            let Some(plan) = planned.entries.get(name) else { continue };
            let id = (!plan.id.is_empty()).then_some(plan.id.as_str());

            let _scope = self.locks.lock(name).await;
            match self.is_local(name).await {
                Ok(false) => {}
                Ok(true) => {
                    debug!(db = %name, "database created by an overlapping pass");
                    continue;
                }
                Err(err) => {
                    record(&mut errors, SCOPE, name, SyncError::Creation(err));
                    continue;
                }
            }
            match self.engine.create_database(name, id).await {
                Ok(info) => {
                    info!(db = %info.name, id = %info.id, "created database");
                    created += 1;
                }
                Err(err) => record(&mut errors, SCOPE, name, SyncError::Creation(err)),
            }
        }

        let named = planned
            .entries
            .keys()
            .chain(planned.malformed.keys())
            .map(String::as_str);
        let mut dropped = 0usize;
        for name in absent_from(local_names.iter().copied(), named) {
            if name == SYSTEM_DATABASE {
                continue;
            }
            if cancel.is_cancelled() {
                debug!("database pass cancelled");
                return errors;
            }
            {
                let _scope = self.locks.lock(name).await;
                match self.is_local(name).await {
                    Ok(true) => match self.engine.drop_database(name).await {
                        Ok(()) => {
                            info!(db = %name, "dropped database");
                            dropped += 1;
                        }
                        Err(err) => record(&mut errors, SCOPE, name, SyncError::Mutation(err)),
                    },
                    Ok(false) => debug!(db = %name, "database dropped by an overlapping pass"),
                    Err(err) => record(&mut errors, SCOPE, name, SyncError::Mutation(err)),
                }
            }
            self.locks.forget(name);
        }

        debug!(created, dropped, failed = errors.len(), "database pass finished");
        errors
    }

    /// Looks `name` up again. Called under its scope lock, since the listing
    /// taken at the start of the pass may be stale by then.
    async fn is_local(&self, name: &str) -> Result<bool, CvgError> {
        let local = self.engine.list_databases().await?;
        Ok(local.iter().any(|db| db.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvg_storage::{EngineOp, FjallEngine, MemEngine};

    fn plan(names: &[&str]) -> Planned<DatabasePlan> {
        names
            .iter()
            .map(|name| (*name, DatabasePlan { id: String::new(), name: name.to_string() }))
            .collect()
    }

    fn reconciler(engine: &Arc<MemEngine>) -> DatabaseReconciler<MemEngine> {
        DatabaseReconciler::new(engine.clone(), Arc::new(ScopeLocks::new()))
    }

    #[tokio::test]
    async fn creates_planned_and_drops_unplanned() {
        let engine = Arc::new(MemEngine::new());
        let dbs = reconciler(&engine);

        let errors = dbs.reconcile(&plan(&["_system", "test"])).await;
        assert!(errors.is_empty());
        assert_eq!(engine.database_names().await, vec!["_system", "test"]);

        let errors = dbs.reconcile(&plan(&["_system"])).await;
        assert!(errors.is_empty());
        assert_eq!(engine.database_names().await, vec!["_system"]);
    }

    #[tokio::test]
    async fn system_survives_an_empty_plan() {
        let engine = Arc::new(MemEngine::new());
        let errors = reconciler(&engine).reconcile(&Planned::new()).await;
        assert!(errors.is_empty());
        assert_eq!(engine.database_names().await, vec!["_system"]);
    }

    #[tokio::test]
    async fn planned_id_is_used() {
        let engine = Arc::new(MemEngine::new());
        let mut planned = Planned::new();
        planned.insert("test", DatabasePlan { id: "4711".into(), name: "test".into() });
        reconciler(&engine).reconcile(&planned).await;

        let local = engine.list_databases().await.unwrap();
        let test = local.iter().find(|db| db.name == "test").unwrap();
        assert_eq!(test.id, "4711");
    }

    #[tokio::test]
    async fn second_pass_is_a_noop() {
        let engine = Arc::new(MemEngine::new());
        let dbs = reconciler(&engine);
        dbs.reconcile(&plan(&["a", "b"])).await;
        let before = engine.mutation_count().await;
        let errors = dbs.reconcile(&plan(&["a", "b"])).await;
        assert!(errors.is_empty());
        assert_eq!(engine.mutation_count().await, before);
    }

    #[tokio::test]
    async fn invalid_name_is_a_creation_error() {
        let engine = Arc::new(MemEngine::new());
        let errors = reconciler(&engine).reconcile(&plan(&["ok", "-bad"])).await;
        assert!(matches!(errors.get("-bad"), Some(SyncError::Creation(CvgError::InvalidName(_)))));
        assert!(!errors.contains("ok"));
        assert_eq!(engine.database_names().await, vec!["_system", "ok"]);
    }

    #[tokio::test]
    async fn drop_failure_is_a_mutation_error() {
        let engine = Arc::new(MemEngine::new());
        let dbs = reconciler(&engine);
        dbs.reconcile(&plan(&["keep", "gone"])).await;
        engine.fail_on(EngineOp::DropDatabase, "gone").await;

        let errors = dbs.reconcile(&plan(&["keep"])).await;
        assert!(matches!(errors.get("gone"), Some(SyncError::Mutation(_))));
        assert_eq!(engine.database_names().await, vec!["_system", "gone", "keep"]);
    }

    #[tokio::test]
    async fn malformed_entry_is_neither_created_nor_dropped() {
        let engine = Arc::new(MemEngine::new());
        let dbs = reconciler(&engine);
        dbs.reconcile(&plan(&["broken"])).await;

        let mut planned = Planned::new();
        planned.malformed.insert("broken".into(), "invalid type: integer".into());
        planned.malformed.insert("fresh".into(), "invalid type: integer".into());
        let errors = dbs.reconcile(&planned).await;

        assert!(matches!(errors.get("broken"), Some(SyncError::Creation(_))));
        assert!(matches!(errors.get("fresh"), Some(SyncError::Creation(_))));
        assert_eq!(engine.database_names().await, vec!["_system", "broken"]);
    }

    #[tokio::test]
    async fn listing_failure_fails_every_planned_database() {
        let engine = Arc::new(MemEngine::new());
        engine.fail_on(EngineOp::ListDatabases, "").await;
        let errors = reconciler(&engine).reconcile(&plan(&["_system", "a", "b"])).await;
        assert_eq!(errors.len(), 2);
        assert!(!errors.contains("_system"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_passes_both_converge_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FjallEngine::open(dir.path()).unwrap());
        let locks = Arc::new(ScopeLocks::new());
        let first = DatabaseReconciler::new(engine.clone(), locks.clone());
        let second = DatabaseReconciler::new(engine.clone(), locks);
        let names = ["_system", "x1", "x2", "x3", "x4", "x5"];

        let planned = plan(&names);
        let (a, b) = tokio::join!(first.reconcile(&planned), second.reconcile(&planned));
        assert!(a.is_empty(), "{a:?}");
        assert!(b.is_empty(), "{b:?}");
        let mut local: Vec<String> =
            engine.list_databases().await.unwrap().into_iter().map(|db| db.name).collect();
        local.sort();
        assert_eq!(local, names);

        let planned = plan(&["_system"]);
        let (a, b) = tokio::join!(first.reconcile(&planned), second.reconcile(&planned));
        assert!(a.is_empty(), "{a:?}");
        assert!(b.is_empty(), "{b:?}");
        let local = engine.list_databases().await.unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].name, "_system");
    }

    #[tokio::test]
    async fn cancelled_pass_changes_nothing() {
        let engine = Arc::new(MemEngine::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let errors = reconciler(&engine).reconcile_until(&plan(&["a"]), &cancel).await;
        assert!(errors.is_empty());
        assert_eq!(engine.database_names().await, vec!["_system"]);
    }
}
