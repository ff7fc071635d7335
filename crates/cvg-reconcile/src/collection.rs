use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cvg_storage::StorageEngine;
use cvg_types::{
    CollectionPlan, CvgError, Planned, ReconcileErrors, ServerId, ServerList, ShardInfo, ShardRole,
    SyncError,
};

use crate::diff::{absent_from, record};
use crate::scope::ScopeLocks;

/// What this server owes a planned shard.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Responsibility {
    Responsible(ShardRole),
    NotResponsible,
}

/// Converges the shards of one database: existence, load state, role and
/// index set.
///
/// Errors are keyed by shard name. Index failures are keyed by the shard
/// that owns the index. A failure to list the database's shards is keyed by
/// the database name.
pub struct CollectionReconciler<E> {
    engine: Arc<E>,
    server: ServerId,
    locks: Arc<ScopeLocks>,
}

impl<E: StorageEngine> CollectionReconciler<E> {
    pub fn new(engine: Arc<E>, server: ServerId, locks: Arc<ScopeLocks>) -> Self {
        Self { engine, server, locks }
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    fn responsibility(&self, servers: &ServerList) -> Responsibility {
        match servers.role_for(&self.server) {
            Some(role) => Responsibility::Responsible(role),
            None => Responsibility::NotResponsible,
        }
    }

    pub async fn reconcile(&self, db: &str, planned: &Planned<CollectionPlan>) -> ReconcileErrors {
        self.reconcile_until(db, planned, &CancellationToken::new()).await
    }

    /// Like [`reconcile`](Self::reconcile), stopping between shards once
    /// `cancel` fires.
    pub async fn reconcile_until(
        &self,
        db: &str,
        planned: &Planned<CollectionPlan>,
        cancel: &CancellationToken,
    ) -> ReconcileErrors {
        let _scope = self.locks.lock(db).await;
        let mut errors = ReconcileErrors::new();

        for (id, detail) in &planned.malformed {
            let err = CvgError::InvalidArgument(format!("unreadable Plan entry: {detail}"));
            record(&mut errors, db, id, SyncError::Creation(err));
        }

        let mut local: BTreeMap<String, ShardInfo> = match self.engine.list_shards(db).await {
            Ok(shards) => shards.into_iter().map(|s| (s.name.clone(), s)).collect(),
            Err(err) => {
                record(&mut errors, db, db, SyncError::Mutation(err));
                return errors;
            }
        };

        if planned.malformed.is_empty() {
            let named: BTreeSet<&str> = planned
                .entries
                .values()
                .flat_map(|plan| plan.shards.keys())
                .map(String::as_str)
                .collect();
            let stale: Vec<String> = absent_from(local.keys().map(String::as_str), named)
                .into_iter()
                .map(str::to_string)
                .collect();
            for shard in stale {
                if cancel.is_cancelled() {
                    debug!(db, "collection pass cancelled");
                    return errors;
                }
                match self.engine.drop_shard(db, &shard).await {
                    Ok(()) => {
                        info!(db, shard = %shard, "dropped unplanned shard");
                        local.remove(&shard);
                    }
                    Err(err) => record(&mut errors, db, &shard, SyncError::Mutation(err)),
                }
            }
        } else {
            warn!(
                db,
                unreadable = planned.malformed.len(),
                "keeping unplanned shards while the Plan has unreadable collections"
            );
        }

        for plan in planned.entries.values() {
            for (shard, servers) in &plan.shards {
                if cancel.is_cancelled() {
                    debug!(db, "collection pass cancelled");
                    return errors;
                }
                match self.responsibility(servers) {
                    Responsibility::NotResponsible => {
                        self.release(db, shard, &mut local, &mut errors).await
                    }
                    Responsibility::Responsible(role) => {
                        self.converge_shard(db, shard, plan, role, &mut local, &mut errors).await
                    }
                }
            }
        }

        debug!(db, failed = errors.len(), "collection pass finished");
        errors
    }

    async fn release(
        &self,
        db: &str,
        shard: &str,
        local: &mut BTreeMap<String, ShardInfo>,
        errors: &mut ReconcileErrors,
    ) {
        if !local.contains_key(shard) {
            return;
        }
        match self.engine.drop_shard(db, shard).await {
            Ok(()) => {
                info!(db, shard, "dropped shard this server is no longer responsible for");
                local.remove(shard);
            }
            Err(err) => record(errors, db, shard, SyncError::Mutation(err)),
        }
    }

    async fn converge_shard(
        &self,
        db: &str,
        shard: &str,
        plan: &CollectionPlan,
        role: ShardRole,
        local: &mut BTreeMap<String, ShardInfo>,
        errors: &mut ReconcileErrors,
    ) {
        if !local.contains_key(shard) {
            match self.engine.create_shard(db, shard, &plan.shard_config()).await {
                Ok(()) => info!(db, shard, collection = %plan.name, "created shard"),
                Err(err) => {
                    record(errors, db, shard, SyncError::Creation(err));
                    return;
                }
            }
        }

        match self.engine.set_load_state(db, shard, plan.status).await {
            Ok(true) => info!(db, shard, state = ?plan.status, "changed shard load state"),
            Ok(false) => {}
            Err(err) => record(errors, db, shard, SyncError::Mutation(err)),
        }

        match self.engine.set_role(db, shard, &role).await {
            Ok(true) => match &role {
                ShardRole::Leader => info!(db, shard, "shard is now leader"),
                ShardRole::Follower { leader } => {
                    info!(db, shard, leader = %leader, "shard is now follower")
                }
            },
            Ok(false) => {}
            Err(err) => record(errors, db, shard, SyncError::Mutation(err)),
        }

        self.converge_indexes(db, shard, plan, errors).await;
    }

    async fn converge_indexes(
        &self,
        db: &str,
        shard: &str,
        plan: &CollectionPlan,
        errors: &mut ReconcileErrors,
    ) {
        let present = match self.engine.list_indexes(db, shard).await {
            Ok(present) => present,
            Err(err) => {
                record(errors, db, shard, SyncError::Mutation(err));
                return;
            }
        };
        let present_ids: Vec<&str> =
            present.iter().filter(|idx| !idx.is_primary()).map(|idx| idx.id.as_str()).collect();
        let planned_ids = plan.secondary_indexes().map(|idx| idx.id.as_str());

        for id in absent_from(planned_ids, present_ids.iter().copied()) {
            let Some(spec) = plan.secondary_indexes().find(|idx| idx.id == id) else { continue };
            match self.engine.create_index(db, shard, spec).await {
                Ok(()) => info!(db, shard, index = id, kind = %spec.index_type, "created index"),
                Err(err) => record(errors, db, shard, SyncError::Mutation(err)),
            }
        }

        let planned_ids = plan.secondary_indexes().map(|idx| idx.id.as_str());
        for id in absent_from(present_ids.iter().copied(), planned_ids) {
            match self.engine.drop_index(db, shard, id).await {
                Ok(()) => info!(db, shard, index = id, "dropped index"),
                Err(err) => record(errors, db, shard, SyncError::Mutation(err)),
            }
        }
    }
}
