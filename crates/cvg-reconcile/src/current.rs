use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use cvg_storage::StorageEngine;
use cvg_types::{
    current_database_path, CurrentDatabases, CurrentEntry, CvgError, PatchOp, PatchSet,
    ReconcileErrors, ServerId,
};

/// Computes the Current writes that make this server's entries match what
/// exists locally.
///
/// Reads live local state, not the Plan. Unchanged entries produce no
/// write, so a converged server reports an empty patch set.
pub struct CurrentReporter<E> {
    engine: Arc<E>,
    server: ServerId,
    root: String,
    retract_stale: bool,
}

impl<E: StorageEngine> CurrentReporter<E> {
    pub fn new(engine: Arc<E>, server: ServerId, root: impl Into<String>) -> Self {
        Self { engine, server, root: root.into(), retract_stale: false }
    }

    /// Also delete entries this server reported for databases it neither
    /// hosts nor failed to create.
    pub fn with_retract_stale(mut self, retract_stale: bool) -> Self {
        self.retract_stale = retract_stale;
        self
    }

    /// `last_known` holds the errors of the latest database pass. A
    /// database that failed and does not exist locally is reported with its
    /// error.
    pub async fn compute_updates(
        &self,
        last_known: &ReconcileErrors,
        observed: &CurrentDatabases,
    ) -> Result<PatchSet, CvgError> {
        let local = self.engine.list_databases().await?;
        let mut patch = PatchSet::new();

        let mut hosted = BTreeSet::new();
        for db in &local {
            hosted.insert(db.name.as_str());
            self.set_if_changed(&mut patch, observed, &db.name, CurrentEntry::healthy(db));
        }

        for (name, err) in last_known.iter() {
            if !hosted.contains(name.as_str()) {
                self.set_if_changed(&mut patch, observed, name, CurrentEntry::failed(name, err));
            }
        }

        if self.retract_stale {
            for db in observed.reported_by(&self.server) {
                if !hosted.contains(db) && !last_known.contains(db) {
                    let path = current_database_path(&self.root, db, &self.server);
                    patch.insert(path, PatchOp::Delete);
                }
            }
        }

        debug!(server = %self.server, writes = patch.len(), "computed Current updates");
        Ok(patch)
    }

    fn set_if_changed(
        &self,
        patch: &mut PatchSet,
        observed: &CurrentDatabases,
        db: &str,
        entry: CurrentEntry,
    ) {
        if observed.entry(db, &self.server) == Some(&entry) {
            return;
        }
        let path = current_database_path(&self.root, db, &self.server);
        patch.insert(path, PatchOp::Set { new: entry });
    }
}
