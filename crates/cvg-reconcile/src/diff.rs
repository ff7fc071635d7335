use std::collections::HashSet;

use cvg_types::{ReconcileErrors, SyncError};

/// Names in `wanted` that are not in `have`, in `wanted` order, each once.
pub fn absent_from<'a, 'b>(
    wanted: impl IntoIterator<Item = &'a str>,
    have: impl IntoIterator<Item = &'b str>,
) -> Vec<&'a str> {
    let have: HashSet<&'b str> = have.into_iter().collect();
    let mut seen = HashSet::new();
    wanted
        .into_iter()
        .filter(|name| !have.contains(name) && seen.insert(*name))
        .collect()
}

/// Record a failure for `entity` and log it.
pub(crate) fn record(errors: &mut ReconcileErrors, scope: &str, entity: &str, err: SyncError) {
    tracing::warn!(scope, entity, error = %err, "entity did not converge");
    errors.record(entity, err);
}
