mod current;
mod error;
mod names;
mod plan;

pub use current::{current_database_path, CurrentDatabases, CurrentEntry, PatchOp, PatchSet};
pub use error::{CvgError, ReconcileErrors, SyncError};
pub use names::{validate_database_name, validate_shard_name, MAX_NAME_LENGTH, SYSTEM_DATABASE};
pub use plan::{
    CollectionPlan, DatabasePlan, IndexSpec, KeyOptions, PlanSnapshot, Planned, ServerList,
    ShardConfig, PRIMARY_INDEX_TYPE,
};

/// Stable identity of the running server, fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        ServerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        ServerId(s.to_string())
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        ServerId(s)
    }
}

/// Storage-engine load state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LoadState {
    Loaded,
    Unloaded,
}

/// Replication role a local shard holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ShardRole {
    Leader,
    /// Replicates from `leader`.
    Follower { leader: ServerId },
}

impl ShardRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, ShardRole::Leader)
    }
}

/// A database as the local storage engine knows it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DatabaseInfo {
    pub id: String,
    pub name: String,
}

/// A local shard as listed by the storage engine. Indexes are listed
/// separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub name: String,
    pub load_state: LoadState,
    pub role: ShardRole,
}
