use std::collections::BTreeMap;

/// Failure reported by the storage engine or a coordination-store
/// collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CvgError {
    #[error("database '{0}' not found")]
    DatabaseNotFound(String),
    #[error("shard '{0}' not found")]
    ShardNotFound(String),
    #[error("index '{0}' not found")]
    IndexNotFound(String),
    #[error("'{0}' already exists")]
    AlreadyExists(String),
    #[error("illegal name '{0}'")]
    InvalidName(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("coordination error: {0}")]
    Coordination(String),
}

impl CvgError {
    /// Numeric code published in Current error entries.
    pub fn error_num(&self) -> i32 {
        match self {
            CvgError::DatabaseNotFound(_) => 1228,
            CvgError::ShardNotFound(_) => 1203,
            CvgError::IndexNotFound(_) => 1212,
            CvgError::AlreadyExists(_) => 1207,
            CvgError::InvalidName(_) => 1208,
            CvgError::Forbidden(_) => 11,
            CvgError::InvalidArgument(_) => 10,
            CvgError::Storage(_) | CvgError::Coordination(_) => 4,
        }
    }
}

/// Why a single entity failed to converge during a reconciliation pass.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The database or shard could not be created, or its plan entry could
    /// not be parsed.
    #[error("creation failed: {0}")]
    Creation(#[source] CvgError),
    /// A drop, load-state, role or index change was rejected.
    #[error("mutation failed: {0}")]
    Mutation(#[source] CvgError),
}

impl SyncError {
    pub fn cause(&self) -> &CvgError {
        match self {
            SyncError::Creation(e) | SyncError::Mutation(e) => e,
        }
    }
}

/// Per-entity failures of one reconciliation pass, keyed by entity name.
///
/// An empty mapping means everything converged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileErrors(BTreeMap<String, SyncError>);

impl ReconcileErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` for `name`. The first failure recorded for a name wins;
    /// returns `false` when one was already present.
    pub fn record(&mut self, name: impl Into<String>, err: SyncError) -> bool {
        match self.0.entry(name.into()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(err);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&SyncError> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SyncError)> {
        self.0.iter()
    }
}
