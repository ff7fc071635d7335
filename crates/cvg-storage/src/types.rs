use cvg_types::{IndexSpec, LoadState, ShardConfig, ShardRole};

/// Persisted form of a database, keyed by name.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredDatabase {
    pub id: String,
}

/// Persisted form of a shard, keyed by `db ++ \x00 ++ shard`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredShard {
    pub config: ShardConfig,
    pub load_state: LoadState,
    pub role: ShardRole,
}

impl StoredShard {
    pub fn created(config: ShardConfig) -> Self {
        StoredShard { config, load_state: LoadState::Loaded, role: ShardRole::Leader }
    }
}

/// Persisted form of an index.
///
/// Kept separate from [`IndexSpec`] because the Plan-facing type accepts
/// numeric or string ids, which bincode cannot decode.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredIndex {
    pub id: String,
    pub index_type: String,
    pub fields: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
}

impl From<&IndexSpec> for StoredIndex {
    fn from(spec: &IndexSpec) -> Self {
        StoredIndex {
            id: spec.id.clone(),
            index_type: spec.index_type.clone(),
            fields: spec.fields.clone(),
            unique: spec.unique,
            sparse: spec.sparse,
        }
    }
}

impl From<StoredIndex> for IndexSpec {
    fn from(stored: StoredIndex) -> Self {
        IndexSpec {
            id: stored.id,
            index_type: stored.index_type,
            fields: stored.fields,
            unique: stored.unique,
            sparse: stored.sparse,
        }
    }
}
