use std::collections::BTreeMap;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{CvgError, LoadState, ServerId, ShardRole};

/// Index type that every shard carries implicitly.
pub const PRIMARY_INDEX_TYPE: &str = "primary";

/// Accepts an identifier written either as a JSON number or as a string.
pub(crate) fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }
    Ok(match RawId::deserialize(d)? {
        RawId::Text(s) => s,
        RawId::Unsigned(n) => n.to_string(),
        RawId::Signed(n) => n.to_string(),
    })
}

/// Collection status codes: 1 new-born, 2 unloaded, 3 loaded, 4 unloading,
/// 5 deleted, 6 loading. Strings `LOADED`/`UNLOADED` are accepted too.
fn de_status<'de, D: Deserializer<'de>>(d: D) -> Result<LoadState, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawStatus {
        Code(u64),
        Text(String),
    }
    match RawStatus::deserialize(d)? {
        RawStatus::Code(1 | 2 | 4) => Ok(LoadState::Unloaded),
        RawStatus::Code(3 | 6) => Ok(LoadState::Loaded),
        RawStatus::Code(code) => {
            Err(D::Error::custom(format!("unsupported collection status {code}")))
        }
        RawStatus::Text(s) if s.eq_ignore_ascii_case("loaded") => Ok(LoadState::Loaded),
        RawStatus::Text(s) if s.eq_ignore_ascii_case("unloaded") => Ok(LoadState::Unloaded),
        RawStatus::Text(s) => Err(D::Error::custom(format!("unsupported collection status '{s}'"))),
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

fn default_journal_size() -> u64 {
    32 * 1024 * 1024
}

fn default_index_buckets() -> u32 {
    8
}

fn default_collection_type() -> u32 {
    2
}

fn default_key_generator() -> String {
    "traditional".to_string()
}

/// The ordered list of servers holding one shard.
///
/// Position 0 is the leader; every later entry is a follower replicating
/// from it. Leadership is decided by whoever wrote the Plan, never here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerList(Vec<ServerId>);

impl ServerList {
    pub fn leader(&self) -> Option<&ServerId> {
        self.0.first()
    }

    pub fn contains(&self, server: &ServerId) -> bool {
        self.0.iter().any(|s| s == server)
    }

    /// The role `server` must hold, or `None` when it is not responsible
    /// for the shard at all.
    pub fn role_for(&self, server: &ServerId) -> Option<ShardRole> {
        let leader = self.leader()?;
        if leader == server {
            Some(ShardRole::Leader)
        } else if self.contains(server) {
            Some(ShardRole::Follower { leader: leader.clone() })
        } else {
            None
        }
    }
}

impl<S: Into<ServerId>> FromIterator<S> for ServerList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        ServerList(iter.into_iter().map(Into::into).collect())
    }
}

/// One index as declared in the Plan or present on a local shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub index_type: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

impl IndexSpec {
    /// The implicit primary index every shard is created with.
    pub fn primary() -> Self {
        IndexSpec {
            id: "0".to_string(),
            index_type: PRIMARY_INDEX_TYPE.to_string(),
            fields: vec!["_key".to_string()],
            unique: true,
            sparse: false,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.index_type == PRIMARY_INDEX_TYPE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyOptions {
    #[serde(rename = "type", default = "default_key_generator")]
    pub generator: String,
    #[serde(default = "default_true")]
    pub allow_user_keys: bool,
    #[serde(default)]
    pub increment: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

impl Default for KeyOptions {
    fn default() -> Self {
        KeyOptions {
            generator: default_key_generator(),
            allow_user_keys: true,
            increment: None,
            offset: None,
        }
    }
}

/// A planned database entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabasePlan {
    /// Empty when the Plan carries no id; the engine then assigns one.
    #[serde(default, deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A planned collection and the placement of its shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionPlan {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default = "default_one")]
    pub number_of_shards: u32,
    #[serde(default = "default_one")]
    pub replication_factor: u32,
    #[serde(default)]
    pub shard_keys: Vec<String>,
    #[serde(deserialize_with = "de_status")]
    pub status: LoadState,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default = "default_true")]
    pub do_compact: bool,
    #[serde(default)]
    pub is_volatile: bool,
    #[serde(default = "default_journal_size")]
    pub journal_size: u64,
    #[serde(default)]
    pub key_options: KeyOptions,
    #[serde(default)]
    pub wait_for_sync: bool,
    #[serde(default = "default_index_buckets")]
    pub index_buckets: u32,
    #[serde(rename = "type", default = "default_collection_type")]
    pub collection_type: u32,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub shards: BTreeMap<String, ServerList>,
}

impl CollectionPlan {
    /// Storage configuration for creating one of this collection's shards.
    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            collection_id: self.id.clone(),
            collection_type: self.collection_type,
            do_compact: self.do_compact,
            is_volatile: self.is_volatile,
            journal_size: self.journal_size,
            key_options: self.key_options.clone(),
            wait_for_sync: self.wait_for_sync,
            index_buckets: self.index_buckets,
            shard_keys: self.shard_keys.clone(),
        }
    }

    /// Planned indexes other than the primary one.
    pub fn secondary_indexes(&self) -> impl Iterator<Item = &IndexSpec> {
        self.indexes.iter().filter(|idx| !idx.is_primary())
    }
}

/// Storage configuration handed to the engine when a shard is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub collection_id: String,
    pub collection_type: u32,
    pub do_compact: bool,
    pub is_volatile: bool,
    pub journal_size: u64,
    pub key_options: KeyOptions,
    pub wait_for_sync: bool,
    pub index_buckets: u32,
    pub shard_keys: Vec<String>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        ShardConfig {
            collection_id: String::new(),
            collection_type: default_collection_type(),
            do_compact: true,
            is_volatile: false,
            journal_size: default_journal_size(),
            key_options: KeyOptions::default(),
            wait_for_sync: false,
            index_buckets: default_index_buckets(),
            shard_keys: vec!["_key".to_string()],
        }
    }
}

/// A Plan map parsed entity by entity.
///
/// Entries that fail to parse land in `malformed` (name → detail) instead of
/// failing the whole map.
#[derive(Debug, Clone, PartialEq)]
pub struct Planned<T> {
    pub entries: BTreeMap<String, T>,
    pub malformed: BTreeMap<String, String>,
}

impl<T> Default for Planned<T> {
    fn default() -> Self {
        Planned { entries: BTreeMap::new(), malformed: BTreeMap::new() }
    }
}

impl<T> Planned<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if the Plan names `name`, whether or not its entry parsed.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name) || self.malformed.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.malformed.is_empty()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        self.entries.insert(name.into(), value);
    }
}

impl<T: DeserializeOwned> Planned<T> {
    pub fn from_json(value: &Value) -> Result<Self, CvgError> {
        let map = value
            .as_object()
            .ok_or_else(|| CvgError::InvalidArgument("expected an object".into()))?;
        let mut planned = Planned::new();
        for (name, raw) in map {
            match T::deserialize(raw) {
                Ok(parsed) => planned.insert(name.clone(), parsed),
                Err(e) => {
                    planned.malformed.insert(name.clone(), e.to_string());
                }
            }
        }
        Ok(planned)
    }
}

impl<K: Into<String>, T> FromIterator<(K, T)> for Planned<T> {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        Planned {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            malformed: BTreeMap::new(),
        }
    }
}

/// One snapshot of the Plan: planned databases and, per database, planned
/// collections keyed by collection id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanSnapshot {
    pub databases: Planned<DatabasePlan>,
    pub collections: BTreeMap<String, Planned<CollectionPlan>>,
}

impl PlanSnapshot {
    /// Parse `{"Databases": {...}, "Collections": {...}}`. Missing sections
    /// are empty. Only a structurally wrong document is an error; bad
    /// entries are kept per entity in [`Planned::malformed`].
    pub fn from_json(value: &Value) -> Result<Self, CvgError> {
        let root = value
            .as_object()
            .ok_or_else(|| CvgError::InvalidArgument("plan must be an object".into()))?;

        let databases = match root.get("Databases") {
            None | Some(Value::Null) => Planned::new(),
            Some(raw) => Planned::from_json(raw)?,
        };

        let mut collections = BTreeMap::new();
        if let Some(raw) = root.get("Collections").filter(|v| !v.is_null()) {
            let per_db = raw
                .as_object()
                .ok_or_else(|| CvgError::InvalidArgument("Collections must be an object".into()))?;
            for (db, raw_collections) in per_db {
                // A non-object collection map is malformed as a whole; key it by
                // the database so stale shards are left alone this pass.
                let planned = Planned::from_json(raw_collections).unwrap_or_else(|e| {
                    let mut p = Planned::new();
                    p.malformed.insert(db.clone(), e.to_string());
                    p
                });
                collections.insert(db.clone(), planned);
            }
        }

        Ok(PlanSnapshot { databases, collections })
    }

    pub fn collections_for(&self, db: &str) -> Option<&Planned<CollectionPlan>> {
        self.collections.get(db)
    }
}
