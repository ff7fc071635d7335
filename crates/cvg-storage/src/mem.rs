use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use cvg_types::{
    validate_database_name, validate_shard_name, CvgError, DatabaseInfo, IndexSpec, LoadState,
    ShardConfig, ShardInfo, ShardRole, SYSTEM_DATABASE,
};

use crate::traits::StorageEngine;

/// Engine calls that can be made to fail on purpose in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    ListDatabases,
    CreateDatabase,
    DropDatabase,
    ListShards,
    CreateShard,
    DropShard,
    SetLoadState,
    SetRole,
    ListIndexes,
    CreateIndex,
    DropIndex,
}

struct MemShard {
    config: ShardConfig,
    load_state: LoadState,
    role: ShardRole,
    indexes: BTreeMap<String, IndexSpec>, // id → spec, primary included
}

struct MemDatabase {
    id: String,
    shards: BTreeMap<String, MemShard>,
}

struct MemInner {
    databases: BTreeMap<String, MemDatabase>,
    next_id: u64,
    /// Calls that changed local state; no-ops are not counted.
    mutations: u64,
    /// (operation, entity name) pairs that fail with a storage error.
    failures: HashSet<(EngineOp, String)>,
}

impl MemInner {
    fn check(&self, op: EngineOp, entity: &str) -> Result<(), CvgError> {
        if self.failures.contains(&(op, entity.to_string())) {
            return Err(CvgError::Storage(format!("injected {op:?} failure for '{entity}'")));
        }
        Ok(())
    }

    fn database_mut(&mut self, db: &str) -> Result<&mut MemDatabase, CvgError> {
        self.databases
            .get_mut(db)
            .ok_or_else(|| CvgError::DatabaseNotFound(db.to_string()))
    }

    fn shard_mut(&mut self, db: &str, shard: &str) -> Result<&mut MemShard, CvgError> {
        self.database_mut(db)?
            .shards
            .get_mut(shard)
            .ok_or_else(|| CvgError::ShardNotFound(shard.to_string()))
    }
}

/// In-memory `StorageEngine`. Starts with `_system` (id `1`) only.
///
/// Intended for tests and for running a node without persistence; nothing
/// survives a restart.
pub struct MemEngine {
    inner: Arc<RwLock<MemInner>>,
}

impl MemEngine {
    pub fn new() -> Self {
        let mut databases = BTreeMap::new();
        databases.insert(
            SYSTEM_DATABASE.to_string(),
            MemDatabase { id: "1".to_string(), shards: BTreeMap::new() },
        );
        MemEngine {
            inner: Arc::new(RwLock::new(MemInner {
                databases,
                next_id: 2,
                mutations: 0,
                failures: HashSet::new(),
            })),
        }
    }

    /// Make every future `op` on `entity` fail. `entity` is the database name
    /// for database calls, the shard name for shard calls and the index id for
    /// index calls.
    pub async fn fail_on(&self, op: EngineOp, entity: &str) {
        self.inner.write().await.failures.insert((op, entity.to_string()));
    }

    pub async fn clear_failures(&self) {
        self.inner.write().await.failures.clear();
    }

    /// Number of calls that changed local state so far.
    pub async fn mutation_count(&self) -> u64 {
        self.inner.read().await.mutations
    }

    pub async fn database_names(&self) -> Vec<String> {
        self.inner.read().await.databases.keys().cloned().collect()
    }

    pub async fn shard(&self, db: &str, shard: &str) -> Option<ShardInfo> {
        let g = self.inner.read().await;
        g.databases.get(db)?.shards.get(shard).map(|s| ShardInfo {
            name: shard.to_string(),
            load_state: s.load_state,
            role: s.role.clone(),
        })
    }

    /// The configuration the shard was created with.
    pub async fn shard_config(&self, db: &str, shard: &str) -> Option<ShardConfig> {
        let g = self.inner.read().await;
        g.databases.get(db)?.shards.get(shard).map(|s| s.config.clone())
    }

    /// Ids of the shard's indexes, primary included.
    pub async fn index_ids(&self, db: &str, shard: &str) -> Option<Vec<String>> {
        let g = self.inner.read().await;
        let shard = g.databases.get(db)?.shards.get(shard)?;
        Some(shard.indexes.keys().cloned().collect())
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemEngine {
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, CvgError> {
        let g = self.inner.read().await;
        g.check(EngineOp::ListDatabases, "")?;
        Ok(g.databases
            .iter()
            .map(|(name, db)| DatabaseInfo { id: db.id.clone(), name: name.clone() })
            .collect())
    }

    async fn create_database(
        &self,
        name: &str,
        id: Option<&str>,
    ) -> Result<DatabaseInfo, CvgError> {
        let mut g = self.inner.write().await;
        g.check(EngineOp::CreateDatabase, name)?;
        validate_database_name(name)?;
        if g.databases.contains_key(name) {
            return Err(CvgError::AlreadyExists(name.to_string()));
        }
        let id = match id {
            Some(id) if !id.is_empty() => {
                // Keep assigned ids clear of planned numeric ones.
                if let Ok(n) = id.parse::<u64>() {
                    g.next_id = g.next_id.max(n.saturating_add(1));
                }
                id.to_string()
            }
            _ => {
                let next = g.next_id;
                g.next_id += 1;
                next.to_string()
            }
        };
        g.databases
            .insert(name.to_string(), MemDatabase { id: id.clone(), shards: BTreeMap::new() });
        g.mutations += 1;
        debug!(db = %name, %id, "mem: database created");
        Ok(DatabaseInfo { id, name: name.to_string() })
    }

    async fn drop_database(&self, name: &str) -> Result<(), CvgError> {
        let mut g = self.inner.write().await;
        g.check(EngineOp::DropDatabase, name)?;
        if name == SYSTEM_DATABASE {
            return Err(CvgError::Forbidden("the system database cannot be dropped".into()));
        }
        g.databases
            .remove(name)
            .ok_or_else(|| CvgError::DatabaseNotFound(name.to_string()))?;
        g.mutations += 1;
        debug!(db = %name, "mem: database dropped");
        Ok(())
    }

    async fn list_shards(&self, db: &str) -> Result<Vec<ShardInfo>, CvgError> {
        let g = self.inner.read().await;
        g.check(EngineOp::ListShards, db)?;
        let database = g
            .databases
            .get(db)
            .ok_or_else(|| CvgError::DatabaseNotFound(db.to_string()))?;
        Ok(database
            .shards
            .iter()
            .map(|(name, s)| ShardInfo {
                name: name.clone(),
                load_state: s.load_state,
                role: s.role.clone(),
            })
            .collect())
    }

    async fn create_shard(
        &self,
        db: &str,
        name: &str,
        config: &ShardConfig,
    ) -> Result<(), CvgError> {
        let mut g = self.inner.write().await;
        g.check(EngineOp::CreateShard, name)?;
        validate_shard_name(name)?;
        let database = g.database_mut(db)?;
        if database.shards.contains_key(name) {
            return Err(CvgError::AlreadyExists(name.to_string()));
        }
        let primary = IndexSpec::primary();
        database.shards.insert(
            name.to_string(),
            MemShard {
                config: config.clone(),
                load_state: LoadState::Loaded,
                role: ShardRole::Leader,
                indexes: BTreeMap::from([(primary.id.clone(), primary)]),
            },
        );
        g.mutations += 1;
        debug!(%db, shard = %name, "mem: shard created");
        Ok(())
    }

    async fn drop_shard(&self, db: &str, name: &str) -> Result<(), CvgError> {
        let mut g = self.inner.write().await;
        g.check(EngineOp::DropShard, name)?;
        g.database_mut(db)?
            .shards
            .remove(name)
            .ok_or_else(|| CvgError::ShardNotFound(name.to_string()))?;
        g.mutations += 1;
        debug!(%db, shard = %name, "mem: shard dropped");
        Ok(())
    }

    async fn set_load_state(
        &self,
        db: &str,
        name: &str,
        state: LoadState,
    ) -> Result<bool, CvgError> {
        let mut g = self.inner.write().await;
        g.check(EngineOp::SetLoadState, name)?;
        let shard = g.shard_mut(db, name)?;
        if shard.load_state == state {
            return Ok(false);
        }
        shard.load_state = state;
        g.mutations += 1;
        Ok(true)
    }

    async fn set_role(&self, db: &str, name: &str, role: &ShardRole) -> Result<bool, CvgError> {
        let mut g = self.inner.write().await;
        g.check(EngineOp::SetRole, name)?;
        let shard = g.shard_mut(db, name)?;
        if &shard.role == role {
            return Ok(false);
        }
        shard.role = role.clone();
        g.mutations += 1;
        Ok(true)
    }

    async fn list_indexes(&self, db: &str, shard: &str) -> Result<Vec<IndexSpec>, CvgError> {
        let g = self.inner.read().await;
        g.check(EngineOp::ListIndexes, shard)?;
        let target = g
            .databases
            .get(db)
            .ok_or_else(|| CvgError::DatabaseNotFound(db.to_string()))?
            .shards
            .get(shard)
            .ok_or_else(|| CvgError::ShardNotFound(shard.to_string()))?;
        Ok(target.indexes.values().cloned().collect())
    }

    async fn create_index(&self, db: &str, shard: &str, spec: &IndexSpec) -> Result<(), CvgError> {
        let mut g = self.inner.write().await;
        g.check(EngineOp::CreateIndex, &spec.id)?;
        if spec.is_primary() {
            return Err(CvgError::InvalidArgument("the primary index is implicit".into()));
        }
        let target = g.shard_mut(db, shard)?;
        if target.indexes.contains_key(&spec.id) {
            return Err(CvgError::AlreadyExists(format!("index {}", spec.id)));
        }
        target.indexes.insert(spec.id.clone(), spec.clone());
        g.mutations += 1;
        Ok(())
    }

    async fn drop_index(&self, db: &str, shard: &str, id: &str) -> Result<(), CvgError> {
        let mut g = self.inner.write().await;
        g.check(EngineOp::DropIndex, id)?;
        let target = g.shard_mut(db, shard)?;
        match target.indexes.get(id) {
            None => return Err(CvgError::IndexNotFound(id.to_string())),
            Some(idx) if idx.is_primary() => {
                return Err(CvgError::Forbidden("the primary index cannot be dropped".into()))
            }
            Some(_) => {}
        }
        target.indexes.remove(id);
        g.mutations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_index(id: &str, field: &str) -> IndexSpec {
        IndexSpec {
            id: id.into(),
            index_type: "hash".into(),
            fields: vec![field.into()],
            unique: false,
            sparse: false,
        }
    }

    #[tokio::test]
    async fn starts_with_system_only() {
        let engine = MemEngine::new();
        let dbs = engine.list_databases().await.unwrap();
        assert_eq!(dbs, vec![DatabaseInfo { id: "1".into(), name: "_system".into() }]);
        assert!(matches!(engine.drop_database("_system").await, Err(CvgError::Forbidden(_))));
        assert!(matches!(
            engine.create_database("_system", None).await,
            Err(CvgError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn database_lifecycle() {
        let engine = MemEngine::new();
        let created = engine.create_database("test", None).await.unwrap();
        assert_eq!(created.id, "2");
        let planned = engine.create_database("other", Some("42")).await.unwrap();
        assert_eq!(planned.id, "42");

        assert!(matches!(
            engine.create_database("bad name", None).await,
            Err(CvgError::InvalidName(_))
        ));

        engine.drop_database("test").await.unwrap();
        assert!(matches!(
            engine.drop_database("test").await,
            Err(CvgError::DatabaseNotFound(_))
        ));
        assert_eq!(engine.database_names().await, vec!["_system", "other"]);
        assert_eq!(engine.mutation_count().await, 3);
    }

    #[tokio::test]
    async fn assigned_ids_skip_past_planned_ones() {
        let engine = MemEngine::new();
        assert_eq!(engine.create_database("planned", Some("2")).await.unwrap().id, "2");
        assert_eq!(engine.create_database("auto", None).await.unwrap().id, "3");

        engine.create_database("low", Some("1")).await.unwrap();
        engine.create_database("named", Some("custom")).await.unwrap();
        assert_eq!(engine.create_database("next", None).await.unwrap().id, "4");
    }

    #[tokio::test]
    async fn shard_starts_loaded_leading_with_primary() {
        let engine = MemEngine::new();
        engine.create_database("test", None).await.unwrap();
        engine.create_shard("test", "s1", &ShardConfig::default()).await.unwrap();

        let shard = engine.shard("test", "s1").await.unwrap();
        assert_eq!(shard.load_state, LoadState::Loaded);
        assert_eq!(shard.role, ShardRole::Leader);
        assert_eq!(engine.index_ids("test", "s1").await.unwrap(), vec!["0".to_string()]);

        assert!(matches!(
            engine.create_shard("test", "Möter", &ShardConfig::default()).await,
            Err(CvgError::InvalidName(_))
        ));
        assert!(matches!(
            engine.create_shard("missing", "s1", &ShardConfig::default()).await,
            Err(CvgError::DatabaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn load_state_and_role_are_idempotent() {
        let engine = MemEngine::new();
        engine.create_database("test", None).await.unwrap();
        engine.create_shard("test", "s1", &ShardConfig::default()).await.unwrap();
        let before = engine.mutation_count().await;

        assert!(!engine.set_load_state("test", "s1", LoadState::Loaded).await.unwrap());
        assert!(!engine.set_role("test", "s1", &ShardRole::Leader).await.unwrap());
        assert_eq!(engine.mutation_count().await, before);

        let follower = ShardRole::Follower { leader: "A".into() };
        assert!(engine.set_load_state("test", "s1", LoadState::Unloaded).await.unwrap());
        assert!(engine.set_role("test", "s1", &follower).await.unwrap());
        assert!(!engine.set_role("test", "s1", &follower).await.unwrap());
        assert_eq!(engine.mutation_count().await, before + 2);
    }

    #[tokio::test]
    async fn primary_index_is_untouchable() {
        let engine = MemEngine::new();
        engine.create_database("test", None).await.unwrap();
        engine.create_shard("test", "s1", &ShardConfig::default()).await.unwrap();

        assert!(matches!(
            engine.create_index("test", "s1", &IndexSpec::primary()).await,
            Err(CvgError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.drop_index("test", "s1", "0").await,
            Err(CvgError::Forbidden(_))
        ));

        engine.create_index("test", "s1", &hash_index("100005", "user")).await.unwrap();
        assert!(matches!(
            engine.create_index("test", "s1", &hash_index("100005", "user")).await,
            Err(CvgError::AlreadyExists(_))
        ));
        assert_eq!(engine.list_indexes("test", "s1").await.unwrap().len(), 2);

        engine.drop_index("test", "s1", "100005").await.unwrap();
        assert!(matches!(
            engine.drop_index("test", "s1", "100005").await,
            Err(CvgError::IndexNotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures() {
        let engine = MemEngine::new();
        engine.fail_on(EngineOp::CreateDatabase, "flaky").await;
        assert!(matches!(
            engine.create_database("flaky", None).await,
            Err(CvgError::Storage(_))
        ));
        engine.create_database("steady", None).await.unwrap();

        engine.clear_failures().await;
        engine.create_database("flaky", None).await.unwrap();
    }
}
