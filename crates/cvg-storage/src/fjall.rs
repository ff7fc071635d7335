use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use cvg_types::{
    validate_database_name, validate_shard_name, CvgError, DatabaseInfo, IndexSpec, LoadState,
    ShardConfig, ShardInfo, ShardRole, SYSTEM_DATABASE,
};

use crate::keys::{
    database_key, database_prefix, index_key, index_prefix, meta_key, name_after, shard_key,
};
use crate::traits::StorageEngine;
use crate::types::{StoredDatabase, StoredIndex, StoredShard};

/// Id given to `_system` when a store is created.
const SYSTEM_DATABASE_ID: &str = "1";

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, CvgError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| CvgError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, CvgError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| CvgError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> CvgError {
    CvgError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> CvgError {
    CvgError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle over all four keyspaces
// ---------------------------------------------------------------------------

/// Persistent local state.
///
/// All keyspaces live in one fjall `Database` so that a drop spanning
/// databases, shards and indexes commits as one atomic batch.
pub struct FjallStore {
    pub db: fjall::Database,
    /// `db_utf8` → bincode(StoredDatabase)
    pub databases: fjall::Keyspace,
    /// `db ++ \x00 ++ shard` → bincode(StoredShard)
    pub shards: fjall::Keyspace,
    /// `db ++ \x00 ++ shard ++ \x00 ++ id` → bincode(StoredIndex)
    pub indexes: fjall::Keyspace,
    /// `label_utf8` → bincode(value)
    pub meta: fjall::Keyspace,
    /// Serializes read-check-write sequences.
    write_lock: Mutex<()>,
}

impl FjallStore {
    /// Open (or create) a store at `path`. A fresh store gets `_system`.
    pub fn open(path: &Path) -> Result<Arc<Self>, CvgError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let databases =
            db.keyspace("databases", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let shards =
            db.keyspace("shards", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let indexes =
            db.keyspace("indexes", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta = db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;

        let store = FjallStore { db, databases, shards, indexes, meta, write_lock: Mutex::new(()) };
        if store.databases.get(database_key(SYSTEM_DATABASE)).map_err(fjall_err)?.is_none() {
            let system = StoredDatabase { id: SYSTEM_DATABASE_ID.to_string() };
            let mut batch = store.db.batch();
            batch.insert(&store.databases, database_key(SYSTEM_DATABASE), encode(&system)?);
            batch.insert(&store.meta, meta_key("next_database_id"), encode(&2u64)?);
            batch.commit().map_err(fjall_err)?;
            info!(path = %path.display(), "fjall: initialized local state");
        }
        Ok(Arc::new(store))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, CvgError> {
        self.write_lock
            .lock()
            .map_err(|_| CvgError::Storage("write lock poisoned".into()))
    }

    fn database_exists(&self, db: &str) -> Result<bool, CvgError> {
        Ok(self.databases.get(database_key(db)).map_err(fjall_err)?.is_some())
    }

    fn load_shard(&self, db: &str, shard: &str) -> Result<StoredShard, CvgError> {
        if !self.database_exists(db)? {
            return Err(CvgError::DatabaseNotFound(db.to_string()));
        }
        match self.shards.get(shard_key(db, shard)).map_err(fjall_err)? {
            Some(b) => decode(&b),
            None => Err(CvgError::ShardNotFound(shard.to_string())),
        }
    }

    fn next_database_id(&self) -> Result<u64, CvgError> {
        match self.meta.get(meta_key("next_database_id")).map_err(fjall_err)? {
            Some(b) => decode(&b),
            None => Ok(2),
        }
    }

    fn keys_with_prefix(
        keyspace: &fjall::Keyspace,
        prefix: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>, CvgError> {
        keyspace
            .prefix(prefix)
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FjallEngine
// ---------------------------------------------------------------------------

/// `StorageEngine` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallEngine(pub Arc<FjallStore>);

impl FjallEngine {
    pub fn open(path: &Path) -> Result<Self, CvgError> {
        Ok(FjallEngine(FjallStore::open(path)?))
    }

    /// Run `f` against the store on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, CvgError>
    where
        T: Send + 'static,
        F: FnOnce(&FjallStore) -> Result<T, CvgError> + Send + 'static,
    {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref())).await.map_err(join_err)?
    }
}

impl StorageEngine for FjallEngine {
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, CvgError> {
        self.blocking(|store| {
            store
                .databases
                .prefix(Vec::<u8>::new())
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let name = String::from_utf8(k.to_vec())
                            .map_err(|e| CvgError::Storage(e.to_string()))?;
                        let stored: StoredDatabase = decode(&v)?;
                        Ok(DatabaseInfo { id: stored.id, name })
                    })
                })
                .collect()
        })
        .await
    }

    async fn create_database(
        &self,
        name: &str,
        id: Option<&str>,
    ) -> Result<DatabaseInfo, CvgError> {
        validate_database_name(name)?;
        let name = name.to_string();
        let planned_id = id.filter(|id| !id.is_empty()).map(str::to_string);
        self.blocking(move |store| {
            let _guard = store.lock()?;
            if store.database_exists(&name)? {
                return Err(CvgError::AlreadyExists(name));
            }
            let next = store.next_database_id()?;
            let (id, after) = match planned_id {
                // A numeric planned id pushes the counter past itself.
                Some(id) => {
                    let after = id.parse::<u64>().map_or(next, |n| next.max(n.saturating_add(1)));
                    (id, after)
                }
                None => (next.to_string(), next + 1),
            };
            let stored = encode(&StoredDatabase { id: id.clone() })?;
            let mut batch = store.db.batch();
            if after != next {
                batch.insert(&store.meta, meta_key("next_database_id"), encode(&after)?);
            }
            batch.insert(&store.databases, database_key(&name), stored);
            batch.commit().map_err(fjall_err)?;
            debug!(db = %name, %id, "fjall: database created");
            Ok(DatabaseInfo { id, name })
        })
        .await
    }

    async fn drop_database(&self, name: &str) -> Result<(), CvgError> {
        if name == SYSTEM_DATABASE {
            return Err(CvgError::Forbidden("the system database cannot be dropped".into()));
        }
        let name = name.to_string();
        self.blocking(move |store| {
            let _guard = store.lock()?;
            if !store.database_exists(&name)? {
                return Err(CvgError::DatabaseNotFound(name));
            }
            let shard_keys = FjallStore::keys_with_prefix(&store.shards, database_prefix(&name))?;
            let index_keys = FjallStore::keys_with_prefix(&store.indexes, database_prefix(&name))?;

            let mut batch = store.db.batch();
            for k in shard_keys {
                batch.remove(&store.shards, k);
            }
            for k in index_keys {
                batch.remove(&store.indexes, k);
            }
            batch.remove(&store.databases, database_key(&name));
            batch.commit().map_err(fjall_err)?;
            debug!(db = %name, "fjall: database dropped");
            Ok(())
        })
        .await
    }

    async fn list_shards(&self, db: &str) -> Result<Vec<ShardInfo>, CvgError> {
        let db = db.to_string();
        self.blocking(move |store| {
            if !store.database_exists(&db)? {
                return Err(CvgError::DatabaseNotFound(db));
            }
            let prefix = database_prefix(&db);
            store
                .shards
                .prefix(prefix.clone())
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let name = name_after(&prefix, &k)
                            .ok_or_else(|| CvgError::Storage("malformed shard key".into()))?;
                        let stored: StoredShard = decode(&v)?;
                        Ok(ShardInfo { name, load_state: stored.load_state, role: stored.role })
                    })
                })
                .collect()
        })
        .await
    }

    async fn create_shard(
        &self,
        db: &str,
        name: &str,
        config: &ShardConfig,
    ) -> Result<(), CvgError> {
        validate_shard_name(name)?;
        let (db, name, config) = (db.to_string(), name.to_string(), config.clone());
        self.blocking(move |store| {
            let _guard = store.lock()?;
            if !store.database_exists(&db)? {
                return Err(CvgError::DatabaseNotFound(db));
            }
            if store.shards.get(shard_key(&db, &name)).map_err(fjall_err)?.is_some() {
                return Err(CvgError::AlreadyExists(name));
            }
            let primary = IndexSpec::primary();
            let mut batch = store.db.batch();
            batch.insert(
                &store.shards,
                shard_key(&db, &name),
                encode(&StoredShard::created(config))?,
            );
            batch.insert(
                &store.indexes,
                index_key(&db, &name, &primary.id),
                encode(&StoredIndex::from(&primary))?,
            );
            batch.commit().map_err(fjall_err)?;
            debug!(%db, shard = %name, "fjall: shard created");
            Ok(())
        })
        .await
    }

    async fn drop_shard(&self, db: &str, name: &str) -> Result<(), CvgError> {
        let (db, name) = (db.to_string(), name.to_string());
        self.blocking(move |store| {
            let _guard = store.lock()?;
            store.load_shard(&db, &name)?;
            let index_keys =
                FjallStore::keys_with_prefix(&store.indexes, index_prefix(&db, &name))?;
            let mut batch = store.db.batch();
            for k in index_keys {
                batch.remove(&store.indexes, k);
            }
            batch.remove(&store.shards, shard_key(&db, &name));
            batch.commit().map_err(fjall_err)?;
            debug!(%db, shard = %name, "fjall: shard dropped");
            Ok(())
        })
        .await
    }

    async fn set_load_state(
        &self,
        db: &str,
        name: &str,
        state: LoadState,
    ) -> Result<bool, CvgError> {
        let (db, name) = (db.to_string(), name.to_string());
        self.blocking(move |store| {
            let _guard = store.lock()?;
            let mut shard = store.load_shard(&db, &name)?;
            if shard.load_state == state {
                return Ok(false);
            }
            shard.load_state = state;
            store.shards.insert(shard_key(&db, &name), encode(&shard)?).map_err(fjall_err)?;
            Ok(true)
        })
        .await
    }

    async fn set_role(&self, db: &str, name: &str, role: &ShardRole) -> Result<bool, CvgError> {
        let (db, name, role) = (db.to_string(), name.to_string(), role.clone());
        self.blocking(move |store| {
            let _guard = store.lock()?;
            let mut shard = store.load_shard(&db, &name)?;
            if shard.role == role {
                return Ok(false);
            }
            shard.role = role;
            store.shards.insert(shard_key(&db, &name), encode(&shard)?).map_err(fjall_err)?;
            Ok(true)
        })
        .await
    }

    async fn list_indexes(&self, db: &str, shard: &str) -> Result<Vec<IndexSpec>, CvgError> {
        let (db, shard) = (db.to_string(), shard.to_string());
        self.blocking(move |store| {
            store.load_shard(&db, &shard)?;
            store
                .indexes
                .prefix(index_prefix(&db, &shard))
                .map(|g| {
                    g.into_inner()
                        .map_err(fjall_err)
                        .and_then(|(_, v)| decode::<StoredIndex>(&v).map(IndexSpec::from))
                })
                .collect()
        })
        .await
    }

    async fn create_index(&self, db: &str, shard: &str, spec: &IndexSpec) -> Result<(), CvgError> {
        if spec.is_primary() {
            return Err(CvgError::InvalidArgument("the primary index is implicit".into()));
        }
        let (db, shard, stored) = (db.to_string(), shard.to_string(), StoredIndex::from(spec));
        self.blocking(move |store| {
            let _guard = store.lock()?;
            store.load_shard(&db, &shard)?;
            let key = index_key(&db, &shard, &stored.id);
            if store.indexes.get(&key).map_err(fjall_err)?.is_some() {
                return Err(CvgError::AlreadyExists(format!("index {}", stored.id)));
            }
            store.indexes.insert(key, encode(&stored)?).map_err(fjall_err)
        })
        .await
    }

    async fn drop_index(&self, db: &str, shard: &str, id: &str) -> Result<(), CvgError> {
        let (db, shard, id) = (db.to_string(), shard.to_string(), id.to_string());
        self.blocking(move |store| {
            let _guard = store.lock()?;
            store.load_shard(&db, &shard)?;
            let key = index_key(&db, &shard, &id);
            let stored: StoredIndex = match store.indexes.get(&key).map_err(fjall_err)? {
                Some(b) => decode(&b)?,
                None => return Err(CvgError::IndexNotFound(id)),
            };
            if IndexSpec::from(stored).is_primary() {
                return Err(CvgError::Forbidden("the primary index cannot be dropped".into()));
            }
            store.indexes.remove(key).map_err(fjall_err)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
