use std::future::Future;

use cvg_types::{CvgError, DatabaseInfo, IndexSpec, LoadState, ShardConfig, ShardInfo, ShardRole};

/// The local storage engine: the only owner of databases, shards and indexes
/// on this server.
///
/// Methods use RPITIT (`-> impl Future + Send`) so generic reconcilers can
/// hold an engine behind an `Arc` and `.await` across threads without an
/// `async-trait` dependency.
///
/// Every call may fail; callers key the failure by the entity it concerns.
pub trait StorageEngine: Send + Sync + 'static {
    /// All local databases, `_system` included.
    fn list_databases(&self)
        -> impl Future<Output = Result<Vec<DatabaseInfo>, CvgError>> + Send;

    /// Create database `name`. `id` is the planned id; when `None` the engine
    /// assigns one.
    fn create_database(&self, name: &str, id: Option<&str>)
        -> impl Future<Output = Result<DatabaseInfo, CvgError>> + Send;

    /// Drop database `name` with all of its shards. `_system` is refused.
    fn drop_database(&self, name: &str)
        -> impl Future<Output = Result<(), CvgError>> + Send;

    fn list_shards(&self, db: &str)
        -> impl Future<Output = Result<Vec<ShardInfo>, CvgError>> + Send;

    /// Create shard `name` in `db`, loaded, leading, and carrying only the
    /// primary index.
    fn create_shard(&self, db: &str, name: &str, config: &ShardConfig)
        -> impl Future<Output = Result<(), CvgError>> + Send;

    fn drop_shard(&self, db: &str, name: &str)
        -> impl Future<Output = Result<(), CvgError>> + Send;

    /// Returns `true` if the state changed, `false` if it already was `state`.
    fn set_load_state(&self, db: &str, name: &str, state: LoadState)
        -> impl Future<Output = Result<bool, CvgError>> + Send;

    /// Returns `true` if the role changed, `false` if it already was `role`.
    fn set_role(&self, db: &str, name: &str, role: &ShardRole)
        -> impl Future<Output = Result<bool, CvgError>> + Send;

    /// All indexes of a shard, primary included.
    fn list_indexes(&self, db: &str, shard: &str)
        -> impl Future<Output = Result<Vec<IndexSpec>, CvgError>> + Send;

    /// Create a secondary index. Primary indexes are refused.
    fn create_index(&self, db: &str, shard: &str, spec: &IndexSpec)
        -> impl Future<Output = Result<(), CvgError>> + Send;

    /// Drop a secondary index by id. The primary index is refused.
    fn drop_index(&self, db: &str, shard: &str, id: &str)
        -> impl Future<Output = Result<(), CvgError>> + Send;
}
