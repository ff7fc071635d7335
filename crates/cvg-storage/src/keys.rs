//! Key layouts for the fjall keyspaces.
//!
//! Names never contain `\x00` (the engine validates them before writing), so
//! the null byte is a safe component delimiter: a prefix scan for database
//! "foo" never bleeds into "foobar".

/// `databases` keyspace: `db_utf8`
pub fn database_key(db: &str) -> Vec<u8> {
    db.as_bytes().to_vec()
}

/// `shards` keyspace: `db_utf8 ++ \x00 ++ shard_utf8`
pub fn shard_key(db: &str, shard: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(db.len() + 1 + shard.len());
    buf.extend_from_slice(db.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(shard.as_bytes());
    buf
}

/// Prefix of every shard (and every index) key of a database: `db_utf8 ++ \x00`
pub fn database_prefix(db: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(db.len() + 1);
    buf.extend_from_slice(db.as_bytes());
    buf.push(0x00);
    buf
}

/// `indexes` keyspace: `db_utf8 ++ \x00 ++ shard_utf8 ++ \x00 ++ id_utf8`
pub fn index_key(db: &str, shard: &str, id: &str) -> Vec<u8> {
    let mut buf = index_prefix(db, shard);
    buf.extend_from_slice(id.as_bytes());
    buf
}

/// Prefix of every index key of one shard: `db_utf8 ++ \x00 ++ shard_utf8 ++ \x00`
pub fn index_prefix(db: &str, shard: &str) -> Vec<u8> {
    let mut buf = shard_key(db, shard);
    buf.push(0x00);
    buf
}

/// Strip `prefix` and decode the remainder as a UTF-8 name.
pub fn name_after(prefix: &[u8], key: &[u8]) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    String::from_utf8(rest.to_vec()).ok()
}

/// `meta` keyspace: `label_utf8`
pub fn meta_key(label: &str) -> Vec<u8> {
    label.as_bytes().to_vec()
}
