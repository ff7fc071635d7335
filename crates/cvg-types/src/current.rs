use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::plan::de_id;
use crate::{CvgError, DatabaseInfo, ServerId, SyncError};

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    de_id(d).map(Some)
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

/// What one server reports about one of its databases.
///
/// The error fields are omitted when unset, so a healthy entry serializes to
/// exactly `{"id": ..., "name": ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentEntry {
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub error_num: i32,
}

impl CurrentEntry {
    pub fn healthy(db: &DatabaseInfo) -> Self {
        CurrentEntry { id: Some(db.id.clone()), name: db.name.clone(), ..Default::default() }
    }

    pub fn failed(name: &str, err: &SyncError) -> Self {
        CurrentEntry {
            id: None,
            name: name.to_string(),
            error: true,
            error_message: err.to_string(),
            error_num: err.cause().error_num(),
        }
    }
}

/// One write against the Current document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Set { new: CurrentEntry },
    Delete,
}

/// Writes keyed by their full Current path.
pub type PatchSet = BTreeMap<String, PatchOp>;

/// `<root>/Databases/<db>/<server>`
pub fn current_database_path(root: &str, db: &str, server: &ServerId) -> String {
    format!("{}/Databases/{db}/{server}", root.trim_end_matches('/'))
}

fn split_current_database_path<'a>(root: &str, path: &'a str) -> Option<(&'a str, &'a str)> {
    let prefix = format!("{}/Databases/", root.trim_end_matches('/'));
    let rest = path.strip_prefix(prefix.as_str())?;
    let (db, server) = rest.split_once('/')?;
    if db.is_empty() || server.is_empty() || server.contains('/') {
        return None;
    }
    Some((db, server))
}

/// The `Databases` part of Current: database → server → entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CurrentDatabases(BTreeMap<String, BTreeMap<ServerId, CurrentEntry>>);

impl CurrentDatabases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lenient parse: anything that does not look like an entry is left out,
    /// which makes the reporter rewrite it.
    pub fn from_json(value: &Value) -> Self {
        let mut current = CurrentDatabases::new();
        let Some(dbs) = value.as_object() else {
            return current;
        };
        for (db, servers) in dbs {
            let Some(servers) = servers.as_object() else {
                continue;
            };
            for (server, raw) in servers {
                if let Ok(entry) = CurrentEntry::deserialize(raw) {
                    current.insert(db, ServerId::from(server.as_str()), entry);
                }
            }
        }
        current
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn entry(&self, db: &str, server: &ServerId) -> Option<&CurrentEntry> {
        self.0.get(db).and_then(|servers| servers.get(server))
    }

    pub fn insert(&mut self, db: &str, server: ServerId, entry: CurrentEntry) {
        self.0.entry(db.to_string()).or_default().insert(server, entry);
    }

    pub fn remove(&mut self, db: &str, server: &ServerId) -> Option<CurrentEntry> {
        let servers = self.0.get_mut(db)?;
        let removed = servers.remove(server);
        if servers.is_empty() {
            self.0.remove(db);
        }
        removed
    }

    /// Databases for which `server` has an entry.
    pub fn reported_by<'a>(&'a self, server: &'a ServerId) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(_, servers)| servers.contains_key(server))
            .map(|(db, _)| db.as_str())
    }

    /// Apply a patch set written against `root`.
    pub fn apply(&mut self, root: &str, patch: &PatchSet) -> Result<(), CvgError> {
        for (path, op) in patch {
            let (db, server) = split_current_database_path(root, path).ok_or_else(|| {
                CvgError::InvalidArgument(format!("not a Current database path: {path}"))
            })?;
            let server = ServerId::from(server);
            match op {
                PatchOp::Set { new } => self.insert(db, server, new.clone()),
                PatchOp::Delete => {
                    self.remove(db, &server);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn healthy_entry_serializes_to_id_and_name() {
        let entry = CurrentEntry::healthy(&DatabaseInfo { id: "7".into(), name: "testi".into() });
        assert_eq!(serde_json::to_value(&entry).unwrap(), json!({"id": "7", "name": "testi"}));
    }

    #[test]
    fn numeric_ids_compare_equal_after_parse() {
        let current = CurrentDatabases::from_json(&json!({
            "_system": { "repltest": { "id": 1, "name": "_system" } }
        }));
        let system = DatabaseInfo { id: "1".into(), name: "_system".into() };
        let expected = CurrentEntry::healthy(&system);
        assert_eq!(current.entry("_system", &"repltest".into()), Some(&expected));
    }

    #[test]
    fn patch_ops_wire_format() {
        let new = CurrentEntry { id: Some("3".into()), name: "x".into(), ..Default::default() };
        let set = PatchOp::Set { new };
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            json!({"op": "set", "new": {"id": "3", "name": "x"}})
        );
        assert_eq!(serde_json::to_value(&PatchOp::Delete).unwrap(), json!({"op": "delete"}));
    }

    #[test]
    fn paths_and_apply() {
        let server = ServerId::from("repltest");
        let path = current_database_path("/arango/Current/", "testi", &server);
        assert_eq!(path, "/arango/Current/Databases/testi/repltest");

        let mut current = CurrentDatabases::new();
        let mut patch = PatchSet::new();
        let new = CurrentEntry { id: Some("2".into()), name: "testi".into(), ..Default::default() };
        patch.insert(path.clone(), PatchOp::Set { new });
        current.apply("/arango/Current", &patch).unwrap();
        assert_eq!(current.reported_by(&server).collect::<Vec<_>>(), vec!["testi"]);

        let mut delete = PatchSet::new();
        delete.insert(path, PatchOp::Delete);
        current.apply("/arango/Current", &delete).unwrap();
        assert_eq!(current, CurrentDatabases::new());

        let mut bogus = PatchSet::new();
        bogus.insert("/elsewhere/x".into(), PatchOp::Delete);
        assert!(current.apply("/arango/Current", &bogus).is_err());
    }
}
