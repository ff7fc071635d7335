use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::Mutex;

use cvg_reconcile::{CurrentSink, PlanSource};
use cvg_types::{CurrentDatabases, CvgError, PatchSet, PlanSnapshot};

/// Coordination store backed by two JSON files.
///
/// The Plan file holds `{"Databases": ..., "Collections": ...}`. The Current
/// file holds the `Databases` part of Current (database → server → entry)
/// and is rewritten whole, through a temporary file, on every patch.
pub struct FileAgency {
    plan_path: PathBuf,
    current_path: PathBuf,
    root: String,
    write_lock: Mutex<()>,
}

impl FileAgency {
    pub fn new(plan_path: PathBuf, current_path: PathBuf, root: impl Into<String>) -> Self {
        FileAgency { plan_path, current_path, root: root.into(), write_lock: Mutex::new(()) }
    }
}

async fn read_json(path: &Path) -> Result<Option<Value>, CvgError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CvgError::Coordination(format!("{}: {e}", path.display()))),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| CvgError::Coordination(format!("{}: {e}", path.display())))
}

impl PlanSource for FileAgency {
    async fn plan(&self) -> Result<PlanSnapshot, CvgError> {
        match read_json(&self.plan_path).await? {
            Some(doc) => PlanSnapshot::from_json(&doc),
            None => Err(CvgError::Coordination(format!(
                "no Plan at {}",
                self.plan_path.display()
            ))),
        }
    }

    async fn current(&self) -> Result<CurrentDatabases, CvgError> {
        Ok(read_json(&self.current_path)
            .await?
            .map(|doc| CurrentDatabases::from_json(&doc))
            .unwrap_or_default())
    }
}

impl CurrentSink for FileAgency {
    async fn apply(&self, patch: &PatchSet) -> Result<(), CvgError> {
        if patch.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut current = self.current().await?;
        current.apply(&self.root, patch)?;

        let body = serde_json::to_vec_pretty(&current.to_json())
            .map_err(|e| CvgError::Coordination(e.to_string()))?;
        let tmp = self.current_path.with_extension("json.tmp");
        let io = |e: std::io::Error| CvgError::Coordination(format!("{}: {e}", tmp.display()));
        tokio::fs::write(&tmp, body).await.map_err(io)?;
        tokio::fs::rename(&tmp, &self.current_path).await.map_err(io)?;
        Ok(())
    }
}
