use std::future::Future;

use tokio::sync::RwLock;

use cvg_types::{CurrentDatabases, CvgError, PatchSet, PlanSnapshot};

/// Where Plan snapshots and the observed Current document come from.
pub trait PlanSource: Send + Sync + 'static {
    fn plan(&self) -> impl Future<Output = Result<PlanSnapshot, CvgError>> + Send;

    /// The `Current/Databases` subtree as last written by every server.
    fn current(&self) -> impl Future<Output = Result<CurrentDatabases, CvgError>> + Send;
}

/// Where Current patch sets are written. A patch set is applied as a unit.
pub trait CurrentSink: Send + Sync + 'static {
    fn apply(&self, patch: &PatchSet) -> impl Future<Output = Result<(), CvgError>> + Send;
}

struct MemAgencyInner {
    plan: PlanSnapshot,
    current: CurrentDatabases,
    writes: u64,
}

/// In-process coordination store holding one Plan and one Current.
pub struct MemAgency {
    root: String,
    inner: RwLock<MemAgencyInner>,
}

impl MemAgency {
    /// `root` is the Current prefix patch paths are written against.
    pub fn new(root: impl Into<String>) -> Self {
        MemAgency {
            root: root.into(),
            inner: RwLock::new(MemAgencyInner {
                plan: PlanSnapshot::default(),
                current: CurrentDatabases::new(),
                writes: 0,
            }),
        }
    }

    pub async fn set_plan(&self, plan: PlanSnapshot) {
        self.inner.write().await.plan = plan;
    }

    pub async fn set_current(&self, current: CurrentDatabases) {
        self.inner.write().await.current = current;
    }

    /// Number of non-empty patch sets applied so far.
    pub async fn write_count(&self) -> u64 {
        self.inner.read().await.writes
    }
}

impl PlanSource for MemAgency {
    async fn plan(&self) -> Result<PlanSnapshot, CvgError> {
        Ok(self.inner.read().await.plan.clone())
    }

    async fn current(&self) -> Result<CurrentDatabases, CvgError> {
        Ok(self.inner.read().await.current.clone())
    }
}

impl CurrentSink for MemAgency {
    async fn apply(&self, patch: &PatchSet) -> Result<(), CvgError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut g = self.inner.write().await;
        let mut next = g.current.clone();
        next.apply(&self.root, patch)?;
        g.current = next;
        g.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvg_types::{current_database_path, CurrentEntry, PatchOp, ServerId};

    #[tokio::test]
    async fn patch_is_applied_as_a_unit() {
        let agency = MemAgency::new("/arango/Current");
        let server = ServerId::from("repltest");
        let entry =
            CurrentEntry { id: Some("2".into()), name: "test".into(), ..Default::default() };

        let mut patch = PatchSet::new();
        patch.insert(
            current_database_path("/arango/Current", "test", &server),
            PatchOp::Set { new: entry.clone() },
        );
        agency.apply(&patch).await.unwrap();
        assert_eq!(agency.current().await.unwrap().entry("test", &server), Some(&entry));

        patch.insert("/elsewhere/x".into(), PatchOp::Delete);
        patch.insert(current_database_path("/arango/Current", "test", &server), PatchOp::Delete);
        assert!(agency.apply(&patch).await.is_err());
        assert_eq!(agency.current().await.unwrap().entry("test", &server), Some(&entry));
        assert_eq!(agency.write_count().await, 1);
    }

    #[tokio::test]
    async fn empty_patch_is_not_a_write() {
        let agency = MemAgency::new("/arango/Current");
        agency.apply(&PatchSet::new()).await.unwrap();
        assert_eq!(agency.write_count().await, 0);
    }
}
