//! Reconciliation core: converges this server's local databases, shards and
//! indexes toward a Plan snapshot and reports what exists into Current.
//!
//! A pass runs the [`DatabaseReconciler`] first, then one
//! [`CollectionReconciler`] pass per local database, then the
//! [`CurrentReporter`]. [`Maintenance`] wires the three together.

mod agency;
mod collection;
mod current;
mod database;
mod diff;
mod maintenance;
mod scope;

pub use agency::{CurrentSink, MemAgency, PlanSource};
pub use collection::CollectionReconciler;
pub use current::CurrentReporter;
pub use database::DatabaseReconciler;
pub use diff::absent_from;
pub use maintenance::{Maintenance, PassReport, SyncConfig};
pub use scope::ScopeLocks;

pub use tokio_util::sync::CancellationToken;
