//! Cache-to-document replication
//!
//! Two paths share this crate: the one-shot bulk migrator and the
//! long-running realtime sync workers. Both consult the `sync_status` /
//! `sync_progress` ledgers in the document store, so restarting either
//! resumes exactly where it left off and re-running a completed pass
//! writes nothing.

pub mod migrator;
pub mod records;
pub mod workers;

pub use migrator::{MigrationSummary, Migrator};
pub use workers::{SyncStats, SyncStatsSnapshot, SyncWorkers};
