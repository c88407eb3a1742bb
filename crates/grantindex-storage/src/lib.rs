//! grantindex-storage — pluggable ledger backends for GrantIndex.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence,
//!   feature `sqlite`)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryLedger;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;
