//! Error types for the reconciliation pipeline.
//!
//! The full failure taxonomy is split by how it is handled: malformed input
//! is dropped here, storage failures are retried or parked by the
//! coordinator, and conflict/gap/reorg conditions surface as
//! [`crate::alert::Alert`] values with the event parked for replay.

use thiserror::Error;

/// Errors raised while turning a raw log record into a canonical event.
/// Always non-fatal to the system: the record is logged and dropped.
#[derive(Debug, Clone, Error)]
#[error("malformed event: {reason}")]
pub struct NormalizeError {
    pub reason: String,
}

impl NormalizeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Errors raised by a ledger backend.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Retryable — connection lost, lock contention, timeout.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Not retryable — constraint violation other than the uniqueness key,
    /// corrupted row, closed pool.
    #[error("storage error: {0}")]
    Fatal(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
