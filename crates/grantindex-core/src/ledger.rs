//! Ledger seam — append-only persistence of accepted events with
//! supersession instead of deletion.
//!
//! Rows are immutable once written, except for two markers: the finality
//! promotion (`provisional` → `final`) and the `superseded` flag set by
//! reorg handling. The full event tuple is the uniqueness key; inserting a
//! duplicate is success, which is what makes redelivery safe.
//!
//! Backends live in `grantindex-storage` (memory, SQLite).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::types::{BlockHash, DelegationEvent, DelegationState, Finality, TupleKey};

/// A stored ledger row: the event plus its lifecycle markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    pub event: DelegationEvent,
    pub finality: Finality,
    pub superseded: bool,
    /// Epoch seconds when the row was accepted.
    pub accepted_at: i64,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Uniqueness-key collision — the row is already stored. Not an error.
    AlreadyExists,
}

/// Storage backend for the delegation event ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert an accepted event under the uniqueness key, transactionally.
    /// A duplicate-key insert returns [`AppendOutcome::AlreadyExists`].
    async fn append(
        &self,
        event: &DelegationEvent,
        finality: Finality,
    ) -> Result<AppendOutcome, LedgerError>;

    /// Exact uniqueness-tuple lookup. Superseded rows count: redelivery of
    /// a row whose block already lost is still a no-op duplicate.
    async fn contains(&self, event: &DelegationEvent) -> Result<bool, LedgerError>;

    /// Mark rows at `block_number` whose stored hash differs from the
    /// canonical one as superseded. Matching rows are untouched.
    /// Returns the tuple of each marked row (one entry per row; callers
    /// dedup for state rebuilds).
    async fn supersede(
        &self,
        host_chain_id: u64,
        block_number: u64,
        canonical_hash: &BlockHash,
    ) -> Result<Vec<TupleKey>, LedgerError>;

    /// Mark every row strictly above `block_number` as superseded — the
    /// descendants of an orphaned block are orphaned with it.
    async fn supersede_above(
        &self,
        host_chain_id: u64,
        block_number: u64,
    ) -> Result<Vec<TupleKey>, LedgerError>;

    /// Promote non-superseded provisional rows at or below `up_to_block` to
    /// final. Returns the number of rows promoted.
    async fn mark_final(&self, host_chain_id: u64, up_to_block: u64) -> Result<u64, LedgerError>;

    /// All rows for a tuple, ordered by delegation counter.
    async fn rows_for_tuple(&self, tuple: &TupleKey) -> Result<Vec<LedgerRow>, LedgerError>;

    /// Authoritative delegation state: the fold over final, non-superseded
    /// rows. Readers wanting unconfirmed state use [`project`] directly.
    async fn state_of(&self, tuple: &TupleKey) -> Result<DelegationState, LedgerError> {
        Ok(project(&self.rows_for_tuple(tuple).await?, false))
    }
}

#[async_trait]
impl<T: Ledger + ?Sized> Ledger for std::sync::Arc<T> {
    async fn append(
        &self,
        event: &DelegationEvent,
        finality: Finality,
    ) -> Result<AppendOutcome, LedgerError> {
        (**self).append(event, finality).await
    }

    async fn contains(&self, event: &DelegationEvent) -> Result<bool, LedgerError> {
        (**self).contains(event).await
    }

    async fn supersede(
        &self,
        host_chain_id: u64,
        block_number: u64,
        canonical_hash: &BlockHash,
    ) -> Result<Vec<TupleKey>, LedgerError> {
        (**self).supersede(host_chain_id, block_number, canonical_hash).await
    }

    async fn supersede_above(
        &self,
        host_chain_id: u64,
        block_number: u64,
    ) -> Result<Vec<TupleKey>, LedgerError> {
        (**self).supersede_above(host_chain_id, block_number).await
    }

    async fn mark_final(&self, host_chain_id: u64, up_to_block: u64) -> Result<u64, LedgerError> {
        (**self).mark_final(host_chain_id, up_to_block).await
    }

    async fn rows_for_tuple(&self, tuple: &TupleKey) -> Result<Vec<LedgerRow>, LedgerError> {
        (**self).rows_for_tuple(tuple).await
    }
}

/// Fold ledger rows into a [`DelegationState`].
///
/// Superseded rows never participate. With `include_provisional` the fold
/// covers unconfirmed rows too — that is the coordinator's working view,
/// not the authoritative one.
pub fn project(rows: &[LedgerRow], include_provisional: bool) -> DelegationState {
    let mut live: Vec<&LedgerRow> = rows
        .iter()
        .filter(|r| !r.superseded && (include_provisional || r.finality == Finality::Final))
        .collect();
    live.sort_by_key(|r| r.event.delegation_counter);

    let mut state = DelegationState::default();
    for row in live {
        state.apply(&row.event);
    }
    state
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn row(counter: u64, old: u64, new: u64, finality: Finality, superseded: bool) -> LedgerRow {
        LedgerRow {
            event: DelegationEvent {
                delegator: Address::new([1; 20]),
                delegate: Address::new([2; 20]),
                contract_address: Address::new([3; 20]),
                host_chain_id: 1,
                delegation_counter: counter,
                old_expiry_date: old,
                expiry_date: new,
                block_number: 100 + counter,
                block_hash: BlockHash::new([counter as u8; 32]),
                transaction_id: None,
            },
            finality,
            superseded,
            accepted_at: 0,
        }
    }

    #[test]
    fn projection_folds_final_rows_in_counter_order() {
        // Deliberately out of order
        let rows = vec![
            row(2, 1000, 2000, Finality::Final, false),
            row(1, 0, 1000, Finality::Final, false),
        ];
        let state = project(&rows, false);
        assert_eq!(state.last_counter, 2);
        assert_eq!(state.expiry, 2000);
        assert!(!state.revoked);
    }

    #[test]
    fn projection_excludes_provisional_unless_asked() {
        let rows = vec![
            row(1, 0, 1000, Finality::Final, false),
            row(2, 1000, 2000, Finality::Provisional, false),
        ];
        assert_eq!(project(&rows, false).last_counter, 1);
        assert_eq!(project(&rows, true).last_counter, 2);
    }

    #[test]
    fn projection_never_sees_superseded_rows() {
        let rows = vec![
            row(1, 0, 1000, Finality::Final, false),
            row(2, 1000, 2000, Finality::Provisional, true),
        ];
        assert_eq!(project(&rows, true).last_counter, 1);
    }

    #[test]
    fn projection_of_revocation() {
        let rows = vec![
            row(1, 0, 1000, Finality::Final, false),
            row(2, 1000, 0, Finality::Final, false),
        ];
        let state = project(&rows, false);
        assert!(state.revoked);
        assert!(!state.is_effective_at(0));
    }

    #[test]
    fn empty_projection_is_default() {
        assert_eq!(project(&[], false), DelegationState::default());
    }
}
