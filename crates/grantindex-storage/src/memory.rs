//! In-memory ledger backend.
//!
//! Keeps every row in RAM behind a mutex. Useful for tests and short-lived
//! embedders that don't need persistence; all data is lost on exit.

use std::sync::Mutex;

use async_trait::async_trait;

use grantindex_core::error::LedgerError;
use grantindex_core::ledger::{AppendOutcome, Ledger, LedgerRow};
use grantindex_core::types::{BlockHash, DelegationEvent, Finality, TupleKey};

/// In-memory append-only ledger.
#[derive(Default)]
pub struct InMemoryLedger {
    rows: Mutex<Vec<LedgerRow>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored rows, superseded ones included.
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Number of rows marked superseded.
    pub fn superseded_count(&self) -> usize {
        self.rows.lock().unwrap().iter().filter(|r| r.superseded).count()
    }

    /// Snapshot of every stored row (audit/debug).
    pub fn all_rows(&self) -> Vec<LedgerRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn append(
        &self,
        event: &DelegationEvent,
        finality: Finality,
    ) -> Result<AppendOutcome, LedgerError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.event == *event) {
            return Ok(AppendOutcome::AlreadyExists);
        }
        rows.push(LedgerRow {
            event: event.clone(),
            finality,
            superseded: false,
            accepted_at: chrono::Utc::now().timestamp(),
        });
        Ok(AppendOutcome::Inserted)
    }

    async fn contains(&self, event: &DelegationEvent) -> Result<bool, LedgerError> {
        Ok(self.rows.lock().unwrap().iter().any(|r| r.event == *event))
    }

    async fn supersede(
        &self,
        host_chain_id: u64,
        block_number: u64,
        canonical_hash: &BlockHash,
    ) -> Result<Vec<TupleKey>, LedgerError> {
        let mut rows = self.rows.lock().unwrap();
        let mut marked = Vec::new();
        for row in rows.iter_mut() {
            if !row.superseded
                && row.event.host_chain_id == host_chain_id
                && row.event.block_number == block_number
                && row.event.block_hash != *canonical_hash
            {
                row.superseded = true;
                marked.push(row.event.tuple());
            }
        }
        Ok(marked)
    }

    async fn supersede_above(
        &self,
        host_chain_id: u64,
        block_number: u64,
    ) -> Result<Vec<TupleKey>, LedgerError> {
        let mut rows = self.rows.lock().unwrap();
        let mut marked = Vec::new();
        for row in rows.iter_mut() {
            if !row.superseded
                && row.event.host_chain_id == host_chain_id
                && row.event.block_number > block_number
            {
                row.superseded = true;
                marked.push(row.event.tuple());
            }
        }
        Ok(marked)
    }

    async fn mark_final(&self, host_chain_id: u64, up_to_block: u64) -> Result<u64, LedgerError> {
        let mut rows = self.rows.lock().unwrap();
        let mut promoted = 0;
        for row in rows.iter_mut() {
            if !row.superseded
                && row.finality == Finality::Provisional
                && row.event.host_chain_id == host_chain_id
                && row.event.block_number <= up_to_block
            {
                row.finality = Finality::Final;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn rows_for_tuple(&self, tuple: &TupleKey) -> Result<Vec<LedgerRow>, LedgerError> {
        let mut rows: Vec<LedgerRow> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.event.tuple() == *tuple)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.event.delegation_counter);
        Ok(rows)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use grantindex_core::types::Address;

    fn event(counter: u64, block: u64, hash_byte: u8) -> DelegationEvent {
        DelegationEvent {
            delegator: Address::new([1; 20]),
            delegate: Address::new([2; 20]),
            contract_address: Address::new([3; 20]),
            host_chain_id: 1,
            delegation_counter: counter,
            old_expiry_date: (counter - 1) * 1000,
            expiry_date: counter * 1000,
            block_number: block,
            block_hash: BlockHash::new([hash_byte; 32]),
            transaction_id: None,
        }
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let e = event(1, 100, 0xa1);
        assert_eq!(
            ledger.append(&e, Finality::Provisional).await.unwrap(),
            AppendOutcome::Inserted
        );
        assert_eq!(
            ledger.append(&e, Finality::Provisional).await.unwrap(),
            AppendOutcome::AlreadyExists
        );
        assert_eq!(ledger.row_count(), 1);
        assert!(ledger.contains(&e).await.unwrap());
    }

    #[tokio::test]
    async fn supersede_marks_differing_hashes_only() {
        let ledger = InMemoryLedger::new();
        ledger.append(&event(1, 100, 0xa1), Finality::Provisional).await.unwrap();
        ledger.append(&event(2, 101, 0xa2), Finality::Provisional).await.unwrap();

        // Announce the hash block 100 already has — nothing marked
        let canonical = BlockHash::new([0xa1; 32]);
        assert!(ledger.supersede(1, 100, &canonical).await.unwrap().is_empty());

        // Announce a different hash for 101
        let new_hash = BlockHash::new([0xb2; 32]);
        let marked = ledger.supersede(1, 101, &new_hash).await.unwrap();
        assert_eq!(marked.len(), 1);
        assert_eq!(ledger.superseded_count(), 1);
    }

    #[tokio::test]
    async fn supersede_above_takes_descendants() {
        let ledger = InMemoryLedger::new();
        for (counter, block) in [(1u64, 100u64), (2, 101), (3, 102)] {
            ledger
                .append(&event(counter, block, counter as u8), Finality::Provisional)
                .await
                .unwrap();
        }
        let marked = ledger.supersede_above(1, 100).await.unwrap();
        assert_eq!(marked.len(), 2);
        assert_eq!(ledger.superseded_count(), 2);
    }

    #[tokio::test]
    async fn mark_final_promotes_up_to_height() {
        let ledger = InMemoryLedger::new();
        ledger.append(&event(1, 100, 1), Finality::Provisional).await.unwrap();
        ledger.append(&event(2, 105, 2), Finality::Provisional).await.unwrap();

        assert_eq!(ledger.mark_final(1, 103).await.unwrap(), 1);
        // Already-final rows are not re-promoted
        assert_eq!(ledger.mark_final(1, 103).await.unwrap(), 0);

        let state = ledger.state_of(&event(1, 100, 1).tuple()).await.unwrap();
        assert_eq!(state.last_counter, 1);
    }

    #[tokio::test]
    async fn rows_come_back_in_counter_order() {
        let ledger = InMemoryLedger::new();
        ledger.append(&event(2, 101, 2), Finality::Final).await.unwrap();
        ledger.append(&event(1, 100, 1), Finality::Final).await.unwrap();
        let rows = ledger.rows_for_tuple(&event(1, 100, 1).tuple()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].event.delegation_counter, 1);
        assert_eq!(rows[1].event.delegation_counter, 2);
    }
}
