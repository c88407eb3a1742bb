//! SQLite ledger backend.
//!
//! Persists the delegation event ledger to a single SQLite file using
//! `sqlx` with WAL mode. The uniqueness key is enforced by a unique index
//! over the full event tuple, so a duplicate insert is a cheap no-op and
//! redelivery is safe. A `NULL` transaction id participates in the key via
//! `COALESCE(transaction_id, '')` — two deliveries of the same synthetic
//! event collide instead of storing twice.
//!
//! # Usage
//! ```rust,no_run
//! use grantindex_storage::sqlite::SqliteLedger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let ledger = SqliteLedger::open("./grants.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let ledger = SqliteLedger::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use grantindex_core::error::LedgerError;
use grantindex_core::ledger::{AppendOutcome, Ledger, LedgerRow};
use grantindex_core::types::{
    encode_hex, BlockHash, DelegationEvent, Finality, TupleKey,
};

/// SQLite-backed delegation event ledger.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./grants.db"`) or a full
    /// SQLite URL (`"sqlite:./grants.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, LedgerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    /// Open an in-memory SQLite database. Data is lost when the pool drops.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    /// Create the schema and enable WAL mode.
    async fn init_schema(&self) -> Result<(), LedgerError> {
        // WAL mode — better concurrent read throughput
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS delegation_events (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                delegator          TEXT    NOT NULL,
                delegate           TEXT    NOT NULL,
                contract_address   TEXT    NOT NULL,
                host_chain_id      INTEGER NOT NULL,
                delegation_counter INTEGER NOT NULL,
                old_expiry_date    INTEGER NOT NULL,
                expiry_date        INTEGER NOT NULL,
                block_number       INTEGER NOT NULL,
                block_hash         TEXT    NOT NULL,
                transaction_id     TEXT,
                finality           TEXT    NOT NULL,
                superseded         INTEGER NOT NULL DEFAULT 0,
                accepted_at        INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // The idempotency contract: one row per full event tuple
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_delegation_events_unique
             ON delegation_events (
                delegator, delegate, contract_address, delegation_counter,
                old_expiry_date, expiry_date, block_number, block_hash,
                COALESCE(transaction_id, '')
             );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Common query patterns: per-tuple folds and per-height supersession
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delegation_events_tuple
             ON delegation_events (delegator, delegate, contract_address, delegation_counter);",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delegation_events_height
             ON delegation_events (host_chain_id, block_number);",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Total number of stored rows, superseded ones included.
    pub async fn row_count(&self) -> Result<u64, LedgerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM delegation_events")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn append(
        &self,
        event: &DelegationEvent,
        finality: Finality,
    ) -> Result<AppendOutcome, LedgerError> {
        // A single INSERT is atomic in SQLite; OR IGNORE turns the
        // uniqueness collision into an affected-rows count of zero.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO delegation_events
             (delegator, delegate, contract_address, host_chain_id,
              delegation_counter, old_expiry_date, expiry_date,
              block_number, block_hash, transaction_id, finality,
              superseded, accepted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(event.delegator.to_string())
        .bind(event.delegate.to_string())
        .bind(event.contract_address.to_string())
        .bind(event.host_chain_id as i64)
        .bind(event.delegation_counter as i64)
        .bind(event.old_expiry_date as i64)
        .bind(event.expiry_date as i64)
        .bind(event.block_number as i64)
        .bind(event.block_hash.to_string())
        .bind(event.transaction_id.as_deref().map(encode_hex))
        .bind(finality.as_str())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Ok(AppendOutcome::AlreadyExists);
        }
        debug!(
            delegator = %event.delegator,
            counter = event.delegation_counter,
            block = event.block_number,
            "event stored"
        );
        Ok(AppendOutcome::Inserted)
    }

    async fn contains(&self, event: &DelegationEvent) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM delegation_events
             WHERE delegator = ? AND delegate = ? AND contract_address = ?
               AND delegation_counter = ? AND old_expiry_date = ? AND expiry_date = ?
               AND block_number = ? AND block_hash = ?
               AND COALESCE(transaction_id, '') = COALESCE(?, '')",
        )
        .bind(event.delegator.to_string())
        .bind(event.delegate.to_string())
        .bind(event.contract_address.to_string())
        .bind(event.delegation_counter as i64)
        .bind(event.old_expiry_date as i64)
        .bind(event.expiry_date as i64)
        .bind(event.block_number as i64)
        .bind(event.block_hash.to_string())
        .bind(event.transaction_id.as_deref().map(encode_hex))
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") > 0)
    }

    async fn supersede(
        &self,
        host_chain_id: u64,
        block_number: u64,
        canonical_hash: &BlockHash,
    ) -> Result<Vec<TupleKey>, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let rows = sqlx::query(
            "SELECT delegator, delegate, contract_address FROM delegation_events
             WHERE host_chain_id = ? AND block_number = ?
               AND block_hash <> ? AND superseded = 0",
        )
        .bind(host_chain_id as i64)
        .bind(block_number as i64)
        .bind(canonical_hash.to_string())
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_err)?;

        if rows.is_empty() {
            tx.commit().await.map_err(storage_err)?;
            return Ok(vec![]);
        }

        sqlx::query(
            "UPDATE delegation_events SET superseded = 1
             WHERE host_chain_id = ? AND block_number = ?
               AND block_hash <> ? AND superseded = 0",
        )
        .bind(host_chain_id as i64)
        .bind(block_number as i64)
        .bind(canonical_hash.to_string())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        let marked = rows.iter().map(tuple_from_row).collect::<Result<Vec<_>, _>>()?;
        debug!(host_chain_id, block_number, marked = marked.len(), "rows superseded");
        Ok(marked)
    }

    async fn supersede_above(
        &self,
        host_chain_id: u64,
        block_number: u64,
    ) -> Result<Vec<TupleKey>, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let rows = sqlx::query(
            "SELECT delegator, delegate, contract_address FROM delegation_events
             WHERE host_chain_id = ? AND block_number > ? AND superseded = 0",
        )
        .bind(host_chain_id as i64)
        .bind(block_number as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_err)?;

        if rows.is_empty() {
            tx.commit().await.map_err(storage_err)?;
            return Ok(vec![]);
        }

        sqlx::query(
            "UPDATE delegation_events SET superseded = 1
             WHERE host_chain_id = ? AND block_number > ? AND superseded = 0",
        )
        .bind(host_chain_id as i64)
        .bind(block_number as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        rows.iter().map(tuple_from_row).collect()
    }

    async fn mark_final(&self, host_chain_id: u64, up_to_block: u64) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE delegation_events SET finality = 'final'
             WHERE host_chain_id = ? AND block_number <= ?
               AND superseded = 0 AND finality = 'provisional'",
        )
        .bind(host_chain_id as i64)
        .bind(up_to_block as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn rows_for_tuple(&self, tuple: &TupleKey) -> Result<Vec<LedgerRow>, LedgerError> {
        let rows = sqlx::query(
            "SELECT delegator, delegate, contract_address, host_chain_id,
                    delegation_counter, old_expiry_date, expiry_date,
                    block_number, block_hash, transaction_id, finality,
                    superseded, accepted_at
             FROM delegation_events
             WHERE delegator = ? AND delegate = ? AND contract_address = ?
             ORDER BY delegation_counter",
        )
        .bind(tuple.delegator.to_string())
        .bind(tuple.delegate.to_string())
        .bind(tuple.contract_address.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(ledger_row_from_row).collect()
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn storage_err(e: sqlx::Error) -> LedgerError {
    match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => LedgerError::Transient(e.to_string()),
        _ => LedgerError::Fatal(e.to_string()),
    }
}

fn corrupt(detail: impl std::fmt::Display) -> LedgerError {
    LedgerError::Fatal(format!("corrupt row: {detail}"))
}

fn tuple_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TupleKey, LedgerError> {
    Ok(TupleKey {
        delegator: row.get::<String, _>("delegator").parse().map_err(corrupt)?,
        delegate: row.get::<String, _>("delegate").parse().map_err(corrupt)?,
        contract_address: row
            .get::<String, _>("contract_address")
            .parse()
            .map_err(corrupt)?,
    })
}

fn ledger_row_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerRow, LedgerError> {
    let transaction_id = match row.get::<Option<String>, _>("transaction_id") {
        None => None,
        Some(s) => Some(
            grantindex_core::types::decode_hex(&s)
                .ok_or_else(|| corrupt(format!("transaction_id {s}")))?,
        ),
    };
    Ok(LedgerRow {
        event: DelegationEvent {
            delegator: row.get::<String, _>("delegator").parse().map_err(corrupt)?,
            delegate: row.get::<String, _>("delegate").parse().map_err(corrupt)?,
            contract_address: row
                .get::<String, _>("contract_address")
                .parse()
                .map_err(corrupt)?,
            host_chain_id: row.get::<i64, _>("host_chain_id") as u64,
            delegation_counter: row.get::<i64, _>("delegation_counter") as u64,
            old_expiry_date: row.get::<i64, _>("old_expiry_date") as u64,
            expiry_date: row.get::<i64, _>("expiry_date") as u64,
            block_number: row.get::<i64, _>("block_number") as u64,
            block_hash: row.get::<String, _>("block_hash").parse().map_err(corrupt)?,
            transaction_id,
        },
        finality: row
            .get::<String, _>("finality")
            .parse()
            .map_err(corrupt)?,
        superseded: row.get::<i64, _>("superseded") != 0,
        accepted_at: row.get::<i64, _>("accepted_at"),
    })
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
            transaction_id: Some(vec![0xde, 0xad, counter as u8]),
        }
    }

    #[tokio::test]
    async fn append_roundtrip_and_idempotency() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let e = event(1, 100, 0xa1);

        assert_eq!(
            ledger.append(&e, Finality::Provisional).await.unwrap(),
            AppendOutcome::Inserted
        );
        assert_eq!(
            ledger.append(&e, Finality::Provisional).await.unwrap(),
            AppendOutcome::AlreadyExists
        );
        assert_eq!(ledger.row_count().await.unwrap(), 1);

        let rows = ledger.rows_for_tuple(&e.tuple()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event, e);
        assert_eq!(rows[0].finality, Finality::Provisional);
        assert!(!rows[0].superseded);
    }

    #[tokio::test]
    async fn null_transaction_id_still_collides() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let mut e = event(1, 100, 0xa1);
        e.transaction_id = None;

        ledger.append(&e, Finality::Provisional).await.unwrap();
        assert_eq!(
            ledger.append(&e, Finality::Provisional).await.unwrap(),
            AppendOutcome::AlreadyExists
        );
        assert!(ledger.contains(&e).await.unwrap());
    }

    #[tokio::test]
    async fn supersede_marks_only_differing_hashes() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        ledger.append(&event(1, 100, 0xa1), Finality::Provisional).await.unwrap();
        ledger.append(&event(2, 101, 0xa2), Finality::Provisional).await.unwrap();

        // No-op announcement
        let canonical = BlockHash::new([0xa1; 32]);
        assert!(ledger.supersede(1, 100, &canonical).await.unwrap().is_empty());

        let new_hash = BlockHash::new([0xb2; 32]);
        let marked = ledger.supersede(1, 101, &new_hash).await.unwrap();
        assert_eq!(marked.len(), 1);

        let rows = ledger.rows_for_tuple(&event(1, 100, 0).tuple()).await.unwrap();
        assert!(!rows[0].superseded);
        assert!(rows[1].superseded);
    }

    #[tokio::test]
    async fn supersede_above_and_projection() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        for (counter, block) in [(1u64, 100u64), (2, 101), (3, 102)] {
            ledger
                .append(&event(counter, block, counter as u8), Finality::Final)
                .await
                .unwrap();
        }
        let marked = ledger.supersede_above(1, 100).await.unwrap();
        assert_eq!(marked.len(), 2);

        let state = ledger.state_of(&event(1, 100, 1).tuple()).await.unwrap();
        assert_eq!(state.last_counter, 1);
        assert_eq!(state.expiry, 1000);
    }

    #[tokio::test]
    async fn mark_final_promotes_and_projection_follows() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        ledger.append(&event(1, 100, 1), Finality::Provisional).await.unwrap();

        let tuple = event(1, 100, 1).tuple();
        assert_eq!(ledger.state_of(&tuple).await.unwrap().last_counter, 0);

        assert_eq!(ledger.mark_final(1, 100).await.unwrap(), 1);
        assert_eq!(ledger.state_of(&tuple).await.unwrap().last_counter, 1);
    }
}
