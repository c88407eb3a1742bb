//! Structured alerts for the operations channel.
//!
//! Alerts ride a broadcast channel so any number of consumers (ops
//! forwarders, tests) can subscribe; every alert is also logged.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{BlockHash, TupleKey};

/// A condition worth an operator's attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Alert {
    /// Divergent local history — the tuple's automatic processing is paused.
    CounterConflict {
        tuple: TupleKey,
        counter: u64,
        reason: String,
    },
    /// A buffered event's predecessor never arrived.
    SequenceGapTimeout { tuple: TupleKey, expected: u64 },
    /// A chain reorganization invalidated stored rows.
    ReorgDetected {
        host_chain_id: u64,
        fork_block: u64,
        new_hash: BlockHash,
        superseded_rows: u64,
    },
    /// A ledger operation failed past the retry budget. Carries the affected
    /// tuple when the failure parked an event; `None` for supersession
    /// failures during reorg handling.
    StorageFailure {
        tuple: Option<TupleKey>,
        detail: String,
    },
}

/// Broadcast fan-out for alerts. Cloning shares the underlying channel.
///
/// Subscribe before feeding events to avoid missing early alerts. Emitting
/// with no subscribers is fine — the alert is still logged.
#[derive(Clone)]
pub struct AlertBus {
    tx: broadcast::Sender<Alert>,
}

impl AlertBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    pub fn emit(&self, alert: Alert) {
        match &alert {
            Alert::CounterConflict { tuple, counter, reason } => {
                tracing::error!(tuple = %tuple, counter = *counter, reason = %reason, "counter conflict");
            }
            Alert::SequenceGapTimeout { tuple, expected } => {
                tracing::error!(tuple = %tuple, expected = *expected, "sequence gap timeout");
            }
            Alert::ReorgDetected { host_chain_id, fork_block, new_hash, superseded_rows } => {
                tracing::warn!(
                    host_chain_id = *host_chain_id,
                    fork_block = *fork_block,
                    new_hash = %new_hash,
                    superseded_rows = *superseded_rows,
                    "reorg detected"
                );
            }
            Alert::StorageFailure { tuple: Some(tuple), detail } => {
                tracing::error!(tuple = %tuple, detail = %detail, "storage failure");
            }
            Alert::StorageFailure { tuple: None, detail } => {
                tracing::error!(detail = %detail, "storage failure");
            }
        }
        let _ = self.tx.send(alert);
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new(256)
    }
}
