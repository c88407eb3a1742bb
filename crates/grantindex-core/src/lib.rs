//! grantindex-core — reorg-safe reconciliation of on-chain
//! decryption-delegation events.
//!
//! # Architecture
//!
//! ```text
//! chain client → RawLogRecord
//!                    │ normalize
//!                    ▼
//!              ReconcilerPool → Coordinator (one per shard)
//!                                   ├── Sequencer        (counter chain, pending buffer)
//!                                   ├── FinalityTracker  (per-chain head, reorg detection)
//!                                   ├── Ledger backend   (memory / SQLite, append-only)
//!                                   └── AlertBus         (operations channel)
//! ```
//!
//! Accepted events become immutable ledger rows; reorgs supersede rows
//! instead of deleting them, and the current delegation state is always a
//! fold over the surviving final rows.

pub mod alert;
pub mod coordinator;
pub mod error;
pub mod finality;
pub mod ledger;
pub mod normalize;
pub mod pool;
pub mod retry;
pub mod sequencer;
pub mod types;

pub use alert::{Alert, AlertBus};
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorMetrics, Outcome, ParkReason, ParkedEvent,
};
pub use error::{LedgerError, NormalizeError};
pub use finality::{BlockClass, FinalityConfig, FinalityTracker, ReorgOutcome};
pub use ledger::{project, AppendOutcome, Ledger, LedgerRow};
pub use normalize::{normalize, RawLogRecord};
pub use pool::{Inbound, PoolConfig, ReconcilerPool};
pub use retry::{BackoffPolicy, RetryConfig};
pub use sequencer::{Evaluation, Sequencer, SequencerConfig};
pub use types::{
    Address, BlockHash, ChainHead, DelegationEvent, DelegationState, Finality, TupleKey,
};
