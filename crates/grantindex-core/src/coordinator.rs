//! Reconciliation coordinator — drives the pipeline per incoming event:
//! normalize → sequence-evaluate → finality-classify → write.
//!
//! Transient storage failures are retried with bounded backoff. Counter
//! conflicts and sequence-gap timeouts park the event (never drop it),
//! alert the operations channel, and pause the tuple until an operator
//! replays. Reorg supersession rebuilds the working state of affected
//! tuples from the surviving rows.
//!
//! The coordinator processes events strictly in call order; run one per
//! worker and route all events of a tuple to the same worker (see
//! [`crate::pool`]).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::alert::{Alert, AlertBus};
use crate::error::LedgerError;
use crate::finality::{BlockClass, FinalityConfig, FinalityTracker, ReorgOutcome};
use crate::ledger::{project, AppendOutcome, Ledger};
use crate::normalize::{normalize, RawLogRecord};
use crate::retry::{BackoffPolicy, RetryConfig};
use crate::sequencer::{Evaluation, Sequencer, SequencerConfig};
use crate::types::{BlockHash, DelegationEvent, DelegationState, Finality, TupleKey};

/// Coordinator tuning knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub sequencer: SequencerConfig,
    pub finality: FinalityConfig,
    pub retry: RetryConfig,
}

/// Why an event sits in the parking lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParkReason {
    CounterConflict,
    SequenceGapTimeout,
    StorageFailure,
    /// The event's tuple was already paused by an earlier condition.
    TuplePaused,
}

/// An event set aside for operator inspection. Replayable at any time —
/// idempotent writes make redelivery safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedEvent {
    pub event: DelegationEvent,
    pub reason: ParkReason,
    /// Epoch seconds when the event was parked.
    pub parked_at: i64,
}

/// Result of reconciling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted and persisted with the given finality.
    Applied(Finality),
    /// Idempotent redelivery — the row already exists.
    Duplicate,
    /// Buffered, waiting for a missing predecessor counter.
    Held,
    /// The containing block lost a reorg; the event was discarded.
    Dismissed,
    /// Malformed input, dropped before the pipeline.
    Dropped,
    /// Set aside for operator inspection.
    Parked(ParkReason),
}

/// Counters snapshot for observability.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorMetrics {
    pub accepted: u64,
    pub duplicates: u64,
    pub held: u64,
    pub dismissed: u64,
    pub malformed: u64,
    pub parked: u64,
    pub reorgs: u64,
    pub superseded_rows: u64,
}

enum WriteResult {
    Applied(Finality),
    Duplicate,
    Dismissed,
    Parked(ParkReason),
}

/// Orchestrates sequencing, finality classification, and ledger writes.
pub struct Coordinator<L: Ledger> {
    ledger: L,
    sequencer: Sequencer,
    finality: FinalityTracker,
    backoff: BackoffPolicy,
    alerts: AlertBus,
    /// Working state per tuple, including provisional rows. The
    /// authoritative projection (final rows only) lives in the ledger.
    states: HashMap<TupleKey, DelegationState>,
    paused: HashSet<TupleKey>,
    parked: Vec<ParkedEvent>,
    metrics: CoordinatorMetrics,
}

impl<L: Ledger> Coordinator<L> {
    pub fn new(ledger: L, config: CoordinatorConfig) -> Self {
        Self::with_alerts(ledger, config, AlertBus::default())
    }

    /// Build a coordinator that emits on a shared alert bus (the pool gives
    /// every worker the same bus).
    pub fn with_alerts(ledger: L, config: CoordinatorConfig, alerts: AlertBus) -> Self {
        Self {
            ledger,
            sequencer: Sequencer::new(config.sequencer),
            finality: FinalityTracker::new(config.finality),
            backoff: BackoffPolicy::new(config.retry),
            alerts,
            states: HashMap::new(),
            paused: HashSet::new(),
            parked: Vec::new(),
            metrics: CoordinatorMetrics::default(),
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Subscribe here before feeding events to catch every alert.
    pub fn alerts(&self) -> &AlertBus {
        &self.alerts
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        self.metrics.clone()
    }

    pub fn parked(&self) -> &[ParkedEvent] {
        &self.parked
    }

    pub fn is_paused(&self, tuple: &TupleKey) -> bool {
        self.paused.contains(tuple)
    }

    /// Normalize and reconcile one raw log record.
    pub async fn ingest(&mut self, raw: &RawLogRecord) -> Outcome {
        match normalize(raw) {
            Ok(event) => self.process(event).await,
            Err(e) => {
                tracing::warn!(
                    host_chain_id = raw.host_chain_id,
                    block_number = raw.block_number,
                    error = %e,
                    "dropping malformed log record"
                );
                self.metrics.malformed += 1;
                Outcome::Dropped
            }
        }
    }

    /// Reconcile one canonical event. After a successful apply, buffered
    /// successors for the same tuple are drained in counter order.
    pub async fn process(&mut self, event: DelegationEvent) -> Outcome {
        let tuple = event.tuple();
        let outcome = self.process_inner(event).await;
        if matches!(outcome, Outcome::Applied(_)) {
            self.drain_ready(&tuple).await;
        }
        outcome
    }

    async fn process_inner(&mut self, event: DelegationEvent) -> Outcome {
        let tuple = event.tuple();
        if self.paused.contains(&tuple) {
            self.park(event, ParkReason::TuplePaused);
            return Outcome::Parked(ParkReason::TuplePaused);
        }

        let state = match self.working_state(&tuple).await {
            Ok(state) => state,
            Err(e) => return self.storage_failure(event, e),
        };

        match self.sequencer.evaluate(&event, &state) {
            Evaluation::Apply => match self.classify_and_write(event).await {
                WriteResult::Applied(finality) => Outcome::Applied(finality),
                WriteResult::Duplicate => Outcome::Duplicate,
                WriteResult::Dismissed => Outcome::Dismissed,
                WriteResult::Parked(reason) => Outcome::Parked(reason),
            },
            Evaluation::Replay => {
                let ledger = &self.ledger;
                let ev = &event;
                match retry_op(&self.backoff, move || ledger.contains(ev)).await {
                    Ok(true) => {
                        self.metrics.duplicates += 1;
                        Outcome::Duplicate
                    }
                    Ok(false) => {
                        let reason = format!(
                            "counter {} at or below last applied {} with no matching row",
                            event.delegation_counter, state.last_counter
                        );
                        self.conflict(event, reason)
                    }
                    Err(e) => self.storage_failure(event, e),
                }
            }
            Evaluation::ChainMismatch => {
                let reason = format!(
                    "old expiry {} does not chain onto current expiry {}",
                    event.old_expiry_date, state.expiry
                );
                self.conflict(event, reason)
            }
            Evaluation::Hold => match self.sequencer.hold(event) {
                Ok(()) => {
                    self.metrics.held += 1;
                    Outcome::Held
                }
                Err(event) => self.gap_timeout(event, state.last_counter + 1),
            },
        }
    }

    /// Classify the event's block and persist it.
    async fn classify_and_write(&mut self, event: DelegationEvent) -> WriteResult {
        let tuple = event.tuple();
        let finality = match self.finality.classify(&event) {
            BlockClass::Final => Finality::Final,
            BlockClass::Provisional => Finality::Provisional,
            BlockClass::Orphaned { expected } => {
                tracing::warn!(
                    %tuple,
                    block_number = event.block_number,
                    block_hash = %event.block_hash,
                    expected = %expected,
                    "event on orphaned block dismissed"
                );
                self.metrics.dismissed += 1;
                return WriteResult::Dismissed;
            }
            BlockClass::TipReorg { fork_block } => {
                // The tip moved under us: the incoming event carries the new
                // canonical hash. Supersede the displaced rows, then treat
                // the event as the fresh chain.
                if let Err(e) = self
                    .run_reorg(event.host_chain_id, fork_block, event.block_hash)
                    .await
                {
                    return WriteResult::Parked(self.storage_failure_reason(event, e));
                }
                Finality::Provisional
            }
        };

        let ledger = &self.ledger;
        let ev = &event;
        match retry_op(&self.backoff, move || ledger.append(ev, finality)).await {
            Ok(AppendOutcome::Inserted) => {
                let state = self.states.entry(tuple).or_default();
                state.apply(&event);
                self.metrics.accepted += 1;
                tracing::debug!(
                    %tuple,
                    counter = event.delegation_counter,
                    %finality,
                    "event applied"
                );
                WriteResult::Applied(finality)
            }
            Ok(AppendOutcome::AlreadyExists) => {
                // The working state missed this row; drop the cache and let
                // the next access rebuild it from the ledger.
                self.states.remove(&tuple);
                self.metrics.duplicates += 1;
                WriteResult::Duplicate
            }
            Err(e) => WriteResult::Parked(self.storage_failure_reason(event, e)),
        }
    }

    /// Apply buffered successors for a tuple while the chain closes.
    async fn drain_ready(&mut self, tuple: &TupleKey) {
        loop {
            let Some(state) = self.states.get(tuple).copied() else { break };
            let Some(next) = self.sequencer.next_ready(tuple, &state) else { break };
            match self.sequencer.evaluate(&next, &state) {
                Evaluation::Apply => {
                    if !matches!(
                        self.classify_and_write(next).await,
                        WriteResult::Applied(_)
                    ) {
                        break;
                    }
                }
                Evaluation::ChainMismatch => {
                    let reason = format!(
                        "buffered event's old expiry {} does not chain onto {}",
                        next.old_expiry_date, state.expiry
                    );
                    self.conflict(next, reason);
                    break;
                }
                // next_ready only yields last_counter + 1
                Evaluation::Replay | Evaluation::Hold => break,
            }
        }
    }

    /// Record a chain head observation and promote newly finalized rows.
    pub async fn observe_head(
        &mut self,
        host_chain_id: u64,
        block_number: u64,
        block_hash: BlockHash,
    ) {
        let Some(finalized) = self
            .finality
            .observe_head(host_chain_id, block_number, block_hash)
        else {
            return;
        };
        let ledger = &self.ledger;
        match retry_op(&self.backoff, move || {
            ledger.mark_final(host_chain_id, finalized)
        })
        .await
        {
            Ok(promoted) if promoted > 0 => {
                tracing::debug!(host_chain_id, finalized, promoted, "promoted rows to final");
            }
            Ok(_) => {}
            Err(e) => {
                // Promotion is re-attempted on the next head; rows stay
                // readable as provisional meanwhile.
                tracing::warn!(host_chain_id, error = %e, "finality promotion failed");
            }
        }
    }

    /// Handle an explicit reorg notification from the chain client.
    /// Returns the number of rows superseded (0 for a no-op announcement).
    pub async fn handle_reorg(
        &mut self,
        host_chain_id: u64,
        block_number: u64,
        new_hash: BlockHash,
    ) -> u64 {
        match self.run_reorg(host_chain_id, block_number, new_hash).await {
            Ok(superseded) => superseded,
            Err(e) => {
                tracing::error!(
                    host_chain_id,
                    block_number,
                    error = %e,
                    "reorg supersession failed"
                );
                self.alerts.emit(Alert::StorageFailure {
                    tuple: None,
                    detail: format!("reorg supersession at block {block_number}: {e}"),
                });
                0
            }
        }
    }

    async fn run_reorg(
        &mut self,
        host_chain_id: u64,
        fork_block: u64,
        new_hash: BlockHash,
    ) -> Result<u64, LedgerError> {
        if self.finality.apply_reorg(host_chain_id, fork_block, new_hash) == ReorgOutcome::NoOp {
            return Ok(0);
        }

        let ledger = &self.ledger;
        let hash = &new_hash;
        let mut marked = retry_op(&self.backoff, move || {
            ledger.supersede(host_chain_id, fork_block, hash)
        })
        .await?;
        let ledger = &self.ledger;
        marked.extend(
            retry_op(&self.backoff, move || {
                ledger.supersede_above(host_chain_id, fork_block)
            })
            .await?,
        );

        let superseded_rows = marked.len() as u64;
        let affected: HashSet<TupleKey> = marked.into_iter().collect();
        for tuple in &affected {
            let ledger = &self.ledger;
            let rows = retry_op(&self.backoff, move || ledger.rows_for_tuple(tuple)).await?;
            self.states.insert(*tuple, project(&rows, true));
        }

        self.metrics.reorgs += 1;
        self.metrics.superseded_rows += superseded_rows;
        self.alerts.emit(Alert::ReorgDetected {
            host_chain_id,
            fork_block,
            new_hash,
            superseded_rows,
        });
        Ok(superseded_rows)
    }

    /// Park buffered events whose predecessor never arrived within the TTL.
    /// Call periodically (the pool runs this on a timer).
    pub fn sweep_pending(&mut self) {
        for event in self.sequencer.take_expired(Instant::now()) {
            let tuple = event.tuple();
            let expected = self
                .states
                .get(&tuple)
                .map(|s| s.last_counter + 1)
                .unwrap_or(1);
            self.alerts.emit(Alert::SequenceGapTimeout { tuple, expected });
            self.pause(&tuple);
            self.park(event, ParkReason::SequenceGapTimeout);
        }
    }

    /// Operator entry point: replay every parked event and lift all pauses.
    /// Returns how many replays were applied.
    pub async fn replay_parked(&mut self) -> usize {
        let parked = std::mem::take(&mut self.parked);
        self.paused.clear();
        // Rows may have been repaired out of band; rebuild states lazily.
        self.states.clear();
        let mut applied = 0;
        for p in parked {
            if matches!(self.process(p.event).await, Outcome::Applied(_)) {
                applied += 1;
            }
        }
        applied
    }

    async fn working_state(&mut self, tuple: &TupleKey) -> Result<DelegationState, LedgerError> {
        if let Some(state) = self.states.get(tuple) {
            return Ok(*state);
        }
        let ledger = &self.ledger;
        let rows = retry_op(&self.backoff, move || ledger.rows_for_tuple(tuple)).await?;
        let state = project(&rows, true);
        self.states.insert(*tuple, state);
        Ok(state)
    }

    fn conflict(&mut self, event: DelegationEvent, reason: String) -> Outcome {
        let tuple = event.tuple();
        self.alerts.emit(Alert::CounterConflict {
            tuple,
            counter: event.delegation_counter,
            reason,
        });
        self.pause(&tuple);
        self.park(event, ParkReason::CounterConflict);
        Outcome::Parked(ParkReason::CounterConflict)
    }

    fn gap_timeout(&mut self, event: DelegationEvent, expected: u64) -> Outcome {
        let tuple = event.tuple();
        self.alerts.emit(Alert::SequenceGapTimeout { tuple, expected });
        self.pause(&tuple);
        self.park(event, ParkReason::SequenceGapTimeout);
        Outcome::Parked(ParkReason::SequenceGapTimeout)
    }

    fn storage_failure(&mut self, event: DelegationEvent, error: LedgerError) -> Outcome {
        let reason = self.storage_failure_reason(event, error);
        Outcome::Parked(reason)
    }

    fn storage_failure_reason(&mut self, event: DelegationEvent, error: LedgerError) -> ParkReason {
        self.alerts.emit(Alert::StorageFailure {
            tuple: Some(event.tuple()),
            detail: error.to_string(),
        });
        self.park(event, ParkReason::StorageFailure);
        ParkReason::StorageFailure
    }

    /// Pause a tuple and move its buffered events to the parking lot.
    fn pause(&mut self, tuple: &TupleKey) {
        self.paused.insert(*tuple);
        for held in self.sequencer.drain_tuple(tuple) {
            self.park(held, ParkReason::TuplePaused);
        }
    }

    fn park(&mut self, event: DelegationEvent, reason: ParkReason) {
        self.metrics.parked += 1;
        self.parked.push(ParkedEvent {
            event,
            reason,
            parked_at: chrono::Utc::now().timestamp(),
        });
    }
}

/// Run a ledger operation, retrying transient failures with backoff until
/// the budget runs out.
async fn retry_op<T, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                attempt += 1;
                match policy.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(attempt, error = %e, "transient storage error, backing off");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}
