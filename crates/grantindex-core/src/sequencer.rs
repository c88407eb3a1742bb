//! Counter sequencer — decides whether an event is applicable now, an
//! idempotent replay, or must be held pending an earlier counter.
//!
//! Each (delegator, delegate, contract) tuple carries a strictly increasing
//! `delegation_counter` supplied by the chain contract, and each event's
//! `old_expiry_date` must equal the previous event's `expiry_date`. Events
//! arriving ahead of the chain are buffered per tuple, bounded by size and
//! TTL.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::{DelegationEvent, DelegationState, TupleKey};

/// Sequencer limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Maximum events buffered per tuple while waiting for a missing counter.
    pub max_pending_per_tuple: usize,
    /// How long a buffered event may wait for its predecessor (seconds).
    pub pending_ttl_secs: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_pending_per_tuple: 64,
            pending_ttl_secs: 300,
        }
    }
}

/// Outcome of evaluating an event against the current tuple state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Next in the chain with a matching old-expiry; accept and advance.
    Apply,
    /// Counter at or below the last applied one. The ledger decides whether
    /// this is a no-op duplicate or a divergent history.
    Replay,
    /// Counter ahead of the chain; buffer until the gap closes.
    Hold,
    /// Counter is next but `old_expiry_date` does not chain onto the current
    /// state — divergent history.
    ChainMismatch,
}

/// A buffered out-of-order event.
#[derive(Debug, Clone)]
struct Held {
    event: DelegationEvent,
    held_at: Instant,
}

/// Per-tuple counter sequencing with a bounded pending buffer.
pub struct Sequencer {
    config: SequencerConfig,
    pending: HashMap<TupleKey, BTreeMap<u64, Held>>,
}

impl Sequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Compare an event against the tuple's current state.
    /// Pure — does not touch the pending buffer.
    pub fn evaluate(&self, event: &DelegationEvent, state: &DelegationState) -> Evaluation {
        let next = state.last_counter + 1;
        if event.delegation_counter == next {
            if event.old_expiry_date == state.expiry {
                Evaluation::Apply
            } else {
                Evaluation::ChainMismatch
            }
        } else if event.delegation_counter <= state.last_counter {
            Evaluation::Replay
        } else {
            Evaluation::Hold
        }
    }

    /// Buffer an event that arrived ahead of its predecessor.
    ///
    /// Returns `Err(event)` when the tuple's buffer is full — the caller
    /// escalates that to a sequence-gap timeout. A counter already buffered
    /// is kept as first seen.
    pub fn hold(&mut self, event: DelegationEvent) -> Result<(), DelegationEvent> {
        let slot = self.pending.entry(event.tuple()).or_default();
        if slot.len() >= self.config.max_pending_per_tuple
            && !slot.contains_key(&event.delegation_counter)
        {
            return Err(event);
        }
        slot.entry(event.delegation_counter).or_insert(Held {
            event,
            held_at: Instant::now(),
        });
        Ok(())
    }

    /// Pop the buffered event that is now next in the chain, if present.
    /// Called after each successful apply to drain the gap.
    pub fn next_ready(
        &mut self,
        tuple: &TupleKey,
        state: &DelegationState,
    ) -> Option<DelegationEvent> {
        let slot = self.pending.get_mut(tuple)?;
        let held = slot.remove(&(state.last_counter + 1))?;
        if slot.is_empty() {
            self.pending.remove(tuple);
        }
        Some(held.event)
    }

    /// Remove and return every buffered event older than the configured TTL.
    /// The caller parks these as sequence-gap timeouts.
    pub fn take_expired(&mut self, now: Instant) -> Vec<DelegationEvent> {
        let ttl = Duration::from_secs(self.config.pending_ttl_secs);
        let mut expired = Vec::new();
        self.pending.retain(|_, slot| {
            slot.retain(|_, held| {
                if now.duration_since(held.held_at) >= ttl {
                    expired.push(held.event.clone());
                    false
                } else {
                    true
                }
            });
            !slot.is_empty()
        });
        expired
    }

    /// Remove and return everything buffered for a tuple (used when the
    /// tuple's automatic processing is paused).
    pub fn drain_tuple(&mut self, tuple: &TupleKey) -> Vec<DelegationEvent> {
        self.pending
            .remove(tuple)
            .map(|slot| slot.into_values().map(|h| h.event).collect())
            .unwrap_or_default()
    }

    /// Number of events buffered for a tuple.
    pub fn pending_count(&self, tuple: &TupleKey) -> usize {
        self.pending.get(tuple).map_or(0, BTreeMap::len)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, BlockHash};

    fn event(counter: u64, old_expiry: u64, expiry: u64) -> DelegationEvent {
        DelegationEvent {
            delegator: Address::new([1; 20]),
            delegate: Address::new([2; 20]),
            contract_address: Address::new([3; 20]),
            host_chain_id: 1,
            delegation_counter: counter,
            old_expiry_date: old_expiry,
            expiry_date: expiry,
            block_number: 100 + counter,
            block_hash: BlockHash::new([counter as u8; 32]),
            transaction_id: None,
        }
    }

    fn sequencer() -> Sequencer {
        Sequencer::new(SequencerConfig::default())
    }

    #[test]
    fn evaluate_next_in_chain() {
        let seq = sequencer();
        let state = DelegationState::default();
        assert_eq!(seq.evaluate(&event(1, 0, 1000), &state), Evaluation::Apply);
    }

    #[test]
    fn evaluate_wrong_old_expiry_is_mismatch() {
        let seq = sequencer();
        let mut state = DelegationState::default();
        state.apply(&event(1, 0, 1000));
        // counter 2 chains, but claims there was no prior delegation
        assert_eq!(
            seq.evaluate(&event(2, 0, 2000), &state),
            Evaluation::ChainMismatch
        );
        assert_eq!(
            seq.evaluate(&event(2, 1000, 2000), &state),
            Evaluation::Apply
        );
    }

    #[test]
    fn evaluate_replay_and_hold() {
        let seq = sequencer();
        let mut state = DelegationState::default();
        state.apply(&event(1, 0, 1000));
        state.apply(&event(2, 1000, 2000));

        assert_eq!(seq.evaluate(&event(1, 0, 1000), &state), Evaluation::Replay);
        assert_eq!(seq.evaluate(&event(2, 1000, 2000), &state), Evaluation::Replay);
        assert_eq!(seq.evaluate(&event(4, 3000, 4000), &state), Evaluation::Hold);
    }

    #[test]
    fn revocation_follows_the_same_chain_rule() {
        let seq = sequencer();
        let mut state = DelegationState::default();
        state.apply(&event(1, 0, 1000));

        // Revocation must still chain: old_expiry == current expiry
        assert_eq!(seq.evaluate(&event(2, 1000, 0), &state), Evaluation::Apply);
        assert_eq!(
            seq.evaluate(&event(2, 500, 0), &state),
            Evaluation::ChainMismatch
        );

        // After a revocation the chain continues from expiry 0
        state.apply(&event(2, 1000, 0));
        assert!(state.revoked);
        assert_eq!(seq.evaluate(&event(3, 0, 5000), &state), Evaluation::Apply);
    }

    #[test]
    fn hold_and_drain_in_order() {
        let mut seq = sequencer();
        let mut state = DelegationState::default();

        // 3 and 2 arrive before 1
        seq.hold(event(3, 2000, 3000)).unwrap();
        seq.hold(event(2, 1000, 2000)).unwrap();
        assert_eq!(seq.pending_count(&event(1, 0, 0).tuple()), 2);

        state.apply(&event(1, 0, 1000));
        let next = seq.next_ready(&event(1, 0, 0).tuple(), &state).unwrap();
        assert_eq!(next.delegation_counter, 2);
        state.apply(&next);

        let next = seq.next_ready(&event(1, 0, 0).tuple(), &state).unwrap();
        assert_eq!(next.delegation_counter, 3);
        state.apply(&next);

        assert!(seq.next_ready(&event(1, 0, 0).tuple(), &state).is_none());
        assert_eq!(seq.pending_count(&event(1, 0, 0).tuple()), 0);
    }

    #[test]
    fn hold_buffer_overflow() {
        let mut seq = Sequencer::new(SequencerConfig {
            max_pending_per_tuple: 2,
            pending_ttl_secs: 300,
        });
        seq.hold(event(3, 0, 0)).unwrap();
        seq.hold(event(4, 0, 0)).unwrap();
        // Re-holding a buffered counter is fine; a new one overflows
        seq.hold(event(3, 0, 0)).unwrap();
        assert!(seq.hold(event(5, 0, 0)).is_err());
    }

    #[test]
    fn ttl_expiry_returns_buffered_events() {
        let mut seq = Sequencer::new(SequencerConfig {
            max_pending_per_tuple: 64,
            pending_ttl_secs: 0,
        });
        seq.hold(event(5, 0, 0)).unwrap();
        let expired = seq.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].delegation_counter, 5);
        assert_eq!(seq.pending_count(&event(1, 0, 0).tuple()), 0);
    }
}
