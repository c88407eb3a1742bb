//! Finality tracker — classifies each event's containing block as final,
//! provisional, or orphaned, per host chain.
//!
//! The tracker keeps the highest head seen per chain (monotonic — reorgs are
//! expressed through supersession, never by rewinding the advertised head)
//! and a bounded window of canonical block hashes for reorg detection.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{BlockHash, ChainHead, DelegationEvent};

/// Finality parameters, shared by every tracked chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalityConfig {
    /// Confirmations before a block is considered final.
    /// Typical values: 12 (Ethereum PoS), 64 (safe), 1 (fast chains).
    pub finality_depth: u64,
    /// How many recent heights retain a canonical hash record.
    /// 128 covers deep reorgs for all major EVM chains.
    pub hash_window: u64,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            finality_depth: 12,
            hash_window: 128,
        }
    }
}

/// Classification of an event's containing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockClass {
    /// At or behind the finalized height, hash canonical.
    Final,
    /// Within the confirmation window (or the head is not yet known).
    Provisional,
    /// Hash mismatch inside the confirmation window — the tip moved and the
    /// event's chain is the new canonical one. Stored rows at and above
    /// `fork_block` with other hashes must be superseded.
    TipReorg { fork_block: u64 },
    /// Hash mismatch at or behind the finalized height — the event's block
    /// lost. The event is dismissed.
    Orphaned { expected: BlockHash },
}

/// Outcome of an explicit reorg notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgOutcome {
    /// Announced hash already canonical — nothing to do.
    NoOp,
    /// Hash records at and above `from_block` were invalidated; rows there
    /// must be superseded against the new canonical hash.
    Invalidated { from_block: u64 },
}

#[derive(Default)]
struct ChainState {
    head: Option<ChainHead>,
    canonical: BTreeMap<u64, BlockHash>,
}

/// Per-chain head tracking and block classification.
pub struct FinalityTracker {
    config: FinalityConfig,
    chains: HashMap<u64, ChainState>,
}

impl FinalityTracker {
    pub fn new(config: FinalityConfig) -> Self {
        Self {
            config,
            chains: HashMap::new(),
        }
    }

    /// Last known canonical head for a chain.
    pub fn head(&self, host_chain_id: u64) -> Option<ChainHead> {
        self.chains.get(&host_chain_id).and_then(|c| c.head)
    }

    /// Highest finalized block number for a chain, if a head is known.
    pub fn finalized_height(&self, host_chain_id: u64) -> Option<u64> {
        self.head(host_chain_id)
            .map(|h| h.block_number.saturating_sub(self.config.finality_depth))
    }

    /// Record a new chain head. Heads only advance: a lower number than the
    /// current head is ignored (readers never see a rollback in the head).
    ///
    /// Returns the new finalized height when the head advanced.
    pub fn observe_head(
        &mut self,
        host_chain_id: u64,
        block_number: u64,
        block_hash: BlockHash,
    ) -> Option<u64> {
        let chain = self.chains.entry(host_chain_id).or_default();
        if let Some(head) = chain.head {
            if block_number <= head.block_number {
                return None;
            }
        }
        chain.head = Some(ChainHead {
            block_number,
            block_hash,
        });
        chain.canonical.entry(block_number).or_insert(block_hash);
        Self::prune(chain, self.config.hash_window);
        Some(block_number.saturating_sub(self.config.finality_depth))
    }

    /// Classify an event's containing block, recording its hash as canonical
    /// for that height when no record exists yet.
    pub fn classify(&mut self, event: &DelegationEvent) -> BlockClass {
        let chain = self.chains.entry(event.host_chain_id).or_default();

        let finalized = chain
            .head
            .map(|h| h.block_number.saturating_sub(self.config.finality_depth));
        let is_final = matches!(finalized, Some(f) if event.block_number <= f);

        match chain.canonical.get(&event.block_number) {
            Some(recorded) if *recorded == event.block_hash => {}
            Some(recorded) => {
                return if is_final {
                    BlockClass::Orphaned {
                        expected: *recorded,
                    }
                } else {
                    BlockClass::TipReorg {
                        fork_block: event.block_number,
                    }
                };
            }
            None => {
                chain.canonical.insert(event.block_number, event.block_hash);
                Self::prune(chain, self.config.hash_window);
            }
        }

        if is_final {
            BlockClass::Final
        } else {
            BlockClass::Provisional
        }
    }

    /// Apply a reorg at `block_number` with the new canonical hash.
    ///
    /// A matching record is a no-op (no-op reorg announcements are common and
    /// must be cheap). Otherwise every hash record at and above the fork is
    /// invalidated and the new hash takes its place.
    pub fn apply_reorg(
        &mut self,
        host_chain_id: u64,
        block_number: u64,
        new_hash: BlockHash,
    ) -> ReorgOutcome {
        let chain = self.chains.entry(host_chain_id).or_default();
        if chain.canonical.get(&block_number) == Some(&new_hash) {
            return ReorgOutcome::NoOp;
        }
        let invalidated = chain.canonical.split_off(&block_number);
        tracing::warn!(
            host_chain_id,
            fork_block = block_number,
            invalidated = invalidated.len(),
            "reorg: invalidated canonical hash records"
        );
        chain.canonical.insert(block_number, new_hash);
        ReorgOutcome::Invalidated {
            from_block: block_number,
        }
    }

    fn prune(chain: &mut ChainState, window: u64) {
        if let Some(head) = chain.head {
            let cutoff = head.block_number.saturating_sub(window);
            chain.canonical = chain.canonical.split_off(&cutoff);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn hash(byte: u8) -> BlockHash {
        BlockHash::new([byte; 32])
    }

    fn event(block_number: u64, block_hash: BlockHash) -> DelegationEvent {
        DelegationEvent {
            delegator: Address::new([1; 20]),
            delegate: Address::new([2; 20]),
            contract_address: Address::new([3; 20]),
            host_chain_id: 1,
            delegation_counter: 1,
            old_expiry_date: 0,
            expiry_date: 1000,
            block_number,
            block_hash,
            transaction_id: None,
        }
    }

    fn tracker(depth: u64) -> FinalityTracker {
        FinalityTracker::new(FinalityConfig {
            finality_depth: depth,
            hash_window: 128,
        })
    }

    #[test]
    fn provisional_without_known_head() {
        let mut t = tracker(12);
        assert_eq!(t.classify(&event(100, hash(1))), BlockClass::Provisional);
    }

    #[test]
    fn final_behind_confirmation_depth() {
        let mut t = tracker(12);
        t.observe_head(1, 120, hash(0xee));
        assert_eq!(t.classify(&event(108, hash(1))), BlockClass::Final);
        assert_eq!(t.classify(&event(109, hash(2))), BlockClass::Provisional);
    }

    #[test]
    fn orphaned_on_final_region_mismatch() {
        let mut t = tracker(12);
        t.observe_head(1, 120, hash(0xee));
        assert_eq!(t.classify(&event(100, hash(1))), BlockClass::Final);
        // Same height, different hash — the stored canonical wins
        assert_eq!(
            t.classify(&event(100, hash(2))),
            BlockClass::Orphaned { expected: hash(1) }
        );
    }

    #[test]
    fn tip_reorg_on_provisional_mismatch() {
        let mut t = tracker(12);
        t.observe_head(1, 120, hash(0xee));
        assert_eq!(t.classify(&event(115, hash(1))), BlockClass::Provisional);
        assert_eq!(
            t.classify(&event(115, hash(2))),
            BlockClass::TipReorg { fork_block: 115 }
        );
    }

    #[test]
    fn head_is_monotonic() {
        let mut t = tracker(12);
        assert_eq!(t.observe_head(1, 120, hash(1)), Some(108));
        assert_eq!(t.observe_head(1, 110, hash(2)), None); // ignored
        assert_eq!(t.head(1).unwrap().block_number, 120);
        assert_eq!(t.finalized_height(1), Some(108));
    }

    #[test]
    fn reorg_noop_when_hash_matches() {
        let mut t = tracker(12);
        t.classify(&event(100, hash(1)));
        assert_eq!(t.apply_reorg(1, 100, hash(1)), ReorgOutcome::NoOp);
    }

    #[test]
    fn reorg_invalidates_at_and_above_fork() {
        let mut t = tracker(12);
        t.classify(&event(100, hash(1)));
        t.classify(&event(101, hash(2)));
        t.classify(&event(102, hash(3)));

        assert_eq!(
            t.apply_reorg(1, 101, hash(0x22)),
            ReorgOutcome::Invalidated { from_block: 101 }
        );
        // New canonical hash is in place; old descendants are gone
        assert_eq!(t.classify(&event(101, hash(0x22))), BlockClass::Provisional);
        // 102's old record was invalidated, so its replay records fresh
        assert_eq!(t.classify(&event(102, hash(0x33))), BlockClass::Provisional);
        // 100 is untouched
        assert_eq!(t.classify(&event(100, hash(1))), BlockClass::Provisional);
    }

    #[test]
    fn chains_are_isolated() {
        let mut t = tracker(12);
        t.observe_head(1, 120, hash(0xee));
        let mut e = event(100, hash(1));
        e.host_chain_id = 2; // no head known on chain 2
        assert_eq!(t.classify(&e), BlockClass::Provisional);
    }
}
