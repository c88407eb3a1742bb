//! Sharded reconciliation runtime.
//!
//! Spawns one worker task per shard, each owning a [`Coordinator`]. Events
//! are routed by tuple hash so all events of one delegation relationship
//! reach the same worker in order, while distinct tuples reconcile in
//! parallel. Head observations and reorg notifications are broadcast to
//! every worker; supersession is idempotent, so the replicated trackers
//! converge safely.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::alert::AlertBus;
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::ledger::Ledger;
use crate::normalize::{normalize, RawLogRecord};
use crate::types::{BlockHash, DelegationEvent, TupleKey};

/// Messages accepted by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Inbound {
    /// A raw delegation log record, as delivered by the chain client.
    Record(RawLogRecord),
    /// An already-normalized event (replays, tests).
    Event(DelegationEvent),
    /// Chain head observation.
    Head {
        host_chain_id: u64,
        block_number: u64,
        block_hash: BlockHash,
    },
    /// Reorg notification carrying the new canonical hash.
    Reorg {
        host_chain_id: u64,
        block_number: u64,
        new_hash: BlockHash,
    },
}

/// Pool sizing and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker shards. Distinct tuples spread across these.
    pub workers: usize,
    /// Per-worker inbound queue depth.
    pub queue_capacity: usize,
    /// How often each worker sweeps its pending buffer for TTL expiry.
    pub sweep_interval_ms: u64,
    pub coordinator: CoordinatorConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            sweep_interval_ms: 30_000,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

/// Handle to a running pool of reconciliation workers.
pub struct ReconcilerPool {
    senders: Vec<mpsc::Sender<Inbound>>,
    handles: Vec<JoinHandle<()>>,
    alerts: AlertBus,
}

impl ReconcilerPool {
    /// Spawn the worker tasks. The ledger is shared between workers — wrap
    /// the backend in an `Arc` (the `Ledger` impl passes through).
    pub fn spawn<L>(ledger: L, config: PoolConfig) -> Self
    where
        L: Ledger + Clone + 'static,
    {
        let workers = config.workers.max(1);
        let alerts = AlertBus::default();
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            let coordinator = Coordinator::with_alerts(
                ledger.clone(),
                config.coordinator.clone(),
                alerts.clone(),
            );
            let sweep_interval = Duration::from_millis(config.sweep_interval_ms.max(1));
            handles.push(tokio::spawn(worker_loop(shard, coordinator, rx, sweep_interval)));
            senders.push(tx);
        }

        tracing::info!(workers, "reconciler pool started");
        Self {
            senders,
            handles,
            alerts,
        }
    }

    /// The shared alert bus. Subscribe before dispatching.
    pub fn alerts(&self) -> &AlertBus {
        &self.alerts
    }

    /// Route a message to the right worker(s). Records are normalized here
    /// so routing can key on the tuple; malformed records are dropped with
    /// a warning, exactly as the coordinator would.
    pub async fn dispatch(&self, message: Inbound) {
        match message {
            Inbound::Record(raw) => match normalize(&raw) {
                Ok(event) => self.send_to_tuple(event).await,
                Err(e) => {
                    tracing::warn!(
                        host_chain_id = raw.host_chain_id,
                        block_number = raw.block_number,
                        error = %e,
                        "dropping malformed log record"
                    );
                }
            },
            Inbound::Event(event) => self.send_to_tuple(event).await,
            broadcast @ (Inbound::Head { .. } | Inbound::Reorg { .. }) => {
                for tx in &self.senders {
                    let _ = tx.send(broadcast.clone()).await;
                }
            }
        }
    }

    /// Drive the pool from any inbound stream until it ends.
    pub async fn run_stream<S>(&self, stream: S)
    where
        S: Stream<Item = Inbound>,
    {
        futures::pin_mut!(stream);
        while let Some(message) = stream.next().await {
            self.dispatch(message).await;
        }
    }

    /// Close the queues and wait for every worker to finish its backlog.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("reconciler pool stopped");
    }

    async fn send_to_tuple(&self, event: DelegationEvent) {
        let shard = shard_for(&event.tuple(), self.senders.len());
        let _ = self.senders[shard].send(Inbound::Event(event)).await;
    }
}

fn shard_for(tuple: &TupleKey, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    tuple.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn worker_loop<L: Ledger>(
    shard: usize,
    mut coordinator: Coordinator<L>,
    mut rx: mpsc::Receiver<Inbound>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = sweep.tick() => coordinator.sweep_pending(),
            message = rx.recv() => match message {
                Some(Inbound::Event(event)) => {
                    coordinator.process(event).await;
                }
                Some(Inbound::Record(raw)) => {
                    coordinator.ingest(&raw).await;
                }
                Some(Inbound::Head { host_chain_id, block_number, block_hash }) => {
                    coordinator.observe_head(host_chain_id, block_number, block_hash).await;
                }
                Some(Inbound::Reorg { host_chain_id, block_number, new_hash }) => {
                    coordinator.handle_reorg(host_chain_id, block_number, new_hash).await;
                }
                None => break,
            }
        }
    }
    let metrics = coordinator.metrics();
    tracing::debug!(
        shard,
        accepted = metrics.accepted,
        parked = metrics.parked,
        "worker stopped"
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn tuple(seed: u8) -> TupleKey {
        TupleKey {
            delegator: Address::new([seed; 20]),
            delegate: Address::new([seed.wrapping_add(1); 20]),
            contract_address: Address::new([seed.wrapping_add(2); 20]),
        }
    }

    #[test]
    fn routing_is_stable_and_in_range() {
        for seed in 0..32u8 {
            let t = tuple(seed);
            let shard = shard_for(&t, 4);
            assert!(shard < 4);
            assert_eq!(shard, shard_for(&t, 4));
        }
    }

    #[test]
    fn single_shard_takes_everything() {
        for seed in 0..8u8 {
            assert_eq!(shard_for(&tuple(seed), 1), 0);
        }
    }
}
