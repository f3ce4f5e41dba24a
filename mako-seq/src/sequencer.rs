// Deterministic Sequencer/Worker (§4.8). A shard-0/partition-0 leader
// (the "sequencer") assigns monotone slots to multi-partition
// transactions and broadcasts pre-stamped pieces to the owning
// partitions; every partition executes pieces addressed to it in slot
// order (D1-D3), the sequencer aggregates outputs and signals the
// waiting caller.
//
// Grounded on `original_source/src/deptran/deterministic/scheduler.cc`
// (`SchedulerDeterministic::Dispatch`/`ExecuteNext`/`Next`): the
// sequencer-vs-worker branch there (`slot_id == 0` picks the Paxos
// submit path, non-zero means "already assigned, just execute") is kept
// as the `is_replicated` branch documented in DESIGN NOTES.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use mako_base::{err_kind, Kind, Result};
use mako_net::{
    decode_payload, encode_payload, BroadcastDispatchRequest, DispatchResponse, PartitionId,
    PieceOutput, RpcClient, RpcId, ServerId, TxPieceData,
};

/// Executes the pieces addressed to this process's partition. Kept
/// generic over payload shape: the handler owns whatever local
/// transaction machinery (e.g. `mako-txn::Coordinator`) actually applies
/// the piece.
pub trait PieceHandler: Send + Sync + 'static {
    fn execute(&self, piece: &TxPieceData) -> Result<Vec<u8>>;
}

/// Submits a slot's payload to the replication layer. Decoupled from
/// `mako-txn`'s Paxos callbacks on purpose (§2 lists the sequencer as
/// its own component): the binary wires `Sequencer::on_slot_decided`
/// to fire once this submission is eventually decided.
pub trait ConsensusSubmit: Send + Sync {
    fn submit(&self, slot: u64, payload: Vec<u8>) -> Result<()>;
}

const DISPATCH_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Sequencer<H: PieceHandler> {
    local_partition: PartitionId,
    is_sequencer: bool,
    is_replicated: bool,
    handler: Arc<H>,
    consensus: Arc<dyn ConsensusSubmit>,
    remotes: BTreeMap<PartitionId, Arc<RpcClient>>,

    pending_txns: Mutex<BTreeMap<u64, Vec<TxPieceData>>>,
    local_outputs: Mutex<HashMap<u64, Vec<PieceOutput>>>,
    slot_to_cmd: Mutex<HashMap<u64, u64>>,
    pending_requests: Mutex<HashMap<u64, oneshot::Sender<Vec<PieceOutput>>>>,

    next_slot_to_assign: AtomicU64,
    next_slot_to_execute: AtomicU64,
}

impl<H: PieceHandler> Sequencer<H> {
    pub fn new(
        local_partition: PartitionId,
        is_sequencer: bool,
        is_replicated: bool,
        handler: Arc<H>,
        consensus: Arc<dyn ConsensusSubmit>,
        remotes: BTreeMap<PartitionId, Arc<RpcClient>>,
    ) -> Arc<Self> {
        Arc::new(Sequencer {
            local_partition,
            is_sequencer,
            is_replicated,
            handler,
            consensus,
            remotes,
            pending_txns: Mutex::new(BTreeMap::new()),
            local_outputs: Mutex::new(HashMap::new()),
            slot_to_cmd: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            next_slot_to_assign: AtomicU64::new(0),
            next_slot_to_execute: AtomicU64::new(1),
        })
    }

    /// Entry point for a coordinator constructing a multi-partition
    /// transaction (§4.8 steps 1-2): assign a slot, stamp every piece,
    /// and either submit to consensus (replicated) or execute directly
    /// (single-node fast path — DESIGN NOTES: this ALWAYS goes through
    /// consensus when `is_replicated`, regardless of partition count).
    pub async fn dispatch(self: &Arc<Self>, cmd_id: u64, mut pieces: Vec<TxPieceData>) -> Result<Vec<PieceOutput>> {
        let slot = self.next_slot_to_assign.fetch_add(1, Ordering::AcqRel) + 1;
        for piece in &mut pieces {
            piece.timestamp_ = slot;
        }

        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().await.insert(cmd_id, tx);
        self.slot_to_cmd.lock().await.insert(slot, cmd_id);
        self.pending_txns.lock().await.insert(slot, pieces.clone());

        if self.is_replicated {
            let payload = rmp_serde::to_vec(&pieces).map_err(mako_base::Error::from)?;
            self.consensus.submit(slot, payload)?;
            // Completion arrives asynchronously through `on_slot_decided`
            // once the leader callback surfaces this slot.
        } else {
            self.execute_next().await?;
        }

        rx.await
            .map_err(|_| err_kind(Kind::Timeout, "dispatch aggregation channel dropped"))
    }

    /// Invoked by the Paxos leader callback once `slot` is decided
    /// (§4.8 step 3 "re-enters pending_txns_ and triggers ExecuteNext").
    pub async fn on_slot_decided(self: &Arc<Self>, slot: u64, pieces: Vec<TxPieceData>) -> Result<()> {
        self.pending_txns.lock().await.entry(slot).or_insert(pieces);
        self.execute_next().await
    }

    /// A remote partition receiving `Dispatch`/`BroadcastDispatch` with
    /// an already-assigned slot (§4.8 step 5): install, execute, and
    /// return this partition's own outputs once done.
    pub async fn execute_local_pieces(self: &Arc<Self>, slot: u64, pieces: Vec<TxPieceData>) -> Result<Vec<PieceOutput>> {
        self.pending_txns.lock().await.entry(slot).or_insert(pieces);
        self.execute_next().await?;
        Ok(self.local_outputs.lock().await.remove(&slot).unwrap_or_default())
    }

    /// D1: `next_slot_to_execute_` only ever moves forward. D2/D3:
    /// every replica executes the same slot in the same order, and a
    /// piece only ever runs on its owning partition.
    async fn execute_next(self: &Arc<Self>) -> Result<()> {
        loop {
            let next = self.next_slot_to_execute.load(Ordering::Acquire);
            let pieces = {
                let map = self.pending_txns.lock().await;
                map.get(&next).cloned()
            };
            let Some(pieces) = pieces else { break };

            let mut outputs = Vec::new();
            for piece in pieces.iter().filter(|p| p.partition_id == self.local_partition) {
                let out = self.handler.execute(piece)?;
                outputs.push(PieceOutput {
                    inner_id: piece.inner_id,
                    output: out,
                });
            }
            self.local_outputs.lock().await.insert(next, outputs.clone());

            if self.is_sequencer {
                let mut all = outputs;
                if pieces.iter().any(|p| p.partition_id != self.local_partition) {
                    match self.broadcast_dispatch(next, &pieces).await {
                        Ok(remote) => all.extend(remote),
                        Err(e) => {
                            warn!(target: "mako::seq", slot = next, error = ?e, "broadcast dispatch failed");
                            return Err(e);
                        }
                    }
                }
                if let Some(cmd_id) = self.slot_to_cmd.lock().await.remove(&next) {
                    if let Some(tx) = self.pending_requests.lock().await.remove(&cmd_id) {
                        let _ = tx.send(all);
                    }
                }
            }

            self.pending_txns.lock().await.remove(&next);
            let advanced = self.next_slot_to_execute.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(target: "mako::seq", slot = next, next_slot = advanced, "slot executed");
        }
        Ok(())
    }

    async fn broadcast_dispatch(&self, slot: u64, pieces: &[TxPieceData]) -> Result<Vec<PieceOutput>> {
        let mut by_partition: BTreeMap<PartitionId, Vec<TxPieceData>> = BTreeMap::new();
        for piece in pieces {
            if piece.partition_id != self.local_partition {
                by_partition.entry(piece.partition_id).or_default().push(piece.clone());
            }
        }
        let mut aggregated = Vec::new();
        for (partition, group) in by_partition {
            let Some(client) = self.remotes.get(&partition) else {
                return Err(err_kind(Kind::NotConnected, "no client for remote partition"));
            };
            let req = BroadcastDispatchRequest {
                cmd_id: 0,
                slot,
                pieces: group,
            };
            let body = encode_payload(ServerId(partition.0), &req)?;
            let resp = client.call(RpcId::BroadcastDispatch, body, DISPATCH_TIMEOUT).await?;
            if resp.error_code != 0 {
                return Err(err_kind(Kind::Conflict, "remote partition dispatch failed"));
            }
            let (_, payload): (ServerId, DispatchResponse) = decode_payload(&resp.body)?;
            aggregated.extend(payload.outputs);
        }
        Ok(aggregated)
    }
}

/// Used where no replication is configured (`is_replicated == false`):
/// the single-node fast path never actually calls `submit`, but a
/// concrete `ConsensusSubmit` is still required to construct a
/// `Sequencer`.
pub struct NullConsensus;

impl ConsensusSubmit for NullConsensus {
    fn submit(&self, _slot: u64, _payload: Vec<u8>) -> Result<()> {
        Err(err_kind(Kind::Protocol, "consensus submit called with no backing Paxos stream"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct EchoHandler;
    impl PieceHandler for EchoHandler {
        fn execute(&self, piece: &TxPieceData) -> Result<Vec<u8>> {
            Ok(piece.payload.clone())
        }
    }

    #[tokio::test]
    async fn single_partition_fast_path_executes_immediately() {
        let seq = Sequencer::new(
            PartitionId(0),
            true,
            false,
            Arc::new(EchoHandler),
            Arc::new(NullConsensus),
            BTreeMap::new(),
        );
        let pieces = vec![TxPieceData {
            inner_id: 1,
            partition_id: PartitionId(0),
            timestamp_: 0,
            payload: b"hello".to_vec(),
        }];
        let outputs = seq.dispatch(1, pieces).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].output, b"hello");
    }

    #[tokio::test]
    async fn slots_execute_in_monotone_order() {
        let seq = Sequencer::new(
            PartitionId(0),
            true,
            false,
            Arc::new(EchoHandler),
            Arc::new(NullConsensus),
            BTreeMap::new(),
        );
        for i in 0..5u64 {
            let pieces = vec![TxPieceData {
                inner_id: i,
                partition_id: PartitionId(0),
                timestamp_: 0,
                payload: i.to_le_bytes().to_vec(),
            }];
            seq.dispatch(i, pieces).await.unwrap();
        }
        assert_eq!(seq.next_slot_to_execute.load(Ordering::Acquire), 6);
    }

    /// D1/D2: a worker that receives slots out of order still only
    /// executes them in slot order, and a later slot only runs once
    /// every earlier one has (3-partition dispatch scenario, §8 S4).
    #[tokio::test]
    async fn out_of_order_arrival_still_executes_in_slot_order() {
        let seq = Sequencer::new(
            PartitionId(1),
            false,
            false,
            Arc::new(EchoHandler),
            Arc::new(NullConsensus),
            BTreeMap::new(),
        );

        let piece = |slot: u64| {
            vec![TxPieceData {
                inner_id: slot,
                partition_id: PartitionId(1),
                timestamp_: slot,
                payload: slot.to_le_bytes().to_vec(),
            }]
        };

        seq.next_slot_to_execute.store(101, Ordering::Release);

        // Slot 103 arrives first: nothing can run yet, 101 is missing.
        let out = seq.execute_local_pieces(103, piece(103)).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(seq.next_slot_to_execute.load(Ordering::Acquire), 101);

        // Slot 102 arrives next: still blocked on 101.
        let out = seq.execute_local_pieces(102, piece(102)).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(seq.next_slot_to_execute.load(Ordering::Acquire), 101);

        // Slot 101 finally arrives: 101, 102, 103 all run in that order.
        let out = seq.execute_local_pieces(101, piece(101)).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].output, 101u64.to_le_bytes().to_vec());
        assert_eq!(seq.next_slot_to_execute.load(Ordering::Acquire), 104);
    }
}
