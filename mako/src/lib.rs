// A server collects together all resources necessary to function as a
// replica of one shard: the ordered index, the transaction coordinator,
// the watermark subsystem, the epoch/failover controller, and the
// deterministic sequencer, behind one `RpcHandler` that answers every
// request type named in §4.5/§6.
//
// A server may support one or more clients, or it may be configured
// strictly as an unloaded replica for redundancy. Constructing a
// `RuntimeContext` from a `ClusterConfig` loaded elsewhere (CLI/YAML
// loading is out of scope, see spec.md §1 Non-goals) and handing it to
// `RpcServer::bind` is the whole of this crate's job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use mako_base::{err_kind, Kind, Result};
use mako_kv::{
    decode_ts_epoch, encode_ts_epoch, OrderedIndexShard, ShardTxn, ShardedIndexFacade, TxnId,
    WriteSetEntry,
};
use mako_net::{
    decode_payload, encode_payload, response_header, AbortRequest, AbortResponse,
    BatchLockRequest, BatchLockResponse, BroadcastDispatchRequest, ClusterConfig, ControlRequest,
    ControlResponse, DispatchRequest, DispatchResponse, ExchangeWatermarkRequest, GetRequest,
    GetResponse, GetTimestampRequest, GetTimestampResponse, InstallRequest, InstallResponse,
    PartitionId, PieceOutput, RpcHandler, RpcId, ScanRequest, ScanResponse, SerializeUtilRequest,
    SerializeUtilResponse, ServerId, ShardId, Status, TxPieceData, UnlockRequest, UnlockResponse,
    ValidateRequest, ValidateResponse, WarmupRequest, WarmupResponse,
};
use mako_seq::{ConsensusSubmit, PieceHandler, Sequencer};
use mako_txn::{handle_exchange_watermark, Coordinator, EpochController, WatermarkState};

/// The operation a deterministic piece's payload decodes to (§4.8). The
/// sequencer itself is agnostic to piece contents; this is the encoding
/// this binary's pieces actually use.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PieceOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Applies a decided piece directly against the local shard, bypassing
/// OCC lock/validate: deterministic execution is the point of §4.8 (every
/// replica applies the same piece at the same slot without a commit
/// protocol of its own).
struct FacadePieceHandler {
    facade: Arc<ShardedIndexFacade>,
    watermark: Arc<WatermarkState>,
}

impl PieceHandler for FacadePieceHandler {
    fn execute(&self, piece: &TxPieceData) -> Result<Vec<u8>> {
        let op: PieceOp = rmp_serde::from_slice(&piece.payload)?;
        let shard = self.facade.local_shard_handle();
        let mut txn = ShardTxn::new();
        match op {
            PieceOp::Put { key, value } => shard.put(&mut txn, &key, value),
            PieceOp::Delete { key } => shard.remove(&mut txn, &key),
        }
        let ts_encoded = encode_ts_epoch(piece.timestamp_ as u32, 0);
        shard.shard_install(&txn, ts_encoded)?;
        self.watermark.set_local_ts(piece.partition_id.0, piece.timestamp_ as u32);
        Ok(Vec::new())
    }
}

/// A `ConsensusSubmit` this single-node binary uses when
/// `ClusterConfig::is_replicated` is false: the sequencer never calls
/// it (DESIGN NOTES resolution 2), so its only job is to exist.
struct StandaloneConsensus;

impl ConsensusSubmit for StandaloneConsensus {
    fn submit(&self, _slot: u64, _payload: Vec<u8>) -> Result<()> {
        Err(err_kind(Kind::Protocol, "this node is not configured as replicated"))
    }
}

/// Everything one process needs to answer every RPC named in §4.5/§6 for
/// one shard/partition. Replaces the source's config/watermark/replication
/// singletons (§9 "Global mutable state") with one `Arc`-held struct handed
/// explicitly to whatever binds the listener.
pub struct RuntimeContext {
    pub config: Arc<ClusterConfig>,
    pub local_shard: ShardId,
    pub local_partition: PartitionId,
    pub facade: Arc<ShardedIndexFacade>,
    pub coordinator: Arc<Coordinator>,
    pub watermark: Arc<WatermarkState>,
    pub epoch_controller: Arc<EpochController>,
    pub sequencer: Arc<Sequencer<FacadePieceHandler>>,
    /// Write sets a remote `BatchLock` has locked on this shard's behalf,
    /// keyed by `tid`, so a later `Validate`/`Install`/`Unlock`/`Abort`
    /// RPC only needs to carry the transaction id.
    remote_txns: StdMutex<HashMap<TxnId, ShardTxn>>,
}

impl RuntimeContext {
    pub fn new(config: Arc<ClusterConfig>, local_shard: ShardId, local_partition: PartitionId) -> Self {
        let facade = Arc::new(ShardedIndexFacade::new(local_shard, config.n_shards));
        let coordinator = Arc::new(Coordinator::new(
            config.clone(),
            local_shard,
            facade.clone(),
            std::collections::BTreeMap::new(),
        ));
        let watermark = WatermarkState::new(config.n_partitions_per_shard);
        let epoch_controller = EpochController::new(config.n_partitions_per_shard);
        let handler = Arc::new(FacadePieceHandler {
            facade: facade.clone(),
            watermark: watermark.clone(),
        });
        let sequencer = Sequencer::new(
            local_partition,
            true,
            config.is_replicated,
            handler,
            Arc::new(StandaloneConsensus),
            std::collections::BTreeMap::new(),
        );

        RuntimeContext {
            config,
            local_shard,
            local_partition,
            facade,
            coordinator,
            watermark,
            epoch_controller,
            sequencer,
            remote_txns: StdMutex::new(HashMap::new()),
        }
    }

    fn local_shard_handle(&self) -> &OrderedIndexShard {
        self.facade.local_shard_handle()
    }

    fn take_remote_txn(&self, tid: TxnId) -> Result<ShardTxn> {
        self.remote_txns
            .lock()
            .unwrap()
            .remove(&tid)
            .ok_or_else(|| err_kind(Kind::Protocol, "unknown remote transaction id"))
    }

    fn peek_remote_txn(&self, tid: TxnId) -> Result<ShardTxn> {
        self.remote_txns
            .lock()
            .unwrap()
            .get(&tid)
            .cloned()
            .ok_or_else(|| err_kind(Kind::Protocol, "unknown remote transaction id"))
    }
}

impl RpcHandler for RuntimeContext {
    fn handle(&self, rpc_id: RpcId, target: ServerId, body: &[u8]) -> Result<(Status, Vec<u8>)> {
        match rpc_id {
            RpcId::Get => {
                let (_, req): (ServerId, GetRequest) = decode_payload(body)?;
                let mut txn = ShardTxn::new();
                let value = self.local_shard_handle().get(&mut txn, &req.key)?;
                let resp = GetResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                    value,
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::Scan => {
                let (_, req): (ServerId, ScanRequest) = decode_payload(body)?;
                let mut txn = ShardTxn::new();
                let mut rows = Vec::new();
                self.local_shard_handle().scan(
                    &mut txn,
                    &req.start,
                    req.end.as_deref(),
                    req.reverse,
                    |k, v| {
                        rows.push((k.to_vec(), v.to_vec()));
                        true
                    },
                )?;
                let resp = ScanResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                    rows,
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::BatchLock => {
                let (_, req): (ServerId, BatchLockRequest) = decode_payload(body)?;
                let mut txn = ShardTxn::default();
                txn.write_set = req
                    .entries
                    .into_iter()
                    .map(|e| WriteSetEntry {
                        key: e.key,
                        new_value: e.new_value,
                        is_insert: false,
                        is_delete: false,
                    })
                    .collect();
                let result = self.local_shard_handle().shard_try_lock_last_writeset(req.tid, &txn);
                self.remote_txns.lock().unwrap().insert(req.tid, txn);
                result?;
                let resp = BatchLockResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::Validate => {
                let (_, req): (ServerId, ValidateRequest) = decode_payload(body)?;
                let txn = self.peek_remote_txn(req.tid)?;
                let watermark = self.local_shard_handle().shard_validate(&txn)?;
                let resp = ValidateResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                    watermark,
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::GetTimestamp => {
                let (_, _req): (ServerId, GetTimestampRequest) = decode_payload(body)?;
                let resp = GetTimestampResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                    ts: self.watermark.global_watermark(),
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::Install => {
                let (_, req): (ServerId, InstallRequest) = decode_payload(body)?;
                let txn = self.peek_remote_txn(req.tid)?;
                self.local_shard_handle().shard_install(&txn, req.ts_encoded)?;
                let (ts, _epoch) = decode_ts_epoch(req.ts_encoded);
                self.watermark.set_local_ts(self.local_partition.0, ts);
                let resp = InstallResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::SerializeUtil => {
                let (_, req): (ServerId, SerializeUtilRequest) = decode_payload(body)?;
                self.local_shard_handle().shard_serialize_util(req.ts_encoded)?;
                let resp = SerializeUtilResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::Unlock => {
                let (_, req): (ServerId, UnlockRequest) = decode_payload(body)?;
                if let Ok(txn) = self.take_remote_txn(req.tid) {
                    self.local_shard_handle().shard_unlock(req.tid, &txn, req.committed);
                }
                let resp = UnlockResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::Abort => {
                let (_, req): (ServerId, AbortRequest) = decode_payload(body)?;
                self.local_shard_handle().shard_abort_txn(req.tid);
                self.remote_txns.lock().unwrap().remove(&req.tid);
                let resp = AbortResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::ExchangeWatermark => {
                let (_, req): (ServerId, ExchangeWatermarkRequest) = decode_payload(body)?;
                let resp = handle_exchange_watermark(&self.watermark, self.local_shard, &req)?;
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::Control => {
                let (_, req): (ServerId, ControlRequest) = decode_payload(body)?;
                let value_out = self.handle_control(req.code, req.value);
                let resp = ControlResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                    value_out,
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::Warmup => {
                let (_, req): (ServerId, WarmupRequest) = decode_payload(body)?;
                let resp = WarmupResponse {
                    header: response_header(Status::Success, 0, self.local_shard),
                    value_out: req.value,
                };
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::Dispatch => {
                let (_, req): (ServerId, DispatchRequest) = decode_payload(body)?;
                let outputs = self.block_on_sequencer(self.sequencer.dispatch(req.cmd_id, req.pieces))?;
                let resp = dispatch_response(self.local_shard, outputs);
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
            RpcId::BroadcastDispatch => {
                let (_, req): (ServerId, BroadcastDispatchRequest) = decode_payload(body)?;
                let outputs =
                    self.block_on_sequencer(self.sequencer.execute_local_pieces(req.slot, req.pieces))?;
                let resp = dispatch_response(self.local_shard, outputs);
                Ok((Status::Success, encode_payload(target, &resp)?))
            }
        }
    }
}

fn dispatch_response(shard: ShardId, outputs: Vec<PieceOutput>) -> DispatchResponse {
    DispatchResponse {
        header: response_header(Status::Success, 0, shard),
        outputs,
    }
}

impl RuntimeContext {
    /// `RpcHandler::handle` is synchronous (§ handler runs on a
    /// helper-queue worker thread, not the reactor), but the sequencer's
    /// bookkeeping uses `tokio::sync::Mutex`. Bridge the two the way
    /// `tokio`'s own docs recommend for a worker thread that occasionally
    /// needs to drive an async call to completion.
    fn block_on_sequencer<F: std::future::Future<Output = Result<Vec<PieceOutput>>>>(
        &self,
        fut: F,
    ) -> Result<Vec<PieceOutput>> {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
    }

    /// `remoteControl` (§9 "ambiguous behavior preserved verbatim"):
    /// code 0 begins failover (`value` is the failed shard index), code 1
    /// resumes, code 2 computes this shard's final-value-watermark for
    /// `value` (the epoch that just ended), code 3 reports whether the
    /// no-ops barrier for `value` (the epoch) has been observed by every
    /// local partition. Codes `>=4` carry the same meaning as `code - 4`;
    /// the "include self" distinction they mark is the caller's
    /// responsibility (who gets broadcast to), not this handler's.
    fn handle_control(&self, code: u32, value: u64) -> u64 {
        match code % 4 {
            0 => self.epoch_controller.begin_failover(&self.watermark, value as u16) as u64,
            1 => {
                self.epoch_controller.resume_after_failover(&self.watermark);
                0
            }
            2 => self.epoch_controller.compute_fvw(&self.watermark, value as u8) as u64,
            3 => self.epoch_controller.barrier_complete(value as u8) as u64,
            _ => {
                warn!(target: "mako", code, "unrecognized control code");
                0
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn local_context() -> RuntimeContext {
        let config = Arc::new(ClusterConfig::single_shard(1, false));
        RuntimeContext::new(config, ShardId(0), PartitionId(0))
    }

    #[test]
    fn batch_lock_validate_install_round_trip() {
        let ctx = local_context();
        let req = BatchLockRequest {
            tid: 1,
            entries: vec![mako_net::BatchLockEntry {
                table_id: 0,
                key: b"k1".to_vec(),
                new_value: b"v1".to_vec(),
            }],
        };
        let body = encode_payload(ServerId(0), &req).unwrap();
        let (status, resp_body) = ctx.handle(RpcId::BatchLock, ServerId(0), &body).unwrap();
        assert_eq!(status, Status::Success);
        let (_, resp): (ServerId, BatchLockResponse) = decode_payload(&resp_body).unwrap();
        assert_eq!(resp.header.status, Status::Success);

        let body = encode_payload(ServerId(0), &ValidateRequest { tid: 1 }).unwrap();
        let (_, resp_body) = ctx.handle(RpcId::Validate, ServerId(0), &body).unwrap();
        let (_, resp): (ServerId, ValidateResponse) = decode_payload(&resp_body).unwrap();
        let commit_ts = encode_ts_epoch(resp.watermark + 1, 0);

        let body = encode_payload(
            ServerId(0),
            &InstallRequest {
                tid: 1,
                ts_encoded: commit_ts,
            },
        )
        .unwrap();
        ctx.handle(RpcId::Install, ServerId(0), &body).unwrap();

        let body = encode_payload(
            ServerId(0),
            &UnlockRequest {
                tid: 1,
                committed: true,
            },
        )
        .unwrap();
        ctx.handle(RpcId::Unlock, ServerId(0), &body).unwrap();

        let body = encode_payload(
            ServerId(0),
            &GetRequest {
                table_id: 0,
                key: b"k1".to_vec(),
            },
        )
        .unwrap();
        let (_, resp_body) = ctx.handle(RpcId::Get, ServerId(0), &body).unwrap();
        let (_, resp): (ServerId, GetResponse) = decode_payload(&resp_body).unwrap();
        assert_eq!(resp.value, Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn dispatch_rpc_applies_piece_through_sequencer() {
        let ctx = local_context();
        let payload = rmp_serde::to_vec(&PieceOp::Put {
            key: b"seq-key".to_vec(),
            value: b"seq-value".to_vec(),
        })
        .unwrap();
        let req = DispatchRequest {
            cmd_id: 1,
            pieces: vec![TxPieceData {
                inner_id: 1,
                partition_id: PartitionId(0),
                timestamp_: 0,
                payload,
            }],
        };
        let body = encode_payload(ServerId(0), &req).unwrap();
        let (status, resp_body) = ctx.handle(RpcId::Dispatch, ServerId(0), &body).unwrap();
        assert_eq!(status, Status::Success);
        let (_, resp): (ServerId, DispatchResponse) = decode_payload(&resp_body).unwrap();
        assert_eq!(resp.outputs.len(), 1);

        let mut txn = ShardTxn::new();
        let value = ctx.local_shard_handle().get(&mut txn, b"seq-key").unwrap();
        assert_eq!(value, Some(b"seq-value".to_vec()));
    }

    #[test]
    fn control_begin_and_resume_failover_round_trips() {
        let ctx = local_context();
        let body = encode_payload(ServerId(0), &ControlRequest { code: 0, value: 7 }).unwrap();
        let (_, resp_body) = ctx.handle(RpcId::Control, ServerId(0), &body).unwrap();
        let (_, resp): (ServerId, ControlResponse) = decode_payload(&resp_body).unwrap();
        assert_eq!(resp.value_out, 1);

        let body = encode_payload(ServerId(0), &ControlRequest { code: 1, value: 0 }).unwrap();
        ctx.handle(RpcId::Control, ServerId(0), &body).unwrap();
        assert_eq!(ctx.epoch_controller.epoch(), 1);
    }
}
