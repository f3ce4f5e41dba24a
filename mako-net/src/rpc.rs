// Typed request/response payloads for the shard RPC surface (§4.5).
// These are what `target_server_id ++ rmp_serde(payload)` actually
// encodes as a request frame's body, and what a response frame's body
// decodes to once its `ResponseHeader` prefix is known.

use serde::{Deserialize, Serialize};

use crate::ids::{PartitionId, ShardId};
use crate::wire::{ResponseHeader, Status};

pub type TableId = u32;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRequest {
    pub table_id: TableId,
    pub key: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub value: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRequest {
    pub table_id: TableId,
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
    pub reverse: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanResponse {
    pub header: ResponseHeader,
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchLockEntry {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub new_value: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchLockRequest {
    pub tid: u64,
    pub entries: Vec<BatchLockEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchLockResponse {
    pub header: ResponseHeader,
}

/// Remote participants keep the write-set a `BatchLock` locked, keyed by
/// `tid`, so `Validate`/`Install`/`SerializeUtil`/`Unlock` only need to
/// carry the transaction id, not repeat the whole write set each trip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub tid: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub header: ResponseHeader,
    pub watermark: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTimestampRequest;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetTimestampResponse {
    pub header: ResponseHeader,
    pub ts: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallRequest {
    pub tid: u64,
    pub ts_encoded: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallResponse {
    pub header: ResponseHeader,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializeUtilRequest {
    pub tid: u64,
    pub ts_encoded: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializeUtilResponse {
    pub header: ResponseHeader,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub tid: u64,
    pub committed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnlockResponse {
    pub header: ResponseHeader,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbortRequest {
    pub tid: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbortResponse {
    pub header: ResponseHeader,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeWatermarkRequest {
    pub from_shard: ShardId,
    pub watermark: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeWatermarkResponse {
    pub header: ResponseHeader,
    pub watermark: u32,
    pub shard_idx: ShardId,
}

/// Control codes for the epoch/failover protocol (§4.9). `0` starts a
/// failover round, `1` resumes workers, `2` signals per-partition FVW
/// readiness. Values `>= 4` trigger the "include self" broadcast rule
/// documented as a deliberate special case in §9.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlRequest {
    pub code: u32,
    pub value: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub header: ResponseHeader,
    pub value_out: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WarmupRequest {
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WarmupResponse {
    pub header: ResponseHeader,
    pub value_out: Vec<u8>,
}

/// A unit of deterministic work addressed to one partition within a
/// multi-partition transaction (§4.8, §GLOSSARY "Piece"). `timestamp_` is
/// the sequencer-assigned slot, zero until assigned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxPieceData {
    pub inner_id: u64,
    pub partition_id: PartitionId,
    pub timestamp_: u64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub cmd_id: u64,
    pub pieces: Vec<TxPieceData>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PieceOutput {
    pub inner_id: u64,
    pub output: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub header: ResponseHeader,
    pub outputs: Vec<PieceOutput>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastDispatchRequest {
    pub cmd_id: u64,
    pub slot: u64,
    pub pieces: Vec<TxPieceData>,
}

pub type BroadcastDispatchResponse = DispatchResponse;

pub fn response_header(status: Status, req_nr: u64, shard_index: ShardId) -> ResponseHeader {
    ResponseHeader {
        status,
        req_nr,
        shard_index,
    }
}
