mod client;
mod codec;
mod config;
mod ids;
mod node;
mod rpc;
mod server;
mod time;
mod wire;

pub use client::RpcClient;
pub use codec::{RequestCodec, ResponseCodec};
pub use config::{ClusterConfig, ReplicaAddress, ShardTopology, WalMetadata};
pub use ids::{ClusterRole, PartitionId, ServerId, SessionId, ShardId};
pub use node::{IOQueues, Msg, Node, RecvMsg, SpecificMsg};
pub use rpc::{
    response_header, AbortRequest, AbortResponse, BatchLockEntry, BatchLockRequest,
    BatchLockResponse, BroadcastDispatchRequest, BroadcastDispatchResponse, ControlRequest,
    ControlResponse, DispatchRequest, DispatchResponse, ExchangeWatermarkRequest,
    ExchangeWatermarkResponse, GetRequest, GetResponse, GetTimestampRequest, GetTimestampResponse,
    InstallRequest, InstallResponse, PieceOutput, ScanRequest, ScanResponse,
    SerializeUtilRequest, SerializeUtilResponse, TableId, TxPieceData, UnlockRequest,
    UnlockResponse, ValidateRequest, ValidateResponse, WarmupRequest, WarmupResponse,
};
pub use server::{RpcHandler, RpcServer};
pub use time::{Duration, NodeTime, RealmTime};
pub use wire::{
    decode_payload, encode_payload, wire_target_server_id, RequestFrame, RequestHeader,
    ResponseFrame, ResponseHeader, RpcId, Status,
};
