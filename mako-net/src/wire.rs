// Wire framing (§6): each request/response is
//   packet_size:i32 (little-endian) ++ xid:varint ++ rpc_id:i32 ++ body
// `packet_size` excludes itself. `xid` is a client-assigned 64-bit
// sparse-int. Each response prefixes `xid` and an `error_code:varint`.
//
// Bytes 0..1 of every request payload are `target_server_id:u16` in
// native byte order, used by the server to route to a helper queue.
//
// Every non-trivial reply starts with `status:u32, req_nr:u64,
// shard_index:u16` so fan-out broadcasts can aggregate results.

use serde::{Deserialize, Serialize};

use mako_base::{err_kind, Kind, Result};

use crate::ids::{ServerId, ShardId};

/// Tags the `rpc_id` field of a request frame. Numeric values are part of
/// the wire format and must not be renumbered once a peer depends on them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RpcId {
    Get = 1,
    Scan = 2,
    BatchLock = 3,
    Validate = 4,
    GetTimestamp = 5,
    Install = 6,
    SerializeUtil = 7,
    Unlock = 8,
    Abort = 9,
    ExchangeWatermark = 10,
    Control = 11,
    Warmup = 12,
    Dispatch = 13,
    BroadcastDispatch = 14,
}

impl RpcId {
    pub fn from_i32(v: i32) -> Option<RpcId> {
        use RpcId::*;
        Some(match v {
            1 => Get,
            2 => Scan,
            3 => BatchLock,
            4 => Validate,
            5 => GetTimestamp,
            6 => Install,
            7 => SerializeUtil,
            8 => Unlock,
            9 => Abort,
            10 => ExchangeWatermark,
            11 => Control,
            12 => Warmup,
            13 => Dispatch,
            14 => BroadcastDispatch,
            _ => return None,
        })
    }

    pub fn to_i32(self) -> i32 {
        self as i32
    }
}

/// Status codes carried in every response's `status:u32` prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Status {
    Success = 0,
    Conflict = 1,
    Timeout = 2,
    NotConnected = 3,
    SafetyFail = 4,
    Config = 5,
    Protocol = 6,
    Busy = 7,
}

impl Status {
    /// Maps a wire status back to the [`mako_base::Kind`] taxonomy so a
    /// caller can `?`-propagate with the right branch already attached.
    pub fn into_result(self, req_nr: u64) -> Result<()> {
        match self {
            Status::Success => Ok(()),
            Status::Conflict => Err(err_kind(Kind::Conflict, format!("req {req_nr}: conflict"))),
            Status::Timeout => Err(err_kind(Kind::Timeout, format!("req {req_nr}: timeout"))),
            Status::NotConnected => Err(err_kind(
                Kind::NotConnected,
                format!("req {req_nr}: not connected"),
            )),
            Status::SafetyFail => Err(err_kind(
                Kind::SafetyFail,
                format!("req {req_nr}: safety check failed"),
            )),
            Status::Config => Err(err_kind(Kind::Config, format!("req {req_nr}: bad config"))),
            Status::Protocol => Err(err_kind(
                Kind::Protocol,
                format!("req {req_nr}: protocol error"),
            )),
            Status::Busy => Err(err_kind(Kind::Timeout, format!("req {req_nr}: busy"))),
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Status> {
        use Status::*;
        Some(match v {
            0 => Success,
            1 => Conflict,
            2 => Timeout,
            3 => NotConnected,
            4 => SafetyFail,
            5 => Config,
            6 => Protocol,
            7 => Busy,
            _ => return None,
        })
    }
}

/// Every request's first two bytes (§6 "Target-server dispatch").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub target_server_id: ServerId,
}

/// Every non-trivial response's common prefix (§6 "Responses").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub status: Status,
    pub req_nr: u64,
    pub shard_index: ShardId,
}

/// A decoded request frame: `xid`, `rpc_id`, and the opaque body bytes
/// that follow. Bodies are rmp-serde-encoded request payloads defined in
/// `mako-net::rpc`; decoding the body to a typed payload is the caller's
/// job once it knows the `rpc_id`.
#[derive(Clone, Debug)]
pub struct RequestFrame {
    pub xid: u64,
    pub rpc_id: RpcId,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ResponseFrame {
    pub xid: u64,
    pub error_code: u32,
    pub body: Vec<u8>,
}

pub fn encode_payload<T: Serialize>(target: ServerId, payload: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&target.0.to_ne_bytes());
    rmp_serde::encode::write(&mut buf, payload)?;
    Ok(buf)
}

/// Peek the `target_server_id` prefix off a request body without
/// decoding the rest (§6 "Target-server dispatch"), used by the server's
/// helper-queue router before it knows which payload type to expect.
pub fn wire_target_server_id(body: &[u8]) -> Option<ServerId> {
    if body.len() < 2 {
        return None;
    }
    Some(ServerId(u16::from_ne_bytes([body[0], body[1]])))
}

pub fn decode_payload<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<(ServerId, T)> {
    if body.len() < 2 {
        return Err(err_kind(Kind::Protocol, "request body shorter than target_server_id"));
    }
    let target = ServerId(u16::from_ne_bytes([body[0], body[1]]));
    let payload: T = rmp_serde::from_slice(&body[2..])?;
    Ok((target, payload))
}
