// RPC client side of the shard transport (§4.5, §5, §7). Every call
// carries a timeout; a timed-out call is retried once within the
// remaining budget and thereafter surfaced as `Kind::Timeout`, per §7
// "Transport-level errors are first retried once within the same RPC if
// the timeout budget allows; thereafter they are treated as TIMEOUT."

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{tcp::OwnedWriteHalf, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use mako_base::{err_kind, Kind, Result};

use crate::codec::{RequestCodec, ResponseCodec};
use crate::wire::{RequestFrame, ResponseFrame, RpcId};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseFrame>>>>;

pub struct RpcClient {
    writer: Mutex<FramedWrite<OwnedWriteHalf, RequestCodec>>,
    pending: Pending,
    next_xid: AtomicU64,
}

impl RpcClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Arc<RpcClient>> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Result<Arc<RpcClient>> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let client = Arc::new(RpcClient {
            writer: Mutex::new(FramedWrite::new(write_half, RequestCodec)),
            pending: pending.clone(),
            next_xid: AtomicU64::new(1),
        });

        tokio::spawn(Self::recv_loop(
            FramedRead::new(read_half, ResponseCodec),
            pending,
        ));
        Ok(client)
    }

    async fn recv_loop(
        mut reader: FramedRead<tokio::net::tcp::OwnedReadHalf, ResponseCodec>,
        pending: Pending,
    ) {
        loop {
            match reader.next().await {
                Some(Ok(frame)) => {
                    let sender = pending.lock().await.remove(&frame.xid);
                    if let Some(sender) = sender {
                        let _ = sender.send(frame);
                    } else {
                        warn!(target: "mako::net", xid = frame.xid, "response for unknown xid");
                    }
                }
                Some(Err(e)) => {
                    debug!(target: "mako::net", error = ?e, "client recv loop error, closing");
                    break;
                }
                None => break,
            }
        }
    }

    fn alloc_xid(&self) -> u64 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// `body` already carries the `target_server_id` prefix (see
    /// `wire::encode_payload`); the RPC layer itself only needs the
    /// `rpc_id` to pick a decoder on the far side.
    async fn send_once(
        &self,
        rpc_id: RpcId,
        body: Vec<u8>,
        timeout: std::time::Duration,
    ) -> Result<ResponseFrame> {
        let xid = self.alloc_xid();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(xid, tx);

        {
            let mut w = self.writer.lock().await;
            w.send(RequestFrame { xid, rpc_id, body }).await?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&xid);
                Err(err_kind(Kind::NotConnected, "response channel dropped"))
            }
            Err(_) => {
                self.pending.lock().await.remove(&xid);
                Err(err_kind(Kind::Timeout, format!("rpc {xid} timed out")))
            }
        }
    }

    /// Send a request, retrying once within `timeout` if the first
    /// attempt times out (§7 propagation policy).
    pub async fn call(
        &self,
        rpc_id: RpcId,
        body: Vec<u8>,
        timeout: std::time::Duration,
    ) -> Result<ResponseFrame> {
        match self.send_once(rpc_id, body.clone(), timeout).await {
            Ok(frame) => Ok(frame),
            Err(e) if e.is_kind(Kind::Timeout) => {
                debug!(target: "mako::net", "retrying rpc {:?} after timeout", rpc_id);
                self.send_once(rpc_id, body, timeout).await
            }
            Err(e) => Err(e),
        }
    }
}
