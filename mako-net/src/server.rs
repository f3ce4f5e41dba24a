// RPC server side of the shard transport (§4.5, §6). The dispatch rule:
// read `target_server_id` from the request body, locate the matching
// helper queue, enqueue a request handle; a worker dequeues, invokes the
// handler, and pushes the response back for the reactor to send. Helper
// queues get a bounded high-watermark so a swamped shard answers `BUSY`
// instead of growing without bound (§9 "Backpressure").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use mako_base::Result;

use crate::codec::{RequestCodec, ResponseCodec};
use crate::ids::ServerId;
use crate::wire::{wire_target_server_id, RequestFrame, ResponseFrame, RpcId, Status};

/// Implemented by the component that actually knows how to answer a
/// request for one `ServerId` (an ordered-index shard, a sequencer, ...).
/// Handlers run on the helper-queue worker task, not on the reactor, so
/// they are free to do real (blocking) work per §5's "mixed" scheduling
/// model.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, rpc_id: RpcId, target: ServerId, body: &[u8]) -> Result<(Status, Vec<u8>)>;
}

struct Job {
    xid: u64,
    rpc_id: RpcId,
    body: Vec<u8>,
    reply: mpsc::UnboundedSender<ResponseFrame>,
}

const HELPER_QUEUE_DEPTH: usize = 256;

pub struct RpcServer<H: RpcHandler> {
    handler: Arc<H>,
    queues: Mutex<HashMap<ServerId, mpsc::Sender<Job>>>,
}

impl<H: RpcHandler> RpcServer<H> {
    pub fn new(handler: H) -> Arc<RpcServer<H>> {
        Arc::new(RpcServer {
            handler: Arc::new(handler),
            queues: Mutex::new(HashMap::new()),
        })
    }

    pub async fn bind(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(target: "mako::net", %addr, "rpc server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.serve_connection(stream).await {
                    debug!(target: "mako::net", ?peer, error = ?e, "connection closed");
                }
            });
        }
    }

    async fn helper_queue(&self, target: ServerId) -> mpsc::Sender<Job> {
        let mut queues = self.queues.lock().await;
        if let Some(tx) = queues.get(&target) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(HELPER_QUEUE_DEPTH);
        queues.insert(target, tx.clone());
        tokio::spawn(Self::worker_loop(self.handler.clone(), target, rx));
        tx
    }

    async fn worker_loop(handler: Arc<H>, target: ServerId, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            let (status, body) = match handler.handle(job.rpc_id, target, &job.body) {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(target: "mako::net", error = ?e, "handler error");
                    (Status::Protocol, Vec::new())
                }
            };
            let frame = ResponseFrame {
                xid: job.xid,
                error_code: status.to_u32(),
                body,
            };
            let _ = job.reply.send(frame);
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, RequestCodec);
        let mut writer = FramedWrite::new(write_half, ResponseCodec);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ResponseFrame>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = reply_rx.recv().await {
                if writer.send(frame).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = reader.next().await {
            let frame: RequestFrame = frame?;
            self.dispatch(frame, reply_tx.clone()).await;
        }

        drop(reply_tx);
        let _ = writer_task.await;
        Ok(())
    }

    async fn dispatch(&self, frame: RequestFrame, reply: mpsc::UnboundedSender<ResponseFrame>) {
        let target = match wire_target_server_id(&frame.body) {
            Some(t) => t,
            None => {
                let _ = reply.send(ResponseFrame {
                    xid: frame.xid,
                    error_code: Status::Protocol.to_u32(),
                    body: Vec::new(),
                });
                return;
            }
        };
        let queue = self.helper_queue(target).await;
        let job = Job {
            xid: frame.xid,
            rpc_id: frame.rpc_id,
            body: frame.body,
            reply: reply.clone(),
        };
        if queue.try_send(job).is_err() {
            let _ = reply.send(ResponseFrame {
                xid: frame.xid,
                error_code: Status::Busy.to_u32(),
                body: Vec::new(),
            });
        }
    }
}
