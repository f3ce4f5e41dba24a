// Thin executable wiring: construct a single-shard, single-partition
// `RuntimeContext` and bind an RPC listener. CLI argument parsing and
// YAML/file config loading are out of scope (spec.md §1 Non-goals); a
// real deployment constructs `ClusterConfig` from whatever external
// loader it has and calls into this same `mako::RuntimeContext::new`.

use mako::RuntimeContext;
use mako_net::{ClusterConfig, PartitionId, RpcServer, ShardId};
use std::sync::Arc;

const LISTEN_ADDR: &str = "127.0.0.1:7878";

#[tokio::main]
async fn main() -> mako_base::Result<()> {
    let config = Arc::new(ClusterConfig::single_shard(1, false));
    let context = RuntimeContext::new(config, ShardId(0), PartitionId(0));

    let server = RpcServer::new(context);
    let addr = LISTEN_ADDR.parse().expect("listen address is a valid socket address");
    tracing::info!(target: "mako", %addr, "starting mako node");
    server.bind(addr).await
}
