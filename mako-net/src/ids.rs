use serde::{Deserialize, Serialize};

/// Identifies one shard (a partition of the keyspace, owned by one leader
/// and its replicas). Routing (`hash(key) mod n_shards`) always produces
/// one of these.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u16);

/// Identifies a worker slice within a shard; hosts one Paxos stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u16);

/// The `target_server_id` carried in bytes 0..1 of every request payload
/// (§6). The server uses this to route to one of `n_shards * warehouses`
/// helper queues per process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u16);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ClusterRole {
    Leader,
    Follower,
}

/// A session is `(cluster_role, shard_idx, server_id)` (§6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub role: ClusterRole,
    pub shard: ShardId,
    pub server: ServerId,
}
