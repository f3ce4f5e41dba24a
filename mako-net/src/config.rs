// Typed configuration values the engine consumes. Loading these from a
// YAML file or CLI flags is out of scope (see spec.md §1 Non-goals); the
// struct a loader would populate is not.
//
// Grounded on the original's `mako/lib/configuration.h` (`Configuration`,
// `ShardAddress`, `SiteInfo`).

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::ids::{ClusterRole, ServerId, ShardId};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReplicaAddress {
    pub server: ServerId,
    pub role: ClusterRole,
    pub addr: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShardTopology {
    pub shard: ShardId,
    pub replicas: Vec<ReplicaAddress>,
}

/// The whole-cluster configuration every component is handed at start-up
/// (replaces the source's config/watermark/replication singletons, §9).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub n_shards: u16,
    pub n_partitions_per_shard: u16,
    pub warehouses: u16,
    pub is_replicated: bool,
    pub shards: Vec<ShardTopology>,
}

impl ClusterConfig {
    pub fn single_shard(n_partitions: u16, is_replicated: bool) -> Self {
        ClusterConfig {
            n_shards: 1,
            n_partitions_per_shard: n_partitions,
            warehouses: 1,
            is_replicated,
            shards: Vec::new(),
        }
    }

    pub fn topology_for(&self, shard: ShardId) -> Option<&ShardTopology> {
        self.shards.iter().find(|t| t.shard == shard)
    }
}

/// Metadata record for a per-partition WAL (§6 "Persisted state (optional)").
/// The disk adapter that writes this is out of scope; the typed record is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WalMetadata {
    pub epoch: u8,
    pub shard_id: ShardId,
    pub num_shards: u16,
    pub num_partitions: u16,
    pub num_workers: u16,
    pub timestamp: u32,
}

impl WalMetadata {
    pub fn new(
        epoch: u8,
        shard_id: ShardId,
        num_shards: u16,
        num_partitions: u16,
        num_workers: u16,
        timestamp: u32,
    ) -> Self {
        WalMetadata {
            epoch,
            shard_id,
            num_shards,
            num_partitions,
            num_workers,
            timestamp,
        }
    }
}
