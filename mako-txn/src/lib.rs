#![allow(dead_code)]

// The transaction system implements a simplified variant of the
// OceanVista protocol (§4.4): optimistic concurrency control with
// read/write sets, cross-shard two-phase commit for validation and
// installation, a replicated watermark that gates snapshot visibility,
// and a single-decree Paxos reconfiguration round for failover.
//
// Module layout mirrors §2's component list: `context` is the
// Transaction Context and 2PC driver (§4.4), `watermark` is the
// Watermark Subsystem (§4.6), `paxos` is the Paxos leader/follower
// callbacks and Epoch/Failover Controller (§4.7, §4.9), `reconfig` is
// the model-checked core of the reconfiguration vote itself.

mod context;
mod paxos;
#[cfg(test)]
mod reconfig;
mod watermark;

pub use context::{Coordinator, TransactionContext, TxnState};
pub use paxos::{
    no_ops_marker, parse_log_entry, CallbackStatus, CommitInfo, EpochController, FollowerCallback,
    LeaderCallback, LogEntry, ReplayExecutor,
};
pub use watermark::{
    handle_exchange_watermark, safe, spawn_advancer, spawn_exchange_client, WatermarkState,
    ADVANCER_PERIOD, EXCHANGE_PERIOD,
};
