// Paxos Leader/Follower Callbacks and the Epoch/Failover Controller
// (§4.7, §4.9). Each partition registers one leader and one follower
// callback, invoked on every decided slot; this module is the
// previously-unimplemented counterpart to the teacher's `mod paxos;`
// declaration (`submerge-txn/src/lib.rs` declared the module but never
// shipped a file for it).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tracing::{debug, error, info};

use mako_base::{err_kind, Kind, Result};

use crate::watermark::{safe, WatermarkState};

const COMMIT_INFO_LEN: usize = 8; // timestamp:u32 ++ latency_tracker:u32
const NO_OPS_PREFIX: &str = "no-ops:";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommitInfo {
    pub timestamp: u32,
    pub latency_tracker: u32,
}

impl CommitInfo {
    pub fn parse(payload: &[u8]) -> Result<(Vec<u8>, CommitInfo)> {
        if payload.len() < COMMIT_INFO_LEN {
            return Err(err_kind(Kind::Protocol, "payload shorter than CommitInfo trailer"));
        }
        let split = payload.len() - COMMIT_INFO_LEN;
        let timestamp = u32::from_le_bytes(payload[split..split + 4].try_into().unwrap());
        let latency_tracker = u32::from_le_bytes(payload[split + 4..split + 8].try_into().unwrap());
        Ok((payload[..split].to_vec(), CommitInfo { timestamp, latency_tracker }))
    }

    pub fn append(&self, mut body: Vec<u8>) -> Vec<u8> {
        body.extend_from_slice(&self.timestamp.to_le_bytes());
        body.extend_from_slice(&self.latency_tracker.to_le_bytes());
        body
    }
}

/// Status values encoded into a leader callback's `timestamp*10 +
/// status` return value (§4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallbackStatus {
    Normal = 0,
    Noops = 1,
    Ending = 2,
    ReplayDone = 3,
    SafetyFail = 4,
    Init = 5,
}

/// One decided Paxos log entry, parsed per §6's sentinel rules: empty
/// (end of stream), `"no-ops:<epoch>"` (barrier), otherwise a normal
/// payload with a trailing `CommitInfo`.
#[derive(Clone, Debug)]
pub enum LogEntry {
    EndOfStream,
    NoOps { epoch: u8 },
    Normal { payload: Vec<u8>, commit_info: CommitInfo },
}

pub fn parse_log_entry(log: &[u8]) -> Result<LogEntry> {
    if log.is_empty() {
        return Ok(LogEntry::EndOfStream);
    }
    if let Ok(text) = std::str::from_utf8(log) {
        if let Some(epoch_str) = text.strip_prefix(NO_OPS_PREFIX) {
            let epoch: u8 = epoch_str
                .parse()
                .map_err(|_| err_kind(Kind::Protocol, "malformed no-ops epoch"))?;
            return Ok(LogEntry::NoOps { epoch });
        }
    }
    let (payload, commit_info) = CommitInfo::parse(log)?;
    Ok(LogEntry::Normal { payload, commit_info })
}

pub fn no_ops_marker(epoch: u8) -> Vec<u8> {
    format!("{NO_OPS_PREFIX}{epoch}").into_bytes()
}

/// Invoked on the leader for every decided slot of one partition.
pub struct LeaderCallback {
    partition: u16,
    watermark: Arc<WatermarkState>,
    end_received: StdMutex<bool>,
}

impl LeaderCallback {
    pub fn new(partition: u16, watermark: Arc<WatermarkState>) -> Self {
        LeaderCallback {
            partition,
            watermark,
            end_received: StdMutex::new(false),
        }
    }

    /// Returns `timestamp*10 + status`, matching the source's packed
    /// return convention so a caller that only wants the status can
    /// `% 10` it without an extra round-trip.
    pub fn on_decided(&self, log: &[u8], epoch_controller: &EpochController) -> Result<u64> {
        match parse_log_entry(log)? {
            LogEntry::EndOfStream => {
                self.watermark.set_local_ts(self.partition, u32::MAX);
                *self.end_received.lock().unwrap() = true;
                Ok(u32::MAX as u64 * 10 + CallbackStatus::Ending as u64)
            }
            LogEntry::NoOps { epoch } => {
                epoch_controller.on_partition_barrier(self.partition, epoch);
                Ok(CallbackStatus::Noops as u64)
            }
            LogEntry::Normal { commit_info, .. } => {
                self.watermark.set_local_ts(self.partition, commit_info.timestamp);
                Ok(commit_info.timestamp as u64 * 10 + CallbackStatus::Normal as u64)
            }
        }
    }
}

#[derive(Clone, Debug)]
struct PendingEntry {
    slot: u64,
    partition: u16,
    payload: Vec<u8>,
}

/// Invoked on each follower for every decided slot; replays committed
/// payloads deterministically once they clear the watermark, queuing
/// entries that arrive ahead of it.
pub struct FollowerCallback {
    partition: u16,
    watermark: Arc<WatermarkState>,
    pending: StdMutex<BTreeMap<u32, Vec<PendingEntry>>>,
}

pub trait ReplayExecutor: Send + Sync {
    /// Applies a committed payload against the **replay** store handle —
    /// deliberately separate from the client-serving path (§4.7) so
    /// disk recovery can rebuild state without going through RPC.
    fn replay(&self, partition: u16, payload: &[u8]) -> Result<()>;
}

impl FollowerCallback {
    pub fn new(partition: u16, watermark: Arc<WatermarkState>) -> Self {
        FollowerCallback {
            partition,
            watermark,
            pending: StdMutex::new(BTreeMap::new()),
        }
    }

    pub fn on_decided(
        &self,
        log: &[u8],
        slot: u64,
        executor: &dyn ReplayExecutor,
        epoch_controller: &EpochController,
    ) -> Result<()> {
        match parse_log_entry(log)? {
            LogEntry::EndOfStream => {
                self.watermark.set_local_ts(self.partition, u32::MAX);
            }
            LogEntry::NoOps { epoch } => {
                // A barrier discards every unsafe queued entry: they
                // belong to the epoch being killed.
                self.pending.lock().unwrap().clear();
                epoch_controller.on_partition_barrier(self.partition, epoch);
            }
            LogEntry::Normal { payload, commit_info } => {
                self.watermark.set_local_ts(self.partition, commit_info.timestamp);
                if safe(commit_info.timestamp, self.watermark.global_watermark()) {
                    executor.replay(self.partition, &payload)?;
                } else {
                    self.pending
                        .lock()
                        .unwrap()
                        .entry(commit_info.timestamp)
                        .or_default()
                        .push(PendingEntry {
                            slot,
                            partition: self.partition,
                            payload,
                        });
                    debug!(target: "mako::paxos", partition = self.partition, slot, "queued unsafe entry");
                }
            }
        }
        self.drain_pending(executor)
    }

    fn drain_pending(&self, executor: &dyn ReplayExecutor) -> Result<()> {
        let watermark = self.watermark.global_watermark();
        let mut pending = self.pending.lock().unwrap();
        loop {
            let Some((&ts, _)) = pending.iter().next() else {
                break;
            };
            if !safe(ts, watermark) {
                break;
            }
            let entries = pending.remove(&ts).unwrap();
            for entry in entries {
                executor.replay(entry.partition, &entry.payload)?;
            }
        }
        Ok(())
    }
}

/// Epoch and Failover Controller (§4.9). Tracks the global epoch and
/// drives the four documented failover phases; `noops_cnt` counts how
/// many of a shard's partitions have observed the current barrier.
pub struct EpochController {
    epoch: std::sync::atomic::AtomicU8,
    num_partitions: u16,
    noops_seen: StdMutex<BTreeMap<u8, u16>>,
    failed_shard_index: StdMutex<Option<u16>>,
}

impl EpochController {
    pub fn new(num_partitions: u16) -> Arc<Self> {
        Arc::new(EpochController {
            epoch: std::sync::atomic::AtomicU8::new(0),
            num_partitions,
            noops_seen: StdMutex::new(BTreeMap::new()),
            failed_shard_index: StdMutex::new(None),
        })
    }

    pub fn epoch(&self) -> u8 {
        self.epoch.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Phase 0: a learner (or the reactor noticing a dead peer) triggers
    /// failover. Caller is responsible for sending `Control(code=0)` to
    /// every other shard and for disabling the watermark exchange.
    pub fn begin_failover(&self, watermark: &WatermarkState, failed_shard: u16) -> u8 {
        watermark.exchange_running.store(false, std::sync::atomic::Ordering::Release);
        *self.failed_shard_index.lock().unwrap() = Some(failed_shard);
        let new_epoch = self.epoch.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1;
        info!(target: "mako::paxos", new_epoch, failed_shard, "failover: epoch advanced");
        new_epoch
    }

    /// Phase 2: a partition observes the no-ops barrier for `epoch`.
    /// Once every partition has, partition 0 is responsible for
    /// snapshotting the shard's final value watermark.
    fn on_partition_barrier(&self, _partition: u16, epoch: u8) {
        let mut seen = self.noops_seen.lock().unwrap();
        let count = seen.entry(epoch).or_insert(0);
        *count += 1;
        if *count > self.num_partitions {
            error!(target: "mako::paxos", epoch, "no-ops barrier observed more than once per partition");
        }
    }

    pub fn barrier_complete(&self, epoch: u8) -> bool {
        self.noops_seen
            .lock()
            .unwrap()
            .get(&epoch)
            .copied()
            .unwrap_or(0)
            >= self.num_partitions
    }

    /// Partition 0's Phase 2 action: compute and publish this shard's
    /// final value watermark for the just-ended epoch.
    pub fn compute_fvw(&self, watermark: &WatermarkState, ended_epoch: u8) -> u32 {
        let fvw = watermark.global_watermark();
        watermark.set_hist_watermark(ended_epoch, fvw / 10);
        fvw
    }

    /// Phase 3: the learner aggregates every shard's FVW, then resumes
    /// normal processing.
    pub fn resume_after_failover(&self, watermark: &WatermarkState) {
        watermark.exchange_running.store(true, std::sync::atomic::Ordering::Release);
        *self.failed_shard_index.lock().unwrap() = None;
        info!(target: "mako::paxos", epoch = self.epoch(), "failover resumed");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_no_ops_marker() {
        let log = no_ops_marker(3);
        match parse_log_entry(&log).unwrap() {
            LogEntry::NoOps { epoch } => assert_eq!(epoch, 3),
            other => panic!("expected NoOps, got {other:?}"),
        }
    }

    #[test]
    fn parses_end_of_stream() {
        assert!(matches!(parse_log_entry(&[]).unwrap(), LogEntry::EndOfStream));
    }

    #[test]
    fn parses_normal_entry_with_commit_info() {
        let info = CommitInfo { timestamp: 77, latency_tracker: 5 };
        let log = info.append(b"payload".to_vec());
        match parse_log_entry(&log).unwrap() {
            LogEntry::Normal { payload, commit_info } => {
                assert_eq!(payload, b"payload");
                assert_eq!(commit_info, info);
            }
            other => panic!("expected Normal, got {other:?}"),
        }
    }

    struct RecordingExecutor {
        seen: StdMutex<Vec<Vec<u8>>>,
    }

    impl ReplayExecutor for RecordingExecutor {
        fn replay(&self, _partition: u16, payload: &[u8]) -> Result<()> {
            self.seen.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    #[test]
    fn follower_queues_unsafe_entries_until_watermark_clears() {
        let watermark = WatermarkState::new(1);
        let epoch_ctl = EpochController::new(1);
        let follower = FollowerCallback::new(0, watermark.clone());
        let executor = RecordingExecutor { seen: StdMutex::new(Vec::new()) };

        let unsafe_entry = CommitInfo { timestamp: 50, latency_tracker: 0 }.append(b"late".to_vec());
        follower.on_decided(&unsafe_entry, 1, &executor, &epoch_ctl).unwrap();
        assert!(executor.seen.lock().unwrap().is_empty());

        watermark.set_local_ts(0, 100);
        watermark.set_disk_ts(0, 100);
        watermark.advance_once();

        let safe_entry = CommitInfo { timestamp: 60, latency_tracker: 0 }.append(b"trigger".to_vec());
        follower.on_decided(&safe_entry, 2, &executor, &epoch_ctl).unwrap();

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], b"late");
    }

    #[test]
    fn no_ops_barrier_discards_unsafe_queue() {
        let watermark = WatermarkState::new(1);
        let epoch_ctl = EpochController::new(1);
        let follower = FollowerCallback::new(0, watermark.clone());
        let executor = RecordingExecutor { seen: StdMutex::new(Vec::new()) };

        let unsafe_entry = CommitInfo { timestamp: 50, latency_tracker: 0 }.append(b"doomed".to_vec());
        follower.on_decided(&unsafe_entry, 1, &executor, &epoch_ctl).unwrap();

        follower.on_decided(&no_ops_marker(1), 2, &executor, &epoch_ctl).unwrap();
        assert!(executor.seen.lock().unwrap().is_empty());
        assert!(epoch_ctl.barrier_complete(1));
    }

    #[test]
    fn failover_disables_exchange_and_advances_epoch() {
        let watermark = WatermarkState::new(1);
        let ctl = EpochController::new(1);
        let new_epoch = ctl.begin_failover(&watermark, 2);
        assert_eq!(new_epoch, 1);
        assert!(!watermark.exchange_running.load(std::sync::atomic::Ordering::Acquire));
        ctl.resume_after_failover(&watermark);
        assert!(watermark.exchange_running.load(std::sync::atomic::Ordering::Acquire));
    }
}
