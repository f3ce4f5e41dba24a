// Ordered Index Shard (§4.2): a single-table single-shard optimistic
// container. Reads are lock-free chain walks against `RecordArena`;
// writes stage into a per-transaction write set and only take a row
// latch at commit time (`shard_try_lock_last_writeset`).
//
// The source protects per-row state with spinlocks held only across the
// bookkeeping, never across a suspension point (§5). Here the shard's
// `locks` map plays that role directly: holding the shard `Mutex` is the
// "spinlock", and an entry in `locks` is the per-row latch. No lock is
// ever held across an RPC.

use std::collections::BTreeMap;
use std::sync::Mutex;

use mako_base::{err_kind, Kind, Result};
use tracing::{debug, trace};

use crate::value::{decode_ts_epoch, RecordArena};

pub type TxnId = u64;

#[derive(Clone, Debug)]
pub struct ReadSetEntry {
    pub key: Vec<u8>,
    pub version_ts: u32,
}

#[derive(Clone, Debug)]
pub struct WriteSetEntry {
    pub key: Vec<u8>,
    pub new_value: Vec<u8>,
    pub is_insert: bool,
    pub is_delete: bool,
}

/// Per-(transaction, shard) accumulated state (§3 "Transaction record" —
/// the shard-local slice of `read_set`/`write_set`/`max_read_ts`).
#[derive(Clone, Debug, Default)]
pub struct ShardTxn {
    pub read_set: Vec<ReadSetEntry>,
    pub write_set: Vec<WriteSetEntry>,
    pub max_read_ts: u32,
}

impl ShardTxn {
    pub fn new() -> Self {
        ShardTxn::default()
    }

    fn write_for(&mut self, key: &[u8]) -> Option<&mut WriteSetEntry> {
        self.write_set.iter_mut().find(|w| w.key == key)
    }
}

struct ShardState {
    heads: BTreeMap<Vec<u8>, u32>,
    arena: RecordArena,
    locks: BTreeMap<Vec<u8>, TxnId>,
    current_epoch: u8,
    global_watermark: u32,
    hist_watermark: BTreeMap<u8, u32>,
}

pub struct OrderedIndexShard {
    state: Mutex<ShardState>,
}

impl OrderedIndexShard {
    pub fn new() -> Self {
        OrderedIndexShard {
            state: Mutex::new(ShardState {
                heads: BTreeMap::new(),
                arena: RecordArena::new(),
                locks: BTreeMap::new(),
                current_epoch: 0,
                global_watermark: 0,
                hist_watermark: BTreeMap::new(),
            }),
        }
    }

    pub fn set_epoch(&self, epoch: u8) {
        self.state.lock().unwrap().current_epoch = epoch;
    }

    pub fn set_global_watermark(&self, w: u32) {
        self.state.lock().unwrap().global_watermark = w;
    }

    pub fn set_hist_watermark(&self, epoch: u8, w: u32) {
        self.state.lock().unwrap().hist_watermark.insert(epoch, w);
    }

    /// `get(key, &out_value, max_bytes) -> bool` (bool folded into the
    /// `Option` return): joins the read set with the version actually
    /// observed, so commit-time validation can detect a concurrent
    /// overwrite.
    pub fn get(&self, txn: &mut ShardTxn, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // A value this transaction itself staged for write but hasn't
        // committed yet is not separately versioned here; callers read
        // their own writes via the write set, not through the shard.
        if let Some(w) = txn.write_for(key) {
            return Ok(if w.is_delete {
                None
            } else {
                Some(w.new_value.clone())
            });
        }
        let state = self.state.lock().unwrap();
        let head = *state.heads.get(key).unwrap_or(&0);
        let found = state.arena.get(head, state.current_epoch, &state.hist_watermark)?;
        match found {
            Some((payload, ts)) => {
                txn.read_set.push(ReadSetEntry {
                    key: key.to_vec(),
                    version_ts: ts,
                });
                txn.max_read_ts = txn.max_read_ts.max(ts);
                Ok(Some(payload))
            }
            None => {
                txn.read_set.push(ReadSetEntry {
                    key: key.to_vec(),
                    version_ts: 0,
                });
                Ok(None)
            }
        }
    }

    pub fn put(&self, txn: &mut ShardTxn, key: &[u8], value: Vec<u8>) {
        self.stage(txn, key, value, false, false);
    }

    pub fn insert(&self, txn: &mut ShardTxn, key: &[u8], value: Vec<u8>) {
        self.stage(txn, key, value, true, false);
    }

    pub fn remove(&self, txn: &mut ShardTxn, key: &[u8]) {
        self.stage(txn, key, Vec::new(), false, true);
    }

    /// `put_mbta`: same staging as `put`, but the commit-time install
    /// compares the old value with `cmp` first and aborts on mismatch.
    pub fn put_mbta(
        &self,
        txn: &mut ShardTxn,
        key: &[u8],
        value: Vec<u8>,
        cmp: impl Fn(Option<&[u8]>) -> bool,
    ) -> Result<()> {
        let current = self.get(txn, key)?;
        if !cmp(current.as_deref()) {
            return Err(err_kind(Kind::Conflict, "put_mbta predicate mismatch"));
        }
        self.put(txn, key, value);
        Ok(())
    }

    fn stage(&self, txn: &mut ShardTxn, key: &[u8], value: Vec<u8>, is_insert: bool, is_delete: bool) {
        if let Some(existing) = txn.write_for(key) {
            existing.new_value = value;
            existing.is_insert = is_insert;
            existing.is_delete = is_delete;
            return;
        }
        txn.write_set.push(WriteSetEntry {
            key: key.to_vec(),
            new_value: value,
            is_insert,
            is_delete,
        });
    }

    /// `scan`/`rscan`: joins every visited key into the read set (§4.2).
    pub fn scan(
        &self,
        txn: &mut ShardTxn,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
        mut callback: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<Vec<u8>> = state
            .heads
            .range(start.to_vec()..)
            .take_while(|(k, _)| end.map_or(true, |e| k.as_slice() < e))
            .map(|(k, _)| k.clone())
            .collect();
        if reverse {
            keys.reverse();
        }
        for key in keys {
            let head = *state.heads.get(&key).unwrap_or(&0);
            if let Some((payload, ts)) = state.arena.get(head, state.current_epoch, &state.hist_watermark)? {
                txn.read_set.push(ReadSetEntry {
                    key: key.clone(),
                    version_ts: ts,
                });
                txn.max_read_ts = txn.max_read_ts.max(ts);
                if !callback(&key, &payload) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Acquire row latches in key-ascending order (caller is responsible
    /// for shard-ascending ordering across shards, §4.4). Rolls back its
    /// own partial acquisitions on failure so a failed lock attempt never
    /// leaks latches.
    pub fn shard_try_lock_last_writeset(&self, txn_id: TxnId, txn: &ShardTxn) -> Result<()> {
        let mut keys: Vec<&[u8]> = txn.write_set.iter().map(|w| w.key.as_slice()).collect();
        keys.sort_unstable();
        keys.dedup();
        let mut state = self.state.lock().unwrap();
        let mut acquired = Vec::new();
        for key in &keys {
            match state.locks.get(*key) {
                Some(holder) if *holder != txn_id => {
                    for k in acquired {
                        state.locks.remove(k);
                    }
                    debug!(target: "mako::kv", ?txn_id, "lock conflict");
                    return Err(err_kind(Kind::Conflict, "row already locked"));
                }
                _ => {
                    state.locks.insert(key.to_vec(), txn_id);
                    acquired.push(*key);
                }
            }
        }
        Ok(())
    }

    /// `shard_validate() -> watermark_or_error`: every read-set entry's
    /// observed version must still be current; returns the shard's
    /// present watermark snapshot for the coordinator to max-reduce.
    pub fn shard_validate(&self, txn: &ShardTxn) -> Result<u32> {
        let state = self.state.lock().unwrap();
        for entry in &txn.read_set {
            let head = *state.heads.get(&entry.key).unwrap_or(&0);
            let current_ts = state
                .arena
                .get(head, state.current_epoch, &state.hist_watermark)?
                .map(|(_, ts)| ts)
                .unwrap_or(0);
            if current_ts != entry.version_ts {
                return Err(err_kind(Kind::Conflict, "read set version changed"));
            }
        }
        Ok(state.global_watermark)
    }

    /// `shard_install(ts)`: materialize every staged write at `ts`,
    /// advancing the local watermark to at least `ts`.
    pub fn shard_install(&self, txn: &ShardTxn, ts_encoded: u32) -> Result<()> {
        let (ts, epoch) = decode_ts_epoch(ts_encoded);
        let mut state = self.state.lock().unwrap();
        for w in &txn.write_set {
            let head = *state.heads.get(&w.key).unwrap_or(&0);
            let new_head = state.arena.install(
                w.is_insert || head == 0,
                w.is_delete,
                w.new_value.clone(),
                epoch,
                ts,
                head,
            )?;
            state.heads.insert(w.key.clone(), new_head);
            state.arena.maybe_reclaim(new_head, state.global_watermark);
        }
        if ts_encoded > state.global_watermark {
            state.global_watermark = ts_encoded;
        }
        trace!(target: "mako::kv", ts, epoch, "shard install complete");
        Ok(())
    }

    /// Durability hook (§4.2, §9 "Persisted state (optional)"); the WAL
    /// writer this would call into is out of scope, so this only marks
    /// the serialize point for callers that log it.
    pub fn shard_serialize_util(&self, ts_encoded: u32) -> Result<()> {
        trace!(target: "mako::kv", ts_encoded, "serialize_util");
        Ok(())
    }

    pub fn shard_unlock(&self, txn_id: TxnId, txn: &ShardTxn, _committed: bool) {
        let mut state = self.state.lock().unwrap();
        for w in &txn.write_set {
            if state.locks.get(&w.key) == Some(&txn_id) {
                state.locks.remove(&w.key);
            }
        }
    }

    pub fn shard_abort_txn(&self, txn_id: TxnId) {
        let mut state = self.state.lock().unwrap();
        state.locks.retain(|_, holder| *holder != txn_id);
    }
}

impl Default for OrderedIndexShard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn commit(shard: &OrderedIndexShard, txn_id: TxnId, txn: &ShardTxn, ts: u32) {
        shard.shard_try_lock_last_writeset(txn_id, txn).unwrap();
        shard.shard_validate(txn).unwrap();
        shard.shard_install(txn, ts).unwrap();
        shard.shard_unlock(txn_id, txn, true);
    }

    #[test]
    fn put_then_get_round_trips() {
        let shard = OrderedIndexShard::new();
        let mut txn = ShardTxn::new();
        shard.put(&mut txn, b"k1", b"v1".to_vec());
        commit(&shard, 1, &txn, 10);

        let mut reader = ShardTxn::new();
        let v = shard.get(&mut reader, b"k1").unwrap();
        assert_eq!(v, Some(b"v1".to_vec()));
    }

    #[test]
    fn insert_then_remove_reports_absent() {
        let shard = OrderedIndexShard::new();
        let mut txn = ShardTxn::new();
        shard.insert(&mut txn, b"k1", b"v1".to_vec());
        commit(&shard, 1, &txn, 10);

        let mut txn2 = ShardTxn::new();
        shard.remove(&mut txn2, b"k1");
        commit(&shard, 2, &txn2, 20);

        let mut reader = ShardTxn::new();
        assert_eq!(shard.get(&mut reader, b"k1").unwrap(), None);
    }

    #[test]
    fn concurrent_writers_to_same_key_conflict() {
        let shard = OrderedIndexShard::new();
        let mut txn_a = ShardTxn::new();
        shard.put(&mut txn_a, b"shared", b"a".to_vec());
        let mut txn_b = ShardTxn::new();
        shard.put(&mut txn_b, b"shared", b"b".to_vec());

        shard.shard_try_lock_last_writeset(1, &txn_a).unwrap();
        let err = shard.shard_try_lock_last_writeset(2, &txn_b);
        assert!(err.is_err());
        shard.shard_unlock(1, &txn_a, true);
        shard.shard_try_lock_last_writeset(2, &txn_b).unwrap();
    }

    #[test]
    fn validate_fails_when_read_version_changed() {
        let shard = OrderedIndexShard::new();
        let mut setup = ShardTxn::new();
        shard.put(&mut setup, b"k1", b"v1".to_vec());
        commit(&shard, 1, &setup, 10);

        let mut reader = ShardTxn::new();
        shard.get(&mut reader, b"k1").unwrap();

        let mut writer = ShardTxn::new();
        shard.put(&mut writer, b"k1", b"v2".to_vec());
        commit(&shard, 2, &writer, 20);

        assert!(shard.shard_validate(&reader).is_err());
    }

    #[test]
    fn zero_length_scan_range_is_empty() {
        let shard = OrderedIndexShard::new();
        let mut txn = ShardTxn::new();
        shard.put(&mut txn, b"k1", b"v1".to_vec());
        commit(&shard, 1, &txn, 10);

        let mut reader = ShardTxn::new();
        let mut seen = 0;
        shard
            .scan(&mut reader, b"k1", Some(b"k1"), false, |_, _| {
                seen += 1;
                true
            })
            .unwrap();
        assert_eq!(seen, 0);
    }
}
