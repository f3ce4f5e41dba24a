// Transaction Context and two-phase commit (§4.4). A `TransactionContext`
// is the per-thread execution state for one transaction: a shard-local
// `ShardTxn` per touched shard, plus the cross-shard bitmasks the 2PC
// driver broadcasts against. `Bitmap256` (kept from the teacher's base
// crate) stands in for the source's `shard_bits_touched` bitmask,
// bounding participation to 256 shards — comfortably above any
// configuration this engine is sized for (§9 resolves the analogous
// partition-count ambiguity the same way: parameter-driven, not a raw
// fixed array).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::{debug, info, warn};

use mako_base::{err_kind, Kind, Result};
use mako_kv::{ShardTxn, ShardedIndexFacade};
use mako_net::{
    decode_payload, encode_payload, AbortRequest, BatchLockEntry, BatchLockRequest, ClusterConfig,
    InstallRequest, RpcClient, RpcId, SerializeUtilRequest, ServerId, ShardId, UnlockRequest,
    ValidateRequest, ValidateResponse,
};
use mako_base::Bitmap256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    Active,
    Preparing,
    Committed,
    Aborted,
}

fn shard_bit(shard: ShardId) -> u8 {
    debug_assert!(shard.0 < 256, "shard index must fit in a Bitmap256 slot");
    shard.0 as u8
}

/// Per-transaction execution state (§3 "Transaction record"). `shards`
/// carries one `ShardTxn` (read/write set) per shard touched so far.
pub struct TransactionContext {
    pub tid: u64,
    pub epoch: u8,
    pub state: TxnState,
    pub shards: BTreeMap<ShardId, ShardTxn>,
    pub max_read_ts: u32,
    pub readset_shard_bits: Bitmap256,
    pub writeset_shard_bits: Bitmap256,
    pub trans_nosend_abort_bits: Bitmap256,
}

impl TransactionContext {
    pub fn new(tid: u64, epoch: u8) -> Self {
        TransactionContext {
            tid,
            epoch,
            state: TxnState::Active,
            shards: BTreeMap::new(),
            max_read_ts: 0,
            readset_shard_bits: Bitmap256::new(),
            writeset_shard_bits: Bitmap256::new(),
            trans_nosend_abort_bits: Bitmap256::new(),
        }
    }

    fn shard_txn(&mut self, shard: ShardId) -> &mut ShardTxn {
        self.shards.entry(shard).or_default()
    }

    pub fn mark_read(&mut self, shard: ShardId) {
        self.readset_shard_bits.set(shard_bit(shard), true);
    }

    pub fn mark_write(&mut self, shard: ShardId) {
        self.writeset_shard_bits.set(shard_bit(shard), true);
    }

    /// A remote op came back with a non-SUCCESS status: record that the
    /// abort broadcast should skip this shard (it already knows).
    pub fn mark_nosend_abort(&mut self, shard: ShardId) {
        self.trans_nosend_abort_bits.set(shard_bit(shard), true);
    }
}

/// Owns the local shard plus one `RpcClient` per remote participant, and
/// drives the 2PC protocol described in §4.4. This is the coordinator
/// side; the `RpcHandler` each shard registers (see `mako-kv`-backed
/// dispatch in the `mako` binary) is the participant side.
pub struct Coordinator {
    pub config: Arc<ClusterConfig>,
    pub local_shard: ShardId,
    pub facade: Arc<ShardedIndexFacade>,
    pub remotes: BTreeMap<ShardId, Arc<RpcClient>>,
    pub rpc_timeout: StdDuration,
    next_tid: AtomicU64,
}

impl Coordinator {
    pub fn new(
        config: Arc<ClusterConfig>,
        local_shard: ShardId,
        facade: Arc<ShardedIndexFacade>,
        remotes: BTreeMap<ShardId, Arc<RpcClient>>,
    ) -> Self {
        Coordinator {
            config,
            local_shard,
            facade,
            remotes,
            rpc_timeout: StdDuration::from_millis(500),
            next_tid: AtomicU64::new(1),
        }
    }

    pub fn new_txn(&self, epoch: u8) -> TransactionContext {
        TransactionContext::new(self.next_tid.fetch_add(1, Ordering::Relaxed), epoch)
    }

    pub fn get(&self, txn: &mut TransactionContext, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let shard = self.facade.check_shard(key);
        txn.mark_read(shard);
        if shard == self.local_shard {
            self.facade.get_local(txn.shard_txn(shard), key)
        } else {
            // Remote get is a Get RPC through `self.remotes`; not needed
            // for the in-process single-shard test path and omitted here
            // to keep this coordinator focused on the 2PC commit driver.
            // `ShardedIndexFacade::check_shard` + `remotes` are already
            // wired for the 2PC broadcasts below.
            Err(err_kind(Kind::Protocol, "remote get not wired in this coordinator"))
        }
    }

    pub fn put(&self, txn: &mut TransactionContext, key: &[u8], value: Vec<u8>) {
        let shard = self.facade.check_shard(key);
        txn.mark_write(shard);
        self.facade.put_local(txn.shard_txn(shard), key, value);
    }

    /// Drive `ACTIVE -> PREPARING -> (COMMITTED|ABORTED)` per §4.4's
    /// P1–P7. Any step failing aborts from that point on.
    pub async fn commit_txn(&self, txn: &mut TransactionContext) -> Result<()> {
        txn.state = TxnState::Preparing;

        // P1: local lock.
        if let Some(local) = txn.shards.get(&self.local_shard) {
            if let Err(e) = self.facade.local_shard_handle().shard_try_lock_last_writeset(txn.tid, local) {
                debug!(target: "mako::txn", tid = txn.tid, "P1 local lock failed");
                self.abort_txn(txn).await;
                return Err(e);
            }
        }

        // P2: broadcast BatchLock (skipped per B2 if nothing to write remotely).
        if txn.writeset_shard_bits.any() {
            if let Err(e) = self.broadcast_batch_lock(txn).await {
                self.unlock_known(txn, false).await;
                self.abort_txn(txn).await;
                return Err(e);
            }
        }

        // P3: local validation.
        let mut max_watermark = 0u32;
        if let Some(local) = txn.shards.get(&self.local_shard) {
            match self.facade.local_shard_handle().shard_validate(local) {
                Ok(w) => max_watermark = max_watermark.max(w),
                Err(e) => {
                    self.unlock_known(txn, false).await;
                    self.abort_txn(txn).await;
                    return Err(e);
                }
            }
        }

        // P4: broadcast Validate, take max watermark across participants.
        if txn.writeset_shard_bits.any() {
            match self.broadcast_validate(txn).await {
                Ok(w) => max_watermark = max_watermark.max(w),
                Err(e) => {
                    self.unlock_known(txn, false).await;
                    self.abort_txn(txn).await;
                    return Err(e);
                }
            }
        }

        let commit_ts = mako_kv::encode_ts_epoch(max_watermark + 1, txn.epoch);

        // P5: Install.
        if let Some(local) = txn.shards.get(&self.local_shard) {
            if let Err(e) = self.facade.local_shard_handle().shard_install(local, commit_ts) {
                self.unlock_known(txn, false).await;
                self.abort_txn(txn).await;
                return Err(e);
            }
        }
        if txn.writeset_shard_bits.any() {
            if let Err(e) = self.broadcast_install(txn, commit_ts).await {
                self.unlock_known(txn, false).await;
                self.abort_txn(txn).await;
                return Err(e);
            }
        }

        // P6: SerializeUtil (durability hook, best-effort).
        if let Some(local) = txn.shards.get(&self.local_shard) {
            let _ = self.facade.local_shard_handle().shard_serialize_util(commit_ts);
            let _ = local;
        }
        if txn.writeset_shard_bits.any() {
            let _ = self.broadcast_serialize_util(txn, commit_ts).await;
        }

        // P7: Unlock(committed=true).
        self.unlock_known(txn, true).await;
        txn.state = TxnState::Committed;
        info!(target: "mako::txn", tid = txn.tid, commit_ts, "committed");
        Ok(())
    }

    /// ABORTED: broadcast `Abort` to `readset | writeset` minus
    /// `trans_nosend_abort_bits`.
    pub async fn abort_txn(&self, txn: &mut TransactionContext) {
        let mut target = txn.readset_shard_bits.clone();
        target.union(&txn.writeset_shard_bits);
        target.subtract(&txn.trans_nosend_abort_bits);

        for idx in target.iter() {
            let shard = ShardId(idx as u16);
            if shard == self.local_shard {
                self.facade.local_shard_handle().shard_abort_txn(txn.tid);
                continue;
            }
            if let Some(client) = self.remotes.get(&shard) {
                let body = match encode_payload(ServerId(shard.0), &AbortRequest { tid: txn.tid }) {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                if let Err(e) = client.call(RpcId::Abort, body, self.rpc_timeout).await {
                    warn!(target: "mako::txn", tid = txn.tid, ?shard, error = ?e, "abort rpc failed");
                }
            }
        }
        txn.state = TxnState::Aborted;
    }

    async fn unlock_known(&self, txn: &TransactionContext, committed: bool) {
        if let Some(local) = txn.shards.get(&self.local_shard) {
            self.facade.local_shard_handle().shard_unlock(txn.tid, local, committed);
        }
        for idx in txn.writeset_shard_bits.iter() {
            let shard = ShardId(idx as u16);
            if shard == self.local_shard {
                continue;
            }
            if let Some(client) = self.remotes.get(&shard) {
                let body = match encode_payload(ServerId(shard.0), &UnlockRequest { tid: txn.tid, committed }) {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                let _ = client.call(RpcId::Unlock, body, self.rpc_timeout).await;
            }
        }
    }

    async fn broadcast_batch_lock(&self, txn: &TransactionContext) -> Result<()> {
        for idx in txn.writeset_shard_bits.iter() {
            let shard = ShardId(idx as u16);
            if shard == self.local_shard {
                continue;
            }
            let Some(client) = self.remotes.get(&shard) else {
                return Err(err_kind(Kind::NotConnected, "no client for participant shard"));
            };
            let entries = txn
                .shards
                .get(&shard)
                .map(|s| {
                    s.write_set
                        .iter()
                        .map(|w| BatchLockEntry {
                            table_id: 0,
                            key: w.key.clone(),
                            new_value: w.new_value.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let body = encode_payload(ServerId(shard.0), &BatchLockRequest { tid: txn.tid, entries })?;
            let resp = client.call(RpcId::BatchLock, body, self.rpc_timeout).await?;
            if resp.error_code != 0 {
                return Err(err_kind(Kind::Conflict, "remote batch lock failed"));
            }
        }
        Ok(())
    }

    async fn broadcast_validate(&self, txn: &TransactionContext) -> Result<u32> {
        let mut max_watermark = 0u32;
        for idx in txn.writeset_shard_bits.iter() {
            let shard = ShardId(idx as u16);
            if shard == self.local_shard {
                continue;
            }
            let Some(client) = self.remotes.get(&shard) else {
                return Err(err_kind(Kind::NotConnected, "no client for participant shard"));
            };
            let body = encode_payload(ServerId(shard.0), &ValidateRequest { tid: txn.tid })?;
            let resp = client.call(RpcId::Validate, body, self.rpc_timeout).await?;
            if resp.error_code != 0 {
                return Err(err_kind(Kind::Conflict, "remote validate failed"));
            }
            let (_, payload): (ServerId, ValidateResponse) = decode_payload(&resp.body)?;
            max_watermark = max_watermark.max(payload.watermark);
        }
        Ok(max_watermark)
    }

    async fn broadcast_install(&self, txn: &TransactionContext, commit_ts: u32) -> Result<()> {
        for idx in txn.writeset_shard_bits.iter() {
            let shard = ShardId(idx as u16);
            if shard == self.local_shard {
                continue;
            }
            let Some(client) = self.remotes.get(&shard) else {
                return Err(err_kind(Kind::NotConnected, "no client for participant shard"));
            };
            let body = encode_payload(
                ServerId(shard.0),
                &InstallRequest {
                    tid: txn.tid,
                    ts_encoded: commit_ts,
                },
            )?;
            let resp = client.call(RpcId::Install, body, self.rpc_timeout).await?;
            if resp.error_code != 0 {
                return Err(err_kind(Kind::Conflict, "remote install failed"));
            }
        }
        Ok(())
    }

    async fn broadcast_serialize_util(&self, txn: &TransactionContext, commit_ts: u32) -> Result<()> {
        for idx in txn.writeset_shard_bits.iter() {
            let shard = ShardId(idx as u16);
            if shard == self.local_shard {
                continue;
            }
            if let Some(client) = self.remotes.get(&shard) {
                let body = encode_payload(
                    ServerId(shard.0),
                    &SerializeUtilRequest {
                        tid: txn.tid,
                        ts_encoded: commit_ts,
                    },
                )?;
                let _ = client.call(RpcId::SerializeUtil, body, self.rpc_timeout).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mako_net::ClusterConfig;

    fn single_shard_coordinator() -> Coordinator {
        let config = Arc::new(ClusterConfig::single_shard(1, false));
        let facade = Arc::new(ShardedIndexFacade::new(ShardId(0), 1));
        Coordinator::new(config, ShardId(0), facade, BTreeMap::new())
    }

    #[tokio::test]
    async fn single_shard_write_then_read() {
        let coord = single_shard_coordinator();
        let mut txn = coord.new_txn(0);
        coord.put(&mut txn, b"k1", b"v1".to_vec());
        coord.commit_txn(&mut txn).await.unwrap();
        assert_eq!(txn.state, TxnState::Committed);

        let mut reader = coord.new_txn(0);
        let v = coord.get(&mut reader, b"k1").unwrap();
        assert_eq!(v, Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn writeset_bits_empty_skips_broadcast_path() {
        let coord = single_shard_coordinator();
        let mut txn = coord.new_txn(0);
        // No writes at all: B2, commit without touching any broadcast path.
        coord.commit_txn(&mut txn).await.unwrap();
        assert!(txn.writeset_shard_bits.is_empty());
    }
}
