// Watermark Subsystem (§4.6). Per-partition `local_ts`/`disk_ts` atomics
// feed a single process-level `global_watermark` atomic via a periodic
// advancer; a cross-shard exchange client keeps watermarks converging
// across shards so epoch-boundary reads stay safe (§4.9).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use mako_base::Result;
use mako_net::{
    decode_payload, encode_payload, ExchangeWatermarkRequest, ExchangeWatermarkResponse, RpcClient,
    RpcId, ServerId, ShardId,
};

pub const ADVANCER_PERIOD: Duration = Duration::from_millis(1);
pub const EXCHANGE_PERIOD: Duration = Duration::from_millis(1);

/// `safe(ts, w) ≡ ts ≤ w` (§4.6).
pub fn safe(ts: u32, watermark: u32) -> bool {
    ts <= watermark
}

pub struct WatermarkState {
    local_ts: Vec<AtomicU32>,
    disk_ts: Vec<AtomicU32>,
    global_watermark: AtomicU32,
    hist_watermark: Mutex<BTreeMap<u8, u32>>,
    pub exchange_running: AtomicBool,
}

impl WatermarkState {
    /// `n_partitions` is parameter-driven (DESIGN NOTES resolution of the
    /// §9 "partition count truly bounded?" open question), not a fixed 80.
    pub fn new(n_partitions: u16) -> Arc<Self> {
        Arc::new(WatermarkState {
            local_ts: (0..n_partitions).map(|_| AtomicU32::new(0)).collect(),
            // Disk persistence is out of scope (§6 "Persisted state
            // (optional)"); an unmaintained `disk_ts` must not hold
            // `global_watermark` at zero forever. Matches the original's
            // `#ifndef DISABLE_DISK` guard (sync_util.hh) by starting at
            // the same "doesn't constrain the min" sentinel `local_ts`
            // uses at end-of-stream (§4.7).
            disk_ts: (0..n_partitions).map(|_| AtomicU32::new(u32::MAX)).collect(),
            global_watermark: AtomicU32::new(0),
            hist_watermark: Mutex::new(BTreeMap::new()),
            exchange_running: AtomicBool::new(true),
        })
    }

    pub fn set_local_ts(&self, partition: u16, ts: u32) {
        self.local_ts[partition as usize].store(ts, Ordering::Release);
    }

    pub fn local_ts(&self, partition: u16) -> u32 {
        self.local_ts[partition as usize].load(Ordering::Acquire)
    }

    pub fn set_disk_ts(&self, partition: u16, ts: u32) {
        self.disk_ts[partition as usize].store(ts, Ordering::Release);
    }

    pub fn global_watermark(&self) -> u32 {
        self.global_watermark.load(Ordering::Acquire)
    }

    pub fn set_hist_watermark(&self, epoch: u8, w: u32) {
        self.hist_watermark.lock().unwrap().insert(epoch, w);
    }

    pub fn hist_watermark(&self, epoch: u8) -> Option<u32> {
        self.hist_watermark.lock().unwrap().get(&epoch).copied()
    }

    /// `candidate = min over p of min(local_ts[p], disk_ts[p])`; stores
    /// it only if it doesn't regress `global_watermark` (T3).
    pub fn advance_once(&self) {
        let candidate = (0..self.local_ts.len())
            .map(|p| self.local_ts[p].load(Ordering::Acquire).min(self.disk_ts[p].load(Ordering::Acquire)))
            .min()
            .unwrap_or(0);
        let mut current = self.global_watermark.load(Ordering::Acquire);
        while candidate >= current {
            match self.global_watermark.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        trace!(target: "mako::watermark", candidate, global = self.global_watermark(), "advance_once");
    }

    /// Merge an observed remote watermark in (monotone, never regresses).
    pub fn merge_remote(&self, remote: u32) {
        let mut current = self.global_watermark.load(Ordering::Acquire);
        while remote > current {
            match self.global_watermark.compare_exchange_weak(
                current,
                remote,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn n_partitions(&self) -> u16 {
        self.local_ts.len() as u16
    }
}

/// Dedicated advancer task (followers; leaders piggyback advances on
/// commits per §4.6, so spawning this is optional there).
pub fn spawn_advancer(state: Arc<WatermarkState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(ADVANCER_PERIOD).await;
            state.advance_once();
        }
    })
}

/// Cross-shard exchange client: issues `ExchangeWatermark` to every
/// other shard every ~1ms and merges the max observed back in. Disabled
/// during the failover prelude (`exchange_running = false`, §4.9 Phase 0).
pub fn spawn_exchange_client(
    state: Arc<WatermarkState>,
    local_shard: ShardId,
    peers: Arc<std::collections::BTreeMap<ShardId, Arc<RpcClient>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(EXCHANGE_PERIOD).await;
            if !state.exchange_running.load(Ordering::Acquire) {
                continue;
            }
            let watermark = state.global_watermark();
            for (shard, client) in peers.iter() {
                let req = ExchangeWatermarkRequest {
                    from_shard: local_shard,
                    watermark,
                };
                let body = match encode_payload(ServerId(shard.0), &req) {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                match client.call(RpcId::ExchangeWatermark, body, Duration::from_millis(200)).await {
                    Ok(resp) if resp.error_code == 0 => {
                        if let Ok((_, payload)) =
                            decode_payload::<ExchangeWatermarkResponse>(&resp.body)
                        {
                            state.merge_remote(payload.watermark);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(target: "mako::watermark", ?shard, error = ?e, "exchange failed"),
                }
            }
        }
    })
}

/// The server-side answer to an incoming `ExchangeWatermark` request
/// (§4.6 "a matching server runs on each replica to answer").
pub fn handle_exchange_watermark(
    state: &WatermarkState,
    local_shard: ShardId,
    req: &ExchangeWatermarkRequest,
) -> Result<ExchangeWatermarkResponse> {
    state.merge_remote(req.watermark);
    Ok(ExchangeWatermarkResponse {
        header: mako_net::response_header(mako_net::Status::Success, 0, local_shard),
        watermark: state.global_watermark(),
        shard_idx: local_shard,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn advance_takes_min_across_partitions() {
        let state = WatermarkState::new(2);
        state.set_local_ts(0, 30);
        state.set_disk_ts(0, 40);
        state.set_local_ts(1, 25);
        state.set_disk_ts(1, 45);
        state.advance_once();
        assert!(state.global_watermark() >= 25);
    }

    #[test]
    fn global_watermark_never_regresses() {
        let state = WatermarkState::new(1);
        state.set_local_ts(0, 100);
        state.set_disk_ts(0, 100);
        state.advance_once();
        let after_first = state.global_watermark();
        state.set_local_ts(0, 10);
        state.set_disk_ts(0, 10);
        state.advance_once();
        assert_eq!(state.global_watermark(), after_first);
    }

    #[test]
    fn merge_remote_is_monotone() {
        let state = WatermarkState::new(1);
        state.merge_remote(50);
        state.merge_remote(10);
        assert_eq!(state.global_watermark(), 50);
    }

    #[test]
    fn watermark_exchange_observes_min_of_published_values() {
        // S6: follower A publishes local_ts=[30,40], follower B publishes
        // local_ts=[25,45]; after exchange each should observe >= 25.
        let a = WatermarkState::new(2);
        a.set_local_ts(0, 30);
        a.set_disk_ts(0, 30);
        a.set_local_ts(1, 40);
        a.set_disk_ts(1, 40);
        a.advance_once();

        let b = WatermarkState::new(2);
        b.set_local_ts(0, 25);
        b.set_disk_ts(0, 25);
        b.set_local_ts(1, 45);
        b.set_disk_ts(1, 45);
        b.advance_once();

        a.merge_remote(b.global_watermark());
        b.merge_remote(a.global_watermark());
        assert!(a.global_watermark() >= 25);
        assert!(b.global_watermark() >= 25);
    }
}
