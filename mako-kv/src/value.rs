// MVCC value codec and version-chain arena (§3, §4.1).
//
// On-disk/wire layout of one record: `payload ∥ ts_and_epoch:u32 ∥
// version_header{timestamp:u32, prev_size:u32, prev_ptr:u32}`.
// `ts_and_epoch = ts*10 + epoch`, `epoch` in `[0,9]`. A chain-terminator
// has `prev_size == 0`. A deletion tombstone is the single payload byte
// `'B'` followed by the trailing header.
//
// The source links chain nodes with raw pointers (§9 "Version pointer
// graph"); here `prev_ptr` indexes into a `RecordArena` instead of
// pointing at heap memory, so the chain walk is the same shape but
// reclamation is an explicit free-list push under a single-writer
// discipline per chain, rather than a `free()`.

use std::collections::BTreeMap;

use mako_base::{err, err_kind, Kind, Result};

pub const TOMBSTONE_BYTE: u8 = b'B';
const MAX_CHAIN_DEPTH: usize = 10_000;
/// Nodes reclaimed roughly every 50 installs per arena, matching the
/// source's "probability 1/50 per thread" policy without pulling in a
/// random-number crate: a deterministic op counter stands in for the
/// coin flip, since both converge to the same long-run reclamation rate.
const RECLAIM_PERIOD: u32 = 50;

pub fn encode_ts_epoch(ts: u32, epoch: u8) -> u32 {
    ts * 10 + epoch as u32
}

pub fn decode_ts_epoch(v: u32) -> (u32, u8) {
    (v / 10, (v % 10) as u8)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionHeader {
    pub timestamp: u32,
    pub prev_size: u32,
    pub prev_ptr: u32,
}

/// One version in a key's chain. `prev_ptr == 0` means chain terminator
/// (V2: no ancestor). Stored inline rather than referencing a separate
/// buffer; `encode`/`decode` produce the exact spec byte layout (R1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub payload: Vec<u8>,
    pub ts_and_epoch: u32,
    pub header: VersionHeader,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.payload.len() == 1 && self.payload[0] == TOMBSTONE_BYTE
    }

    pub fn timestamp(&self) -> u32 {
        decode_ts_epoch(self.ts_and_epoch).0
    }

    pub fn epoch(&self) -> u8 {
        decode_ts_epoch(self.ts_and_epoch).1
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 16);
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.ts_and_epoch.to_le_bytes());
        buf.extend_from_slice(&self.header.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.header.prev_size.to_le_bytes());
        buf.extend_from_slice(&self.header.prev_ptr.to_le_bytes());
        buf
    }

    /// Decode a record; fails (V1) if there aren't enough trailing bytes
    /// for `ts_and_epoch` plus the version header.
    pub fn decode(bytes: &[u8]) -> Result<Record> {
        if bytes.len() < 16 {
            return Err(err_kind(Kind::Protocol, "record shorter than trailer"));
        }
        let split = bytes.len() - 16;
        let payload = bytes[..split].to_vec();
        let ts_and_epoch = u32::from_le_bytes(bytes[split..split + 4].try_into().unwrap());
        let timestamp = u32::from_le_bytes(bytes[split + 4..split + 8].try_into().unwrap());
        let prev_size = u32::from_le_bytes(bytes[split + 8..split + 12].try_into().unwrap());
        let prev_ptr = u32::from_le_bytes(bytes[split + 12..split + 16].try_into().unwrap());
        Ok(Record {
            payload,
            ts_and_epoch,
            header: VersionHeader {
                timestamp,
                prev_size,
                prev_ptr,
            },
        })
    }
}

/// Per-key version chains for one shard, addressed by 1-based arena
/// index (`0` is the null/chain-terminator sentinel, matching the wire
/// encoding's `prev_ptr == 0`).
#[derive(Default)]
pub struct RecordArena {
    slots: Vec<Option<Record>>,
    free: Vec<u32>,
    op_count: u32,
}

impl RecordArena {
    pub fn new() -> Self {
        RecordArena::default()
    }

    fn alloc(&mut self, record: Record) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize - 1] = Some(record);
            idx
        } else {
            self.slots.push(Some(record));
            self.slots.len() as u32
        }
    }

    fn slot(&self, idx: u32) -> Result<&Record> {
        self.slots
            .get(idx as usize - 1)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| err_kind(Kind::Protocol, "dangling version-chain pointer"))
    }

    /// `install(is_insert, is_delete, new_payload, current_epoch, tid)`:
    /// allocate a new head; `prev_ptr = head` (0 if `is_insert`,
    /// terminating the chain per V2).
    pub fn install(
        &mut self,
        is_insert: bool,
        is_delete: bool,
        new_payload: Vec<u8>,
        current_epoch: u8,
        tid: u32,
        head: u32,
    ) -> Result<u32> {
        if !is_insert && head != 0 {
            let prev = self.slot(head)?;
            if prev.timestamp() == tid && prev.epoch() == current_epoch {
                return Err(err_kind(Kind::Conflict, "install collides with existing head"));
            }
        }
        let payload = if is_delete {
            vec![TOMBSTONE_BYTE]
        } else {
            new_payload
        };
        let prev_ptr = if is_insert { 0 } else { head };
        let prev_size = if prev_ptr == 0 {
            0
        } else {
            self.slot(prev_ptr)?.encode().len() as u32
        };
        let record = Record {
            payload,
            ts_and_epoch: encode_ts_epoch(tid, current_epoch),
            header: VersionHeader {
                timestamp: tid,
                prev_size,
                prev_ptr,
            },
        };
        let new_head = self.alloc(record);
        self.op_count = self.op_count.wrapping_add(1);
        Ok(new_head)
    }

    /// `get(record, current_epoch, hist_watermark)`: if the head is from
    /// the current epoch, it is always visible (newest-wins). Otherwise
    /// walk the chain for the first node whose timestamp clears that
    /// node's epoch's historical watermark (V3).
    pub fn get(
        &self,
        head: u32,
        current_epoch: u8,
        hist_watermark: &BTreeMap<u8, u32>,
    ) -> Result<Option<(Vec<u8>, u32)>> {
        if head == 0 {
            return Ok(None);
        }
        let mut cur = head;
        let mut depth = 0;
        loop {
            depth += 1;
            if depth > MAX_CHAIN_DEPTH {
                return Err(err("version chain exceeds max depth; possible cycle"));
            }
            let rec = self.slot(cur)?;
            let visible = if rec.epoch() == current_epoch {
                true
            } else {
                hist_watermark
                    .get(&rec.epoch())
                    .is_some_and(|w| rec.timestamp() <= *w)
            };
            if visible {
                if rec.is_tombstone() {
                    return Ok(None);
                }
                return Ok(Some((rec.payload.clone(), rec.timestamp())));
            }
            if rec.header.prev_size == 0 {
                return Ok(None);
            }
            cur = rec.header.prev_ptr;
        }
    }

    /// Walk `head`'s chain and free every node strictly below
    /// `global_watermark` that isn't the head for `current_epoch`,
    /// cutting the chain at the first such node (§3 reclamation rule:
    /// single-writer, the installer of the new head).
    pub fn maybe_reclaim(&mut self, head: u32, global_watermark: u32) {
        if head == 0 || self.op_count % RECLAIM_PERIOD != 0 {
            return;
        }
        self.reclaim(head, global_watermark);
    }

    // Never reclaims the head itself (only nodes strictly below it in the
    // chain), which vacuously satisfies "not the head for the current
    // epoch" from the source's reclamation rule.
    fn reclaim(&mut self, head: u32, global_watermark: u32) {
        let Ok(head_rec) = self.slot(head) else {
            return;
        };
        let mut cur = head_rec.header.prev_ptr;
        let mut cut_at: Option<u32> = None;
        while cur != 0 {
            let Ok(rec) = self.slot(cur) else { break };
            if rec.timestamp() < global_watermark {
                cut_at = Some(cur);
                break;
            }
            cur = rec.header.prev_ptr;
        }
        if let Some(cut) = cut_at {
            let mut dead = self.slot(cut).ok().map(|r| r.header.prev_ptr);
            // Sever the chain: the node at `cut` becomes the new terminator.
            if let Some(slot) = self.slots.get_mut(cut as usize - 1) {
                if let Some(rec) = slot {
                    rec.header.prev_size = 0;
                    rec.header.prev_ptr = 0;
                }
            }
            while let Some(idx) = dead {
                if idx == 0 {
                    break;
                }
                let next = self.slot(idx).ok().map(|r| r.header.prev_ptr);
                if let Some(slot) = self.slots.get_mut(idx as usize - 1) {
                    *slot = None;
                }
                self.free.push(idx);
                dead = next;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let rec = Record {
            payload: b"hello".to_vec(),
            ts_and_epoch: encode_ts_epoch(42, 3),
            header: VersionHeader {
                timestamp: 42,
                prev_size: 0,
                prev_ptr: 0,
            },
        };
        let bytes = rec.encode();
        let decoded = Record::decode(&bytes).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn install_and_get_newest_wins_in_current_epoch() {
        let mut arena = RecordArena::new();
        let h1 = arena.install(true, false, b"v1".to_vec(), 0, 1, 0).unwrap();
        let h2 = arena.install(false, false, b"v2".to_vec(), 0, 2, h1).unwrap();
        let hist = BTreeMap::new();
        let (payload, ts) = arena.get(h2, 0, &hist).unwrap().unwrap();
        assert_eq!(payload, b"v2");
        assert_eq!(ts, 2);
    }

    #[test]
    fn tombstone_reads_as_absent() {
        let mut arena = RecordArena::new();
        let h1 = arena.install(true, false, b"v1".to_vec(), 0, 1, 0).unwrap();
        let h2 = arena.install(false, true, Vec::new(), 0, 2, h1).unwrap();
        let hist = BTreeMap::new();
        assert!(arena.get(h2, 0, &hist).unwrap().is_none());
    }

    #[test]
    fn past_epoch_visible_only_below_hist_watermark() {
        let mut arena = RecordArena::new();
        let h1 = arena.install(true, false, b"v1".to_vec(), 0, 10, 0).unwrap();
        let h2 = arena.install(false, false, b"v2".to_vec(), 0, 20, h1).unwrap();
        let mut hist = BTreeMap::new();
        hist.insert(0u8, 15u32);
        // current epoch advanced past 0, so neither node is "current epoch"
        let (payload, ts) = arena.get(h2, 1, &hist).unwrap().unwrap();
        assert_eq!(payload, b"v1");
        assert_eq!(ts, 10);
    }

    #[test]
    fn chain_terminates_at_prev_size_zero() {
        let mut arena = RecordArena::new();
        let h1 = arena.install(true, false, b"only".to_vec(), 0, 1, 0).unwrap();
        assert_eq!(arena.slot(h1).unwrap().header.prev_size, 0);
    }
}
