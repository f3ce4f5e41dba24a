mod facade;
mod index;
mod value;

pub use facade::{fnv1a, ShardedIndexFacade};
pub use index::{OrderedIndexShard, ReadSetEntry, ShardTxn, TxnId, WriteSetEntry};
pub use value::{decode_ts_epoch, encode_ts_epoch, Record, RecordArena, VersionHeader, TOMBSTONE_BYTE};
