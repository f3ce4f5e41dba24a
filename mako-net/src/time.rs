use serde::{Deserialize, Serialize};

use crate::ids::ServerId;

// NodeTime is a virtual time-point in signed 64-bit microseconds
// since the epoch. This is sufficient to span 292,471 years.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeTime(pub i64);

impl NodeTime {
    pub fn from_micros(t: i64) -> Self {
        NodeTime(t)
    }
    pub fn as_micros(self) -> i64 {
        self.0
    }
}

// Duration is a time-span in signed 64-bit microseconds relative to
// some NodeTime or RealmTime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Duration(pub i64);

impl Duration {
    pub fn from_millis(ms: i64) -> Self {
        Duration(ms * 1000)
    }
    pub fn as_millis(self) -> i64 {
        self.0 / 1000
    }
    pub fn as_std(self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0.max(0) as u64)
    }
}

// RealmTimes are realm-local extended timestamps. The most significant
// (time) field stores a NodeTime (microsecond count), but this is then
// followed by both a ServerId and an event count allowing each server to
// label any event with a RealmTime without coordination with other
// servers, _and_ with essentially arbitrary numbers of sub-microsecond
// events without implying anything about real time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RealmTime {
    pub time: NodeTime,
    pub server: ServerId,
    pub event: i64,
}
