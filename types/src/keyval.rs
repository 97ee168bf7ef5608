use crate::ids::Id;
use serde::{Deserialize, Serialize};

/// Payload stored against a key. Opaque to the overlay; the testbed feeds
/// it JSON objects (a `title` field plus arbitrary attributes).
pub type Value = serde_json::Value;

/// One stored pair, the unit of join/leave handoff and of snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Id,
    pub data: Value,
}

impl Entry {
    pub fn new(key: Id, data: Value) -> Self {
        Entry { key, data }
    }
}
