use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;

use super::retrieval::RetrievalHandle;

/// Lifecycle of a retrieval round. Ordered: a stored round only moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Available,
    Done,
}

/// All media retrievals requested for one triggering event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Round {
    pub asset_id: String,
    /// Trigger time in epoch milliseconds.
    pub event_time: i64,
    /// In configured offset order.
    pub handles: Vec<RetrievalHandle>,
    pub status: RoundStatus,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub outcome: Map<String, Value>,
    /// Bumped on every write.
    #[serde(default)]
    pub version: u64,
    /// Failed terminal action runs so far.
    #[serde(default)]
    pub action_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Round {
    pub fn new(asset_id: impl Into<String>, event_time: i64, handles: Vec<RetrievalHandle>) -> Self {
        let now = Utc::now();
        Self {
            asset_id: asset_id.into(),
            event_time,
            handles,
            status: RoundStatus::Pending,
            outcome: Map::new(),
            version: 0,
            action_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> String {
        round_key(&self.asset_id, self.event_time)
    }

    pub fn all_resolved(&self) -> bool {
        self.handles.iter().all(RetrievalHandle::is_resolved)
    }

    /// Move to `status` if it is ahead of the current one. Returns whether it moved.
    pub fn advance(&mut self, status: RoundStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }

    /// Pending becomes available once every handle has resolved.
    pub fn recompute_status(&mut self) -> bool {
        if self.status == RoundStatus::Pending && self.all_resolved() {
            self.advance(RoundStatus::Available)
        } else {
            false
        }
    }

    pub fn capture_times(&self) -> Vec<i64> {
        self.handles.iter().map(|h| h.capture_time).collect()
    }
}

/// Identity key of a round: one per asset and event time.
pub fn round_key(asset_id: &str, event_time: i64) -> String {
    format!("{asset_id}_{event_time}")
}
