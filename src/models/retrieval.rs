use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Status of a dashcam media retrieval, as reported by Samsara.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RetrievalStatus {
    /// Requested, not uploaded yet.
    #[serde(alias = "pending")]
    Queued,
    Available,
    /// The camera could not produce the media. Resolved, but with nothing to look at.
    Failed,
}

impl RetrievalStatus {
    /// Map a Samsara media status string. Anything unrecognised is still in flight.
    pub fn from_external(status: &str) -> Self {
        match status {
            "available" => RetrievalStatus::Available,
            "failed" | "invalid" => RetrievalStatus::Failed,
            _ => RetrievalStatus::Queued,
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, RetrievalStatus::Available | RetrievalStatus::Failed)
    }

    /// Aggregate per-item statuses: any failure fails the retrieval, all available
    /// makes it available, anything else keeps it queued.
    pub fn aggregate<I: IntoIterator<Item = RetrievalStatus>>(statuses: I) -> Self {
        let mut seen_any = false;
        let mut all_available = true;
        for status in statuses {
            seen_any = true;
            match status {
                RetrievalStatus::Failed => return RetrievalStatus::Failed,
                RetrievalStatus::Queued => all_available = false,
                RetrievalStatus::Available => {}
            }
        }
        if seen_any && all_available {
            RetrievalStatus::Available
        } else {
            RetrievalStatus::Queued
        }
    }
}

/// One media file of a retrieval (one camera input).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    pub input: String,
    pub media_type: String,
    pub status: RetrievalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_expiry_time: Option<String>,
}

/// A media retrieval request and its latest known state.
///
/// Stored under [`handle_key`] so a repeated request for the same capture reuses it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalHandle {
    pub retrieval_id: String,
    pub asset_id: String,
    /// Capture time in epoch milliseconds.
    pub capture_time: i64,
    pub status: RetrievalStatus,
    #[serde(default)]
    pub media: Vec<MediaItem>,
    pub updated_at: DateTime<Utc>,
}

/// Fields returned by a status poll. `None` means "not reported", not "cleared".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalUpdate {
    pub status: Option<RetrievalStatus>,
    pub media: Option<Vec<MediaItem>>,
}

impl RetrievalHandle {
    pub fn new(retrieval_id: impl Into<String>, asset_id: impl Into<String>, capture_time: i64) -> Self {
        Self {
            retrieval_id: retrieval_id.into(),
            asset_id: asset_id.into(),
            capture_time,
            status: RetrievalStatus::Queued,
            media: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status.is_resolved()
    }

    /// Merge a poll result into this handle; reported fields win.
    pub fn merge(&mut self, update: RetrievalUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(media) = update.media {
            self.media = media;
        }
        self.updated_at = Utc::now();
    }

    /// URLs of media items that are ready to download.
    pub fn available_urls(&self) -> impl Iterator<Item = &str> {
        self.media
            .iter()
            .filter(|m| m.status == RetrievalStatus::Available)
            .filter_map(|m| m.url.as_deref())
    }
}

/// Dedup key of a retrieval: one per asset and capture time.
pub fn handle_key(asset_id: &str, capture_time: i64) -> String {
    format!("{asset_id}_{capture_time}")
}
