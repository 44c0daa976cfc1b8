//! The "slug bug" round action: look for a Volkswagen Beetle in the captured
//! frames and announce the first one found.
//!
//! The outcome of each round is recorded before it is returned, so a round that
//! runs again (because completing it failed) reuses it instead of notifying twice.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::models::retrieval::RetrievalStatus;
use crate::models::round::Round;
use crate::services::media::MediaError;
use crate::services::notify::{Notification, Notifier, NotifyError};
use crate::services::rounds::TerminalAction;
use crate::services::samsara::SamsaraError;
use crate::services::vision::{Classification, VisionError};
use crate::store::{KvStore, ObjectStore, StoreError};

pub const OUTCOMES_NAMESPACE: &str = "round_outcomes";

#[async_trait]
pub trait ImageClassifier: Send + Sync {
    async fn classify(&self, image_bytes: &[u8]) -> Result<Classification, VisionError>;
}

#[async_trait]
pub trait LocationLookup: Send + Sync {
    /// Human-readable address of the vehicle at `time` (epoch ms).
    async fn location_at(&self, asset_id: &str, time: i64) -> Result<Option<String>, SamsaraError>;
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, MediaError>;
}

pub struct SlugBugAction {
    media: Arc<dyn MediaFetcher>,
    classifier: Arc<dyn ImageClassifier>,
    locations: Arc<dyn LocationLookup>,
    notifier: Arc<dyn Notifier>,
    outcomes: KvStore,
}

struct Sighting {
    capture_time: i64,
    image_url: String,
    classification: Classification,
}

#[derive(Default)]
struct Scan {
    sighting: Option<Sighting>,
    images_checked: usize,
    /// Frames that could not be downloaded or classified.
    frames_failed: usize,
}

impl SlugBugAction {
    pub fn new(
        media: Arc<dyn MediaFetcher>,
        classifier: Arc<dyn ImageClassifier>,
        locations: Arc<dyn LocationLookup>,
        notifier: Arc<dyn Notifier>,
        backend: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            media,
            classifier,
            locations,
            notifier,
            outcomes: KvStore::new(OUTCOMES_NAMESPACE, backend),
        }
    }

    /// Classify frames in capture order, stopping at the first sighting.
    ///
    /// A frame that fails to download or classify is skipped; expired media
    /// URLs and unparseable model answers do not heal on retry.
    async fn find_sighting(&self, round: &Round) -> Scan {
        let mut scan = Scan::default();

        for handle in round
            .handles
            .iter()
            .filter(|h| h.status == RetrievalStatus::Available)
        {
            for url in handle.available_urls() {
                let bytes = match self.media.fetch(url).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(
                            retrieval_id = %handle.retrieval_id,
                            error = %e,
                            "Media download failed, skipping frame"
                        );
                        scan.frames_failed += 1;
                        continue;
                    }
                };
                if let Err(e) = image::guess_format(&bytes) {
                    tracing::warn!(
                        retrieval_id = %handle.retrieval_id,
                        error = %e,
                        "Retrieved media is not an image, skipping"
                    );
                    continue;
                }

                scan.images_checked += 1;
                let classification = match self.classifier.classify(&bytes).await {
                    Ok(classification) => classification,
                    Err(e) => {
                        tracing::warn!(
                            retrieval_id = %handle.retrieval_id,
                            error = %e,
                            "Classification failed, skipping frame"
                        );
                        scan.frames_failed += 1;
                        continue;
                    }
                };
                tracing::debug!(
                    retrieval_id = %handle.retrieval_id,
                    slug_bug = classification.slug_bug,
                    description = %classification.description,
                    "Classified frame"
                );

                if classification.slug_bug {
                    scan.sighting = Some(Sighting {
                        capture_time: handle.capture_time,
                        image_url: url.to_string(),
                        classification,
                    });
                    return scan;
                }
            }
        }

        scan
    }
}

#[async_trait]
impl TerminalAction for SlugBugAction {
    type Error = ActionError;

    async fn on_available(&self, round: &Round) -> Result<Map<String, Value>, ActionError> {
        let key = round.key();
        if let Some(outcome) = self.outcomes.get::<Map<String, Value>>(&key).await? {
            tracing::info!(round = %key, "Outcome already recorded, not repeating");
            return Ok(outcome);
        }

        let failed_captures = round
            .handles
            .iter()
            .filter(|h| h.status == RetrievalStatus::Failed)
            .count();

        let scan = self.find_sighting(round).await;

        let mut outcome = Map::new();
        outcome.insert("images_checked".into(), json!(scan.images_checked));
        outcome.insert("failed_captures".into(), json!(failed_captures));
        outcome.insert("frames_failed".into(), json!(scan.frames_failed));

        let Some(sighting) = scan.sighting else {
            tracing::info!(
                asset_id = %round.asset_id,
                images_checked = scan.images_checked,
                frames_failed = scan.frames_failed,
                "No slug bug in round"
            );
            outcome.insert("slug_bug".into(), json!(false));
            outcome.insert("notified".into(), json!(false));
            return Ok(self.outcomes.set(&key, outcome).await?);
        };

        // The address is a nice-to-have; never drop the notification over it.
        let location = match self
            .locations
            .location_at(&round.asset_id, sighting.capture_time)
            .await
        {
            Ok(location) => location,
            Err(e) => {
                tracing::warn!(asset_id = %round.asset_id, error = %e, "Vehicle location lookup failed");
                None
            }
        };

        let text = match &location {
            Some(address) => format!("Slug bug! Vehicle {} spotted one near {}", round.asset_id, address),
            None => format!("Slug bug! Vehicle {} spotted one", round.asset_id),
        };
        let notification = Notification {
            text,
            asset_id: round.asset_id.clone(),
            capture_time: sighting.capture_time,
            location: location.clone(),
            image_url: Some(sighting.image_url),
        };
        self.notifier.notify(&notification).await?;

        metrics::counter!("slug_bugs_detected_total").increment(1);
        tracing::info!(
            asset_id = %round.asset_id,
            capture_time = sighting.capture_time,
            "Slug bug spotted, notification sent"
        );

        outcome.insert("slug_bug".into(), json!(true));
        outcome.insert("capture_time".into(), json!(sighting.capture_time));
        outcome.insert("description".into(), json!(sighting.classification.description));
        outcome.insert("location".into(), json!(location));
        outcome.insert("notified".into(), json!(true));
        Ok(self.outcomes.set(&key, outcome).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Notification failed: {0}")]
    Notify(#[from] NotifyError),

    #[error("Recording the round outcome failed: {0}")]
    Store(#[from] StoreError),
}
