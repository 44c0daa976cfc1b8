mod helpers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use fleet_functions::models::retrieval::{RetrievalHandle, RetrievalStatus};
use fleet_functions::models::round::{Round, RoundStatus};
use fleet_functions::services::media::MediaError;
use fleet_functions::services::notify::{Notification, Notifier, NotifyError};
use fleet_functions::services::rounds::TerminalAction;
use fleet_functions::services::samsara::SamsaraError;
use fleet_functions::services::slug_bug::{
    ActionError, ImageClassifier, LocationLookup, MediaFetcher, SlugBugAction,
};
use fleet_functions::services::vision::{Classification, VisionError};
use fleet_functions::store::{MemoryObjectStore, ObjectStore};
use helpers::media;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

fn png(tag: &str) -> Vec<u8> {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.extend_from_slice(tag.as_bytes());
    bytes
}

#[derive(Default)]
struct FakeMedia {
    files: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl MediaFetcher for FakeMedia {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, MediaError> {
        self.files.get(url).cloned().ok_or(MediaError::Status(404))
    }
}

/// Sees a Beetle in any image whose bytes end with "beetle"; cannot answer for
/// bytes ending with "garbled".
#[derive(Default)]
struct FakeClassifier {
    calls: Mutex<usize>,
}

#[async_trait]
impl ImageClassifier for FakeClassifier {
    async fn classify(&self, image_bytes: &[u8]) -> Result<Classification, VisionError> {
        *self.calls.lock().unwrap() += 1;
        if image_bytes.ends_with(b"garbled") {
            return Err(VisionError::NoAnswer("I see a road.".to_string()));
        }
        let slug_bug = image_bytes.ends_with(b"beetle");
        Ok(Classification {
            slug_bug,
            description: if slug_bug {
                "A yellow Beetle in the oncoming lane.".to_string()
            } else {
                "An empty road.".to_string()
            },
        })
    }
}

struct FakeLocations {
    address: Option<String>,
    fail: bool,
}

#[async_trait]
impl LocationLookup for FakeLocations {
    async fn location_at(&self, _asset_id: &str, _time: i64) -> Result<Option<String>, SamsaraError> {
        if self.fail {
            return Err(SamsaraError::Status {
                status: 429,
                body: "rate limited".to_string(),
            });
        }
        Ok(self.address.clone())
    }
}

#[derive(Default)]
struct FakeNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Status(500));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

fn handle(capture_time: i64, status: RetrievalStatus, url: Option<&str>) -> RetrievalHandle {
    let mut handle = RetrievalHandle::new(format!("ret-{capture_time}"), "veh1", capture_time);
    handle.status = status;
    handle.media = vec![media(status, url)];
    handle
}

fn available_round(handles: Vec<RetrievalHandle>) -> Round {
    let mut round = Round::new("veh1", 1000, handles);
    round.advance(RoundStatus::Available);
    round
}

struct Harness {
    action: SlugBugAction,
    classifier: Arc<FakeClassifier>,
    notifier: Arc<FakeNotifier>,
    store: MemoryObjectStore,
}

fn harness(files: &[(&str, Vec<u8>)], locations: FakeLocations, notifier: FakeNotifier) -> Harness {
    let media = FakeMedia {
        files: files
            .iter()
            .map(|(url, bytes)| (url.to_string(), bytes.clone()))
            .collect(),
    };
    let classifier = Arc::new(FakeClassifier::default());
    let notifier = Arc::new(notifier);
    let store = MemoryObjectStore::new();
    let action = SlugBugAction::new(
        Arc::new(media),
        classifier.clone(),
        Arc::new(locations),
        notifier.clone(),
        Arc::new(store.clone()),
    );
    Harness {
        action,
        classifier,
        notifier,
        store,
    }
}

fn main_street() -> FakeLocations {
    FakeLocations {
        address: Some("123 Main St, Springfield".to_string()),
        fail: false,
    }
}

#[tokio::test]
async fn test_first_sighting_is_notified_once() {
    let h = harness(
        &[
            ("https://m/1007.jpg", png("road")),
            ("https://m/1011.jpg", png("beetle")),
            ("https://m/1014.jpg", png("beetle")),
        ],
        main_street(),
        FakeNotifier::default(),
    );
    let round = available_round(vec![
        handle(1007, RetrievalStatus::Available, Some("https://m/1007.jpg")),
        handle(1011, RetrievalStatus::Available, Some("https://m/1011.jpg")),
        handle(1014, RetrievalStatus::Available, Some("https://m/1014.jpg")),
    ]);

    let outcome = h.action.on_available(&round).await.unwrap();

    assert_eq!(outcome["slug_bug"], json!(true));
    assert_eq!(outcome["capture_time"], json!(1011));
    assert_eq!(outcome["location"], json!("123 Main St, Springfield"));
    assert_eq!(outcome["images_checked"], json!(2));
    assert_eq!(outcome["notified"], json!(true));
    assert_eq!(*h.classifier.calls.lock().unwrap(), 2);

    let sent = h.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].capture_time, 1011);
    assert_eq!(sent[0].image_url.as_deref(), Some("https://m/1011.jpg"));
    assert!(sent[0].text.contains("123 Main St"));
}

#[tokio::test]
async fn test_no_sighting_sends_nothing() {
    let h = harness(
        &[("https://m/1007.jpg", png("road")), ("https://m/1011.jpg", png("road"))],
        main_street(),
        FakeNotifier::default(),
    );
    let round = available_round(vec![
        handle(1007, RetrievalStatus::Available, Some("https://m/1007.jpg")),
        handle(1011, RetrievalStatus::Available, Some("https://m/1011.jpg")),
    ]);

    let outcome = h.action.on_available(&round).await.unwrap();

    assert_eq!(outcome["slug_bug"], json!(false));
    assert_eq!(outcome["notified"], json!(false));
    assert_eq!(outcome["images_checked"], json!(2));
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_captures_are_skipped_and_counted() {
    let h = harness(
        &[("https://m/1014.jpg", png("beetle"))],
        main_street(),
        FakeNotifier::default(),
    );
    let round = available_round(vec![
        handle(1007, RetrievalStatus::Failed, None),
        handle(1011, RetrievalStatus::Failed, None),
        handle(1014, RetrievalStatus::Available, Some("https://m/1014.jpg")),
    ]);

    let outcome = h.action.on_available(&round).await.unwrap();

    assert_eq!(outcome["failed_captures"], json!(2));
    assert_eq!(outcome["images_checked"], json!(1));
    assert_eq!(outcome["slug_bug"], json!(true));
}

#[tokio::test]
async fn test_non_image_media_is_skipped() {
    let h = harness(
        &[
            ("https://m/1007.jpg", b"<html>expired</html>".to_vec()),
            ("https://m/1011.jpg", png("road")),
        ],
        main_street(),
        FakeNotifier::default(),
    );
    let round = available_round(vec![
        handle(1007, RetrievalStatus::Available, Some("https://m/1007.jpg")),
        handle(1011, RetrievalStatus::Available, Some("https://m/1011.jpg")),
    ]);

    let outcome = h.action.on_available(&round).await.unwrap();

    assert_eq!(outcome["images_checked"], json!(1));
    assert_eq!(*h.classifier.calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_location_failure_still_notifies() {
    let h = harness(
        &[("https://m/1007.jpg", png("beetle"))],
        FakeLocations {
            address: None,
            fail: true,
        },
        FakeNotifier::default(),
    );
    let round = available_round(vec![handle(
        1007,
        RetrievalStatus::Available,
        Some("https://m/1007.jpg"),
    )]);

    let outcome = h.action.on_available(&round).await.unwrap();

    assert_eq!(outcome["notified"], json!(true));
    assert_eq!(outcome["location"], json!(null));
    let sent = h.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].location.is_none());
}

#[tokio::test]
async fn test_notification_failure_fails_the_action() {
    let h = harness(
        &[("https://m/1007.jpg", png("beetle"))],
        main_street(),
        FakeNotifier {
            sent: Mutex::new(Vec::new()),
            fail: true,
        },
    );
    let round = available_round(vec![handle(
        1007,
        RetrievalStatus::Available,
        Some("https://m/1007.jpg"),
    )]);

    let err = h.action.on_available(&round).await.unwrap_err();
    assert!(matches!(err, ActionError::Notify(_)));
}

#[tokio::test]
async fn test_failed_download_skips_the_frame() {
    let h = harness(
        &[("https://m/1011.jpg", png("beetle"))],
        main_street(),
        FakeNotifier::default(),
    );
    let round = available_round(vec![
        handle(1007, RetrievalStatus::Available, Some("https://m/expired.jpg")),
        handle(1011, RetrievalStatus::Available, Some("https://m/1011.jpg")),
    ]);

    let outcome = h.action.on_available(&round).await.unwrap();

    assert_eq!(outcome["frames_failed"], json!(1));
    assert_eq!(outcome["images_checked"], json!(1));
    assert_eq!(outcome["slug_bug"], json!(true));
}

#[tokio::test]
async fn test_unanswerable_frames_still_finish_the_round() {
    let h = harness(
        &[
            ("https://m/1007.jpg", png("garbled")),
            ("https://m/1011.jpg", png("garbled")),
        ],
        main_street(),
        FakeNotifier::default(),
    );
    let round = available_round(vec![
        handle(1007, RetrievalStatus::Available, Some("https://m/1007.jpg")),
        handle(1011, RetrievalStatus::Available, Some("https://m/1011.jpg")),
    ]);

    let outcome = h.action.on_available(&round).await.unwrap();

    assert_eq!(outcome["frames_failed"], json!(2));
    assert_eq!(outcome["slug_bug"], json!(false));
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rerun_reuses_recorded_outcome_without_notifying_again() {
    let h = harness(
        &[("https://m/1007.jpg", png("beetle"))],
        main_street(),
        FakeNotifier::default(),
    );
    let round = available_round(vec![handle(
        1007,
        RetrievalStatus::Available,
        Some("https://m/1007.jpg"),
    )]);

    let first = h.action.on_available(&round).await.unwrap();
    // Completing the round failed; the next sweep runs the action again.
    let second = h.action.on_available(&round).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    assert_eq!(*h.classifier.calls.lock().unwrap(), 1);
    assert!(h.store.get("round_outcomes/veh1_1000").await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_notification_is_not_recorded() {
    let h = harness(
        &[("https://m/1007.jpg", png("beetle"))],
        main_street(),
        FakeNotifier {
            sent: Mutex::new(Vec::new()),
            fail: true,
        },
    );
    let round = available_round(vec![handle(
        1007,
        RetrievalStatus::Available,
        Some("https://m/1007.jpg"),
    )]);

    assert!(h.action.on_available(&round).await.is_err());
    assert!(h.store.get("round_outcomes/veh1_1000").await.unwrap().is_none());
}

#[tokio::test]
async fn test_outcome_store_fault_fails_the_action() {
    let h = harness(&[("https://m/1007.jpg", png("road"))], main_street(), FakeNotifier::default());
    h.store.inject_failure("round_outcomes/");
    let round = available_round(vec![handle(
        1007,
        RetrievalStatus::Available,
        Some("https://m/1007.jpg"),
    )]);

    let err = h.action.on_available(&round).await.unwrap_err();
    assert!(matches!(err, ActionError::Store(_)));
}
