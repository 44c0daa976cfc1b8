//! Test doubles for the external collaborators of retrieval rounds.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use fleet_functions::models::retrieval::{MediaItem, RetrievalHandle, RetrievalStatus, RetrievalUpdate};
use fleet_functions::models::round::Round;
use fleet_functions::services::rounds::{RetrievalApi, RoundTracker, TerminalAction};
use fleet_functions::services::samsara::SamsaraError;
use fleet_functions::store::MemoryObjectStore;

/// Scripted retrieval API. Retrievals stay queued until a test resolves them.
#[derive(Default)]
pub struct FakeRetrievalApi {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    /// capture_time -> retrieval_id
    ids: HashMap<i64, String>,
    creates: Vec<(String, i64)>,
    updates: HashMap<String, RetrievalUpdate>,
    polls: Vec<String>,
    fail_create: HashSet<i64>,
    fail_poll: HashSet<i64>,
}

impl FakeRetrievalApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of successful creation calls for a capture time.
    pub fn creates_for(&self, capture_time: i64) -> usize {
        let state = self.state.lock().unwrap();
        state.creates.iter().filter(|(_, t)| *t == capture_time).count()
    }

    pub fn total_creates(&self) -> usize {
        self.state.lock().unwrap().creates.len()
    }

    pub fn retrieval_id(&self, capture_time: i64) -> String {
        self.state.lock().unwrap().ids[&capture_time].clone()
    }

    /// Number of status polls for the retrieval at a capture time.
    pub fn polls_for(&self, capture_time: i64) -> usize {
        let state = self.state.lock().unwrap();
        let id = &state.ids[&capture_time];
        state.polls.iter().filter(|p| *p == id).count()
    }

    pub fn resolve(&self, capture_time: i64, update: RetrievalUpdate) {
        let mut state = self.state.lock().unwrap();
        let id = state.ids[&capture_time].clone();
        state.updates.insert(id, update);
    }

    pub fn fail_create(&self, capture_time: i64) {
        self.state.lock().unwrap().fail_create.insert(capture_time);
    }

    pub fn fail_poll(&self, capture_time: i64) {
        self.state.lock().unwrap().fail_poll.insert(capture_time);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_create.clear();
        state.fail_poll.clear();
    }
}

#[async_trait]
impl RetrievalApi for FakeRetrievalApi {
    async fn create_retrieval(
        &self,
        asset_id: &str,
        capture_time: i64,
    ) -> Result<RetrievalHandle, SamsaraError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create.contains(&capture_time) {
            return Err(SamsaraError::Status {
                status: 503,
                body: "camera offline".to_string(),
            });
        }
        state.next_id += 1;
        let id = format!("ret-{}", state.next_id);
        state.ids.insert(capture_time, id.clone());
        state.creates.push((asset_id.to_string(), capture_time));
        Ok(RetrievalHandle::new(id, asset_id, capture_time))
    }

    async fn get_retrieval(&self, retrieval_id: &str) -> Result<RetrievalUpdate, SamsaraError> {
        let mut state = self.state.lock().unwrap();
        state.polls.push(retrieval_id.to_string());

        let failing = state
            .ids
            .iter()
            .any(|(t, id)| id == retrieval_id && state.fail_poll.contains(t));
        if failing {
            return Err(SamsaraError::Status {
                status: 500,
                body: "internal error".to_string(),
            });
        }

        Ok(state
            .updates
            .get(retrieval_id)
            .cloned()
            .unwrap_or_else(queued))
    }
}

pub fn media(status: RetrievalStatus, url: Option<&str>) -> MediaItem {
    MediaItem {
        input: "dashcamRoadFacing".to_string(),
        media_type: "image".to_string(),
        status,
        url: url.map(str::to_string),
        url_expiry_time: None,
    }
}

pub fn queued() -> RetrievalUpdate {
    RetrievalUpdate {
        status: Some(RetrievalStatus::Queued),
        media: Some(vec![media(RetrievalStatus::Queued, None)]),
    }
}

pub fn available(url: &str) -> RetrievalUpdate {
    RetrievalUpdate {
        status: Some(RetrievalStatus::Available),
        media: Some(vec![media(RetrievalStatus::Available, Some(url))]),
    }
}

pub fn failed() -> RetrievalUpdate {
    RetrievalUpdate {
        status: Some(RetrievalStatus::Failed),
        media: Some(vec![media(RetrievalStatus::Failed, None)]),
    }
}

pub fn tracker() -> (RoundTracker, MemoryObjectStore, Arc<FakeRetrievalApi>) {
    let store = MemoryObjectStore::new();
    let api = FakeRetrievalApi::new();
    let tracker = RoundTracker::new(Arc::new(store.clone()), api.clone());
    (tracker, store, api)
}

#[derive(Debug, thiserror::Error)]
#[error("action failed")]
pub struct FakeActionError;

/// Records which rounds it ran for; can fail its first `fail_times` calls.
#[derive(Default)]
pub struct RecordingAction {
    calls: Mutex<Vec<String>>,
    fail_times: Mutex<usize>,
}

impl RecordingAction {
    pub fn failing(times: usize) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_times: Mutex::new(times),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TerminalAction for RecordingAction {
    type Error = FakeActionError;

    async fn on_available(&self, round: &Round) -> Result<Map<String, Value>, FakeActionError> {
        self.calls.lock().unwrap().push(round.key());

        let mut remaining = self.fail_times.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(FakeActionError);
        }

        let mut outcome = Map::new();
        outcome.insert("checked_handles".to_string(), json!(round.handles.len()));
        Ok(outcome)
    }
}
