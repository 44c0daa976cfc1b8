use std::sync::Arc;

use crate::services::rounds::RoundTracker;
use crate::store::ObjectStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub tracker: Arc<RoundTracker>,
    pub capture_offsets_ms: Arc<Vec<i64>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tracker: RoundTracker,
        capture_offsets_ms: Vec<i64>,
    ) -> Self {
        Self {
            store,
            tracker: Arc::new(tracker),
            capture_offsets_ms: Arc::new(capture_offsets_ms),
        }
    }
}
