//! Retrieval rounds: idempotent, resumable dashcam media retrieval.
//!
//! A round is started once per `(asset_id, event_time)` and requests one image
//! per configured offset. Retrievals are asynchronous on the Samsara side, so the
//! round is persisted and later sweeps poll it until every retrieval resolves.
//! Nothing is kept in memory between calls: starting and checking may happen in
//! different processes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::models::retrieval::{handle_key, RetrievalHandle, RetrievalUpdate};
use crate::models::round::{round_key, Round, RoundStatus};
use crate::services::samsara::SamsaraError;
use crate::store::{KvStore, ObjectStore, StoreError};

pub const ROUNDS_NAMESPACE: &str = "rounds";
pub const HANDLES_NAMESPACE: &str = "media_retrievals";
/// Index of rounds not yet done. Sweeps list this instead of every round ever stored.
pub const OPEN_ROUNDS_NAMESPACE: &str = "open_rounds";

/// Terminal action attempts before a round is completed with an error outcome.
pub const MAX_ACTION_ATTEMPTS: u32 = 3;

/// The asynchronous media retrieval API.
#[async_trait]
pub trait RetrievalApi: Send + Sync + 'static {
    /// Request an image captured at `capture_time` (epoch ms). Not idempotent.
    async fn create_retrieval(
        &self,
        asset_id: &str,
        capture_time: i64,
    ) -> Result<RetrievalHandle, SamsaraError>;

    /// Current state of a previously requested retrieval.
    async fn get_retrieval(&self, retrieval_id: &str) -> Result<RetrievalUpdate, SamsaraError>;
}

/// Work to run once per round after all of its retrievals resolved.
///
/// The returned fields are merged into the completed round's outcome.
#[async_trait]
pub trait TerminalAction: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn on_available(&self, round: &Round) -> Result<Map<String, Value>, Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginRound {
    Created(Round),
    /// A round already existed for the event; nothing was requested.
    Existing(Round),
}

impl BeginRound {
    pub fn created(&self) -> bool {
        matches!(self, BeginRound::Created(_))
    }

    pub fn round(&self) -> &Round {
        match self {
            BeginRound::Created(round) | BeginRound::Existing(round) => round,
        }
    }

    pub fn into_round(self) -> Round {
        match self {
            BeginRound::Created(round) | BeginRound::Existing(round) => round,
        }
    }
}

/// Counts from one [`RoundTracker::check`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub became_available: usize,
    /// Rounds found already available, left by an earlier failed action.
    pub resumed: usize,
    pub completed: usize,
    pub action_failures: usize,
    /// Rounds completed with an error outcome after [`MAX_ACTION_ATTEMPTS`] failures.
    pub abandoned: usize,
    pub conflicts: usize,
}

pub struct RoundTracker {
    rounds: KvStore,
    handles: KvStore,
    open: KvStore,
    retrievals: Arc<dyn RetrievalApi>,
    max_action_attempts: u32,
}

impl RoundTracker {
    pub fn new(backend: Arc<dyn ObjectStore>, retrievals: Arc<dyn RetrievalApi>) -> Self {
        Self {
            rounds: KvStore::new(ROUNDS_NAMESPACE, backend.clone()),
            handles: KvStore::new(HANDLES_NAMESPACE, backend.clone()),
            open: KvStore::new(OPEN_ROUNDS_NAMESPACE, backend),
            retrievals,
            max_action_attempts: MAX_ACTION_ATTEMPTS,
        }
    }

    pub fn with_max_action_attempts(mut self, attempts: u32) -> Self {
        self.max_action_attempts = attempts.max(1);
        self
    }

    /// Start the round for an event, or return the one that already exists.
    ///
    /// Each retrieval is persisted as soon as it is created, so a retry after a
    /// failure part-way through only requests the missing captures.
    pub async fn begin_round(
        &self,
        asset_id: &str,
        event_time: i64,
        offsets: &[i64],
    ) -> Result<BeginRound, RoundError> {
        let key = round_key(asset_id, event_time);
        if let Some(existing) = self.rounds.get::<Round>(&key).await? {
            tracing::debug!(round = %key, status = %existing.status, "Round already started");
            return Ok(BeginRound::Existing(existing));
        }

        let mut handles = Vec::with_capacity(offsets.len());
        for &offset in offsets {
            let capture_time = event_time
                .checked_add(offset)
                .ok_or(RoundError::CaptureTimeOverflow { event_time, offset })?;
            handles.push(self.get_or_create_handle(asset_id, capture_time).await?);
        }

        // Indexed first: a crash before the round write leaves a dangling entry,
        // never an unindexed round.
        self.open.set(&key, key.as_str()).await?;

        let round = Round::new(asset_id, event_time, handles);
        match self.persist_round(round, 0).await {
            Ok(round) => {
                metrics::counter!("rounds_started_total").increment(1);
                tracing::info!(
                    round = %key,
                    asset_id,
                    event_time,
                    captures = round.handles.len(),
                    "Round started"
                );
                Ok(BeginRound::Created(round))
            }
            // Another trigger for the same event won the race.
            Err(RoundError::Conflict { .. }) => match self.rounds.get::<Round>(&key).await? {
                Some(existing) => Ok(BeginRound::Existing(existing)),
                None => Err(RoundError::Conflict { key }),
            },
            Err(e) => Err(e),
        }
    }

    /// Stored retrieval for this capture, or a newly requested (and stored) one.
    pub async fn get_or_create_handle(
        &self,
        asset_id: &str,
        capture_time: i64,
    ) -> Result<RetrievalHandle, RoundError> {
        let key = handle_key(asset_id, capture_time);
        if let Some(handle) = self.handles.get::<RetrievalHandle>(&key).await? {
            tracing::debug!(handle = %key, retrieval_id = %handle.retrieval_id, "Reusing retrieval");
            return Ok(handle);
        }

        let handle = self
            .retrievals
            .create_retrieval(asset_id, capture_time)
            .await
            .map_err(RoundError::Retrieval)?;
        tracing::info!(
            handle = %key,
            retrieval_id = %handle.retrieval_id,
            "Requested media retrieval"
        );

        Ok(self.handles.set(&key, handle).await?)
    }

    /// Refresh every pending round. Returns the rounds that became available.
    ///
    /// A retrieval API failure only skips the affected round; store failures abort.
    pub async fn poll_all_pending(&self) -> Result<Vec<Round>, RoundError> {
        let mut became_available = Vec::new();
        for round in self.open_rounds().await? {
            if round.status != RoundStatus::Pending {
                continue;
            }

            let key = round.key();
            match self.refresh_round(round).await {
                Ok(round) if round.status == RoundStatus::Available => {
                    metrics::counter!("rounds_available_total").increment(1);
                    tracing::info!(round = %key, "Round available");
                    became_available.push(round);
                }
                Ok(_) => {}
                Err(RoundError::Retrieval(e)) => {
                    metrics::counter!("rounds_poll_failures_total").increment(1);
                    tracing::warn!(round = %key, error = %e, "Polling round failed, will retry");
                }
                Err(RoundError::Conflict { .. }) => {
                    tracing::warn!(round = %key, "Round updated concurrently, skipped");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(became_available)
    }

    /// Poll the unresolved retrievals of a round and store what was learned.
    ///
    /// Progress is persisted even if some polls failed; the first failure is then
    /// returned.
    pub async fn refresh_round(&self, round: Round) -> Result<Round, RoundError> {
        let loaded_version = round.version;
        let mut round = round;
        let mut first_error = None;

        for handle in round.handles.iter_mut().filter(|h| !h.is_resolved()) {
            match self.retrievals.get_retrieval(&handle.retrieval_id).await {
                Ok(update) => handle.merge(update),
                Err(e) => {
                    tracing::warn!(
                        retrieval_id = %handle.retrieval_id,
                        capture_time = handle.capture_time,
                        error = %e,
                        "Polling retrieval failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        round.recompute_status();
        let round = self.persist_round(round, loaded_version).await?;

        match first_error {
            Some(e) => Err(RoundError::Retrieval(e)),
            None => Ok(round),
        }
    }

    /// Mark an available round done, merging `outcome` into it, and drop it from
    /// the open index.
    ///
    /// Completing an already completed round returns the stored one unchanged.
    pub async fn complete_round(
        &self,
        round: Round,
        outcome: Map<String, Value>,
    ) -> Result<Round, RoundError> {
        let key = round.key();
        if let Some(stored) = self.rounds.get::<Round>(&key).await? {
            if stored.status == RoundStatus::Done {
                tracing::debug!(round = %key, "Round already done");
                self.open.delete(&key).await?;
                return Ok(stored);
            }
        }
        if round.status < RoundStatus::Available {
            return Err(RoundError::NotAvailable {
                key,
                status: round.status,
            });
        }

        let loaded_version = round.version;
        let mut round = round;
        round.outcome.extend(outcome);
        round.advance(RoundStatus::Done);

        let round = self.persist_round(round, loaded_version).await?;
        self.open.delete(&key).await?;
        metrics::counter!("rounds_completed_total").increment(1);
        tracing::info!(round = %key, "Round done");
        Ok(round)
    }

    /// One "check" sweep: poll pending rounds, then run `action` on every
    /// available round and complete it.
    ///
    /// A failing action leaves its round available for the next sweep, up to the
    /// attempt limit; after that the round is completed with an `error` outcome.
    ///
    /// Actions run at least once: if completing fails after the action succeeded,
    /// the next sweep runs it again. Actions with external side effects must
    /// guard them (see `SlugBugAction`, which records its outcome).
    pub async fn check<A: TerminalAction>(&self, action: &A) -> Result<CheckSummary, RoundError> {
        let started = Instant::now();
        let mut summary = CheckSummary::default();

        let mut ready = self.poll_all_pending().await?;
        summary.became_available = ready.len();

        for round in self.open_rounds().await? {
            if round.status == RoundStatus::Available && !ready.iter().any(|r| r.key() == round.key()) {
                summary.resumed += 1;
                ready.push(round);
            }
        }

        for round in ready {
            let key = round.key();
            let outcome = match action.on_available(&round).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    metrics::counter!("rounds_action_failures_total").increment(1);
                    summary.action_failures += 1;
                    match self.record_action_failure(round, &e.to_string()).await {
                        Ok(Some(_)) => summary.abandoned += 1,
                        Ok(None) => {
                            tracing::error!(round = %key, error = %e, "Round action failed, will retry");
                        }
                        Err(RoundError::Conflict { .. }) => summary.conflicts += 1,
                        Err(err) => return Err(err),
                    }
                    continue;
                }
            };

            match self.complete_round(round, outcome).await {
                Ok(_) => summary.completed += 1,
                Err(RoundError::Conflict { .. }) => {
                    tracing::warn!(round = %key, "Round updated concurrently while completing");
                    summary.conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        metrics::histogram!("round_check_seconds").record(started.elapsed().as_secs_f64());
        Ok(summary)
    }

    pub async fn round(&self, asset_id: &str, event_time: i64) -> Result<Option<Round>, RoundError> {
        Ok(self.rounds.get(&round_key(asset_id, event_time)).await?)
    }

    /// Every stored round, done ones included.
    pub async fn rounds(&self) -> Result<Vec<Round>, RoundError> {
        let mut keys = self.rounds.list_keys().await?;
        keys.sort();

        let mut rounds = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(round) = self.load_listed(&key).await? {
                rounds.push(round);
            }
        }
        Ok(rounds)
    }

    /// Rounds in the open index (pending or available).
    ///
    /// Index entries of rounds found done are removed; entries without a round
    /// (a start that failed before writing it) are skipped.
    pub async fn open_rounds(&self) -> Result<Vec<Round>, RoundError> {
        let mut keys = self.open.list_keys().await?;
        keys.sort();

        let mut rounds = Vec::with_capacity(keys.len());
        for key in keys {
            match self.load_listed(&key).await? {
                Some(round) if round.status == RoundStatus::Done => {
                    tracing::debug!(round = %key, "Dropping done round from open index");
                    self.open.delete(&key).await?;
                }
                Some(round) => rounds.push(round),
                None => {}
            }
        }
        Ok(rounds)
    }

    pub async fn rounds_with_status(&self, status: RoundStatus) -> Result<Vec<Round>, RoundError> {
        let mut rounds = self.rounds().await?;
        rounds.retain(|r| r.status == status);
        Ok(rounds)
    }

    /// Load a round found by listing. A document that does not parse is logged,
    /// counted and skipped so it cannot block the other rounds; I/O faults abort.
    async fn load_listed(&self, key: &str) -> Result<Option<Round>, RoundError> {
        match self.rounds.get::<Round>(key).await {
            Ok(round) => Ok(round),
            Err(StoreError::Json(e)) => {
                metrics::counter!("rounds_poll_failures_total").increment(1);
                tracing::warn!(round = %key, error = %e, "Unreadable round document, skipped");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Count a failed terminal action. Returns the round completed with an
    /// `error` outcome once the attempt limit is reached.
    async fn record_action_failure(
        &self,
        round: Round,
        error: &str,
    ) -> Result<Option<Round>, RoundError> {
        let key = round.key();
        let loaded_version = round.version;
        let mut round = round;
        round.action_attempts += 1;
        let attempts = round.action_attempts;

        if attempts < self.max_action_attempts {
            self.persist_round(round, loaded_version).await?;
            return Ok(None);
        }

        metrics::counter!("rounds_abandoned_total").increment(1);
        tracing::error!(round = %key, attempts, error, "Round action keeps failing, giving up");

        let mut outcome = Map::new();
        outcome.insert("error".into(), json!(error));
        outcome.insert("attempts".into(), json!(attempts));
        Ok(Some(self.complete_round(round, outcome).await?))
    }

    /// Write a round unless the stored copy moved on since it was loaded at
    /// `loaded_version`. Not atomic: it narrows, not closes, the lost-update window.
    async fn persist_round(&self, round: Round, loaded_version: u64) -> Result<Round, RoundError> {
        let key = round.key();
        if let Some(stored) = self.rounds.get::<Round>(&key).await? {
            if stored.version != loaded_version || stored.status > round.status {
                tracing::warn!(
                    round = %key,
                    loaded_version,
                    stored_version = stored.version,
                    stored_status = %stored.status,
                    "Round changed since it was loaded, not writing"
                );
                return Err(RoundError::Conflict { key });
            }
        }

        let mut round = round;
        round.version = loaded_version + 1;
        round.updated_at = Utc::now();
        Ok(self.rounds.set(&key, round).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Retrieval API call failed: {0}")]
    Retrieval(#[source] SamsaraError),

    #[error("Round {key} was modified concurrently")]
    Conflict { key: String },

    #[error("Round {key} is {status}, not available")]
    NotAvailable { key: String, status: RoundStatus },

    #[error("Capture time overflows: event_time={event_time}, offset={offset}")]
    CaptureTimeOverflow { event_time: i64, offset: i64 },
}
