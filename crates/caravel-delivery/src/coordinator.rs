//! Download coordination: concurrency gate, cooldown, hourly quota, and
//! attempt bookkeeping.
//!
//! The active table and the record history are one shared state, mutated
//! together under a single lock; there is no finer-grained locking to get
//! out of sync. `reserve` happens-before `update_progress` and `complete`
//! for the same attempt, and `complete` runs exactly once per successful
//! `reserve`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use caravel_audit::{AuditEvent, AuditSink};
use caravel_core::{Clock, ModuleId, SecurityConfig};

use crate::error::CoordinatorError;

/// Fresh unique token identifying one download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(Uuid);

impl AttemptId {
    fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID (used to derive per-attempt scratch paths).
    #[must_use]
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEndReason {
    /// The module installed successfully.
    Success,
    /// The attempt was cancelled.
    Cancelled,
    /// Connectivity was lost or absent.
    NoInternet,
    /// The transport timed out.
    Timeout,
    /// The server answered with a non-2xx status.
    ServerError(Option<u16>),
    /// The archive checksum did not match the manifest.
    ChecksumMismatch,
    /// The installed tree failed its integrity check.
    IntegrityFailed,
    /// Any other failure.
    Unknown,
}

impl DownloadEndReason {
    /// Whether this reason counts as a success.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// An in-flight download attempt.
#[derive(Debug, Clone)]
pub struct DownloadAttempt {
    /// Module being downloaded.
    pub module_id: ModuleId,
    /// The attempt token handed out by `reserve`.
    pub attempt_id: AttemptId,
    /// When the slot was granted.
    pub started_at: DateTime<Utc>,
    /// Last progress update.
    pub last_updated_at: DateTime<Utc>,
    /// Bytes received so far.
    pub bytes_received: u64,
    /// Expected total, when the server declared one.
    pub expected_bytes: Option<u64>,
}

/// A completed attempt, kept in the bounded history ring.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    /// Module that was downloaded.
    pub module_id: ModuleId,
    /// The attempt token.
    pub attempt_id: AttemptId,
    /// When the slot was granted.
    pub started_at: DateTime<Utc>,
    /// When the attempt completed.
    pub finished_at: DateTime<Utc>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Why the attempt ended.
    pub end_reason: DownloadEndReason,
    /// Bytes downloaded before termination.
    pub bytes_downloaded: u64,
    /// Expected total, when known.
    pub expected_bytes: Option<u64>,
}

/// Aggregate statistics over active attempts and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadStats {
    /// Currently active attempts.
    pub active: usize,
    /// Completed attempts in history.
    pub total: usize,
    /// Successful completions.
    pub succeeded: usize,
    /// Failed completions.
    pub failed: usize,
    /// Bytes across history and active attempts.
    pub total_bytes: u64,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    active: HashMap<ModuleId, DownloadAttempt>,
    history: VecDeque<DownloadRecord>,
}

/// Serialized download admission and bookkeeping.
#[derive(Debug)]
pub struct DownloadCoordinator {
    state: Mutex<CoordinatorState>,
    max_concurrent: usize,
    cooldown: Duration,
    max_per_hour: usize,
    max_history: usize,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl DownloadCoordinator {
    /// Build a coordinator from configuration.
    #[must_use]
    pub fn new(config: &SecurityConfig, clock: Arc<dyn Clock>, audit: AuditSink) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            max_concurrent: config.downloads.max_concurrent,
            cooldown: Duration::seconds(config.downloads.cooldown_secs as i64),
            max_per_hour: config.downloads.max_per_hour,
            max_history: config.downloads.max_history,
            clock,
            audit,
        }
    }

    /// Reserve a download slot for `module_id`.
    ///
    /// Policy gates, in order: global concurrency, per-module exclusivity,
    /// per-module cooldown, rolling hourly quota.
    ///
    /// # Errors
    ///
    /// Returns the [`CoordinatorError`] for the first gate that refused.
    pub async fn reserve(&self, module_id: &ModuleId) -> Result<AttemptId, CoordinatorError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if state.active.len() >= self.max_concurrent {
            return Err(CoordinatorError::TooManyConcurrentDownloads {
                limit: self.max_concurrent,
            });
        }

        if state.active.contains_key(module_id) {
            return Err(CoordinatorError::DownloadAlreadyInProgress(
                module_id.clone(),
            ));
        }

        if let Some(last_finished) = state
            .history
            .iter()
            .filter(|r| &r.module_id == module_id)
            .map(|r| r.finished_at)
            .max()
        {
            let elapsed = now.signed_duration_since(last_finished);
            if elapsed < self.cooldown {
                let retry_after = (self.cooldown - elapsed)
                    .to_std()
                    .unwrap_or(StdDuration::ZERO);
                warn!(%module_id, ?retry_after, "download refused by cooldown");
                self.audit.emit(AuditEvent::RateLimitExceeded {
                    module_id: module_id.clone(),
                    retry_after,
                });
                return Err(CoordinatorError::RateLimitExceeded { retry_after });
            }
        }

        let hour_ago = now - Duration::hours(1);
        let recent = state
            .history
            .iter()
            .filter(|r| r.finished_at >= hour_ago)
            .count();
        if recent >= self.max_per_hour {
            return Err(CoordinatorError::DownloadQuotaExceeded {
                limit: self.max_per_hour,
            });
        }

        let attempt_id = AttemptId::fresh();
        state.active.insert(
            module_id.clone(),
            DownloadAttempt {
                module_id: module_id.clone(),
                attempt_id,
                started_at: now,
                last_updated_at: now,
                bytes_received: 0,
                expected_bytes: None,
            },
        );
        debug!(%module_id, %attempt_id, "download slot reserved");
        Ok(attempt_id)
    }

    /// Record download progress. Stale tuples (wrong attempt id) are ignored.
    pub async fn update_progress(
        &self,
        module_id: &ModuleId,
        attempt_id: AttemptId,
        bytes_received: u64,
        expected_bytes: Option<u64>,
    ) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if let Some(attempt) = state.active.get_mut(module_id)
            && attempt.attempt_id == attempt_id
        {
            attempt.bytes_received = bytes_received;
            if expected_bytes.is_some() {
                attempt.expected_bytes = expected_bytes;
            }
            attempt.last_updated_at = now;
        }
    }

    /// Complete an attempt and append its record to history.
    ///
    /// If the active entry is already gone, `started_at` is recovered from a
    /// prior record with matching ids; a duplicate complete for an attempt
    /// already in history is ignored.
    pub async fn complete(
        &self,
        module_id: &ModuleId,
        attempt_id: AttemptId,
        end_reason: DownloadEndReason,
        bytes_downloaded: u64,
        expected_bytes: Option<u64>,
    ) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let ids_match = state
            .active
            .get(module_id)
            .is_some_and(|a| a.attempt_id == attempt_id);
        let removed = if ids_match {
            state.active.remove(module_id)
        } else {
            None
        };
        let started_at = match removed {
            Some(attempt) => attempt.started_at,
            None => {
                let already_recorded = state
                    .history
                    .iter()
                    .any(|r| &r.module_id == module_id && r.attempt_id == attempt_id);
                if already_recorded {
                    warn!(%module_id, %attempt_id, "duplicate complete ignored");
                    return;
                }
                now
            }
        };

        state.history.push_back(DownloadRecord {
            module_id: module_id.clone(),
            attempt_id,
            started_at,
            finished_at: now,
            success: end_reason.is_success(),
            end_reason,
            bytes_downloaded,
            expected_bytes,
        });
        while state.history.len() > self.max_history {
            state.history.pop_front();
        }
        debug!(%module_id, %attempt_id, ?end_reason, "download completed");
    }

    /// Aggregate statistics over history and active attempts.
    pub async fn statistics(&self) -> DownloadStats {
        let state = self.state.lock().await;
        let succeeded = state.history.iter().filter(|r| r.success).count();
        let total = state.history.len();
        let total_bytes = state
            .history
            .iter()
            .map(|r| r.bytes_downloaded)
            .chain(state.active.values().map(|a| a.bytes_received))
            .sum();
        DownloadStats {
            active: state.active.len(),
            total,
            succeeded,
            failed: total - succeeded,
            total_bytes,
        }
    }

    /// Modules with an active attempt.
    pub async fn active_ids(&self) -> Vec<ModuleId> {
        let state = self.state.lock().await;
        state.active.keys().cloned().collect()
    }

    /// Snapshot of the record history, oldest first.
    pub async fn history(&self) -> Vec<DownloadRecord> {
        let state = self.state.lock().await;
        state.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::ManualClock;

    use super::*;

    fn coordinator(clock: Arc<ManualClock>) -> DownloadCoordinator {
        let (audit, _) = AuditSink::memory();
        DownloadCoordinator::new(&SecurityConfig::default(), clock, audit)
    }

    fn module(name: &str) -> ModuleId {
        ModuleId::new(name).unwrap()
    }

    #[tokio::test]
    async fn reserve_complete_round_trip() {
        let clock = ManualClock::arc();
        let coordinator = coordinator(clock.clone());
        let id = module("feature-a");

        let attempt = coordinator.reserve(&id).await.unwrap();
        coordinator
            .update_progress(&id, attempt, 512, Some(1024))
            .await;
        coordinator
            .complete(&id, attempt, DownloadEndReason::Success, 1024, Some(1024))
            .await;

        let stats = coordinator.statistics().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total_bytes, 1024);

        let history = coordinator.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempt_id, attempt);
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn concurrency_gate_rejects_fourth_attempt() {
        let clock = ManualClock::arc();
        let coordinator = coordinator(clock);

        for name in ["feature-a", "feature-b", "feature-c"] {
            coordinator.reserve(&module(name)).await.unwrap();
        }
        let err = coordinator.reserve(&module("feature-d")).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::TooManyConcurrentDownloads { limit: 3 }
        ));
    }

    #[tokio::test]
    async fn duplicate_module_rejected_while_active() {
        let clock = ManualClock::arc();
        let coordinator = coordinator(clock);
        let id = module("feature-a");

        coordinator.reserve(&id).await.unwrap();
        let err = coordinator.reserve(&id).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::DownloadAlreadyInProgress(ref m) if m == &id
        ));
    }

    #[tokio::test]
    async fn cooldown_applies_after_completion() {
        let clock = ManualClock::arc();
        let coordinator = coordinator(clock.clone());
        let id = module("feature-a");

        let attempt = coordinator.reserve(&id).await.unwrap();
        coordinator
            .complete(&id, attempt, DownloadEndReason::Unknown, 0, None)
            .await;

        clock.advance(Duration::seconds(2));
        let err = coordinator.reserve(&id).await.unwrap_err();
        match err {
            CoordinatorError::RateLimitExceeded { retry_after } => {
                assert_eq!(retry_after, StdDuration::from_secs(3));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        // A different module is unaffected by this module's cooldown.
        coordinator.reserve(&module("feature-b")).await.unwrap();

        clock.advance(Duration::seconds(3));
        coordinator.reserve(&id).await.unwrap();
    }

    #[tokio::test]
    async fn hourly_quota_enforced() {
        let clock = ManualClock::arc();
        let coordinator = coordinator(clock.clone());

        // Fill the quota with completions spread over the last hour.
        for i in 0..20 {
            let id = module(&format!("feature-{i}"));
            let attempt = coordinator.reserve(&id).await.unwrap();
            coordinator
                .complete(&id, attempt, DownloadEndReason::Unknown, 0, None)
                .await;
            clock.advance(Duration::seconds(30));
        }

        let err = coordinator.reserve(&module("feature-next")).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::DownloadQuotaExceeded { limit: 20 }
        ));

        // Once the oldest records age out of the rolling hour, slots free up.
        clock.advance(Duration::minutes(55));
        coordinator.reserve(&module("feature-next")).await.unwrap();
    }

    #[tokio::test]
    async fn stale_progress_updates_ignored() {
        let clock = ManualClock::arc();
        let coordinator = coordinator(clock.clone());
        let id = module("feature-a");

        let first = coordinator.reserve(&id).await.unwrap();
        coordinator
            .complete(&id, first, DownloadEndReason::Unknown, 0, None)
            .await;
        clock.advance(Duration::seconds(10));

        let second = coordinator.reserve(&id).await.unwrap();
        // Progress carrying the dead attempt id must not touch the new one.
        coordinator.update_progress(&id, first, 999, None).await;

        let state = coordinator.state.lock().await;
        let active = state.active.get(&id).unwrap();
        assert_eq!(active.attempt_id, second);
        assert_eq!(active.bytes_received, 0);
    }

    #[tokio::test]
    async fn duplicate_complete_keeps_single_record() {
        let clock = ManualClock::arc();
        let coordinator = coordinator(clock);
        let id = module("feature-a");

        let attempt = coordinator.reserve(&id).await.unwrap();
        coordinator
            .complete(&id, attempt, DownloadEndReason::Success, 10, None)
            .await;
        coordinator
            .complete(&id, attempt, DownloadEndReason::Unknown, 10, None)
            .await;

        let history = coordinator.history().await;
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let clock = ManualClock::arc();
        let mut config = SecurityConfig::default();
        config.downloads.max_history = 5;
        config.downloads.cooldown_secs = 0;
        config.downloads.max_per_hour = 1000;
        let (audit, _) = AuditSink::memory();
        let coordinator = DownloadCoordinator::new(&config, clock.clone(), audit);

        for i in 0..8 {
            let id = module(&format!("feature-{i}"));
            let attempt = coordinator.reserve(&id).await.unwrap();
            coordinator
                .complete(&id, attempt, DownloadEndReason::Success, 1, None)
                .await;
            clock.advance(Duration::seconds(1));
        }

        let history = coordinator.history().await;
        assert_eq!(history.len(), 5);
        // Oldest records were evicted.
        assert_eq!(history[0].module_id, module("feature-3"));
    }

    #[tokio::test]
    async fn rate_limit_emits_audit_event() {
        let clock = ManualClock::arc();
        let (audit, handle) = AuditSink::memory();
        let coordinator =
            DownloadCoordinator::new(&SecurityConfig::default(), clock.clone(), audit.clone());
        let id = module("feature-a");

        let attempt = coordinator.reserve(&id).await.unwrap();
        coordinator
            .complete(&id, attempt, DownloadEndReason::Unknown, 0, None)
            .await;
        let _ = coordinator.reserve(&id).await;

        audit.flush().await;
        assert!(handle.contains_kind("rate_limit_exceeded"));
    }
}
