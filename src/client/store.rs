//! Client-side cache of the latest usage snapshot per action type
//!
//! All mutations go through [`reduce`] under a single lock. Snapshots are
//! ordered by the server's own history: quota windows only move forward and
//! counters only grow inside a window, so a snapshot behind the applied one
//! is dropped whatever order the responses arrive in. Errors are ordered by
//! per-action request tickets. Concurrent checks for the same action share
//! one in-flight request.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::api::{ApiError, UsageApi};
use crate::rpc::UsagePayload;
use crate::tier::{ActionType, Limit, Tier, UsageStatus};

pub const LIMIT_REACHED_MESSAGE: &str = "Usage limit reached";

/// The client's view of one action type's quota
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUsageStatus {
    pub tier: Tier,
    pub limit: Limit,
    pub used: u32,
    pub remaining: Limit,
    pub limit_reached: bool,
    pub unlimited: bool,
    pub loading: bool,
    pub error: Option<String>,
    /// `error` holds the server's refusal of an increment
    pub rejected: bool,
}

impl Default for ClientUsageStatus {
    fn default() -> Self {
        Self {
            tier: Tier::Free,
            limit: Limit::Bounded(0),
            used: 0,
            remaining: Limit::Bounded(0),
            limit_reached: false,
            unlimited: false,
            loading: true,
            error: None,
            rejected: false,
        }
    }
}

impl ClientUsageStatus {
    fn apply_snapshot(&mut self, snapshot: &UsageStatus) {
        self.tier = snapshot.tier;
        self.limit = snapshot.limit;
        self.used = snapshot.used;
        self.remaining = snapshot.remaining;
        self.limit_reached = snapshot.limit_reached;
        self.unlimited = snapshot.unlimited;
    }

    fn set_error(&mut self, message: Option<String>, rejected: bool) {
        self.error = message;
        self.rejected = rejected;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UsageEvent {
    CheckStarted,
    CheckSucceeded(UsagePayload),
    CheckFailed(String),
    IncrementSucceeded(UsagePayload),
    IncrementRejected(String),
    IncrementFailed(String),
}

impl UsageEvent {
    fn ends_check(&self) -> bool {
        matches!(
            self,
            UsageEvent::CheckSucceeded(_) | UsageEvent::CheckFailed(_)
        )
    }
}

/// Where a snapshot sits in the server's history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    resets_at: Option<DateTime<Utc>>,
    used: u32,
}

impl Position {
    fn of(payload: &UsagePayload) -> Self {
        Self {
            resets_at: payload.resets_at,
            used: payload.status.used,
        }
    }

    fn is_behind(&self, current: &Position) -> bool {
        match (self.resets_at, current.resets_at) {
            (Some(window), Some(current_window)) if window != current_window => {
                window < current_window
            }
            _ => self.used < current.used,
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    status: ClientUsageStatus,
    issued: u64,
    applied: u64,
    position: Option<Position>,
    check_in_flight: bool,
}

fn reduce(entry: &mut Entry, ticket: u64, event: UsageEvent) {
    if event == UsageEvent::CheckStarted {
        entry.check_in_flight = true;
        entry.status.loading = true;
        entry.status.set_error(None, false);
        return;
    }

    if event.ends_check() {
        entry.check_in_flight = false;
    }
    entry.status.loading = entry.check_in_flight;

    let newest = ticket >= entry.applied;
    entry.applied = entry.applied.max(ticket);

    match event {
        UsageEvent::CheckStarted => {}
        UsageEvent::CheckSucceeded(payload) | UsageEvent::IncrementSucceeded(payload) => {
            let position = Position::of(&payload);
            match entry.position {
                Some(current) if position.is_behind(&current) => {
                    tracing::debug!(
                        used = position.used,
                        applied_used = current.used,
                        "Dropping stale usage snapshot"
                    );
                }
                _ => {
                    entry.position = Some(position);
                    entry.status.apply_snapshot(&payload.status);
                }
            }
            if newest {
                entry.status.set_error(None, false);
            }
        }
        UsageEvent::IncrementRejected(message) if newest => {
            entry.status.limit_reached = true;
            entry.status.set_error(Some(message), true);
        }
        UsageEvent::CheckFailed(message) | UsageEvent::IncrementFailed(message) if newest => {
            entry.status.set_error(Some(message), false);
        }
        _ => {
            tracing::debug!(ticket, applied = entry.applied, "Dropping stale usage error");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncrementOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<UsagePayload>,
}

type SharedCheck = Shared<BoxFuture<'static, Option<UsagePayload>>>;

struct Inner {
    api: Arc<dyn UsageApi>,
    entries: Mutex<HashMap<ActionType, Entry>>,
    in_flight: Mutex<HashMap<ActionType, SharedCheck>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn issue_ticket(&self, action: ActionType) -> u64 {
        let mut entries = lock(&self.entries);
        let entry = entries.entry(action).or_default();
        entry.issued += 1;
        entry.issued
    }

    fn dispatch(&self, action: ActionType, ticket: u64, event: UsageEvent) {
        let mut entries = lock(&self.entries);
        reduce(entries.entry(action).or_default(), ticket, event);
    }
}

/// Process-wide usage state shared by every consumer of an action type
#[derive(Clone)]
pub struct UsageLimitsStore {
    inner: Arc<Inner>,
}

impl UsageLimitsStore {
    pub fn new(api: Arc<dyn UsageApi>) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                entries: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn get_status(&self, action: ActionType) -> ClientUsageStatus {
        lock(&self.inner.entries)
            .get(&action)
            .map(|entry| entry.status.clone())
            .unwrap_or_default()
    }

    pub async fn check_usage(&self, action: ActionType) -> Option<UsagePayload> {
        let request = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(&action) {
                Some(existing) => {
                    tracing::debug!(action = %action, "Joining in-flight usage check");
                    existing.clone()
                }
                None => {
                    let ticket = self.inner.issue_ticket(action);
                    self.inner
                        .dispatch(action, ticket, UsageEvent::CheckStarted);

                    let inner = Arc::clone(&self.inner);
                    let request = async move {
                        let result = match inner.api.check(action).await {
                            Ok(payload) => {
                                inner.dispatch(
                                    action,
                                    ticket,
                                    UsageEvent::CheckSucceeded(payload.clone()),
                                );
                                Some(payload)
                            }
                            Err(e) => {
                                tracing::warn!(action = %action, "Usage check failed: {}", e);
                                inner.dispatch(action, ticket, UsageEvent::CheckFailed(e.to_string()));
                                None
                            }
                        };
                        lock(&inner.in_flight).remove(&action);
                        result
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(action, request.clone());
                    request
                }
            }
        };

        request.await
    }

    pub async fn increment_usage(&self, action: ActionType) -> IncrementOutcome {
        let ticket = self.inner.issue_ticket(action);

        match self.inner.api.increment(action).await {
            Ok(payload) => {
                self.inner.dispatch(
                    action,
                    ticket,
                    UsageEvent::IncrementSucceeded(payload.clone()),
                );
                IncrementOutcome {
                    success: true,
                    error: None,
                    data: Some(payload),
                }
            }
            Err(ApiError::LimitReached(message)) => {
                tracing::info!(action = %action, "Usage limit reached: {}", message);
                self.inner
                    .dispatch(action, ticket, UsageEvent::IncrementRejected(message));
                IncrementOutcome {
                    success: false,
                    error: Some(LIMIT_REACHED_MESSAGE.to_string()),
                    data: None,
                }
            }
            Err(e) => {
                tracing::warn!(action = %action, "Usage increment failed: {}", e);
                let message = e.to_string();
                self.inner
                    .dispatch(action, ticket, UsageEvent::IncrementFailed(message.clone()));
                IncrementOutcome {
                    success: false,
                    error: Some(message),
                    data: None,
                }
            }
        }
    }

    /// Re-sync after something outside the client changed the quota
    pub async fn refresh(&self, action: ActionType) -> Option<UsagePayload> {
        self.check_usage(action).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    pub(crate) enum Scripted {
        Ok(UsageStatus),
        LimitReached(String),
        Fail(String),
    }

    /// Replays queued responses, each after an optional delay
    #[derive(Default)]
    pub(crate) struct ScriptedApi {
        pub checks: Mutex<VecDeque<(u64, Scripted)>>,
        pub increments: Mutex<VecDeque<(u64, Scripted)>>,
        pub check_calls: AtomicUsize,
        pub increment_calls: AtomicUsize,
    }

    impl ScriptedApi {
        pub fn with_checks(self, items: Vec<(u64, Scripted)>) -> Self {
            *lock(&self.checks) = items.into();
            self
        }

        pub fn with_increments(self, items: Vec<(u64, Scripted)>) -> Self {
            *lock(&self.increments) = items.into();
            self
        }

        async fn replay(queue: &Mutex<VecDeque<(u64, Scripted)>>) -> Result<UsagePayload, ApiError> {
            let next = lock(queue).pop_front();
            let (delay_ms, response) =
                next.unwrap_or_else(|| (0, Scripted::Fail("no scripted response".to_string())));
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            match response {
                Scripted::Ok(status) => Ok(UsagePayload {
                    status,
                    resets_at: None,
                }),
                Scripted::LimitReached(message) => Err(ApiError::LimitReached(message)),
                Scripted::Fail(message) => Err(ApiError::Status {
                    status: 500,
                    message,
                }),
            }
        }
    }

    #[async_trait]
    impl UsageApi for ScriptedApi {
        async fn check(&self, _action: ActionType) -> Result<UsagePayload, ApiError> {
            self.check_calls.fetch_add(1, Ordering::SeqCst);
            Self::replay(&self.checks).await
        }

        async fn increment(&self, _action: ActionType) -> Result<UsagePayload, ApiError> {
            self.increment_calls.fetch_add(1, Ordering::SeqCst);
            Self::replay(&self.increments).await
        }
    }

    pub(crate) fn free(used: u32) -> UsageStatus {
        UsageStatus::derive(Tier::Free, Limit::Bounded(5), used)
    }

    fn snapshot(used: u32) -> UsagePayload {
        UsagePayload {
            status: free(used),
            resets_at: None,
        }
    }

    fn snapshot_in(used: u32, resets_at: DateTime<Utc>) -> UsagePayload {
        UsagePayload {
            status: free(used),
            resets_at: Some(resets_at),
        }
    }

    const ACTION: ActionType = ActionType::Conversion;

    #[test]
    fn test_default_status_is_loading() {
        let status = ClientUsageStatus::default();
        assert!(status.loading);
        assert_eq!(status.tier, Tier::Free);
        assert_eq!(status.limit, Limit::Bounded(0));
        assert!(!status.limit_reached);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_reduce_failure_keeps_numbers() {
        let mut entry = Entry::default();
        reduce(&mut entry, 1, UsageEvent::CheckStarted);
        reduce(&mut entry, 1, UsageEvent::CheckSucceeded(snapshot(3)));
        reduce(&mut entry, 2, UsageEvent::CheckStarted);
        reduce(&mut entry, 2, UsageEvent::CheckFailed("boom".to_string()));

        assert_eq!(entry.status.used, 3);
        assert_eq!(entry.status.remaining, Limit::Bounded(2));
        assert!(!entry.status.loading);
        assert_eq!(entry.status.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_reduce_drops_stale_snapshot() {
        let mut entry = Entry::default();
        reduce(&mut entry, 2, UsageEvent::IncrementSucceeded(snapshot(2)));
        reduce(&mut entry, 1, UsageEvent::IncrementSucceeded(snapshot(1)));
        assert_eq!(entry.status.used, 2);
    }

    #[test]
    fn test_reduce_orders_by_server_count_not_ticket() {
        let mut entry = Entry::default();
        reduce(&mut entry, 2, UsageEvent::IncrementSucceeded(snapshot(1)));
        reduce(&mut entry, 1, UsageEvent::IncrementSucceeded(snapshot(2)));
        assert_eq!(entry.status.used, 2);
        assert_eq!(entry.status.remaining, Limit::Bounded(3));
    }

    #[test]
    fn test_reduce_new_window_resets_count() {
        let today = Utc::now();
        let tomorrow = today + chrono::Duration::days(1);
        let mut entry = Entry::default();
        reduce(&mut entry, 1, UsageEvent::CheckSucceeded(snapshot_in(5, today)));
        reduce(&mut entry, 2, UsageEvent::CheckSucceeded(snapshot_in(0, tomorrow)));
        assert_eq!(entry.status.used, 0);
        assert!(!entry.status.limit_reached);

        // a late reply from the previous window is ignored
        reduce(&mut entry, 3, UsageEvent::IncrementSucceeded(snapshot_in(4, today)));
        assert_eq!(entry.status.used, 0);
    }

    #[test]
    fn test_reduce_stale_error_does_not_replace_newer_reply() {
        let mut entry = Entry::default();
        reduce(&mut entry, 2, UsageEvent::IncrementSucceeded(snapshot(3)));
        reduce(&mut entry, 1, UsageEvent::IncrementFailed("timed out".to_string()));
        assert!(entry.status.error.is_none());
        assert_eq!(entry.status.used, 3);
    }

    #[test]
    fn test_reduce_rejection_marks_limit_reached() {
        let mut entry = Entry::default();
        reduce(&mut entry, 1, UsageEvent::CheckSucceeded(snapshot(4)));
        reduce(
            &mut entry,
            2,
            UsageEvent::IncrementRejected("Daily conversion limit reached".to_string()),
        );
        assert!(entry.status.limit_reached);
        assert!(entry.status.rejected);
        assert_eq!(entry.status.used, 4);
        assert!(entry.status.error.unwrap().contains("limit reached"));
    }

    #[tokio::test]
    async fn test_check_stores_snapshot() {
        let api = ScriptedApi::default().with_checks(vec![(0, Scripted::Ok(free(2)))]);
        let store = UsageLimitsStore::new(Arc::new(api));

        assert!(store.get_status(ACTION).loading);
        let payload = store.check_usage(ACTION).await.unwrap();
        assert_eq!(payload.status.used, 2);

        let status = store.get_status(ACTION);
        assert!(!status.loading);
        assert_eq!(status.used, 2);
        assert_eq!(status.remaining, Limit::Bounded(3));
    }

    #[tokio::test]
    async fn test_check_failure_returns_none() {
        let api = ScriptedApi::default().with_checks(vec![(0, Scripted::Fail("down".to_string()))]);
        let store = UsageLimitsStore::new(Arc::new(api));

        assert!(store.check_usage(ACTION).await.is_none());
        let status = store.get_status(ACTION);
        assert!(!status.loading);
        assert!(status.error.unwrap().contains("down"));
    }

    #[tokio::test]
    async fn test_concurrent_checks_share_one_request() {
        let api = Arc::new(
            ScriptedApi::default().with_checks(vec![(50, Scripted::Ok(free(1)))]),
        );
        let store = UsageLimitsStore::new(api.clone());

        let (a, b) = tokio::join!(store.check_usage(ACTION), store.check_usage(ACTION));
        assert_eq!(a.unwrap().status.used, 1);
        assert_eq!(b.unwrap().status.used, 1);
        assert_eq!(api.check_calls.load(Ordering::SeqCst), 1);

        // a finished check does not block the next one
        lock(&api.checks).push_back((0, Scripted::Ok(free(1))));
        store.refresh(ACTION).await.unwrap();
        assert_eq!(api.check_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_increment_scenario_reaching_limit() {
        let api = ScriptedApi::default()
            .with_checks(vec![(0, Scripted::Ok(free(4)))])
            .with_increments(vec![(0, Scripted::Ok(free(5)))]);
        let store = UsageLimitsStore::new(Arc::new(api));

        store.check_usage(ACTION).await.unwrap();
        let outcome = store.increment_usage(ACTION).await;
        assert!(outcome.success);

        let status = store.get_status(ACTION);
        assert_eq!(status.used, 5);
        assert_eq!(status.remaining, Limit::Bounded(0));
        assert!(status.limit_reached);
    }

    #[tokio::test]
    async fn test_increment_rejected() {
        let api = ScriptedApi::default()
            .with_checks(vec![(0, Scripted::Ok(free(5)))])
            .with_increments(vec![(
                0,
                Scripted::LimitReached("Daily conversion limit reached (5/5)".to_string()),
            )]);
        let store = UsageLimitsStore::new(Arc::new(api));

        store.check_usage(ACTION).await.unwrap();
        let outcome = store.increment_usage(ACTION).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(LIMIT_REACHED_MESSAGE));

        let status = store.get_status(ACTION);
        assert_eq!(status.used, 5);
        assert!(status.limit_reached);
        assert!(status.error.unwrap().contains("5/5"));
    }

    #[tokio::test]
    async fn test_increment_other_failure() {
        let api = ScriptedApi::default()
            .with_increments(vec![(0, Scripted::Fail("database offline".to_string()))]);
        let store = UsageLimitsStore::new(Arc::new(api));

        let outcome = store.increment_usage(ACTION).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("database offline"));
        assert!(!store.get_status(ACTION).limit_reached);
        assert!(!store.get_status(ACTION).rejected);
    }

    #[tokio::test]
    async fn test_out_of_order_increments_keep_newest() {
        let api = ScriptedApi::default().with_increments(vec![
            (60, Scripted::Ok(free(1))),
            (0, Scripted::Ok(free(2))),
        ]);
        let store = UsageLimitsStore::new(Arc::new(api));

        let (first, second) =
            tokio::join!(store.increment_usage(ACTION), store.increment_usage(ACTION));
        assert!(first.success && second.success);
        assert_eq!(store.get_status(ACTION).used, 2);
    }

    #[tokio::test]
    async fn test_later_served_increment_wins_when_it_replies_last() {
        // the first request is served second and answers last with the higher count
        let api = ScriptedApi::default().with_increments(vec![
            (60, Scripted::Ok(free(2))),
            (0, Scripted::Ok(free(1))),
        ]);
        let store = UsageLimitsStore::new(Arc::new(api));

        let (first, second) =
            tokio::join!(store.increment_usage(ACTION), store.increment_usage(ACTION));
        assert_eq!(first.data.unwrap().status.used, 2);
        assert_eq!(second.data.unwrap().status.used, 1);

        let status = store.get_status(ACTION);
        assert_eq!(status.used, 2);
        assert_eq!(status.remaining, Limit::Bounded(3));
    }

    #[tokio::test]
    async fn test_actions_do_not_share_state() {
        let api = ScriptedApi::default().with_checks(vec![(0, Scripted::Ok(free(3)))]);
        let store = UsageLimitsStore::new(Arc::new(api));

        store.check_usage(ActionType::Compression).await.unwrap();
        assert_eq!(store.get_status(ActionType::Compression).used, 3);
        assert!(store.get_status(ActionType::Enhancement).loading);
    }
}
