use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::EntityCache;
use crate::clock::ServerClock;
use crate::error::SyncError;
use crate::events::EventLog;
use crate::model::*;
use crate::observability::{self, object_label};
use crate::resources::ResourceDirectory;
use crate::store::{RemoteStore, StoreError};
use crate::window::ViewState;

/// Outcome of applying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Pulls the change feed and applies it to the cache in feed order.
pub struct ChangeFeed {
    store: Arc<dyn RemoteStore>,
    cache: Arc<EntityCache>,
    resources: Arc<ResourceDirectory>,
    events: Arc<RwLock<EventLog>>,
    clock: Arc<ServerClock>,
    view: watch::Receiver<ViewState>,
    cursor: watch::Sender<Option<u64>>,
    timeout: Duration,
    backoff: Duration,
}

impl ChangeFeed {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<EntityCache>,
        resources: Arc<ResourceDirectory>,
        events: Arc<RwLock<EventLog>>,
        clock: Arc<ServerClock>,
        view: watch::Receiver<ViewState>,
        timeout: Duration,
        backoff: Duration,
    ) -> Self {
        let (cursor, _) = watch::channel(None);
        Self {
            store,
            cache,
            resources,
            events,
            clock,
            view,
            cursor,
            timeout,
            backoff,
        }
    }

    /// Highest change number applied so far.
    pub fn cursor(&self) -> Option<u64> {
        *self.cursor.borrow()
    }

    pub fn subscribe_cursor(&self) -> watch::Receiver<Option<u64>> {
        self.cursor.subscribe()
    }

    /// Move the cursor forward to `cn`. Never moves it back.
    pub fn advance_cursor(&self, cn: u64) {
        let moved = self.cursor.send_if_modified(|c| match *c {
            Some(current) if current >= cn => false,
            _ => {
                *c = Some(cn);
                true
            }
        });
        if moved {
            metrics::gauge!(observability::FEED_CURSOR).set(cn as f64);
        }
    }

    /// Start from the store's latest change so history is not replayed.
    pub async fn seed_cursor(&self) -> Result<(), StoreError> {
        if let Some(cn) = self.store.most_recent_change_number().await? {
            debug!(cursor = cn, "feed cursor seeded");
            self.advance_cursor(cn);
        }
        Ok(())
    }

    /// One long-poll round trip.
    pub async fn fetch(&self) -> Result<Vec<ChangeRecord>, StoreError> {
        tokio::time::timeout(self.timeout, self.store.changes_since(self.cursor()))
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }

    /// Apply records in order. Records at or below the cursor have been
    /// applied already and are skipped.
    pub async fn apply_batch(&self, batch: Vec<ChangeRecord>) -> BatchReport {
        let mut report = BatchReport::default();
        if batch.is_empty() {
            return report;
        }
        metrics::counter!(observability::FEED_BATCHES_TOTAL).increment(1);
        let seen = self.cursor();
        let view = *self.view.borrow();
        for record in &batch {
            if seen.is_some_and(|c| record.change_number <= c) {
                debug!(change = record.change_number, cursor = ?seen, "skipping replayed change");
                report.skipped += 1;
                continue;
            }
            let object = object_label(record.object_type);
            match self.apply_record(record, &view).await {
                Ok(()) => {
                    report.applied += 1;
                    metrics::counter!(observability::FEED_CHANGES_TOTAL, "object" => object).increment(1);
                }
                Err(e) => {
                    report.errors += 1;
                    metrics::counter!(observability::FEED_RECORD_ERRORS_TOTAL, "object" => object).increment(1);
                    warn!(change = record.change_number, object, "change not applied: {e}");
                }
            }
        }
        if let Some(max) = batch.iter().map(|r| r.change_number).max() {
            self.advance_cursor(max);
        }
        debug!(
            records = batch.len(),
            applied = report.applied,
            skipped = report.skipped,
            errors = report.errors,
            cursor = ?self.cursor(),
            "feed batch"
        );
        report
    }

    async fn apply_record(&self, record: &ChangeRecord, view: &ViewState) -> Result<(), SyncError> {
        match record.object_type {
            ObjectType::Task => self.apply_task(record, view).await,
            ObjectType::ResourceClaim => self.apply_claim(record, view).await,
            ObjectType::ResourceCapacity if record.change_type == ChangeType::Update => {
                let change: CapacityChange = serde_json::from_value(record.value.clone())?;
                if !self.resources.apply_capacity(&change) {
                    debug!(resource = change.resource_id, "capacity change for unknown resource");
                }
                Ok(())
            }
            ObjectType::ResourceAvailability if record.change_type == ChangeType::Update => {
                let change: AvailabilityChange = serde_json::from_value(record.value.clone())?;
                if !self.resources.apply_availability(&change) {
                    debug!(resource = change.resource_id, "availability change for unknown resource");
                }
                Ok(())
            }
            ObjectType::LogEvent => {
                let now = self.clock.now();
                let message = match &record.value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let event = LogEvent {
                    message,
                    timestamp: record.timestamp.unwrap_or(now),
                };
                self.events.write().await.push(event, now);
                Ok(())
            }
            _ => {
                debug!(change = record.change_number, kind = ?record.object_type, "ignored change");
                Ok(())
            }
        }
    }

    async fn apply_task(&self, record: &ChangeRecord, view: &ViewState) -> Result<(), SyncError> {
        match record.change_type {
            ChangeType::Update => {
                let IdOnly { id } = serde_json::from_value(record.value.clone())?;
                let patch: TaskPatch = serde_json::from_value(record.value.clone())?;
                // absent tasks stay absent
                self.cache.tasks_mut().await.patch(&id, &patch);
            }
            ChangeType::Insert => {
                let task: Task = serde_json::from_value(record.value.clone())?;
                let mut tasks = self.cache.tasks_mut().await;
                tasks.remove(&task.id);
                if view.window.retains(task.start, task.end) && view.mode.accepts_task(&task) {
                    tasks.upsert(task);
                }
                metrics::gauge!(observability::CACHED_TASKS).set(tasks.len() as f64);
            }
            ChangeType::Delete => {
                let IdOnly { id } = serde_json::from_value(record.value.clone())?;
                let mut tasks = self.cache.tasks_mut().await;
                tasks.remove(&id);
                metrics::gauge!(observability::CACHED_TASKS).set(tasks.len() as f64);
            }
            _ => {}
        }
        Ok(())
    }

    async fn apply_claim(&self, record: &ChangeRecord, view: &ViewState) -> Result<(), SyncError> {
        if !view.scope().tracks_claims() {
            return Ok(());
        }
        match record.change_type {
            ChangeType::Update => {
                let IdOnly { id } = serde_json::from_value(record.value.clone())?;
                let patch: ClaimPatch = serde_json::from_value(record.value.clone())?;
                self.cache.claims_mut().await.patch(&id, &patch);
            }
            ChangeType::Insert => {
                let claim: ResourceClaim = serde_json::from_value(record.value.clone())?;
                let mut claims = self.cache.claims_mut().await;
                claims.remove(&claim.id);
                if view.window.retains(claim.start, claim.end) {
                    claims.upsert(claim);
                }
                metrics::gauge!(observability::CACHED_CLAIMS).set(claims.len() as f64);
            }
            ChangeType::Delete => {
                let IdOnly { id } = serde_json::from_value(record.value.clone())?;
                let mut claims = self.cache.claims_mut().await;
                claims.remove(&id);
                metrics::gauge!(observability::CACHED_CLAIMS).set(claims.len() as f64);
            }
            _ => {}
        }
        Ok(())
    }

    /// Fetch and apply one batch.
    pub async fn poll_once(&self) -> Result<BatchReport, SyncError> {
        let batch = self.fetch().await?;
        Ok(self.apply_batch(batch).await)
    }

    /// Poll until cancelled. Failures back off and retry with the cursor
    /// unchanged. Cancellation interrupts a pending fetch, never a batch
    /// being applied.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(cursor = ?self.cursor(), "change feed started");
        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.fetch() => fetched,
            };
            match fetched {
                Ok(batch) => {
                    self.apply_batch(batch).await;
                }
                Err(e) => {
                    metrics::counter!(observability::FEED_POLL_FAILURES_TOTAL).increment(1);
                    warn!(cursor = ?self.cursor(), "feed poll failed: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
        info!(cursor = ?self.cursor(), "change feed stopped");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    const H: Ms = HOUR_MS;

    struct Harness {
        store: Arc<MemoryStore>,
        cache: Arc<EntityCache>,
        resources: Arc<ResourceDirectory>,
        events: Arc<RwLock<EventLog>>,
        view: watch::Sender<ViewState>,
        feed: Arc<ChangeFeed>,
    }

    fn harness(store: MemoryStore) -> Harness {
        let store = Arc::new(store);
        let cache = Arc::new(EntityCache::new());
        let resources = Arc::new(ResourceDirectory::new());
        let events = Arc::new(RwLock::new(EventLog::new(6 * H)));
        let (view, rx) = watch::channel(ViewState {
            window: Span::new(0, 24 * H),
            mode: Mode::Normal,
            track_claims: true,
            auto_follow: false,
            zoom: 24 * H,
        });
        let feed = Arc::new(ChangeFeed::new(
            store.clone(),
            cache.clone(),
            resources.clone(),
            events.clone(),
            Arc::new(ServerClock::starting_at(10 * H)),
            rx,
            Duration::from_secs(300),
            Duration::from_secs(1),
        ));
        Harness { store, cache, resources, events, view, feed }
    }

    fn record(cn: u64, object_type: ObjectType, change_type: ChangeType, value: serde_json::Value) -> ChangeRecord {
        ChangeRecord {
            change_number: cn,
            object_type,
            change_type,
            value,
            timestamp: None,
        }
    }

    fn task_json(id: u64, start: Ms, end: Ms) -> serde_json::Value {
        json!({"id": id, "starttime": format_instant(start), "endtime": format_instant(end)})
    }

    #[tokio::test]
    async fn insert_then_delete_leaves_nothing() {
        let h = harness(MemoryStore::new());
        let report = h
            .feed
            .apply_batch(vec![
                record(5, ObjectType::Task, ChangeType::Insert, task_json(9, H, 2 * H)),
                record(6, ObjectType::Task, ChangeType::Delete, json!({"id": 9})),
            ])
            .await;
        assert_eq!(report.applied, 2);
        assert!(h.cache.task(9).await.is_none());
        assert_eq!(h.feed.cursor(), Some(6));
    }

    #[tokio::test]
    async fn update_merges_only_into_existing() {
        let h = harness(MemoryStore::new());
        h.cache.merge_tasks(vec![Task::new(1, H, 2 * H)], |_| true).await;
        h.feed
            .apply_batch(vec![
                record(1, ObjectType::Task, ChangeType::Update, json!({"id": 1, "status": "scheduled"})),
                record(2, ObjectType::Task, ChangeType::Update, json!({"id": 2, "status": "scheduled"})),
            ])
            .await;
        let task = h.cache.task(1).await.unwrap();
        assert_eq!(task.status.as_deref(), Some("scheduled"));
        assert_eq!(task.start, H);
        assert!(h.cache.task(2).await.is_none());
    }

    #[tokio::test]
    async fn insert_respects_window_and_project() {
        let h = harness(MemoryStore::new());
        h.cache.merge_tasks(vec![Task::new(3, H, 2 * H)], |_| true).await;
        h.feed
            .apply_batch(vec![
                // outside the window
                record(1, ObjectType::Task, ChangeType::Insert, task_json(1, 30 * H, 31 * H)),
                // replaces the stale copy
                record(2, ObjectType::Task, ChangeType::Insert, task_json(3, 3 * H, 4 * H)),
            ])
            .await;
        assert!(h.cache.task(1).await.is_none());
        assert_eq!(h.cache.task(3).await.unwrap().start, 3 * H);

        h.view.send_modify(|v| v.mode = Mode::Project(Some(4)));
        let mut ours = task_json(7, H, 2 * H);
        ours["project_mom_id"] = json!(4);
        h.feed
            .apply_batch(vec![
                record(3, ObjectType::Task, ChangeType::Insert, ours),
                record(4, ObjectType::Task, ChangeType::Insert, task_json(8, H, 2 * H)),
            ])
            .await;
        assert!(h.cache.task(7).await.is_some());
        assert!(h.cache.task(8).await.is_none());
    }

    #[tokio::test]
    async fn claims_ignored_when_untracked() {
        let h = harness(MemoryStore::new());
        let claim = json!({"id": 4, "starttime": format_instant(H), "endtime": format_instant(2 * H)});
        h.feed
            .apply_batch(vec![record(1, ObjectType::ResourceClaim, ChangeType::Insert, claim.clone())])
            .await;
        assert!(h.cache.claim(4).await.is_some());

        h.view.send_modify(|v| v.track_claims = false);
        h.feed
            .apply_batch(vec![record(2, ObjectType::ResourceClaim, ChangeType::Delete, json!({"id": 4}))])
            .await;
        assert!(h.cache.claim(4).await.is_some());
        assert_eq!(h.feed.cursor(), Some(2));
    }

    #[tokio::test]
    async fn bad_record_does_not_abort_batch() {
        let h = harness(MemoryStore::new());
        let report = h
            .feed
            .apply_batch(vec![
                record(1, ObjectType::Task, ChangeType::Insert, json!({"id": "nope"})),
                record(2, ObjectType::Task, ChangeType::Insert, task_json(2, H, 2 * H)),
            ])
            .await;
        assert_eq!(report, BatchReport { applied: 1, skipped: 0, errors: 1 });
        assert!(h.cache.task(2).await.is_some());
        assert_eq!(h.feed.cursor(), Some(2));
    }

    #[tokio::test]
    async fn ancillary_records_patch_resources_and_events() {
        let h = harness(MemoryStore::new());
        h.resources.load(vec![Resource {
            id: 1,
            name: None,
            available_capacity: None,
            total_capacity: None,
            active: Some(true),
        }]);
        let mut event = record(3, ObjectType::LogEvent, ChangeType::Event, json!("observation started"));
        event.timestamp = Some(10 * H);
        h.feed
            .apply_batch(vec![
                record(1, ObjectType::ResourceCapacity, ChangeType::Update, json!({"resource_id": 1, "available": 5, "total": 8})),
                record(2, ObjectType::ResourceAvailability, ChangeType::Update, json!({"resource_id": 1, "total": false})),
                event,
                record(4, ObjectType::Other, ChangeType::Other, json!(null)),
            ])
            .await;
        let r = h.resources.get(1).unwrap();
        assert_eq!((r.available_capacity, r.total_capacity, r.active), (Some(5), Some(8), Some(false)));
        let events = h.events.read().await;
        assert_eq!(events.iter().next().unwrap().message, "observation started");
    }

    #[tokio::test]
    async fn cursor_is_monotonic() {
        let h = harness(MemoryStore::new());
        h.feed
            .apply_batch(vec![
                record(7, ObjectType::Task, ChangeType::Delete, json!({"id": 1})),
                record(4, ObjectType::Task, ChangeType::Delete, json!({"id": 2})),
            ])
            .await;
        assert_eq!(h.feed.cursor(), Some(7));
        let report = h
            .feed
            .apply_batch(vec![record(3, ObjectType::Task, ChangeType::Delete, json!({"id": 3}))])
            .await;
        assert_eq!(report.skipped, 1);
        assert_eq!(h.feed.cursor(), Some(7));
        h.feed.apply_batch(Vec::new()).await;
        assert_eq!(h.feed.cursor(), Some(7));
    }

    #[tokio::test]
    async fn replayed_changes_at_or_below_cursor_are_skipped() {
        let h = harness(MemoryStore::new());
        let insert = record(5, ObjectType::Task, ChangeType::Insert, task_json(1, H, 2 * H));
        h.feed
            .apply_batch(vec![
                insert.clone(),
                record(6, ObjectType::Task, ChangeType::Delete, json!({"id": 1})),
            ])
            .await;
        assert!(h.cache.task(1).await.is_none());

        // a server replaying an old batch must not resurrect the task
        let report = h.feed.apply_batch(vec![insert]).await;
        assert_eq!((report.applied, report.skipped), (0, 1));
        assert!(h.cache.task(1).await.is_none());
        assert_eq!(h.feed.cursor(), Some(6));
    }

    #[tokio::test]
    async fn seed_starts_after_history() {
        let store = MemoryStore::new();
        store
            .push_changes([record(12, ObjectType::Task, ChangeType::Delete, json!({"id": 1}))])
            .await;
        let h = harness(store);
        h.feed.seed_cursor().await.unwrap();
        assert_eq!(h.feed.cursor(), Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_failed_polls_with_same_cursor() {
        let store = MemoryStore::new();
        store.fail_next_polls(2);
        let h = harness(store);
        h.feed.advance_cursor(3);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.feed.clone().run(cancel.clone()));

        h.store
            .push_changes([record(4, ObjectType::Task, ChangeType::Insert, task_json(1, H, 2 * H))])
            .await;
        let mut cursor = h.feed.subscribe_cursor();
        cursor.wait_for(|c| *c == Some(4)).await.unwrap();

        cancel.cancel();
        task.await.unwrap();
        let polled = h.store.polled_cursors().await;
        assert_eq!(&polled[..3], &[Some(3), Some(3), Some(3)]);
        assert!(h.cache.task(1).await.is_some());
    }
}
