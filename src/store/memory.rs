//! In-memory `RemoteStore` for tests, benches and offline runs.
//!
//! Holds tasks, claims and a scripted change feed behind `tokio::sync::RwLock`,
//! records the calls it receives, and can be told to fail.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, watch};

use super::{RemoteStore, StoreError};
use crate::model::*;

#[derive(Default)]
struct Data {
    tasks: Vec<Task>,
    claims: Vec<ResourceClaim>,
    changes: Vec<ChangeRecord>,
    resources: Vec<Resource>,
    log_events: Vec<LogEvent>,
    config: serde_json::Value,
}

#[derive(Default)]
struct Calls {
    task_ranges: Vec<(Span, Option<ProjectId>)>,
    claim_ranges: Vec<Span>,
    polled_cursors: Vec<Option<u64>>,
    writes: Vec<(TaskId, TaskPatch)>,
    copies: Vec<TaskId>,
}

pub struct MemoryStore {
    data: RwLock<Data>,
    calls: Mutex<Calls>,
    /// Bumped on every pushed change; held polls wait on it.
    feed_version: watch::Sender<u64>,
    hold_feed: AtomicBool,
    server_now: AtomicI64,
    range_delay: Mutex<Option<Duration>>,
    fail_ranges: AtomicU32,
    fail_polls: AtomicU32,
    reject_writes: AtomicBool,
    ignore_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed_version, _) = watch::channel(0);
        Self {
            data: RwLock::new(Data::default()),
            calls: Mutex::new(Calls::default()),
            feed_version,
            hold_feed: AtomicBool::new(true),
            server_now: AtomicI64::new(crate::clock::system_now_ms()),
            range_delay: Mutex::new(None),
            fail_ranges: AtomicU32::new(0),
            fail_polls: AtomicU32::new(0),
            reject_writes: AtomicBool::new(false),
            ignore_writes: AtomicBool::new(false),
        }
    }

    pub async fn with_tasks(self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.data.write().await.tasks.extend(tasks);
        self
    }

    pub async fn with_claims(self, claims: impl IntoIterator<Item = ResourceClaim>) -> Self {
        self.data.write().await.claims.extend(claims);
        self
    }

    /// Insert or replace a stored task.
    pub async fn put_task(&self, task: Task) {
        let mut data = self.data.write().await;
        data.tasks.retain(|t| t.id != task.id);
        data.tasks.push(task);
    }

    pub async fn put_claim(&self, claim: ResourceClaim) {
        let mut data = self.data.write().await;
        data.claims.retain(|c| c.id != claim.id);
        data.claims.push(claim);
    }

    pub async fn stored_task(&self, id: TaskId) -> Option<Task> {
        self.data.read().await.tasks.iter().find(|t| t.id == id).cloned()
    }

    pub async fn set_resources(&self, resources: Vec<Resource>) {
        self.data.write().await.resources = resources;
    }

    pub async fn set_config(&self, config: serde_json::Value) {
        self.data.write().await.config = config;
    }

    pub async fn push_log_event(&self, event: LogEvent) {
        self.data.write().await.log_events.push(event);
    }

    /// Append records to the feed and wake held polls.
    pub async fn push_changes(&self, records: impl IntoIterator<Item = ChangeRecord>) {
        self.data.write().await.changes.extend(records);
        self.feed_version.send_modify(|v| *v += 1);
    }

    /// When false, a poll with nothing new returns an empty batch at once.
    pub fn hold_feed(&self, hold: bool) {
        self.hold_feed.store(hold, Ordering::Relaxed);
    }

    pub fn set_server_time(&self, now: Ms) {
        self.server_now.store(now, Ordering::Relaxed);
    }

    /// Delay every range fetch, to keep chunks in flight.
    pub async fn set_range_delay(&self, delay: Option<Duration>) {
        *self.range_delay.lock().await = delay;
    }

    /// Fail the next `n` range fetches (tasks and claims alike).
    pub fn fail_next_ranges(&self, n: u32) {
        self.fail_ranges.store(n, Ordering::Relaxed);
    }

    pub fn fail_next_polls(&self, n: u32) {
        self.fail_polls.store(n, Ordering::Relaxed);
    }

    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::Relaxed);
    }

    /// Accept writes without applying them.
    pub fn ignore_writes(&self, ignore: bool) {
        self.ignore_writes.store(ignore, Ordering::Relaxed);
    }

    pub async fn task_range_calls(&self) -> Vec<(Span, Option<ProjectId>)> {
        self.calls.lock().await.task_ranges.clone()
    }

    pub async fn claim_range_calls(&self) -> Vec<Span> {
        self.calls.lock().await.claim_ranges.clone()
    }

    pub async fn polled_cursors(&self) -> Vec<Option<u64>> {
        self.calls.lock().await.polled_cursors.clone()
    }

    pub async fn writes(&self) -> Vec<(TaskId, TaskPatch)> {
        self.calls.lock().await.writes.clone()
    }

    pub async fn copies(&self) -> Vec<TaskId> {
        self.calls.lock().await.copies.clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn range_preamble(&self) -> Result<(), StoreError> {
        let delay = *self.range_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.fail_ranges) {
            return Err(StoreError::Transport("injected range failure".into()));
        }
        Ok(())
    }
}

fn intersects(span: &Span, start: Ms, end: Ms) -> bool {
    start < span.end && end > span.start
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn tasks_in_range(&self, span: Span, project: Option<ProjectId>) -> Result<Vec<Task>, StoreError> {
        self.calls.lock().await.task_ranges.push((span, project));
        self.range_preamble().await?;
        let data = self.data.read().await;
        Ok(data
            .tasks
            .iter()
            .filter(|t| intersects(&span, t.start, t.end))
            .filter(|t| project.is_none() || t.project_id == project)
            .cloned()
            .collect())
    }

    async fn claims_in_range(&self, span: Span) -> Result<Vec<ResourceClaim>, StoreError> {
        self.calls.lock().await.claim_ranges.push(span);
        self.range_preamble().await?;
        let data = self.data.read().await;
        Ok(data
            .claims
            .iter()
            .filter(|c| intersects(&span, c.start, c.end))
            .cloned()
            .collect())
    }

    async fn task(&self, key: TaskKey) -> Result<Option<Task>, StoreError> {
        let data = self.data.read().await;
        Ok(data.tasks.iter().find(|t| key.matches(t)).cloned())
    }

    async fn tasks_in_group(&self, group_id: u64) -> Result<Vec<Task>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .tasks
            .iter()
            .filter(|t| t.group_id == Some(group_id))
            .cloned()
            .collect())
    }

    async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> Result<(), StoreError> {
        self.calls.lock().await.writes.push((id, patch.clone()));
        if self.reject_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Rejected(format!("update of task {id} refused")));
        }
        let mut data = self.data.write().await;
        let task = data
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound)?;
        if !self.ignore_writes.load(Ordering::Relaxed) {
            task.apply(patch);
        }
        Ok(())
    }

    async fn copy_task(&self, id: TaskId) -> Result<(), StoreError> {
        self.calls.lock().await.copies.push(id);
        if self.reject_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Rejected(format!("copy of task {id} refused")));
        }
        let mut data = self.data.write().await;
        let original = data
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let next_id = data.tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        data.tasks.push(Task {
            id: next_id,
            status: Some("prescheduled".into()),
            ..original
        });
        Ok(())
    }

    async fn changes_since(&self, cursor: Option<u64>) -> Result<Vec<ChangeRecord>, StoreError> {
        self.calls.lock().await.polled_cursors.push(cursor);
        if Self::take_failure(&self.fail_polls) {
            return Err(StoreError::Transport("injected poll failure".into()));
        }
        let mut version = self.feed_version.subscribe();
        loop {
            let batch: Vec<ChangeRecord> = {
                let data = self.data.read().await;
                data.changes
                    .iter()
                    .filter(|r| cursor.is_none_or(|c| r.change_number > c))
                    .cloned()
                    .collect()
            };
            if !batch.is_empty() || !self.hold_feed.load(Ordering::Relaxed) {
                return Ok(batch);
            }
            if version.changed().await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn most_recent_change_number(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.data.read().await.changes.iter().map(|r| r.change_number).max())
    }

    async fn project_time_window(&self, project: ProjectId) -> Result<Option<Span>, StoreError> {
        let data = self.data.read().await;
        let bounds = Bounds::try_of(data.tasks.iter().filter(|t| t.project_id == Some(project)));
        Ok(bounds.filter(|b| b.min <= b.max).map(|b| Span::new(b.min, b.max)))
    }

    async fn resources(&self) -> Result<Vec<Resource>, StoreError> {
        Ok(self.data.read().await.resources.clone())
    }

    async fn config(&self) -> Result<serde_json::Value, StoreError> {
        Ok(self.data.read().await.config.clone())
    }

    async fn server_time(&self) -> Result<Ms, StoreError> {
        Ok(self.server_now.load(Ordering::Relaxed))
    }

    async fn recent_log_events(&self) -> Result<Vec<LogEvent>, StoreError> {
        Ok(self.data.read().await.log_events.clone())
    }
}
