use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::cache::EntityCache;
use crate::error::SyncError;
use crate::lookup::Lookup;
use crate::model::*;
use crate::observability;
use crate::store::RemoteStore;

pub const STATUS_OBSOLETE: &str = "obsolete";
pub const STATUS_FINISHED: &str = "finished";

/// How long to keep re-reading tasks while waiting for a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Optimistic task writes: the cache changes first, the store second, and a
/// refused write puts back exactly the fields it touched.
pub struct Mutator {
    store: Arc<dyn RemoteStore>,
    cache: Arc<EntityCache>,
    lookup: Arc<Lookup>,
}

impl Mutator {
    pub fn new(store: Arc<dyn RemoteStore>, cache: Arc<EntityCache>, lookup: Arc<Lookup>) -> Self {
        Self { store, cache, lookup }
    }

    pub async fn write_task(&self, id: TaskId, patch: TaskPatch) -> Result<(), SyncError> {
        let write = Ulid::new();
        let snapshot = {
            let mut tasks = self.cache.tasks_mut().await;
            let snapshot = tasks.get(&id).ok_or(SyncError::NotFound(id))?.snapshot(&patch);
            tasks.patch(&id, &patch);
            snapshot
        };
        metrics::counter!(observability::WRITES_TOTAL).increment(1);
        debug!(%write, task = id, "optimistic write applied");

        match self.store.update_task(id, &patch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // the task may have been evicted meanwhile; nothing to restore then
                self.cache.tasks_mut().await.patch(&id, &snapshot);
                metrics::counter!(observability::WRITE_ROLLBACKS_TOTAL).increment(1);
                warn!(%write, task = id, "write rejected, rolled back: {e}");
                Err(SyncError::WriteRejected {
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }

    pub async fn copy_task(&self, id: TaskId) -> Result<(), SyncError> {
        self.store.copy_task(id).await.map_err(|e| {
            warn!(task = id, "copy failed: {e}");
            SyncError::from(e)
        })
    }

    /// Re-read `ids` from the store until all have `status`.
    pub async fn wait_for_status(&self, ids: &[TaskId], status: &str, policy: PollPolicy) -> Result<(), SyncError> {
        let mut pending = ids.to_vec();
        for attempt in 1..=policy.max_attempts {
            let fetched = try_join_all(pending.iter().map(|id| self.lookup.task(TaskKey::Id(*id), true))).await?;
            pending = pending
                .iter()
                .zip(fetched)
                .filter(|(_, task)| !task.as_ref().is_some_and(|t| t.has_status(status)))
                .map(|(id, _)| *id)
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            debug!(attempt, ?pending, status, "still waiting");
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.backoff).await;
            }
        }
        Err(SyncError::PollExhausted {
            attempts: policy.max_attempts,
            pending,
        })
    }

    /// Mark every unfinished successor of `id` obsolete and wait until the
    /// store reports them so. Returns the successors that were marked.
    pub async fn obsolete_successors(&self, id: TaskId, policy: PollPolicy) -> Result<Vec<TaskId>, SyncError> {
        let task = self
            .lookup
            .task(TaskKey::Id(id), false)
            .await?
            .ok_or(SyncError::NotFound(id))?;
        let successors = try_join_all(
            task.successor_ids
                .iter()
                .map(|sid| self.lookup.task(TaskKey::Id(*sid), false)),
        )
        .await?;
        let unfinished: Vec<TaskId> = successors
            .into_iter()
            .flatten()
            .filter(|t| !(t.has_status(STATUS_FINISHED) || t.has_status(STATUS_OBSOLETE)))
            .map(|t| t.id)
            .collect();
        if unfinished.is_empty() {
            return Ok(unfinished);
        }
        info!(task = id, successors = ?unfinished, "marking successors obsolete");
        for sid in &unfinished {
            self.write_task(*sid, TaskPatch::status(STATUS_OBSOLETE)).await?;
        }
        self.wait_for_status(&unfinished, STATUS_OBSOLETE, policy).await?;
        Ok(unfinished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::tests::view_in;
    use crate::store::{MemoryStore, StoreError};

    async fn setup(tasks: Vec<Task>) -> (Arc<MemoryStore>, Arc<EntityCache>, Mutator) {
        let store = Arc::new(MemoryStore::new().with_tasks(tasks.clone()).await);
        let cache = Arc::new(EntityCache::new());
        cache.merge_tasks(tasks, |_| true).await;
        let lookup = Arc::new(Lookup::new(store.clone(), cache.clone(), view_in(Mode::Normal)));
        let mutator = Mutator::new(store.clone(), cache.clone(), lookup);
        (store, cache, mutator)
    }

    #[tokio::test]
    async fn accepted_write_sticks() {
        let (store, cache, mutator) = setup(vec![Task::new(1, 0, 10)]).await;
        mutator.write_task(1, TaskPatch::reschedule(5, 15)).await.unwrap();
        let task = cache.task(1).await.unwrap();
        assert_eq!((task.start, task.end), (5, 15));
        assert_eq!(store.stored_task(1).await.unwrap().start, 5);
    }

    #[tokio::test]
    async fn rejected_write_restores_only_touched_fields() {
        let mut task = Task::new(1, 0, 10);
        task.status = Some("approved".into());
        task.name = Some("before".into());
        let (store, cache, mutator) = setup(vec![task]).await;
        store.reject_writes(true);

        // a concurrent change to another field while the write is out
        let mut concurrent = TaskPatch::default();
        concurrent.name = Some(Some("during".into()));
        cache.tasks_mut().await.patch(&1, &concurrent);

        let err = mutator.write_task(1, TaskPatch::status("on_hold")).await.unwrap_err();
        assert!(matches!(err, SyncError::WriteRejected { id: 1, .. }));
        let task = cache.task(1).await.unwrap();
        assert_eq!(task.status.as_deref(), Some("approved"));
        assert_eq!(task.name.as_deref(), Some("during"));
    }

    #[tokio::test]
    async fn local_effect_precedes_network_call() {
        let (store, cache, mutator) = setup(vec![Task::new(1, 0, 10)]).await;
        store.reject_writes(true);
        let before = cache.task_changes().await;
        let _ = mutator.write_task(1, TaskPatch::status("x")).await;
        // applied once, reverted once
        assert_eq!(cache.task_changes().await, before + 2);
        assert_eq!(store.writes().await.len(), 1);
    }

    #[tokio::test]
    async fn write_to_unknown_task_is_not_sent() {
        let (store, _, mutator) = setup(vec![]).await;
        let err = mutator.write_task(3, TaskPatch::status("x")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(3)));
        assert!(store.writes().await.is_empty());
    }

    #[tokio::test]
    async fn copy_errors_are_reported() {
        let (store, _, mutator) = setup(vec![Task::new(1, 0, 10)]).await;
        mutator.copy_task(1).await.unwrap();
        assert_eq!(store.copies().await, vec![1]);
        let err = mutator.copy_task(42).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn successors_are_marked_and_awaited() {
        let mut pred = Task::new(1, 0, 10);
        pred.successor_ids = vec![2, 3, 4];
        let mut done = Task::new(3, 0, 10);
        done.status = Some(STATUS_FINISHED.into());
        let (store, cache, mutator) = setup(vec![pred, Task::new(2, 0, 10), done, Task::new(4, 0, 10)]).await;

        let marked = mutator.obsolete_successors(1, PollPolicy::default()).await.unwrap();
        assert_eq!(marked, vec![2, 4]);
        assert!(store.stored_task(2).await.unwrap().has_status(STATUS_OBSOLETE));
        assert!(cache.task(4).await.unwrap().has_status(STATUS_OBSOLETE));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_gives_up_after_max_attempts() {
        let mut pred = Task::new(1, 0, 10);
        pred.successor_ids = vec![2];
        let (store, _, mutator) = setup(vec![pred, Task::new(2, 0, 10)]).await;
        store.ignore_writes(true);

        let policy = PollPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        };
        let err = mutator.obsolete_successors(1, policy).await.unwrap_err();
        match err {
            SyncError::PollExhausted { attempts, pending } => {
                assert_eq!(attempts, 3);
                assert_eq!(pending, vec![2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
