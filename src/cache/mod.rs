mod collection;

pub use collection::{Collection, Upsert};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::model::*;

/// Tally of one merge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl MergeReport {
    fn record(&mut self, outcome: Upsert) {
        match outcome {
            Upsert::Inserted => self.inserted += 1,
            Upsert::Updated => self.updated += 1,
            Upsert::Unchanged => {}
        }
    }
}

/// The shared local copy of tasks and resource claims.
///
/// Each collection sits behind its own lock; order and index of a collection
/// only change under that collection's write guard.
#[derive(Default)]
pub struct EntityCache {
    tasks: RwLock<Collection<Task>>,
    claims: RwLock<Collection<ResourceClaim>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tasks(&self) -> RwLockReadGuard<'_, Collection<Task>> {
        self.tasks.read().await
    }

    pub async fn claims(&self) -> RwLockReadGuard<'_, Collection<ResourceClaim>> {
        self.claims.read().await
    }

    pub(crate) async fn tasks_mut(&self) -> RwLockWriteGuard<'_, Collection<Task>> {
        self.tasks.write().await
    }

    pub(crate) async fn claims_mut(&self) -> RwLockWriteGuard<'_, Collection<ResourceClaim>> {
        self.claims.write().await
    }

    pub async fn task(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().await.get(&id).cloned()
    }

    pub async fn claim(&self, id: ClaimId) -> Option<ResourceClaim> {
        self.claims.read().await.get(&id).cloned()
    }

    pub async fn task_bounds(&self) -> Bounds {
        self.tasks.read().await.bounds()
    }

    pub async fn claim_bounds(&self) -> Bounds {
        self.claims.read().await.bounds()
    }

    pub async fn task_changes(&self) -> u64 {
        self.tasks.read().await.change_count()
    }

    pub async fn claim_changes(&self) -> u64 {
        self.claims.read().await.change_count()
    }

    /// Upsert every task `accept` admits.
    pub async fn merge_tasks(&self, tasks: Vec<Task>, accept: impl Fn(&Task) -> bool) -> MergeReport {
        let mut report = MergeReport::default();
        let mut guard = self.tasks.write().await;
        for task in tasks {
            if accept(&task) {
                report.record(guard.upsert(task));
            } else {
                report.skipped += 1;
            }
        }
        metrics::gauge!(crate::observability::CACHED_TASKS).set(guard.len() as f64);
        report
    }

    pub async fn merge_claims(&self, claims: Vec<ResourceClaim>) -> MergeReport {
        let mut report = MergeReport::default();
        let mut guard = self.claims.write().await;
        for claim in claims {
            report.record(guard.upsert(claim));
        }
        metrics::gauge!(crate::observability::CACHED_CLAIMS).set(guard.len() as f64);
        report
    }

    /// Evict everything outside `window`. Returns the dropped task and claim ids.
    pub async fn prune(&self, window: &Span) -> (Vec<TaskId>, Vec<ClaimId>) {
        let dropped_tasks = {
            let mut tasks = self.tasks.write().await;
            let dropped = tasks.prune(window);
            metrics::gauge!(crate::observability::CACHED_TASKS).set(tasks.len() as f64);
            dropped
        };
        let dropped_claims = {
            let mut claims = self.claims.write().await;
            let dropped = claims.prune(window);
            metrics::gauge!(crate::observability::CACHED_CLAIMS).set(claims.len() as f64);
            dropped
        };
        (dropped_tasks, dropped_claims)
    }

    pub async fn recompute_bounds(&self) {
        self.tasks.write().await.recompute_bounds();
        self.claims.write().await.recompute_bounds();
    }

    pub async fn clear_tasks(&self) {
        self.tasks.write().await.clear();
        metrics::gauge!(crate::observability::CACHED_TASKS).set(0.0);
    }

    pub async fn clear_claims(&self) {
        self.claims.write().await.clear();
        metrics::gauge!(crate::observability::CACHED_CLAIMS).set(0.0);
    }
}
