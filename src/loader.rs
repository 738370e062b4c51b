use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::cache::{EntityCache, MergeReport};
use crate::clock::ServerClock;
use crate::config::{ChunkFailurePolicy, SyncConfig};
use crate::model::*;
use crate::observability;
use crate::selection::Selection;
use crate::store::{RemoteStore, StoreError};
use crate::tracker::LoadedRanges;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Loading,
    Loaded,
    Failed,
}

/// One range fetch. Lives in the queue until the queue drains.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: Ulid,
    pub span: Span,
    pub scope: LoadScope,
    pub status: ChunkStatus,
    pub attempts: u32,
}

/// Loader progress. All zero once the queue has drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

impl Progress {
    pub fn is_idle(&self) -> bool {
        self.queued == 0
    }
}

struct LoaderState {
    queue: VecDeque<Chunk>,
    loaded: LoadedRanges,
    /// Scope of the latest request; results fetched under another are dropped.
    scope: LoadScope,
    workers: usize,
}

struct Job {
    id: Ulid,
    span: Span,
    scope: LoadScope,
    attempt: u32,
}

type Fetched = (Result<Vec<Task>, StoreError>, Result<Option<Vec<ResourceClaim>>, StoreError>);

/// Fills unloaded parts of the view window with bounded-concurrency range
/// fetches and merges the results into the cache.
pub struct ChunkLoader {
    store: Arc<dyn RemoteStore>,
    cache: Arc<EntityCache>,
    selection: Arc<RwLock<Selection>>,
    clock: Arc<ServerClock>,
    config: SyncConfig,
    state: Mutex<LoaderState>,
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
}

impl ChunkLoader {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<EntityCache>,
        selection: Arc<RwLock<Selection>>,
        clock: Arc<ServerClock>,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            store,
            cache,
            selection,
            clock,
            config,
            state: Mutex::new(LoaderState {
                queue: VecDeque::new(),
                loaded: LoadedRanges::new(),
                scope: LoadScope::default(),
                workers: 0,
            }),
            progress,
            cancel,
        }
    }

    /// Queue chunks for the unloaded parts of `window` and start workers.
    ///
    /// Chunks not yet started are replaced; chunks in flight keep running and
    /// their buckets are not queued again.
    pub async fn request_window(self: &Arc<Self>, window: Span, scope: LoadScope) {
        let mut state = self.state.lock().await;
        state.scope = scope;
        state.queue.retain(|c| c.status == ChunkStatus::Loading);

        if scope.mode != Mode::Project(None) {
            let mut planned = state.loaded.clone();
            for chunk in state.queue.iter().filter(|c| c.scope == scope) {
                planned.mark_loaded(&chunk.span);
            }
            let gaps = planned.gaps(&window, scope.mode.chunk_factor(), self.clock.now());
            debug!(chunks = gaps.len(), "window {}..{} requested", window.start, window.end);
            state.queue.extend(gaps.into_iter().map(|span| Chunk {
                id: Ulid::new(),
                span,
                scope,
                status: ChunkStatus::Pending,
                attempts: 0,
            }));
        }

        let pending = state.queue.iter().filter(|c| c.status == ChunkStatus::Pending).count();
        let spawn = self
            .config
            .max_concurrent_chunks
            .saturating_sub(state.workers)
            .min(pending);
        for i in 0..spawn {
            state.workers += 1;
            let delay = self.config.chunk_stagger * i as u32;
            tokio::spawn(self.clone().run_worker(delay));
        }
        self.publish(&mut state);
    }

    /// Switch scope: forget loaded buckets and drop chunks not yet started.
    pub async fn rescope(&self, scope: LoadScope) {
        let mut state = self.state.lock().await;
        state.scope = scope;
        state.loaded.clear();
        state.queue.retain(|c| c.status == ChunkStatus::Loading);
        self.publish(&mut state);
    }

    /// Forget loaded buckets outside `window`.
    pub async fn prune(&self, window: &Span) {
        self.state.lock().await.loaded.prune(window);
    }

    pub async fn loaded(&self) -> LoadedRanges {
        self.state.lock().await.loaded.clone()
    }

    pub async fn queue(&self) -> Vec<Chunk> {
        self.state.lock().await.queue.iter().cloned().collect()
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Resolve once no chunk is pending or in flight.
    pub async fn idle(&self) {
        let mut rx = self.progress.subscribe();
        let _ = rx.wait_for(Progress::is_idle).await;
    }

    async fn run_worker(self: Arc<Self>, delay: Duration) {
        if !delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        while let Some(job) = self.take_next().await {
            let started = std::time::Instant::now();
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return,
                fetched = self.fetch(job.span, job.scope) => fetched,
            };
            let ok = self.finish(&job, fetched).await;
            metrics::histogram!(observability::CHUNK_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
            if !ok && !self.config.chunk_stagger.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.chunk_stagger) => {}
                }
            }
        }
    }

    async fn take_next(&self) -> Option<Job> {
        let mut state = self.state.lock().await;
        let job = state
            .queue
            .iter_mut()
            .find(|c| c.status == ChunkStatus::Pending)
            .map(|c| {
                c.status = ChunkStatus::Loading;
                c.attempts += 1;
                Job {
                    id: c.id,
                    span: c.span,
                    scope: c.scope,
                    attempt: c.attempts,
                }
            });
        match &job {
            Some(job) => {
                metrics::counter!(observability::CHUNKS_STARTED_TOTAL).increment(1);
                debug!(chunk = %job.id, attempt = job.attempt, "loading {}..{}", job.span.start, job.span.end);
            }
            None => state.workers = state.workers.saturating_sub(1),
        }
        self.publish(&mut state);
        job
    }

    async fn fetch(&self, span: Span, scope: LoadScope) -> Fetched {
        let timeout = self.config.chunk_timeout;
        let project = match scope.mode {
            Mode::Project(p) => p,
            Mode::Normal => None,
        };
        let tasks = async {
            tokio::time::timeout(timeout, self.store.tasks_in_range(span, project))
                .await
                .unwrap_or(Err(StoreError::Timeout))
        };
        let claims = async {
            if !scope.tracks_claims() {
                return Ok(None);
            }
            tokio::time::timeout(timeout, self.store.claims_in_range(span))
                .await
                .unwrap_or(Err(StoreError::Timeout))
                .map(Some)
        };
        tokio::join!(tasks, claims)
    }

    /// Merge what arrived and settle the chunk. Returns whether it loaded.
    async fn finish(&self, job: &Job, (tasks, claims): Fetched) -> bool {
        let mut state = self.state.lock().await;
        let current = state.scope == job.scope;

        let mut error = None;
        let mut task_report = MergeReport::default();
        match tasks {
            Ok(tasks) if current => {
                let mode = job.scope.mode;
                task_report = self.cache.merge_tasks(tasks, |t| mode.accepts_task(t)).await;
            }
            Ok(_) => {}
            Err(e) => error = Some(e),
        }
        match claims {
            Ok(Some(claims)) if current => {
                self.cache.merge_claims(claims).await;
            }
            Ok(_) => {}
            Err(e) => error = error.or(Some(e)),
        }
        if current {
            self.maybe_select_initial(&task_report).await;
        }

        let Some(chunk) = state.queue.iter_mut().find(|c| c.id == job.id) else {
            self.publish(&mut state);
            return error.is_none();
        };
        let loaded = match error {
            None => {
                chunk.status = ChunkStatus::Loaded;
                metrics::counter!(observability::CHUNKS_FINISHED_TOTAL, "outcome" => "loaded").increment(1);
                info!(
                    chunk = %job.id,
                    inserted = task_report.inserted,
                    updated = task_report.updated,
                    "loaded {}..{}", job.span.start, job.span.end
                );
                true
            }
            Some(e) => match self.config.chunk_failure {
                ChunkFailurePolicy::MarkLoaded => {
                    warn!(chunk = %job.id, "chunk {}..{} failed, marking loaded: {e}", job.span.start, job.span.end);
                    chunk.status = ChunkStatus::Loaded;
                    metrics::counter!(observability::CHUNKS_FINISHED_TOTAL, "outcome" => "failed").increment(1);
                    true
                }
                ChunkFailurePolicy::Retry { .. } if !current => {
                    debug!(chunk = %job.id, "chunk {}..{} failed under a stale scope: {e}", job.span.start, job.span.end);
                    chunk.status = ChunkStatus::Failed;
                    metrics::counter!(observability::CHUNKS_FINISHED_TOTAL, "outcome" => "stale").increment(1);
                    false
                }
                ChunkFailurePolicy::Retry { max_attempts } if chunk.attempts < max_attempts && e.is_transient() => {
                    warn!(chunk = %job.id, attempt = chunk.attempts, "chunk {}..{} failed, retrying: {e}", job.span.start, job.span.end);
                    chunk.status = ChunkStatus::Pending;
                    metrics::counter!(observability::CHUNKS_FINISHED_TOTAL, "outcome" => "retried").increment(1);
                    false
                }
                ChunkFailurePolicy::Retry { .. } => {
                    warn!(chunk = %job.id, attempts = chunk.attempts, "chunk {}..{} failed, giving up: {e}", job.span.start, job.span.end);
                    chunk.status = ChunkStatus::Failed;
                    metrics::counter!(observability::CHUNKS_FINISHED_TOTAL, "outcome" => "failed").increment(1);
                    false
                }
            },
        };
        if loaded && current {
            state.loaded.mark_loaded(&job.span);
        }
        self.publish(&mut state);
        loaded
    }

    /// Pick an initial selection when these inserts were the first tasks cached
    /// and nothing is selected.
    async fn maybe_select_initial(&self, report: &MergeReport) {
        if report.inserted == 0 {
            return;
        }
        let tasks = self.cache.tasks().await;
        if tasks.len() != report.inserted {
            return;
        }
        let mut selection = self.selection.write().await;
        if !selection.is_empty() {
            return;
        }
        if let Some(id) = selection.select_initial(&tasks, self.clock.now()) {
            debug!(task = id, "initial selection");
        }
    }

    /// Publish counters; a fully settled queue is reset.
    fn publish(&self, state: &mut LoaderState) {
        let count = |status| state.queue.iter().filter(|c| c.status == status).count();
        let (pending, in_flight) = (count(ChunkStatus::Pending), count(ChunkStatus::Loading));
        let (completed, failed) = (count(ChunkStatus::Loaded), count(ChunkStatus::Failed));
        let progress = if pending == 0 && in_flight == 0 {
            state.queue.clear();
            Progress::default()
        } else {
            Progress {
                queued: state.queue.len(),
                in_flight,
                completed,
                failed,
            }
        };
        metrics::gauge!(observability::CHUNKS_IN_FLIGHT).set(in_flight as f64);
        self.progress.send_replace(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const H: Ms = HOUR_MS;

    struct Harness {
        store: Arc<MemoryStore>,
        cache: Arc<EntityCache>,
        selection: Arc<RwLock<Selection>>,
        loader: Arc<ChunkLoader>,
    }

    async fn harness(store: MemoryStore, config: SyncConfig) -> Harness {
        let store = Arc::new(store);
        let cache = Arc::new(EntityCache::new());
        let selection = Arc::new(RwLock::new(Selection::new()));
        let loader = Arc::new(ChunkLoader::new(
            store.clone(),
            cache.clone(),
            selection.clone(),
            Arc::new(ServerClock::starting_at(0)),
            config,
            CancellationToken::new(),
        ));
        Harness { store, cache, selection, loader }
    }

    fn normal() -> LoadScope {
        LoadScope::default()
    }

    #[tokio::test(start_paused = true)]
    async fn loads_window_and_marks_buckets() {
        let store = MemoryStore::new()
            .with_tasks([Task::new(1, 10 * H, 10 * H + 30 * MINUTE_MS), Task::new(2, 11 * H, 13 * H)])
            .await;
        let h = harness(store, SyncConfig::default()).await;

        h.loader.request_window(Span::new(10 * H, 12 * H), normal()).await;
        h.loader.idle().await;

        assert_eq!(h.cache.tasks().await.len(), 2);
        let loaded = h.loader.loaded().await;
        assert!(loaded.is_loaded(10 * H) && loaded.is_loaded(11 * H));
        assert_eq!(h.store.task_range_calls().await.len(), 2);
        assert!(h.store.claim_range_calls().await.is_empty());
        assert_eq!(h.loader.progress(), Progress::default());

        // nothing left to fetch
        h.loader.request_window(Span::new(10 * H, 12 * H), normal()).await;
        h.loader.idle().await;
        assert_eq!(h.store.task_range_calls().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn workers_are_bounded_and_staggered() {
        let store = MemoryStore::new();
        store.set_range_delay(Some(Duration::from_secs(1))).await;
        let h = harness(store, SyncConfig::default()).await;
        let mut progress = h.loader.subscribe();
        let peak = tokio::spawn(async move {
            let mut peak = 0;
            while progress.changed().await.is_ok() {
                let p = *progress.borrow();
                peak = peak.max(p.in_flight);
                if p.is_idle() {
                    break;
                }
            }
            peak
        });

        h.loader.request_window(Span::new(0, 10 * H), normal()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.store.task_range_calls().await.len(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.store.task_range_calls().await.len(), 2);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.store.task_range_calls().await.len(), 3);

        h.loader.idle().await;
        assert_eq!(h.store.task_range_calls().await.len(), 10);
        assert!(peak.await.unwrap() <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_chunks_are_not_requeued() {
        let store = MemoryStore::new();
        store.set_range_delay(Some(Duration::from_secs(1))).await;
        let h = harness(store, SyncConfig::default()).await;

        h.loader.request_window(Span::new(0, 2 * H), normal()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.loader.request_window(Span::new(0, 2 * H), normal()).await;
        h.loader.idle().await;
        assert_eq!(h.store.task_range_calls().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_chunk_is_retried() {
        let store = MemoryStore::new().with_tasks([Task::new(1, 0, H)]).await;
        store.fail_next_ranges(1);
        let h = harness(store, SyncConfig::default()).await;

        h.loader.request_window(Span::new(0, H), normal()).await;
        h.loader.idle().await;
        assert_eq!(h.store.task_range_calls().await.len(), 2);
        assert!(h.loader.loaded().await.is_loaded(0));
        assert!(h.cache.task(1).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_chunk_stays_unloaded() {
        let store = MemoryStore::new().with_tasks([Task::new(1, 0, H)]).await;
        store.fail_next_ranges(5);
        let config = SyncConfig {
            chunk_failure: ChunkFailurePolicy::Retry { max_attempts: 3 },
            ..SyncConfig::default()
        };
        let h = harness(store, config).await;

        h.loader.request_window(Span::new(0, H), normal()).await;
        h.loader.idle().await;
        assert_eq!(h.store.task_range_calls().await.len(), 3);
        assert!(!h.loader.loaded().await.is_loaded(0));

        // the next request tries again
        h.loader.request_window(Span::new(0, H), normal()).await;
        h.loader.idle().await;
        assert!(h.loader.loaded().await.is_loaded(0));
        assert_eq!(h.store.task_range_calls().await.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_loaded_policy_swallows_failure() {
        let store = MemoryStore::new();
        store.fail_next_ranges(1);
        let config = SyncConfig {
            chunk_failure: ChunkFailurePolicy::MarkLoaded,
            ..SyncConfig::default()
        };
        let h = harness(store, config).await;

        h.loader.request_window(Span::new(0, H), normal()).await;
        h.loader.idle().await;
        assert_eq!(h.store.task_range_calls().await.len(), 1);
        assert!(h.loader.loaded().await.is_loaded(0));
    }

    #[tokio::test(start_paused = true)]
    async fn project_scope_groups_and_filters() {
        let mut ours = Task::new(1, 0, H);
        ours.project_id = Some(7);
        let mut theirs = Task::new(2, 0, H);
        theirs.project_id = Some(8);
        let store = MemoryStore::new()
            .with_tasks([ours, theirs])
            .await
            .with_claims([ResourceClaim::new(1, 0, H)])
            .await;
        let h = harness(store, SyncConfig::default()).await;

        let scope = LoadScope {
            mode: Mode::Project(Some(7)),
            track_claims: true,
        };
        h.loader.request_window(Span::new(0, 8 * H), scope).await;
        h.loader.idle().await;

        let calls = h.store.task_range_calls().await;
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(span, p)| span.duration_ms() == 4 * H && *p == Some(7)));
        assert!(h.store.claim_range_calls().await.is_empty());
        assert_eq!(h.cache.tasks().await.ids(), &[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn unselected_project_loads_nothing() {
        let h = harness(MemoryStore::new(), SyncConfig::default()).await;
        let scope = LoadScope {
            mode: Mode::Project(None),
            track_claims: false,
        };
        h.loader.request_window(Span::new(0, 8 * H), scope).await;
        h.loader.idle().await;
        assert!(h.store.task_range_calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn claims_follow_tracking_flag() {
        let store = MemoryStore::new()
            .with_claims([ResourceClaim::new(5, 0, H)])
            .await;
        let h = harness(store, SyncConfig::default()).await;
        let scope = LoadScope {
            mode: Mode::Normal,
            track_claims: true,
        };
        h.loader.request_window(Span::new(0, H), scope).await;
        h.loader.idle().await;
        assert_eq!(h.store.claim_range_calls().await, vec![Span::new(0, H)]);
        assert!(h.cache.claim(5).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn first_load_selects_a_task() {
        let store = MemoryStore::new()
            .with_tasks([Task::new(1, 0, 30 * MINUTE_MS), Task::new(2, 40 * MINUTE_MS, H)])
            .await;
        let h = harness(store, SyncConfig::default()).await;
        h.loader.request_window(Span::new(0, H), normal()).await;
        h.loader.idle().await;
        // clock sits at 0: task 1 is running
        assert_eq!(h.selection.read().await.ids(), &[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_load_keeps_existing_selection() {
        let store = MemoryStore::new().with_tasks([Task::new(1, 0, H)]).await;
        let h = harness(store, SyncConfig::default()).await;
        h.selection.write().await.select([42]);
        h.loader.request_window(Span::new(0, H), normal()).await;
        h.loader.idle().await;
        assert_eq!(h.selection.read().await.ids(), &[42]);
    }

    #[tokio::test(start_paused = true)]
    async fn results_for_stale_scope_are_dropped() {
        let store = MemoryStore::new().with_tasks([Task::new(1, 0, H)]).await;
        store.set_range_delay(Some(Duration::from_secs(1))).await;
        let h = harness(store, SyncConfig::default()).await;

        h.loader.request_window(Span::new(0, H), normal()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.loader
            .rescope(LoadScope {
                mode: Mode::Project(Some(3)),
                track_claims: false,
            })
            .await;
        h.loader.idle().await;

        assert!(h.cache.tasks().await.is_empty());
        assert!(h.loader.loaded().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_scope_failure_is_not_retried() {
        let store = MemoryStore::new().with_tasks([Task::new(1, 0, H)]).await;
        store.set_range_delay(Some(Duration::from_secs(1))).await;
        store.fail_next_ranges(1);
        let h = harness(store, SyncConfig::default()).await;

        h.loader.request_window(Span::new(0, H), normal()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.loader
            .rescope(LoadScope {
                mode: Mode::Project(Some(3)),
                track_claims: false,
            })
            .await;
        h.loader.idle().await;

        assert_eq!(h.store.task_range_calls().await.len(), 1);
        assert!(h.loader.loaded().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_workers_stop() {
        let store = MemoryStore::new();
        store.set_range_delay(Some(Duration::from_secs(10))).await;
        let store = Arc::new(store);
        let cancel = CancellationToken::new();
        let loader = Arc::new(ChunkLoader::new(
            store.clone(),
            Arc::new(EntityCache::new()),
            Arc::new(RwLock::new(Selection::new())),
            Arc::new(ServerClock::starting_at(0)),
            SyncConfig::default(),
            cancel.clone(),
        ));
        loader.request_window(Span::new(0, 5 * H), normal()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        // only the first worker got going before cancellation
        assert_eq!(store.task_range_calls().await.len(), 1);
        assert!(loader.loaded().await.is_empty());
    }
}
