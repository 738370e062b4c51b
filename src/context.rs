use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, RwLockReadGuard, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{Collection, EntityCache};
use crate::clock::{self, ServerClock};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::EventLog;
use crate::feed::ChangeFeed;
use crate::loader::{ChunkLoader, Progress};
use crate::lookup::Lookup;
use crate::model::*;
use crate::mutator::{Mutator, PollPolicy};
use crate::resources::ResourceDirectory;
use crate::selection::Selection;
use crate::store::RemoteStore;
use crate::window::{ViewState, WindowController};

/// One synchronised view of the remote store.
///
/// `create` wires the components, `start` performs the initial loads and
/// spawns the background loops, `dispose` stops them. Every operation after
/// `dispose` fails with [`SyncError::Disposed`].
pub struct SyncContext {
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
    cache: Arc<EntityCache>,
    selection: Arc<RwLock<Selection>>,
    clock: Arc<ServerClock>,
    resources: Arc<ResourceDirectory>,
    events: Arc<RwLock<EventLog>>,
    loader: Arc<ChunkLoader>,
    window: Arc<WindowController>,
    feed: Arc<ChangeFeed>,
    lookup: Arc<Lookup>,
    mutator: Mutator,
    remote_config: RwLock<serde_json::Value>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncContext {
    pub fn create(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let cache = Arc::new(EntityCache::new());
        let selection = Arc::new(RwLock::new(Selection::new()));
        let clock = Arc::new(ServerClock::new());
        let resources = Arc::new(ResourceDirectory::new());
        let events = Arc::new(RwLock::new(EventLog::new(config.event_retention)));

        let loader = Arc::new(ChunkLoader::new(
            store.clone(),
            cache.clone(),
            selection.clone(),
            clock.clone(),
            config.clone(),
            cancel.child_token(),
        ));
        let window = Arc::new(WindowController::new(
            store.clone(),
            cache.clone(),
            loader.clone(),
            selection.clone(),
            clock.clone(),
            &config,
        ));
        let feed = Arc::new(ChangeFeed::new(
            store.clone(),
            cache.clone(),
            resources.clone(),
            events.clone(),
            clock.clone(),
            window.subscribe(),
            config.feed_timeout,
            config.feed_backoff,
        ));
        let lookup = Arc::new(Lookup::new(store.clone(), cache.clone(), window.subscribe()));
        let mutator = Mutator::new(store.clone(), cache.clone(), lookup.clone());

        Arc::new(Self {
            store,
            config,
            cache,
            selection,
            clock,
            resources,
            events,
            loader,
            window,
            feed,
            lookup,
            mutator,
            remote_config: RwLock::new(serde_json::Value::Null),
            cancel,
            background: Mutex::new(Vec::new()),
        })
    }

    fn live(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Initial loads, then the feed, auto-follow and clock-sync loops.
    ///
    /// Only a failure to read the latest change number is fatal: without it
    /// the feed would replay history. Ancillary loads log and carry on.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.live()?;
        match self.store.server_time().await {
            Ok(now) => self.clock.observe(now),
            Err(e) => warn!("server time unavailable, using local clock: {e}"),
        }
        self.feed.seed_cursor().await?;
        self.load_ancillary().await;
        // the initial window was placed on the local clock
        self.window.jump_to_now().await;

        let mut background = self.background.lock().await;
        background.push(tokio::spawn(self.feed.clone().run(self.cancel.clone())));
        background.push(tokio::spawn(
            self.window
                .clone()
                .run_auto_follow(self.config.auto_follow_interval, self.cancel.clone()),
        ));
        background.push(tokio::spawn(clock::run_clock_sync(
            self.clock.clone(),
            self.store.clone(),
            self.config.clock_sync_interval,
            self.config.clock_sync_timeout,
            self.cancel.clone(),
        )));
        let view = self.window.view();
        info!(
            window_start = %format_instant(view.window.start),
            window_end = %format_instant(view.window.end),
            cursor = ?self.feed.cursor(),
            "sync context started"
        );
        Ok(())
    }

    async fn load_ancillary(&self) {
        match self.store.config().await {
            Ok(config) => *self.remote_config.write().await = config,
            Err(e) => warn!("remote config: {e}"),
        }
        match self.store.resources().await {
            Ok(resources) => self.resources.load(resources),
            Err(e) => warn!("resources: {e}"),
        }
        match self.store.recent_log_events().await {
            Ok(events) => self.events.write().await.extend(events, self.clock.now()),
            Err(e) => warn!("log events: {e}"),
        }
    }

    /// Cancel the background loops and chunk workers and wait for the loops
    /// to finish. Idempotent.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("background task ended abnormally: {e}");
            }
        }
        info!("sync context disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ── Collections ──────────────────────────────────────────

    pub async fn tasks(&self) -> RwLockReadGuard<'_, Collection<Task>> {
        self.cache.tasks().await
    }

    pub async fn claims(&self) -> RwLockReadGuard<'_, Collection<ResourceClaim>> {
        self.cache.claims().await
    }

    pub async fn task(&self, id: TaskId) -> Option<Task> {
        self.cache.task(id).await
    }

    pub async fn claim(&self, id: ClaimId) -> Option<ResourceClaim> {
        self.cache.claim(id).await
    }

    pub async fn task_bounds(&self) -> Bounds {
        self.cache.task_bounds().await
    }

    pub async fn claim_bounds(&self) -> Bounds {
        self.cache.claim_bounds().await
    }

    pub async fn task_changes(&self) -> u64 {
        self.cache.task_changes().await
    }

    pub async fn claim_changes(&self) -> u64 {
        self.cache.claim_changes().await
    }

    pub fn resource(&self, id: ResourceId) -> Option<Resource> {
        self.resources.get(id)
    }

    pub async fn remote_config(&self) -> serde_json::Value {
        self.remote_config.read().await.clone()
    }

    /// Log events still within the retention age, oldest first.
    pub async fn log_events(&self) -> Vec<LogEvent> {
        let mut events = self.events.write().await;
        events.prune(self.clock.now());
        events.iter().cloned().collect()
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    // ── View ─────────────────────────────────────────────────

    pub fn view(&self) -> ViewState {
        self.window.view()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ViewState> {
        self.window.subscribe()
    }

    pub async fn set_window(&self, from: Ms, to: Ms) -> Result<(), SyncError> {
        self.live()?;
        self.window.set_window(from, to).await;
        Ok(())
    }

    pub async fn set_mode(&self, mode: Mode) -> Result<(), SyncError> {
        self.live()?;
        self.window.set_mode(mode).await;
        Ok(())
    }

    pub async fn set_claim_tracking(&self, on: bool) -> Result<(), SyncError> {
        self.live()?;
        self.window.set_claim_tracking(on).await;
        Ok(())
    }

    pub async fn set_auto_follow(&self, on: bool) -> Result<(), SyncError> {
        self.live()?;
        self.window.set_auto_follow(on).await;
        Ok(())
    }

    pub async fn set_zoom(&self, zoom: Ms) -> Result<(), SyncError> {
        self.live()?;
        self.window.set_zoom(zoom).await;
        Ok(())
    }

    pub async fn jump_to_now(&self) -> Result<(), SyncError> {
        self.live()?;
        self.window.jump_to_now().await;
        Ok(())
    }

    pub async fn scroll_back(&self) -> Result<(), SyncError> {
        self.live()?;
        self.window.scroll_back().await;
        Ok(())
    }

    pub async fn scroll_forward(&self) -> Result<(), SyncError> {
        self.live()?;
        self.window.scroll_forward().await;
        Ok(())
    }

    pub async fn focus_tasks(&self, ids: &[TaskId]) -> Result<(), SyncError> {
        self.live()?;
        self.window.focus_tasks(ids).await;
        Ok(())
    }

    pub async fn focus_selection(&self) -> Result<(), SyncError> {
        self.live()?;
        self.window.focus_selection().await;
        Ok(())
    }

    // ── Selection ────────────────────────────────────────────

    pub async fn select(&self, ids: impl IntoIterator<Item = TaskId>) {
        self.selection.write().await.select(ids);
    }

    pub async fn toggle(&self, id: TaskId) -> bool {
        self.selection.write().await.toggle(id)
    }

    pub async fn is_selected(&self, id: TaskId) -> bool {
        self.selection.read().await.is_selected(id)
    }

    pub async fn selected(&self) -> Vec<TaskId> {
        self.selection.read().await.ids().to_vec()
    }

    /// Fetch a whole group and select it.
    pub async fn select_group(&self, group_id: u64) -> Result<(), SyncError> {
        self.live()?;
        self.lookup.group(group_id).await?;
        let tasks = self.cache.tasks().await;
        self.selection.write().await.select_group(&tasks, group_id);
        Ok(())
    }

    // ── Remote operations ────────────────────────────────────

    pub async fn write(&self, id: TaskId, patch: TaskPatch) -> Result<(), SyncError> {
        self.live()?;
        self.mutator.write_task(id, patch).await
    }

    pub async fn copy_task(&self, id: TaskId) -> Result<(), SyncError> {
        self.live()?;
        self.mutator.copy_task(id).await
    }

    pub async fn lookup_task(&self, key: TaskKey, force_reload: bool) -> Result<Option<Task>, SyncError> {
        self.live()?;
        self.lookup.task(key, force_reload).await
    }

    pub async fn obsolete_successors(&self, id: TaskId, policy: PollPolicy) -> Result<Vec<TaskId>, SyncError> {
        self.live()?;
        self.mutator.obsolete_successors(id, policy).await
    }

    // ── Progress ─────────────────────────────────────────────

    pub fn progress(&self) -> Progress {
        self.loader.progress()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.loader.subscribe()
    }

    /// Resolve once the loader has nothing pending or in flight.
    pub async fn idle(&self) {
        self.loader.idle().await;
    }

    pub fn cursor(&self) -> Option<u64> {
        self.feed.cursor()
    }

    pub fn subscribe_cursor(&self) -> watch::Receiver<Option<u64>> {
        self.feed.subscribe_cursor()
    }
}
