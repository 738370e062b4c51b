use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::EntityCache;
use crate::clock::ServerClock;
use crate::config::SyncConfig;
use crate::loader::ChunkLoader;
use crate::model::*;
use crate::selection::Selection;
use crate::store::RemoteStore;

/// What the consumer is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewState {
    pub window: Span,
    pub mode: Mode,
    pub track_claims: bool,
    /// Cleared by any manual navigation.
    pub auto_follow: bool,
    pub zoom: Ms,
}

impl ViewState {
    pub fn scope(&self) -> LoadScope {
        LoadScope {
            mode: self.mode,
            track_claims: self.track_claims,
        }
    }
}

/// Owns the view window and mode. Every change evicts what fell outside,
/// rebuilds the selection against the new index and asks the loader to fill
/// the gaps.
pub struct WindowController {
    store: Arc<dyn RemoteStore>,
    cache: Arc<EntityCache>,
    loader: Arc<ChunkLoader>,
    selection: Arc<RwLock<Selection>>,
    clock: Arc<ServerClock>,
    granularity: Ms,
    view: watch::Sender<ViewState>,
    /// Serialises window changes.
    apply: Mutex<()>,
}

impl WindowController {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<EntityCache>,
        loader: Arc<ChunkLoader>,
        selection: Arc<RwLock<Selection>>,
        clock: Arc<ServerClock>,
        config: &SyncConfig,
    ) -> Self {
        let now = clock.now();
        let initial = ViewState {
            window: follow_window(now, config.zoom, config.granularity_ms()),
            mode: Mode::Normal,
            track_claims: config.track_claims,
            auto_follow: config.auto_follow,
            zoom: config.zoom,
        };
        let (view, _) = watch::channel(initial);
        Self {
            store,
            cache,
            loader,
            selection,
            clock,
            granularity: config.granularity_ms(),
            view,
            apply: Mutex::new(()),
        }
    }

    pub fn view(&self) -> ViewState {
        *self.view.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }

    /// Manual navigation; stops auto-follow.
    pub async fn set_window(&self, from: Ms, to: Ms) {
        self.view.send_modify(|v| v.auto_follow = false);
        self.apply_window(from, to).await;
    }

    /// Re-apply the current window, e.g. after start-up.
    pub async fn reload(&self) {
        let window = self.view().window;
        self.apply_window(window.start, window.end).await;
    }

    async fn apply_window(&self, from: Ms, to: Ms) {
        let _guard = self.apply.lock().await;
        let window = self.align(from, to);
        self.view.send_modify(|v| v.window = window);
        info!("view window {}..{}", format_instant(window.start), format_instant(window.end));

        let (dropped_tasks, dropped_claims) = self.cache.prune(&window).await;
        let deselected = {
            let tasks = self.cache.tasks().await;
            self.selection.write().await.retain_resolvable(&tasks)
        };
        if !dropped_tasks.is_empty() || !dropped_claims.is_empty() {
            debug!(
                tasks = dropped_tasks.len(),
                claims = dropped_claims.len(),
                deselected = deselected.len(),
                "evicted out-of-window entities"
            );
        }
        self.loader.prune(&window).await;
        self.cache.recompute_bounds().await;
        self.loader.request_window(window, self.view().scope()).await;
    }

    /// Floor the start and ceil the end to the granularity. An empty or
    /// inverted result is widened to one zoom width.
    fn align(&self, from: Ms, to: Ms) -> Span {
        let start = floor_to(from, self.granularity);
        let mut end = ceil_to(to, self.granularity);
        if end <= start {
            end = floor_to(start + self.view().zoom, self.granularity).max(start + self.granularity);
        }
        Span::new(start, end)
    }

    /// Switch between normal and project mode. Tasks are cleared; in project
    /// mode the window jumps to the project's full time extent when known.
    pub async fn set_mode(&self, mode: Mode) {
        if self.view().mode == mode {
            return;
        }
        self.view.send_modify(|v| {
            v.mode = mode;
            if mode.is_project() {
                v.auto_follow = false;
            }
        });
        info!(?mode, "mode changed");
        self.loader.rescope(self.view().scope()).await;
        self.clear_tasks().await;
        if mode.is_project() {
            self.cache.clear_claims().await;
        }

        let mut window = self.view().window;
        if let Mode::Project(Some(project)) = mode {
            match self.store.project_time_window(project).await {
                Ok(Some(extent)) => window = extent,
                Ok(None) => debug!(project, "project has no tasks"),
                Err(e) => warn!(project, "project time window: {e}"),
            }
        }
        self.apply_window(window.start, window.end).await;
    }

    async fn clear_tasks(&self) {
        self.cache.clear_tasks().await;
        let tasks = self.cache.tasks().await;
        self.selection.write().await.retain_resolvable(&tasks);
    }

    /// Turning claim tracking on refetches the window; off drops cached claims.
    pub async fn set_claim_tracking(&self, on: bool) {
        if self.view().track_claims == on {
            return;
        }
        self.view.send_modify(|v| v.track_claims = on);
        self.loader.rescope(self.view().scope()).await;
        if !on {
            self.cache.clear_claims().await;
        }
        self.reload().await;
    }

    /// Window = now − ¼·zoom … now + ¾·zoom.
    pub async fn jump_to_now(&self) {
        let view = self.view();
        let window = follow_window(self.clock.now(), view.zoom, self.granularity);
        self.apply_window(window.start, window.end).await;
    }

    pub async fn set_auto_follow(&self, on: bool) {
        self.view.send_modify(|v| v.auto_follow = on);
        if on {
            self.jump_to_now().await;
        }
    }

    /// Change the zoom width and re-centre: on now when following, else on the
    /// selected tasks, else on the middle of the current window.
    pub async fn set_zoom(&self, zoom: Ms) {
        self.view.send_modify(|v| v.zoom = zoom.max(self.granularity));
        let view = self.view();
        if view.auto_follow {
            return self.jump_to_now().await;
        }
        let focus = match self.selected_extent().await {
            Some(extent) => extent.start + extent.duration_ms() / 2,
            None => view.window.start + view.window.duration_ms() / 2,
        };
        let window = follow_window(focus, view.zoom, self.granularity);
        self.apply_window(window.start, window.end).await;
    }

    pub async fn scroll_back(&self) {
        self.scroll(-1).await;
    }

    pub async fn scroll_forward(&self) {
        self.scroll(1).await;
    }

    /// Shift by half a window.
    async fn scroll(&self, direction: Ms) {
        let window = self.view().window;
        let shift = direction * window.duration_ms() / 2;
        let from = floor_to(window.start + shift, self.granularity);
        let to = floor_to(window.end + shift, self.granularity);
        self.set_window(from, to).await;
    }

    /// Fit the window to the given cached tasks. Unknown ids are ignored.
    pub async fn focus_tasks(&self, ids: &[TaskId]) {
        let extent = {
            let tasks = self.cache.tasks().await;
            extent_of(ids.iter().filter_map(|id| tasks.get(id)))
        };
        if let Some(extent) = extent {
            self.set_window(extent.start, extent.end).await;
        }
    }

    pub async fn focus_selection(&self) {
        let ids = self.selection.read().await.ids().to_vec();
        self.focus_tasks(&ids).await;
    }

    async fn selected_extent(&self) -> Option<Span> {
        let ids = self.selection.read().await.ids().to_vec();
        let tasks = self.cache.tasks().await;
        extent_of(ids.iter().filter_map(|id| tasks.get(id)))
    }

    /// Background task: while auto-follow is on, re-centre on now.
    pub async fn run_auto_follow(self: Arc<Self>, every: std::time::Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.view().auto_follow {
                self.jump_to_now().await;
            }
        }
    }
}

/// Window around `focus`: a quarter of the zoom before, three quarters after.
pub fn follow_window(focus: Ms, zoom: Ms, granularity: Ms) -> Span {
    let start = floor_to(focus - zoom / 4, granularity);
    let end = floor_to(focus + zoom * 3 / 4, granularity);
    Span::new(start, end.max(start + granularity))
}

/// Earliest start to latest end; swapped if that comes out inverted.
fn extent_of<'a>(tasks: impl Iterator<Item = &'a Task>) -> Option<Span> {
    let bounds = Bounds::try_of(tasks)?;
    let (lo, hi) = if bounds.max <= bounds.min {
        (bounds.max, bounds.min)
    } else {
        (bounds.min, bounds.max)
    };
    Some(Span::new(lo, hi))
}
