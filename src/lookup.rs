use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::cache::EntityCache;
use crate::error::SyncError;
use crate::model::*;
use crate::store::RemoteStore;
use crate::window::ViewState;

/// Single-task and group lookups that fall back to the remote store and
/// keep what they fetch.
///
/// Fetched tasks are cached whatever the window, so a group can be selected
/// and then focused. In project mode tasks of other projects are returned but
/// not cached.
pub struct Lookup {
    store: Arc<dyn RemoteStore>,
    cache: Arc<EntityCache>,
    view: watch::Receiver<ViewState>,
}

impl Lookup {
    pub fn new(store: Arc<dyn RemoteStore>, cache: Arc<EntityCache>, view: watch::Receiver<ViewState>) -> Self {
        Self { store, cache, view }
    }

    fn mode(&self) -> Mode {
        self.view.borrow().mode
    }

    /// The cached task for `key`, or the store's when it is not cached or
    /// `force_reload` is set. A fetched task is merged into the cache.
    pub async fn task(&self, key: TaskKey, force_reload: bool) -> Result<Option<Task>, SyncError> {
        if !force_reload {
            let tasks = self.cache.tasks().await;
            let cached = match key {
                TaskKey::Id(id) => tasks.get(&id).cloned(),
                _ => tasks.iter().find(|t| key.matches(t)).cloned(),
            };
            if cached.is_some() {
                return Ok(cached);
            }
        }
        let Some(task) = self.store.task(key).await? else {
            debug!(?key, "task not in store");
            return Ok(None);
        };
        let mode = self.mode();
        self.cache.merge_tasks(vec![task.clone()], |t| mode.accepts_task(t)).await;
        Ok(Some(task))
    }

    /// Every task of a group, fetched and merged.
    pub async fn group(&self, group_id: u64) -> Result<Vec<Task>, SyncError> {
        let tasks = self.store.tasks_in_group(group_id).await?;
        let mode = self.mode();
        let report = self.cache.merge_tasks(tasks.clone(), |t| mode.accepts_task(t)).await;
        debug!(group_id, inserted = report.inserted, skipped = report.skipped, "group loaded");
        Ok(tasks)
    }
}
