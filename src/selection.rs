use crate::cache::Collection;
use crate::model::*;

/// Task ids the consumer is interested in, in selection order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    ids: Vec<TaskId>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> &[TaskId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_selected(&self, id: TaskId) -> bool {
        self.ids.contains(&id)
    }

    /// Replace the selection.
    pub fn select(&mut self, ids: impl IntoIterator<Item = TaskId>) {
        self.ids.clear();
        for id in ids {
            self.add(id);
        }
    }

    pub fn add(&mut self, id: TaskId) {
        if !self.is_selected(id) {
            self.ids.push(id);
        }
    }

    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.ids.iter().position(|s| *s == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Returns whether `id` is selected afterwards.
    pub fn toggle(&mut self, id: TaskId) -> bool {
        if self.remove(id) {
            false
        } else {
            self.ids.push(id);
            true
        }
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Drop ids the task index can no longer resolve. Returns the dropped ids.
    pub fn retain_resolvable(&mut self, tasks: &Collection<Task>) -> Vec<TaskId> {
        let mut dropped = Vec::new();
        self.ids.retain(|id| {
            let keep = tasks.contains(id);
            if !keep {
                dropped.push(*id);
            }
            keep
        });
        dropped
    }

    /// Select every cached task of `group_id`.
    pub fn select_group(&mut self, tasks: &Collection<Task>, group_id: u64) {
        self.select(tasks.iter().filter(|t| t.group_id == Some(group_id)).map(|t| t.id));
    }

    /// Pick one task to start with: the one running at `now`, else the next to
    /// start, else the most recently ended, else the first in the collection.
    pub fn select_initial(&mut self, tasks: &Collection<Task>, now: Ms) -> Option<TaskId> {
        let current = tasks.iter().find(|t| t.start <= now && t.end >= now);
        let next = || tasks.iter().filter(|t| t.start >= now).min_by_key(|t| t.start);
        let recent = || tasks.iter().filter(|t| t.end <= now).max_by_key(|t| t.end);
        let pick = current
            .or_else(next)
            .or_else(recent)
            .or_else(|| tasks.iter().next())?
            .id;
        self.select([pick]);
        Some(pick)
    }
}
