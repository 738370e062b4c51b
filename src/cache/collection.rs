use std::collections::{HashMap, HashSet};

use crate::model::{Bounds, Entity, Span};

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

/// Ordered collection of entities plus its id index.
///
/// Order lives in `order`; the entities themselves live in `by_id`. Both are
/// only ever changed together by the methods below, so the key set of
/// `by_id` always equals the set of ids in `order`.
#[derive(Debug, Clone)]
pub struct Collection<E: Entity> {
    order: Vec<E::Id>,
    by_id: HashMap<E::Id, E>,
    bounds: Bounds,
    changes: u64,
}

impl<E: Entity> Default for Collection<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Collection<E> {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            by_id: HashMap::new(),
            bounds: Bounds::UNBOUNDED,
            changes: 0,
        }
    }

    /// Build from an ordered list. The list is scanned in reverse so that if an
    /// id occurs twice the earliest occurrence is the one kept.
    pub fn from_ordered(items: Vec<E>) -> Self {
        let mut by_id = HashMap::with_capacity(items.len());
        for item in items.iter().rev() {
            by_id.insert(item.id(), item.clone());
        }
        let mut seen = HashSet::with_capacity(by_id.len());
        let order: Vec<E::Id> = items
            .iter()
            .map(|item| item.id())
            .filter(|id| seen.insert(*id))
            .collect();
        let mut collection = Self {
            order,
            by_id,
            bounds: Bounds::UNBOUNDED,
            changes: 0,
        };
        collection.recompute_bounds();
        collection
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &E::Id) -> Option<&E> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &E::Id) -> bool {
        self.by_id.contains_key(id)
    }

    /// Entities in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn ids(&self) -> &[E::Id] {
        &self.order
    }

    pub fn index(&self) -> &HashMap<E::Id, E> {
        &self.by_id
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn bounds_where(&self, filter: impl Fn(&E) -> bool) -> Bounds {
        Bounds::of(self.iter().filter(|e| filter(e)))
    }

    /// Bumped on every observable mutation.
    pub fn change_count(&self) -> u64 {
        self.changes
    }

    /// Insert, or merge a complete record into the cached one. Every field of
    /// `entity` counts as supplied, so an unset optional clears the cached
    /// value. Partial updates go through [`Collection::patch`].
    pub fn upsert(&mut self, entity: E) -> Upsert {
        let id = entity.id();
        match self.by_id.get_mut(&id) {
            Some(existing) => {
                if existing.apply(&entity.to_patch()) {
                    self.touched();
                    Upsert::Updated
                } else {
                    Upsert::Unchanged
                }
            }
            None => {
                self.order.push(id);
                self.by_id.insert(id, entity);
                self.touched();
                Upsert::Inserted
            }
        }
    }

    /// Merge `patch` into an existing entity. `None` if the id is unknown.
    pub fn patch(&mut self, id: &E::Id, patch: &E::Patch) -> Option<bool> {
        let existing = self.by_id.get_mut(id)?;
        let changed = existing.apply(patch);
        if changed {
            self.touched();
        }
        Some(changed)
    }

    pub fn remove(&mut self, id: &E::Id) -> Option<E> {
        let removed = self.by_id.remove(id)?;
        if let Some(pos) = self.order.iter().rposition(|o| o == id) {
            self.order.remove(pos);
        }
        self.touched();
        Some(removed)
    }

    /// Keep only entities matching `keep`, rebuilding the index from the
    /// surviving ordered list. Returns the ids that were dropped.
    pub fn retain(&mut self, keep: impl Fn(&E) -> bool) -> Vec<E::Id> {
        let mut kept = Vec::with_capacity(self.order.len());
        let mut dropped = Vec::new();
        for id in &self.order {
            if let Some(entity) = self.by_id.get(id) {
                if keep(entity) {
                    kept.push(entity.clone());
                } else {
                    dropped.push(*id);
                }
            }
        }
        let changes = self.changes + 1;
        *self = Self::from_ordered(kept);
        self.changes = changes;
        dropped
    }

    /// Drop everything outside `window` (closed on both ends).
    pub fn prune(&mut self, window: &Span) -> Vec<E::Id> {
        self.retain(|e| window.retains(e.start(), e.end()))
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.by_id.clear();
        self.touched();
    }

    pub fn recompute_bounds(&mut self) {
        self.bounds = Bounds::of(self.iter());
    }

    fn touched(&mut self) {
        self.changes += 1;
        self.recompute_bounds();
    }
}
