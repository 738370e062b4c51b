use dashmap::DashMap;

use crate::model::*;

/// Known resources by id, patched by capacity and availability changes.
#[derive(Default)]
pub struct ResourceDirectory {
    resources: DashMap<ResourceId, Resource>,
}

impl ResourceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the directory contents.
    pub fn load(&self, resources: Vec<Resource>) {
        self.resources.clear();
        for r in resources {
            self.resources.insert(r.id, r);
        }
    }

    pub fn get(&self, id: ResourceId) -> Option<Resource> {
        self.resources.get(&id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns false if the resource is unknown.
    pub fn apply_capacity(&self, change: &CapacityChange) -> bool {
        match self.resources.get_mut(&change.resource_id) {
            Some(mut r) => {
                r.available_capacity = Some(change.available);
                r.total_capacity = Some(change.total);
                true
            }
            None => false,
        }
    }

    pub fn apply_availability(&self, change: &AvailabilityChange) -> bool {
        match self.resources.get_mut(&change.resource_id) {
            Some(mut r) => {
                r.active = Some(change.total);
                true
            }
            None => false,
        }
    }
}
