use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::{Allocation, ResourceState, Span};

/// The Time-Range Store: every schedulable resource with its sorted
/// allocation timeline, plus an allocation → resource index so releases
/// never scan.
///
/// Each resource sits behind its own `RwLock`. The write guard is the
/// serializable critical section: reserve paths hold it across the overlap
/// check, the journal append, and the timeline insert, so two concurrent
/// overlapping attempts on one resource cannot both pass the check.
pub struct TimeRangeStore {
    resources: DashMap<Ulid, Arc<RwLock<ResourceState>>>,
    alloc_index: DashMap<Ulid, Ulid>,
}

impl TimeRangeStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            alloc_index: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, id: Ulid) -> bool {
        self.resources.contains_key(&id)
    }

    /// Register a resource. Returns false if the id is already present.
    pub fn insert(&self, state: ResourceState) -> bool {
        let id = state.id;
        if self.resources.contains_key(&id) {
            return false;
        }
        self.resources.insert(id, Arc::new(RwLock::new(state)));
        true
    }

    /// Clone out the lock handle so callers never hold a DashMap shard
    /// guard across an await.
    pub fn handle(&self, id: Ulid) -> Option<Arc<RwLock<ResourceState>>> {
        self.resources.get(&id).map(|e| e.value().clone())
    }

    /// Handles for every resource, for sweep-style queries.
    pub fn snapshot_handles(&self) -> Vec<(Ulid, Arc<RwLock<ResourceState>>)> {
        self.resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Which resource owns this allocation.
    pub fn resource_of_allocation(&self, alloc_id: Ulid) -> Option<Ulid> {
        self.alloc_index.get(&alloc_id).map(|e| *e.value())
    }

    pub fn index_allocation(&self, alloc_id: Ulid, resource_id: Ulid) {
        self.alloc_index.insert(alloc_id, resource_id);
    }

    pub fn unindex_allocation(&self, alloc_id: Ulid) {
        self.alloc_index.remove(&alloc_id);
    }

    /// Overlap query without mutation intent: takes a read guard, clones the
    /// hits. Reserve paths do NOT use this — they query under their own
    /// write guard via `ResourceState::overlapping`.
    pub async fn find_overlaps(
        &self,
        resource_id: Ulid,
        span: &Span,
        exclude_booking: Option<Ulid>,
    ) -> Option<Vec<Allocation>> {
        let handle = self.handle(resource_id)?;
        let guard = handle.read().await;
        Some(guard.overlapping(span, exclude_booking).cloned().collect())
    }
}

impl Default for TimeRangeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceProfile;
    use crate::tenant::Tenant;

    fn room(id: Ulid) -> ResourceState {
        ResourceState::new(
            id,
            ResourceProfile::Room {
                name: "Room 1".into(),
                capacity: 10,
                active: true,
                device_equipped: false,
            },
        )
    }

    fn alloc(start: i64, end: i64, booking_id: Ulid) -> Allocation {
        Allocation {
            id: Ulid::new(),
            span: Span::new(start, end),
            booking_id,
            tenant: Tenant::parse("TECH").unwrap(),
        }
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let store = TimeRangeStore::new();
        let id = Ulid::new();
        assert!(store.insert(room(id)));
        assert!(!store.insert(room(id)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn find_overlaps_reports_hits() {
        let store = TimeRangeStore::new();
        let rid = Ulid::new();
        store.insert(room(rid));

        let handle = store.handle(rid).unwrap();
        {
            let mut guard = handle.write().await;
            guard.insert_allocation(alloc(100, 200, Ulid::new()));
            guard.insert_allocation(alloc(300, 400, Ulid::new()));
        }

        let hits = store
            .find_overlaps(rid, &Span::new(150, 350), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        let none = store
            .find_overlaps(rid, &Span::new(200, 300), None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn find_overlaps_unknown_resource() {
        let store = TimeRangeStore::new();
        assert!(
            store
                .find_overlaps(Ulid::new(), &Span::new(0, 1), None)
                .await
                .is_none()
        );
    }

    #[test]
    fn allocation_index_roundtrip() {
        let store = TimeRangeStore::new();
        let rid = Ulid::new();
        let aid = Ulid::new();
        store.index_allocation(aid, rid);
        assert_eq!(store.resource_of_allocation(aid), Some(rid));
        store.unindex_allocation(aid);
        assert_eq!(store.resource_of_allocation(aid), None);
    }
}
