use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_span, validate_text, validate_window};
use super::{Engine, EngineError};

/// Headcount above this fraction of capacity draws a warning.
const CAPACITY_WARN_RATIO: f64 = 0.9;

fn room_info(id: Ulid, rs: &ResourceState) -> Option<RoomInfo> {
    match &rs.profile {
        ResourceProfile::Room {
            name,
            capacity,
            active,
            device_equipped,
        } => Some(RoomInfo {
            id,
            name: name.clone(),
            capacity: *capacity,
            active: *active,
            device_equipped: *device_equipped,
        }),
        _ => None,
    }
}

impl Engine {
    pub async fn register_room(
        &self,
        name: &str,
        capacity: u32,
        device_equipped: bool,
    ) -> Result<RoomInfo, EngineError> {
        validate_text(name, "name", MAX_NAME_LEN)?;
        if name.trim().is_empty() {
            return Err(EngineError::Validation("room name is empty".into()));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("room capacity must be > 0".into()));
        }
        if self.store.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let id = Ulid::new();
        self.wal_append(&Event::RoomRegistered {
            id,
            name: name.to_string(),
            capacity,
            device_equipped,
        })
        .await?;
        self.store.insert(ResourceState::new(
            id,
            ResourceProfile::Room {
                name: name.to_string(),
                capacity,
                active: true,
                device_equipped,
            },
        ));
        Ok(RoomInfo {
            id,
            name: name.to_string(),
            capacity,
            active: true,
            device_equipped,
        })
    }

    /// Take a room out of service. Historical bookings keep referencing it;
    /// rooms are never deleted.
    pub async fn deactivate_room(&self, room_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        if !actor.caps.reviewer {
            return Err(EngineError::Forbidden("room deactivation requires reviewer"));
        }
        let handle = self
            .store
            .handle(room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let mut rs = handle.write().await;
        let ResourceProfile::Room { active, .. } = &mut rs.profile else {
            return Err(EngineError::Validation(format!("{room_id} is not a room")));
        };
        if !*active {
            return Err(EngineError::Validation(format!(
                "room {room_id} is already inactive"
            )));
        }
        let now = now_ms();
        if rs.allocations.iter().any(|a| a.span.end > now) {
            return Err(EngineError::Validation(
                "room has upcoming bookings".into(),
            ));
        }
        self.wal_append(&Event::ResourceRetired { id: room_id, at: now })
            .await?;
        if let ResourceProfile::Room { active, .. } = &mut rs.profile {
            *active = false;
        }
        Ok(())
    }

    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let mut out = Vec::new();
        for (id, handle) in self.store.snapshot_handles() {
            let rs = handle.read().await;
            if let Some(info) = room_info(id, &rs) {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Advisory conflict preview: what currently opposes this span on this
    /// room, and whether the asking actor could override. Read-only — the
    /// authoritative check re-runs under the room's write guard at bind time.
    pub async fn check_room_conflicts(
        &self,
        room_id: Ulid,
        span: &Span,
        exclude_booking: Option<Ulid>,
        actor: &Actor,
    ) -> Result<ConflictReport, EngineError> {
        validate_span(span)?;
        let handle = self
            .store
            .handle(room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let hits: Vec<Allocation> = {
            let rs = handle.read().await;
            if !rs.is_room() {
                return Err(EngineError::Validation(format!("{room_id} is not a room")));
            }
            rs.overlapping(span, exclude_booking).cloned().collect()
        };
        let conflicts = self.conflict_entries(&hits).await;
        Ok(ConflictReport {
            has_conflict: !conflicts.is_empty(),
            conflicts,
            can_override: actor.caps.reviewer,
        })
    }

    /// Capacity fit: invalid above capacity, warning above 90% of it.
    pub async fn validate_capacity(
        &self,
        room_id: Ulid,
        headcount: u32,
    ) -> Result<CapacityCheck, EngineError> {
        let handle = self
            .store
            .handle(room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let rs = handle.read().await;
        let ResourceProfile::Room { capacity, name, .. } = &rs.profile else {
            return Err(EngineError::Validation(format!("{room_id} is not a room")));
        };
        let capacity = *capacity;
        let (valid, warning, message) = if headcount > capacity {
            (
                false,
                false,
                format!("{headcount} exceeds capacity {capacity} of {name}"),
            )
        } else if f64::from(headcount) > f64::from(capacity) * CAPACITY_WARN_RATIO {
            (
                true,
                true,
                format!("{headcount} is close to capacity {capacity} of {name}"),
            )
        } else {
            (true, false, String::new())
        };
        Ok(CapacityCheck {
            valid,
            warning,
            capacity,
            headcount,
            message,
        })
    }

    /// Active rooms free for the whole span, largest first.
    pub async fn find_available_rooms(
        &self,
        span: &Span,
        min_capacity: u32,
        need_devices: bool,
    ) -> Result<Vec<RoomInfo>, EngineError> {
        validate_span(span)?;
        let mut out = Vec::new();
        for (id, handle) in self.store.snapshot_handles() {
            let rs = handle.read().await;
            let Some(info) = room_info(id, &rs) else {
                continue;
            };
            if !info.active
                || info.capacity < min_capacity
                || (need_devices && !info.device_equipped)
            {
                continue;
            }
            if rs.overlapping(span, None).next().is_none() {
                out.push(info);
            }
        }
        out.sort_by(|a, b| b.capacity.cmp(&a.capacity).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    /// Who occupies a room inside a window, for the reviewer's calendar.
    pub async fn room_occupancy(
        &self,
        room_id: Ulid,
        window: &Span,
    ) -> Result<Vec<ConflictEntry>, EngineError> {
        validate_window(window)?;
        let handle = self
            .store
            .handle(room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let hits: Vec<Allocation> = {
            let rs = handle.read().await;
            if !rs.is_room() {
                return Err(EngineError::Validation(format!("{room_id} is not a room")));
            }
            rs.overlapping(window, None).cloned().collect()
        };
        let mut entries = self.conflict_entries(&hits).await;
        entries.sort_by_key(|e| e.span.start);
        Ok(entries)
    }
}
