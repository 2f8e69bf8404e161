use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::tenant::Tenant;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `[a1,a2)` and `[b1,b2)` overlap iff `a1 < b2 && b1 < a2`.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// True once the whole interval lies in the past.
    pub fn elapsed(&self, now: Ms) -> bool {
        self.end <= now
    }

    /// True once the interval has started (mid-use or past).
    pub fn started(&self, now: Ms) -> bool {
        self.start <= now
    }
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Available,
    Assigned,
    Offsite,
    Retired,
}

/// What a schedulable unit physically is. Rooms and devices share one
/// timeline type because the exclusion rule is identical for both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceProfile {
    Room {
        name: String,
        capacity: u32,
        active: bool,
        device_equipped: bool,
    },
    Device {
        /// Unique and immutable for the life of the device.
        serial: String,
        category: String,
        status: DeviceStatus,
    },
}

/// One binding of a resource to a time interval, owned by one booking.
/// Only occupying allocations live in a timeline: terminal bookings have
/// theirs removed, so the overlap query never sees cancelled/rejected work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub span: Span,
    pub booking_id: Ulid,
    /// Attribution only — never part of the exclusion key.
    pub tenant: Tenant,
}

/// A physical resource plus its timeline of active allocations,
/// sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub profile: ResourceProfile,
    pub allocations: Vec<Allocation>,
}

impl ResourceState {
    pub fn new(id: Ulid, profile: ResourceProfile) -> Self {
        Self {
            id,
            profile,
            allocations: Vec::new(),
        }
    }

    pub fn is_room(&self) -> bool {
        matches!(self.profile, ResourceProfile::Room { .. })
    }

    pub fn is_device(&self) -> bool {
        matches!(self.profile, ResourceProfile::Device { .. })
    }

    /// Whether the resource can take new allocations at all.
    pub fn schedulable(&self) -> bool {
        match &self.profile {
            ResourceProfile::Room { active, .. } => *active,
            ResourceProfile::Device { status, .. } => *status != DeviceStatus::Retired,
        }
    }

    pub fn device_category(&self) -> Option<&str> {
        match &self.profile {
            ResourceProfile::Device { category, .. } => Some(category),
            _ => None,
        }
    }

    /// Insert an allocation maintaining sort order by span.start.
    pub fn insert_allocation(&mut self, alloc: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&alloc.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, alloc);
    }

    pub fn remove_allocation(&mut self, id: Ulid) -> Option<Allocation> {
        self.allocations
            .iter()
            .position(|a| a.id == id)
            .map(|pos| self.allocations.remove(pos))
    }

    /// Remove every allocation owned by `booking_id`, returning them.
    pub fn remove_allocations_of(&mut self, booking_id: Ulid) -> Vec<Allocation> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.allocations.len() {
            if self.allocations[i].booking_id == booking_id {
                removed.push(self.allocations.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Allocations whose span overlaps the query window, optionally skipping
    /// one owning booking (the one being edited). Binary search skips
    /// everything starting at or after `query.end`.
    pub fn overlapping<'a>(
        &'a self,
        query: &'a Span,
        exclude_booking: Option<Ulid>,
    ) -> impl Iterator<Item = &'a Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.span.start < query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
            .filter(move |a| Some(a.booking_id) != exclude_booking)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    RoomAssigned,
    Confirmed,
    Completed,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Rejected | BookingStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::RoomAssigned => "room_assigned",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// Role modeled as a capability set rather than an enumerated list.
/// Legacy role names are mapped to capability combinations at the edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCaps {
    /// May assign rooms, reject bookings, and override room conflicts.
    #[serde(default)]
    pub reviewer: bool,
    /// May create bookings directly in Confirmed.
    #[serde(default)]
    pub elevated: bool,
    /// May assign, unassign, and reallocate devices.
    #[serde(default)]
    pub device_manager: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    #[serde(default)]
    pub caps: RoleCaps,
}

impl Actor {
    pub fn new(name: impl Into<String>, caps: RoleCaps) -> Self {
        Self {
            name: name.into(),
            caps,
        }
    }
}

/// Opaque passthrough payload (catering and supply flags). Kept as JSON on
/// the wire; encoded as its JSON text inside binary journal records, since
/// bincode cannot carry a self-describing `Value`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extras(pub serde_json::Value);

impl Serialize for Extras {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            serializer.serialize_str(&self.0.to_string())
        }
    }
}

impl<'de> Deserialize<'de> for Extras {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            serde_json::Value::deserialize(deserializer).map(Extras)
        } else {
            let text = String::deserialize(deserializer)?;
            serde_json::from_str(&text)
                .map(Extras)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// What a client submits. The engine validates only the fields it governs
/// (interval ordering, tenant validity, headcount); `extras` — catering and
/// supply flags — passes through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub client_name: String,
    pub contact_person: String,
    pub email: String,
    pub phone: String,
    pub span: Span,
    /// Requested room. A booking may exist with none — ghost inventory.
    #[serde(default)]
    pub room_id: Option<Ulid>,
    pub num_learners: u32,
    pub num_facilitators: u32,
    #[serde(default)]
    pub devices_needed: u32,
    #[serde(default)]
    pub device_category: Option<String>,
    /// Opaque to the core.
    #[serde(default)]
    pub extras: Extras,
    pub tenant: Tenant,
    #[serde(default)]
    pub notes: Option<String>,
}

/// The durable booking row. Never physically deleted — cancellation and
/// rejection are states, so the audit trail stays replayable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub client_name: String,
    pub contact_person: String,
    pub email: String,
    pub phone: String,
    pub span: Span,
    pub room_id: Option<Ulid>,
    /// Set only while a room allocation occupies the timeline.
    pub room_allocation_id: Option<Ulid>,
    pub num_learners: u32,
    pub num_facilitators: u32,
    pub devices_needed: u32,
    pub device_category: Option<String>,
    pub extras: Extras,
    pub tenant: Tenant,
    pub notes: Option<String>,
    pub status: BookingStatus,
    pub rejection_reason: Option<String>,
    pub override_note: Option<String>,
    pub created_by: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn headcount(&self) -> u32 {
        self.num_learners.saturating_add(self.num_facilitators)
    }
}

// ── Device assignments ───────────────────────────────────────────

/// Off-site rental sub-record, nullable until the device comes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rental {
    pub rental_no: String,
    pub contact_person: String,
    pub contact_number: String,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    pub address: String,
    pub expected_return: Ms,
    #[serde(default)]
    pub returned_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub device_id: Ulid,
    pub allocation_id: Ulid,
    pub offsite: bool,
    pub assigned_by: String,
    pub notes: Option<String>,
    pub assigned_at: Ms,
    pub rental: Option<Rental>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementAction {
    Assigned,
    Unassigned,
    Returned,
}

/// Append-only record of who moved what and why. System of record for
/// device movements — every assignment path writes here, no exceptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementLogEntry {
    pub id: Ulid,
    pub device_id: Ulid,
    pub action: MovementAction,
    pub from_booking: Option<Ulid>,
    pub to_booking: Option<Ulid>,
    pub actor: String,
    pub reason: Option<String>,
    pub at: Ms,
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types — this is the WAL record format. One event per state
/// change; a reallocation is deliberately a single event so the move is
/// atomic on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered {
        id: Ulid,
        name: String,
        capacity: u32,
        device_equipped: bool,
    },
    DeviceRegistered {
        id: Ulid,
        serial: String,
        category: String,
    },
    ResourceRetired {
        id: Ulid,
        at: Ms,
    },
    BookingCreated {
        booking: Booking,
    },
    RoomBound {
        booking_id: Ulid,
        room_id: Ulid,
        allocation_id: Ulid,
        actor: String,
        note: Option<String>,
        override_used: bool,
        at: Ms,
    },
    BookingRejected {
        booking_id: Ulid,
        actor: String,
        reason: String,
        at: Ms,
    },
    BookingConfirmed {
        booking_id: Ulid,
        at: Ms,
    },
    BookingCancelled {
        booking_id: Ulid,
        actor: String,
        at: Ms,
    },
    BookingCompleted {
        booking_id: Ulid,
        at: Ms,
    },
    DeviceAssigned {
        assignment: DeviceAssignment,
    },
    DeviceUnassigned {
        assignment_id: Ulid,
        actor: String,
        reason: Option<String>,
        at: Ms,
    },
    DeviceReallocated {
        device_id: Ulid,
        from_booking: Ulid,
        to_booking: Ulid,
        old_assignment_id: Ulid,
        new_assignment_id: Ulid,
        new_allocation_id: Ulid,
        actor: String,
        reason: String,
        at: Ms,
    },
    RentalReturned {
        assignment_id: Ulid,
        actor: String,
        at: Ms,
    },
    /// Compaction snapshot of an assignment row. Restores the row (and,
    /// when `active`, its allocation) without generating movement rows —
    /// those are snapshotted separately.
    AssignmentNoted {
        assignment: DeviceAssignment,
        active: bool,
    },
    /// Compaction snapshot of one movement-log row.
    MovementNoted {
        entry: MovementLogEntry,
    },
}

// ── Read models ──────────────────────────────────────────────────

/// One opposing booking in a conflict report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub booking_id: Ulid,
    pub client_name: String,
    pub span: Span,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub has_conflict: bool,
    pub conflicts: Vec<ConflictEntry>,
    pub can_override: bool,
}

/// Advisory, not a gate — a reviewer may proceed on a warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityCheck {
    pub valid: bool,
    pub warning: bool,
    pub capacity: u32,
    pub headcount: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub active: bool,
    pub device_equipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: Ulid,
    pub serial: String,
    pub category: String,
    pub status: DeviceStatus,
}

/// Full booking read model with derived fields for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingView {
    #[serde(flatten)]
    pub booking: Booking,
    pub has_room_conflict: bool,
    pub device_assignments: Vec<DeviceAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReallocationCheck {
    pub allowed: bool,
    pub reason: String,
    pub requires_approval: bool,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub category: String,
    pub total: u32,
    pub available: u32,
    pub threshold: u32,
    pub is_low: bool,
}

/// A pair of active allocations on one device whose intervals overlap.
/// Structurally impossible through the normal path; the detection query is
/// a safety net against data imported outside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConflictPair {
    pub device_id: Ulid,
    pub booking_a: Ulid,
    pub booking_b: Ulid,
    pub overlap: Span,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> Tenant {
        Tenant::parse("TECH").unwrap()
    }

    fn alloc(start: Ms, end: Ms, booking_id: Ulid) -> Allocation {
        Allocation {
            id: Ulid::new(),
            span: Span::new(start, end),
            booking_id,
            tenant: tenant(),
        }
    }

    fn room_state() -> ResourceState {
        ResourceState::new(
            Ulid::new(),
            ResourceProfile::Room {
                name: "Room 5".into(),
                capacity: 20,
                active: true,
                device_equipped: false,
            },
        )
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_elapsed_and_started() {
        let s = Span::new(100, 200);
        assert!(!s.elapsed(199));
        assert!(s.elapsed(200));
        assert!(!s.started(99));
        assert!(s.started(100));
    }

    #[test]
    fn allocation_ordering() {
        let mut rs = room_state();
        rs.insert_allocation(alloc(300, 400, Ulid::new()));
        rs.insert_allocation(alloc(100, 200, Ulid::new()));
        rs.insert_allocation(alloc(200, 300, Ulid::new()));
        assert_eq!(rs.allocations[0].span.start, 100);
        assert_eq!(rs.allocations[1].span.start, 200);
        assert_eq!(rs.allocations[2].span.start, 300);
    }

    #[test]
    fn overlapping_respects_half_open_boundary() {
        let mut rs = room_state();
        rs.insert_allocation(alloc(100, 200, Ulid::new()));
        let query = Span::new(200, 300);
        assert_eq!(rs.overlapping(&query, None).count(), 0);
    }

    #[test]
    fn overlapping_skips_excluded_booking() {
        let mut rs = room_state();
        let mine = Ulid::new();
        rs.insert_allocation(alloc(100, 300, mine));
        rs.insert_allocation(alloc(250, 400, Ulid::new()));

        let query = Span::new(150, 350);
        assert_eq!(rs.overlapping(&query, None).count(), 2);
        assert_eq!(rs.overlapping(&query, Some(mine)).count(), 1);
    }

    #[test]
    fn overlapping_uses_binary_search_bound() {
        let mut rs = room_state();
        for i in 0..50 {
            rs.insert_allocation(alloc(i * 100, i * 100 + 50, Ulid::new()));
        }
        // Query past everything
        assert_eq!(rs.overlapping(&Span::new(10_000, 20_000), None).count(), 0);
        // Query before everything
        assert_eq!(rs.overlapping(&Span::new(-500, -100), None).count(), 0);
    }

    #[test]
    fn remove_allocations_of_booking() {
        let mut rs = room_state();
        let b1 = Ulid::new();
        let b2 = Ulid::new();
        rs.insert_allocation(alloc(100, 200, b1));
        rs.insert_allocation(alloc(300, 400, b2));
        rs.insert_allocation(alloc(500, 600, b1));

        let removed = rs.remove_allocations_of(b1);
        assert_eq!(removed.len(), 2);
        assert_eq!(rs.allocations.len(), 1);
        assert_eq!(rs.allocations[0].booking_id, b2);
    }

    #[test]
    fn remove_nonexistent_allocation_returns_none() {
        let mut rs = room_state();
        rs.insert_allocation(alloc(100, 200, Ulid::new()));
        assert!(rs.remove_allocation(Ulid::new()).is_none());
        assert_eq!(rs.allocations.len(), 1);
    }

    #[test]
    fn retired_device_not_schedulable() {
        let mut rs = ResourceState::new(
            Ulid::new(),
            ResourceProfile::Device {
                serial: "LT-001".into(),
                category: "Laptop".into(),
                status: DeviceStatus::Available,
            },
        );
        assert!(rs.schedulable());
        if let ResourceProfile::Device { status, .. } = &mut rs.profile {
            *status = DeviceStatus::Retired;
        }
        assert!(!rs.schedulable());
    }

    #[test]
    fn status_terminality() {
        assert!(!BookingStatus::Pending.is_terminal());
        assert!(!BookingStatus::RoomAssigned.is_terminal());
        assert!(!BookingStatus::Confirmed.is_terminal());
        assert!(BookingStatus::Completed.is_terminal());
        assert!(BookingStatus::Rejected.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::RoomRegistered {
            id: Ulid::new(),
            name: "Room 5".into(),
            capacity: 20,
            device_equipped: true,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn booking_event_roundtrip_with_extras() {
        let booking = Booking {
            id: Ulid::new(),
            client_name: "Acme".into(),
            contact_person: "J. Doe".into(),
            email: "j@acme.example".into(),
            phone: "555-0100".into(),
            span: Span::new(1_700_000_000_000, 1_700_086_400_000),
            room_id: None,
            room_allocation_id: None,
            num_learners: 10,
            num_facilitators: 2,
            devices_needed: 0,
            device_category: None,
            extras: Extras(serde_json::json!({"coffee_tea_station": true, "water_bottles": 12})),
            tenant: tenant(),
            notes: None,
            status: BookingStatus::Pending,
            rejection_reason: None,
            override_note: None,
            created_by: "frontdesk".into(),
            created_at: 0,
            updated_at: 0,
        };
        let event = Event::BookingCreated { booking };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
