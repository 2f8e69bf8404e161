mod booking;
mod conflict;
mod devices;
mod error;
mod rooms;

pub use error::EngineError;
pub(crate) use conflict::now_ms;

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::events::EventHub;
use crate::model::*;
use crate::store::TimeRangeStore;
use crate::wal::{ReplayError, Wal};

pub type SharedBooking = Arc<RwLock<Booking>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the
                            // non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The reservation engine: the Time-Range Store plus the booking, assignment
/// and movement-log tables, all recovered from and persisted through one WAL.
///
/// Lock order is booking → resource, always. Reserve paths hold the target
/// resource's write guard across the overlap check, the journal append, and
/// the timeline insert.
pub struct Engine {
    pub store: TimeRangeStore,
    pub hub: Arc<EventHub>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    /// All assignment rows ever made. A row is *active* while its allocation
    /// is still indexed in the store; released rows stay for rental tracking.
    pub(super) assignments: DashMap<Ulid, DeviceAssignment>,
    pub(super) booking_assignments: DashMap<Ulid, Vec<Ulid>>,
    movement: Mutex<Vec<MovementLogEntry>>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub async fn new(wal_path: &Path, hub: Arc<EventHub>) -> Result<Self, EngineError> {
        let replay = Wal::replay(wal_path).map_err(|e| match e {
            ReplayError::Io(e) => EngineError::Journal(e.to_string()),
            ReplayError::Schema { .. } => EngineError::Corrupt(e.to_string()),
        })?;
        if replay.truncated_tail {
            warn!(path = %wal_path.display(), "recovered journal with torn tail");
        }
        let wal = Wal::open(wal_path).map_err(|e| EngineError::Journal(e.to_string()))?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: TimeRangeStore::new(),
            hub,
            bookings: DashMap::new(),
            assignments: DashMap::new(),
            booking_assignments: DashMap::new(),
            movement: Mutex::new(Vec::new()),
            wal_tx,
        };

        for event in &replay.events {
            engine.apply(event).await?;
        }

        Ok(engine)
    }

    /// Write an event to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    pub fn booking_handle(&self, id: Ulid) -> Option<SharedBooking> {
        self.bookings.get(&id).map(|e| e.value().clone())
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub(super) fn assignment_row(&self, id: Ulid) -> Option<DeviceAssignment> {
        self.assignments.get(&id).map(|e| e.value().clone())
    }

    /// An assignment occupies its device while its allocation is indexed.
    pub fn assignment_active(&self, a: &DeviceAssignment) -> bool {
        self.store.resource_of_allocation(a.allocation_id).is_some()
    }

    pub fn active_assignments_for_booking(&self, booking_id: Ulid) -> Vec<DeviceAssignment> {
        let ids = self
            .booking_assignments
            .get(&booking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.assignment_row(id))
            .filter(|a| self.assignment_active(a))
            .collect()
    }

    pub(super) fn active_assignments_for_device(&self, device_id: Ulid) -> Vec<DeviceAssignment> {
        self.assignments
            .iter()
            .filter(|e| e.value().device_id == device_id)
            .map(|e| e.value().clone())
            .filter(|a| self.assignment_active(a))
            .collect()
    }

    /// Movement history, optionally filtered to one device, oldest first.
    pub fn movement_log(&self, device_id: Option<Ulid>) -> Vec<MovementLogEntry> {
        let log = self.movement_guard();
        match device_id {
            Some(id) => log.iter().filter(|e| e.device_id == id).cloned().collect(),
            None => log.clone(),
        }
    }

    fn movement_guard(&self) -> std::sync::MutexGuard<'_, Vec<MovementLogEntry>> {
        self.movement.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn log_movement(
        &self,
        device_id: Ulid,
        action: MovementAction,
        from_booking: Option<Ulid>,
        to_booking: Option<Ulid>,
        actor: &str,
        reason: Option<String>,
        at: Ms,
    ) {
        self.movement_guard().push(MovementLogEntry {
            id: Ulid::new(),
            device_id,
            action,
            from_booking,
            to_booking,
            actor: actor.to_string(),
            reason,
            at,
        });
    }

    // ── Shared state mutators ────────────────────────────
    //
    // Called by live operations under their held guards and by replay.
    // Every live mutation must go through one of these so recovery rebuilds
    // the same state.

    pub(super) fn insert_booking_row(&self, booking: Booking) {
        self.bookings
            .insert(booking.id, Arc::new(RwLock::new(booking)));
    }

    /// Occupy a room for a booking: timeline insert + index + row update.
    pub(super) fn bind_room_state(
        &self,
        b: &mut Booking,
        room: &mut ResourceState,
        allocation_id: Ulid,
        note: Option<String>,
        override_used: bool,
        at: Ms,
    ) {
        room.insert_allocation(Allocation {
            id: allocation_id,
            span: b.span,
            booking_id: b.id,
            tenant: b.tenant.clone(),
        });
        self.store.index_allocation(allocation_id, room.id);
        b.room_id = Some(room.id);
        b.room_allocation_id = Some(allocation_id);
        b.status = BookingStatus::RoomAssigned;
        if override_used {
            b.override_note = note;
        }
        b.updated_at = at;
    }

    /// Timeline insert for a booking created directly in Confirmed with a
    /// bound room (the allocation id is already on the row).
    pub(super) fn occupy_room_for_created(&self, b: &Booking, room: &mut ResourceState) {
        if let Some(allocation_id) = b.room_allocation_id {
            room.insert_allocation(Allocation {
                id: allocation_id,
                span: b.span,
                booking_id: b.id,
                tenant: b.tenant.clone(),
            });
            self.store.index_allocation(allocation_id, room.id);
        }
    }

    /// Insert an assignment row, occupy the device timeline, flip status.
    pub(super) fn assign_device_state(
        &self,
        assignment: DeviceAssignment,
        device: &mut ResourceState,
        span: Span,
        tenant: crate::tenant::Tenant,
        log: bool,
    ) {
        device.insert_allocation(Allocation {
            id: assignment.allocation_id,
            span,
            booking_id: assignment.booking_id,
            tenant,
        });
        self.store
            .index_allocation(assignment.allocation_id, device.id);
        if let ResourceProfile::Device { status, .. } = &mut device.profile {
            *status = if assignment.offsite {
                DeviceStatus::Offsite
            } else {
                DeviceStatus::Assigned
            };
        }
        if log {
            self.log_movement(
                assignment.device_id,
                MovementAction::Assigned,
                None,
                Some(assignment.booking_id),
                &assignment.assigned_by,
                assignment.notes.clone(),
                assignment.assigned_at,
            );
        }
        self.booking_assignments
            .entry(assignment.booking_id)
            .or_default()
            .push(assignment.id);
        self.assignments.insert(assignment.id, assignment);
    }

    /// Release an assignment's allocation; the row stays as history.
    /// Device status falls back to whatever the remaining active
    /// assignments imply.
    pub(super) fn release_assignment_state(
        &self,
        assignment: &DeviceAssignment,
        device: &mut ResourceState,
        actor: &str,
        reason: Option<String>,
        at: Ms,
    ) {
        device.remove_allocation(assignment.allocation_id);
        self.store.unindex_allocation(assignment.allocation_id);
        self.settle_device_status(device);
        self.log_movement(
            assignment.device_id,
            MovementAction::Unassigned,
            Some(assignment.booking_id),
            None,
            actor,
            reason,
            at,
        );
    }

    /// Recompute a device's status from its remaining active assignments.
    pub(super) fn settle_device_status(&self, device: &mut ResourceState) {
        let remaining = self.active_assignments_for_device(device.id);
        if let ResourceProfile::Device { status, .. } = &mut device.profile {
            if *status == DeviceStatus::Retired {
                return;
            }
            *status = if remaining.iter().any(|a| a.offsite) {
                DeviceStatus::Offsite
            } else if remaining.is_empty() {
                DeviceStatus::Available
            } else {
                DeviceStatus::Assigned
            };
        }
    }

    /// Terminal transition: update the row and pull every allocation the
    /// booking owns out of the timelines. Caller holds the booking's write
    /// guard; resource guards are taken here (lock order booking → resource).
    pub(super) async fn finalize_booking_state(
        &self,
        b: &mut Booking,
        status: BookingStatus,
        actor: &str,
        release_reason: Option<String>,
        at: Ms,
    ) {
        if let Some(allocation_id) = b.room_allocation_id.take()
            && let Some(room_id) = self.store.resource_of_allocation(allocation_id)
            && let Some(handle) = self.store.handle(room_id)
        {
            let mut room = handle.write().await;
            room.remove_allocation(allocation_id);
            self.store.unindex_allocation(allocation_id);
        }

        let assignment_ids = self
            .booking_assignments
            .get(&b.id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        for id in assignment_ids {
            let Some(assignment) = self.assignment_row(id) else {
                continue;
            };
            if !self.assignment_active(&assignment) {
                continue;
            }
            if let Some(handle) = self.store.handle(assignment.device_id) {
                let mut device = handle.write().await;
                self.release_assignment_state(
                    &assignment,
                    &mut device,
                    actor,
                    release_reason.clone(),
                    at,
                );
            }
        }

        b.status = status;
        b.updated_at = at;
    }

    // ── Replay ───────────────────────────────────────────

    /// Apply one journal event. Used during recovery; live operations apply
    /// the same mutators inline under guards they already hold.
    async fn apply(&self, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::RoomRegistered {
                id,
                name,
                capacity,
                device_equipped,
            } => {
                let state = ResourceState::new(
                    *id,
                    ResourceProfile::Room {
                        name: name.clone(),
                        capacity: *capacity,
                        active: true,
                        device_equipped: *device_equipped,
                    },
                );
                if !self.store.insert(state) {
                    return Err(EngineError::Corrupt(format!("duplicate resource {id}")));
                }
            }
            Event::DeviceRegistered {
                id,
                serial,
                category,
            } => {
                let state = ResourceState::new(
                    *id,
                    ResourceProfile::Device {
                        serial: serial.clone(),
                        category: category.clone(),
                        status: DeviceStatus::Available,
                    },
                );
                if !self.store.insert(state) {
                    return Err(EngineError::Corrupt(format!("duplicate resource {id}")));
                }
            }
            Event::ResourceRetired { id, .. } => {
                let handle = self.resource_or_corrupt(*id)?;
                let mut rs = handle.write().await;
                match &mut rs.profile {
                    ResourceProfile::Room { active, .. } => *active = false,
                    ResourceProfile::Device { status, .. } => *status = DeviceStatus::Retired,
                }
            }
            Event::BookingCreated { booking } => {
                let needs_room = booking.room_allocation_id.is_some()
                    && !booking.status.is_terminal();
                if needs_room {
                    let room_id = booking
                        .room_id
                        .ok_or_else(|| EngineError::Corrupt("bound booking without room".into()))?;
                    let handle = self.resource_or_corrupt(room_id)?;
                    let mut room = handle.write().await;
                    self.occupy_room_for_created(booking, &mut room);
                }
                self.insert_booking_row(booking.clone());
            }
            Event::RoomBound {
                booking_id,
                room_id,
                allocation_id,
                note,
                override_used,
                at,
                ..
            } => {
                let handle = self.booking_or_corrupt(*booking_id)?;
                let mut b = handle.write().await;
                let room_handle = self.resource_or_corrupt(*room_id)?;
                let mut room = room_handle.write().await;
                self.bind_room_state(
                    &mut b,
                    &mut room,
                    *allocation_id,
                    note.clone(),
                    *override_used,
                    *at,
                );
            }
            Event::BookingRejected {
                booking_id,
                actor,
                reason,
                at,
            } => {
                let handle = self.booking_or_corrupt(*booking_id)?;
                let mut b = handle.write().await;
                b.rejection_reason = Some(reason.clone());
                self.finalize_booking_state(
                    &mut b,
                    BookingStatus::Rejected,
                    actor,
                    Some("booking rejected".into()),
                    *at,
                )
                .await;
            }
            Event::BookingConfirmed { booking_id, at } => {
                let handle = self.booking_or_corrupt(*booking_id)?;
                let mut b = handle.write().await;
                b.status = BookingStatus::Confirmed;
                b.updated_at = *at;
            }
            Event::BookingCancelled {
                booking_id,
                actor,
                at,
            } => {
                let handle = self.booking_or_corrupt(*booking_id)?;
                let mut b = handle.write().await;
                self.finalize_booking_state(
                    &mut b,
                    BookingStatus::Cancelled,
                    actor,
                    Some("booking cancelled".into()),
                    *at,
                )
                .await;
            }
            Event::BookingCompleted { booking_id, at } => {
                let handle = self.booking_or_corrupt(*booking_id)?;
                let mut b = handle.write().await;
                self.finalize_booking_state(
                    &mut b,
                    BookingStatus::Completed,
                    "system",
                    Some("booking completed".into()),
                    *at,
                )
                .await;
            }
            Event::DeviceAssigned { assignment } => {
                let booking_handle = self.booking_or_corrupt(assignment.booking_id)?;
                let (span, tenant) = {
                    let b = booking_handle.read().await;
                    (b.span, b.tenant.clone())
                };
                let handle = self.resource_or_corrupt(assignment.device_id)?;
                let mut device = handle.write().await;
                self.assign_device_state(assignment.clone(), &mut device, span, tenant, true);
            }
            Event::DeviceUnassigned {
                assignment_id,
                actor,
                reason,
                at,
            } => {
                let assignment = self
                    .assignment_row(*assignment_id)
                    .ok_or_else(|| EngineError::Corrupt(format!("unknown assignment {assignment_id}")))?;
                let handle = self.resource_or_corrupt(assignment.device_id)?;
                let mut device = handle.write().await;
                self.release_assignment_state(&assignment, &mut device, actor, reason.clone(), *at);
            }
            Event::DeviceReallocated {
                device_id,
                from_booking,
                to_booking,
                old_assignment_id,
                new_assignment_id,
                new_allocation_id,
                actor,
                reason,
                at,
            } => {
                let old = self
                    .assignment_row(*old_assignment_id)
                    .ok_or_else(|| EngineError::Corrupt(format!("unknown assignment {old_assignment_id}")))?;
                let target_handle = self.booking_or_corrupt(*to_booking)?;
                let (span, tenant) = {
                    let b = target_handle.read().await;
                    (b.span, b.tenant.clone())
                };
                let handle = self.resource_or_corrupt(*device_id)?;
                let mut device = handle.write().await;
                let new_assignment = DeviceAssignment {
                    id: *new_assignment_id,
                    booking_id: *to_booking,
                    device_id: *device_id,
                    allocation_id: *new_allocation_id,
                    offsite: old.offsite,
                    assigned_by: actor.clone(),
                    notes: old.notes.clone(),
                    assigned_at: *at,
                    rental: old.rental.clone(),
                };
                if old.booking_id != *from_booking {
                    return Err(EngineError::Corrupt(format!(
                        "reallocation source mismatch for assignment {old_assignment_id}"
                    )));
                }
                self.reallocate_state(&old, &mut device, new_assignment, span, tenant, reason, *at);
            }
            Event::RentalReturned {
                assignment_id,
                actor,
                at,
            } => {
                let assignment = self
                    .assignment_row(*assignment_id)
                    .ok_or_else(|| EngineError::Corrupt(format!("unknown assignment {assignment_id}")))?;
                let handle = self.resource_or_corrupt(assignment.device_id)?;
                let mut device = handle.write().await;
                self.return_rental_state(&assignment, &mut device, actor, *at);
            }
            Event::AssignmentNoted { assignment, active } => {
                if *active {
                    let booking_handle = self.booking_or_corrupt(assignment.booking_id)?;
                    let (span, tenant) = {
                        let b = booking_handle.read().await;
                        (b.span, b.tenant.clone())
                    };
                    let handle = self.resource_or_corrupt(assignment.device_id)?;
                    let mut device = handle.write().await;
                    self.assign_device_state(assignment.clone(), &mut device, span, tenant, false);
                } else {
                    self.booking_assignments
                        .entry(assignment.booking_id)
                        .or_default()
                        .push(assignment.id);
                    self.assignments.insert(assignment.id, assignment.clone());
                }
            }
            Event::MovementNoted { entry } => {
                self.movement_guard().push(entry.clone());
            }
        }
        Ok(())
    }

    /// The atomic move: release the old allocation, occupy the target span,
    /// keep the status, write the paired movement rows with one reason.
    pub(super) fn reallocate_state(
        &self,
        old: &DeviceAssignment,
        device: &mut ResourceState,
        new_assignment: DeviceAssignment,
        span: Span,
        tenant: crate::tenant::Tenant,
        reason: &str,
        at: Ms,
    ) {
        let actor = new_assignment.assigned_by.clone();
        device.remove_allocation(old.allocation_id);
        self.store.unindex_allocation(old.allocation_id);
        self.log_movement(
            device.id,
            MovementAction::Unassigned,
            Some(old.booking_id),
            None,
            &actor,
            Some(reason.to_string()),
            at,
        );

        device.insert_allocation(Allocation {
            id: new_assignment.allocation_id,
            span,
            booking_id: new_assignment.booking_id,
            tenant,
        });
        self.store
            .index_allocation(new_assignment.allocation_id, device.id);
        self.log_movement(
            device.id,
            MovementAction::Assigned,
            None,
            Some(new_assignment.booking_id),
            &actor,
            Some(reason.to_string()),
            at,
        );
        self.booking_assignments
            .entry(new_assignment.booking_id)
            .or_default()
            .push(new_assignment.id);
        self.assignments.insert(new_assignment.id, new_assignment);
    }

    /// Close a rental: stamp the return, release the allocation if it still
    /// occupies the timeline, settle the status, log the return.
    pub(super) fn return_rental_state(
        &self,
        assignment: &DeviceAssignment,
        device: &mut ResourceState,
        actor: &str,
        at: Ms,
    ) {
        if let Some(mut entry) = self.assignments.get_mut(&assignment.id)
            && let Some(rental) = &mut entry.rental
        {
            rental.returned_at = Some(at);
        }
        if self.assignment_active(assignment) {
            device.remove_allocation(assignment.allocation_id);
            self.store.unindex_allocation(assignment.allocation_id);
        }
        self.settle_device_status(device);
        self.log_movement(
            assignment.device_id,
            MovementAction::Returned,
            Some(assignment.booking_id),
            None,
            actor,
            None,
            at,
        );
    }

    fn resource_or_corrupt(
        &self,
        id: Ulid,
    ) -> Result<Arc<RwLock<ResourceState>>, EngineError> {
        self.store
            .handle(id)
            .ok_or_else(|| EngineError::Corrupt(format!("unknown resource {id}")))
    }

    fn booking_or_corrupt(&self, id: Ulid) -> Result<SharedBooking, EngineError> {
        self.booking_handle(id)
            .ok_or_else(|| EngineError::Corrupt(format!("unknown booking {id}")))
    }

    // ── Compaction ───────────────────────────────────────

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as a snapshot of current state.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let events = self.snapshot_events().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    /// Minimal event sequence that recreates current state on replay:
    /// resources, then bookings (with their room occupation), then
    /// assignment and movement-log snapshots.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut handles = self.store.snapshot_handles();
        handles.sort_by_key(|(id, _)| *id);
        let mut retired = Vec::new();
        for (id, handle) in &handles {
            let rs = handle.read().await;
            match &rs.profile {
                ResourceProfile::Room {
                    name,
                    capacity,
                    active,
                    device_equipped,
                } => {
                    events.push(Event::RoomRegistered {
                        id: *id,
                        name: name.clone(),
                        capacity: *capacity,
                        device_equipped: *device_equipped,
                    });
                    if !active {
                        retired.push(*id);
                    }
                }
                ResourceProfile::Device {
                    serial,
                    category,
                    status,
                } => {
                    events.push(Event::DeviceRegistered {
                        id: *id,
                        serial: serial.clone(),
                        category: category.clone(),
                    });
                    if *status == DeviceStatus::Retired {
                        retired.push(*id);
                    }
                }
            }
        }
        for id in retired {
            events.push(Event::ResourceRetired { id, at: now_ms() });
        }

        let mut booking_ids: Vec<Ulid> = self.bookings.iter().map(|e| *e.key()).collect();
        booking_ids.sort();
        for id in booking_ids {
            if let Some(handle) = self.booking_handle(id) {
                let b = handle.read().await;
                events.push(Event::BookingCreated {
                    booking: b.clone(),
                });
            }
        }

        let mut assignment_ids: Vec<Ulid> = self.assignments.iter().map(|e| *e.key()).collect();
        assignment_ids.sort();
        for id in assignment_ids {
            if let Some(a) = self.assignment_row(id) {
                let active = self.assignment_active(&a);
                events.push(Event::AssignmentNoted {
                    assignment: a,
                    active,
                });
            }
        }

        for entry in self.movement_guard().iter() {
            events.push(Event::MovementNoted {
                entry: entry.clone(),
            });
        }

        events
    }
}
