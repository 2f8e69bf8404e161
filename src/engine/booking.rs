use tracing::debug;
use ulid::Ulid;

use crate::events::DomainEvent;
use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_span, validate_text};
use super::{Engine, EngineError, SharedBooking};

fn validate_request(req: &BookingRequest) -> Result<(), EngineError> {
    validate_span(&req.span)?;
    validate_text(&req.client_name, "client_name", MAX_NAME_LEN)?;
    validate_text(&req.contact_person, "contact_person", MAX_NAME_LEN)?;
    validate_text(&req.email, "email", MAX_NAME_LEN)?;
    validate_text(&req.phone, "phone", MAX_NAME_LEN)?;
    if let Some(notes) = &req.notes {
        validate_text(notes, "notes", MAX_NOTE_LEN)?;
    }
    if let Some(category) = &req.device_category {
        validate_text(category, "device_category", MAX_CATEGORY_LEN)?;
    }
    if req.client_name.trim().is_empty() {
        return Err(EngineError::Validation("client_name is empty".into()));
    }
    if req.num_learners > MAX_HEADCOUNT || req.num_facilitators > MAX_HEADCOUNT {
        return Err(EngineError::LimitExceeded("headcount too large"));
    }
    if req.num_learners + req.num_facilitators == 0 && req.devices_needed == 0 {
        return Err(EngineError::Validation(
            "booking needs a headcount or devices".into(),
        ));
    }
    let extras_len = req.extras.0.to_string().len();
    if extras_len > MAX_EXTRAS_BYTES {
        return Err(EngineError::LimitExceeded("extras payload too large"));
    }
    Ok(())
}

impl Engine {
    /// Create a booking. Plain actors land in Pending — the requested room,
    /// if any, is recorded but not occupied until a reviewer binds it.
    /// Elevated actors naming a room create directly in Confirmed with the
    /// room bound atomically (conflict-checked under the room's guard);
    /// without a room even an elevated create lands in Pending.
    pub async fn create_booking(
        &self,
        req: BookingRequest,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        validate_request(&req)?;
        if self.bookings.len() >= MAX_BOOKINGS {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        if let Some(room_id) = req.room_id {
            let handle = self
                .store
                .handle(room_id)
                .ok_or(EngineError::NotFound(room_id))?;
            let rs = handle.read().await;
            if !rs.is_room() {
                return Err(EngineError::Validation(format!(
                    "{room_id} is not a room"
                )));
            }
            if !rs.schedulable() {
                return Err(EngineError::Validation(format!(
                    "room {room_id} is not active"
                )));
            }
        }

        let now = now_ms();
        let id = Ulid::new();
        let confirm_now = actor.caps.elevated && req.room_id.is_some();
        let mut booking = Booking {
            id,
            client_name: req.client_name,
            contact_person: req.contact_person,
            email: req.email,
            phone: req.phone,
            span: req.span,
            room_id: req.room_id,
            room_allocation_id: None,
            num_learners: req.num_learners,
            num_facilitators: req.num_facilitators,
            devices_needed: req.devices_needed,
            device_category: req.device_category,
            extras: req.extras,
            tenant: req.tenant,
            notes: req.notes,
            status: if confirm_now {
                BookingStatus::Confirmed
            } else {
                BookingStatus::Pending
            },
            rejection_reason: None,
            override_note: None,
            created_by: actor.name.clone(),
            created_at: now,
            updated_at: now,
        };

        if confirm_now && let Some(room_id) = booking.room_id {
            // Bind the room in the same critical section as the create.
            booking.room_allocation_id = Some(Ulid::new());
            let handle = self
                .store
                .handle(room_id)
                .ok_or(EngineError::NotFound(room_id))?;
            let mut room = handle.write().await;
            if room.allocations.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("resource timeline full"));
            }
            let hits: Vec<Allocation> =
                room.overlapping(&booking.span, None).cloned().collect();
            if !hits.is_empty() {
                // Joining the opposing rows takes booking locks; the room
                // guard has to go first.
                drop(room);
                return Err(self.conflict_error(room_id, &hits).await);
            }
            self.wal_append(&Event::BookingCreated {
                booking: booking.clone(),
            })
            .await?;
            self.occupy_room_for_created(&booking, &mut room);
            self.insert_booking_row(booking.clone());
            return Ok(booking);
        }

        self.wal_append(&Event::BookingCreated {
            booking: booking.clone(),
        })
        .await?;
        self.insert_booking_row(booking.clone());
        if booking.status == BookingStatus::Pending {
            self.hub.publish(DomainEvent::BookingPending {
                booking_id: booking.id,
                client_name: booking.client_name.clone(),
                span: booking.span,
            });
        }
        Ok(booking)
    }

    /// Reviewer action: bind a room to a Pending booking. On conflict the
    /// call fails with the opposing bookings, unless `override_conflict` is
    /// set — which requires a non-empty justification note and records it.
    pub async fn assign_room(
        &self,
        booking_id: Ulid,
        room_id: Ulid,
        actor: &Actor,
        override_conflict: bool,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        if !actor.caps.reviewer {
            return Err(EngineError::Forbidden("room assignment requires reviewer"));
        }
        let handle = self
            .booking_handle(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut b = handle.write().await;
        if b.status != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition {
                booking_id,
                from: b.status,
                attempted: "assign_room",
            });
        }

        let room_handle = self
            .store
            .handle(room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let mut room = room_handle.write().await;
        if !room.is_room() {
            return Err(EngineError::Validation(format!("{room_id} is not a room")));
        }
        if !room.schedulable() {
            return Err(EngineError::Validation(format!(
                "room {room_id} is not active"
            )));
        }
        if room.allocations.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("resource timeline full"));
        }

        let hits: Vec<Allocation> = room
            .overlapping(&b.span, Some(booking_id))
            .cloned()
            .collect();
        let override_used = !hits.is_empty();
        if override_used {
            if !override_conflict {
                drop(room);
                return Err(self.conflict_error(room_id, &hits).await);
            }
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            if note.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(EngineError::Validation(
                    "conflict override requires a justification note".into(),
                ));
            }
        }

        let allocation_id = Ulid::new();
        let at = now_ms();
        self.wal_append(&Event::RoomBound {
            booking_id,
            room_id,
            allocation_id,
            actor: actor.name.clone(),
            note: note.clone(),
            override_used,
            at,
        })
        .await?;
        self.bind_room_state(&mut b, &mut room, allocation_id, note, override_used, at);
        self.hub.publish(DomainEvent::RoomAssigned {
            booking_id,
            room_id,
            override_used,
        });
        Ok(())
    }

    /// Reviewer action, Pending only — once a room is bound the booking is
    /// cancelled, not rejected. The reason is mandatory and lands on the row.
    pub async fn reject_booking(
        &self,
        booking_id: Ulid,
        actor: &Actor,
        reason: &str,
    ) -> Result<(), EngineError> {
        if !actor.caps.reviewer {
            return Err(EngineError::Forbidden("rejection requires reviewer"));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation(
                "rejection requires a reason".into(),
            ));
        }
        validate_text(reason, "reason", MAX_NOTE_LEN)?;

        let handle = self
            .booking_handle(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut b = handle.write().await;
        if b.status != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition {
                booking_id,
                from: b.status,
                attempted: "reject",
            });
        }

        let at = now_ms();
        self.wal_append(&Event::BookingRejected {
            booking_id,
            actor: actor.name.clone(),
            reason: reason.to_string(),
            at,
        })
        .await?;
        b.rejection_reason = Some(reason.to_string());
        self.finalize_booking_state(
            &mut b,
            BookingStatus::Rejected,
            &actor.name,
            Some("booking rejected".into()),
            at,
        )
        .await;
        self.hub.publish(DomainEvent::BookingRejected {
            booking_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// RoomAssigned → Confirmed once every required device is resolved. Any
    /// actor may confirm; the room stays occupied and nothing else moves.
    pub async fn confirm_booking(
        &self,
        booking_id: Ulid,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let handle = self
            .booking_handle(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut b = handle.write().await;
        if b.status != BookingStatus::RoomAssigned {
            return Err(EngineError::InvalidTransition {
                booking_id,
                from: b.status,
                attempted: "confirm",
            });
        }
        let needed = b.devices_needed as usize;
        let assigned = self.active_assignments_for_booking(booking_id).len();
        if assigned < needed {
            return Err(EngineError::Validation(format!(
                "booking needs {needed} devices, {assigned} assigned"
            )));
        }
        let at = now_ms();
        self.wal_append(&Event::BookingConfirmed { booking_id, at })
            .await?;
        b.status = BookingStatus::Confirmed;
        b.updated_at = at;
        debug!(booking = %booking_id, actor = %actor.name, "booking confirmed");
        Ok(())
    }

    /// Any actor may cancel. Frees the room and every assigned device.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let handle = self
            .booking_handle(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut b = handle.write().await;
        let now = now_ms();
        let effective = effective_status(&b, now);
        if effective.is_terminal() {
            return Err(EngineError::InvalidTransition {
                booking_id,
                from: effective,
                attempted: "cancel",
            });
        }
        self.wal_append(&Event::BookingCancelled {
            booking_id,
            actor: actor.name.clone(),
            at: now,
        })
        .await?;
        self.finalize_booking_state(
            &mut b,
            BookingStatus::Cancelled,
            &actor.name,
            Some("booking cancelled".into()),
            now,
        )
        .await;
        Ok(())
    }

    /// Confirmed → Completed once the interval has fully elapsed. Called by
    /// the reaper; idempotent via the status check.
    pub async fn complete_booking(&self, booking_id: Ulid) -> Result<(), EngineError> {
        let handle = self
            .booking_handle(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut b = handle.write().await;
        if b.status != BookingStatus::Confirmed {
            return Err(EngineError::InvalidTransition {
                booking_id,
                from: b.status,
                attempted: "complete",
            });
        }
        let now = now_ms();
        if !b.span.elapsed(now) {
            return Err(EngineError::Validation(
                "booking interval has not elapsed".into(),
            ));
        }
        self.wal_append(&Event::BookingCompleted {
            booking_id,
            at: now,
        })
        .await?;
        self.finalize_booking_state(
            &mut b,
            BookingStatus::Completed,
            "system",
            Some("booking completed".into()),
            now,
        )
        .await;
        Ok(())
    }

    /// Confirmed bookings whose interval has elapsed — the reaper's worklist.
    pub async fn collect_completable(&self, now: Ms) -> Vec<Ulid> {
        let handles: Vec<SharedBooking> =
            self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let b = handle.read().await;
            if b.status == BookingStatus::Confirmed && b.span.elapsed(now) {
                out.push(b.id);
            }
        }
        out
    }

    /// The reviewer queue: Pending bookings ordered by start, then by
    /// submission time.
    pub async fn list_pending(&self) -> Vec<Booking> {
        let handles: Vec<SharedBooking> =
            self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let b = handle.read().await;
            if b.status == BookingStatus::Pending {
                out.push(b.clone());
            }
        }
        out.sort_by_key(|b| (b.span.start, b.created_at, b.id));
        out
    }

    /// Read model with derived fields. The status shown is the *effective*
    /// one: a Confirmed booking whose interval has elapsed reads Completed
    /// even before the sweep has journaled the transition.
    pub async fn get_booking(&self, booking_id: Ulid) -> Result<BookingView, EngineError> {
        let handle = self
            .booking_handle(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut booking = handle.read().await.clone();
        booking.status = effective_status(&booking, now_ms());

        // Ghost inventory surface: a Pending booking with a requested room
        // shows whether that room currently has an opposing claim.
        let mut has_room_conflict = false;
        if booking.status == BookingStatus::Pending
            && let Some(room_id) = booking.room_id
            && let Some(hits) = self
                .store
                .find_overlaps(room_id, &booking.span, Some(booking_id))
                .await
        {
            has_room_conflict = !hits.is_empty();
        }

        let device_assignments = self.active_assignments_for_booking(booking_id);
        Ok(BookingView {
            booking,
            has_room_conflict,
            device_assignments,
        })
    }
}

pub(super) fn effective_status(b: &Booking, now: Ms) -> BookingStatus {
    if b.status == BookingStatus::Confirmed && b.span.elapsed(now) {
        BookingStatus::Completed
    } else {
        b.status
    }
}
