use ulid::Ulid;

use crate::events::DomainEvent;
use crate::limits::*;
use crate::model::*;

use super::booking::effective_status;
use super::conflict::{now_ms, validate_span, validate_text};
use super::{Engine, EngineError};

fn device_info(id: Ulid, rs: &ResourceState) -> Option<DeviceInfo> {
    match &rs.profile {
        ResourceProfile::Device {
            serial,
            category,
            status,
        } => Some(DeviceInfo {
            id,
            serial: serial.clone(),
            category: category.clone(),
            status: *status,
        }),
        _ => None,
    }
}

fn validate_rental(rental: &Rental) -> Result<(), EngineError> {
    if rental.rental_no.trim().is_empty() {
        return Err(EngineError::Validation("rental_no is empty".into()));
    }
    if rental.contact_person.trim().is_empty() {
        return Err(EngineError::Validation(
            "rental contact_person is empty".into(),
        ));
    }
    if rental.address.trim().is_empty() {
        return Err(EngineError::Validation("rental address is empty".into()));
    }
    if rental.expected_return < MIN_VALID_TIMESTAMP_MS
        || rental.expected_return > MAX_VALID_TIMESTAMP_MS
    {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if rental.returned_at.is_some() {
        return Err(EngineError::Validation(
            "rental cannot start already returned".into(),
        ));
    }
    Ok(())
}

impl Engine {
    pub async fn register_device(
        &self,
        serial: &str,
        category: &str,
    ) -> Result<DeviceInfo, EngineError> {
        validate_text(serial, "serial", MAX_SERIAL_LEN)?;
        validate_text(category, "category", MAX_CATEGORY_LEN)?;
        if serial.trim().is_empty() {
            return Err(EngineError::Validation("serial is empty".into()));
        }
        if category.trim().is_empty() {
            return Err(EngineError::Validation("category is empty".into()));
        }
        if self.store.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        for (id, handle) in self.store.snapshot_handles() {
            let rs = handle.read().await;
            if let ResourceProfile::Device { serial: s, .. } = &rs.profile
                && s == serial
            {
                return Err(EngineError::AlreadyExists(id));
            }
        }

        let id = Ulid::new();
        self.wal_append(&Event::DeviceRegistered {
            id,
            serial: serial.to_string(),
            category: category.to_string(),
        })
        .await?;
        self.store.insert(ResourceState::new(
            id,
            ResourceProfile::Device {
                serial: serial.to_string(),
                category: category.to_string(),
                status: DeviceStatus::Available,
            },
        ));
        Ok(DeviceInfo {
            id,
            serial: serial.to_string(),
            category: category.to_string(),
            status: DeviceStatus::Available,
        })
    }

    /// Retire a device permanently. Its movement history and past
    /// assignments stay dereferenceable.
    pub async fn retire_device(&self, device_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        if !actor.caps.device_manager {
            return Err(EngineError::Forbidden(
                "device retirement requires device manager",
            ));
        }
        let handle = self
            .store
            .handle(device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        let mut rs = handle.write().await;
        let ResourceProfile::Device { status, .. } = &rs.profile else {
            return Err(EngineError::Validation(format!(
                "{device_id} is not a device"
            )));
        };
        if *status == DeviceStatus::Retired {
            return Err(EngineError::Validation(format!(
                "device {device_id} is already retired"
            )));
        }
        if !rs.allocations.is_empty() {
            return Err(EngineError::Validation(
                "device still has active assignments".into(),
            ));
        }
        let now = now_ms();
        self.wal_append(&Event::ResourceRetired {
            id: device_id,
            at: now,
        })
        .await?;
        if let ResourceProfile::Device { status, .. } = &mut rs.profile {
            *status = DeviceStatus::Retired;
        }
        Ok(())
    }

    pub async fn list_devices(&self, category: Option<&str>) -> Vec<DeviceInfo> {
        let mut out = Vec::new();
        for (id, handle) in self.store.snapshot_handles() {
            let rs = handle.read().await;
            if let Some(info) = device_info(id, &rs)
                && category.is_none_or(|c| info.category == c)
            {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.serial.cmp(&b.serial));
        out
    }

    /// Devices of a category with no claim anywhere in the span. Off-site
    /// and retired units are never offered. `exclude_booking` ignores that
    /// booking's own claims, so an edit that keeps its device still sees
    /// the device as free.
    pub async fn find_available_devices(
        &self,
        category: &str,
        span: &Span,
        exclude_booking: Option<Ulid>,
    ) -> Result<Vec<DeviceInfo>, EngineError> {
        validate_span(span)?;
        let mut out = Vec::new();
        for (id, handle) in self.store.snapshot_handles() {
            let rs = handle.read().await;
            let Some(info) = device_info(id, &rs) else {
                continue;
            };
            if info.category != category
                || info.status == DeviceStatus::Retired
                || info.status == DeviceStatus::Offsite
            {
                continue;
            }
            if rs.overlapping(span, exclude_booking).next().is_none() {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.serial.cmp(&b.serial));
        Ok(out)
    }

    async fn find_alternative_devices(
        &self,
        category: &str,
        span: &Span,
        exclude: Ulid,
    ) -> Result<Vec<DeviceInfo>, EngineError> {
        let mut alternatives = self.find_available_devices(category, span, None).await?;
        alternatives.retain(|d| d.id != exclude);
        Ok(alternatives)
    }

    /// Assign a device to a booking for the booking's interval. Passing a
    /// rental makes the assignment off-site. On conflict the engine looks
    /// for substitutes and reports when there are none.
    pub async fn assign_device(
        &self,
        booking_id: Ulid,
        device_id: Ulid,
        actor: &Actor,
        notes: Option<String>,
        rental: Option<Rental>,
    ) -> Result<DeviceAssignment, EngineError> {
        if !actor.caps.device_manager {
            return Err(EngineError::Forbidden(
                "device assignment requires device manager",
            ));
        }
        if let Some(notes) = &notes {
            validate_text(notes, "notes", MAX_NOTE_LEN)?;
        }
        if let Some(rental) = &rental {
            validate_rental(rental)?;
        }

        let booking_handle = self
            .booking_handle(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        // Held across the critical section so a concurrent cancel cannot
        // release the booking underneath the new allocation.
        let b = booking_handle.read().await;
        if effective_status(&b, now_ms()).is_terminal() {
            return Err(EngineError::Validation(format!(
                "booking {booking_id} is no longer active"
            )));
        }
        let span = b.span;
        let tenant = b.tenant.clone();

        let handle = self
            .store
            .handle(device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        let mut device = handle.write().await;
        let Some(category) = device.device_category().map(str::to_string) else {
            return Err(EngineError::Validation(format!(
                "{device_id} is not a device"
            )));
        };
        if !device.schedulable() {
            return Err(EngineError::Validation(format!(
                "device {device_id} is retired"
            )));
        }
        if device.allocations.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("resource timeline full"));
        }

        let hits: Vec<Allocation> = device.overlapping(&span, None).cloned().collect();
        if !hits.is_empty() {
            drop(device);
            let err = self.conflict_error(device_id, &hits).await;
            let alternatives = self
                .find_alternative_devices(&category, &span, device_id)
                .await?;
            if alternatives.is_empty() {
                self.hub.publish(DomainEvent::DeviceConflictNoAlternative {
                    booking_id,
                    category,
                    span,
                });
            }
            return Err(err);
        }

        let assignment = DeviceAssignment {
            id: Ulid::new(),
            booking_id,
            device_id,
            allocation_id: Ulid::new(),
            offsite: rental.is_some(),
            assigned_by: actor.name.clone(),
            notes,
            assigned_at: now_ms(),
            rental,
        };
        self.wal_append(&Event::DeviceAssigned {
            assignment: assignment.clone(),
        })
        .await?;
        self.assign_device_state(assignment.clone(), &mut device, span, tenant, true);
        Ok(assignment)
    }

    /// Release an assignment back to the pool. The row stays as history;
    /// the movement log records who and why.
    pub async fn unassign_device(
        &self,
        assignment_id: Ulid,
        actor: &Actor,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        if !actor.caps.device_manager {
            return Err(EngineError::Forbidden(
                "device release requires device manager",
            ));
        }
        let assignment = self
            .assignment_row(assignment_id)
            .ok_or(EngineError::NotFound(assignment_id))?;
        if !self.assignment_active(&assignment) {
            return Err(EngineError::Validation(format!(
                "assignment {assignment_id} is already released"
            )));
        }
        let handle = self
            .store
            .handle(assignment.device_id)
            .ok_or(EngineError::NotFound(assignment.device_id))?;
        let mut device = handle.write().await;
        let at = now_ms();
        self.wal_append(&Event::DeviceUnassigned {
            assignment_id,
            actor: actor.name.clone(),
            reason: reason.clone(),
            at,
        })
        .await?;
        self.release_assignment_state(&assignment, &mut device, &actor.name, reason, at);
        Ok(())
    }

    /// Whether an assignment can be moved to another booking, and under what
    /// conditions. Advisory — the move itself re-checks under the guard.
    pub async fn can_reallocate(
        &self,
        assignment_id: Ulid,
        to_booking: Ulid,
    ) -> Result<ReallocationCheck, EngineError> {
        let assignment = self
            .assignment_row(assignment_id)
            .ok_or(EngineError::NotFound(assignment_id))?;
        if !self.assignment_active(&assignment) {
            return Ok(ReallocationCheck {
                allowed: false,
                reason: "assignment is already released".into(),
                requires_approval: false,
                warning: None,
            });
        }
        if assignment.booking_id == to_booking {
            return Ok(ReallocationCheck {
                allowed: false,
                reason: "device is already assigned to that booking".into(),
                requires_approval: false,
                warning: None,
            });
        }

        let now = now_ms();
        let target_handle = self
            .booking_handle(to_booking)
            .ok_or(EngineError::NotFound(to_booking))?;
        let (target_span, target_started, target_ok) = {
            let b = target_handle.read().await;
            let status = effective_status(&b, now);
            (b.span, b.span.started(now), !status.is_terminal())
        };
        if !target_ok {
            return Ok(ReallocationCheck {
                allowed: false,
                reason: "target booking is no longer active".into(),
                requires_approval: false,
                warning: None,
            });
        }

        let source_started = {
            let handle = self
                .booking_handle(assignment.booking_id)
                .ok_or(EngineError::NotFound(assignment.booking_id))?;
            let b = handle.read().await;
            b.span.started(now)
        };

        let hits = self
            .store
            .find_overlaps(
                assignment.device_id,
                &target_span,
                Some(assignment.booking_id),
            )
            .await
            .ok_or(EngineError::NotFound(assignment.device_id))?;
        if !hits.is_empty() {
            return Ok(ReallocationCheck {
                allowed: false,
                reason: "device is claimed during the target interval".into(),
                requires_approval: false,
                warning: None,
            });
        }

        Ok(ReallocationCheck {
            allowed: true,
            reason: if source_started {
                "device can be moved, but its current session has already started".into()
            } else {
                "device can be moved".into()
            },
            requires_approval: source_started,
            warning: target_started.then(|| "target booking has already started".to_string()),
        })
    }

    /// Atomic move of a device between bookings: one journal event, release
    /// and re-assignment applied under the device's write guard, two
    /// movement rows sharing the stated reason.
    pub async fn reallocate_device(
        &self,
        assignment_id: Ulid,
        to_booking: Ulid,
        actor: &Actor,
        reason: &str,
        approved: bool,
    ) -> Result<DeviceAssignment, EngineError> {
        if !actor.caps.device_manager {
            return Err(EngineError::Forbidden(
                "reallocation requires device manager",
            ));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation(
                "reallocation requires a reason".into(),
            ));
        }
        validate_text(reason, "reason", MAX_NOTE_LEN)?;

        let old = self
            .assignment_row(assignment_id)
            .ok_or(EngineError::NotFound(assignment_id))?;
        if !self.assignment_active(&old) {
            return Err(EngineError::Validation(format!(
                "assignment {assignment_id} is already released"
            )));
        }
        if old.booking_id == to_booking {
            return Err(EngineError::Validation(
                "device is already assigned to that booking".into(),
            ));
        }

        let now = now_ms();
        let source_started = {
            let handle = self
                .booking_handle(old.booking_id)
                .ok_or(EngineError::NotFound(old.booking_id))?;
            let b = handle.read().await;
            b.span.started(now)
        };
        if source_started && !approved {
            return Err(EngineError::Forbidden(
                "moving a device out of a started booking requires approval",
            ));
        }

        let target_handle = self
            .booking_handle(to_booking)
            .ok_or(EngineError::NotFound(to_booking))?;
        // Held across the critical section, same as assign.
        let target = target_handle.read().await;
        if effective_status(&target, now).is_terminal() {
            return Err(EngineError::Validation(format!(
                "booking {to_booking} is no longer active"
            )));
        }
        let span = target.span;
        let tenant = target.tenant.clone();

        let handle = self
            .store
            .handle(old.device_id)
            .ok_or(EngineError::NotFound(old.device_id))?;
        let mut device = handle.write().await;
        let hits: Vec<Allocation> = device
            .overlapping(&span, Some(old.booking_id))
            .cloned()
            .collect();
        if !hits.is_empty() {
            drop(device);
            return Err(self.conflict_error(old.device_id, &hits).await);
        }

        let new_assignment = DeviceAssignment {
            id: Ulid::new(),
            booking_id: to_booking,
            device_id: old.device_id,
            allocation_id: Ulid::new(),
            offsite: old.offsite,
            assigned_by: actor.name.clone(),
            notes: old.notes.clone(),
            assigned_at: now,
            rental: old.rental.clone(),
        };
        self.wal_append(&Event::DeviceReallocated {
            device_id: old.device_id,
            from_booking: old.booking_id,
            to_booking,
            old_assignment_id: assignment_id,
            new_assignment_id: new_assignment.id,
            new_allocation_id: new_assignment.allocation_id,
            actor: actor.name.clone(),
            reason: reason.to_string(),
            at: now,
        })
        .await?;
        self.reallocate_state(&old, &mut device, new_assignment.clone(), span, tenant, reason, now);
        Ok(new_assignment)
    }

    /// Safety net against data that entered outside the guarded paths:
    /// scan every device timeline for overlapping allocation pairs.
    pub async fn detect_device_conflicts(&self) -> Vec<DeviceConflictPair> {
        let mut pairs = Vec::new();
        for (id, handle) in self.store.snapshot_handles() {
            let rs = handle.read().await;
            if !rs.is_device() {
                continue;
            }
            // Sorted by start: for each allocation, only successors that
            // start before it ends can collide.
            for (i, a) in rs.allocations.iter().enumerate() {
                for b in rs.allocations[i + 1..]
                    .iter()
                    .take_while(|b| b.span.start < a.span.end)
                {
                    pairs.push(DeviceConflictPair {
                        device_id: id,
                        booking_a: a.booking_id,
                        booking_b: b.booking_id,
                        overlap: Span::new(b.span.start, a.span.end.min(b.span.end)),
                    });
                }
            }
        }
        pairs
    }

    /// Stock position for a category on a given date: units with no
    /// allocation in the 24 hours starting at `at`. Publishes `StockLow`
    /// when availability drops below the threshold.
    pub async fn check_stock_level(
        &self,
        category: &str,
        at: Ms,
        threshold: u32,
    ) -> Result<StockLevel, EngineError> {
        validate_text(category, "category", MAX_CATEGORY_LEN)?;
        const DAY: Ms = 24 * 3_600_000;
        if at < MIN_VALID_TIMESTAMP_MS || at > MAX_VALID_TIMESTAMP_MS - DAY {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let window = Span::new(at, at + DAY);
        let mut total = 0u32;
        let mut available = 0u32;
        for (_, handle) in self.store.snapshot_handles() {
            let rs = handle.read().await;
            let Some(info) = device_info(rs.id, &rs) else {
                continue;
            };
            if info.category != category || info.status == DeviceStatus::Retired {
                continue;
            }
            total += 1;
            if info.status != DeviceStatus::Offsite
                && rs.overlapping(&window, None).next().is_none()
            {
                available += 1;
            }
        }
        let is_low = available < threshold;
        if is_low {
            self.hub.publish(DomainEvent::StockLow {
                category: category.to_string(),
                available,
                threshold,
            });
        }
        Ok(StockLevel {
            category: category.to_string(),
            total,
            available,
            threshold,
            is_low,
        })
    }

    /// Close an off-site rental: stamp the return time, free the device.
    pub async fn mark_rental_returned(
        &self,
        assignment_id: Ulid,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        if !actor.caps.device_manager {
            return Err(EngineError::Forbidden(
                "rental return requires device manager",
            ));
        }
        let assignment = self
            .assignment_row(assignment_id)
            .ok_or(EngineError::NotFound(assignment_id))?;
        let Some(rental) = &assignment.rental else {
            return Err(EngineError::Validation(format!(
                "assignment {assignment_id} has no rental"
            )));
        };
        if rental.returned_at.is_some() {
            return Err(EngineError::Validation(format!(
                "rental {} is already returned",
                rental.rental_no
            )));
        }
        let handle = self
            .store
            .handle(assignment.device_id)
            .ok_or(EngineError::NotFound(assignment.device_id))?;
        let mut device = handle.write().await;
        let at = now_ms();
        self.wal_append(&Event::RentalReturned {
            assignment_id,
            actor: actor.name.clone(),
            at,
        })
        .await?;
        self.return_rental_state(&assignment, &mut device, &actor.name, at);
        Ok(())
    }

    /// Open rentals past their expected return date.
    pub fn overdue_rentals(&self, now: Ms) -> Vec<DeviceAssignment> {
        self.assignments
            .iter()
            .map(|e| e.value().clone())
            .filter(|a| {
                a.rental
                    .as_ref()
                    .is_some_and(|r| r.returned_at.is_none() && r.expected_return < now)
            })
            .collect()
    }
}
