use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use ulid::Ulid;

use crate::engine::{Engine, now_ms};
use crate::events::DomainEvent;

/// Background sweep: journal the lazy Confirmed → Completed transitions and
/// raise overdue-rental alerts. Reads see the effective status immediately;
/// this task just makes it durable.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    // One alert per rental, not one per tick.
    let mut alerted: HashSet<Ulid> = HashSet::new();
    loop {
        interval.tick().await;
        let now = now_ms();

        for booking_id in engine.collect_completable(now).await {
            match engine.complete_booking(booking_id).await {
                Ok(()) => {
                    info!("completed elapsed booking {booking_id}");
                    metrics::counter!(crate::observability::BOOKINGS_COMPLETED_TOTAL)
                        .increment(1);
                }
                Err(e) => {
                    // May have been cancelled in the meantime
                    tracing::debug!("completion sweep skip {booking_id}: {e}");
                }
            }
        }

        for assignment in engine.overdue_rentals(now) {
            if !alerted.insert(assignment.id) {
                continue;
            }
            let Some(rental) = &assignment.rental else {
                continue;
            };
            engine.hub.publish(DomainEvent::RentalOverdue {
                assignment_id: assignment.id,
                device_id: assignment.device_id,
                rental_no: rental.rental_no.clone(),
                expected_return: rental.expected_return,
            });
            metrics::counter!(crate::observability::RENTALS_OVERDUE_TOTAL).increment(1);
            info!(
                "rental {} overdue on device {}",
                rental.rental_no, assignment.device_id
            );
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact().await {
            Ok(()) => info!("compacted journal after {appends} appends"),
            Err(e) => tracing::warn!("journal compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use crate::model::*;
    use crate::tenant::Tenant;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reserva_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn caps_all() -> Actor {
        Actor::new(
            "ops",
            RoleCaps {
                reviewer: true,
                elevated: true,
                device_manager: true,
            },
        )
    }

    fn request(span: Span) -> BookingRequest {
        BookingRequest {
            client_name: "Acme".into(),
            contact_person: "J. Doe".into(),
            email: "j@acme.example".into(),
            phone: "555-0100".into(),
            span,
            room_id: None,
            num_learners: 5,
            num_facilitators: 1,
            devices_needed: 0,
            device_category: None,
            extras: Extras::default(),
            tenant: Tenant::parse("TECH").unwrap(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn completion_sweep_finds_elapsed_confirmed() {
        let path = test_wal_path("sweep_elapsed.wal");
        let engine = Engine::new(&path, std::sync::Arc::new(EventHub::new()))
            .await
            .unwrap();
        let actor = caps_all();

        let now = now_ms();
        let room = engine.register_room("Room 1", 10, false).await.unwrap();

        // Elevated create with a room lands directly in Confirmed; span
        // already over.
        let past = Span::new(now - 7_200_000, now - 3_600_000);
        let mut req = request(past);
        req.room_id = Some(room.id);
        let booking = engine.create_booking(req, &actor).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Confirmed);

        let worklist = engine.collect_completable(now).await;
        assert_eq!(worklist, vec![booking.id]);

        engine.complete_booking(booking.id).await.unwrap();
        let view = engine.get_booking(booking.id).await.unwrap();
        assert_eq!(view.booking.status, BookingStatus::Completed);

        // Idempotent: a second sweep finds nothing.
        assert!(engine.collect_completable(now).await.is_empty());
    }

    #[tokio::test]
    async fn overdue_rentals_alert_once() {
        let path = test_wal_path("overdue_once.wal");
        let hub = std::sync::Arc::new(EventHub::new());
        let engine = Engine::new(&path, hub.clone()).await.unwrap();
        let actor = caps_all();
        let mut rx = hub.subscribe();

        let now = now_ms();
        let span = Span::new(now - 3_600_000, now + 3_600_000);
        let booking = engine.create_booking(request(span), &actor).await.unwrap();
        let device = engine.register_device("LT-0001", "Laptop").await.unwrap();

        let rental = Rental {
            rental_no: "R-100".into(),
            contact_person: "K. Smith".into(),
            contact_number: "555-0101".into(),
            contact_email: None,
            company: None,
            address: "1 Main St".into(),
            expected_return: now - 60_000,
            returned_at: None,
        };
        let assignment = engine
            .assign_device(booking.id, device.id, &actor, None, Some(rental))
            .await
            .unwrap();

        let overdue = engine.overdue_rentals(now);
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, assignment.id);

        // Simulate two ticks with the reaper's dedup set
        let mut alerted = HashSet::new();
        for _ in 0..2 {
            for a in engine.overdue_rentals(now) {
                if alerted.insert(a.id) {
                    let rental = a.rental.as_ref().unwrap();
                    engine.hub.publish(DomainEvent::RentalOverdue {
                        assignment_id: a.id,
                        device_id: a.device_id,
                        rental_no: rental.rental_no.clone(),
                        expected_return: rental.expected_return,
                    });
                }
            }
        }

        // Exactly one alert made it out; skip setup events (e.g.
        // BookingPending) published before the alert.
        let mut first = rx.recv().await.unwrap();
        while !matches!(first, DomainEvent::RentalOverdue { .. }) {
            first = rx.recv().await.unwrap();
        }
        assert!(matches!(first, DomainEvent::RentalOverdue { .. }));
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));

        // Returning the rental clears it from the worklist
        engine
            .mark_rental_returned(assignment.id, &actor)
            .await
            .unwrap();
        assert!(engine.overdue_rentals(now_ms()).is_empty());
    }
}
