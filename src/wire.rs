use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::events::DomainEvent;
use crate::model::*;
use crate::observability;
use crate::tenant::Tenant;

const MAX_LINE_BYTES: usize = 64 * 1024;

/// One command per line, newline-delimited JSON. The first command on a
/// connection must be `hello`, which fixes the acting identity; capability
/// checks happen in the engine against that identity.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Hello {
        actor: Actor,
    },
    RegisterRoom {
        name: String,
        capacity: u32,
        #[serde(default)]
        device_equipped: bool,
    },
    RegisterDevice {
        serial: String,
        category: String,
    },
    DeactivateRoom {
        room_id: Ulid,
    },
    RetireDevice {
        device_id: Ulid,
    },
    CreateBooking {
        request: BookingRequest,
    },
    AssignRoom {
        booking_id: Ulid,
        room_id: Ulid,
        #[serde(default)]
        override_conflict: bool,
        #[serde(default)]
        note: Option<String>,
    },
    RejectBooking {
        booking_id: Ulid,
        reason: String,
    },
    ConfirmBooking {
        booking_id: Ulid,
    },
    CancelBooking {
        booking_id: Ulid,
    },
    GetBooking {
        booking_id: Ulid,
    },
    ListPending,
    ListRooms,
    ListDevices {
        #[serde(default)]
        category: Option<String>,
    },
    CheckRoomConflicts {
        room_id: Ulid,
        span: Span,
        #[serde(default)]
        exclude_booking: Option<Ulid>,
    },
    ValidateCapacity {
        room_id: Ulid,
        headcount: u32,
    },
    FindAvailableRooms {
        span: Span,
        #[serde(default)]
        min_capacity: u32,
        #[serde(default)]
        need_devices: bool,
    },
    RoomOccupancy {
        room_id: Ulid,
        window: Span,
    },
    FindAvailableDevices {
        category: String,
        span: Span,
        #[serde(default)]
        exclude_booking: Option<Ulid>,
    },
    AssignDevice {
        booking_id: Ulid,
        device_id: Ulid,
        #[serde(default)]
        notes: Option<String>,
        #[serde(default)]
        rental: Option<Rental>,
    },
    UnassignDevice {
        assignment_id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    CanReallocate {
        assignment_id: Ulid,
        to_booking: Ulid,
    },
    ReallocateDevice {
        assignment_id: Ulid,
        to_booking: Ulid,
        reason: String,
        #[serde(default)]
        approved: bool,
    },
    DetectDeviceConflicts,
    CheckStockLevel {
        category: String,
        at: Ms,
        threshold: u32,
    },
    MarkRentalReturned {
        assignment_id: Ulid,
    },
    OverdueRentals,
    MovementLog {
        #[serde(default)]
        device_id: Option<Ulid>,
    },
    BookingsForTenant {
        tenant: String,
    },
    TenantSummary {
        tenant: String,
    },
    Subscribe,
}

#[derive(Debug, Serialize)]
struct WireError {
    kind: &'static str,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflicts: Option<Vec<ConflictEntry>>,
}

#[derive(Debug, Serialize)]
struct Reply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

impl Reply {
    fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(e: EngineError) -> Self {
        let conflicts = match &e {
            EngineError::Conflict { conflicts, .. } => Some(conflicts.clone()),
            _ => None,
        };
        Self {
            ok: false,
            data: None,
            error: Some(WireError {
                kind: e.kind(),
                message: e.to_string(),
                retryable: e.retryable(),
                conflicts,
            }),
        }
    }
}

fn to_value<T: Serialize>(v: &T) -> Result<Value, EngineError> {
    serde_json::to_value(v).map_err(|e| EngineError::Corrupt(format!("serialize: {e}")))
}

fn parse_tenant(raw: &str) -> Result<Tenant, EngineError> {
    Tenant::parse(raw).map_err(|e| EngineError::Validation(e.to_string()))
}

async fn dispatch(
    engine: &Engine,
    actor: &Actor,
    req: Request,
) -> Result<Value, EngineError> {
    match req {
        // Handled in the connection loop
        Request::Hello { .. } | Request::Subscribe => Ok(Value::Null),

        Request::RegisterRoom {
            name,
            capacity,
            device_equipped,
        } => to_value(&engine.register_room(&name, capacity, device_equipped).await?),
        Request::RegisterDevice { serial, category } => {
            to_value(&engine.register_device(&serial, &category).await?)
        }
        Request::DeactivateRoom { room_id } => {
            engine.deactivate_room(room_id, actor).await?;
            Ok(Value::Null)
        }
        Request::RetireDevice { device_id } => {
            engine.retire_device(device_id, actor).await?;
            Ok(Value::Null)
        }

        Request::CreateBooking { request } => {
            to_value(&engine.create_booking(request, actor).await?)
        }
        Request::AssignRoom {
            booking_id,
            room_id,
            override_conflict,
            note,
        } => {
            engine
                .assign_room(booking_id, room_id, actor, override_conflict, note)
                .await?;
            Ok(Value::Null)
        }
        Request::RejectBooking { booking_id, reason } => {
            engine.reject_booking(booking_id, actor, &reason).await?;
            Ok(Value::Null)
        }
        Request::ConfirmBooking { booking_id } => {
            engine.confirm_booking(booking_id, actor).await?;
            Ok(Value::Null)
        }
        Request::CancelBooking { booking_id } => {
            engine.cancel_booking(booking_id, actor).await?;
            Ok(Value::Null)
        }
        Request::GetBooking { booking_id } => to_value(&engine.get_booking(booking_id).await?),
        Request::ListPending => to_value(&engine.list_pending().await),
        Request::ListRooms => to_value(&engine.list_rooms().await),
        Request::ListDevices { category } => {
            to_value(&engine.list_devices(category.as_deref()).await)
        }

        Request::CheckRoomConflicts {
            room_id,
            span,
            exclude_booking,
        } => to_value(
            &engine
                .check_room_conflicts(room_id, &span, exclude_booking, actor)
                .await?,
        ),
        Request::ValidateCapacity { room_id, headcount } => {
            to_value(&engine.validate_capacity(room_id, headcount).await?)
        }
        Request::FindAvailableRooms {
            span,
            min_capacity,
            need_devices,
        } => to_value(
            &engine
                .find_available_rooms(&span, min_capacity, need_devices)
                .await?,
        ),
        Request::RoomOccupancy { room_id, window } => {
            to_value(&engine.room_occupancy(room_id, &window).await?)
        }

        Request::FindAvailableDevices {
            category,
            span,
            exclude_booking,
        } => to_value(
            &engine
                .find_available_devices(&category, &span, exclude_booking)
                .await?,
        ),
        Request::AssignDevice {
            booking_id,
            device_id,
            notes,
            rental,
        } => to_value(
            &engine
                .assign_device(booking_id, device_id, actor, notes, rental)
                .await?,
        ),
        Request::UnassignDevice {
            assignment_id,
            reason,
        } => {
            engine.unassign_device(assignment_id, actor, reason).await?;
            Ok(Value::Null)
        }
        Request::CanReallocate {
            assignment_id,
            to_booking,
        } => to_value(&engine.can_reallocate(assignment_id, to_booking).await?),
        Request::ReallocateDevice {
            assignment_id,
            to_booking,
            reason,
            approved,
        } => to_value(
            &engine
                .reallocate_device(assignment_id, to_booking, actor, &reason, approved)
                .await?,
        ),
        Request::DetectDeviceConflicts => to_value(&engine.detect_device_conflicts().await),
        Request::CheckStockLevel {
            category,
            at,
            threshold,
        } => to_value(&engine.check_stock_level(&category, at, threshold).await?),
        Request::MarkRentalReturned { assignment_id } => {
            engine.mark_rental_returned(assignment_id, actor).await?;
            Ok(Value::Null)
        }
        Request::OverdueRentals => {
            to_value(&engine.overdue_rentals(crate::engine::now_ms()))
        }
        Request::MovementLog { device_id } => to_value(&engine.movement_log(device_id)),

        Request::BookingsForTenant { tenant } => {
            let tenant = parse_tenant(&tenant)?;
            to_value(&engine.bookings_for_tenant(&tenant).await)
        }
        Request::TenantSummary { tenant } => {
            let tenant = parse_tenant(&tenant)?;
            to_value(&engine.tenant_summary(&tenant).await)
        }
    }
}

fn encode_reply(reply: &Reply) -> String {
    serde_json::to_string(reply).unwrap_or_else(|_| {
        "{\"ok\":false,\"error\":{\"kind\":\"corrupt\",\"message\":\"reply encoding failed\",\"retryable\":false}}".to_string()
    })
}

/// Serve one client connection until EOF.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut actor: Option<Actor> = None;
    let mut events: Option<tokio::sync::broadcast::Receiver<DomainEvent>> = None;

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Err(Box::new(e)),
                    None => return Ok(()),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let req: Request = match serde_json::from_str(&line) {
                    Ok(req) => req,
                    Err(e) => {
                        let reply = Reply::err(EngineError::Validation(format!(
                            "malformed request: {e}"
                        )));
                        framed.send(encode_reply(&reply)).await?;
                        continue;
                    }
                };
                let label = observability::command_label(&req);
                let started = std::time::Instant::now();

                let reply = match req {
                    Request::Hello { actor: a } => {
                        debug!(actor = %a.name, "hello");
                        actor = Some(a);
                        Reply::ok(serde_json::json!({ "server": "reserva" }))
                    }
                    Request::Subscribe if actor.is_some() => {
                        events = Some(engine.hub.subscribe());
                        Reply::ok(serde_json::json!({ "subscribed": true }))
                    }
                    other => match actor.as_ref() {
                        None => Reply::err(EngineError::Validation(
                            "hello required before commands".into(),
                        )),
                        Some(a) => match dispatch(&engine, a, other).await {
                            Ok(data) => Reply::ok(data),
                            Err(e) => Reply::err(e),
                        },
                    },
                };

                let status = if reply.ok { "ok" } else { "error" };
                metrics::counter!(observability::COMMANDS_TOTAL,
                    "command" => label, "status" => status)
                .increment(1);
                metrics::histogram!(observability::COMMAND_DURATION_SECONDS,
                    "command" => label)
                .record(started.elapsed().as_secs_f64());

                framed.send(encode_reply(&reply)).await?;
            }
            event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Ok(event) => {
                        let line = serde_json::to_string(&event)?;
                        framed.send(line).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("event subscriber lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                }
            }
        }
    }
}
