use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "reserva_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "reserva_command_duration_seconds";

/// Counter: overlap rejections observed on reserve paths.
pub const CONFLICTS_TOTAL: &str = "reserva_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reserva_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reserva_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reserva_connections_rejected_total";

/// Counter: bookings swept Confirmed → Completed by the reaper.
pub const BOOKINGS_COMPLETED_TOTAL: &str = "reserva_bookings_completed_total";

/// Counter: overdue-rental alerts published.
pub const RENTALS_OVERDUE_TOTAL: &str = "reserva_rentals_overdue_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reserva_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reserva_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn command_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::RegisterRoom { .. } => "register_room",
        Request::RegisterDevice { .. } => "register_device",
        Request::DeactivateRoom { .. } => "deactivate_room",
        Request::RetireDevice { .. } => "retire_device",
        Request::CreateBooking { .. } => "create_booking",
        Request::AssignRoom { .. } => "assign_room",
        Request::RejectBooking { .. } => "reject_booking",
        Request::ConfirmBooking { .. } => "confirm_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::GetBooking { .. } => "get_booking",
        Request::ListPending => "list_pending",
        Request::ListRooms => "list_rooms",
        Request::ListDevices { .. } => "list_devices",
        Request::CheckRoomConflicts { .. } => "check_room_conflicts",
        Request::ValidateCapacity { .. } => "validate_capacity",
        Request::FindAvailableRooms { .. } => "find_available_rooms",
        Request::RoomOccupancy { .. } => "room_occupancy",
        Request::FindAvailableDevices { .. } => "find_available_devices",
        Request::AssignDevice { .. } => "assign_device",
        Request::UnassignDevice { .. } => "unassign_device",
        Request::CanReallocate { .. } => "can_reallocate",
        Request::ReallocateDevice { .. } => "reallocate_device",
        Request::DetectDeviceConflicts => "detect_device_conflicts",
        Request::CheckStockLevel { .. } => "check_stock_level",
        Request::MarkRentalReturned { .. } => "mark_rental_returned",
        Request::OverdueRentals => "overdue_rentals",
        Request::MovementLog { .. } => "movement_log",
        Request::BookingsForTenant { .. } => "bookings_for_tenant",
        Request::TenantSummary { .. } => "tenant_summary",
        Request::Subscribe => "subscribe",
    }
}
