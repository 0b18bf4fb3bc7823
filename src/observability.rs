use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "vacancy_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "vacancy_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "vacancy_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "vacancy_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "vacancy_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "vacancy_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "vacancy_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const COMPACTIONS_TOTAL: &str = "vacancy_compactions_total";

// ── Reservation contention ──────────────────────────────────────

/// Counter: reservations refused because the dates were taken. Labels: kind (booking, block).
pub const RESERVATION_CONFLICTS_TOTAL: &str = "vacancy_reservation_conflicts_total";

/// Histogram: time spent waiting for a property lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "vacancy_lock_wait_seconds";

/// Counter: property lock waits that hit the ceiling.
pub const LOCK_TIMEOUTS_TOTAL: &str = "vacancy_lock_timeouts_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProperty { .. } => "insert_property",
        Command::UpdateProperty { .. } => "update_property",
        Command::DeleteProperty { .. } => "delete_property",
        Command::InsertGuest { .. } => "insert_guest",
        Command::UpdateGuest { .. } => "update_guest",
        Command::DeleteGuest { .. } => "delete_guest",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::ReactivateBooking { .. } => "reactivate_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertBlock { .. } => "insert_block",
        Command::UpdateBlock { .. } => "update_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::SelectProperties => "select_properties",
        Command::SelectGuests => "select_guests",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBlocks { .. } => "select_blocks",
    }
}
