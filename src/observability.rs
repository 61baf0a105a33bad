use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

// ── Booking activity ────────────────────────────────────────────

pub const BOOKINGS_COMMITTED_TOTAL: &str = "slotbook_bookings_committed_total";

/// Counter: booking attempts rejected because a slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotbook_booking_conflicts_total";

pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotbook_bookings_cancelled_total";

/// Counter: (venue, date) grids materialised.
pub const DAYS_OPENED_TOTAL: &str = "slotbook_days_opened_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVenue { .. } => "insert_venue",
        Command::DeleteVenue { .. } => "delete_venue",
        Command::SelectVenues { .. } => "select_venues",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::DeleteBooking { .. } => "delete_booking",
    }
}
