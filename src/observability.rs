use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "staybook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "staybook_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome
/// (confirmed, unavailable, payment_failed, invalid, error).
pub const RESERVATIONS_TOTAL: &str = "staybook_reservations_total";

/// Histogram: end-to-end reservation latency including the gateway call.
pub const RESERVATION_DURATION_SECONDS: &str = "staybook_reservation_duration_seconds";

/// Counter: settled payment attempts. Labels: status.
pub const PAYMENTS_TOTAL: &str = "staybook_payments_total";

/// Counter: PENDING bookings cancelled by the expiry reaper.
pub const BOOKINGS_EXPIRED_TOTAL: &str = "staybook_bookings_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "staybook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "staybook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "staybook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "staybook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "staybook_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "staybook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertHotel(_) => "insert_hotel",
        Command::DeleteHotel { .. } => "delete_hotel",
        Command::SelectHotels(_) => "select_hotels",
        Command::InsertRoom(_) => "insert_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::SelectRooms(_) => "select_rooms",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertReservation(_) => "insert_reservation",
        Command::InsertPayment { .. } => "insert_payment",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectPayments { .. } => "select_payments",
    }
}
