use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::command::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "rentable_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "rentable_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: PENDING reservations written. Labels: charging_type.
pub const RESERVATIONS_CREATED_TOTAL: &str = "rentable_reservations_created_total";

/// Counter: rental requests refused for overlap or a blocked period. Labels: stage.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "rentable_reservation_conflicts_total";

/// Counter: confirm/reject decisions applied. Labels: decision.
pub const RENTAL_DECISIONS_TOTAL: &str = "rentable_rental_decisions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rentable_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rentable_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rentable_connections_rejected_total";

/// Counter: failed authentications.
pub const AUTH_FAILURES_TOTAL: &str = "rentable_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentable_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentable_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op when `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a request.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Auth { .. } => "auth",
        Request::GetAvailableDates { .. } => "get_available_dates",
        Request::GetAvailableHours { .. } => "get_available_hours",
        Request::CheckAvailability { .. } => "check_availability",
        Request::CalculatePrice { .. } => "calculate_price",
        Request::CreateRentalRequest { .. } => "create_rental_request",
        Request::ConfirmRental { .. } => "confirm_rental",
        Request::GetReservation { .. } => "get_reservation",
        Request::RegisterCompany { .. } => "register_company",
        Request::RegisterClient { .. } => "register_client",
        Request::LinkAssociate { .. } => "link_associate",
        Request::RegisterProduct { .. } => "register_product",
        Request::DeleteProduct { .. } => "delete_product",
        Request::SetWeeklySchedule { .. } => "set_weekly_schedule",
        Request::AddDateOverride { .. } => "add_date_override",
        Request::RemoveDateOverride { .. } => "remove_date_override",
    }
}
