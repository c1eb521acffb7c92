//! Business metrics for impact ticketing.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `impact_reservations_total{outcome}` - Reservation attempts (granted, replayed, denied)
//! - `impact_tickets_total{status}` - Ticket transitions by target status
//! - `impact_ledger_calls_total{operation,outcome}` - Ledger calls by outcome
//! - `impact_donations_total{status}` - Donation transitions by target status
//! - `impact_donated_minor_units_total` - Confirmed donation volume
//! - `impact_reconciliation_resolved_total{record,outcome}` - Records resolved by the sweep
//!
//! ## Gauges
//! - `impact_tickets_available{event_id}` - Remaining admissions per event
//!
//! ## Histograms
//! - `impact_ledger_call_duration_seconds{operation}` - Ledger round-trip time

use impact_core::records::{Availability, DonationStatus, TicketStatus};
use impact_core::types::Money;
use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Initialize and register all business metrics descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "impact_reservations_total",
        "Reservation attempts by outcome (granted, replayed, denied)"
    );
    describe_counter!(
        "impact_tickets_total",
        "Ticket transitions by target status"
    );
    describe_counter!(
        "impact_ledger_calls_total",
        "Ledger calls by operation and outcome (ok, rejected, timeout)"
    );
    describe_histogram!(
        "impact_ledger_call_duration_seconds",
        "Ledger call round-trip time"
    );
    describe_counter!(
        "impact_donations_total",
        "Donation transitions by target status"
    );
    describe_counter!(
        "impact_donated_minor_units_total",
        "Confirmed donation volume in minor currency units"
    );
    describe_counter!(
        "impact_reconciliation_resolved_total",
        "Records resolved by the reconciliation sweep"
    );
    describe_gauge!(
        "impact_tickets_available",
        "Remaining admissions per event"
    );

    tracing::info!("Business metrics registered");
}

/// Record the outcome of a reservation attempt.
pub fn record_reservation(outcome: &'static str) {
    metrics::counter!("impact_reservations_total", "outcome" => outcome).increment(1);
}

/// Record a ticket reaching `status`.
pub fn record_ticket(status: TicketStatus) {
    metrics::counter!("impact_tickets_total", "status" => status.as_str()).increment(1);
}

/// Record one ledger call.
pub fn record_ledger_call(operation: &'static str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!(
        "impact_ledger_calls_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("impact_ledger_call_duration_seconds", "operation" => operation)
        .record(duration_secs);
}

/// Record a donation reaching `status`.
pub fn record_donation(status: DonationStatus, amount: Money) {
    metrics::counter!("impact_donations_total", "status" => status.as_str()).increment(1);
    if status == DonationStatus::Confirmed {
        metrics::counter!("impact_donated_minor_units_total").increment(amount.minor());
    }
}

/// Record a record resolved by the sweep.
pub fn record_resolution(record: &'static str, outcome: &'static str) {
    metrics::counter!(
        "impact_reconciliation_resolved_total",
        "record" => record,
        "outcome" => outcome
    )
    .increment(1);
}

/// Publish the current availability of an event.
pub fn record_availability(availability: &Availability) {
    metrics::gauge!(
        "impact_tickets_available",
        "event_id" => availability.event_id.to_string()
    )
    .set(f64::from(availability.available));
}
