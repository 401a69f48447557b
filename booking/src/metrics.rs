//! Business metrics for the booking engine.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `gigbook_bookings_total{status}` - Booking status changes, by resulting status
//! - `gigbook_booking_conflicts_total` - Booking requests refused for a calendar conflict
//! - `gigbook_notifications_total{kind, outcome}` - Notification deliveries by outcome
//! - `gigbook_messages_total` - Messages posted to booking threads
//! - `gigbook_dead_letters_dropped_total` - Dead letters evicted at capacity
//!
//! ## Gauges
//! - `gigbook_dead_letter_queue_size` - Current dead letter queue length
//!
//! No exporter is installed here; the host process chooses one.

use crate::notify::NotificationKind;
use crate::types::BookingStatus;
use metrics::{describe_counter, describe_gauge};

/// Register all business metric descriptions.
///
/// Call once at startup, before any metrics are recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "gigbook_bookings_total",
        "Booking status changes by resulting status"
    );
    describe_counter!(
        "gigbook_booking_conflicts_total",
        "Booking requests refused because of a calendar conflict"
    );
    describe_counter!(
        "gigbook_notifications_total",
        "Notification deliveries by kind and outcome (delivered, discarded, dead_lettered, dropped)"
    );
    describe_counter!(
        "gigbook_messages_total",
        "Messages posted to booking threads"
    );
    describe_counter!(
        "gigbook_dead_letters_dropped_total",
        "Dead letters evicted because the queue was full"
    );
    describe_gauge!(
        "gigbook_dead_letter_queue_size",
        "Current number of undelivered notifications held"
    );

    tracing::info!("Business metrics registered");
}

/// Record a booking entering `status`.
pub fn record_booking_status(status: BookingStatus) {
    metrics::counter!("gigbook_bookings_total", "status" => status.as_str()).increment(1);
    tracing::debug!(status = status.as_str(), "Recorded booking status metric");
}

/// Record a booking request refused for a conflict.
pub fn record_booking_conflict() {
    metrics::counter!("gigbook_booking_conflicts_total").increment(1);
}

/// Record the outcome of one notification.
pub fn record_notification(kind: NotificationKind, outcome: &'static str) {
    metrics::counter!(
        "gigbook_notifications_total",
        "kind" => kind.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a posted message.
pub fn record_message_posted() {
    metrics::counter!("gigbook_messages_total").increment(1);
}
