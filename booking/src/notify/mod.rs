//! Notification events emitted on booking state changes.
//!
//! The lifecycle reducer and the message thread describe *what* happened as a
//! [`Notification`] and hand it to a [`NotificationDispatcher`]. Dispatching
//! never blocks and never fails the caller; the [`worker::DeliveryWorker`]
//! resolves the recipient and carries the notification to a
//! [`worker::NotificationChannel`] with the retry policy for its kind.

pub mod dead_letter;
pub mod retry;
pub mod worker;

use crate::directory::{IdentityProvider, ServiceCatalog};
use crate::types::{Booking, BookingId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

/// Event taxonomy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A customer requested a booking (to vendor)
    BookingCreated,
    /// Booking accepted (to the other party)
    BookingApproved,
    /// Booking declined (to the other party)
    BookingRejected,
    /// Vendor proposed different terms (to customer)
    BookingCounterOffered,
    /// Booking cancelled (to the other party)
    BookingCancelled,
    /// Upcoming engagement (to customer)
    BookingReminder,
    /// New message in the booking thread (to the other party)
    NewMessage,
}

impl NotificationKind {
    /// All kinds
    pub const ALL: [Self; 7] = [
        Self::BookingCreated,
        Self::BookingApproved,
        Self::BookingRejected,
        Self::BookingCounterOffered,
        Self::BookingCancelled,
        Self::BookingReminder,
        Self::NewMessage,
    ];

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BookingCreated => "booking_created",
            Self::BookingApproved => "booking_approved",
            Self::BookingRejected => "booking_rejected",
            Self::BookingCounterOffered => "booking_counter_offered",
            Self::BookingCancelled => "booking_cancelled",
            Self::BookingReminder => "booking_reminder",
            Self::NewMessage => "new_message",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification addressed to one user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Event kind
    pub kind: NotificationKind,
    /// Addressee
    pub recipient: UserId,
    /// Booking the event concerns
    pub booking_id: BookingId,
    /// Data for templating downstream
    pub payload: Map<String, Value>,
    /// When the event happened
    pub emitted_at: DateTime<Utc>,
}

impl Notification {
    /// Build a notification about `booking` with the standard payload.
    #[must_use]
    pub fn about(
        kind: NotificationKind,
        recipient: UserId,
        booking: &Booking,
        context: &NotificationContext,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            recipient,
            booking_id: booking.id,
            payload: context.payload(booking),
            emitted_at,
        }
    }

    /// Add or replace a payload field
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}

/// Fire-and-forget sink for notifications.
pub trait NotificationDispatcher: Send + Sync {
    /// Hand off a notification. Must not block and must not fail the caller.
    fn dispatch(&self, notification: Notification);
}

/// Display names that go into every payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContext {
    /// Vendor's display name
    pub vendor_name: String,
    /// Customer's display name
    pub customer_name: String,
    /// Booked service's name
    pub service_name: String,
}

impl NotificationContext {
    /// Look the names up. Best effort: any lookup that fails or finds nothing
    /// falls back to the raw identifier.
    pub async fn resolve(
        booking: &Booking,
        identity: &dyn IdentityProvider,
        catalog: &dyn ServiceCatalog,
    ) -> Self {
        let name_of = |user: UserId| async move {
            match identity.resolve(&user).await {
                Ok(Some(party)) => party.display_name,
                Ok(None) => user.to_string(),
                Err(err) => {
                    tracing::debug!(%user, error = %err, "name lookup failed");
                    user.to_string()
                },
            }
        };

        let vendor_name = name_of(booking.vendor_id).await;
        let customer_name = name_of(booking.customer_id).await;
        let service_name = match catalog.lookup(&booking.service_id).await {
            Ok(Some(listing)) => listing.name,
            _ => booking.service_id.to_string(),
        };

        Self {
            vendor_name,
            customer_name,
            service_name,
        }
    }

    /// Standard payload for `booking`
    #[must_use]
    pub fn payload(&self, booking: &Booking) -> Map<String, Value> {
        let value = json!({
            "booking_id": booking.id.to_string(),
            "vendor_name": self.vendor_name,
            "customer_name": self.customer_name,
            "service_name": self.service_name,
            "event_date": booking.event_start.date().to_string(),
            "event_start": booking.event_start.format("%H:%M").to_string(),
            "status": booking.status.as_str(),
            "amount": booking.amount.to_string(),
            "location": booking.location,
        });

        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::directory::{Party, Role, ServiceListing, StaticCatalog, StaticDirectory};
    use crate::types::{BookingStatus, Money, ServiceId};
    use chrono::NaiveDate;

    fn booking() -> Booking {
        Booking {
            id: BookingId::new(),
            customer_id: UserId::new(),
            vendor_id: UserId::new(),
            service_id: ServiceId::new(),
            event_start: NaiveDate::from_ymd_opt(2025, 6, 14)
                .unwrap()
                .and_hms_opt(15, 30, 0)
                .unwrap(),
            event_end: None,
            location: "Rose Garden".to_string(),
            amount: Money::from_cents(45_000),
            status: BookingStatus::Pending,
            requirements: None,
            vendor_notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn kinds_serialize_snake_case() {
        for kind in NotificationKind::ALL {
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                Value::String(kind.as_str().to_string())
            );
        }
    }

    #[tokio::test]
    async fn context_falls_back_to_ids() {
        let booking = booking();
        let directory = StaticDirectory::new();
        directory.insert(Party::new(booking.vendor_id, Role::Vendor, "Shutter Co"));
        let catalog = StaticCatalog::new();
        catalog.insert(ServiceListing {
            id: booking.service_id,
            vendor_id: booking.vendor_id,
            name: "Wedding photography".to_string(),
            base_price: Money::from_cents(45_000),
        });

        let context = NotificationContext::resolve(&booking, &directory, &catalog).await;

        assert_eq!(context.vendor_name, "Shutter Co");
        assert_eq!(context.customer_name, booking.customer_id.to_string());
        assert_eq!(context.service_name, "Wedding photography");
    }

    #[test]
    fn payload_carries_required_fields() {
        let booking = booking();
        let context = NotificationContext {
            vendor_name: "V".into(),
            customer_name: "C".into(),
            service_name: "S".into(),
        };

        let n = Notification::about(
            NotificationKind::BookingCreated,
            booking.vendor_id,
            &booking,
            &context,
            Utc::now(),
        )
        .with_field("preview", "hi");

        for key in [
            "booking_id",
            "vendor_name",
            "customer_name",
            "service_name",
            "event_date",
            "status",
            "preview",
        ] {
            assert!(n.payload.contains_key(key), "missing {key}");
        }
        assert_eq!(n.payload["event_date"], "2025-06-14");
        assert_eq!(n.payload["status"], "pending");
    }
}
