//! Domain types for the booking engine.
//!
//! Value objects (identifiers, money), the three persisted entities
//! (`AvailabilitySlot`, `Booking`, `BookingMessage`) and the `BookingStatus`
//! tag the lifecycle reducer drives.
//!
//! All dates and times are vendor-local wall-clock values; nothing here
//! performs time-zone conversion.

use crate::conflict::TimeWindow;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a marketplace user (customer or vendor)
    UserId
);
uuid_id!(
    /// Identifier of a booking
    BookingId
);
uuid_id!(
    /// Identifier of an availability slot
    SlotId
);
uuid_id!(
    /// Identifier of a message in a booking thread
    MessageId
);
uuid_id!(
    /// Identifier of a vendor service in the external catalog
    ServiceId
);

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Represents money in cents to avoid floating-point arithmetic errors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from whole dollars, `None` on overflow
    #[must_use]
    pub const fn checked_from_dollars(dollars: u64) -> Option<Self> {
        match dollars.checked_mul(100) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Returns the amount in dollars (rounded down)
    #[must_use]
    pub const fn dollars(&self) -> u64 {
        self.0 / 100
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:02}", self.dollars(), self.0 % 100)
    }
}

// ============================================================================
// Booking Status
// ============================================================================

/// Lifecycle state of a booking.
///
/// The legal moves between these states live in
/// [`BookingStatus::next`](crate::lifecycle), not here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Submitted by the customer, waiting for the vendor
    Pending,
    /// Confirmed by the vendor (or counter-offer accepted by the customer)
    Accepted,
    /// Refused by the vendor, or counter-offer refused by the customer
    Declined,
    /// Vendor proposed a revised amount; waiting for the customer
    CounterOffered,
    /// The engagement took place
    Completed,
    /// Withdrawn by either party
    Cancelled,
}

impl BookingStatus {
    /// Every status, in lifecycle order
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Accepted,
        Self::Declined,
        Self::CounterOffered,
        Self::Completed,
        Self::Cancelled,
    ];

    /// Stable snake_case name, used for storage and notification payloads
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::CounterOffered => "counter_offered",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Active bookings hold their window on the vendor's calendar
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Accepted)
    }

    /// No transition leaves a terminal status
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Declined | Self::Cancelled)
    }

    /// Whether the terms (amount, notes) of the booking are still negotiable
    #[must_use]
    pub const fn can_modify(self) -> bool {
        matches!(self, Self::Pending | Self::CounterOffered)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown booking status '{s}'"))
    }
}

// ============================================================================
// Domain Entities
// ============================================================================

/// Vendor-declared window on a single calendar date
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    /// Slot identifier
    pub id: SlotId,
    /// Owning vendor
    pub vendor_id: UserId,
    /// Calendar date the window starts on
    pub date: NaiveDate,
    /// Start time of day
    pub start_time: NaiveTime,
    /// End time of day; earlier than `start_time` for an overnight window
    pub end_time: NaiveTime,
    /// `false` marks declared unavailability
    pub available: bool,
}

impl AvailabilitySlot {
    /// Creates a new `AvailabilitySlot`
    #[must_use]
    pub fn new(
        vendor_id: UserId,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        available: bool,
    ) -> Self {
        Self {
            id: SlotId::new(),
            vendor_id,
            date,
            start_time,
            end_time,
            available,
        }
    }

    /// Whether the window crosses midnight into the next day
    #[must_use]
    pub fn is_overnight(&self) -> bool {
        self.end_time < self.start_time
    }

    /// The slot as an absolute window
    #[must_use]
    pub fn window(&self) -> TimeWindow {
        TimeWindow::for_slot(self.date, self.start_time, self.end_time)
    }
}

/// A customer's reservation of a vendor's time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking identifier
    pub id: BookingId,
    /// Customer party
    pub customer_id: UserId,
    /// Vendor party
    pub vendor_id: UserId,
    /// Booked service
    pub service_id: ServiceId,
    /// Engagement start (wall clock)
    pub event_start: NaiveDateTime,
    /// Engagement end; absent means the default duration
    pub event_end: Option<NaiveDateTime>,
    /// Where the engagement takes place
    pub location: String,
    /// Agreed (or proposed) price
    pub amount: Money,
    /// Lifecycle state
    pub status: BookingStatus,
    /// Customer's requirements
    pub requirements: Option<String>,
    /// Vendor's notes, set with a counter-offer
    pub vendor_notes: Option<String>,
    /// When the booking was submitted
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// The window this booking holds, with the default duration applied
    #[must_use]
    pub fn window(&self) -> TimeWindow {
        TimeWindow::for_event(self.event_start, self.event_end)
    }

    /// Whether `user` is the customer or the vendor of this booking
    #[must_use]
    pub fn is_party(&self, user: &UserId) -> bool {
        self.customer_id == *user || self.vendor_id == *user
    }

    /// The other party, if `user` is one of them
    #[must_use]
    pub fn counterparty(&self, user: &UserId) -> Option<UserId> {
        if *user == self.customer_id {
            Some(self.vendor_id)
        } else if *user == self.vendor_id {
            Some(self.customer_id)
        } else {
            None
        }
    }
}

/// One entry in a booking's conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingMessage {
    /// Message identifier
    pub id: MessageId,
    /// Booking the thread belongs to
    pub booking_id: BookingId,
    /// Author, always a party of the booking
    pub sender_id: UserId,
    /// Message text
    pub body: String,
    /// Ordering key
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in BookingStatus::ALL {
            assert_eq!(status.as_str().parse::<BookingStatus>(), Ok(status));
        }
        assert!("archived".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn only_pending_and_accepted_are_active() {
        let active: Vec<_> = BookingStatus::ALL
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        assert_eq!(active, vec![BookingStatus::Pending, BookingStatus::Accepted]);
    }

    #[test]
    fn money_displays_dollars_and_cents() {
        assert_eq!(Money::from_cents(12_345).to_string(), "$123.45");
        assert_eq!(Money::checked_from_dollars(7), Some(Money::from_cents(700)));
        assert_eq!(Money::checked_from_dollars(u64::MAX), None);
    }

    #[test]
    fn counterparty_is_the_other_side() {
        let customer = UserId::new();
        let vendor = UserId::new();
        let booking = Booking {
            id: BookingId::new(),
            customer_id: customer,
            vendor_id: vendor,
            service_id: ServiceId::new(),
            event_start: NaiveDate::from_ymd_opt(2025, 3, 1)
                .and_then(|d| d.and_hms_opt(10, 0, 0))
                .unwrap_or_default(),
            event_end: None,
            location: "Hall".to_string(),
            amount: Money::from_cents(0),
            status: BookingStatus::Pending,
            requirements: None,
            vendor_notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(booking.counterparty(&customer), Some(vendor));
        assert_eq!(booking.counterparty(&vendor), Some(customer));
        assert_eq!(booking.counterparty(&UserId::new()), None);
        assert!(!booking.is_party(&UserId::new()));
    }
}
