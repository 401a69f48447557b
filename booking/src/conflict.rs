//! Availability conflict detection.
//!
//! Pure functions only: callers hand in the vendor's slots and bookings and get
//! a decision back. Storage backends call [`find_conflicts`] inside their
//! per-vendor critical section; the calendar calls it for diagnostics.
//!
//! Every overlap question in the crate (booking vs booking, slot deletion,
//! diagnostics) goes through [`TimeWindow::overlaps`].

use crate::types::{AvailabilitySlot, Booking, BookingId, SlotId, UserId};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Length of a booking that was submitted without an end time.
pub const DEFAULT_EVENT_MINUTES: i64 = 120;

/// Half-open interval `[start, end)` on the vendor's wall clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl TimeWindow {
    /// Window from `start` to `end`, `None` unless `end > start`.
    #[must_use]
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    /// Window held by a booking.
    ///
    /// An absent end, or one not after `start`, falls back to
    /// `start + DEFAULT_EVENT_MINUTES`. A default end past the last
    /// representable instant is clamped to it; [`TimeWindow::try_for_event`]
    /// reports that case instead.
    #[must_use]
    pub fn for_event(start: NaiveDateTime, end: Option<NaiveDateTime>) -> Self {
        Self::try_for_event(start, end).unwrap_or(Self {
            start,
            end: NaiveDateTime::MAX,
        })
    }

    /// Like [`TimeWindow::for_event`], `None` when the default end overflows.
    #[must_use]
    pub fn try_for_event(start: NaiveDateTime, end: Option<NaiveDateTime>) -> Option<Self> {
        let end = match end.filter(|end| *end > start) {
            Some(end) => end,
            None => start.checked_add_signed(Duration::minutes(DEFAULT_EVENT_MINUTES))?,
        };
        Some(Self { start, end })
    }

    /// Window declared by a slot. An end time before the start time rolls
    /// over into the next day, clamped to the last representable instant.
    #[must_use]
    pub fn for_slot(date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> Self {
        Self::try_for_slot(date, start_time, end_time).unwrap_or(Self {
            start: date.and_time(start_time),
            end: NaiveDateTime::MAX,
        })
    }

    /// Like [`TimeWindow::for_slot`], `None` when the rollover overflows.
    #[must_use]
    pub fn try_for_slot(
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Option<Self> {
        let start = date.and_time(start_time);
        let mut end = date.and_time(end_time);
        if end_time < start_time {
            end = end.checked_add_signed(Duration::days(1))?;
        }
        Some(Self { start, end })
    }

    /// Inclusive start
    #[must_use]
    pub const fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// Exclusive end
    #[must_use]
    pub const fn end(&self) -> NaiveDateTime {
        self.end
    }

    /// Zero-length windows cover nothing and overlap nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// `a.start < b.end && b.start < a.end`. Windows that merely touch do not overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start < other.end
            && other.start < self.end
    }

    /// Whether `other` lies entirely inside this window.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        !self.is_empty() && self.start <= other.start && other.end <= self.end
    }
}

/// Whether `slot`'s window (overnight-adjusted) contains `window`.
#[must_use]
pub fn slot_covers(slot: &AvailabilitySlot, window: &TimeWindow) -> bool {
    slot.window().contains(window)
}

/// Active bookings of `vendor` overlapping `window`, skipping `exclude`.
pub fn overlapping_bookings<'a>(
    bookings: &'a [Booking],
    vendor: &'a UserId,
    window: &'a TimeWindow,
    exclude: Option<BookingId>,
) -> impl Iterator<Item = &'a Booking> + 'a {
    bookings.iter().filter(move |booking| {
        booking.vendor_id == *vendor
            && booking.status.is_active()
            && Some(booking.id) != exclude
            && booking.window().overlaps(window)
    })
}

/// What stands in the way of granting a proposed window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFindings {
    /// No available slot on the proposal's date covers it
    pub uncovered: bool,
    /// Unavailable slots overlapping the proposal, from its date or an
    /// overnight slot of the day before
    pub blocking_slots: Vec<SlotId>,
    /// Active bookings overlapping the proposal
    pub overlapping_bookings: Vec<BookingId>,
}

impl ConflictFindings {
    /// The proposal can be granted.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        !self.uncovered && self.blocking_slots.is_empty() && self.overlapping_bookings.is_empty()
    }
}

/// Check `proposal` against the vendor's declared availability and their
/// existing bookings.
///
/// Coverage only counts slots dated on the proposal's start date. Declared
/// unavailability also reaches back to overnight slots of the previous day.
/// `exclude` names the booking being modified, if any, so it does not
/// conflict with itself.
#[must_use]
pub fn find_conflicts(
    slots: &[AvailabilitySlot],
    bookings: &[Booking],
    vendor: &UserId,
    proposal: &TimeWindow,
    exclude: Option<BookingId>,
) -> ConflictFindings {
    let date = proposal.start().date();
    let same_day = || {
        slots
            .iter()
            .filter(move |slot| slot.vendor_id == *vendor && slot.date == date)
    };

    let uncovered = !same_day().any(|slot| slot.available && slot_covers(slot, proposal));

    let day_before = date.pred_opt();
    let blocking_slots = slots
        .iter()
        .filter(|slot| {
            slot.vendor_id == *vendor
                && !slot.available
                && (slot.date == date || (slot.is_overnight() && Some(slot.date) == day_before))
                && slot.window().overlaps(proposal)
        })
        .map(|slot| slot.id)
        .collect();

    let overlapping_bookings = overlapping_bookings(bookings, vendor, proposal, exclude)
        .map(|booking| booking.id)
        .collect();

    ConflictFindings {
        uncovered,
        blocking_slots,
        overlapping_bookings,
    }
}

/// Slot dates [`find_conflicts`] looks at for `proposal`: the start date and
/// the day before it.
#[must_use]
pub fn relevant_slot_dates(proposal: &TimeWindow) -> Vec<NaiveDate> {
    let date = proposal.start().date();
    date.pred_opt().into_iter().chain([date]).collect()
}

/// `true` when `proposal` cannot be granted.
#[must_use]
pub fn conflicts(
    slots: &[AvailabilitySlot],
    bookings: &[Booking],
    vendor: &UserId,
    proposal: &TimeWindow,
    exclude: Option<BookingId>,
) -> bool {
    !find_conflicts(slots, bookings, vendor, proposal, exclude).is_clear()
}
