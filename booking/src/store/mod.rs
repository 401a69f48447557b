//! Persistence for slots, bookings and messages.
//!
//! Anything that must be decided atomically against a vendor's calendar
//! (conflict-checked booking insert, guarded slot edit and deletion, status
//! compare-and-set) is a single trait method, so each backend can run it
//! inside its own per-vendor critical section.

pub mod memory;
pub mod postgres;

use crate::conflict::{TimeWindow, find_conflicts};
use crate::error::Result;
use crate::types::{
    AvailabilitySlot, Booking, BookingId, BookingMessage, BookingStatus, SlotId, UserId,
};
use chrono::NaiveDate;
use futures::future::BoxFuture;

pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;

/// Storage backend for the booking engine.
pub trait BookingStorage: Send + Sync {
    /// Store a new slot.
    fn insert_slot(&self, slot: AvailabilitySlot) -> BoxFuture<'_, Result<AvailabilitySlot>>;

    /// Replace a slot. Fails with `Conflict` when an active booking would no
    /// longer be grantable after the edit.
    fn update_slot(&self, slot: AvailabilitySlot) -> BoxFuture<'_, Result<AvailabilitySlot>>;

    /// Remove a slot. Fails with `Conflict` when an active booking overlaps it.
    fn delete_slot(&self, vendor: UserId, slot_id: SlotId) -> BoxFuture<'_, Result<()>>;

    /// Fetch one slot
    fn slot(&self, slot_id: SlotId) -> BoxFuture<'_, Result<Option<AvailabilitySlot>>>;

    /// Slots of `vendor` dated `from..=to`, ordered by `(date, start_time)`.
    fn slots_between(
        &self,
        vendor: UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<AvailabilitySlot>>>;

    /// Active bookings of `vendor` whose window overlaps `window`.
    fn active_bookings_overlapping(
        &self,
        vendor: UserId,
        window: TimeWindow,
    ) -> BoxFuture<'_, Result<Vec<Booking>>>;

    /// Run the conflict check and insert in one atomic step. Fails with
    /// `Conflict` when the booking's window cannot be granted.
    fn insert_booking(&self, booking: Booking) -> BoxFuture<'_, Result<Booking>>;

    /// Fetch one booking
    fn booking(&self, booking_id: BookingId) -> BoxFuture<'_, Result<Option<Booking>>>;

    /// Write `booking` if the stored status is still `expected`; otherwise
    /// fail with `ConcurrentModification`. A booking re-entering an active
    /// status (an accepted counter-offer) is conflict-checked again.
    fn update_booking(
        &self,
        booking: Booking,
        expected: BookingStatus,
    ) -> BoxFuture<'_, Result<Booking>>;

    /// Bookings where `user` is customer or vendor, latest event first.
    fn bookings_for_party(
        &self,
        user: UserId,
        status: Option<BookingStatus>,
    ) -> BoxFuture<'_, Result<Vec<Booking>>>;

    /// Append to a booking's thread
    fn append_message(&self, message: BookingMessage) -> BoxFuture<'_, Result<BookingMessage>>;

    /// A booking's thread in insertion order
    fn messages(&self, booking_id: BookingId) -> BoxFuture<'_, Result<Vec<BookingMessage>>>;
}

/// Active bookings touched by replacing `old` with `new` that would no longer
/// be grantable against `slots_after` (the vendor's slots with the edit applied).
pub(crate) fn displaced_bookings(
    old: &AvailabilitySlot,
    new: &AvailabilitySlot,
    slots_after: &[AvailabilitySlot],
    active: &[Booking],
) -> Vec<BookingId> {
    let (old_window, new_window) = (old.window(), new.window());

    active
        .iter()
        .filter(|booking| {
            let window = booking.window();
            (old_window.overlaps(&window) || new_window.overlaps(&window))
                && !find_conflicts(slots_after, &[], &booking.vendor_id, &window, None).is_clear()
        })
        .map(|booking| booking.id)
        .collect()
}
