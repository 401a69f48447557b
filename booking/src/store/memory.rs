//! In-memory storage.
//!
//! Data lives in `tokio::sync::RwLock`ed maps so reads run concurrently.
//! Every write that depends on a vendor's calendar first takes that vendor's
//! `tokio::sync::Mutex`, which makes check-then-write atomic per vendor
//! without serializing unrelated vendors.

use super::{BookingStorage, displaced_bookings};
use crate::conflict::{TimeWindow, find_conflicts, overlapping_bookings};
use crate::error::{BookingError, ConflictDetail, Result};
use crate::types::{
    AvailabilitySlot, Booking, BookingId, BookingMessage, BookingStatus, SlotId, UserId,
};
use chrono::NaiveDate;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

/// Storage backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    slots: RwLock<HashMap<SlotId, AvailabilitySlot>>,
    bookings: RwLock<HashMap<BookingId, Booking>>,
    messages: RwLock<HashMap<BookingId, Vec<BookingMessage>>>,
    vendor_locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl InMemoryStorage {
    /// Empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn vendor_lock(&self, vendor: UserId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .vendor_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(vendor).or_default())
    }

    async fn vendor_slots(&self, vendor: UserId) -> Vec<AvailabilitySlot> {
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.vendor_id == vendor)
            .cloned()
            .collect()
    }

    async fn vendor_active_bookings(&self, vendor: UserId) -> Vec<Booking> {
        self.bookings
            .read()
            .await
            .values()
            .filter(|booking| booking.vendor_id == vendor && booking.status.is_active())
            .cloned()
            .collect()
    }

    /// Caller must hold the vendor lock.
    async fn check_grantable(&self, booking: &Booking) -> Result<()> {
        let slots = self.vendor_slots(booking.vendor_id).await;
        let active = self.vendor_active_bookings(booking.vendor_id).await;
        let findings = find_conflicts(
            &slots,
            &active,
            &booking.vendor_id,
            &booking.window(),
            Some(booking.id),
        );

        if findings.is_clear() {
            Ok(())
        } else {
            Err(BookingError::Conflict(findings.into()))
        }
    }
}

impl BookingStorage for InMemoryStorage {
    fn insert_slot(&self, slot: AvailabilitySlot) -> BoxFuture<'_, Result<AvailabilitySlot>> {
        Box::pin(async move {
            let lock = self.vendor_lock(slot.vendor_id);
            let _guard = lock.lock().await;

            self.slots.write().await.insert(slot.id, slot.clone());
            Ok(slot)
        })
    }

    fn update_slot(&self, slot: AvailabilitySlot) -> BoxFuture<'_, Result<AvailabilitySlot>> {
        Box::pin(async move {
            let lock = self.vendor_lock(slot.vendor_id);
            let _guard = lock.lock().await;

            let old = self
                .slots
                .read()
                .await
                .get(&slot.id)
                .filter(|old| old.vendor_id == slot.vendor_id)
                .cloned()
                .ok_or_else(|| BookingError::not_found("slot", slot.id))?;

            let mut slots_after = self.vendor_slots(slot.vendor_id).await;
            for existing in &mut slots_after {
                if existing.id == slot.id {
                    *existing = slot.clone();
                }
            }
            let active = self.vendor_active_bookings(slot.vendor_id).await;

            let displaced = displaced_bookings(&old, &slot, &slots_after, &active);
            if !displaced.is_empty() {
                return Err(BookingError::Conflict(ConflictDetail {
                    uncovered: false,
                    slot_ids: vec![slot.id],
                    booking_ids: displaced,
                }));
            }

            self.slots.write().await.insert(slot.id, slot.clone());
            Ok(slot)
        })
    }

    fn delete_slot(&self, vendor: UserId, slot_id: SlotId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let lock = self.vendor_lock(vendor);
            let _guard = lock.lock().await;

            let slot = self
                .slots
                .read()
                .await
                .get(&slot_id)
                .filter(|slot| slot.vendor_id == vendor)
                .cloned()
                .ok_or_else(|| BookingError::not_found("slot", slot_id))?;

            let active = self.vendor_active_bookings(vendor).await;
            let window = slot.window();
            let blocking: Vec<BookingId> = overlapping_bookings(&active, &vendor, &window, None)
                .map(|booking| booking.id)
                .collect();

            if !blocking.is_empty() {
                return Err(BookingError::Conflict(ConflictDetail {
                    uncovered: false,
                    slot_ids: vec![slot_id],
                    booking_ids: blocking,
                }));
            }

            self.slots.write().await.remove(&slot_id);
            Ok(())
        })
    }

    fn slot(&self, slot_id: SlotId) -> BoxFuture<'_, Result<Option<AvailabilitySlot>>> {
        Box::pin(async move { Ok(self.slots.read().await.get(&slot_id).cloned()) })
    }

    fn slots_between(
        &self,
        vendor: UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<AvailabilitySlot>>> {
        Box::pin(async move {
            let mut slots: Vec<_> = self
                .vendor_slots(vendor)
                .await
                .into_iter()
                .filter(|slot| slot.date >= from && slot.date <= to)
                .collect();
            slots.sort_by_key(|slot| (slot.date, slot.start_time));
            Ok(slots)
        })
    }

    fn active_bookings_overlapping(
        &self,
        vendor: UserId,
        window: TimeWindow,
    ) -> BoxFuture<'_, Result<Vec<Booking>>> {
        Box::pin(async move {
            let active = self.vendor_active_bookings(vendor).await;
            Ok(overlapping_bookings(&active, &vendor, &window, None)
                .cloned()
                .collect())
        })
    }

    fn insert_booking(&self, booking: Booking) -> BoxFuture<'_, Result<Booking>> {
        Box::pin(async move {
            let lock = self.vendor_lock(booking.vendor_id);
            let _guard = lock.lock().await;

            self.check_grantable(&booking).await?;
            self.bookings
                .write()
                .await
                .insert(booking.id, booking.clone());
            Ok(booking)
        })
    }

    fn booking(&self, booking_id: BookingId) -> BoxFuture<'_, Result<Option<Booking>>> {
        Box::pin(async move { Ok(self.bookings.read().await.get(&booking_id).cloned()) })
    }

    fn update_booking(
        &self,
        booking: Booking,
        expected: BookingStatus,
    ) -> BoxFuture<'_, Result<Booking>> {
        Box::pin(async move {
            let lock = self.vendor_lock(booking.vendor_id);
            let _guard = lock.lock().await;

            let current = self
                .bookings
                .read()
                .await
                .get(&booking.id)
                .map(|stored| stored.status)
                .ok_or_else(|| BookingError::not_found("booking", booking.id))?;

            if current != expected {
                return Err(BookingError::ConcurrentModification {
                    booking_id: booking.id,
                });
            }

            if booking.status.is_active() && !expected.is_active() {
                self.check_grantable(&booking).await?;
            }

            self.bookings
                .write()
                .await
                .insert(booking.id, booking.clone());
            Ok(booking)
        })
    }

    fn bookings_for_party(
        &self,
        user: UserId,
        status: Option<BookingStatus>,
    ) -> BoxFuture<'_, Result<Vec<Booking>>> {
        Box::pin(async move {
            let mut found: Vec<_> = self
                .bookings
                .read()
                .await
                .values()
                .filter(|booking| booking.is_party(&user))
                .filter(|booking| status.is_none_or(|status| booking.status == status))
                .cloned()
                .collect();
            found.sort_by(|a, b| b.event_start.cmp(&a.event_start));
            Ok(found)
        })
    }

    fn append_message(&self, message: BookingMessage) -> BoxFuture<'_, Result<BookingMessage>> {
        Box::pin(async move {
            self.messages
                .write()
                .await
                .entry(message.booking_id)
                .or_default()
                .push(message.clone());
            Ok(message)
        })
    }

    fn messages(&self, booking_id: BookingId) -> BoxFuture<'_, Result<Vec<BookingMessage>>> {
        Box::pin(async move {
            Ok(self
                .messages
                .read()
                .await
                .get(&booking_id)
                .cloned()
                .unwrap_or_default())
        })
    }
}
