//! Vendor availability calendar.
//!
//! Vendors declare windows (available or not) per date. Every mutation takes
//! an explicit `actor`, who must resolve to a vendor and, for existing slots,
//! own the slot.

use crate::conflict::TimeWindow;
use crate::directory::{IdentityProvider, Party, Role};
use crate::error::{BookingError, FieldError, Result};
use crate::store::BookingStorage;
use crate::types::{AvailabilitySlot, Booking, SlotId, UserId};
use chrono::{Days, NaiveDate, NaiveTime};
use gigbook_core::environment::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Requested slot fields
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    /// Calendar date
    pub date: NaiveDate,
    /// Start time of day
    pub start_time: NaiveTime,
    /// End time of day; before `start_time` for an overnight window
    pub end_time: NaiveTime,
    /// `false` declares unavailability
    pub available: bool,
}

/// Which dates to list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateSelection {
    /// One date
    Single(NaiveDate),
    /// `from..=to`
    Range {
        /// First date
        from: NaiveDate,
        /// Last date, inclusive
        to: NaiveDate,
    },
}

/// One rejected item of a bulk add
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkFailure {
    /// Position in the submitted list
    pub index: usize,
    /// What was wrong with it
    pub errors: Vec<FieldError>,
}

/// Result of [`Calendar::bulk_add`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Slots stored, in submission order
    pub created: Vec<AvailabilitySlot>,
    /// Items rejected
    pub failed: Vec<BulkFailure>,
}

/// Read-only overlap diagnostic
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictReport {
    /// Anything overlaps
    pub has_conflicts: bool,
    /// The vendor's slots overlapping the window
    pub overlapping_slots: Vec<AvailabilitySlot>,
    /// Active bookings overlapping the window
    pub overlapping_bookings: Vec<Booking>,
}

/// Field checks for a slot.
///
/// # Errors
///
/// Returns every failing field.
pub fn validate_slot_spec(spec: &SlotSpec, today: NaiveDate) -> std::result::Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();
    if spec.end_time == spec.start_time {
        errors.push(FieldError::new("end_time", "must differ from start_time"));
    }
    if spec.date < today {
        errors.push(FieldError::new("date", "must not be in the past"));
    } else if TimeWindow::try_for_slot(spec.date, spec.start_time, spec.end_time).is_none() {
        errors.push(FieldError::new("date", "window runs past the last supported date"));
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Availability calendar operations
pub struct Calendar {
    storage: Arc<dyn BookingStorage>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
}

impl Calendar {
    /// Creates a new `Calendar`
    #[must_use]
    pub fn new(
        storage: Arc<dyn BookingStorage>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            identity,
            clock,
        }
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    async fn require_vendor(&self, actor: UserId, action: &'static str) -> Result<Party> {
        match self.identity.resolve(&actor).await? {
            Some(party) if party.role == Role::Vendor => Ok(party),
            _ => Err(BookingError::Unauthorized { actor, action }),
        }
    }

    async fn owned_slot(
        &self,
        actor: UserId,
        slot_id: SlotId,
        action: &'static str,
    ) -> Result<AvailabilitySlot> {
        let slot = self
            .storage
            .slot(slot_id)
            .await?
            .ok_or_else(|| BookingError::not_found("slot", slot_id))?;
        if slot.vendor_id != actor {
            return Err(BookingError::Unauthorized { actor, action });
        }
        Ok(slot)
    }

    /// Declare a window.
    ///
    /// # Errors
    ///
    /// `Unauthorized` unless `actor` is a vendor; `Validation` for an empty
    /// window or a past date.
    #[tracing::instrument(skip(self, spec), fields(date = %spec.date))]
    pub async fn add_slot(&self, actor: UserId, spec: SlotSpec) -> Result<AvailabilitySlot> {
        self.require_vendor(actor, "add_slot").await?;
        validate_slot_spec(&spec, self.today()).map_err(BookingError::Validation)?;

        let slot = AvailabilitySlot::new(
            actor,
            spec.date,
            spec.start_time,
            spec.end_time,
            spec.available,
        );
        let slot = self.storage.insert_slot(slot).await?;
        tracing::debug!(slot_id = %slot.id, "Slot added");
        Ok(slot)
    }

    /// Replace a slot's fields.
    ///
    /// # Errors
    ///
    /// As [`Calendar::add_slot`], plus `NotFound`, `Unauthorized` for a slot
    /// owned by someone else, and `Conflict` when an active booking would lose
    /// its coverage.
    #[tracing::instrument(skip(self, spec))]
    pub async fn update_slot(
        &self,
        actor: UserId,
        slot_id: SlotId,
        spec: SlotSpec,
    ) -> Result<AvailabilitySlot> {
        self.require_vendor(actor, "update_slot").await?;
        let existing = self.owned_slot(actor, slot_id, "update_slot").await?;
        validate_slot_spec(&spec, self.today()).map_err(BookingError::Validation)?;

        let updated = AvailabilitySlot {
            id: existing.id,
            vendor_id: existing.vendor_id,
            date: spec.date,
            start_time: spec.start_time,
            end_time: spec.end_time,
            available: spec.available,
        };
        self.storage.update_slot(updated).await
    }

    /// A vendor's slots for a date or inclusive date range, ordered by date
    /// then start time.
    ///
    /// # Errors
    ///
    /// `Validation` for a range ending before it starts.
    pub async fn list_slots(
        &self,
        vendor: UserId,
        selection: DateSelection,
    ) -> Result<Vec<AvailabilitySlot>> {
        let (from, to) = match selection {
            DateSelection::Single(date) => (date, date),
            DateSelection::Range { from, to } if from <= to => (from, to),
            DateSelection::Range { .. } => {
                return Err(BookingError::invalid("to", "must not be before from"));
            },
        };
        self.storage.slots_between(vendor, from, to).await
    }

    /// Remove a slot.
    ///
    /// # Errors
    ///
    /// `Conflict` while an active booking overlaps the slot.
    #[tracing::instrument(skip(self))]
    pub async fn delete_slot(&self, actor: UserId, slot_id: SlotId) -> Result<()> {
        self.require_vendor(actor, "delete_slot").await?;
        self.owned_slot(actor, slot_id, "delete_slot").await?;
        self.storage.delete_slot(actor, slot_id).await
    }

    /// Add many slots. Each item succeeds or fails on its own; nothing is
    /// rolled back.
    ///
    /// # Errors
    ///
    /// `Unauthorized` unless `actor` is a vendor. Per-item problems are
    /// reported in [`BulkOutcome::failed`].
    #[tracing::instrument(skip(self, specs), fields(count = specs.len()))]
    pub async fn bulk_add(&self, actor: UserId, specs: Vec<SlotSpec>) -> Result<BulkOutcome> {
        self.require_vendor(actor, "bulk_add").await?;
        let today = self.today();
        let mut outcome = BulkOutcome::default();

        for (index, spec) in specs.into_iter().enumerate() {
            if let Err(errors) = validate_slot_spec(&spec, today) {
                outcome.failed.push(BulkFailure { index, errors });
                continue;
            }

            let slot = AvailabilitySlot::new(
                actor,
                spec.date,
                spec.start_time,
                spec.end_time,
                spec.available,
            );
            match self.storage.insert_slot(slot).await {
                Ok(slot) => outcome.created.push(slot),
                Err(err) => outcome.failed.push(BulkFailure {
                    index,
                    errors: vec![FieldError::new("slot", err.to_string())],
                }),
            }
        }

        tracing::info!(
            created = outcome.created.len(),
            failed = outcome.failed.len(),
            "Bulk slot add finished"
        );
        Ok(outcome)
    }

    /// What a window on `date` would overlap: the vendor's other slots
    /// (including overnight slots from the previous day) and active bookings.
    ///
    /// # Errors
    ///
    /// `Validation` when `start == end` or the window runs past the last date.
    pub async fn check_conflicts(
        &self,
        vendor: UserId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        exclude_slot: Option<SlotId>,
    ) -> Result<ConflictReport> {
        if start == end {
            return Err(BookingError::invalid("end_time", "must differ from start_time"));
        }
        let window = TimeWindow::try_for_slot(date, start, end).ok_or_else(|| {
            BookingError::invalid("date", "window runs past the last supported date")
        })?;

        let from = date.checked_sub_days(Days::new(1)).unwrap_or(date);
        let to = date.checked_add_days(Days::new(1)).unwrap_or(date);
        let overlapping_slots: Vec<AvailabilitySlot> = self
            .storage
            .slots_between(vendor, from, to)
            .await?
            .into_iter()
            .filter(|slot| Some(slot.id) != exclude_slot && slot.window().overlaps(&window))
            .collect();

        let overlapping_bookings = self
            .storage
            .active_bookings_overlapping(vendor, window)
            .await?;

        Ok(ConflictReport {
            has_conflicts: !overlapping_slots.is_empty() || !overlapping_bookings.is_empty(),
            overlapping_slots,
            overlapping_bookings,
        })
    }
}
