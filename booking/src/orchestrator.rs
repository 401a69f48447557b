//! Booking orchestrator.
//!
//! The public entry point for everything a customer, a vendor or the
//! scheduler does to a booking. Each call follows the same shape:
//!
//! 1. load the booking and check who is asking
//! 2. run the command through [`LifecycleReducer`]
//! 3. persist the new state with a compare-and-set on the previous status
//! 4. run the reducer's notification effects
//!
//! Effects run only after the write succeeded, and they only enqueue, so a
//! notification problem never fails the caller.

use crate::config::PolicyConfig;
use crate::directory::{IdentityProvider, Role, ServiceCatalog};
use crate::error::{BookingError, FieldError, Result};
use crate::conflict::TimeWindow;
use crate::lifecycle::{
    BookingAction, LifecycleEnvironment, LifecycleReducer, LifecycleState, Transition,
};
use crate::metrics;
use crate::notify::NotificationContext;
use crate::store::BookingStorage;
use crate::types::{Booking, BookingId, BookingStatus, Money, ServiceId, UserId};
use chrono::{NaiveDateTime, TimeDelta};
use gigbook_core::effect::run_all;
use gigbook_core::reducer::Reducer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a customer asks for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    /// Service to book
    pub service_id: ServiceId,
    /// Engagement start
    pub event_start: NaiveDateTime,
    /// Engagement end; the default duration applies when absent
    pub event_end: Option<NaiveDateTime>,
    /// Venue
    pub location: String,
    /// Offered price; the service's base price when absent
    pub amount: Option<Money>,
    /// Free-form requirements
    pub requirements: Option<String>,
}

/// Vendor's answer to a pending booking
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Confirm
    Accept,
    /// Refuse
    Decline,
    /// Propose different terms
    CounterOffer {
        /// Revised price
        amount: Money,
        /// Explanation for the customer
        notes: String,
    },
}

/// Customer's answer to a counter-offer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterResponse {
    /// Take the revised terms
    Accept,
    /// Walk away
    Decline,
}

/// Field checks for a new booking, run against the resolved amount.
///
/// # Errors
///
/// Returns every failing field.
pub fn validate_request(
    request: &BookingRequest,
    amount: Money,
    now: NaiveDateTime,
) -> std::result::Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    if request.location.trim().is_empty() {
        errors.push(FieldError::new("location", "must not be empty"));
    }
    if request.event_start <= now {
        errors.push(FieldError::new("event_start", "must be in the future"));
    } else if TimeWindow::try_for_event(request.event_start, request.event_end).is_none() {
        errors.push(FieldError::new("event_start", "leaves no room for the event"));
    }
    if request.event_end.is_some_and(|end| end <= request.event_start) {
        errors.push(FieldError::new("event_end", "must be after event_start"));
    }
    if amount.is_zero() {
        errors.push(FieldError::new("amount", "must be greater than zero"));
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Whether `booking` may still be cancelled at `now`.
///
/// The status is checked before the cutoff, so a booking that can no longer
/// be cancelled at all reports `InvalidTransition`. A cutoff too large to
/// represent closes the window.
///
/// # Errors
///
/// `InvalidTransition` or `CancellationWindowClosed`.
pub fn check_cancellable(booking: &Booking, now: NaiveDateTime, cutoff_hours: i64) -> Result<()> {
    if booking.status.next(Transition::Cancel).is_none() {
        return Err(BookingError::InvalidTransition {
            from: booking.status,
            attempted: Transition::Cancel.as_str(),
        });
    }

    let cutoff = TimeDelta::try_hours(cutoff_hours).unwrap_or(TimeDelta::MAX);
    if booking.event_start.signed_duration_since(now) <= cutoff {
        return Err(BookingError::CancellationWindowClosed { cutoff_hours });
    }
    Ok(())
}

/// Coordinates the calendar, the lifecycle reducer and notifications.
pub struct BookingOrchestrator {
    storage: Arc<dyn BookingStorage>,
    identity: Arc<dyn IdentityProvider>,
    catalog: Arc<dyn ServiceCatalog>,
    reducer: LifecycleReducer,
    env: LifecycleEnvironment,
    policy: PolicyConfig,
}

impl BookingOrchestrator {
    /// Creates a new `BookingOrchestrator`
    #[must_use]
    pub fn new(
        storage: Arc<dyn BookingStorage>,
        identity: Arc<dyn IdentityProvider>,
        catalog: Arc<dyn ServiceCatalog>,
        env: LifecycleEnvironment,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            storage,
            identity,
            catalog,
            reducer: LifecycleReducer::new(),
            env,
            policy,
        }
    }

    fn now(&self) -> NaiveDateTime {
        self.env.clock.now().naive_utc()
    }

    async fn load(&self, booking_id: BookingId) -> Result<Booking> {
        self.storage
            .booking(booking_id)
            .await?
            .ok_or_else(|| BookingError::not_found("booking", booking_id))
    }

    fn require_party(booking: &Booking, actor: UserId, action: &'static str) -> Result<()> {
        if booking.is_party(&actor) {
            Ok(())
        } else {
            Err(BookingError::Unauthorized { actor, action })
        }
    }

    async fn state_for(&self, booking: Booking) -> LifecycleState {
        let context =
            NotificationContext::resolve(&booking, self.identity.as_ref(), self.catalog.as_ref())
                .await;
        LifecycleState::new(booking).with_context(context)
    }

    /// Run `action` against `booking`, persist the outcome, then run effects.
    async fn drive(&self, booking: Booking, action: BookingAction) -> Result<Booking> {
        let expected = booking.status;
        let mut state = self.state_for(booking.clone()).await;

        let effects = self.reducer.reduce(&mut state, action, &self.env);
        if let Some(error) = state.last_error.take() {
            return Err(error);
        }

        let booking = if state.booking == booking {
            state.booking
        } else {
            let status = state.booking.status;
            let stored = match self.storage.update_booking(state.booking, expected).await {
                Err(err @ BookingError::Conflict(_)) => {
                    metrics::record_booking_conflict();
                    return Err(err);
                },
                other => other?,
            };
            metrics::record_booking_status(status);
            tracing::info!(booking_id = %stored.id, from = %expected, to = %status, "Booking updated");
            stored
        };

        run_all(effects).await;
        Ok(booking)
    }

    /// Request a booking.
    ///
    /// # Errors
    ///
    /// `Unauthorized` unless `actor` is a customer, `NotFound` for an unknown
    /// service, `Validation` for bad fields, `Conflict` when the vendor's
    /// calendar cannot take it.
    #[tracing::instrument(skip(self, request), fields(service_id = %request.service_id))]
    pub async fn create(&self, actor: UserId, request: BookingRequest) -> Result<Booking> {
        match self.identity.resolve(&actor).await? {
            Some(party) if party.role == Role::Customer => {},
            _ => {
                return Err(BookingError::Unauthorized {
                    actor,
                    action: "create_booking",
                });
            },
        }

        let listing = self
            .catalog
            .lookup(&request.service_id)
            .await?
            .ok_or_else(|| BookingError::not_found("service", request.service_id))?;

        let amount = request.amount.unwrap_or(listing.base_price);
        validate_request(&request, amount, self.now()).map_err(BookingError::Validation)?;

        let now = self.env.clock.now();
        let booking = Booking {
            id: BookingId::new(),
            customer_id: actor,
            vendor_id: listing.vendor_id,
            service_id: listing.id,
            event_start: request.event_start,
            event_end: request.event_end,
            location: request.location.trim().to_string(),
            amount,
            status: BookingStatus::Pending,
            requirements: request.requirements,
            vendor_notes: None,
            created_at: now,
            updated_at: now,
        };

        let booking = match self.storage.insert_booking(booking).await {
            Err(err @ BookingError::Conflict(_)) => {
                metrics::record_booking_conflict();
                tracing::info!(vendor_id = %listing.vendor_id, error = %err, "Booking refused");
                return Err(err);
            },
            other => other?,
        };
        metrics::record_booking_status(BookingStatus::Pending);
        tracing::info!(booking_id = %booking.id, vendor_id = %booking.vendor_id, "Booking created");

        let mut state = self.state_for(booking).await;
        let effects = self.reducer.reduce(&mut state, BookingAction::Submit, &self.env);
        if let Some(error) = state.last_error.take() {
            return Err(error);
        }
        run_all(effects).await;

        Ok(state.booking)
    }

    /// Vendor answers a pending booking.
    ///
    /// # Errors
    ///
    /// `Unauthorized` unless `actor` is the booking's vendor, `InvalidTransition`
    /// unless the booking is pending, `Validation` for a bad counter-offer.
    #[tracing::instrument(skip(self, response))]
    pub async fn respond(
        &self,
        booking_id: BookingId,
        actor: UserId,
        response: Response,
    ) -> Result<Booking> {
        let booking = self.load(booking_id).await?;
        let action = match response {
            Response::Accept => BookingAction::Accept { actor },
            Response::Decline => BookingAction::Decline { actor },
            Response::CounterOffer { amount, notes } => BookingAction::CounterOffer {
                actor,
                amount,
                notes,
            },
        };
        self.drive(booking, action).await
    }

    /// Customer answers a counter-offer.
    ///
    /// # Errors
    ///
    /// `Unauthorized` unless `actor` is the booking's customer,
    /// `InvalidTransition` unless a counter-offer is open, `Conflict` when
    /// accepting and the window has been taken meanwhile.
    #[tracing::instrument(skip(self))]
    pub async fn respond_to_counter(
        &self,
        booking_id: BookingId,
        actor: UserId,
        response: CounterResponse,
    ) -> Result<Booking> {
        let booking = self.load(booking_id).await?;
        let action = match response {
            CounterResponse::Accept => BookingAction::AcceptCounter { actor },
            CounterResponse::Decline => BookingAction::DeclineCounter { actor },
        };
        self.drive(booking, action).await
    }

    /// Either party withdraws.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for a non-party, `InvalidTransition` from a status that
    /// cannot be cancelled, `CancellationWindowClosed` when the event is not
    /// more than the configured cutoff away.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, booking_id: BookingId, actor: UserId) -> Result<Booking> {
        let booking = self.load(booking_id).await?;
        Self::require_party(&booking, actor, "cancel")?;

        check_cancellable(&booking, self.now(), self.policy.cancellation_cutoff_hours)?;

        self.drive(booking, BookingAction::Cancel { actor }).await
    }

    /// Mark an accepted booking as done. System trigger.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the booking is accepted.
    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, booking_id: BookingId) -> Result<Booking> {
        let booking = self.load(booking_id).await?;
        self.drive(booking, BookingAction::Complete).await
    }

    /// Send the customer a reminder. Called by an external scheduler.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the booking is accepted.
    #[tracing::instrument(skip(self))]
    pub async fn remind(&self, booking_id: BookingId) -> Result<Booking> {
        let booking = self.load(booking_id).await?;
        self.drive(booking, BookingAction::Remind).await
    }

    /// One booking, visible to its parties only.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Unauthorized`.
    pub async fn get(&self, booking_id: BookingId, actor: UserId) -> Result<Booking> {
        let booking = self.load(booking_id).await?;
        Self::require_party(&booking, actor, "view_booking")?;
        Ok(booking)
    }

    /// Bookings where `actor` is a party, latest event first.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub async fn list_for_party(
        &self,
        actor: UserId,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>> {
        self.storage.bookings_for_party(actor, status).await
    }
}
