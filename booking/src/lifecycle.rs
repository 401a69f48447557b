//! Booking lifecycle state machine.
//!
//! A single booking moves through [`BookingStatus`] according to an explicit
//! table ([`BookingStatus::next`]); each move names who may trigger it
//! ([`Transition::required_actor`]).
//!
//! [`LifecycleReducer`] is the only code that changes a booking's status.
//! Commands are validated (authorization, then the table, then the payload),
//! turned into events, applied to state, and each event yields at most one
//! notification effect. The reducer never touches storage: the orchestrator
//! persists the new state and only then runs the effects.

use crate::error::{BookingError, FieldError};
use crate::notify::{Notification, NotificationContext, NotificationDispatcher, NotificationKind};
use crate::types::{Booking, BookingStatus, Money, UserId};
use chrono::{DateTime, Utc};
use gigbook_core::{effect::Effect, environment::Clock, reducer::Reducer, smallvec, SmallVec};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Transition table
// ============================================================================

/// A status change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Vendor confirms a pending booking
    Accept,
    /// Vendor refuses a pending booking
    Decline,
    /// Vendor proposes revised terms
    CounterOffer,
    /// Customer agrees to the counter-offer
    AcceptCounter,
    /// Customer refuses the counter-offer
    DeclineCounter,
    /// Either party withdraws
    Cancel,
    /// The engagement happened
    Complete,
}

/// Who may trigger a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permitted {
    /// The booking's vendor
    Vendor,
    /// The booking's customer
    Customer,
    /// Customer or vendor
    EitherParty,
    /// An internal trigger, no user involved
    System,
}

impl Transition {
    /// Every transition
    pub const ALL: [Self; 7] = [
        Self::Accept,
        Self::Decline,
        Self::CounterOffer,
        Self::AcceptCounter,
        Self::DeclineCounter,
        Self::Cancel,
        Self::Complete,
    ];

    /// Name used in errors and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::CounterOffer => "counter_offer",
            Self::AcceptCounter => "accept_counter",
            Self::DeclineCounter => "decline_counter",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
        }
    }

    /// Who may trigger this transition
    #[must_use]
    pub const fn required_actor(self) -> Permitted {
        match self {
            Self::Accept | Self::Decline | Self::CounterOffer => Permitted::Vendor,
            Self::AcceptCounter | Self::DeclineCounter => Permitted::Customer,
            Self::Cancel => Permitted::EitherParty,
            Self::Complete => Permitted::System,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BookingStatus {
    /// The status `transition` leads to from here, `None` if not allowed.
    #[must_use]
    pub const fn next(self, transition: Transition) -> Option<Self> {
        use BookingStatus::{Accepted, Cancelled, Completed, CounterOffered, Declined, Pending};
        use Transition::{
            Accept, AcceptCounter, Cancel, Complete, CounterOffer, Decline, DeclineCounter,
        };

        match (self, transition) {
            (Pending, Accept) | (CounterOffered, AcceptCounter) => Some(Accepted),
            (Pending, Decline) | (CounterOffered, DeclineCounter) => Some(Declined),
            (Pending, CounterOffer) => Some(CounterOffered),
            (Pending | Accepted, Cancel) => Some(Cancelled),
            (Accepted, Complete) => Some(Completed),
            _ => None,
        }
    }
}

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Commands issued against a booking, and the events they produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BookingAction {
    // Commands
    /// Announce a freshly stored booking
    Submit,
    /// Vendor accepts
    Accept {
        /// Acting user
        actor: UserId,
    },
    /// Vendor declines
    Decline {
        /// Acting user
        actor: UserId,
    },
    /// Vendor proposes a revised amount
    CounterOffer {
        /// Acting user
        actor: UserId,
        /// Proposed price
        amount: Money,
        /// Explanation shown to the customer
        notes: String,
    },
    /// Customer accepts the counter-offer
    AcceptCounter {
        /// Acting user
        actor: UserId,
    },
    /// Customer declines the counter-offer
    DeclineCounter {
        /// Acting user
        actor: UserId,
    },
    /// Either party cancels
    Cancel {
        /// Acting user
        actor: UserId,
    },
    /// System marks the engagement done
    Complete,
    /// Scheduler asks for a reminder
    Remind,

    // Events
    /// Booking entered `pending`
    Submitted {
        /// When
        at: DateTime<Utc>,
    },
    /// Booking entered `accepted`
    Accepted {
        /// Who accepted
        by: UserId,
        /// When
        at: DateTime<Utc>,
    },
    /// Booking entered `declined`
    Declined {
        /// Who declined
        by: UserId,
        /// When
        at: DateTime<Utc>,
    },
    /// Booking entered `counter_offered`
    CounterOffered {
        /// Vendor
        by: UserId,
        /// Proposed price
        amount: Money,
        /// Vendor's explanation
        notes: String,
        /// When
        at: DateTime<Utc>,
    },
    /// Booking entered `cancelled`
    Cancelled {
        /// Who cancelled
        by: UserId,
        /// When
        at: DateTime<Utc>,
    },
    /// Booking entered `completed`
    Completed {
        /// When
        at: DateTime<Utc>,
    },
    /// A reminder went out
    Reminded {
        /// When
        at: DateTime<Utc>,
    },
    /// A command was refused
    TransitionRejected {
        /// Why
        error: BookingError,
    },
}

// ============================================================================
// State & Environment
// ============================================================================

/// One booking plus what the reducer needs to describe it.
#[derive(Clone, Debug, PartialEq)]
pub struct LifecycleState {
    /// The booking being driven
    pub booking: Booking,
    /// Names for notification payloads
    pub context: NotificationContext,
    /// Set when the last command was refused
    pub last_error: Option<BookingError>,
}

impl LifecycleState {
    /// State for `booking` with an empty notification context
    #[must_use]
    pub fn new(booking: Booking) -> Self {
        Self {
            booking,
            context: NotificationContext::default(),
            last_error: None,
        }
    }

    /// Attach resolved display names
    #[must_use]
    pub fn with_context(mut self, context: NotificationContext) -> Self {
        self.context = context;
        self
    }
}

/// Dependencies of the lifecycle reducer
#[derive(Clone)]
pub struct LifecycleEnvironment {
    /// Time source for event timestamps
    pub clock: Arc<dyn Clock>,
    /// Where notification effects go
    pub dispatcher: Arc<dyn NotificationDispatcher>,
}

impl LifecycleEnvironment {
    /// Creates a new `LifecycleEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self { clock, dispatcher }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Drives a single booking through its lifecycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct LifecycleReducer;

impl LifecycleReducer {
    /// Creates a new `LifecycleReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn authorize(booking: &Booking, actor: UserId, transition: Transition) -> Result<(), BookingError> {
        let allowed = match transition.required_actor() {
            Permitted::Vendor => actor == booking.vendor_id,
            Permitted::Customer => actor == booking.customer_id,
            Permitted::EitherParty => booking.is_party(&actor),
            Permitted::System => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(BookingError::Unauthorized {
                actor,
                action: transition.as_str(),
            })
        }
    }

    /// Authorization, then the table. `actor` is `None` only for system
    /// transitions.
    fn validate_transition(
        booking: &Booking,
        actor: Option<UserId>,
        transition: Transition,
    ) -> Result<(), BookingError> {
        if let Some(actor) = actor {
            Self::authorize(booking, actor, transition)?;
        }
        booking
            .status
            .next(transition)
            .map(|_| ())
            .ok_or(BookingError::InvalidTransition {
                from: booking.status,
                attempted: transition.as_str(),
            })
    }

    fn validate_counter_offer(amount: Money, notes: &str) -> Result<(), BookingError> {
        let mut errors = Vec::new();
        if amount.is_zero() {
            errors.push(FieldError::new("amount", "must be greater than zero"));
        }
        if notes.trim().is_empty() {
            errors.push(FieldError::new("vendor_notes", "must not be empty"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BookingError::Validation(errors))
        }
    }

    /// Apply an event to state
    fn apply_event(state: &mut LifecycleState, event: &BookingAction) {
        let booking = &mut state.booking;
        let (status, at) = match event {
            BookingAction::Submitted { at } => (BookingStatus::Pending, *at),
            BookingAction::Accepted { at, .. } => (BookingStatus::Accepted, *at),
            BookingAction::Declined { at, .. } => (BookingStatus::Declined, *at),
            BookingAction::CounterOffered {
                amount, notes, at, ..
            } => {
                booking.amount = *amount;
                booking.vendor_notes = Some(notes.clone());
                (BookingStatus::CounterOffered, *at)
            },
            BookingAction::Cancelled { at, .. } => (BookingStatus::Cancelled, *at),
            BookingAction::Completed { at } => (BookingStatus::Completed, *at),
            BookingAction::Reminded { .. } => {
                state.last_error = None;
                return;
            },
            BookingAction::TransitionRejected { error } => {
                state.last_error = Some(error.clone());
                return;
            },
            // Commands are not applied
            _ => return,
        };

        booking.status = status;
        booking.updated_at = at;
        state.last_error = None;
    }

    /// The notification an event announces, if any.
    fn notification_for(state: &LifecycleState, event: &BookingAction) -> Option<Notification> {
        let booking = &state.booking;
        let (kind, recipient, at) = match event {
            BookingAction::Submitted { at } => {
                (NotificationKind::BookingCreated, booking.vendor_id, *at)
            },
            BookingAction::Accepted { by, at } => {
                (NotificationKind::BookingApproved, booking.counterparty(by)?, *at)
            },
            BookingAction::Declined { by, at } => {
                (NotificationKind::BookingRejected, booking.counterparty(by)?, *at)
            },
            BookingAction::CounterOffered { at, .. } => {
                (NotificationKind::BookingCounterOffered, booking.customer_id, *at)
            },
            BookingAction::Cancelled { by, at } => {
                (NotificationKind::BookingCancelled, booking.counterparty(by)?, *at)
            },
            BookingAction::Reminded { at } => {
                (NotificationKind::BookingReminder, booking.customer_id, *at)
            },
            _ => return None,
        };

        let notification = Notification::about(kind, recipient, booking, &state.context, at);
        Some(match event {
            BookingAction::CounterOffered { amount, notes, .. } => notification
                .with_field("amount", amount.to_string())
                .with_field("vendor_notes", notes.as_str()),
            _ => notification,
        })
    }

    fn reject(state: &mut LifecycleState, error: BookingError) -> SmallVec<[Effect<BookingAction>; 4]> {
        tracing::debug!(booking_id = %state.booking.id, error = %error, "Command rejected");
        Self::apply_event(state, &BookingAction::TransitionRejected { error });
        SmallVec::new()
    }

    fn commit(
        state: &mut LifecycleState,
        event: &BookingAction,
        env: &LifecycleEnvironment,
    ) -> SmallVec<[Effect<BookingAction>; 4]> {
        Self::apply_event(state, event);

        match Self::notification_for(state, event) {
            Some(notification) => {
                let dispatcher = Arc::clone(&env.dispatcher);
                smallvec![Effect::future(async move {
                    dispatcher.dispatch(notification);
                    None
                })]
            },
            None => SmallVec::new(),
        }
    }

    fn transition(
        state: &mut LifecycleState,
        actor: Option<UserId>,
        transition: Transition,
        event: BookingAction,
        env: &LifecycleEnvironment,
    ) -> SmallVec<[Effect<BookingAction>; 4]> {
        if let Err(error) = Self::validate_transition(&state.booking, actor, transition) {
            return Self::reject(state, error);
        }
        Self::commit(state, &event, env)
    }
}

impl Reducer for LifecycleReducer {
    type State = LifecycleState;
    type Action = BookingAction;
    type Environment = LifecycleEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let at = env.clock.now();

        match action {
            BookingAction::Submit => {
                if state.booking.status != BookingStatus::Pending {
                    return Self::reject(
                        state,
                        BookingError::InvalidTransition {
                            from: state.booking.status,
                            attempted: "submit",
                        },
                    );
                }
                Self::commit(state, &BookingAction::Submitted { at }, env)
            },
            BookingAction::Accept { actor } => Self::transition(
                state,
                Some(actor),
                Transition::Accept,
                BookingAction::Accepted { by: actor, at },
                env,
            ),
            BookingAction::Decline { actor } => Self::transition(
                state,
                Some(actor),
                Transition::Decline,
                BookingAction::Declined { by: actor, at },
                env,
            ),
            BookingAction::CounterOffer {
                actor,
                amount,
                notes,
            } => {
                if let Err(error) =
                    Self::validate_transition(&state.booking, Some(actor), Transition::CounterOffer)
                        .and_then(|()| Self::validate_counter_offer(amount, &notes))
                {
                    return Self::reject(state, error);
                }
                let event = BookingAction::CounterOffered {
                    by: actor,
                    amount,
                    notes: notes.trim().to_string(),
                    at,
                };
                Self::commit(state, &event, env)
            },
            BookingAction::AcceptCounter { actor } => Self::transition(
                state,
                Some(actor),
                Transition::AcceptCounter,
                BookingAction::Accepted { by: actor, at },
                env,
            ),
            BookingAction::DeclineCounter { actor } => Self::transition(
                state,
                Some(actor),
                Transition::DeclineCounter,
                BookingAction::Declined { by: actor, at },
                env,
            ),
            BookingAction::Cancel { actor } => Self::transition(
                state,
                Some(actor),
                Transition::Cancel,
                BookingAction::Cancelled { by: actor, at },
                env,
            ),
            BookingAction::Complete => Self::transition(
                state,
                None,
                Transition::Complete,
                BookingAction::Completed { at },
                env,
            ),
            BookingAction::Remind => {
                if state.booking.status != BookingStatus::Accepted {
                    return Self::reject(
                        state,
                        BookingError::InvalidTransition {
                            from: state.booking.status,
                            attempted: "remind",
                        },
                    );
                }
                Self::commit(state, &BookingAction::Reminded { at }, env)
            },

            // Events replayed directly are applied without side effects
            event @ (BookingAction::Submitted { .. }
            | BookingAction::Accepted { .. }
            | BookingAction::Declined { .. }
            | BookingAction::CounterOffered { .. }
            | BookingAction::Cancelled { .. }
            | BookingAction::Completed { .. }
            | BookingAction::Reminded { .. }
            | BookingAction::TransitionRejected { .. }) => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}
