//! End-to-end booking flows against in-memory storage.
//!
//! Covers calendar mutual exclusion, the cancellation cutoff, authorization,
//! counter-offers, lifecycle closure, message threads and notification
//! delivery to a deleted recipient.
//!
//! Run with: `cargo test --test booking_flow`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use gigbook::{
    BookingError, BookingOrchestrator, BookingRequest, BookingStatus, Calendar, CounterResponse,
    ErrorKind, InMemoryStorage, LifecycleEnvironment, MessageThread, Money, Notification,
    NotificationKind, Party, Response, Role, ServiceId, ServiceListing, SlotSpec, UserId,
    config::PolicyConfig,
    directory::{StaticCatalog, StaticDirectory},
    notify::{
        dead_letter::DeadLetterQueue,
        retry::{RetryPolicy, RetryPolicyTable},
        worker::{DeliveryOutcome, DeliveryWorker, LoggingChannel, QueuedDispatcher},
    },
};
use gigbook_core::environment::Clock;
use gigbook_testing::{ManualClock, init_test_tracing, test_clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::{assert_err, assert_ok};

fn event_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
}

fn at(hour: u32) -> NaiveDateTime {
    event_day().and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap())
}

struct Harness {
    clock: Arc<ManualClock>,
    directory: Arc<StaticDirectory>,
    calendar: Calendar,
    orchestrator: BookingOrchestrator,
    thread: MessageThread,
    rx: UnboundedReceiver<Notification>,
    vendor: UserId,
    customer: UserId,
    other_customer: UserId,
    service_id: ServiceId,
}

impl Harness {
    /// Vendor available 09:00-23:00 on the event day, clock at 2025-01-01.
    async fn new() -> Self {
        init_test_tracing();

        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let storage = Arc::new(InMemoryStorage::new());
        let directory = Arc::new(StaticDirectory::new());
        let catalog = Arc::new(StaticCatalog::new());
        let (dispatcher, rx) = QueuedDispatcher::unbounded();
        let dispatcher = Arc::new(dispatcher);

        let vendor = UserId::new();
        let customer = UserId::new();
        let other_customer = UserId::new();
        directory.insert(Party::new(vendor, Role::Vendor, "Lens & Light"));
        directory.insert(Party::new(customer, Role::Customer, "Alice"));
        directory.insert(Party::new(other_customer, Role::Customer, "Bob"));

        let service_id = ServiceId::new();
        catalog.insert(ServiceListing {
            id: service_id,
            vendor_id: vendor,
            name: "Wedding photography".to_string(),
            base_price: Money::from_cents(150_000),
        });

        let calendar = Calendar::new(storage.clone(), directory.clone(), clock.clone());
        let orchestrator = BookingOrchestrator::new(
            storage.clone(),
            directory.clone(),
            catalog.clone(),
            LifecycleEnvironment::new(clock.clone(), dispatcher.clone()),
            PolicyConfig::default(),
        );
        let thread = MessageThread::new(
            storage,
            directory.clone(),
            catalog,
            dispatcher,
            clock.clone(),
            PolicyConfig::default().message_max_chars,
        );

        calendar
            .add_slot(
                vendor,
                SlotSpec {
                    date: event_day(),
                    start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    end_time: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
                    available: true,
                },
            )
            .await
            .expect("vendor slot");

        Self {
            clock,
            directory,
            calendar,
            orchestrator,
            thread,
            rx,
            vendor,
            customer,
            other_customer,
            service_id,
        }
    }

    fn request(&self, start: u32, end: u32) -> BookingRequest {
        BookingRequest {
            service_id: self.service_id,
            event_start: at(start),
            event_end: Some(at(end)),
            location: "Harbor Hall".to_string(),
            amount: None,
            requirements: None,
        }
    }

    fn notifications(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }
}

#[tokio::test]
async fn overlapping_request_is_refused_touching_one_is_not() {
    let mut h = Harness::new().await;

    let a = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);
    assert_eq!(a.status, BookingStatus::Pending);
    assert_eq!(a.amount, Money::from_cents(150_000));

    let err = assert_err!(h.orchestrator.create(h.other_customer, h.request(19, 21)).await);
    assert!(
        matches!(&err, BookingError::Conflict(detail) if detail.booking_ids == vec![a.id]),
        "{err:?}"
    );

    assert_ok!(h.orchestrator.create(h.other_customer, h.request(20, 22)).await);

    let created: Vec<_> = h
        .notifications()
        .into_iter()
        .map(|n| (n.kind, n.recipient))
        .collect();
    assert_eq!(
        created,
        vec![
            (NotificationKind::BookingCreated, h.vendor),
            (NotificationKind::BookingCreated, h.vendor),
        ]
    );
}

#[tokio::test]
async fn declined_booking_frees_its_window() {
    let h = Harness::new().await;

    let a = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);
    assert_ok!(h.orchestrator.respond(a.id, h.vendor, Response::Decline).await);

    assert_ok!(h.orchestrator.create(h.other_customer, h.request(18, 20)).await);
}

#[tokio::test]
async fn request_outside_availability_is_uncovered() {
    let h = Harness::new().await;

    let err = assert_err!(h.orchestrator.create(h.customer, h.request(7, 8)).await);
    assert!(
        matches!(&err, BookingError::Conflict(detail) if detail.uncovered),
        "{err:?}"
    );
}

#[tokio::test]
async fn missing_end_uses_default_duration() {
    let h = Harness::new().await;

    let mut request = h.request(18, 20);
    request.event_end = None;
    assert_ok!(h.orchestrator.create(h.customer, request).await);

    // 18:00 + 2h blocks 19:00 but not 20:00
    assert_err!(h.orchestrator.create(h.other_customer, h.request(19, 21)).await);
    assert_ok!(h.orchestrator.create(h.other_customer, h.request(20, 21)).await);
}

#[tokio::test]
async fn invalid_request_reports_fields() {
    let h = Harness::new().await;

    let mut request = h.request(18, 20);
    request.location = " ".to_string();
    request.amount = Some(Money::from_cents(0));

    let err = assert_err!(h.orchestrator.create(h.customer, request).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    let fields: Vec<_> = err.field_errors().iter().map(|e| e.field.clone()).collect();
    assert_eq!(fields, vec!["location", "amount"]);
}

#[tokio::test]
async fn cancellation_cutoff() {
    let h = Harness::new().await;
    let booking = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);

    // 23 hours before the event
    h.clock.set(Utc.with_ymd_and_hms(2025, 1, 9, 19, 0, 0).unwrap());
    let err = assert_err!(h.orchestrator.cancel(booking.id, h.customer).await);
    assert_eq!(err, BookingError::CancellationWindowClosed { cutoff_hours: 24 });
    assert_eq!(err.kind(), ErrorKind::BusinessRule);

    // 25 hours before the event
    h.clock.set(Utc.with_ymd_and_hms(2025, 1, 9, 17, 0, 0).unwrap());
    let cancelled = assert_ok!(h.orchestrator.cancel(booking.id, h.customer).await);
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn closed_booking_near_its_date_reports_the_status() {
    let h = Harness::new().await;
    let booking = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);
    assert_ok!(h.orchestrator.respond(booking.id, h.vendor, Response::Decline).await);

    // Inside the cutoff, but the booking cannot be cancelled anyway
    h.clock.set(Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap());
    let err = assert_err!(h.orchestrator.cancel(booking.id, h.customer).await);
    assert_eq!(
        err,
        BookingError::InvalidTransition {
            from: BookingStatus::Declined,
            attempted: "cancel",
        }
    );
}

#[tokio::test]
async fn overnight_unavailability_blocks_the_next_morning() {
    let h = Harness::new().await;
    let eve = event_day().pred_opt().unwrap();
    let away = assert_ok!(
        h.calendar
            .add_slot(
                h.vendor,
                SlotSpec {
                    date: eve,
                    start_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                    end_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                    available: false,
                },
            )
            .await
    );
    assert_ok!(
        h.calendar
            .add_slot(
                h.vendor,
                SlotSpec {
                    date: event_day(),
                    start_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                    end_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    available: true,
                },
            )
            .await
    );

    let report = assert_ok!(
        h.calendar
            .check_conflicts(
                h.vendor,
                event_day(),
                NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
                None,
            )
            .await
    );
    assert!(report.overlapping_slots.contains(&away));

    let err = assert_err!(h.orchestrator.create(h.customer, h.request(1, 3)).await);
    assert!(
        matches!(&err, BookingError::Conflict(detail) if detail.slot_ids == vec![away.id]),
        "{err:?}"
    );
    assert_ok!(h.orchestrator.create(h.customer, h.request(6, 8)).await);
}

#[tokio::test]
async fn request_at_the_end_of_time_is_invalid() {
    let h = Harness::new().await;

    let mut request = h.request(18, 20);
    request.event_start = NaiveDate::MAX.and_hms_opt(22, 0, 0).unwrap();
    request.event_end = None;

    let err = assert_err!(h.orchestrator.create(h.customer, request).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    let fields: Vec<_> = err.field_errors().iter().map(|e| e.field.clone()).collect();
    assert_eq!(fields, vec!["event_start"]);
}

#[tokio::test]
async fn only_the_right_party_may_act() {
    let h = Harness::new().await;

    let err = assert_err!(h.orchestrator.create(h.vendor, h.request(18, 20)).await);
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let booking = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);

    let err = assert_err!(h.orchestrator.respond(booking.id, h.customer, Response::Accept).await);
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = assert_err!(h.orchestrator.cancel(booking.id, h.other_customer).await);
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = assert_err!(h.orchestrator.get(booking.id, h.other_customer).await);
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let stored = assert_ok!(h.orchestrator.get(booking.id, h.vendor).await);
    assert_eq!(stored.status, BookingStatus::Pending);
}

#[tokio::test]
async fn counter_offer_round_trip() {
    let mut h = Harness::new().await;
    let booking = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);

    let countered = assert_ok!(
        h.orchestrator
            .respond(
                booking.id,
                h.vendor,
                Response::CounterOffer {
                    amount: Money::from_cents(175_000),
                    notes: "Second shooter required for this venue".to_string(),
                },
            )
            .await
    );
    assert_eq!(countered.status, BookingStatus::CounterOffered);
    assert!(!countered.status.is_active());

    let err = assert_err!(
        h.orchestrator
            .respond_to_counter(booking.id, h.vendor, CounterResponse::Accept)
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let accepted = assert_ok!(
        h.orchestrator
            .respond_to_counter(booking.id, h.customer, CounterResponse::Accept)
            .await
    );
    assert_eq!(accepted.status, BookingStatus::Accepted);
    assert_eq!(accepted.amount, Money::from_cents(175_000));

    let kinds: Vec<_> = h
        .notifications()
        .into_iter()
        .map(|n| (n.kind, n.recipient))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (NotificationKind::BookingCreated, h.vendor),
            (NotificationKind::BookingCounterOffered, h.customer),
            (NotificationKind::BookingApproved, h.vendor),
        ]
    );
}

#[tokio::test]
async fn accepting_a_counter_offer_rechecks_the_calendar() {
    let h = Harness::new().await;
    let first = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);
    assert_ok!(
        h.orchestrator
            .respond(
                first.id,
                h.vendor,
                Response::CounterOffer {
                    amount: Money::from_cents(160_000),
                    notes: "Evening rate".to_string(),
                },
            )
            .await
    );

    // The window is free while the counter-offer is open
    let second = assert_ok!(h.orchestrator.create(h.other_customer, h.request(18, 20)).await);
    assert_ok!(h.orchestrator.respond(second.id, h.vendor, Response::Accept).await);

    let err = assert_err!(
        h.orchestrator
            .respond_to_counter(first.id, h.customer, CounterResponse::Accept)
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn terminal_bookings_stay_closed() {
    let h = Harness::new().await;
    let booking = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);
    assert_ok!(h.orchestrator.respond(booking.id, h.vendor, Response::Decline).await);

    let err = assert_err!(h.orchestrator.respond(booking.id, h.vendor, Response::Accept).await);
    assert_eq!(
        err,
        BookingError::InvalidTransition {
            from: BookingStatus::Declined,
            attempted: "accept",
        }
    );
    assert_err!(h.orchestrator.complete(booking.id).await);
    assert_err!(h.orchestrator.cancel(booking.id, h.customer).await);
}

#[tokio::test]
async fn reminder_and_completion() {
    let mut h = Harness::new().await;
    let booking = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);

    let err = assert_err!(h.orchestrator.remind(booking.id).await);
    assert_eq!(err.kind(), ErrorKind::State);

    assert_ok!(h.orchestrator.respond(booking.id, h.vendor, Response::Accept).await);
    assert_ok!(h.orchestrator.remind(booking.id).await);
    let done = assert_ok!(h.orchestrator.complete(booking.id).await);
    assert_eq!(done.status, BookingStatus::Completed);

    let kinds: Vec<_> = h.notifications().into_iter().map(|n| n.kind).collect();
    assert_eq!(
        kinds,
        vec![
            NotificationKind::BookingCreated,
            NotificationKind::BookingApproved,
            NotificationKind::BookingReminder,
        ]
    );
}

#[tokio::test]
async fn listing_is_per_party_latest_first() {
    let h = Harness::new().await;
    let early = assert_ok!(h.orchestrator.create(h.customer, h.request(10, 12)).await);
    let late = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);
    assert_ok!(h.orchestrator.create(h.other_customer, h.request(14, 16)).await);

    let mine: Vec<_> = assert_ok!(h.orchestrator.list_for_party(h.customer, None).await)
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(mine, vec![late.id, early.id]);

    let vendor_pending = assert_ok!(
        h.orchestrator
            .list_for_party(h.vendor, Some(BookingStatus::Pending))
            .await
    );
    assert_eq!(vendor_pending.len(), 3);
}

#[tokio::test]
async fn slot_protecting_a_booking_cannot_be_deleted() {
    let h = Harness::new().await;
    let booking = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);

    let slots = assert_ok!(
        h.calendar
            .list_slots(h.vendor, gigbook::DateSelection::Single(event_day()))
            .await
    );
    let slot_id = slots[0].id;

    let err = assert_err!(h.calendar.delete_slot(h.vendor, slot_id).await);
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.clock.set(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap());
    assert_ok!(h.orchestrator.cancel(booking.id, h.customer).await);
    assert_ok!(h.calendar.delete_slot(h.vendor, slot_id).await);
}

#[tokio::test]
async fn outsiders_cannot_use_the_thread() {
    let mut h = Harness::new().await;
    let booking = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);
    h.notifications();

    let err = assert_err!(
        h.thread
            .post(booking.id, h.other_customer, "hello?".to_string(), None)
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert!(h.notifications().is_empty());

    assert_ok!(
        h.thread
            .post(booking.id, h.vendor, "Looking forward to it".to_string(), None)
            .await
    );
    let sent = h.notifications();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::NewMessage);
    assert_eq!(sent[0].recipient, h.customer);
}

#[tokio::test]
async fn deleted_recipient_is_discarded_without_failing_create() {
    let mut h = Harness::new().await;
    h.directory.remove(&h.vendor);

    let booking = assert_ok!(h.orchestrator.create(h.customer, h.request(18, 20)).await);
    assert_eq!(booking.status, BookingStatus::Pending);

    let notification = h.notifications().pop().expect("booking_created queued");
    assert_eq!(notification.recipient, h.vendor);

    let policy = RetryPolicy::builder()
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(2))
        .build();
    let worker = DeliveryWorker::new(
        h.directory.clone(),
        Arc::new(LoggingChannel),
        RetryPolicyTable::uniform(&policy),
        DeadLetterQueue::new(10),
    );

    let outcome = worker.deliver(&notification).await;
    assert!(matches!(outcome, DeliveryOutcome::Discarded { .. }), "{outcome:?}");
    assert!(worker.dead_letters().is_empty());
}
