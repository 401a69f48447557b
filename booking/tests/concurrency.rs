//! Concurrency tests for booking creation and status changes.
//!
//! Many customers race for the same vendor window; the calendar must grant
//! exactly one. Run with: `cargo test --test concurrency`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use gigbook::{
    BookingError, BookingOrchestrator, BookingRequest, BookingStatus, Calendar, ErrorKind,
    InMemoryStorage, LifecycleEnvironment, Money, Party, Response, Role, ServiceId,
    ServiceListing, SlotSpec, UserId,
    config::PolicyConfig,
    directory::{StaticCatalog, StaticDirectory},
    notify::worker::QueuedDispatcher,
};
use gigbook_testing::test_clock;
use std::sync::Arc;

const RACERS: usize = 20;

fn at(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 2, 1)
        .unwrap()
        .and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap())
}

struct Setup {
    orchestrator: Arc<BookingOrchestrator>,
    vendor: UserId,
    customers: Vec<UserId>,
    service_id: ServiceId,
}

async fn setup() -> Setup {
    let clock = Arc::new(test_clock());
    let storage = Arc::new(InMemoryStorage::new());
    let directory = Arc::new(StaticDirectory::new());
    let catalog = Arc::new(StaticCatalog::new());
    let (dispatcher, _rx) = QueuedDispatcher::unbounded();

    let vendor = UserId::new();
    directory.insert(Party::new(vendor, Role::Vendor, "DJ Night Owl"));
    let customers: Vec<UserId> = (0..RACERS)
        .map(|i| {
            let id = UserId::new();
            directory.insert(Party::new(id, Role::Customer, format!("Customer {i}")));
            id
        })
        .collect();

    let service_id = ServiceId::new();
    catalog.insert(ServiceListing {
        id: service_id,
        vendor_id: vendor,
        name: "DJ set".to_string(),
        base_price: Money::from_cents(60_000),
    });

    Calendar::new(storage.clone(), directory.clone(), clock.clone())
        .add_slot(
            vendor,
            SlotSpec {
                date: at(0).date(),
                start_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
                available: true,
            },
        )
        .await
        .expect("overnight slot");

    let orchestrator = Arc::new(BookingOrchestrator::new(
        storage,
        directory,
        catalog,
        LifecycleEnvironment::new(clock, Arc::new(dispatcher)),
        PolicyConfig::default(),
    ));

    Setup {
        orchestrator,
        vendor,
        customers,
        service_id,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_overlapping_create_wins() {
    let s = setup().await;

    let handles: Vec<_> = s
        .customers
        .iter()
        .enumerate()
        .map(|(i, &customer)| {
            let orchestrator = Arc::clone(&s.orchestrator);
            // Staggered starts, every pair overlaps
            let request = BookingRequest {
                service_id: s.service_id,
                event_start: at(20) + chrono::Duration::minutes(i64::try_from(i).unwrap()),
                event_end: Some(at(22)),
                location: "Warehouse 9".to_string(),
                amount: None,
                requirements: None,
            };
            tokio::spawn(async move { orchestrator.create(customer, request).await })
        })
        .collect();

    let mut granted = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => granted += 1,
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::Conflict, "{err:?}");
                refused += 1;
            },
        }
    }

    assert_eq!(granted, 1);
    assert_eq!(refused, RACERS - 1);

    let active = s
        .orchestrator
        .list_for_party(s.vendor, Some(BookingStatus::Pending))
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_creates_all_win() {
    let s = setup().await;

    // One hour each from 12:00; the last ends at midnight, inside the
    // overnight slot
    let handles: Vec<_> = s
        .customers
        .iter()
        .take(12)
        .enumerate()
        .map(|(i, &customer)| {
            let orchestrator = Arc::clone(&s.orchestrator);
            let start = at(12) + chrono::Duration::hours(i64::try_from(i).unwrap());
            let request = BookingRequest {
                service_id: s.service_id,
                event_start: start,
                event_end: Some(start + chrono::Duration::hours(1)),
                location: "Warehouse 9".to_string(),
                amount: None,
                requirements: None,
            };
            tokio::spawn(async move { orchestrator.create(customer, request).await })
        })
        .collect();

    for handle in handles {
        let result = handle.await.expect("task panicked");
        assert!(result.is_ok(), "{result:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_responses_cannot_both_win() {
    let s = setup().await;
    let booking = s
        .orchestrator
        .create(
            s.customers[0],
            BookingRequest {
                service_id: s.service_id,
                event_start: at(18),
                event_end: Some(at(20)),
                location: "Warehouse 9".to_string(),
                amount: None,
                requirements: None,
            },
        )
        .await
        .unwrap();

    let accept = {
        let orchestrator = Arc::clone(&s.orchestrator);
        let vendor = s.vendor;
        tokio::spawn(async move { orchestrator.respond(booking.id, vendor, Response::Accept).await })
    };
    let decline = {
        let orchestrator = Arc::clone(&s.orchestrator);
        let vendor = s.vendor;
        tokio::spawn(async move { orchestrator.respond(booking.id, vendor, Response::Decline).await })
    };

    let results = [accept.await.unwrap(), decline.await.unwrap()];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "{results:?}");

    for result in &results {
        if let Err(err) = result {
            assert!(
                matches!(
                    err,
                    BookingError::ConcurrentModification { .. }
                        | BookingError::InvalidTransition { .. }
                ),
                "{err:?}"
            );
        }
    }
}
