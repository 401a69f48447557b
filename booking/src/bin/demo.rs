//! Gigbook Demo
//!
//! Walks one vendor and two customers through a short scenario:
//! - A vendor publishes availability for next week
//! - Two customers race for the same evening; one is refused
//! - The vendor counter-offers and the customer accepts
//! - The parties exchange messages, then the customer cancels
//!
//! # Usage
//!
//! ```bash
//! # In-memory storage
//! cargo run --bin demo
//!
//! # PostgreSQL storage
//! GIGBOOK_STORAGE=postgres DATABASE_URL=postgres://... cargo run --bin demo
//! ```

use chrono::{Days, NaiveTime};
use gigbook::{
    BookingOrchestrator, BookingRequest, BookingStorage, Calendar, Config, CounterResponse,
    DateSelection, InMemoryStorage, LifecycleEnvironment, MessageThread, Money, Party,
    PostgresStorage, Response, Role, ServiceId, ServiceListing, SlotSpec, UserId,
    config::StorageBackend,
    directory::{StaticCatalog, StaticDirectory},
    metrics::register_business_metrics,
    notify::{
        dead_letter::DeadLetterQueue,
        worker::{DeliveryWorker, LoggingChannel, QueuedDispatcher},
    },
};
use gigbook_core::environment::{Clock, SystemClock};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gigbook=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    register_business_metrics();

    // Load configuration
    let config = Config::from_env();
    tracing::info!(storage = ?config.storage, "Configuration loaded");

    let storage: Arc<dyn BookingStorage> = match config.storage {
        StorageBackend::Memory => Arc::new(InMemoryStorage::new()),
        StorageBackend::Postgres => {
            let storage = PostgresStorage::connect(&config.database).await?;
            storage.migrate().await?;
            Arc::new(storage)
        },
    };

    // ========== Collaborators ==========

    let directory = Arc::new(StaticDirectory::new());
    let catalog = Arc::new(StaticCatalog::new());

    let vendor = UserId::new();
    let alice = UserId::new();
    let bob = UserId::new();
    directory.insert(Party::new(vendor, Role::Vendor, "Lens & Light Studio"));
    directory.insert(Party::new(alice, Role::Customer, "Alice"));
    directory.insert(Party::new(bob, Role::Customer, "Bob"));

    let service_id = ServiceId::new();
    catalog.insert(ServiceListing {
        id: service_id,
        vendor_id: vendor,
        name: "Event photography".to_string(),
        base_price: Money::from_cents(80_000),
    });

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (dispatcher, rx) = QueuedDispatcher::unbounded();
    let dispatcher = Arc::new(dispatcher);

    let worker = DeliveryWorker::new(
        directory.clone(),
        Arc::new(LoggingChannel),
        config.notifications.retry_table(),
        DeadLetterQueue::new(config.notifications.dead_letter_capacity),
    );
    let dead_letters = worker.dead_letters();
    let worker = worker.spawn(rx);

    let calendar = Calendar::new(storage.clone(), directory.clone(), clock.clone());
    let orchestrator = BookingOrchestrator::new(
        storage.clone(),
        directory.clone(),
        catalog.clone(),
        LifecycleEnvironment::new(clock.clone(), dispatcher.clone()),
        config.policy.clone(),
    );
    let thread = MessageThread::new(
        storage,
        directory,
        catalog,
        dispatcher,
        clock.clone(),
        config.policy.message_max_chars,
    );

    // ========== Demo Scenario ==========

    let today = clock.now().date_naive();
    let event_day = today
        .checked_add_days(Days::new(7))
        .ok_or_else(|| anyhow::anyhow!("date out of range"))?;
    let at = |hour: u32| {
        NaiveTime::from_hms_opt(hour, 0, 0).ok_or_else(|| anyhow::anyhow!("bad hour {hour}"))
    };

    // Step 1: availability
    println!("1. Vendor publishes availability for {event_day}");
    let outcome = calendar
        .bulk_add(
            vendor,
            vec![
                SlotSpec {
                    date: event_day,
                    start_time: at(10)?,
                    end_time: at(14)?,
                    available: true,
                },
                SlotSpec {
                    date: event_day,
                    start_time: at(16)?,
                    end_time: at(23)?,
                    available: true,
                },
            ],
        )
        .await?;
    println!("   created {} slot(s)", outcome.created.len());

    let slots = calendar
        .list_slots(vendor, DateSelection::Single(event_day))
        .await?;
    for slot in &slots {
        println!("   {} {}-{}", slot.date, slot.start_time, slot.end_time);
    }

    // Step 2: two customers want the same evening
    println!("2. Alice and Bob both request {event_day} 18:00-21:00");
    let request = BookingRequest {
        service_id,
        event_start: event_day.and_time(at(18)?),
        event_end: Some(event_day.and_time(at(21)?)),
        location: "Harbor Hall".to_string(),
        amount: None,
        requirements: Some("Candid shots, no flash during speeches".to_string()),
    };

    let booking = orchestrator.create(alice, request.clone()).await?;
    println!("   Alice: {} ({})", booking.status, booking.amount);
    match orchestrator.create(bob, request).await {
        Ok(b) => println!("   Bob: unexpectedly granted ({})", b.status),
        Err(err) => println!("   Bob: refused ({err})"),
    }

    // Step 3: counter-offer
    println!("3. Vendor counter-offers");
    let booking = orchestrator
        .respond(
            booking.id,
            vendor,
            Response::CounterOffer {
                amount: Money::from_cents(95_000),
                notes: "Includes a second shooter".to_string(),
            },
        )
        .await?;
    println!("   {} at {}", booking.status, booking.amount);

    let booking = orchestrator
        .respond_to_counter(booking.id, alice, CounterResponse::Accept)
        .await?;
    println!("   Alice accepts: {}", booking.status);

    // Step 4: messages
    println!("4. Messages");
    thread
        .post(booking.id, alice, "Can you arrive 30 minutes early?".to_string(), None)
        .await?;
    thread
        .post(booking.id, vendor, "Sure, see you at 17:30.".to_string(), None)
        .await?;
    for message in thread.list(booking.id, alice).await? {
        println!("   [{}] {}", message.sent_at.format("%H:%M:%S"), message.body);
    }

    // Step 5: cancellation a week ahead is allowed
    println!("5. Alice cancels");
    let booking = orchestrator.cancel(booking.id, alice).await?;
    println!("   {}", booking.status);

    // Drain notifications
    drop(orchestrator);
    drop(thread);
    worker.await?;

    println!("Done. {} notification(s) dead-lettered.", dead_letters.len());
    Ok(())
}
