//! Gigbook - booking lifecycle and availability-conflict engine for an
//! event-services marketplace.
//!
//! Customers book vendors (photographers, caterers, DJs) for dated events.
//! The engine keeps each vendor's calendar free of double-bookings and drives
//! every booking through its lifecycle with notifications at each step.
//!
//! # Architecture
//!
//! ```text
//!   Calendar ─────────┐           BookingOrchestrator          MessageThread
//!   (slots)           │          ┌────────┴────────┐                 │
//!                     ▼          ▼                 ▼                 ▼
//!              ┌─────────────────────┐    ┌──────────────────┐   dispatch
//!              │   BookingStorage    │    │ LifecycleReducer │      │
//!              │ (conflict check +   │    │ (transition table│      │
//!              │  write, per vendor) │    │  + notify effect)│      │
//!              └─────────────────────┘    └──────────────────┘      │
//!                                                  │ effects        │
//!                                                  ▼                ▼
//!                                       QueuedDispatcher ──► DeliveryWorker
//!                                                            (retry, DLQ)
//! ```
//!
//! # Key Features
//!
//! ## 1. No double-booking
//!
//! A booking is granted only if an available slot covers its window, no
//! unavailable slot overlaps it, and no pending or accepted booking of the
//! same vendor overlaps it. The check and the insert happen in one critical
//! section per vendor, so of two racing requests exactly one wins.
//!
//! ## 2. Explicit lifecycle
//!
//! ```text
//! pending ──accept──► accepted ──complete──► completed
//!    │ └─counter─► counter_offered ──accept──► accepted
//!    │                   └──decline──► declined
//!    ├──decline──► declined
//!    └──cancel───► cancelled ◄──cancel── accepted
//! ```
//!
//! ## 3. Fire-and-forget notifications
//!
//! Every transition yields at most one notification, delivered in the
//! background with per-kind retry and a dead letter queue. Delivery problems
//! never surface to the caller.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod calendar;
pub mod config;
pub mod conflict;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod messages;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod store;
pub mod types;

pub use calendar::{BulkFailure, BulkOutcome, Calendar, ConflictReport, DateSelection, SlotSpec};
pub use config::Config;
pub use directory::{IdentityProvider, Party, Role, ServiceCatalog, ServiceListing};
pub use error::{BookingError, ErrorKind, FieldError, Result};
pub use lifecycle::{BookingAction, LifecycleEnvironment, LifecycleReducer, LifecycleState};
pub use messages::MessageThread;
pub use notify::{Notification, NotificationDispatcher, NotificationKind};
pub use orchestrator::{BookingOrchestrator, BookingRequest, CounterResponse, Response};
pub use store::{BookingStorage, InMemoryStorage, PostgresStorage};
pub use types::*;
