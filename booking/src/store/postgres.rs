//! PostgreSQL storage.
//!
//! Calendar writes run in a transaction that first takes
//! `pg_advisory_xact_lock` keyed by the vendor, then re-reads the vendor's
//! slots and active bookings, decides with the same conflict functions as the
//! in-memory backend, and writes. The lock is released on commit or rollback.
//!
//! SQL only narrows the candidate rows; the overlap decision itself is made
//! in Rust by [`crate::conflict`].
//!
//! # Example
//!
//! ```no_run
//! use gigbook::config::DatabaseConfig;
//! use gigbook::store::PostgresStorage;
//!
//! # async fn example() -> Result<(), gigbook::BookingError> {
//! let storage = PostgresStorage::connect(&DatabaseConfig::default()).await?;
//! storage.migrate().await?;
//! # Ok(())
//! # }
//! ```

use super::{BookingStorage, displaced_bookings};
use crate::config::DatabaseConfig;
use crate::conflict::{
    DEFAULT_EVENT_MINUTES, TimeWindow, find_conflicts, overlapping_bookings, relevant_slot_dates,
};
use crate::error::{BookingError, ConflictDetail, Result};
use crate::types::{
    AvailabilitySlot, Booking, BookingId, BookingMessage, BookingStatus, MessageId, Money,
    ServiceId, SlotId, UserId,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

const SELECT_SLOT: &str = "SELECT id, vendor_id, date, start_time, end_time, available \
     FROM availability_slots";

const SELECT_BOOKING: &str = "SELECT id, customer_id, vendor_id, service_id, event_start, \
     event_end, location, amount_cents, status, requirements, vendor_notes, created_at, \
     updated_at FROM bookings";

#[derive(sqlx::FromRow)]
struct SlotRow {
    id: Uuid,
    vendor_id: Uuid,
    date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    available: bool,
}

impl From<SlotRow> for AvailabilitySlot {
    fn from(row: SlotRow) -> Self {
        Self {
            id: SlotId::from_uuid(row.id),
            vendor_id: UserId::from_uuid(row.vendor_id),
            date: row.date,
            start_time: row.start_time,
            end_time: row.end_time,
            available: row.available,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    customer_id: Uuid,
    vendor_id: Uuid,
    service_id: Uuid,
    event_start: NaiveDateTime,
    event_end: Option<NaiveDateTime>,
    location: String,
    amount_cents: i64,
    status: String,
    requirements: Option<String>,
    vendor_notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = BookingError;

    fn try_from(row: BookingRow) -> Result<Self> {
        let status = row.status.parse().map_err(BookingError::Storage)?;
        let cents = u64::try_from(row.amount_cents)
            .map_err(|_| BookingError::Storage(format!("negative amount on booking {}", row.id)))?;

        Ok(Self {
            id: BookingId::from_uuid(row.id),
            customer_id: UserId::from_uuid(row.customer_id),
            vendor_id: UserId::from_uuid(row.vendor_id),
            service_id: ServiceId::from_uuid(row.service_id),
            event_start: row.event_start,
            event_end: row.event_end,
            location: row.location,
            amount: Money::from_cents(cents),
            status,
            requirements: row.requirements,
            vendor_notes: row.vendor_notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    booking_id: Uuid,
    sender_id: Uuid,
    body: String,
    sent_at: DateTime<Utc>,
}

impl From<MessageRow> for BookingMessage {
    fn from(row: MessageRow) -> Self {
        Self {
            id: MessageId::from_uuid(row.id),
            booking_id: BookingId::from_uuid(row.booking_id),
            sender_id: UserId::from_uuid(row.sender_id),
            body: row.body,
            sent_at: row.sent_at,
        }
    }
}

fn amount_cents(amount: Money) -> Result<i64> {
    i64::try_from(amount.cents())
        .map_err(|_| BookingError::invalid("amount", "exceeds the storable range"))
}

/// Storage backed by a PostgreSQL pool.
#[derive(Clone, Debug)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Wrap an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the database cannot be reached.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .connect(&config.url)
            .await?;
        tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if migrations fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BookingError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Serialize calendar writes for `vendor` until the transaction ends.
async fn lock_vendor(conn: &mut PgConnection, vendor: UserId) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext(($1::uuid)::text))")
        .bind(vendor.as_uuid())
        .execute(conn)
        .await?;
    Ok(())
}

async fn slots_on(
    conn: &mut PgConnection,
    vendor: UserId,
    dates: &[NaiveDate],
) -> Result<Vec<AvailabilitySlot>> {
    let rows: Vec<SlotRow> = sqlx::query_as(&format!(
        "{SELECT_SLOT} WHERE vendor_id = $1 AND date = ANY($2)"
    ))
    .bind(vendor.as_uuid())
    .bind(dates)
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Active bookings of `vendor` overlapping `window`.
async fn active_overlapping(
    conn: &mut PgConnection,
    vendor: UserId,
    window: TimeWindow,
) -> Result<Vec<Booking>> {
    // Superset: an end before start+default still counts as start+default here
    let rows: Vec<BookingRow> = sqlx::query_as(&format!(
        "{SELECT_BOOKING} WHERE vendor_id = $1 AND status IN ('pending', 'accepted') \
         AND event_start < $3 \
         AND GREATEST(COALESCE(event_end, event_start), \
                      event_start + make_interval(mins => $4)) > $2"
    ))
    .bind(vendor.as_uuid())
    .bind(window.start())
    .bind(window.end())
    .bind(i32::try_from(DEFAULT_EVENT_MINUTES).unwrap_or(i32::MAX))
    .fetch_all(conn)
    .await?;

    let candidates = rows
        .into_iter()
        .map(Booking::try_from)
        .collect::<Result<Vec<_>>>()?;
    Ok(overlapping_bookings(&candidates, &vendor, &window, None)
        .cloned()
        .collect())
}

async fn slot_for_update(
    conn: &mut PgConnection,
    vendor: UserId,
    slot_id: SlotId,
) -> Result<AvailabilitySlot> {
    let row: Option<SlotRow> = sqlx::query_as(&format!(
        "{SELECT_SLOT} WHERE id = $1 AND vendor_id = $2 FOR UPDATE"
    ))
    .bind(slot_id.as_uuid())
    .bind(vendor.as_uuid())
    .fetch_optional(conn)
    .await?;
    row.map(Into::into)
        .ok_or_else(|| BookingError::not_found("slot", slot_id))
}

/// Caller holds the vendor lock.
async fn ensure_grantable(conn: &mut PgConnection, booking: &Booking) -> Result<()> {
    let window = booking.window();
    let slots = slots_on(&mut *conn, booking.vendor_id, &relevant_slot_dates(&window)).await?;
    let active = active_overlapping(&mut *conn, booking.vendor_id, window).await?;
    let findings = find_conflicts(&slots, &active, &booking.vendor_id, &window, Some(booking.id));

    if findings.is_clear() {
        Ok(())
    } else {
        Err(BookingError::Conflict(findings.into()))
    }
}

impl BookingStorage for PostgresStorage {
    fn insert_slot(&self, slot: AvailabilitySlot) -> BoxFuture<'_, Result<AvailabilitySlot>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            lock_vendor(&mut tx, slot.vendor_id).await?;

            sqlx::query(
                "INSERT INTO availability_slots \
                 (id, vendor_id, date, start_time, end_time, available) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(slot.id.as_uuid())
            .bind(slot.vendor_id.as_uuid())
            .bind(slot.date)
            .bind(slot.start_time)
            .bind(slot.end_time)
            .bind(slot.available)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(slot)
        })
    }

    fn update_slot(&self, slot: AvailabilitySlot) -> BoxFuture<'_, Result<AvailabilitySlot>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            lock_vendor(&mut tx, slot.vendor_id).await?;

            let old = slot_for_update(&mut tx, slot.vendor_id, slot.id).await?;
            let (old_window, new_window) = (old.window(), slot.window());
            let span = TimeWindow::new(
                old_window.start().min(new_window.start()),
                old_window.end().max(new_window.end()),
            );

            if let Some(span) = span {
                let active = active_overlapping(&mut tx, slot.vendor_id, span).await?;
                let mut dates: Vec<NaiveDate> = active
                    .iter()
                    .flat_map(|b| relevant_slot_dates(&b.window()))
                    .collect();
                dates.sort_unstable();
                dates.dedup();

                let mut slots_after: Vec<AvailabilitySlot> =
                    slots_on(&mut tx, slot.vendor_id, &dates)
                        .await?
                        .into_iter()
                        .filter(|existing| existing.id != slot.id)
                        .collect();
                // The edit may move the slot onto a date not loaded above
                slots_after.push(slot.clone());

                let displaced = displaced_bookings(&old, &slot, &slots_after, &active);
                if !displaced.is_empty() {
                    return Err(BookingError::Conflict(ConflictDetail {
                        uncovered: false,
                        slot_ids: vec![slot.id],
                        booking_ids: displaced,
                    }));
                }
            }

            sqlx::query(
                "UPDATE availability_slots \
                 SET date = $2, start_time = $3, end_time = $4, available = $5 \
                 WHERE id = $1",
            )
            .bind(slot.id.as_uuid())
            .bind(slot.date)
            .bind(slot.start_time)
            .bind(slot.end_time)
            .bind(slot.available)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(slot)
        })
    }

    fn delete_slot(&self, vendor: UserId, slot_id: SlotId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            lock_vendor(&mut tx, vendor).await?;

            let slot = slot_for_update(&mut tx, vendor, slot_id).await?;
            let blocking: Vec<BookingId> = active_overlapping(&mut tx, vendor, slot.window())
                .await?
                .into_iter()
                .map(|booking| booking.id)
                .collect();

            if !blocking.is_empty() {
                return Err(BookingError::Conflict(ConflictDetail {
                    uncovered: false,
                    slot_ids: vec![slot_id],
                    booking_ids: blocking,
                }));
            }

            sqlx::query("DELETE FROM availability_slots WHERE id = $1")
                .bind(slot_id.as_uuid())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        })
    }

    fn slot(&self, slot_id: SlotId) -> BoxFuture<'_, Result<Option<AvailabilitySlot>>> {
        Box::pin(async move {
            let row: Option<SlotRow> = sqlx::query_as(&format!("{SELECT_SLOT} WHERE id = $1"))
                .bind(slot_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(Into::into))
        })
    }

    fn slots_between(
        &self,
        vendor: UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<AvailabilitySlot>>> {
        Box::pin(async move {
            let rows: Vec<SlotRow> = sqlx::query_as(&format!(
                "{SELECT_SLOT} WHERE vendor_id = $1 AND date BETWEEN $2 AND $3 \
                 ORDER BY date, start_time"
            ))
            .bind(vendor.as_uuid())
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(Into::into).collect())
        })
    }

    fn active_bookings_overlapping(
        &self,
        vendor: UserId,
        window: TimeWindow,
    ) -> BoxFuture<'_, Result<Vec<Booking>>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await?;
            active_overlapping(&mut conn, vendor, window).await
        })
    }

    fn insert_booking(&self, booking: Booking) -> BoxFuture<'_, Result<Booking>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            lock_vendor(&mut tx, booking.vendor_id).await?;

            ensure_grantable(&mut tx, &booking).await?;

            sqlx::query(
                "INSERT INTO bookings \
                 (id, customer_id, vendor_id, service_id, event_start, event_end, location, \
                  amount_cents, status, requirements, vendor_notes, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(booking.id.as_uuid())
            .bind(booking.customer_id.as_uuid())
            .bind(booking.vendor_id.as_uuid())
            .bind(booking.service_id.as_uuid())
            .bind(booking.event_start)
            .bind(booking.event_end)
            .bind(&booking.location)
            .bind(amount_cents(booking.amount)?)
            .bind(booking.status.as_str())
            .bind(&booking.requirements)
            .bind(&booking.vendor_notes)
            .bind(booking.created_at)
            .bind(booking.updated_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(booking)
        })
    }

    fn booking(&self, booking_id: BookingId) -> BoxFuture<'_, Result<Option<Booking>>> {
        Box::pin(async move {
            let row: Option<BookingRow> =
                sqlx::query_as(&format!("{SELECT_BOOKING} WHERE id = $1"))
                    .bind(booking_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(Booking::try_from).transpose()
        })
    }

    fn update_booking(
        &self,
        booking: Booking,
        expected: BookingStatus,
    ) -> BoxFuture<'_, Result<Booking>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            lock_vendor(&mut tx, booking.vendor_id).await?;

            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM bookings WHERE id = $1 FOR UPDATE")
                    .bind(booking.id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;

            match current {
                None => return Err(BookingError::not_found("booking", booking.id)),
                Some(status) if status != expected.as_str() => {
                    return Err(BookingError::ConcurrentModification {
                        booking_id: booking.id,
                    });
                },
                Some(_) => {},
            }

            if booking.status.is_active() && !expected.is_active() {
                ensure_grantable(&mut tx, &booking).await?;
            }

            sqlx::query(
                "UPDATE bookings \
                 SET status = $2, amount_cents = $3, vendor_notes = $4, updated_at = $5 \
                 WHERE id = $1",
            )
            .bind(booking.id.as_uuid())
            .bind(booking.status.as_str())
            .bind(amount_cents(booking.amount)?)
            .bind(&booking.vendor_notes)
            .bind(booking.updated_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(booking)
        })
    }

    fn bookings_for_party(
        &self,
        user: UserId,
        status: Option<BookingStatus>,
    ) -> BoxFuture<'_, Result<Vec<Booking>>> {
        Box::pin(async move {
            let rows: Vec<BookingRow> = sqlx::query_as(&format!(
                "{SELECT_BOOKING} WHERE (customer_id = $1 OR vendor_id = $1) \
                 AND ($2::text IS NULL OR status = $2) \
                 ORDER BY event_start DESC"
            ))
            .bind(user.as_uuid())
            .bind(status.map(BookingStatus::as_str))
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(Booking::try_from).collect()
        })
    }

    fn append_message(&self, message: BookingMessage) -> BoxFuture<'_, Result<BookingMessage>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO booking_messages (id, booking_id, sender_id, body, sent_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(message.id.as_uuid())
            .bind(message.booking_id.as_uuid())
            .bind(message.sender_id.as_uuid())
            .bind(&message.body)
            .bind(message.sent_at)
            .execute(&self.pool)
            .await?;
            Ok(message)
        })
    }

    fn messages(&self, booking_id: BookingId) -> BoxFuture<'_, Result<Vec<BookingMessage>>> {
        Box::pin(async move {
            let rows: Vec<MessageRow> = sqlx::query_as(
                "SELECT id, booking_id, sender_id, body, sent_at FROM booking_messages \
                 WHERE booking_id = $1 ORDER BY seq",
            )
            .bind(booking_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(Into::into).collect())
        })
    }
}
