//! Per-booking conversation between customer and vendor.

use crate::directory::{IdentityProvider, ServiceCatalog};
use crate::error::{BookingError, Result};
use crate::metrics;
use crate::notify::{Notification, NotificationContext, NotificationDispatcher, NotificationKind};
use crate::store::BookingStorage;
use crate::types::{Booking, BookingId, BookingMessage, MessageId, UserId};
use chrono::{DateTime, Utc};
use gigbook_core::environment::Clock;
use std::sync::Arc;

/// Characters of the body quoted in the notification
const PREVIEW_CHARS: usize = 100;

/// Message threads attached to bookings
pub struct MessageThread {
    storage: Arc<dyn BookingStorage>,
    identity: Arc<dyn IdentityProvider>,
    catalog: Arc<dyn ServiceCatalog>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    max_chars: usize,
}

impl MessageThread {
    /// Creates a new `MessageThread` accepting bodies up to `max_chars`
    #[must_use]
    pub fn new(
        storage: Arc<dyn BookingStorage>,
        identity: Arc<dyn IdentityProvider>,
        catalog: Arc<dyn ServiceCatalog>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
        max_chars: usize,
    ) -> Self {
        Self {
            storage,
            identity,
            catalog,
            dispatcher,
            clock,
            max_chars,
        }
    }

    async fn party_booking(
        &self,
        booking_id: BookingId,
        actor: UserId,
        action: &'static str,
    ) -> Result<Booking> {
        let booking = self
            .storage
            .booking(booking_id)
            .await?
            .ok_or_else(|| BookingError::not_found("booking", booking_id))?;
        if !booking.is_party(&actor) {
            return Err(BookingError::Unauthorized { actor, action });
        }
        Ok(booking)
    }

    fn validate_body(&self, body: &str) -> Result<()> {
        let chars = body.chars().count();
        if body.trim().is_empty() {
            return Err(BookingError::invalid("body", "must not be blank"));
        }
        if chars > self.max_chars {
            return Err(BookingError::invalid(
                "body",
                format!("must be at most {} characters", self.max_chars),
            ));
        }
        Ok(())
    }

    /// Post to a booking's thread and notify the other party.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Unauthorized` for a non-party sender, `Validation` for a
    /// blank or oversized body.
    #[tracing::instrument(skip(self, body), fields(len = body.len()))]
    pub async fn post(
        &self,
        booking_id: BookingId,
        sender: UserId,
        body: String,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<BookingMessage> {
        let booking = self.party_booking(booking_id, sender, "post_message").await?;
        self.validate_body(&body)?;

        let message = self
            .storage
            .append_message(BookingMessage {
                id: MessageId::new(),
                booking_id,
                sender_id: sender,
                body,
                sent_at: sent_at.unwrap_or_else(|| self.clock.now()),
            })
            .await?;
        metrics::record_message_posted();

        if let Some(recipient) = booking.counterparty(&sender) {
            let context =
                NotificationContext::resolve(&booking, self.identity.as_ref(), self.catalog.as_ref())
                    .await;
            let preview: String = message.body.chars().take(PREVIEW_CHARS).collect();
            self.dispatcher.dispatch(
                Notification::about(
                    NotificationKind::NewMessage,
                    recipient,
                    &booking,
                    &context,
                    message.sent_at,
                )
                .with_field("message_id", message.id.to_string())
                .with_field("preview", preview),
            );
        }

        Ok(message)
    }

    /// The thread, oldest first. Parties only.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Unauthorized`.
    pub async fn list(&self, booking_id: BookingId, actor: UserId) -> Result<Vec<BookingMessage>> {
        self.party_booking(booking_id, actor, "read_messages").await?;
        let mut messages = self.storage.messages(booking_id).await?;
        messages.sort_by_key(|m| m.sent_at);
        Ok(messages)
    }
}
