//! Queue-backed dispatch and the retrying delivery worker.

use super::dead_letter::DeadLetterQueue;
use super::retry::{RetryPolicyTable, retry_with_predicate};
use super::{Notification, NotificationDispatcher};
use crate::directory::{DependencyError, IdentityProvider, Party};
use crate::metrics;
use crate::types::BookingId;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Dispatcher that enqueues onto an unbounded channel drained by a
/// [`DeliveryWorker`].
#[derive(Debug, Clone)]
pub struct QueuedDispatcher {
    tx: mpsc::UnboundedSender<Notification>,
}

impl QueuedDispatcher {
    /// Create the dispatcher and the receiving end for the worker
    #[must_use]
    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationDispatcher for QueuedDispatcher {
    fn dispatch(&self, notification: Notification) {
        let kind = notification.kind;
        if self.tx.send(notification).is_err() {
            // worker gone, nobody will ever deliver this
            tracing::warn!(%kind, "Notification queue closed, dropping notification");
            metrics::record_notification(kind, "dropped");
        } else {
            tracing::debug!(%kind, "Notification enqueued");
        }
    }
}

/// Transport failure reported by a [`NotificationChannel`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Might succeed later (timeout, rate limit, provider outage)
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Will never succeed (bad address, rejected content)
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// The transport edge: e-mail, push, in-app feed.
pub trait NotificationChannel: Send + Sync {
    /// Deliver `notification` to `recipient`
    fn deliver<'a>(
        &'a self,
        recipient: &'a Party,
        notification: &'a Notification,
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// Channel that only writes a log line per delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingChannel;

impl NotificationChannel for LoggingChannel {
    fn deliver<'a>(
        &'a self,
        recipient: &'a Party,
        notification: &'a Notification,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            tracing::info!(
                kind = %notification.kind,
                recipient = %recipient.display_name,
                booking_id = %notification.booking_id,
                "Notification delivered"
            );
            Ok(())
        })
    }
}

/// What happened to one notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Reached the channel
    Delivered {
        /// Attempts used, including the successful one
        attempts: usize,
    },
    /// Dropped without retry (recipient no longer exists)
    Discarded {
        /// Why
        reason: String,
    },
    /// Gave up and parked in the dead letter queue
    DeadLettered {
        /// Attempts used
        attempts: usize,
        /// Last error
        error: String,
    },
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("recipient {0} not found")]
    RecipientMissing(crate::types::UserId),
    #[error("recipient lookup failed: {0}")]
    Lookup(#[from] DependencyError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl AttemptError {
    const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Lookup(_) | Self::Delivery(DeliveryError::Transient(_))
        )
    }
}

/// Per-booking delivery queue inside [`DeliveryWorker::run`].
struct Lane {
    tx: mpsc::UnboundedSender<Notification>,
    /// Sent but not yet delivered
    pending: Arc<AtomicUsize>,
}

/// Drains the notification queue.
///
/// Notifications about one booking are delivered in the order they were
/// dispatched. Different bookings are delivered concurrently, so one
/// notification stuck in retry backoff holds up only its own booking.
pub struct DeliveryWorker {
    identity: Arc<dyn IdentityProvider>,
    channel: Arc<dyn NotificationChannel>,
    policies: RetryPolicyTable,
    dead_letters: DeadLetterQueue<Notification>,
}

impl DeliveryWorker {
    /// Creates a new `DeliveryWorker`
    #[must_use]
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        channel: Arc<dyn NotificationChannel>,
        policies: RetryPolicyTable,
        dead_letters: DeadLetterQueue<Notification>,
    ) -> Self {
        Self {
            identity,
            channel,
            policies,
            dead_letters,
        }
    }

    /// Handle to the dead letter queue this worker fills
    #[must_use]
    pub fn dead_letters(&self) -> DeadLetterQueue<Notification> {
        self.dead_letters.clone()
    }

    /// Resolve the recipient and deliver, retrying per the kind's policy.
    #[tracing::instrument(
        skip(self, notification),
        fields(kind = %notification.kind, booking_id = %notification.booking_id)
    )]
    pub async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        let policy = self.policies.policy_for(notification.kind);
        let mut attempts = 0usize;

        let result = retry_with_predicate(
            &policy,
            || {
                attempts += 1;
                self.attempt(notification)
            },
            AttemptError::is_retryable,
        )
        .await;

        let outcome = match result {
            Ok(()) => DeliveryOutcome::Delivered { attempts },
            Err(err @ AttemptError::RecipientMissing(_)) => {
                tracing::warn!(error = %err, "Discarding notification");
                DeliveryOutcome::Discarded {
                    reason: err.to_string(),
                }
            },
            Err(err) => {
                tracing::error!(attempts, error = %err, "Notification dead-lettered");
                self.dead_letters
                    .push(notification.clone(), err.to_string(), attempts);
                DeliveryOutcome::DeadLettered {
                    attempts,
                    error: err.to_string(),
                }
            },
        };

        let label = match &outcome {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::Discarded { .. } => "discarded",
            DeliveryOutcome::DeadLettered { .. } => "dead_lettered",
        };
        metrics::record_notification(notification.kind, label);

        outcome
    }

    async fn attempt(&self, notification: &Notification) -> Result<(), AttemptError> {
        let recipient = self
            .identity
            .resolve(&notification.recipient)
            .await?
            .ok_or(AttemptError::RecipientMissing(notification.recipient))?;

        self.channel.deliver(&recipient, notification).await?;
        Ok(())
    }

    /// Deliver until every dispatcher has been dropped and every lane is
    /// empty.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Notification>) {
        tracing::info!("Notification worker started");
        let worker = Arc::new(self);
        let mut lanes: HashMap<BookingId, Lane> = HashMap::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        while let Some(notification) = rx.recv().await {
            // An idle lane has nothing queued, so a fresh one keeps the order
            lanes.retain(|_, lane| lane.pending.load(Ordering::Acquire) > 0);
            tasks.retain(|task| !task.is_finished());

            let lane = lanes.entry(notification.booking_id).or_insert_with(|| {
                let (tx, lane_rx) = mpsc::unbounded_channel();
                let pending = Arc::new(AtomicUsize::new(0));
                tasks.push(tokio::spawn(
                    Arc::clone(&worker).drain_lane(lane_rx, Arc::clone(&pending)),
                ));
                Lane { tx, pending }
            });

            lane.pending.fetch_add(1, Ordering::AcqRel);
            if let Err(mpsc::error::SendError(lost)) = lane.tx.send(notification) {
                lane.pending.fetch_sub(1, Ordering::AcqRel);
                tracing::error!(
                    booking_id = %lost.booking_id,
                    "Delivery lane gone, dropping notification"
                );
                metrics::record_notification(lost.kind, "dropped");
            }
        }

        drop(lanes);
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Delivery lane failed");
            }
        }
        tracing::info!("Notification worker stopped");
    }

    async fn drain_lane(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Notification>,
        pending: Arc<AtomicUsize>,
    ) {
        while let Some(notification) = rx.recv().await {
            self.deliver(&notification).await;
            pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Run on a background task
    #[must_use]
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<Notification>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::directory::{Role, StaticDirectory};
    use crate::notify::NotificationKind;
    use crate::notify::retry::RetryPolicy;
    use crate::types::UserId;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Fails with the queued errors, then succeeds.
    #[derive(Default)]
    struct ScriptedChannel {
        failures: Mutex<Vec<DeliveryError>>,
        calls: Mutex<usize>,
    }

    impl ScriptedChannel {
        fn failing_with(failures: Vec<DeliveryError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl NotificationChannel for ScriptedChannel {
        fn deliver<'a>(
            &'a self,
            _recipient: &'a Party,
            _notification: &'a Notification,
        ) -> BoxFuture<'a, Result<(), DeliveryError>> {
            *self.calls.lock().unwrap() += 1;
            let next = self.failures.lock().unwrap().pop();
            Box::pin(async move { next.map_or(Ok(()), Err) })
        }
    }

    fn notification(recipient: UserId) -> Notification {
        Notification {
            kind: NotificationKind::BookingCreated,
            recipient,
            booking_id: BookingId::new(),
            payload: serde_json::Map::new(),
            emitted_at: Utc::now(),
        }
    }

    fn fast_policies(max_retries: usize) -> RetryPolicyTable {
        RetryPolicyTable::uniform(
            &RetryPolicy::builder()
                .max_retries(max_retries)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5))
                .build(),
        )
    }

    fn worker(
        directory: Arc<StaticDirectory>,
        channel: Arc<ScriptedChannel>,
        max_retries: usize,
    ) -> DeliveryWorker {
        DeliveryWorker::new(
            directory,
            channel,
            fast_policies(max_retries),
            DeadLetterQueue::new(10),
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let directory = Arc::new(StaticDirectory::new());
        let user = UserId::new();
        directory.insert(Party::new(user, Role::Vendor, "V"));
        let channel = Arc::new(ScriptedChannel::failing_with(vec![
            DeliveryError::Transient("timeout".into()),
            DeliveryError::Transient("timeout".into()),
        ]));

        let outcome = worker(directory, Arc::clone(&channel), 5)
            .deliver(&notification(user))
            .await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
        assert_eq!(channel.calls(), 3);
    }

    #[tokio::test]
    async fn missing_recipient_is_discarded_without_retry() {
        let directory = Arc::new(StaticDirectory::new());
        let channel = Arc::new(ScriptedChannel::default());
        let worker = worker(directory, Arc::clone(&channel), 5);

        let outcome = worker.deliver(&notification(UserId::new())).await;

        assert!(matches!(outcome, DeliveryOutcome::Discarded { .. }));
        assert_eq!(channel.calls(), 0);
        assert!(worker.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let directory = Arc::new(StaticDirectory::new());
        let user = UserId::new();
        directory.insert(Party::new(user, Role::Customer, "C"));
        let channel = Arc::new(ScriptedChannel::failing_with(vec![
            DeliveryError::Transient("down".into());
            5
        ]));
        let worker = worker(directory, Arc::clone(&channel), 2);

        let outcome = worker.deliver(&notification(user)).await;

        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 3, .. }));
        assert_eq!(worker.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let directory = Arc::new(StaticDirectory::new());
        let user = UserId::new();
        directory.insert(Party::new(user, Role::Customer, "C"));
        let channel = Arc::new(ScriptedChannel::failing_with(vec![
            DeliveryError::Permanent("bad address".into()),
        ]));
        let worker = worker(directory, Arc::clone(&channel), 5);

        let outcome = worker.deliver(&notification(user)).await;

        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 1, .. }));
        assert_eq!(channel.calls(), 1);
    }

    #[tokio::test]
    async fn run_drains_queue_until_dispatchers_drop() {
        let directory = Arc::new(StaticDirectory::new());
        let user = UserId::new();
        directory.insert(Party::new(user, Role::Vendor, "V"));
        let channel = Arc::new(ScriptedChannel::default());
        let (dispatcher, rx) = QueuedDispatcher::unbounded();

        let handle = worker(directory, Arc::clone(&channel), 0).spawn(rx);
        dispatcher.dispatch(notification(user));
        dispatcher.dispatch(notification(user));
        drop(dispatcher);

        handle.await.unwrap();
        assert_eq!(channel.calls(), 2);
    }

    /// Holds `BookingCreated` for one booking until the gate opens.
    struct GatedChannel {
        gated: BookingId,
        gate: Notify,
        delivered: Mutex<Vec<(BookingId, NotificationKind)>>,
    }

    impl GatedChannel {
        fn delivered(&self) -> Vec<(BookingId, NotificationKind)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl NotificationChannel for GatedChannel {
        fn deliver<'a>(
            &'a self,
            _recipient: &'a Party,
            notification: &'a Notification,
        ) -> BoxFuture<'a, Result<(), DeliveryError>> {
            Box::pin(async move {
                if notification.booking_id == self.gated
                    && notification.kind == NotificationKind::BookingCreated
                {
                    self.gate.notified().await;
                }
                self.delivered
                    .lock()
                    .unwrap()
                    .push((notification.booking_id, notification.kind));
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn slow_booking_does_not_hold_up_others() {
        let directory = Arc::new(StaticDirectory::new());
        let user = UserId::new();
        directory.insert(Party::new(user, Role::Vendor, "V"));
        let (slow, fast) = (BookingId::new(), BookingId::new());
        let channel = Arc::new(GatedChannel {
            gated: slow,
            gate: Notify::new(),
            delivered: Mutex::new(Vec::new()),
        });
        let (dispatcher, rx) = QueuedDispatcher::unbounded();
        let handle = DeliveryWorker::new(
            directory,
            Arc::clone(&channel) as Arc<dyn NotificationChannel>,
            fast_policies(0),
            DeadLetterQueue::new(10),
        )
        .spawn(rx);

        let about = |booking_id: BookingId, kind: NotificationKind| Notification {
            booking_id,
            kind,
            ..notification(user)
        };
        dispatcher.dispatch(about(slow, NotificationKind::BookingCreated));
        dispatcher.dispatch(about(slow, NotificationKind::BookingApproved));
        dispatcher.dispatch(about(fast, NotificationKind::BookingCreated));

        let fast_delivered = tokio::time::timeout(Duration::from_secs(5), async {
            while channel.delivered().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(fast_delivered.is_ok(), "other booking waited on the slow one");

        channel.gate.notify_one();
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(
            channel.delivered(),
            vec![
                (fast, NotificationKind::BookingCreated),
                (slow, NotificationKind::BookingCreated),
                (slow, NotificationKind::BookingApproved),
            ]
        );
    }
}
