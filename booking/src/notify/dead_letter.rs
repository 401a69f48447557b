//! Bounded store for notifications that exhausted their retries.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Dead letter queue entry
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    /// The undelivered payload
    pub payload: T,
    /// Attempts made before giving up
    pub attempts: usize,
    /// The error from the last attempt
    pub error_message: String,
    /// When it was given up on
    pub failed_at: DateTime<Utc>,
}

/// Dead Letter Queue for storing failed deliveries
///
/// - Bounded; the oldest entry is dropped when full
/// - FIFO
/// - Clones share the same storage
///
/// # Example
///
/// ```
/// use gigbook::notify::dead_letter::DeadLetterQueue;
///
/// let dlq = DeadLetterQueue::new(2);
/// dlq.push("a", "timeout".to_string(), 3);
/// dlq.push("b", "timeout".to_string(), 3);
/// dlq.push("c", "timeout".to_string(), 3);
///
/// let payloads: Vec<_> = dlq.drain().into_iter().map(|e| e.payload).collect();
/// assert_eq!(payloads, vec!["b", "c"]);
/// ```
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    max_size: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create an empty queue holding at most `max_size` entries
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Record a failed delivery.
    ///
    /// If the queue is full, the oldest entry is dropped.
    pub fn push(&self, payload: T, error_message: String, attempts: usize) {
        if self.max_size == 0 {
            metrics::counter!("gigbook_dead_letters_dropped_total").increment(1);
            return;
        }

        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            queue.pop_front();
            metrics::counter!("gigbook_dead_letters_dropped_total").increment(1);
            tracing::warn!(
                max_size = self.max_size,
                "Dead letter queue at capacity, dropping oldest entry"
            );
        }

        queue.push_back(DeadLetter {
            payload,
            attempts,
            error_message,
            failed_at: Utc::now(),
        });

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("gigbook_dead_letter_queue_size").set(queue.len() as f64);
    }

    /// Current number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every entry, oldest first
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        metrics::gauge!("gigbook_dead_letter_queue_size").set(0.0);
        entries
    }

    /// Maximum number of entries kept
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}
