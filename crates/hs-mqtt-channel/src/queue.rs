//! Offline publish queue.
//!
//! Buffers outbound messages while the broker is unreachable. The
//! connection manager's drain activity consumes it FIFO once connected.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde::Deserialize;
use tokio::sync::Notify;

use crate::error::{MqttError, MqttResult};

/// Hard ceiling applied to an "infinite" queue so a long outage cannot
/// exhaust memory. Above it the oldest message is evicted.
pub const INFINITE_QUEUE_CEILING: usize = 100_000;

/// An outbound message waiting for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            enqueued_at: Utc::now(),
        }
    }
}

/// Which message is sacrificed when a bounded queue overflows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the head of the queue and accept the new message.
    #[default]
    DropOldest,
    /// Reject the new message and keep the queue intact.
    DropNewest,
}

impl fmt::Display for DropPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropPolicy::DropOldest => f.write_str("oldest"),
            DropPolicy::DropNewest => f.write_str("newest"),
        }
    }
}

/// Queue sizing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCapacity {
    /// No offline queueing: publishing while disconnected fails.
    Disabled,
    /// Up to N messages; overflow handled by the [`DropPolicy`].
    Bounded(usize),
    /// Unbounded from the caller's view, capped at [`INFINITE_QUEUE_CEILING`].
    Infinite,
}

impl QueueCapacity {
    /// Interpret the classic integer setting: `-1` infinite, `0` disabled,
    /// `N > 0` bounded.
    pub fn from_size(size: i64) -> MqttResult<Self> {
        match size {
            -1 => Ok(QueueCapacity::Infinite),
            0 => Ok(QueueCapacity::Disabled),
            n if n > 0 => usize::try_from(n)
                .map(QueueCapacity::Bounded)
                .map_err(|_| MqttError::Config(format!("offline queue size {n} is too large"))),
            n => Err(MqttError::Config(format!(
                "offline queue size must be -1, 0 or positive, got {n}"
            ))),
        }
    }
}

/// Thread-safe FIFO shared by the publisher and the drain activity.
pub struct OfflineQueue {
    messages: Mutex<VecDeque<QueuedMessage>>,
    capacity: QueueCapacity,
    policy: DropPolicy,
    available: Notify,
}

impl OfflineQueue {
    pub fn new(capacity: QueueCapacity, policy: DropPolicy) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            capacity,
            policy,
            available: Notify::new(),
        }
    }

    /// Infinite queue with drop-oldest fallback above the ceiling.
    pub fn infinite() -> Self {
        Self::new(QueueCapacity::Infinite, DropPolicy::DropOldest)
    }

    pub fn capacity(&self) -> QueueCapacity {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity != QueueCapacity::Disabled
    }

    /// Append a message. Never blocks.
    ///
    /// Bounded queues return [`MqttError::QueueFull`] on overflow after
    /// applying the drop policy; infinite queues always succeed.
    pub fn enqueue(&self, message: QueuedMessage) -> MqttResult<()> {
        let result = {
            let mut messages = self.lock();
            match self.capacity {
                QueueCapacity::Disabled => return Err(MqttError::NotConnected),
                QueueCapacity::Infinite => {
                    if messages.len() >= INFINITE_QUEUE_CEILING {
                        if let Some(evicted) = messages.pop_front() {
                            tracing::warn!(
                                topic = %evicted.topic,
                                ceiling = INFINITE_QUEUE_CEILING,
                                "offline queue at ceiling, evicted oldest message"
                            );
                        }
                    }
                    messages.push_back(message);
                    Ok(())
                }
                QueueCapacity::Bounded(capacity) => {
                    if messages.len() < capacity {
                        messages.push_back(message);
                        Ok(())
                    } else {
                        if self.policy == DropPolicy::DropOldest {
                            messages.pop_front();
                            messages.push_back(message);
                        }
                        Err(MqttError::QueueFull {
                            capacity,
                            policy: self.policy,
                        })
                    }
                }
            }
        };
        self.available.notify_one();
        result
    }

    /// Put a message back at the head after a failed send.
    pub fn requeue_front(&self, message: QueuedMessage) {
        self.lock().push_front(message);
        self.available.notify_one();
    }

    /// Remove and return the oldest message.
    pub fn pop(&self) -> Option<QueuedMessage> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the queued messages, oldest first.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.lock().iter().cloned().collect()
    }

    /// Wait until a message has been enqueued since the last wake-up.
    pub async fn notified(&self) {
        self.available.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::infinite()
    }
}

impl fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}
