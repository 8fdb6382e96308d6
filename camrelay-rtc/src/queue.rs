//! Bounded frame queues with drop-on-full semantics.
//!
//! Producers never wait. When a queue is full the configured
//! [`OverflowPolicy`] decides which frame is lost.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Which frame a full queue loses.
///
/// Readers that favor the frame already queued discard the incoming one
/// (`DropNewest`). Keeping the most recent observations instead means
/// evicting the head (`DropOldest`), which is the default: a 30-slot queue
/// fed 40 frames ends holding the last 30. Set `media.overflow` to
/// `drop-newest` for the other behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame, keeping the most recent ones.
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest frame.
    ReplacedOldest,
    /// The pushed frame was discarded.
    Dropped,
}

#[derive(Debug)]
pub struct FrameQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut items = self.items.lock();
            if items.len() < self.capacity {
                items.push_back(item);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(item);
                        PushOutcome::ReplacedOldest
                    }
                    OverflowPolicy::DropNewest => PushOutcome::Dropped,
                }
            }
        };

        if outcome != PushOutcome::Queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if outcome != PushOutcome::Dropped {
            self.notify.notify_one();
        }
        outcome
    }

    /// Non-blocking dequeue.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Runs `f` on the front frame without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.items.lock().front().map(f)
    }

    /// Waits up to `timeout` for the queue to become non-empty.
    pub async fn wait_non_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_empty();
            }
        }
    }

    /// Resolves on the next push.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames lost to overflow so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_drop_oldest_keeps_most_recent() {
        let queue = FrameQueue::new(30, OverflowPolicy::DropOldest);
        for i in 0..40u32 {
            queue.push(i);
        }

        assert_eq!(queue.len(), 30);
        assert_eq!(queue.dropped(), 10);
        let resident: Vec<u32> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(resident, (10..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_newest_keeps_first_frames() {
        let queue = FrameQueue::new(3, OverflowPolicy::DropNewest);
        assert_eq!(queue.push(1), PushOutcome::Queued);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.push(4), PushOutcome::Dropped);

        assert_eq!(queue.peek_with(|v| *v), Some(1));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_non_empty_times_out() {
        let queue: FrameQueue<u8> = FrameQueue::new(4, OverflowPolicy::DropOldest);
        assert!(!queue.wait_non_empty(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_wait_non_empty_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(4, OverflowPolicy::DropOldest));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(7u8);
        });

        assert!(queue.wait_non_empty(Duration::from_secs(5)).await);
        assert_eq!(queue.pop(), Some(7));
    }
}
