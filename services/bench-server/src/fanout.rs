//! Per-subscriber bounded fan-out sink (spec.md §4.3, §5).
//!
//! Adapts the corpus's `EventBus` (a `broadcast::Sender` keyed by stream)
//! to per-client delivery: a shared broadcast channel gives every lagging
//! receiver the same drop count, but spec.md requires backpressure
//! isolation per subscriber, so each one gets its own bounded queue that
//! drops its own oldest entry when full instead of penalizing everyone
//! else on the same device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use bench_protocol::ServerMessage;

const DEFAULT_CAPACITY: usize = 64;

struct Inner {
    queue: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// A single client's delivery sink for one device session. Cloning shares
/// the same queue; `send` never blocks the caller on a slow reader.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<Inner>,
}

impl Subscriber {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Subscriber {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
                notify: Notify::new(),
                capacity,
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a message, dropping the oldest buffered one if already full.
    pub async fn send(&self, msg: ServerMessage) {
        let mut q = self.inner.queue.lock().await;
        if q.len() >= self.inner.capacity {
            q.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(msg);
        drop(q);
        self.inner.notify.notify_one();
    }

    /// Await the next queued message, or `None` once `close` has been
    /// called and the queue has drained.
    pub async fn recv(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut q = self.inner.queue.lock().await;
                if let Some(msg) = q.pop_front() {
                    return Some(msg);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str) -> ServerMessage {
        ServerMessage::Field {
            device_id: "d1".into(),
            field: name.into(),
            value: serde_json::json!(true),
        }
    }

    #[tokio::test]
    async fn send_then_recv_preserves_order() {
        let sub = Subscriber::with_capacity(4);
        sub.send(field("a")).await;
        sub.send(field("b")).await;
        assert_eq!(sub.recv().await, Some(field("a")));
        assert_eq!(sub.recv().await, Some(field("b")));
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let sub = Subscriber::with_capacity(2);
        sub.send(field("a")).await;
        sub.send(field("b")).await;
        sub.send(field("c")).await;
        assert_eq!(sub.recv().await, Some(field("b")));
        assert_eq!(sub.recv().await, Some(field("c")));
        assert_eq!(sub.dropped_count(), 1);
    }

    #[tokio::test]
    async fn close_drains_then_returns_none() {
        let sub = Subscriber::with_capacity(4);
        sub.send(field("a")).await;
        sub.close();
        assert_eq!(sub.recv().await, Some(field("a")));
        assert_eq!(sub.recv().await, None);
    }
}
