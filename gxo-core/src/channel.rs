//! Managed streaming channels (spec §4.4): bounded, multi-producer,
//! broadcast-to-multiple-consumers queues connecting stream edges in the
//! DAG, with a configurable overflow policy once the buffer is full.
//!
//! `tokio::sync::mpsc` only gives us the `block` policy for free, so the
//! queue itself is hand-rolled over a `Mutex<VecDeque<_>>` plus two
//! `Notify`s — one for "became non-empty", one for "became non-full" —
//! which is the same shape the overflow policies need to implement
//! `drop_new` and `drop_oldest` without the producer blocking.

use crate::error::{GxoError, Result};
use crate::playbook::OverflowPolicy;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

struct Inner {
    queue: VecDeque<Value>,
    closed: bool,
}

/// A single producer -> fan-out-to-many-consumers stream channel.
pub struct ManagedChannel {
    inner: Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    producers_remaining: AtomicUsize,
    dropped: AtomicUsize,
}

impl ManagedChannel {
    pub fn new(capacity: usize, policy: OverflowPolicy, producer_count: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity,
            policy,
            producers_remaining: AtomicUsize::new(producer_count.max(1)),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Push a value, applying the configured overflow policy when full.
    /// `capacity == 0` means synchronous handoff (spec §3/§8): there is no
    /// buffering at all, so a send only returns once a receiver has taken
    /// the value.
    ///
    /// Errors under `OverflowPolicy::Error` when the buffer is full,
    /// under `DropNew`/`DropOldest` (the value is still dropped/evicted —
    /// the error just signals the policy fired so callers and metrics can
    /// see it), or if the channel has already been closed by all producers.
    pub async fn send(&self, value: Value) -> Result<()> {
        if self.capacity == 0 {
            return self.send_rendezvous(value).await;
        }
        loop {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(GxoError::PolicyViolation("send on closed channel".to_string()));
            }
            if inner.queue.len() < self.capacity {
                inner.queue.push_back(value);
                drop(inner);
                self.not_empty.notify_waiters();
                return Ok(());
            }
            match self.policy {
                OverflowPolicy::Block => {
                    drop(inner);
                    self.not_full.notified().await;
                    continue;
                }
                OverflowPolicy::DropNew => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(GxoError::PolicyViolation(format!(
                        "dropped new record: channel buffer full (capacity {})",
                        self.capacity
                    )));
                }
                OverflowPolicy::DropOldest => {
                    inner.queue.pop_front();
                    inner.queue.push_back(value);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    drop(inner);
                    self.not_empty.notify_waiters();
                    return Err(GxoError::PolicyViolation(format!(
                        "evicted oldest record: channel buffer full (capacity {})",
                        self.capacity
                    )));
                }
                OverflowPolicy::Error => {
                    return Err(GxoError::PolicyViolation(format!(
                        "channel buffer full (capacity {})",
                        self.capacity
                    )));
                }
            }
        }
    }

    /// `capacity == 0` handoff: a value is only ever queued one at a time,
    /// and `send` does not return until that one slot has drained, so the
    /// producer and consumer rendezvous on every record.
    async fn send_rendezvous(&self, value: Value) -> Result<()> {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(GxoError::PolicyViolation("send on closed channel".to_string()));
            }
            if inner.queue.is_empty() {
                inner.queue.push_back(value);
                drop(inner);
                self.not_empty.notify_waiters();
                break;
            }
            drop(inner);
            self.not_full.notified().await;
        }
        loop {
            self.not_full.notified().await;
            let inner = self.inner.lock().await;
            if inner.queue.is_empty() {
                return Ok(());
            }
        }
    }

    /// Pop the next value, waiting if the queue is empty and still open.
    /// Returns `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<Value> {
        loop {
            let mut inner = self.inner.lock().await;
            if let Some(v) = inner.queue.pop_front() {
                drop(inner);
                self.not_full.notify_waiters();
                return Some(v);
            }
            if inner.closed {
                return None;
            }
            drop(inner);
            self.not_empty.notified().await;
        }
    }

    /// Called by one producer when it finishes. Once every registered
    /// producer has called this, the channel closes and pending/future
    /// receivers drain remaining items then see `None`.
    pub async fn close_producer(&self) {
        if self.producers_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.lock().await.closed = true;
            self.not_empty.notify_waiters();
        }
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Owns every [`ManagedChannel`] in a run, keyed by `(producer, consumer)`
/// internal ids, so each consumer sees exactly the items its declared
/// producer emitted.
#[derive(Default)]
pub struct ChannelManager {
    channels: parking_lot::RwLock<HashMap<(String, String), Arc<ManagedChannel>>>,
    buffer_size: usize,
    policy: OverflowPolicy,
}

impl ChannelManager {
    pub fn new(buffer_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            channels: parking_lot::RwLock::new(HashMap::new()),
            buffer_size,
            policy,
        }
    }

    /// Get or create the channel for a given producer/consumer pair.
    pub fn channel(&self, producer: &str, consumer: &str) -> Arc<ManagedChannel> {
        let key = (producer.to_string(), consumer.to_string());
        if let Some(ch) = self.channels.read().get(&key) {
            return ch.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(key)
            .or_insert_with(|| Arc::new(ManagedChannel::new(self.buffer_size, self.policy, 1)))
            .clone()
    }

    pub async fn close_producer(&self, producer: &str) {
        let to_close: Vec<_> = self
            .channels
            .read()
            .iter()
            .filter(|((p, _), _)| p == producer)
            .map(|(_, ch)| ch.clone())
            .collect();
        for ch in to_close {
            ch.close_producer().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn send_recv_round_trip() {
        let ch = ManagedChannel::new(4, OverflowPolicy::Block, 1);
        ch.send(json!(1)).await.unwrap();
        ch.send(json!(2)).await.unwrap();
        assert_eq!(ch.recv().await, Some(json!(1)));
        assert_eq!(ch.recv().await, Some(json!(2)));
    }

    #[tokio::test]
    async fn close_after_drain_yields_none() {
        let ch = ManagedChannel::new(4, OverflowPolicy::Block, 1);
        ch.send(json!("x")).await.unwrap();
        ch.close_producer().await;
        assert_eq!(ch.recv().await, Some(json!("x")));
        assert_eq!(ch.recv().await, None);
    }

    #[tokio::test]
    async fn drop_new_discards_when_full() {
        let ch = ManagedChannel::new(1, OverflowPolicy::DropNew, 1);
        ch.send(json!(1)).await.unwrap();
        assert!(matches!(ch.send(json!(2)).await, Err(GxoError::PolicyViolation(_))));
        assert_eq!(ch.dropped_count(), 1);
        assert_eq!(ch.recv().await, Some(json!(1)));
    }

    #[tokio::test]
    async fn drop_oldest_evicts_front() {
        let ch = ManagedChannel::new(1, OverflowPolicy::DropOldest, 1);
        ch.send(json!(1)).await.unwrap();
        assert!(matches!(ch.send(json!(2)).await, Err(GxoError::PolicyViolation(_))));
        assert_eq!(ch.dropped_count(), 1);
        assert_eq!(ch.recv().await, Some(json!(2)));
    }

    #[tokio::test]
    async fn zero_capacity_is_synchronous_handoff() {
        let ch = Arc::new(ManagedChannel::new(0, OverflowPolicy::Block, 1));
        let sent = Arc::new(AtomicBool::new(false));
        let send_ch = ch.clone();
        let send_sent = sent.clone();
        let handle = tokio::spawn(async move {
            send_ch.send(json!("x")).await.unwrap();
            send_sent.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sent.load(Ordering::SeqCst), "send must block until the value is taken");

        assert_eq!(ch.recv().await, Some(json!("x")));
        handle.await.unwrap();
        assert!(sent.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn error_policy_rejects_overflow() {
        let ch = ManagedChannel::new(1, OverflowPolicy::Error, 1);
        ch.send(json!(1)).await.unwrap();
        assert!(matches!(ch.send(json!(2)).await, Err(GxoError::PolicyViolation(_))));
    }

    #[tokio::test]
    async fn manager_reuses_channel_for_same_pair() {
        let mgr = ChannelManager::new(4, OverflowPolicy::Block);
        let a = mgr.channel("p", "c");
        let b = mgr.channel("p", "c");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn manager_close_producer_closes_its_channels() {
        let mgr = ChannelManager::new(4, OverflowPolicy::Block);
        let ch = mgr.channel("p", "c");
        ch.send(json!(1)).await.unwrap();
        mgr.close_producer("p").await;
        assert_eq!(ch.recv().await, Some(json!(1)));
        assert_eq!(ch.recv().await, None);
    }
}
