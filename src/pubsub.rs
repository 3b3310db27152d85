//! Pub/Sub tap (C10): demultiplexes RESP3 push frames arriving on any
//! connection to the subscribers that asked for them, keyed by `(mode,
//! channel)` (spec §4.10).
//!
//! Every [`crate::connection::Connection`] forwards whatever push frames its
//! read pump observes onto one shared `mpsc` channel; [`PubSubTap::spawn`]
//! drains that channel on a dedicated task and fans each delivery out to the
//! bounded per-subscriber ring buffers registered below. A slow subscriber
//! drops its own oldest undelivered message rather than back-pressuring the
//! shared channel (spec §4.10 "overflow drops oldest with a counter") — this
//! keeps one stalled consumer from stalling pub/sub delivery for every
//! connection. The ring buffer is a plain `Mutex<VecDeque>` plus a
//! [`tokio::sync::Notify`] rather than a bounded `mpsc::Sender`, since
//! `mpsc`'s full-queue behaviour is to make the *sender* wait or fail, not to
//! evict the oldest queued item — the spec calls for the latter.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};

use crate::value::{PushKind, Value};

/// The three subscription namespaces the spec's dispatch table distinguishes
/// (glossary: `message`/`pmessage`/`smessage`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Exact,
    Pattern,
    Sharded,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriberKey {
    kind: SubscriptionKind,
    channel: Vec<u8>,
}

/// One delivered pub/sub message, already stripped of its push-frame wrapper.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub kind: SubscriptionKind,
    /// The channel the message arrived on (for `Pattern`, the concrete
    /// channel that matched, not the pattern itself).
    pub channel: Vec<u8>,
    /// The pattern that matched, for `Pattern` deliveries only.
    pub pattern: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Depth of a single subscriber's queue before the oldest message is dropped
/// (spec §4.10 "bounded queue; overflow drops oldest").
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

struct Mailbox {
    queue: Mutex<VecDeque<PubSubMessage>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::with_capacity(SUBSCRIBER_QUEUE_DEPTH)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, message: PubSubMessage) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= SUBSCRIBER_QUEUE_DEPTH {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    async fn recv(&self) -> PubSubMessage {
        loop {
            if let Some(message) = self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

/// A receiver handle returned to the caller of `subscribe`. Dropping it
/// deregisters the subscription.
pub struct Subscription {
    kind: SubscriptionKind,
    channel: Vec<u8>,
    registry: Arc<DashMap<SubscriberKey, Vec<Arc<Mailbox>>>>,
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        Some(self.mailbox.recv().await)
    }

    /// Count of messages dropped because this subscriber's queue was full
    /// (spec §4.10's overflow counter).
    pub fn dropped_count(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(mut subs) = self.registry.get_mut(&SubscriberKey {
            kind: self.kind,
            channel: self.channel.clone(),
        }) {
            subs.retain(|m| !Arc::ptr_eq(m, &self.mailbox));
        }
    }
}

/// Demultiplexer state, shared by every connection's read pump and the
/// dedicated dispatch task spawned by [`PubSubTap::spawn`].
pub struct PubSubTap {
    subscribers: Arc<DashMap<SubscriberKey, Vec<Arc<Mailbox>>>>,
}

impl PubSubTap {
    pub fn new() -> (Self, mpsc::UnboundedSender<(SocketAddr, Value)>, mpsc::UnboundedReceiver<(SocketAddr, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PubSubTap {
                subscribers: Arc::new(DashMap::new()),
            },
            tx,
            rx,
        )
    }

    /// Register a new subscriber for `(kind, channel)`. The caller is
    /// responsible for having already sent the corresponding
    /// `SUBSCRIBE`/`PSUBSCRIBE`/`SSUBSCRIBE` command on a connection; this
    /// only wires up local delivery.
    pub fn subscribe(&self, kind: SubscriptionKind, channel: Vec<u8>) -> Subscription {
        let mailbox = Arc::new(Mailbox::new());
        self.subscribers
            .entry(SubscriberKey { kind, channel: channel.clone() })
            .or_default()
            .push(mailbox.clone());
        Subscription {
            kind,
            channel,
            registry: self.subscribers.clone(),
            mailbox,
        }
    }

    /// Spawn the dispatch task that drains `push_rx` (fed by every
    /// connection's read pump) and fans deliveries out to registered
    /// subscribers. Subscribe/unsubscribe *acks* (`PushKind::has_reply`) are
    /// not deliveries and are dropped here; in ordinary operation they never
    /// reach the push channel at all (the connection's reply path consumes
    /// them), but a server that sends one unsolicited is defensively ignored
    /// rather than misdelivered as a message.
    pub fn spawn(self: Arc<Self>, mut push_rx: mpsc::UnboundedReceiver<(SocketAddr, Value)>) {
        tokio::spawn(async move {
            while let Some((_addr, value)) = push_rx.recv().await {
                let Value::Push { kind, data } = value else { continue };
                if kind.has_reply() {
                    continue;
                }
                if let Some(message) = Self::decode_delivery(kind, data) {
                    self.dispatch(message);
                }
            }
        });
    }

    fn decode_delivery(kind: PushKind, mut data: Vec<Value>) -> Option<PubSubMessage> {
        match kind {
            PushKind::Message if data.len() >= 2 => {
                let payload = take_bulk(data.pop()?)?;
                let channel = take_bulk(data.pop()?)?;
                Some(PubSubMessage { kind: SubscriptionKind::Exact, channel, pattern: None, payload })
            }
            PushKind::SMessage if data.len() >= 2 => {
                let payload = take_bulk(data.pop()?)?;
                let channel = take_bulk(data.pop()?)?;
                Some(PubSubMessage { kind: SubscriptionKind::Sharded, channel, pattern: None, payload })
            }
            PushKind::PMessage if data.len() >= 3 => {
                let payload = take_bulk(data.pop()?)?;
                let channel = take_bulk(data.pop()?)?;
                let pattern = take_bulk(data.pop()?)?;
                Some(PubSubMessage {
                    kind: SubscriptionKind::Pattern,
                    channel,
                    pattern: Some(pattern),
                    payload,
                })
            }
            _ => None,
        }
    }

    fn dispatch(&self, message: PubSubMessage) {
        let key = SubscriberKey {
            kind: message.kind,
            channel: match message.kind {
                SubscriptionKind::Pattern => message.pattern.clone().unwrap_or_default(),
                _ => message.channel.clone(),
            },
        };
        if let Some(subs) = self.subscribers.get(&key) {
            for mailbox in subs.iter() {
                mailbox.push(message.clone());
            }
        }
    }

    /// Total subscriber count, across every channel/pattern — exposed for
    /// `get_stats()` (spec §6).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.value().len()).sum()
    }

    /// Re-apply every still-registered subscription on a newly `Ready`
    /// connection (spec §4.10 "Resubscription is re-applied on every new
    /// connection"). Returns the `(kind, channel)` pairs the caller should
    /// re-issue `SUBSCRIBE`/`PSUBSCRIBE`/`SSUBSCRIBE` for.
    pub fn active_subscriptions(&self) -> Vec<(SubscriptionKind, Vec<u8>)> {
        self.subscribers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().kind, entry.key().channel.clone()))
            .collect()
    }
}

fn take_bulk(value: Value) -> Option<Vec<u8>> {
    match value {
        Value::Bulk(b) => Some(b),
        Value::SimpleString(s) => Some(s.into_bytes()),
        _ => None,
    }
}

/// Groups subscription specs by kind for building resubscribe commands on
/// handshake (spec §4.2); kept here rather than in `config.rs` since it is
/// pub/sub-specific bookkeeping.
pub fn group_by_kind(specs: &[(SubscriptionKind, Vec<u8>)]) -> HashMap<SubscriptionKind, Vec<Vec<u8>>> {
    let mut grouped: HashMap<SubscriptionKind, Vec<Vec<u8>>> = HashMap::new();
    for (kind, channel) in specs {
        grouped.entry(*kind).or_default().push(channel.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(kind: PushKind, parts: &[&[u8]]) -> Value {
        Value::Push {
            kind,
            data: parts.iter().map(|p| Value::Bulk(p.to_vec())).collect(),
        }
    }

    #[tokio::test]
    async fn message_push_is_delivered_to_matching_subscriber() {
        let (tap, push_tx, push_rx) = PubSubTap::new();
        let tap = Arc::new(tap);
        let mut sub = tap.subscribe(SubscriptionKind::Exact, b"news".to_vec());
        tap.clone().spawn(push_rx);

        let addr: SocketAddr = "127.0.0.1:6379".parse().unwrap();
        push_tx.send((addr, push(PushKind::Message, &[b"news", b"hello"]))).unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.channel, b"news");
        assert_eq!(message.payload, b"hello");
    }

    #[tokio::test]
    async fn subscribe_acks_are_not_delivered_as_messages() {
        let (tap, push_tx, push_rx) = PubSubTap::new();
        let tap = Arc::new(tap);
        let mut sub = tap.subscribe(SubscriptionKind::Exact, b"news".to_vec());
        tap.clone().spawn(push_rx);

        let addr: SocketAddr = "127.0.0.1:6379".parse().unwrap();
        push_tx
            .send((addr, push(PushKind::Subscribe, &[b"news", b"1"])))
            .unwrap();
        push_tx
            .send((addr, push(PushKind::Message, &[b"news", b"real"])))
            .unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, b"real");
    }

    #[tokio::test]
    async fn pattern_message_carries_both_pattern_and_channel() {
        let (tap, push_tx, push_rx) = PubSubTap::new();
        let tap = Arc::new(tap);
        let mut sub = tap.subscribe(SubscriptionKind::Pattern, b"news.*".to_vec());
        tap.clone().spawn(push_rx);

        let addr: SocketAddr = "127.0.0.1:6379".parse().unwrap();
        push_tx
            .send((addr, push(PushKind::PMessage, &[b"news.*", b"news.sports", b"goal"])))
            .unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.pattern.as_deref(), Some(&b"news.*"[..]));
        assert_eq!(message.channel, b"news.sports");
        assert_eq!(message.payload, b"goal");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let (tap, _push_tx, _push_rx) = PubSubTap::new();
        let sub = tap.subscribe(SubscriptionKind::Exact, b"news".to_vec());
        for i in 0..(SUBSCRIBER_QUEUE_DEPTH + 5) {
            sub.mailbox.push(PubSubMessage {
                kind: SubscriptionKind::Exact,
                channel: b"news".to_vec(),
                pattern: None,
                payload: i.to_string().into_bytes(),
            });
        }
        assert_eq!(sub.dropped_count(), 5);
        assert_eq!(sub.mailbox.queue.lock().unwrap().len(), SUBSCRIBER_QUEUE_DEPTH);
    }
}
