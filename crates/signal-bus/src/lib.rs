//! Channel-scoped in-process message bus.
//!
//! Every topic is an inbox inside a voice channel (`<channel>/<inbox>`). The
//! local signaling relay owns the `server` inbox of a channel and each
//! participant listens on an inbox named after its peer id.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

const SERVER_INBOX: &str = "server";
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    channel: String,
    inbox: String,
}

impl Topic {
    pub fn new(channel: impl Into<String>, inbox: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            inbox: inbox.into(),
        }
    }

    pub fn server(channel: impl Into<String>) -> Self {
        Self::new(channel, SERVER_INBOX)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    pub fn is_server(&self) -> bool {
        self.inbox == SERVER_INBOX
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.inbox)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: Topic,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("no subscriber on {0}")]
    NoSubscriber(Topic),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &Topic, payload: Bytes) -> BusResult<()>;
    /// Drops every inbox of `channel`; live receivers observe `Closed`.
    fn close_channel(&self, channel: &str) -> usize;
}

/// In-memory bus backed by one broadcast channel per topic.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: RwLock<HashMap<Topic, broadcast::Sender<BusMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &Topic) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Inboxes of `channel` that currently have at least one listener.
    pub fn inboxes(&self, channel: &str) -> Vec<String> {
        let guard = self.topics.read();
        let mut inboxes: Vec<String> = guard
            .iter()
            .filter(|(topic, sender)| topic.channel == channel && sender.receiver_count() > 0)
            .map(|(topic, _)| topic.inbox.clone())
            .collect();
        inboxes.sort();
        inboxes
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &Topic, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        sender
            .send(BusMessage {
                topic: topic.clone(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::NoSubscriber(topic.clone()))
    }

    fn close_channel(&self, channel: &str) -> usize {
        let mut guard = self.topics.write();
        let before = guard.len();
        guard.retain(|topic, _| topic.channel != channel);
        before - guard.len()
    }
}

/// Receives the next message, skipping over lag notifications.
///
/// Returns `None` once every sender of the topic is gone.
pub async fn recv_next(receiver: &mut broadcast::Receiver<BusMessage>) -> Option<BusMessage> {
    loop {
        match receiver.recv().await {
            Ok(message) => return Some(message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(target = "signal_bus", skipped, "bus receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inbox_round_trip() {
        let bus = LocalBus::new();
        let topic = Topic::new("lounge", "a1");
        let mut sub = bus.subscribe(&topic);
        bus.publish(&topic, Bytes::from_static(b"ping"))
            .expect("publish ok");
        let msg = recv_next(&mut sub).await.expect("receive ok");
        assert_eq!(msg.topic, topic);
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = LocalBus::new();
        let mut lounge = bus.subscribe(&Topic::server("lounge"));
        let _other = bus.subscribe(&Topic::server("studio"));
        bus.publish(&Topic::server("studio"), Bytes::from_static(b"x"))
            .expect("publish ok");
        assert!(lounge.try_recv().is_err());
        assert_eq!(bus.inboxes("lounge"), vec!["server".to_string()]);
    }

    #[test]
    fn publish_without_listener_is_reported() {
        let bus = LocalBus::new();
        let err = bus
            .publish(&Topic::new("lounge", "ghost"), Bytes::new())
            .expect_err("no listener");
        assert!(matches!(err, BusError::NoSubscriber(topic) if topic.inbox() == "ghost"));
    }

    #[tokio::test]
    async fn closing_a_channel_ends_receivers() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(&Topic::new("lounge", "b2"));
        assert_eq!(bus.close_channel("lounge"), 1);
        assert!(recv_next(&mut sub).await.is_none());
    }
}
