//! Channels: named pub/sub topics behind a pluggable provider.
//!
//! ARCHITECTURE
//! ============
//! A [`Channel`] is a cheap handle (`id` + provider). All fan-out lives in the
//! [`Provider`], which is injected once through [`ChannelHub`] and shared by
//! every channel handle the server creates. [`LocalProvider`] is the
//! in-process implementation; a networked backend would implement the same
//! trait.
//!
//! ORDERING
//! ========
//! Actions are serial-stamped per channel. `LocalProvider` stamps, backlogs
//! and delivers under one lock, and replays a subscriber's backlog under the
//! same lock before registering it, so each subscriber sees actions in
//! publish order with no gap between replay and live delivery.
//!
//! Events are transient: they reach live subscribers only and are never
//! replayed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Default number of actions each local channel keeps for replay.
pub const DEFAULT_CHANNEL_BACKLOG: usize = 256;

/// Identifier of one subscription.
pub type SubscriberId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is unavailable")]
    Unavailable(String),
    #[error("channel provider failed: {0}")]
    Provider(String),
}

// =============================================================================
// MESSAGES
// =============================================================================

/// What a publisher hands to the provider.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    Action(Value),
    Event { event: String, data: Value },
}

/// What a subscriber receives.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    Action { action: Value, serial: u64 },
    Event { event: String, data: Value },
}

/// Receiving end registered with a provider.
#[derive(Clone, Debug)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Subscriber {
    /// Create a subscriber and the queue its deliveries land in.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Queue a delivery. Returns `false` once the receiver is gone.
    pub fn deliver(&self, delivery: Delivery) -> bool {
        self.tx.send(delivery).is_ok()
    }
}

/// Proof that a subscribe replayed everything after the requested serial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayToken {
    /// Channel serial after the replay.
    pub serial: u64,
}

/// Outcome of [`Channel::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subscribed {
    /// Missed actions were replayed into the subscriber.
    Replayed(ReplayToken),
    /// Nothing was replayed; the subscriber needs a snapshot taken at `serial`.
    Fresh { serial: u64 },
}

impl Subscribed {
    /// The replay token, if any.
    #[must_use]
    pub fn token(&self) -> Option<ReplayToken> {
        match self {
            Self::Replayed(token) => Some(*token),
            Self::Fresh { .. } => None,
        }
    }

    /// Channel serial at subscribe time.
    #[must_use]
    pub fn serial(&self) -> u64 {
        match self {
            Self::Replayed(token) => token.serial,
            Self::Fresh { serial } => *serial,
        }
    }
}

// =============================================================================
// PROVIDER
// =============================================================================

/// Fan-out backend shared by every [`Channel`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Deliver a message to every live subscriber of `channel`.
    async fn publish(&self, channel: &str, message: ChannelMessage) -> Result<(), ChannelError>;

    /// Register `subscriber`, replaying actions after `since` when possible.
    async fn subscribe(
        &self,
        channel: &str,
        subscriber: Subscriber,
        since: Option<u64>,
    ) -> Result<Subscribed, ChannelError>;

    async fn unsubscribe(&self, channel: &str, subscriber: SubscriberId) -> Result<(), ChannelError>;
}

/// Factory of channel handles bound to one provider.
#[derive(Clone)]
pub struct ChannelHub {
    provider: Arc<dyn Provider>,
}

impl ChannelHub {
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Hub backed by an in-process [`LocalProvider`].
    #[must_use]
    pub fn local(backlog: usize) -> Self {
        Self::new(Arc::new(LocalProvider::new(backlog)))
    }

    #[must_use]
    pub fn channel(&self, id: impl Into<String>) -> Channel {
        Channel {
            id: id.into(),
            provider: Arc::clone(&self.provider),
        }
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

/// Handle to one named topic.
#[derive(Clone)]
pub struct Channel {
    id: String,
    provider: Arc<dyn Provider>,
}

impl Channel {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish a state-changing action.
    ///
    /// # Errors
    ///
    /// Returns the provider's error when the message cannot be published.
    pub async fn publish(&self, action: Value) -> Result<(), ChannelError> {
        self.provider
            .publish(&self.id, ChannelMessage::Action(action))
            .await
    }

    /// Publish a transient named event.
    ///
    /// # Errors
    ///
    /// Returns the provider's error when the message cannot be published.
    pub async fn emit(&self, event: impl Into<String>, data: Value) -> Result<(), ChannelError> {
        let message = ChannelMessage::Event {
            event: event.into(),
            data,
        };
        self.provider.publish(&self.id, message).await
    }

    /// Subscribe, replaying actions after `since` when the provider can.
    ///
    /// # Errors
    ///
    /// Returns the provider's error when the subscription cannot be made.
    pub async fn subscribe(
        &self,
        subscriber: Subscriber,
        since: Option<u64>,
    ) -> Result<Subscribed, ChannelError> {
        self.provider.subscribe(&self.id, subscriber, since).await
    }

    /// # Errors
    ///
    /// Returns the provider's error when the subscription cannot be removed.
    pub async fn unsubscribe(&self, subscriber: SubscriberId) -> Result<(), ChannelError> {
        self.provider.unsubscribe(&self.id, subscriber).await
    }
}

// =============================================================================
// LOCAL PROVIDER
// =============================================================================

#[derive(Default)]
struct Topic {
    serial: u64,
    backlog: VecDeque<(u64, Value)>,
    subscribers: Vec<Subscriber>,
}

impl Topic {
    /// Whether the backlog holds every action after `since`.
    fn covers(&self, since: u64) -> bool {
        if since > self.serial {
            return false;
        }
        let missed = self.serial - since;
        missed == 0 || self.backlog.front().is_some_and(|(serial, _)| *serial <= since + 1)
    }
}

/// In-process provider.
pub struct LocalProvider {
    backlog: usize,
    topics: Mutex<HashMap<String, Topic>>,
}

impl LocalProvider {
    #[must_use]
    pub fn new(backlog: usize) -> Self {
        Self {
            backlog,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live subscribers on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        topics.get(channel).map_or(0, |t| t.subscribers.len())
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_BACKLOG)
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn publish(&self, channel: &str, message: ChannelMessage) -> Result<(), ChannelError> {
        let mut topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let topic = topics.entry(channel.to_owned()).or_default();

        let delivery = match message {
            ChannelMessage::Action(action) => {
                topic.serial += 1;
                if self.backlog > 0 {
                    topic.backlog.push_back((topic.serial, action.clone()));
                    while topic.backlog.len() > self.backlog {
                        topic.backlog.pop_front();
                    }
                }
                Delivery::Action {
                    action,
                    serial: topic.serial,
                }
            }
            ChannelMessage::Event { event, data } => Delivery::Event { event, data },
        };

        // Closed receivers are pruned on the way through.
        topic.subscribers.retain(|s| s.deliver(delivery.clone()));
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        subscriber: Subscriber,
        since: Option<u64>,
    ) -> Result<Subscribed, ChannelError> {
        let mut topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let topic = topics.entry(channel.to_owned()).or_default();

        let outcome = match since {
            Some(since) if topic.covers(since) => {
                for (serial, action) in topic.backlog.iter().filter(|(s, _)| *s > since) {
                    subscriber.deliver(Delivery::Action {
                        action: action.clone(),
                        serial: *serial,
                    });
                }
                Subscribed::Replayed(ReplayToken {
                    serial: topic.serial,
                })
            }
            _ => Subscribed::Fresh {
                serial: topic.serial,
            },
        };

        debug!(channel, subscriber = %subscriber.id(), ?outcome, "channel: subscribed");
        topic.subscribers.push(subscriber);
        Ok(outcome)
    }

    async fn unsubscribe(&self, channel: &str, subscriber: SubscriberId) -> Result<(), ChannelError> {
        let mut topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(topic) = topics.get_mut(channel) {
            topic.subscribers.retain(|s| s.id() != subscriber);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
