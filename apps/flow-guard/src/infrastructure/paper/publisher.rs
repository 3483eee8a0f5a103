//! In-process pub/sub transport.
//!
//! Each named channel is a tokio broadcast channel created on first use.
//! Publishing with no subscribers succeeds; the message is counted as
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::application::ports::{MarketDataPublisher, PublishError};

/// Publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelPublisherStats {
    /// Channels created.
    pub channels: usize,
    /// Messages delivered to at least one subscriber.
    pub delivered: u64,
    /// Messages published with no subscriber.
    pub dropped: u64,
    /// Active subscribers across every channel.
    pub receivers: usize,
}

/// Publisher backed by one broadcast channel per pub/sub channel.
#[derive(Debug)]
pub struct ChannelPublisher {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelPublisher {
    /// Create a publisher whose channels buffer `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Get a new receiver for `channel`.
    #[must_use]
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    /// Number of active receivers on `channel`.
    #[must_use]
    pub fn receiver_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Get publisher counters.
    #[must_use]
    pub fn stats(&self) -> ChannelPublisherStats {
        let channels = self.channels.read();
        ChannelPublisherStats {
            channels: channels.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            receivers: channels.values().map(broadcast::Sender::receiver_count).sum(),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        if let Some(tx) = self.channels.read().get(channel) {
            return tx.clone();
        }

        self.channels
            .write()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl MarketDataPublisher for ChannelPublisher {
    async fn publish(&self, channel: &str, message: String) -> Result<(), PublishError> {
        if self.sender(channel).send(message).is_ok() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(channel, "No subscribers, message dropped");
        }
        Ok(())
    }
}
