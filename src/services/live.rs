// src/services/live.rs

//! Live broadcast of crawl results.
//!
//! Cross-instance fan-out (the cache cluster) sits behind [`LiveChannel`];
//! [`BroadcastChannel`] fans out to subscribers in this process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::models::Identity;

/// Event pushed to connected live clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    /// New content was stored for an identity
    Crawled {
        identity: Identity,
        version: String,
        crawled_at: DateTime<Utc>,
    },
}

#[async_trait]
pub trait LiveChannel: Send + Sync {
    /// Publish to every connected client. Having no clients is not an error.
    async fn publish(&self, event: LiveEvent) -> Result<()>;
}

/// In-process fan-out on a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    sender: broadcast::Sender<LiveEvent>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl LiveChannel for BroadcastChannel {
    async fn publish(&self, event: LiveEvent) -> Result<()> {
        match self.sender.send(event) {
            Ok(receivers) => log::debug!("Live event sent to {} subscribers", receivers),
            Err(_) => log::debug!("Live event dropped, no subscribers"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> LiveEvent {
        LiveEvent::Crawled {
            identity: "npm:pkg-a".parse().unwrap(),
            version: "1.0.0".into(),
            crawled_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let channel = BroadcastChannel::new(8);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.publish(event()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), event());
        assert_eq!(b.recv().await.unwrap(), event());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        assert!(BroadcastChannel::default().publish(event()).await.is_ok());
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["type"], "crawled");
        assert_eq!(json["identity"], "npm:pkg-a");
    }
}
