//! Publish/subscribe notification store.
//!
//! Owned by whoever builds the engine. Keeps a bounded history for late readers
//! and fans every new notification out to live subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, system_clock};

const DEFAULT_CAPACITY: usize = 100;

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub struct NotificationCenter {
    history: RwLock<VecDeque<Notification>>,
    capacity: usize,
    sender: broadcast::Sender<Notification>,
    clock: Arc<dyn Clock>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Keep at most `capacity` notifications in history.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_clock(capacity, system_clock())
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            sender,
            clock,
        }
    }

    pub async fn publish(
        &self,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            level,
            title: title.into(),
            message: message.into(),
            timestamp: self.clock.now(),
        };

        {
            let mut history = self.history.write().await;
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(notification.clone());
        }

        // No subscribers is fine
        let delivered = self.sender.send(notification.clone()).unwrap_or(0);
        debug!(
            id = %notification.id,
            level = %level,
            delivered,
            "Notification published"
        );
        notification
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// History, oldest first.
    pub async fn list(&self) -> Vec<Notification> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn dismiss(&self, id: &str) -> bool {
        let mut history = self.history.write().await;
        let before = history.len();
        history.retain(|n| n.id != id);
        history.len() != before
    }

    pub async fn clear(&self) {
        self.history.write().await.clear();
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let center = NotificationCenter::new();
        let mut rx = center.subscribe();

        let sent = center
            .publish(NotificationLevel::Error, "Command failed", "delete:item:x")
            .await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received, sent);
        assert_eq!(center.list().await, vec![sent]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let center = NotificationCenter::with_capacity(2);
        for i in 0..3 {
            center
                .publish(NotificationLevel::Info, format!("n{}", i), "")
                .await;
        }
        let titles: Vec<String> = center.list().await.into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[test]
    fn test_dismiss_and_clear() {
        tokio_test::block_on(async {
            let center = NotificationCenter::new();
            let a = center.publish(NotificationLevel::Warning, "a", "").await;
            center.publish(NotificationLevel::Success, "b", "").await;

            assert!(center.dismiss(&a.id).await);
            assert!(!center.dismiss(&a.id).await);
            assert_eq!(center.list().await.len(), 1);

            center.clear().await;
            assert!(center.list().await.is_empty());
        });
    }
}
