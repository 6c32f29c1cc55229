use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A lightweight, user-visible message (the storefront renders these as toasts).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub message: String,
    #[serde(rename = "type")]
    pub level: NotificationLevel,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Success,
    Info,
    Warning,
    Error,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: message.into(),
            level,
            created_at: Utc::now(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Success, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, message)
    }
}

/// Notification service errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("No subscriber is listening for notifications")]
    NoSubscribers,
    #[error("Internal error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// Fire a notification and only log if delivery failed; a lost toast must
/// never fail the operation that produced it.
pub async fn notify(service: &dyn NotificationService, notification: Notification) {
    if let Err(e) = service.send(notification).await {
        warn!("Notification not delivered: {}", e);
    }
}

/// Fans notifications out to every UI subscriber.
#[derive(Clone)]
pub struct BroadcastNotificationService {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotificationService {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotificationService {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl NotificationService for BroadcastNotificationService {
    async fn send(&self, notification: Notification) -> Result<(), NotificationError> {
        self.sender
            .send(notification)
            .map(|_| ())
            .map_err(|_| NotificationError::NoSubscribers)
    }
}

/// Writes notifications to the log only. Used by headless hosts.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationService;

#[async_trait]
impl NotificationService for LogNotificationService {
    async fn send(&self, notification: Notification) -> Result<(), NotificationError> {
        match notification.level {
            NotificationLevel::Error => error!(message = %notification.message, "notification"),
            NotificationLevel::Warning => warn!(message = %notification.message, "notification"),
            _ => info!(message = %notification.message, "notification"),
        }
        Ok(())
    }
}

/// Keeps every notification in memory; handy for tests and for hosts that
/// render a notification history.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotificationService {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count_at(&self, level: NotificationLevel) -> usize {
        self.sent().iter().filter(|n| n.level == level).count()
    }
}

#[async_trait]
impl NotificationService for RecordingNotificationService {
    async fn send(&self, notification: Notification) -> Result<(), NotificationError> {
        let mut sent = match self.sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sent.push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let service = BroadcastNotificationService::new(8);
        let mut rx = service.subscribe();
        service
            .send(Notification::success("Added to cart"))
            .await
            .expect("subscriber present");
        let received = rx.recv().await.expect("notification");
        assert_eq!(received.message, "Added to cart");
        assert_eq!(received.level, NotificationLevel::Success);
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_errors_but_notify_swallows() {
        let service = BroadcastNotificationService::new(8);
        assert!(service.send(Notification::info("hello")).await.is_err());
        notify(&service, Notification::info("hello")).await;
    }

    #[tokio::test]
    async fn recording_service_counts_levels() {
        let service = RecordingNotificationService::new();
        notify(&service, Notification::error("boom")).await;
        notify(&service, Notification::warning("careful")).await;
        notify(&service, Notification::warning("again")).await;
        assert_eq!(service.count_at(NotificationLevel::Warning), 2);
        assert_eq!(service.count_at(NotificationLevel::Error), 1);
    }

    #[test]
    fn serializes_level_as_type() {
        let json = serde_json::to_value(Notification::warning("low stock")).expect("serialize");
        assert_eq!(json["type"], "warning");
    }
}
