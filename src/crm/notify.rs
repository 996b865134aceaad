//! Operator notification channel
//!
//! `send_admin_notification` actions and human handovers report to operators
//! through an [`AdminNotifier`]. Delivery is fire-and-forget from the engine's
//! point of view: errors are logged by the caller and never abort a flow.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,
    #[error("notification channel full")]
    Full,
}

/// Why an operator is being notified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Emitted by a flow action
    FlowAction,
    /// A contact was handed over to a human agent
    HumanHandover,
}

/// A message for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminNotification {
    pub kind: NotificationKind,
    /// Contact the notification is about
    pub contact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_name: Option<String>,
    pub message: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl AdminNotification {
    pub fn new(kind: NotificationKind, contact_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            contact_id: contact_id.into(),
            flow_name: None,
            message: message.into(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_flow(mut self, flow_name: impl Into<String>) -> Self {
        self.flow_name = Some(flow_name.into());
        self
    }
}

/// Delivers notifications to operators
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify(&self, notification: AdminNotification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl AdminNotifier for LogNotifier {
    async fn notify(&self, notification: AdminNotification) -> Result<(), NotifyError> {
        info!(
            contact = %notification.contact_id,
            flow = notification.flow_name.as_deref().unwrap_or("-"),
            kind = ?notification.kind,
            message = %notification.message,
            "admin notification"
        );
        Ok(())
    }
}

/// Forwards notifications to an mpsc channel without waiting
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<AdminNotification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<AdminNotification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl AdminNotifier for ChannelNotifier {
    async fn notify(&self, notification: AdminNotification) -> Result<(), NotifyError> {
        self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::Full,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (tx, mut rx) = mpsc::channel(4);
        let notifier = ChannelNotifier::new(tx);
        notifier
            .notify(AdminNotification::new(NotificationKind::FlowAction, "2637", "lead").with_flow("f"))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "lead");
        assert_eq!(received.flow_name.as_deref(), Some("f"));
    }

    #[tokio::test]
    async fn test_channel_notifier_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let notifier = ChannelNotifier::new(tx);
        let result = notifier
            .notify(AdminNotification::new(NotificationKind::HumanHandover, "2637", "help"))
            .await;
        assert!(matches!(result, Err(NotifyError::Closed)));
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let result = LogNotifier
            .notify(AdminNotification::new(NotificationKind::FlowAction, "2637", "x"))
            .await;
        assert!(result.is_ok());
    }
}
