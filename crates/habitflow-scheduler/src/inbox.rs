//! In-app notification inbox and the delivery channel that writes to it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use habitflow_core::clock::Clock;
use habitflow_core::error::Result;
use habitflow_core::traits::DeliveryChannel;
use habitflow_core::types::{MessageId, Notification, OverdueAt, Recipient};
use serde::{Deserialize, Serialize};

/// Event type recorded for task reminders and overdue notices.
pub const TASK_EVENT: &str = "task";

/// A stored notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: i64,
    #[serde(flatten)]
    pub notification: Notification,
    pub read: bool,
}

/// Where in-app notifications are kept.
#[async_trait]
pub trait NotificationInbox: Send + Sync {
    /// Store a notification and return its ID.
    async fn record(&self, notification: &Notification) -> Result<i64>;

    /// A user's notifications, newest first.
    async fn list(&self, receiver_id: &str, unread_only: bool) -> Result<Vec<InboxEntry>>;

    /// Mark one notification read. Returns false if it does not belong to
    /// `receiver_id` or does not exist.
    async fn mark_read(&self, receiver_id: &str, id: i64) -> Result<bool>;

    /// Mark everything read for a user, returning how many changed.
    async fn mark_all_read(&self, receiver_id: &str) -> Result<usize>;
}

/// In-memory inbox.
#[derive(Default)]
pub struct MemoryInbox {
    entries: Mutex<Vec<InboxEntry>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<InboxEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl NotificationInbox for MemoryInbox {
    async fn record(&self, notification: &Notification) -> Result<i64> {
        let mut entries = self.entries();
        let id = entries.len() as i64 + 1;
        entries.push(InboxEntry {
            id,
            notification: notification.clone(),
            read: false,
        });
        Ok(id)
    }

    async fn list(&self, receiver_id: &str, unread_only: bool) -> Result<Vec<InboxEntry>> {
        let mut found: Vec<InboxEntry> = self
            .entries()
            .iter()
            .filter(|e| e.notification.receiver_id == receiver_id && (!unread_only || !e.read))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.notification
                .created_at
                .cmp(&a.notification.created_at)
                .then(b.id.cmp(&a.id))
        });
        Ok(found)
    }

    async fn mark_read(&self, receiver_id: &str, id: i64) -> Result<bool> {
        let mut entries = self.entries();
        match entries
            .iter_mut()
            .find(|e| e.id == id && e.notification.receiver_id == receiver_id)
        {
            Some(entry) => {
                entry.read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_all_read(&self, receiver_id: &str) -> Result<usize> {
        let mut changed = 0;
        for entry in self.entries().iter_mut() {
            if entry.notification.receiver_id == receiver_id && !entry.read {
                entry.read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

pub fn reminder_message(task: &str, label: &str) -> String {
    format!("Reminder ({label}): you haven't completed your task \"{task}\" yet.")
}

pub fn overdue_message(task: &str) -> String {
    format!("Your task \"{task}\" is due.")
}

/// Delivery channel backed by a [`NotificationInbox`]. The only channel
/// that carries social notifications.
pub struct InAppChannel {
    inbox: Arc<dyn NotificationInbox>,
    clock: Arc<dyn Clock>,
}

impl InAppChannel {
    pub fn new(inbox: Arc<dyn NotificationInbox>, clock: Arc<dyn Clock>) -> Self {
        Self { inbox, clock }
    }

    async fn record_task_event(&self, recipient: &Recipient, message: String) -> Result<MessageId> {
        let notification = Notification {
            receiver_id: recipient.user_id.clone(),
            actor_id: recipient.user_id.clone(),
            event_type: TASK_EVENT.into(),
            message,
            subject_id: None,
            created_at: self.clock.now(),
        };
        let id = self.inbox.record(&notification).await?;
        Ok(MessageId(format!("inapp-{id}")))
    }
}

#[async_trait]
impl DeliveryChannel for InAppChannel {
    fn name(&self) -> &str {
        "in_app"
    }

    async fn send_reminder(
        &self,
        recipient: &Recipient,
        task_description: &str,
        label: &str,
    ) -> Result<MessageId> {
        self.record_task_event(recipient, reminder_message(task_description, label))
            .await
    }

    async fn send_overdue_notice(
        &self,
        recipient: &Recipient,
        task_description: &str,
        _overdue: OverdueAt,
    ) -> Result<MessageId> {
        self.record_task_event(recipient, overdue_message(task_description))
            .await
    }

    async fn send_notification(&self, notification: &Notification) -> Result<Option<MessageId>> {
        let id = self.inbox.record(notification).await?;
        tracing::debug!(
            "🔔 In-app {} notification for {}",
            notification.event_type,
            notification.receiver_id
        );
        Ok(Some(MessageId(format!("inapp-{id}"))))
    }
}
