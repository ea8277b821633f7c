//! Delivery channel trait — the last hop of the dispatch queue.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{MessageId, Notification, OverdueAt, Recipient};

/// A transport that delivers reminders to a user (email, webhook, in-app inbox).
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Channel name used in logs ("email", "webhook", "in_app").
    fn name(&self) -> &str;

    /// Remind the recipient that `label` ("2 hours", "30 minutes") has passed
    /// or remains for the task.
    async fn send_reminder(
        &self,
        recipient: &Recipient,
        task_description: &str,
        label: &str,
    ) -> Result<MessageId>;

    /// Tell the recipient the task is overdue.
    async fn send_overdue_notice(
        &self,
        recipient: &Recipient,
        task_description: &str,
        overdue: OverdueAt,
    ) -> Result<MessageId>;

    /// Deliver a generic social notification. Channels that only carry task
    /// reminders return `Ok(None)` and are skipped.
    async fn send_notification(&self, notification: &Notification) -> Result<Option<MessageId>> {
        let _ = notification;
        Ok(None)
    }
}
