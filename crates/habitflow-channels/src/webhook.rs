//! Webhook Channel — POST a JSON event for every reminder.

use async_trait::async_trait;
use habitflow_core::config::WebhookDeliveryConfig;
use habitflow_core::error::{HabitflowError, Result};
use habitflow_core::traits::DeliveryChannel;
use habitflow_core::types::{MessageId, Notification, OverdueAt, Recipient};

pub struct WebhookChannel {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: &WebhookDeliveryConfig) -> Self {
        Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// POST a payload to the configured URL.
    async fn post(&self, payload: serde_json::Value) -> Result<MessageId> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut req = self
            .client
            .post(&self.url)
            .header("X-Habitflow-Delivery", id.as_str())
            .json(&payload)
            .timeout(std::time::Duration::from_secs(10));

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| HabitflowError::Delivery(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook delivered to {}", self.url);
            Ok(MessageId(id))
        } else {
            let status = resp.status();
            Err(HabitflowError::Delivery(format!("Webhook error {status}")))
        }
    }
}

/// JSON body for a task reminder event.
pub fn reminder_payload(recipient: &Recipient, task: &str, label: &str) -> serde_json::Value {
    serde_json::json!({
        "event": "task.reminder",
        "recipient": recipient.user_id,
        "email": recipient.email,
        "task": task,
        "label": label,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

/// JSON body for a task overdue event.
pub fn overdue_payload(recipient: &Recipient, task: &str, overdue: OverdueAt) -> serde_json::Value {
    serde_json::json!({
        "event": "task.overdue",
        "recipient": recipient.user_id,
        "email": recipient.email,
        "task": task,
        "overdue": overdue,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_reminder(
        &self,
        recipient: &Recipient,
        task_description: &str,
        label: &str,
    ) -> Result<MessageId> {
        self.post(reminder_payload(recipient, task_description, label))
            .await
    }

    async fn send_overdue_notice(
        &self,
        recipient: &Recipient,
        task_description: &str,
        overdue: OverdueAt,
    ) -> Result<MessageId> {
        self.post(overdue_payload(recipient, task_description, overdue))
            .await
    }

    async fn send_notification(&self, notification: &Notification) -> Result<Option<MessageId>> {
        let payload = serde_json::json!({
            "event": format!("notification.{}", notification.event_type),
            "recipient": notification.receiver_id,
            "actor": notification.actor_id,
            "message": notification.message,
            "subject_id": notification.subject_id,
            "timestamp": notification.created_at.to_rfc3339(),
        });
        self.post(payload).await.map(Some)
    }
}
