//! Email Channel — task reminders and overdue notices over SMTP.
//!
//! Sends via async lettre (STARTTLS relay). Message bodies are rendered by
//! plain functions so they can be tested without a mail server.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::FixedOffset;
use habitflow_core::clock::{Clock, SystemClock, hours_remaining_today, reference_offset};
use habitflow_core::config::EmailDeliveryConfig;
use habitflow_core::error::{HabitflowError, Result};
use habitflow_core::traits::DeliveryChannel;
use habitflow_core::types::{MessageId, OverdueAt, Recipient};

/// A rendered email ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Render the reminder email for a task.
pub fn render_reminder(to: &str, task: &str, label: &str, hours_left_today: u32) -> EmailMessage {
    let plural = if hours_left_today == 1 { "" } else { "s" };
    EmailMessage {
        to: to.to_string(),
        subject: "Task Reminder".into(),
        body: format!(
            "⏰ Task Reminder ({label})\n\n\
             This is a friendly reminder about your task:\n\n    \"{task}\"\n\n\
             You have about {hours_left_today} hour{plural} left before the day ends. Keep going!\n\n\
             — The Habitflow Team\n\
             This is an automated reminder. Please don't reply to this email."
        ),
    }
}

/// Render the overdue notice for a task.
pub fn render_overdue(to: &str, task: &str, overdue: OverdueAt) -> EmailMessage {
    EmailMessage {
        to: to.to_string(),
        subject: "Task Overdue".into(),
        body: format!(
            "⌛ Your task \"{task}\" is overdue since {overdue}.\n\n\
             Mark it complete when you're done, or plan it again for tomorrow.\n\n\
             — The Habitflow Team\n\
             This is an automated message. Please don't reply to this email."
        ),
    }
}

/// Email channel — SMTP sending only.
pub struct EmailChannel {
    config: EmailDeliveryConfig,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl EmailChannel {
    pub fn new(config: EmailDeliveryConfig, utc_offset_minutes: i32) -> Self {
        Self::with_clock(config, utc_offset_minutes, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: EmailDeliveryConfig,
        utc_offset_minutes: i32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            clock,
            offset: reference_offset(utc_offset_minutes),
        }
    }

    /// Send email via SMTP (async).
    pub async fn send_email(&self, message: &EmailMessage) -> Result<MessageId> {
        use lettre::{
            AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, message::Mailbox,
            message::header::ContentType, transport::smtp::authentication::Credentials,
        };

        let from_name = self.config.display_name.as_deref().unwrap_or("Habitflow");
        let from_mailbox: Mailbox = format!("{from_name} <{}>", self.config.from)
            .parse()
            .map_err(|e| HabitflowError::Delivery(format!("Invalid from: {e}")))?;

        let to_mailbox: Mailbox = message
            .to
            .parse()
            .map_err(|e| HabitflowError::Delivery(format!("Invalid to: {e}")))?;

        let message_id = format!("<{}@habitflow>", uuid::Uuid::new_v4());
        let email = LettreMessage::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(message.subject.as_str())
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| HabitflowError::Delivery(format!("Build email: {e}")))?;

        let creds = Credentials::new(self.config.username.clone(), self.config.password.clone());

        let mailer =
            AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(&self.config.smtp_host)
                .map_err(|e| HabitflowError::Delivery(format!("SMTP relay: {e}")))?
                .port(self.config.smtp_port)
                .credentials(creds)
                .build();

        mailer
            .send(email)
            .await
            .map_err(|e| HabitflowError::Delivery(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Email sent to: {}", message.to);
        Ok(MessageId(message_id))
    }
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send_reminder(
        &self,
        recipient: &Recipient,
        task_description: &str,
        label: &str,
    ) -> Result<MessageId> {
        let hours_left = hours_remaining_today(self.clock.now(), self.offset);
        let message = render_reminder(&recipient.email, task_description, label, hours_left);
        self.send_email(&message).await
    }

    async fn send_overdue_notice(
        &self,
        recipient: &Recipient,
        task_description: &str,
        overdue: OverdueAt,
    ) -> Result<MessageId> {
        let message = render_overdue(&recipient.email, task_description, overdue);
        self.send_email(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn test_render_reminder() {
        let msg = render_reminder("ada@example.com", "Read 20 pages", "6 hours", 1);
        assert_eq!(msg.to, "ada@example.com");
        assert_eq!(msg.subject, "Task Reminder");
        assert!(msg.body.contains("\"Read 20 pages\""));
        assert!(msg.body.contains("(6 hours)"));
        assert!(msg.body.contains("about 1 hour left"));

        let msg = render_reminder("ada@example.com", "Run", "2 hours", 9);
        assert!(msg.body.contains("about 9 hours left"));
    }

    #[test]
    fn test_render_overdue() {
        let due = Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap();
        let msg = render_overdue("ada@example.com", "Stretch", OverdueAt::Due(due));
        assert_eq!(msg.subject, "Task Overdue");
        assert!(msg.body.contains("overdue since 2026-03-10 14:00 UTC"));

        let day = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let msg = render_overdue("ada@example.com", "Stretch", OverdueAt::EndOfDay(day));
        assert!(msg.body.contains("the end of 2026-03-10"));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_delivery_error() {
        let channel = EmailChannel::new(
            EmailDeliveryConfig {
                enabled: true,
                smtp_host: "localhost".into(),
                smtp_port: 2525,
                username: String::new(),
                password: String::new(),
                from: "noreply@habitflow.local".into(),
                display_name: None,
            },
            0,
        );
        let err = channel
            .send_reminder(&Recipient::new("u1", "not an address"), "Run", "2 hours")
            .await
            .unwrap_err();
        assert!(matches!(err, HabitflowError::Delivery(_)));
    }
}
