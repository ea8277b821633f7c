//! # Habitflow Channels
//! Outbound delivery channels for task reminders.

pub mod email;
pub mod webhook;

use std::sync::Arc;

use habitflow_core::clock::Clock;
use habitflow_core::config::HabitflowConfig;
use habitflow_core::traits::DeliveryChannel;

pub use email::EmailChannel;
pub use webhook::WebhookChannel;

/// Build the outbound channels enabled in config.
/// The in-app inbox lives next to the database and is added by the caller.
pub fn channels_from_config(
    config: &HabitflowConfig,
    clock: Arc<dyn Clock>,
) -> Vec<Arc<dyn DeliveryChannel>> {
    let mut channels: Vec<Arc<dyn DeliveryChannel>> = Vec::new();

    if let Some(email) = &config.delivery.email
        && email.enabled && !email.smtp_host.is_empty() {
            channels.push(Arc::new(EmailChannel::with_clock(
                email.clone(),
                config.scheduler.utc_offset_minutes,
                clock,
            )));
        }

    if let Some(wh) = &config.delivery.webhook
        && wh.enabled && !wh.url.is_empty() {
            channels.push(Arc::new(WebhookChannel::new(wh)));
        }

    channels
}
