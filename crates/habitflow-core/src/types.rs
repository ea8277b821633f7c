//! Shared data types passed between the scheduler and delivery channels.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Who a reminder or notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Owning user ID (as stored on tasks).
    pub user_id: String,
    /// Email address used by the SMTP channel.
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Recipient {
    pub fn new(user_id: &str, email: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: email.to_string(),
            display_name: None,
        }
    }
}

/// Identifier returned by a channel for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an overdue notice refers to: an explicit due time, or the end of
/// the day the task was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "at", rename_all = "snake_case")]
pub enum OverdueAt {
    Due(DateTime<Utc>),
    EndOfDay(NaiveDate),
}

impl std::fmt::Display for OverdueAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverdueAt::Due(at) => write!(f, "{}", at.format("%Y-%m-%d %H:%M UTC")),
            OverdueAt::EndOfDay(day) => write!(f, "the end of {}", day.format("%Y-%m-%d")),
        }
    }
}

/// An in-app notification record (likes, comments, follows, task reminders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// User who receives the notification.
    pub receiver_id: String,
    /// User who caused it (the receiver themselves for task reminders).
    pub actor_id: String,
    /// Event type: "like", "comment", "follow", "repost", "post", "member",
    /// "challenge_completed", "task".
    pub event_type: String,
    pub message: String,
    /// The post/comment/challenge/task the notification is about.
    #[serde(default)]
    pub subject_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
