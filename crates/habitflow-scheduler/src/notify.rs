//! Social notifications — likes, comments, follows, reposts, challenges.
//! Each event renders into one or more in-app notifications which are
//! queued as `JobKind::Notification` jobs.

use chrono::{DateTime, Utc};
use habitflow_core::error::Result;
use habitflow_core::types::Notification;
use serde::{Deserialize, Serialize};

use crate::queue::{DispatchJob, DispatchQueue, JobId};

/// The user who caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub username: String,
}

impl Actor {
    pub fn new(id: &str, username: &str) -> Self {
        Self {
            id: id.to_string(),
            username: username.to_string(),
        }
    }
}

/// Something happened that other users should hear about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    LikePost {
        actor: Actor,
        owner_id: String,
        post_id: String,
        post: String,
    },
    LikeComment {
        actor: Actor,
        owner_id: String,
        comment_id: String,
        comment: String,
    },
    Comment {
        actor: Actor,
        owner_id: String,
        post_id: String,
        post: String,
    },
    Follow {
        actor: Actor,
        followee_id: String,
    },
    Repost {
        actor: Actor,
        owner_id: String,
        post_id: String,
        post: String,
    },
    /// Fans out to every subscriber of the author.
    NewPost {
        actor: Actor,
        post_id: String,
        post: String,
        subscriber_ids: Vec<String>,
        #[serde(default)]
        is_repost: bool,
    },
    ChallengeMember {
        actor: Actor,
        owner_id: String,
        challenge_id: String,
        challenge: String,
    },
    /// Tells the finisher and the challenge owner.
    ChallengeCompleted {
        actor: Actor,
        owner: Actor,
        challenge_id: String,
        challenge: String,
    },
}

impl NotificationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LikePost { .. } | Self::LikeComment { .. } => "like",
            Self::Comment { .. } => "comment",
            Self::Follow { .. } => "follow",
            Self::Repost { .. } => "repost",
            Self::NewPost { .. } => "post",
            Self::ChallengeMember { .. } => "member",
            Self::ChallengeCompleted { .. } => "challenge_completed",
        }
    }

    /// Render the event into notification records. Nobody is notified about
    /// their own action, except the "you completed" confirmation.
    pub fn into_notifications(self, now: DateTime<Utc>) -> Vec<Notification> {
        let event_type = self.event_type();
        let make = |receiver: &str, actor: &str, message: String, subject: &str| Notification {
            receiver_id: receiver.to_string(),
            actor_id: actor.to_string(),
            event_type: event_type.to_string(),
            message,
            subject_id: Some(subject.to_string()),
            created_at: now,
        };

        let mut out = match &self {
            Self::LikePost {
                actor,
                owner_id,
                post_id,
                post,
            } => vec![make(
                owner_id,
                &actor.id,
                format!("{} liked your post \"{post}\"", actor.username),
                post_id,
            )],
            Self::LikeComment {
                actor,
                owner_id,
                comment_id,
                comment,
            } => vec![make(
                owner_id,
                &actor.id,
                format!("{} liked your comment \"{comment}\"", actor.username),
                comment_id,
            )],
            Self::Comment {
                actor,
                owner_id,
                post_id,
                post,
            } => vec![make(
                owner_id,
                &actor.id,
                format!("{} commented at your post \"{post}\".", actor.username),
                post_id,
            )],
            Self::Follow { actor, followee_id } => vec![Notification {
                subject_id: None,
                ..make(
                    followee_id,
                    &actor.id,
                    format!("{} started following you.", actor.username),
                    "",
                )
            }],
            Self::Repost {
                actor,
                owner_id,
                post_id,
                post,
            } => vec![make(
                owner_id,
                &actor.id,
                format!("{} reposted your post \"{post}\".", actor.username),
                post_id,
            )],
            Self::NewPost {
                actor,
                post_id,
                post,
                subscriber_ids,
                is_repost,
            } => {
                let verb = if *is_repost { "reposted" } else { "posted" };
                let message = format!("{} just {verb} \"{post}\".", actor.username);
                subscriber_ids
                    .iter()
                    .map(|sub| make(sub, &actor.id, message.clone(), post_id))
                    .collect()
            }
            Self::ChallengeMember {
                actor,
                owner_id,
                challenge_id,
                challenge,
            } => vec![make(
                owner_id,
                &actor.id,
                format!("{} joined your challenge \"{challenge}\".", actor.username),
                challenge_id,
            )],
            Self::ChallengeCompleted {
                actor,
                owner,
                challenge_id,
                challenge,
            } => {
                let mut both = vec![make(
                    &actor.id,
                    &owner.id,
                    format!("You have completed the challenge \"{challenge}\"."),
                    challenge_id,
                )];
                if owner.id != actor.id {
                    both.push(make(
                        &owner.id,
                        &actor.id,
                        format!(
                            "{} has completed your challenge \"{challenge}\".",
                            actor.username
                        ),
                        challenge_id,
                    ));
                }
                return both;
            }
        };
        out.retain(|n| n.receiver_id != n.actor_id);
        out
    }
}

/// Render an event and queue one job per notification.
pub async fn publish(
    queue: &dyn DispatchQueue,
    event: NotificationEvent,
    now: DateTime<Utc>,
) -> Result<Vec<JobId>> {
    let event_type = event.event_type();
    let notifications = event.into_notifications(now);
    let mut ids = Vec::with_capacity(notifications.len());
    for notification in notifications {
        ids.push(queue.enqueue(DispatchJob::notification(notification, now)).await?);
    }
    tracing::info!("📣 Queued {} '{event_type}' notification(s)", ids.len());
    Ok(ids)
}
