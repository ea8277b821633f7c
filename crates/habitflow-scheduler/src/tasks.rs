//! Task definitions — habits/todos and their reminder ladder state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One flag position in a task's reminder ladder.
///
/// Tasks without a due time use `First..=Fourth` plus `Final` (end-of-day
/// overdue). Tasks with a due time use `First`, `Second` and `Final` (overdue
/// at the due time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LadderSlot {
    First,
    Second,
    Third,
    Fourth,
    Final,
}

impl LadderSlot {
    pub const ALL: [LadderSlot; 5] = [
        LadderSlot::First,
        LadderSlot::Second,
        LadderSlot::Third,
        LadderSlot::Fourth,
        LadderSlot::Final,
    ];

    /// Slots available to threshold rungs, in firing order.
    pub const REMINDERS: [LadderSlot; 4] = [
        LadderSlot::First,
        LadderSlot::Second,
        LadderSlot::Third,
        LadderSlot::Fourth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LadderSlot::First => "first",
            LadderSlot::Second => "second",
            LadderSlot::Third => "third",
            LadderSlot::Fourth => "fourth",
            LadderSlot::Final => "final",
        }
    }
}

impl std::fmt::Display for LadderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// "Already sent" flags, one per ladder slot. Flags only ever go false → true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderLadder {
    pub first: bool,
    pub second: bool,
    pub third: bool,
    pub fourth: bool,
    pub final_notice: bool,
}

impl ReminderLadder {
    pub fn is_set(&self, slot: LadderSlot) -> bool {
        match slot {
            LadderSlot::First => self.first,
            LadderSlot::Second => self.second,
            LadderSlot::Third => self.third,
            LadderSlot::Fourth => self.fourth,
            LadderSlot::Final => self.final_notice,
        }
    }

    pub fn set(&mut self, slot: LadderSlot) {
        match slot {
            LadderSlot::First => self.first = true,
            LadderSlot::Second => self.second = true,
            LadderSlot::Third => self.third = true,
            LadderSlot::Fourth => self.fourth = true,
            LadderSlot::Final => self.final_notice = true,
        }
    }

    /// OR another ladder's flags into this one.
    pub fn merge(&mut self, other: &ReminderLadder) {
        for slot in LadderSlot::ALL {
            if other.is_set(slot) {
                self.set(slot);
            }
        }
    }

    /// Flags currently set, lowest slot first.
    pub fn fired(&self) -> Vec<LadderSlot> {
        LadderSlot::ALL
            .into_iter()
            .filter(|s| self.is_set(*s))
            .collect()
    }

    pub fn from_slots(slots: &[LadderSlot]) -> Self {
        let mut ladder = Self::default();
        for slot in slots {
            ladder.set(*slot);
        }
        ladder
    }
}

/// A habit/todo owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: String,
    /// Owning user (resolved to a recipient through the store).
    pub owner_id: String,
    pub description: String,
    /// Absolute deadline. Without one the task is due by end of day.
    pub due_time: Option<DateTime<Utc>>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub ladder: ReminderLadder,
    /// Anchors the calendar day the task belongs to.
    pub created_at: DateTime<Utc>,
    /// Last actual send, used for cooldown suppression.
    pub last_reminder_sent_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new incomplete task with a fresh ladder.
    pub fn new(
        owner_id: &str,
        description: &str,
        due_time: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            owner_id: owner_id.to_string(),
            description: description.to_string(),
            due_time,
            completed: false,
            completed_at: None,
            ladder: ReminderLadder::default(),
            created_at,
            last_reminder_sent_at: None,
        }
    }

    pub fn has_due_time(&self) -> bool {
        self.due_time.is_some()
    }
}

/// Partial update written back by the policy engine or a completion action.
///
/// Applying a patch can only move state forward: ladder flags are OR-ed in,
/// `last_reminder_sent_at` never moves backwards and completion is final.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default)]
    pub ladder: Option<ReminderLadder>,
    #[serde(default)]
    pub last_reminder_sent_at: Option<DateTime<Utc>>,
    /// Mark the task completed at this instant.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn completion(at: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(at),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ladder.is_none() && self.last_reminder_sent_at.is_none() && self.completed_at.is_none()
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(ladder) = &self.ladder {
            task.ladder.merge(ladder);
        }
        if let Some(sent) = self.last_reminder_sent_at {
            task.last_reminder_sent_at = Some(match task.last_reminder_sent_at {
                Some(prev) if prev > sent => prev,
                _ => sent,
            });
        }
        if let Some(at) = self.completed_at
            && !task.completed
        {
            task.completed = true;
            task.completed_at = Some(at);
        }
    }
}
