//! Rung tables — the two reminder ladders as data.
//!
//! Each ladder is an ordered list of [`Rung`]s, lowest first. The policy
//! walks the list from the top, so adding or retuning a rung is a config
//! change, not a code change.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use habitflow_core::clock::DayWindow;
use habitflow_core::config::SchedulerConfig;

use crate::queue::JobKind;
use crate::tasks::{LadderSlot, Task};

/// Label used by the due-time overdue rung.
pub const OVERDUE_LABEL: &str = "overdue";
/// Label used by the end-of-day overdue rung.
pub const END_OF_DAY_LABEL: &str = "end of day";

/// When a rung becomes eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// At least this long since creation, and created today.
    Elapsed(Duration),
    /// The creation day is about to end (or has ended).
    EndOfDay {
        /// How long before the end of the creation day the rung opens.
        lead: Duration,
        /// Minimum age before the rung may open early.
        min_elapsed: Duration,
    },
    /// Inside `[due - lead, due)`.
    BeforeDue(Duration),
    /// At or after the due time.
    AtDue,
}

/// Which ladder a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderKind {
    NoDueTime,
    DueTime,
}

impl LadderKind {
    pub fn of(task: &Task) -> Self {
        if task.has_due_time() {
            LadderKind::DueTime
        } else {
            LadderKind::NoDueTime
        }
    }
}

/// One escalation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rung {
    pub slot: LadderSlot,
    pub trigger: Trigger,
    pub label: String,
    pub kind: JobKind,
}

impl Rung {
    /// Whether the rung's trigger holds for `task` at `now`. Says nothing
    /// about whether the rung already fired.
    pub fn is_eligible(&self, task: &Task, now: DateTime<Utc>, offset: FixedOffset) -> bool {
        let elapsed = now - task.created_at;
        match self.trigger {
            Trigger::Elapsed(threshold) => {
                DayWindow::containing(now, offset).contains(task.created_at) && elapsed >= threshold
            }
            Trigger::EndOfDay { lead, min_elapsed } => {
                let creation_day = DayWindow::containing(task.created_at, offset);
                let day_over = now >= creation_day.start_of_tomorrow;
                let closing = now >= creation_day.start_of_tomorrow - lead && elapsed >= min_elapsed;
                day_over || closing
            }
            Trigger::BeforeDue(lead) => match task.due_time {
                Some(due) => now >= due - lead && now < due,
                None => false,
            },
            Trigger::AtDue => task.due_time.is_some_and(|due| now >= due),
        }
    }

    /// When an elapsed rung opens for `task`.
    pub fn opens_at(&self, task: &Task) -> Option<DateTime<Utc>> {
        match self.trigger {
            Trigger::Elapsed(threshold) => Some(task.created_at + threshold),
            _ => None,
        }
    }

    /// The `[start, end)` window in which an end-of-day rung opens ahead of
    /// the end of the task's creation day.
    pub fn closing_window(
        &self,
        task: &Task,
        offset: FixedOffset,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self.trigger {
            Trigger::EndOfDay { lead, .. } => {
                let end = DayWindow::containing(task.created_at, offset).start_of_tomorrow;
                Some((end - lead, end))
            }
            _ => None,
        }
    }
}
