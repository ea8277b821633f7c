//! Reminder policy — decides, for one task at one instant, what fires.
//!
//! Evaluation is a pure function of the task and `now`: one pass per task,
//! the highest eligible rung wins, lower unfired rungs are folded into the
//! same patch without their own message. The one exception is the
//! end-of-day rung, which lets a lower rung opening in its own window go
//! first.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use habitflow_core::clock::{DayWindow, reference_offset};
use habitflow_core::config::SchedulerConfig;
use habitflow_core::types::OverdueAt;

use crate::ladder::{LadderKind, RungTable};
use crate::queue::JobKind;
use crate::tasks::{LadderSlot, ReminderLadder, Task, TaskPatch};

/// Why nothing happened for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Completed,
    /// No rung is eligible, or the eligible one already fired.
    NothingDue,
    /// The final rung already fired.
    LadderExhausted,
}

/// What to send and what to write back.
#[derive(Debug, Clone, PartialEq)]
pub struct FiringPlan {
    pub slot: LadderSlot,
    pub kind: JobKind,
    pub label: String,
    pub ladder: LadderKind,
    /// Lower rungs marked fired without a message.
    pub retroactive: Vec<LadderSlot>,
    /// Set for overdue notices.
    pub overdue: Option<OverdueAt>,
    pub patch: TaskPatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip(SkipReason),
    /// A rung is due but the task is inside its cooldown window.
    Suppressed { until: DateTime<Utc> },
    Fire(FiringPlan),
}

/// Rung tables plus the knobs that apply across both ladders.
#[derive(Debug, Clone)]
pub struct ReminderPolicy {
    rungs: RungTable,
    cooldown: Duration,
    offset: FixedOffset,
}

impl ReminderPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            rungs: RungTable::from_config(config),
            cooldown: Duration::seconds(i64::try_from(config.cooldown_secs).unwrap_or(i64::MAX)),
            offset: reference_offset(config.utc_offset_minutes),
        }
    }

    pub fn rungs(&self) -> &RungTable {
        &self.rungs
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn evaluate(&self, task: &Task, now: DateTime<Utc>) -> Decision {
        if task.completed {
            return Decision::Skip(SkipReason::Completed);
        }
        if task.ladder.is_set(LadderSlot::Final) {
            return Decision::Skip(SkipReason::LadderExhausted);
        }

        let kind = LadderKind::of(task);
        let rungs = self.rungs.ladder(kind);
        let Some(mut top) = rungs.iter().rposition(|r| r.is_eligible(task, now, self.offset)) else {
            return Decision::Skip(SkipReason::NothingDue);
        };
        // Lower rungs that open inside the end-of-day window go out before it.
        if let Some((from, until)) = rungs[top].closing_window(task, self.offset)
            && now < until
            && let Some(pending) = rungs[..top].iter().rposition(|r| {
                !task.ladder.is_set(r.slot)
                    && r.opens_at(task).is_some_and(|at| at >= from && at < until)
            })
        {
            if !rungs[pending].is_eligible(task, now, self.offset) {
                return Decision::Skip(SkipReason::NothingDue);
            }
            top = pending;
        }
        let rung = &rungs[top];
        if task.ladder.is_set(rung.slot) {
            return Decision::Skip(SkipReason::NothingDue);
        }

        if let Some(last) = task.last_reminder_sent_at
            && now - last < self.cooldown
        {
            return Decision::Suppressed {
                until: last + self.cooldown,
            };
        }

        let retroactive: Vec<LadderSlot> = rungs[..top]
            .iter()
            .map(|r| r.slot)
            .filter(|slot| !task.ladder.is_set(*slot))
            .collect();

        let mut fired = ReminderLadder::from_slots(&retroactive);
        fired.set(rung.slot);

        let overdue = match (rung.kind, task.due_time) {
            (JobKind::Overdue, Some(due)) => Some(OverdueAt::Due(due)),
            (JobKind::Overdue, None) => Some(OverdueAt::EndOfDay(
                DayWindow::containing(task.created_at, self.offset).day,
            )),
            _ => None,
        };

        Decision::Fire(FiringPlan {
            slot: rung.slot,
            kind: rung.kind,
            label: rung.label.clone(),
            ladder: kind,
            retroactive,
            overdue,
            patch: TaskPatch {
                ladder: Some(fired),
                last_reminder_sent_at: Some(now),
                completed_at: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap()
    }

    fn policy() -> ReminderPolicy {
        ReminderPolicy::from_config(&SchedulerConfig::default())
    }

    fn fire(decision: Decision) -> FiringPlan {
        match decision {
            Decision::Fire(plan) => plan,
            other => panic!("expected Fire, got {other:?}"),
        }
    }

    #[test]
    fn test_first_rung_after_two_hours() {
        let task = Task::new("u1", "Read", None, t0());
        assert_eq!(
            policy().evaluate(&task, t0() + Duration::minutes(119)),
            Decision::Skip(SkipReason::NothingDue)
        );
        let plan = fire(policy().evaluate(&task, t0() + Duration::minutes(121)));
        assert_eq!(plan.slot, LadderSlot::First);
        assert_eq!(plan.label, "2 hours");
        assert_eq!(plan.kind, JobKind::Reminder);
        assert!(plan.retroactive.is_empty());
    }

    #[test]
    fn test_fired_rung_is_not_repeated() {
        let mut task = Task::new("u1", "Read", None, t0());
        let plan = fire(policy().evaluate(&task, t0() + Duration::minutes(121)));
        plan.patch.apply(&mut task);
        assert_eq!(
            policy().evaluate(&task, t0() + Duration::minutes(122) + Duration::hours(1)),
            Decision::Skip(SkipReason::NothingDue)
        );
    }

    #[test]
    fn test_downtime_fires_highest_rung_only() {
        let task = Task::new("u1", "Read", None, t0());
        let plan = fire(policy().evaluate(&task, t0() + Duration::hours(13)));
        assert_eq!(plan.slot, LadderSlot::Third);
        assert_eq!(plan.label, "12 hours");
        assert_eq!(plan.retroactive, vec![LadderSlot::First, LadderSlot::Second]);
        let ladder = plan.patch.ladder.unwrap();
        assert!(ladder.first && ladder.second && ladder.third);
        assert!(!ladder.fourth && !ladder.final_notice);
    }

    #[test]
    fn test_end_of_day_overdue() {
        let mut task = Task::new("u1", "Read", None, t0());
        task.ladder = ReminderLadder::from_slots(&[LadderSlot::First, LadderSlot::Second]);
        let plan = fire(policy().evaluate(&task, t0() + Duration::hours(15)));
        assert_eq!(plan.slot, LadderSlot::Final);
        assert_eq!(plan.kind, JobKind::Overdue);
        assert_eq!(
            plan.overdue,
            Some(OverdueAt::EndOfDay(NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()))
        );
        assert_eq!(plan.retroactive, vec![LadderSlot::Third, LadderSlot::Fourth]);
    }

    #[test]
    fn test_late_rung_goes_out_before_end_of_day() {
        let created = Utc.with_ymd_and_hms(2026, 3, 10, 0, 10, 0).unwrap();
        let mut task = Task::new("u1", "Read", None, created);
        task.ladder =
            ReminderLadder::from_slots(&[LadderSlot::First, LadderSlot::Second, LadderSlot::Third]);
        task.last_reminder_sent_at = Some(created + Duration::hours(12));

        // 23:00: the end-of-day window is open but "23 hours" opens at 23:10.
        assert_eq!(
            policy().evaluate(&task, created + Duration::minutes(22 * 60 + 50)),
            Decision::Skip(SkipReason::NothingDue)
        );

        let plan = fire(policy().evaluate(&task, created + Duration::hours(23)));
        assert_eq!((plan.slot, plan.label.as_str()), (LadderSlot::Fourth, "23 hours"));
        assert!(plan.retroactive.is_empty());
        plan.patch.apply(&mut task);

        let plan = fire(policy().evaluate(&task, created + Duration::minutes(23 * 60 + 10)));
        assert_eq!(plan.slot, LadderSlot::Final);
        assert!(plan.retroactive.is_empty());
    }

    #[test]
    fn test_missed_late_rung_still_precedes_end_of_day() {
        // Created 11:30: "12 hours" opens at 23:30, inside the end-of-day window.
        let created = Utc.with_ymd_and_hms(2026, 3, 10, 11, 30, 0).unwrap();
        let task = Task::new("u1", "Read", None, created);
        let plan = fire(policy().evaluate(&task, created + Duration::minutes(12 * 60 + 5)));
        assert_eq!(plan.slot, LadderSlot::Third);
        assert_eq!(plan.retroactive, vec![LadderSlot::First, LadderSlot::Second]);
    }

    #[test]
    fn test_due_time_ladder() {
        let due = t0() + Duration::hours(3);
        let mut task = Task::new("u1", "Call", Some(due), t0());
        let plan = fire(policy().evaluate(&task, t0() + Duration::minutes(65)));
        assert_eq!((plan.slot, plan.label.as_str()), (LadderSlot::First, "2 hours"));
        plan.patch.apply(&mut task);

        let plan = fire(policy().evaluate(&task, t0() + Duration::minutes(155)));
        assert_eq!((plan.slot, plan.label.as_str()), (LadderSlot::Second, "30 minutes"));
        plan.patch.apply(&mut task);

        let plan = fire(policy().evaluate(&task, due + Duration::minutes(1)));
        assert_eq!(plan.slot, LadderSlot::Final);
        assert_eq!(plan.overdue, Some(OverdueAt::Due(due)));
        plan.patch.apply(&mut task);

        assert_eq!(
            policy().evaluate(&task, due + Duration::hours(1)),
            Decision::Skip(SkipReason::LadderExhausted)
        );
    }

    #[test]
    fn test_due_time_task_never_uses_elapsed_rungs() {
        let task = Task::new("u1", "Call", Some(t0() + Duration::hours(10)), t0());
        // Six hours in, far from the due time: the elapsed ladder must not fire.
        assert_eq!(
            policy().evaluate(&task, t0() + Duration::hours(6)),
            Decision::Skip(SkipReason::NothingDue)
        );
    }

    #[test]
    fn test_completed_task_is_skipped() {
        let mut task = Task::new("u1", "Read", None, t0());
        TaskPatch::completion(t0() + Duration::hours(1)).apply(&mut task);
        assert_eq!(
            policy().evaluate(&task, t0() + Duration::hours(13)),
            Decision::Skip(SkipReason::Completed)
        );
    }

    #[test]
    fn test_cooldown_suppresses() {
        let due = t0() + Duration::hours(3);
        let mut task = Task::new("u1", "Call", Some(due), t0());
        task.ladder = ReminderLadder::from_slots(&[LadderSlot::First, LadderSlot::Second]);
        task.last_reminder_sent_at = Some(due - Duration::minutes(2));
        assert_eq!(
            policy().evaluate(&task, due),
            Decision::Suppressed {
                until: due + Duration::minutes(8)
            }
        );
        assert!(matches!(
            policy().evaluate(&task, due + Duration::minutes(8)),
            Decision::Fire(_)
        ));
    }
}
