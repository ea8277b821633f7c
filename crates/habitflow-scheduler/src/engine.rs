//! Reminder Engine — the periodic tick that turns task state into dispatch jobs.
//! Uses tokio::interval for ticking; each tick is an independent pass over the
//! candidate tasks with no state carried between ticks beyond the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use habitflow_core::clock::Clock;
use habitflow_core::config::SchedulerConfig;
use habitflow_core::error::{HabitflowError, Result};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::policy::{Decision, FiringPlan, ReminderPolicy};
use crate::queue::{DispatchJob, DispatchQueue, JobKind};
use crate::store::{EvaluationWindow, TaskStore};
use crate::tasks::{LadderSlot, Task};

/// What happened to one task during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Fired {
        slot: LadderSlot,
        kind: JobKind,
        retroactive: usize,
    },
    Suppressed,
    Skipped,
    /// Nothing was queued; the task is untouched and retried next tick.
    EnqueueFailed,
    /// Queued, but the ladder flags could not be written.
    PersistFailed,
    /// Store read or recipient lookup failed.
    Failed,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub candidates: usize,
    pub fired: usize,
    /// Lower rungs marked without their own message.
    pub retroactive: usize,
    pub suppressed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub persist_failures: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Fired { retroactive, .. } => {
                self.fired += 1;
                self.retroactive += retroactive;
            }
            TaskOutcome::Suppressed => self.suppressed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::EnqueueFailed | TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::PersistFailed => {
                self.failed += 1;
                self.persist_failures += 1;
            }
        }
    }
}

/// The reminder engine — evaluates tasks and queues reminders.
pub struct ReminderEngine {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    clock: Arc<dyn Clock>,
    policy: ReminderPolicy,
    max_concurrent: usize,
    persist_retries: u32,
    persist_backoff: std::time::Duration,
    /// Held for the whole tick so two ticks never overlap.
    tick_lock: Mutex<()>,
}

impl ReminderEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn DispatchQueue>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            policy: ReminderPolicy::from_config(config),
            max_concurrent: config.max_concurrent_evaluations.max(1),
            persist_retries: config.persist_retries.max(1),
            persist_backoff: std::time::Duration::from_millis(config.persist_retry_backoff_ms),
            tick_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &ReminderPolicy {
        &self.policy
    }

    /// Run one tick at the clock's current time.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(self.clock.now()).await
    }

    /// Run one tick as if it were `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let _guard = self.tick_lock.lock().await;

        let window = EvaluationWindow::for_tick(now, self.policy.offset());
        let tasks = self.store.query_tasks_due_for_evaluation(&window).await?;
        let mut report = TickReport {
            candidates: tasks.len(),
            ..TickReport::default()
        };

        let outcomes: Vec<TaskOutcome> = futures::stream::iter(tasks)
            .map(|task| self.process_task(task, now))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;
        for outcome in &outcomes {
            report.record(outcome);
        }

        if report.fired > 0 || report.failed > 0 {
            tracing::info!(
                "⏰ Tick {}: {} candidates, {} fired, {} suppressed, {} failed",
                now.format("%H:%M:%S"),
                report.candidates,
                report.fired,
                report.suppressed,
                report.failed
            );
        } else {
            tracing::debug!("⏰ Tick {}: {} candidates, nothing due", now.format("%H:%M:%S"), report.candidates);
        }
        Ok(report)
    }

    async fn process_task(&self, task: Task, now: DateTime<Utc>) -> TaskOutcome {
        match self.policy.evaluate(&task, now) {
            Decision::Skip(_) => TaskOutcome::Skipped,
            Decision::Suppressed { until } => {
                tracing::debug!("🔕 Task {} in cooldown until {until}", task.id);
                TaskOutcome::Suppressed
            }
            Decision::Fire(_) => self.fire(&task.id, now).await,
        }
    }

    /// Re-read the task, decide again on fresh state, queue the job, then
    /// persist the ladder flags.
    async fn fire(&self, task_id: &str, now: DateTime<Utc>) -> TaskOutcome {
        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return TaskOutcome::Skipped,
            Err(e) => {
                tracing::warn!("⚠️ Reading task {task_id} failed, retrying next tick: {e}");
                return TaskOutcome::Failed;
            }
        };
        let plan = match self.policy.evaluate(&task, now) {
            Decision::Fire(plan) => plan,
            Decision::Suppressed { .. } => return TaskOutcome::Suppressed,
            Decision::Skip(_) => return TaskOutcome::Skipped,
        };

        let recipient = match self.store.owner(&task.owner_id).await {
            Ok(Some(recipient)) => recipient,
            Ok(None) => {
                tracing::warn!("⚠️ Task {} has no known owner '{}'", task.id, task.owner_id);
                return TaskOutcome::Failed;
            }
            Err(e) => {
                tracing::warn!("⚠️ Owner lookup for task {} failed: {e}", task.id);
                return TaskOutcome::Failed;
            }
        };

        let job = match plan.overdue {
            Some(overdue) => DispatchJob::overdue(&task, recipient, plan.slot, &plan.label, overdue, now),
            None => DispatchJob::reminder(&task, recipient, plan.slot, &plan.label, now),
        };

        let job_id = match self.queue.enqueue(job).await {
            Ok(id) => id,
            Err(HabitflowError::QueueDisabled) => {
                tracing::debug!("📪 Queue disabled, task {} left for a later tick", task.id);
                return TaskOutcome::EnqueueFailed;
            }
            Err(e) => {
                tracing::warn!("⚠️ Enqueue for task {} failed, retrying next tick: {e}", task.id);
                return TaskOutcome::EnqueueFailed;
            }
        };

        tracing::info!(
            "🔔 {} '{}' queued for task {} ({job_id})",
            plan.kind,
            plan.label,
            task.id
        );
        if !plan.retroactive.is_empty() {
            tracing::debug!(
                "⏭️ Task {}: {} lower rung(s) marked without a message",
                task.id,
                plan.retroactive.len()
            );
        }

        self.persist(&task.id, &plan).await
    }

    async fn persist(&self, task_id: &str, plan: &FiringPlan) -> TaskOutcome {
        for attempt in 1..=self.persist_retries {
            match self.store.update_task(task_id, &plan.patch).await {
                Ok(_) => {
                    return TaskOutcome::Fired {
                        slot: plan.slot,
                        kind: plan.kind,
                        retroactive: plan.retroactive.len(),
                    };
                }
                Err(e) if attempt < self.persist_retries => {
                    tracing::warn!(
                        "⚠️ Persisting '{}' for task {task_id} failed (attempt {attempt}): {e}",
                        plan.slot
                    );
                    tokio::time::sleep(self.persist_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        "🚨 Rung '{}' of task {task_id} was queued but not persisted after {attempt} attempts: {e}",
                        plan.slot
                    );
                }
            }
        }
        TaskOutcome::PersistFailed
    }
}

/// Spawn the ticker as a background tokio task. Late ticks are skipped, not
/// bunched up.
pub fn spawn_scheduler(
    engine: Arc<ReminderEngine>,
    period: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("⏰ Reminder scheduler started (tick every {}s)", period.as_secs());
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = engine.tick().await {
                tracing::warn!("⚠️ Tick failed, retrying next period: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DisabledQueue, MemoryQueue};
    use crate::store::MemoryTaskStore;
    use crate::tasks::TaskPatch;
    use crate::worker::tests::RecordingChannel;
    use crate::worker::{DeliveryRouter, DispatchWorker};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use habitflow_core::clock::ManualClock;
    use habitflow_core::config::QueueConfig;
    use habitflow_core::types::{OverdueAt, Recipient};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap()
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            persist_retry_backoff_ms: 1,
            ..SchedulerConfig::default()
        }
    }

    struct Harness {
        store: Arc<MemoryTaskStore>,
        queue: Arc<MemoryQueue>,
        engine: ReminderEngine,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryTaskStore::new());
        store
            .upsert_owner(&Recipient::new("u1", "u1@example.com"))
            .await
            .unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let engine = ReminderEngine::new(
            store.clone(),
            queue.clone(),
            Arc::new(ManualClock::new(t0())),
            &config(),
        );
        Harness { store, queue, engine }
    }

    async fn add(h: &Harness, due: Option<DateTime<Utc>>, created: DateTime<Utc>) -> Task {
        let task = Task::new("u1", "Practice guitar", due, created);
        h.store.insert_task(&task).await.unwrap();
        task
    }

    fn labels(queue: &MemoryQueue) -> Vec<String> {
        queue.pending_jobs().into_iter().map(|j| j.label).collect()
    }

    #[tokio::test]
    async fn test_first_rung_fires_once() {
        let h = harness().await;
        let task = add(&h, None, t0()).await;

        let report = h.engine.tick_at(t0() + Duration::minutes(121)).await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(labels(&h.queue), vec!["2 hours"]);

        let report = h.engine.tick_at(t0() + Duration::minutes(122)).await.unwrap();
        assert_eq!(report.fired, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.queue.pending().await.unwrap(), 1);

        let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert!(stored.ladder.first);
        assert_eq!(stored.last_reminder_sent_at, Some(t0() + Duration::minutes(121)));
    }

    #[tokio::test]
    async fn test_due_time_ladder_scenario() {
        let h = harness().await;
        add(&h, Some(t0() + Duration::hours(3)), t0()).await;

        h.engine.tick_at(t0() + Duration::minutes(65)).await.unwrap();
        h.engine.tick_at(t0() + Duration::minutes(155)).await.unwrap();
        assert_eq!(labels(&h.queue), vec!["2 hours", "30 minutes"]);
    }

    #[tokio::test]
    async fn test_overdue_fires_once_over_three_ticks() {
        let h = harness().await;
        let due = t0() - Duration::hours(1);
        let task = add(&h, Some(due), t0() - Duration::hours(2)).await;

        let mut fired = 0;
        for minute in 0..3 {
            fired += h.engine.tick_at(t0() + Duration::minutes(minute)).await.unwrap().fired;
        }
        assert_eq!(fired, 1);
        let jobs = h.queue.pending_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Overdue);
        assert_eq!(jobs[0].overdue, Some(OverdueAt::Due(due)));

        let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert!(stored.ladder.final_notice);
        assert!(stored.ladder.first && stored.ladder.second);
    }

    #[tokio::test]
    async fn test_downtime_sends_only_highest_rung() {
        let h = harness().await;
        let task = add(&h, None, t0()).await;

        let report = h.engine.tick_at(t0() + Duration::hours(13)).await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(report.retroactive, 2);
        assert_eq!(labels(&h.queue), vec!["12 hours"]);

        let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(
            stored.ladder.fired(),
            vec![LadderSlot::First, LadderSlot::Second, LadderSlot::Third]
        );
    }

    #[tokio::test]
    async fn test_completion_halts_reminders() {
        let h = harness().await;
        let task = add(&h, None, t0()).await;
        h.engine.tick_at(t0() + Duration::minutes(121)).await.unwrap();
        h.store
            .complete_task(&task.id, t0() + Duration::hours(3))
            .await
            .unwrap();

        for hours in [7, 13, 15, 23] {
            let report = h.engine.tick_at(t0() + Duration::hours(hours)).await.unwrap();
            assert_eq!(report.candidates, 0);
        }
        assert_eq!(h.queue.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_ladder_for_task_created_after_midnight() {
        let h = harness().await;
        let created = Utc.with_ymd_and_hms(2026, 3, 10, 0, 10, 0).unwrap();
        let task = add(&h, None, created).await;
        for minute in 0..=24 * 60 {
            h.engine
                .tick_at(created + Duration::minutes(minute))
                .await
                .unwrap();
        }
        assert_eq!(
            labels(&h.queue),
            vec!["2 hours", "6 hours", "12 hours", "23 hours", "end of day"]
        );

        let jobs = h.queue.pending_jobs();
        let sent_at: Vec<DateTime<Utc>> = jobs.iter().map(|j| j.enqueued_at).collect();
        assert!(sent_at.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(jobs[3].enqueued_at, created + Duration::hours(23));

        let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.ladder.fired().len(), 5);
    }

    // "23 hours" opens only on the next day for an 08:00 task, so it is folded in.
    #[tokio::test]
    async fn test_monotonic_progression_through_the_day() {
        let h = harness().await;
        let task = add(&h, None, t0()).await;
        for minutes in (0..=16 * 60).step_by(5) {
            h.engine
                .tick_at(t0() + Duration::minutes(minutes))
                .await
                .unwrap();
        }
        assert_eq!(labels(&h.queue), vec!["2 hours", "6 hours", "12 hours", "end of day"]);
        let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert!(stored.ladder.final_notice);
        assert!(stored.ladder.fourth);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_back_to_back_sends() {
        let h = harness().await;
        let due = t0() + Duration::hours(3);
        let task = add(&h, Some(due), t0()).await;
        h.store
            .update_task(
                &task.id,
                &TaskPatch {
                    ladder: Some(crate::tasks::ReminderLadder::from_slots(&[LadderSlot::First])),
                    last_reminder_sent_at: Some(due - Duration::minutes(1)),
                    completed_at: None,
                },
            )
            .await
            .unwrap();

        let report = h.engine.tick_at(due).await.unwrap();
        assert_eq!(report.suppressed, 1);
        assert_eq!(h.queue.pending().await.unwrap(), 0);

        let report = h.engine.tick_at(due + Duration::minutes(9)).await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(labels(&h.queue), vec!["overdue"]);
    }

    #[tokio::test]
    async fn test_enqueue_failure_leaves_task_untouched() {
        let store = Arc::new(MemoryTaskStore::new());
        store
            .upsert_owner(&Recipient::new("u1", "u1@example.com"))
            .await
            .unwrap();
        let task = Task::new("u1", "Read", None, t0());
        store.insert_task(&task).await.unwrap();
        let engine = ReminderEngine::new(
            store.clone(),
            Arc::new(DisabledQueue),
            Arc::new(ManualClock::new(t0())),
            &config(),
        );

        let report = engine.tick_at(t0() + Duration::hours(3)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.get_task(&task.id).await.unwrap().unwrap(), task);
    }

    #[tokio::test]
    async fn test_unknown_owner_is_isolated() {
        let h = harness().await;
        let orphan = Task::new("ghost", "Haunt", None, t0());
        h.store.insert_task(&orphan).await.unwrap();
        add(&h, None, t0()).await;

        let report = h.engine.tick_at(t0() + Duration::hours(3)).await.unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.fired, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_fire_once() {
        let h = harness().await;
        for _ in 0..10 {
            add(&h, None, t0()).await;
        }
        let at = t0() + Duration::hours(3);
        let (a, b) = tokio::join!(h.engine.tick_at(at), h.engine.tick_at(at));
        assert_eq!(a.unwrap().fired + b.unwrap().fired, 10);
        assert_eq!(h.queue.pending().await.unwrap(), 10);
    }

    /// Fails the first `failures` updates.
    struct FlakyStore {
        inner: MemoryTaskStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn query_tasks_due_for_evaluation(&self, w: &EvaluationWindow) -> Result<Vec<Task>> {
            self.inner.query_tasks_due_for_evaluation(w).await
        }
        async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(HabitflowError::Store("database is locked".into()));
            }
            self.inner.update_task(id, patch).await
        }
        async fn insert_task(&self, task: &Task) -> Result<()> {
            self.inner.insert_task(task).await
        }
        async fn get_task(&self, id: &str) -> Result<Option<Task>> {
            self.inner.get_task(id).await
        }
        async fn list_tasks(&self, owner_id: &str) -> Result<Vec<Task>> {
            self.inner.list_tasks(owner_id).await
        }
        async fn owner(&self, owner_id: &str) -> Result<Option<Recipient>> {
            self.inner.owner(owner_id).await
        }
        async fn upsert_owner(&self, recipient: &Recipient) -> Result<()> {
            self.inner.upsert_owner(recipient).await
        }
    }

    async fn flaky(failures: u32) -> (Arc<FlakyStore>, Arc<MemoryQueue>, ReminderEngine, Task) {
        let store = Arc::new(FlakyStore {
            inner: MemoryTaskStore::new(),
            failures: AtomicU32::new(failures),
        });
        store
            .upsert_owner(&Recipient::new("u1", "u1@example.com"))
            .await
            .unwrap();
        let task = Task::new("u1", "Read", None, t0());
        store.insert_task(&task).await.unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let engine = ReminderEngine::new(
            store.clone(),
            queue.clone(),
            Arc::new(ManualClock::new(t0())),
            &config(),
        );
        (store, queue, engine, task)
    }

    #[tokio::test]
    async fn test_persist_is_retried() {
        let (store, queue, engine, task) = flaky(2).await;
        let report = engine.tick_at(t0() + Duration::hours(3)).await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(queue.pending().await.unwrap(), 1);
        assert!(store.get_task(&task.id).await.unwrap().unwrap().ladder.first);
    }

    #[tokio::test]
    async fn test_persist_exhaustion_does_not_duplicate_jobs() {
        let (store, queue, engine, task) = flaky(3).await;
        let report = engine.tick_at(t0() + Duration::hours(3)).await.unwrap();
        assert_eq!(report.persist_failures, 1);
        assert!(!store.get_task(&task.id).await.unwrap().unwrap().ladder.first);

        // The next tick produces the same job again; the dedup key keeps one copy.
        let report = engine.tick_at(t0() + Duration::hours(3) + Duration::minutes(1)).await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(queue.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tick_to_delivery() {
        let h = harness().await;
        add(&h, None, t0()).await;
        let clock = ManualClock::new(t0() + Duration::minutes(121));
        let report = h.engine.tick_at(clock.now()).await.unwrap();
        assert_eq!(report.fired, 1);

        let channel = Arc::new(RecordingChannel::default());
        let worker = DispatchWorker::new(
            h.queue.clone(),
            DeliveryRouter::new(vec![channel.clone()]),
            &QueueConfig::default(),
        );
        let stats = worker.process_once().await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(channel.sent(), vec!["reminder:u1:Practice guitar:2 hours"]);
    }
}
