//! Dispatch queue — decouples reminder decisions from message delivery.
//!
//! Producers call [`DispatchQueue::enqueue`]; a single [`DispatchWorker`]
//! claims jobs, delivers them and acknowledges or fails each one. Delivery
//! is at-least-once: a claimed job that is never acknowledged comes back.
//!
//! [`DispatchWorker`]: crate::worker::DispatchWorker

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use habitflow_core::error::{HabitflowError, Result};
use habitflow_core::types::{Notification, OverdueAt, Recipient};
use serde::{Deserialize, Serialize};

use crate::tasks::{LadderSlot, Task};

/// What the worker should do with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A ladder reminder ("2 hours", "30 minutes").
    Reminder,
    /// The task passed its due time / end of day.
    Overdue,
    /// A generic in-app notification (likes, comments, follows...).
    Notification,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Reminder => "reminder",
            JobKind::Overdue => "overdue",
            JobKind::Notification => "notification",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub kind: JobKind,
    #[serde(default)]
    pub task_id: Option<String>,
    pub recipient: Recipient,
    /// Rung label ("2 hours") or event type for notifications.
    pub label: String,
    /// Task description or notification message.
    pub description: String,
    #[serde(default)]
    pub overdue: Option<OverdueAt>,
    #[serde(default)]
    pub notification: Option<Notification>,
    /// Identical keys mean "the same user-visible message".
    pub dedup_key: String,
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchJob {
    /// Key shared by every job produced for one rung of one task.
    pub fn task_dedup_key(task_id: &str, slot: LadderSlot) -> String {
        format!("task:{task_id}:{slot}")
    }

    pub fn reminder(
        task: &Task,
        recipient: Recipient,
        slot: LadderSlot,
        label: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: JobKind::Reminder,
            task_id: Some(task.id.clone()),
            recipient,
            label: label.to_string(),
            description: task.description.clone(),
            overdue: None,
            notification: None,
            dedup_key: Self::task_dedup_key(&task.id, slot),
            enqueued_at: now,
        }
    }

    pub fn overdue(
        task: &Task,
        recipient: Recipient,
        slot: LadderSlot,
        label: &str,
        overdue: OverdueAt,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: JobKind::Overdue,
            task_id: Some(task.id.clone()),
            recipient,
            label: label.to_string(),
            description: task.description.clone(),
            overdue: Some(overdue),
            notification: None,
            dedup_key: Self::task_dedup_key(&task.id, slot),
            enqueued_at: now,
        }
    }

    pub fn notification(notification: Notification, now: DateTime<Utc>) -> Self {
        Self {
            kind: JobKind::Notification,
            task_id: None,
            recipient: Recipient::new(&notification.receiver_id, ""),
            label: notification.event_type.clone(),
            description: notification.message.clone(),
            overdue: None,
            notification: Some(notification),
            dedup_key: format!("notification:{}", uuid::Uuid::new_v4()),
            enqueued_at: now,
        }
    }
}

/// A job handed to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: JobId,
    pub job: DispatchJob,
    /// How many times this job has been claimed, including this one.
    pub attempts: u32,
}

/// Durable (or not) job queue used by the reminder engine and the worker.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Add a job. A job whose `dedup_key` is already queued or done is not
    /// added twice; the existing ID is returned.
    async fn enqueue(&self, job: DispatchJob) -> Result<JobId>;

    /// Claim up to `max` jobs for processing.
    async fn claim(&self, max: usize) -> Result<Vec<QueuedJob>>;

    /// The job was handled (delivered or knowingly dropped as a duplicate).
    async fn ack(&self, id: JobId) -> Result<()>;

    /// The job failed and is dropped.
    async fn fail(&self, id: JobId, reason: &str) -> Result<()>;

    /// Jobs waiting to be claimed.
    async fn pending(&self) -> Result<usize>;
}

#[derive(Default)]
struct MemoryQueueState {
    pending: VecDeque<QueuedJob>,
    in_flight: HashMap<JobId, QueuedJob>,
    keys: HashMap<String, JobId>,
    /// Dedup keys of acknowledged task jobs, oldest first.
    done: VecDeque<String>,
    failed: VecDeque<(JobId, String)>,
}

/// How many finished jobs [`MemoryQueue::new`] remembers.
pub const DEFAULT_RETAINED_JOBS: usize = 1024;

/// In-process queue. Lost on restart.
pub struct MemoryQueue {
    next_id: AtomicI64,
    retain: usize,
    state: Mutex<MemoryQueueState>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_JOBS)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the dedup keys of the last `retain` acknowledged task jobs and
    /// the last `retain` failures.
    pub fn with_retention(retain: usize) -> Self {
        Self {
            next_id: AtomicI64::new(0),
            retain: retain.max(1),
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put every claimed but unacknowledged job back in line, as a broker
    /// does when a consumer dies mid-job.
    pub fn redeliver_in_flight(&self) -> usize {
        let mut state = self.state();
        let mut jobs: Vec<QueuedJob> = state.in_flight.drain().map(|(_, j)| j).collect();
        jobs.sort_by_key(|j| j.id);
        let count = jobs.len();
        for job in jobs.into_iter().rev() {
            state.pending.push_front(job);
        }
        count
    }

    /// Failed jobs and their reasons.
    pub fn failures(&self) -> Vec<(JobId, String)> {
        self.state().failed.iter().cloned().collect()
    }

    /// Snapshot of jobs waiting to be claimed.
    pub fn pending_jobs(&self) -> Vec<DispatchJob> {
        self.state().pending.iter().map(|q| q.job.clone()).collect()
    }
}

#[async_trait]
impl DispatchQueue for MemoryQueue {
    fn name(&self) -> &str {
        "memory"
    }

    async fn enqueue(&self, job: DispatchJob) -> Result<JobId> {
        let mut state = self.state();
        if let Some(existing) = state.keys.get(&job.dedup_key) {
            tracing::debug!("📭 Duplicate job '{}' ignored ({existing})", job.dedup_key);
            return Ok(*existing);
        }
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        state.keys.insert(job.dedup_key.clone(), id);
        state.pending.push_back(QueuedJob { id, job, attempts: 0 });
        Ok(id)
    }

    async fn claim(&self, max: usize) -> Result<Vec<QueuedJob>> {
        let mut state = self.state();
        let take = max.min(state.pending.len());
        let mut claimed = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(mut job) = state.pending.pop_front() {
                job.attempts += 1;
                state.in_flight.insert(job.id, job.clone());
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, id: JobId) -> Result<()> {
        let mut state = self.state();
        let Some(job) = state.in_flight.remove(&id) else {
            return Ok(());
        };
        let key = job.job.dedup_key;
        // Notification keys are unique per event; only task keys can repeat.
        if job.job.kind == JobKind::Notification {
            state.keys.remove(&key);
            return Ok(());
        }
        state.done.push_back(key);
        while state.done.len() > self.retain {
            if let Some(oldest) = state.done.pop_front() {
                state.keys.remove(&oldest);
            }
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, reason: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(job) = state.in_flight.remove(&id) {
            // A failed job may be produced again by a later tick.
            state.keys.remove(&job.job.dedup_key);
        }
        state.failed.push_back((id, reason.to_string()));
        while state.failed.len() > self.retain {
            state.failed.pop_front();
        }
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.state().pending.len())
    }
}

/// Stand-in used when no queue backend is available. Every enqueue fails,
/// so the engine leaves tasks untouched and retries on later ticks.
#[derive(Debug, Default)]
pub struct DisabledQueue;

#[async_trait]
impl DispatchQueue for DisabledQueue {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn enqueue(&self, _job: DispatchJob) -> Result<JobId> {
        Err(HabitflowError::QueueDisabled)
    }

    async fn claim(&self, _max: usize) -> Result<Vec<QueuedJob>> {
        Ok(Vec::new())
    }

    async fn ack(&self, _id: JobId) -> Result<()> {
        Ok(())
    }

    async fn fail(&self, _id: JobId, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap()
    }

    fn job(task: &Task, slot: LadderSlot) -> DispatchJob {
        DispatchJob::reminder(task, Recipient::new("u1", "u1@example.com"), slot, "2 hours", now())
    }

    #[tokio::test]
    async fn test_enqueue_claim_ack() {
        let queue = MemoryQueue::new();
        let task = Task::new("u1", "Walk", None, now());
        let id = queue.enqueue(job(&task, LadderSlot::First)).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 1);

        let claimed = queue.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].job.dedup_key, format!("task:{}:first", task.id));
        queue.ack(id).await.unwrap();
        assert!(queue.claim(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_dedup_key_is_not_queued_twice() {
        let queue = MemoryQueue::new();
        let task = Task::new("u1", "Walk", None, now());
        let a = queue.enqueue(job(&task, LadderSlot::First)).await.unwrap();
        let b = queue.enqueue(job(&task, LadderSlot::First)).await.unwrap();
        assert_eq!(a, b);
        let c = queue.enqueue(job(&task, LadderSlot::Second)).await.unwrap();
        assert_ne!(a, c);
        assert_eq!(queue.pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_redeliver_in_flight() {
        let queue = MemoryQueue::new();
        let task = Task::new("u1", "Walk", None, now());
        queue.enqueue(job(&task, LadderSlot::First)).await.unwrap();
        let first = queue.claim(1).await.unwrap();
        assert_eq!(queue.redeliver_in_flight(), 1);
        let again = queue.claim(1).await.unwrap();
        assert_eq!(again[0].id, first[0].id);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_failed_job_frees_its_key() {
        let queue = MemoryQueue::new();
        let task = Task::new("u1", "Walk", None, now());
        let id = queue.enqueue(job(&task, LadderSlot::First)).await.unwrap();
        queue.claim(1).await.unwrap();
        queue.fail(id, "smtp down").await.unwrap();
        assert_eq!(queue.failures(), vec![(id, "smtp down".to_string())]);
        let again = queue.enqueue(job(&task, LadderSlot::First)).await.unwrap();
        assert_ne!(again, id);
    }

    #[tokio::test]
    async fn test_finished_jobs_are_bounded() {
        let queue = MemoryQueue::with_retention(2);
        let tasks: Vec<Task> = (0..3).map(|_| Task::new("u1", "Walk", None, now())).collect();
        for task in &tasks {
            let id = queue.enqueue(job(task, LadderSlot::First)).await.unwrap();
            queue.claim(1).await.unwrap();
            queue.ack(id).await.unwrap();
        }
        let state = queue.state();
        assert_eq!(state.done.len(), 2);
        assert_eq!(state.keys.len(), 2);
        assert!(!state.keys.contains_key(&format!("task:{}:first", tasks[0].id)));
        drop(state);

        // The two most recent keys still dedup.
        let before = queue.pending().await.unwrap();
        queue.enqueue(job(&tasks[2], LadderSlot::First)).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), before);

        for n in 0..5 {
            let id = queue.enqueue(job(&tasks[0], LadderSlot::Second)).await.unwrap();
            queue.claim(1).await.unwrap();
            queue.fail(id, &format!("attempt {n}")).await.unwrap();
        }
        let failures = queue.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[1].1, "attempt 4");
    }

    #[tokio::test]
    async fn test_acked_notification_keys_are_released() {
        let queue = MemoryQueue::new();
        let notification = Notification {
            receiver_id: "u1".into(),
            actor_id: "u2".into(),
            event_type: "follow".into(),
            message: "kim started following you.".into(),
            subject_id: None,
            created_at: now(),
        };
        let id = queue
            .enqueue(DispatchJob::notification(notification, now()))
            .await
            .unwrap();
        queue.claim(1).await.unwrap();
        queue.ack(id).await.unwrap();
        let state = queue.state();
        assert!(state.keys.is_empty());
        assert!(state.done.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_queue_rejects() {
        let queue = DisabledQueue;
        let task = Task::new("u1", "Walk", None, now());
        let err = queue.enqueue(job(&task, LadderSlot::First)).await.unwrap_err();
        assert!(matches!(err, HabitflowError::QueueDisabled));
        assert!(queue.claim(5).await.unwrap().is_empty());
    }
}
