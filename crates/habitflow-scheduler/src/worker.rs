//! Dispatch worker — drains the queue and hands jobs to delivery channels.
//!
//! One logical worker per process. Jobs in a batch run concurrently, bounded
//! by a semaphore; a failing job is logged and dropped without affecting the
//! others.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use habitflow_core::config::QueueConfig;
use habitflow_core::error::{HabitflowError, Result};
use habitflow_core::traits::DeliveryChannel;
use habitflow_core::types::MessageId;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::queue::{DispatchJob, DispatchQueue, JobKind, QueuedJob};

/// Fans a job out to every configured channel.
pub struct DeliveryRouter {
    channels: Vec<Arc<dyn DeliveryChannel>>,
}

impl DeliveryRouter {
    pub fn new(channels: Vec<Arc<dyn DeliveryChannel>>) -> Self {
        Self { channels }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Deliver a job. Succeeds if at least one channel accepted it.
    pub async fn deliver(&self, job: &DispatchJob) -> Result<Vec<(String, MessageId)>> {
        let mut sent = Vec::new();
        let mut errors = Vec::new();

        for channel in &self.channels {
            let result = match job.kind {
                JobKind::Reminder => channel
                    .send_reminder(&job.recipient, &job.description, &job.label)
                    .await
                    .map(Some),
                JobKind::Overdue => match job.overdue {
                    Some(overdue) => channel
                        .send_overdue_notice(&job.recipient, &job.description, overdue)
                        .await
                        .map(Some),
                    None => Err(HabitflowError::InvalidInput(
                        "overdue job without overdue time".into(),
                    )),
                },
                JobKind::Notification => match &job.notification {
                    Some(notification) => channel.send_notification(notification).await,
                    None => Err(HabitflowError::InvalidInput(
                        "notification job without payload".into(),
                    )),
                },
            };

            match result {
                Ok(Some(id)) => sent.push((channel.name().to_string(), id)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("⚠️ [{}] {} '{}' failed: {e}", channel.name(), job.kind, job.dedup_key);
                    errors.push(format!("{}: {e}", channel.name()));
                }
            }
        }

        if !sent.is_empty() {
            return Ok(sent);
        }
        if errors.is_empty() {
            Err(HabitflowError::Delivery(format!(
                "no channel accepts {} jobs",
                job.kind
            )))
        } else {
            Err(HabitflowError::Delivery(errors.join("; ")))
        }
    }
}

/// Bounded set of recently handled dedup keys. Oldest keys are evicted first.
#[derive(Debug)]
pub struct SeenJobs {
    capacity: usize,
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl SeenJobs {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    /// Returns false if the key was already seen.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.keys.remove(&oldest);
        }
        self.order.push_back(key.to_string());
        self.keys.insert(key.to_string());
        true
    }

    pub fn remove(&mut self, key: &str) {
        if self.keys.remove(key) {
            self.order.retain(|k| k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Counters for one drained batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub claimed: usize,
    pub delivered: usize,
    pub duplicates: usize,
    pub failed: usize,
}

enum JobOutcome {
    Delivered,
    Duplicate,
    Failed,
}

pub struct DispatchWorker {
    queue: Arc<dyn DispatchQueue>,
    router: Arc<DeliveryRouter>,
    seen: Arc<Mutex<SeenJobs>>,
    permits: Arc<Semaphore>,
    batch_size: usize,
    poll_interval: Duration,
}

impl DispatchWorker {
    pub fn new(queue: Arc<dyn DispatchQueue>, router: DeliveryRouter, config: &QueueConfig) -> Self {
        Self {
            queue,
            router: Arc::new(router),
            seen: Arc::new(Mutex::new(SeenJobs::new(config.dedup_capacity))),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Claim one batch, run every job and wait for all of them.
    pub async fn process_once(&self) -> Result<WorkerStats> {
        let jobs = self.queue.claim(self.batch_size).await?;
        let mut stats = WorkerStats {
            claimed: jobs.len(),
            ..WorkerStats::default()
        };
        if jobs.is_empty() {
            return Ok(stats);
        }

        let mut set = JoinSet::new();
        for queued in jobs {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| HabitflowError::Queue(format!("worker semaphore closed: {e}")))?;
            let queue = self.queue.clone();
            let router = self.router.clone();
            let seen = self.seen.clone();
            set.spawn(async move {
                let _permit = permit;
                handle_job(queue.as_ref(), &router, &seen, queued).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(JobOutcome::Delivered) => stats.delivered += 1,
                Ok(JobOutcome::Duplicate) => stats.duplicates += 1,
                Ok(JobOutcome::Failed) => stats.failed += 1,
                Err(e) => {
                    tracing::error!("❌ Dispatch job aborted: {e}");
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Keep draining until `process_once` is no longer called.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            "📬 Dispatch worker started (queue: {}, channels: {})",
            self.queue.name(),
            self.router.channel_names().join(", ")
        );
        loop {
            match self.process_once().await {
                Ok(stats) if stats.claimed == 0 => tokio::time::sleep(self.poll_interval).await,
                Ok(stats) => tracing::debug!(
                    "📬 Batch: {} delivered, {} duplicate, {} failed",
                    stats.delivered,
                    stats.duplicates,
                    stats.failed
                ),
                Err(e) => {
                    tracing::warn!("⚠️ Dispatch worker: {e}");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn handle_job(
    queue: &dyn DispatchQueue,
    router: &DeliveryRouter,
    seen: &Mutex<SeenJobs>,
    queued: QueuedJob,
) -> JobOutcome {
    let key = queued.job.dedup_key.clone();
    let fresh = seen.lock().unwrap_or_else(|e| e.into_inner()).insert(&key);
    if !fresh {
        tracing::debug!("📭 Duplicate '{key}' dropped ({})", queued.id);
        if let Err(e) = queue.ack(queued.id).await {
            tracing::warn!("⚠️ Ack {} failed: {e}", queued.id);
        }
        return JobOutcome::Duplicate;
    }

    match router.deliver(&queued.job).await {
        Ok(sent) => {
            let channels: Vec<&str> = sent.iter().map(|(name, _)| name.as_str()).collect();
            tracing::info!(
                "📤 {} for {} delivered via {}",
                queued.job.kind,
                queued.job.recipient.user_id,
                channels.join(", ")
            );
            if let Err(e) = queue.ack(queued.id).await {
                tracing::warn!("⚠️ Ack {} failed: {e}", queued.id);
            }
            JobOutcome::Delivered
        }
        Err(e) => {
            tracing::warn!("⚠️ Dropping {} '{key}': {e}", queued.id);
            seen.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            if let Err(e) = queue.fail(queued.id, &e.to_string()).await {
                tracing::warn!("⚠️ Marking {} failed: {e}", queued.id);
            }
            JobOutcome::Failed
        }
    }
}
