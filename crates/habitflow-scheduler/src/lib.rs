//! # Habitflow Scheduler
//!
//! Task reminder engine and notification dispatch queue.
//!
//! ## Design Principles
//! - One evaluation pass per task per tick, table-driven rung ladders
//! - Enqueue first, then persist the ladder flags (with retries)
//! - SQLite persistence for tasks, the queue and the inbox; survives restarts
//! - Tokio timers only, a single dispatch worker with bounded concurrency
//!
//! ## Architecture
//! ```text
//! Ticker (tokio interval, 60s)
//!   └── ReminderEngine::tick
//!         ├── TaskStore::query_tasks_due_for_evaluation (yesterday + today)
//!         ├── ReminderPolicy::evaluate → Skip | Suppressed | Fire
//!         ├── DispatchQueue::enqueue (dedup key task:{id}:{slot})
//!         └── TaskStore::update_task (ladder flags, last send)
//!
//! DispatchWorker (semaphore, 5 permits)
//!   └── claim → DeliveryRouter
//!                 ├── InAppChannel (notifications table)
//!                 ├── EmailChannel (SMTP)
//!                 └── WebhookChannel (HTTP POST)
//! ```

pub mod engine;
pub mod inbox;
pub mod ladder;
pub mod notify;
pub mod persistence;
pub mod policy;
pub mod queue;
pub mod store;
pub mod tasks;
pub mod worker;

pub use engine::{ReminderEngine, TaskOutcome, TickReport, spawn_scheduler};
pub use inbox::{InAppChannel, InboxEntry, MemoryInbox, NotificationInbox};
pub use ladder::{LadderKind, Rung, RungTable, Trigger};
pub use notify::{Actor, NotificationEvent, publish};
pub use persistence::SchedulerDb;
pub use policy::{Decision, FiringPlan, ReminderPolicy, SkipReason};
pub use queue::{DisabledQueue, DispatchJob, DispatchQueue, JobId, JobKind, MemoryQueue, QueuedJob};
pub use store::{EvaluationWindow, MemoryTaskStore, TaskStore};
pub use tasks::{LadderSlot, ReminderLadder, Task, TaskPatch};
pub use worker::{DeliveryRouter, DispatchWorker, SeenJobs, WorkerStats};
