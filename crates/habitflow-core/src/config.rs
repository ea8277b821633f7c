//! Habitflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HabitflowError, Result};

/// Number of ladder slots available to tasks without a due time.
pub const NO_DUE_TIME_SLOTS: usize = 4;
/// Number of ladder slots available to tasks with a due time.
pub const DUE_TIME_SLOTS: usize = 2;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HabitflowConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl HabitflowConfig {
    /// Load config from the default path (~/.habitflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HabitflowError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| HabitflowError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        tracing::debug!("📄 Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| HabitflowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.queue.validate()
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Habitflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".habitflow")
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.habitflow/habitflow.db".into() }

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// One rung of the no-due-time ladder: fires once `after_mins` have elapsed
/// since the task was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElapsedRung {
    pub after_mins: u32,
    pub label: String,
}

/// One rung of the due-time ladder: fires inside `[due - before_mins, due)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRung {
    pub before_mins: u32,
    pub label: String,
}

/// Reminder policy + ticker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Offset of the reference timezone used for day boundaries.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Minimum gap between two sends for the same task.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_concurrent_evaluations")]
    pub max_concurrent_evaluations: usize,
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,
    #[serde(default = "default_persist_retry_backoff_ms")]
    pub persist_retry_backoff_ms: u64,
    /// How long before the end of the creation day the end-of-day overdue
    /// notice opens for tasks without a due time.
    #[serde(default = "default_end_of_day_lead_mins")]
    pub end_of_day_lead_mins: u32,
    #[serde(default = "default_no_due_time_rungs")]
    pub no_due_time_rungs: Vec<ElapsedRung>,
    #[serde(default = "default_due_time_rungs")]
    pub due_time_rungs: Vec<LeadRung>,
}

fn default_tick_secs() -> u64 { 60 }
fn default_cooldown_secs() -> u64 { 600 }
fn default_max_concurrent_evaluations() -> usize { 8 }
fn default_persist_retries() -> u32 { 3 }
fn default_persist_retry_backoff_ms() -> u64 { 200 }
fn default_end_of_day_lead_mins() -> u32 { 60 }

fn default_no_due_time_rungs() -> Vec<ElapsedRung> {
    [(120, "2 hours"), (360, "6 hours"), (720, "12 hours"), (1380, "23 hours")]
        .into_iter()
        .map(|(after_mins, label)| ElapsedRung { after_mins, label: label.into() })
        .collect()
}

fn default_due_time_rungs() -> Vec<LeadRung> {
    [(120, "2 hours"), (30, "30 minutes")]
        .into_iter()
        .map(|(before_mins, label)| LeadRung { before_mins, label: label.into() })
        .collect()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            utc_offset_minutes: 0,
            cooldown_secs: default_cooldown_secs(),
            max_concurrent_evaluations: default_max_concurrent_evaluations(),
            persist_retries: default_persist_retries(),
            persist_retry_backoff_ms: default_persist_retry_backoff_ms(),
            end_of_day_lead_mins: default_end_of_day_lead_mins(),
            no_due_time_rungs: default_no_due_time_rungs(),
            due_time_rungs: default_due_time_rungs(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_secs == 0 {
            return Err(HabitflowError::Config("scheduler.tick_secs must be > 0".into()));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(HabitflowError::Config(
                "scheduler.utc_offset_minutes must be within ±1439".into(),
            ));
        }
        if self.end_of_day_lead_mins >= 24 * 60 {
            return Err(HabitflowError::Config(
                "scheduler.end_of_day_lead_mins must be shorter than a day".into(),
            ));
        }
        if self.no_due_time_rungs.len() > NO_DUE_TIME_SLOTS {
            return Err(HabitflowError::Config(format!(
                "at most {NO_DUE_TIME_SLOTS} no_due_time_rungs are supported"
            )));
        }
        if self.due_time_rungs.len() > DUE_TIME_SLOTS {
            return Err(HabitflowError::Config(format!(
                "at most {DUE_TIME_SLOTS} due_time_rungs are supported"
            )));
        }
        if self
            .no_due_time_rungs
            .windows(2)
            .any(|w| w[0].after_mins >= w[1].after_mins)
        {
            return Err(HabitflowError::Config(
                "no_due_time_rungs thresholds must be strictly increasing".into(),
            ));
        }
        if self
            .due_time_rungs
            .windows(2)
            .any(|w| w[0].before_mins <= w[1].before_mins)
        {
            return Err(HabitflowError::Config(
                "due_time_rungs lead times must be strictly decreasing".into(),
            ));
        }
        let labels = self
            .no_due_time_rungs
            .iter()
            .map(|r| &r.label)
            .chain(self.due_time_rungs.iter().map(|r| &r.label));
        for label in labels {
            if label.trim().is_empty() {
                return Err(HabitflowError::Config("rung labels must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Which dispatch queue implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// Durable SQLite-backed queue (survives restarts).
    Sqlite,
    /// In-process queue, lost on exit.
    Memory,
    /// No queue: enqueue always fails and tasks stay untouched.
    Disabled,
}

/// Dispatch queue + worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_backend")]
    pub backend: QueueBackend,
    /// Concurrent job handlers in the worker.
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How many recently handled dedup keys the worker remembers.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Claimed jobs not acknowledged within this window are handed out again.
    #[serde(default = "default_reclaim_after_secs")]
    pub reclaim_after_secs: u64,
    /// Done and failed jobs older than this are deleted from the SQLite queue.
    #[serde(default = "default_retain_finished_hours")]
    pub retain_finished_hours: u64,
}

fn default_queue_backend() -> QueueBackend { QueueBackend::Sqlite }
fn default_queue_concurrency() -> usize { 5 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_batch_size() -> usize { 20 }
fn default_dedup_capacity() -> usize { 1024 }
fn default_reclaim_after_secs() -> u64 { 300 }
fn default_retain_finished_hours() -> u64 { 168 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            concurrency: default_queue_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            dedup_capacity: default_dedup_capacity(),
            reclaim_after_secs: default_reclaim_after_secs(),
            retain_finished_hours: default_retain_finished_hours(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(HabitflowError::Config("queue.concurrency must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(HabitflowError::Config("queue.batch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Delivery channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Record reminders in the in-app notification inbox.
    #[serde(default = "bool_true")]
    pub in_app: bool,
    #[serde(default)]
    pub email: Option<EmailDeliveryConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookDeliveryConfig>,
}

fn bool_true() -> bool { true }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            in_app: true,
            email: None,
            webhook: None,
        }
    }
}

/// SMTP settings for reminder emails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailDeliveryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Sender address.
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_smtp_port() -> u16 { 587 }
fn default_from() -> String { "noreply@habitflow.local".into() }

/// Outbound HTTP webhook for reminders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}
