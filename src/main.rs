//! # Habitflow — task reminders and notification dispatch
//!
//! Usage:
//!   habitflow run                                  # Ticker + dispatch worker until Ctrl-C
//!   habitflow tick --at 2026-03-10T10:01:00Z       # One evaluation pass
//!   habitflow drain                                # Deliver everything queued
//!   habitflow user add u1 ada@example.com
//!   habitflow task add u1 "Read 20 pages" --due 2026-03-10T18:00:00Z
//!   habitflow notify '{"event":"follow","actor":{"id":"u2","username":"bob"},"followee_id":"u1"}'
//!   habitflow inbox u1 --unread

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use habitflow_core::clock::{Clock, SystemClock};
use habitflow_core::config::{HabitflowConfig, QueueBackend};
use habitflow_core::traits::DeliveryChannel;
use habitflow_core::types::Recipient;
use habitflow_scheduler::{
    DeliveryRouter, DisabledQueue, DispatchQueue, DispatchWorker, InAppChannel, MemoryInbox,
    MemoryQueue, MemoryTaskStore, NotificationEvent, NotificationInbox, ReminderEngine,
    SchedulerDb, Task, TaskStore, WorkerStats,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "habitflow",
    version,
    about = "⏰ Habitflow — task reminders and notification dispatch"
)]
struct Cli {
    /// Config file (default: ~/.habitflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Keep tasks, queue and inbox in memory instead of SQLite
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reminder ticker and the dispatch worker until Ctrl-C
    Run,
    /// Run a single evaluation tick
    Tick {
        /// Evaluate as of this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<String>,
    },
    /// Deliver every queued job, then exit
    Drain,
    /// Manage users
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Publish a social notification event (JSON)
    Notify {
        /// e.g. {"event":"follow","actor":{"id":"u2","username":"bob"},"followee_id":"u1"}
        event: String,
    },
    /// Show a user's notifications, newest first
    Inbox {
        user: String,
        /// Only unread notifications
        #[arg(long)]
        unread: bool,
        /// Mark everything shown as read
        #[arg(long)]
        mark_read: bool,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Add or update a user
    Add {
        id: String,
        email: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a task for a user
    Add {
        owner: String,
        description: String,
        /// Due time (RFC 3339). Without one the task is due by end of day.
        #[arg(long)]
        due: Option<String>,
    },
    /// Mark a task completed
    Complete { id: String },
    /// List a user's tasks
    List { owner: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show,
}

/// Storage handles, backed by one SQLite file or by memory.
struct Backends {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    inbox: Arc<dyn NotificationInbox>,
}

impl Backends {
    fn open(config: &HabitflowConfig, ephemeral: bool, clock: Arc<dyn Clock>) -> Result<Self> {
        if ephemeral {
            let queue: Arc<dyn DispatchQueue> = match config.queue.backend {
                QueueBackend::Disabled => Arc::new(DisabledQueue),
                QueueBackend::Sqlite | QueueBackend::Memory => {
                    Arc::new(MemoryQueue::with_retention(config.queue.dedup_capacity))
                }
            };
            return Ok(Self {
                store: Arc::new(MemoryTaskStore::new()),
                queue,
                inbox: Arc::new(MemoryInbox::new()),
            });
        }

        let path = config.database.resolved_path();
        let db = Arc::new(
            SchedulerDb::open(&path)
                .with_context(|| format!("opening database {}", path.display()))?
                .with_clock(clock)
                .with_reclaim_after(chrono::Duration::seconds(
                    i64::try_from(config.queue.reclaim_after_secs).unwrap_or(i64::MAX),
                ))
                .with_retention(chrono::Duration::hours(
                    i64::try_from(config.queue.retain_finished_hours).unwrap_or(i64::MAX),
                )),
        );
        let queue: Arc<dyn DispatchQueue> = match config.queue.backend {
            QueueBackend::Sqlite => db.clone(),
            QueueBackend::Memory => Arc::new(MemoryQueue::with_retention(config.queue.dedup_capacity)),
            QueueBackend::Disabled => Arc::new(DisabledQueue),
        };
        Ok(Self {
            store: db.clone(),
            queue,
            inbox: db,
        })
    }

    fn router(&self, config: &HabitflowConfig, clock: Arc<dyn Clock>) -> DeliveryRouter {
        let mut channels: Vec<Arc<dyn DeliveryChannel>> = Vec::new();
        if config.delivery.in_app {
            channels.push(Arc::new(InAppChannel::new(self.inbox.clone(), clock.clone())));
        }
        channels.extend(habitflow_channels::channels_from_config(config, clock));
        let router = DeliveryRouter::new(channels);
        if router.is_empty() {
            tracing::warn!("⚠️ No delivery channels enabled, every job will fail");
        }
        router
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    match &cli.config {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => HabitflowConfig::default_path(),
    }
}

fn load_config(path: &Path) -> Result<HabitflowConfig> {
    if path.exists() {
        Ok(HabitflowConfig::load_from(path)?)
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        Ok(HabitflowConfig::default())
    }
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("'{raw}' is not an RFC 3339 timestamp"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "habitflow=debug,habitflow_core=debug,habitflow_scheduler=debug,habitflow_channels=debug"
    } else {
        "habitflow=info,habitflow_scheduler=info,habitflow_channels=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

async fn drain(worker: &DispatchWorker) -> Result<WorkerStats> {
    let mut total = WorkerStats::default();
    loop {
        let batch = worker.process_once().await?;
        if batch.claimed == 0 {
            return Ok(total);
        }
        total.claimed += batch.claimed;
        total.delivered += batch.delivered;
        total.duplicates += batch.duplicates;
        total.failed += batch.failed;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let path = config_path(&cli);
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init { force } => {
                if path.exists() && !force {
                    println!("⚠️  {} already exists (use --force to overwrite)", path.display());
                } else {
                    HabitflowConfig::default().save_to(&path)?;
                    println!("✅ Wrote {}", path.display());
                }
                Ok(())
            }
            ConfigAction::Show => {
                let config = load_config(&path)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        };
    }

    let config = load_config(&path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backends = Backends::open(&config, cli.ephemeral, clock.clone())?;

    match cli.command {
        Command::Run => {
            let engine = Arc::new(ReminderEngine::new(
                backends.store.clone(),
                backends.queue.clone(),
                clock.clone(),
                &config.scheduler,
            ));
            let worker = Arc::new(DispatchWorker::new(
                backends.queue.clone(),
                backends.router(&config, clock.clone()),
                &config.queue,
            ));
            let ticker = habitflow_scheduler::spawn_scheduler(
                engine,
                std::time::Duration::from_secs(config.scheduler.tick_secs),
            );
            let worker_handle = worker.spawn();

            tokio::signal::ctrl_c().await?;
            tracing::info!("👋 Shutting down");
            ticker.abort();
            worker_handle.abort();
        }
        Command::Tick { at } => {
            let engine = ReminderEngine::new(
                backends.store.clone(),
                backends.queue.clone(),
                clock.clone(),
                &config.scheduler,
            );
            let report = match at {
                Some(raw) => engine.tick_at(parse_instant(&raw)?).await?,
                None => engine.tick().await?,
            };
            println!(
                "⏰ {} candidates: {} fired ({} folded), {} suppressed, {} skipped, {} failed",
                report.candidates,
                report.fired,
                report.retroactive,
                report.suppressed,
                report.skipped,
                report.failed
            );
        }
        Command::Drain => {
            let worker = DispatchWorker::new(
                backends.queue.clone(),
                backends.router(&config, clock.clone()),
                &config.queue,
            );
            let stats = drain(&worker).await?;
            println!(
                "📬 {} jobs: {} delivered, {} duplicate, {} failed",
                stats.claimed, stats.delivered, stats.duplicates, stats.failed
            );
        }
        Command::User {
            action: UserAction::Add { id, email, name },
        } => {
            let recipient = Recipient {
                user_id: id,
                email,
                display_name: name,
            };
            backends.store.upsert_owner(&recipient).await?;
            println!("✅ User {} <{}>", recipient.user_id, recipient.email);
        }
        Command::Task { action } => match action {
            TaskAction::Add {
                owner,
                description,
                due,
            } => {
                let due = due.as_deref().map(parse_instant).transpose()?;
                if backends.store.owner(&owner).await?.is_none() {
                    tracing::warn!("⚠️ User '{owner}' is unknown; reminders cannot be delivered yet");
                }
                let task = Task::new(&owner, &description, due, clock.now());
                backends.store.insert_task(&task).await?;
                println!("✅ {}", task.id);
            }
            TaskAction::Complete { id } => {
                let task = backends.store.complete_task(&id, clock.now()).await?;
                println!("✅ '{}' completed", task.description);
            }
            TaskAction::List { owner } => {
                for task in backends.store.list_tasks(&owner).await? {
                    let status = if task.completed { "done" } else { "open" };
                    let due = task
                        .due_time
                        .map(|d| d.to_rfc3339())
                        .unwrap_or_else(|| "end of day".into());
                    let fired: Vec<&str> = task.ladder.fired().iter().map(|s| s.as_str()).collect();
                    println!(
                        "{}  [{status}]  {}  (due: {due}, sent: {})",
                        task.id,
                        task.description,
                        if fired.is_empty() { "-".to_string() } else { fired.join(",") }
                    );
                }
            }
        },
        Command::Notify { event } => {
            let event: NotificationEvent =
                serde_json::from_str(&event).context("parsing notification event")?;
            let ids = habitflow_scheduler::publish(backends.queue.as_ref(), event, clock.now()).await?;
            println!("📣 Queued {} notification(s)", ids.len());
        }
        Command::Inbox {
            user,
            unread,
            mark_read,
        } => {
            let entries = backends.inbox.list(&user, unread).await?;
            if entries.is_empty() {
                println!("📭 No notifications");
            }
            for entry in &entries {
                let marker = if entry.read { " " } else { "•" };
                println!(
                    "{marker} #{} {}  [{}] {}",
                    entry.id,
                    entry.notification.created_at.format("%Y-%m-%d %H:%M"),
                    entry.notification.event_type,
                    entry.notification.message
                );
            }
            if mark_read {
                let changed = backends.inbox.mark_all_read(&user).await?;
                println!("✅ Marked {changed} as read");
            }
        }
        Command::Config { .. } => {}
    }

    Ok(())
}
