//! Task store — the only shared mutable state of the reminder engine.
//!
//! Every mutation is a single per-task patch applied atomically, so
//! concurrent evaluations of different tasks never race.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use habitflow_core::clock::DayWindow;
use habitflow_core::error::{HabitflowError, Result};
use habitflow_core::types::Recipient;

use crate::tasks::{LadderSlot, Task, TaskPatch};

/// Creation-time range a tick looks at: yesterday and today.
///
/// Today's tasks run the ladder; yesterday's stragglers can only receive
/// the end-of-day overdue notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationWindow {
    pub today: DayWindow,
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl EvaluationWindow {
    pub fn for_tick(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let today = DayWindow::containing(now, offset);
        Self {
            today,
            from: today.start_of_yesterday(),
            until: today.start_of_tomorrow,
        }
    }

    /// The candidate filter, shared by every store implementation.
    pub fn includes(&self, task: &Task) -> bool {
        !task.completed
            && !task.ladder.is_set(LadderSlot::Final)
            && task.created_at >= self.from
            && task.created_at < self.until
    }
}

/// Persistence contract used by the engine, the worker and the CLI.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Incomplete tasks whose ladder is not exhausted, created inside `window`.
    async fn query_tasks_due_for_evaluation(&self, window: &EvaluationWindow)
    -> Result<Vec<Task>>;

    /// Apply a patch atomically and return the updated task.
    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task>;

    async fn insert_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Mark a task completed. Completing twice keeps the first timestamp.
    async fn complete_task(&self, id: &str, at: DateTime<Utc>) -> Result<Task> {
        self.update_task(id, &TaskPatch::completion(at)).await
    }

    /// All tasks of one owner, oldest first.
    async fn list_tasks(&self, owner_id: &str) -> Result<Vec<Task>>;

    /// Resolve a task owner into a delivery recipient.
    async fn owner(&self, owner_id: &str) -> Result<Option<Recipient>>;

    async fn upsert_owner(&self, recipient: &Recipient) -> Result<()>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
    owners: Mutex<HashMap<String, Recipient>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn owners(&self) -> std::sync::MutexGuard<'_, HashMap<String, Recipient>> {
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn query_tasks_due_for_evaluation(
        &self,
        window: &EvaluationWindow,
    ) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks()
            .values()
            .filter(|t| window.includes(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
        let mut tasks = self.tasks();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| HabitflowError::NotFound(format!("task {id}")))?;
        patch.apply(task);
        Ok(task.clone())
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks();
        if tasks.contains_key(&task.id) {
            return Err(HabitflowError::InvalidInput(format!(
                "task {} already exists",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks().get(id).cloned())
    }

    async fn list_tasks(&self, owner_id: &str) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks()
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn owner(&self, owner_id: &str) -> Result<Option<Recipient>> {
        Ok(self.owners().get(owner_id).cloned())
    }

    async fn upsert_owner(&self, recipient: &Recipient) -> Result<()> {
        self.owners()
            .insert(recipient.user_id.clone(), recipient.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use habitflow_core::clock::reference_offset;

    fn at(day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, h, 0, 0).unwrap()
    }

    #[test]
    fn test_window_covers_yesterday_and_today() {
        let window = EvaluationWindow::for_tick(at(10, 12), reference_offset(0));
        assert_eq!(window.from, at(9, 0));
        assert_eq!(window.until, at(11, 0));

        assert!(window.includes(&Task::new("u1", "a", None, at(9, 0))));
        assert!(window.includes(&Task::new("u1", "b", None, at(10, 23))));
        assert!(!window.includes(&Task::new("u1", "c", None, at(8, 23))));
        assert!(!window.includes(&Task::new("u1", "d", None, at(11, 0))));

        let mut done = Task::new("u1", "e", None, at(10, 1));
        done.completed = true;
        assert!(!window.includes(&done));

        let mut exhausted = Task::new("u1", "f", None, at(10, 1));
        exhausted.ladder.set(LadderSlot::Final);
        assert!(!window.includes(&exhausted));
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryTaskStore::new();
        store
            .upsert_owner(&Recipient::new("u1", "u1@example.com"))
            .await
            .unwrap();
        let task = Task::new("u1", "Meditate", None, at(10, 8));
        store.insert_task(&task).await.unwrap();
        assert!(store.insert_task(&task).await.is_err());

        let window = EvaluationWindow::for_tick(at(10, 12), reference_offset(0));
        assert_eq!(store.query_tasks_due_for_evaluation(&window).await.unwrap().len(), 1);

        let done = store
            .complete_task(&task.id, at(10, 9) + Duration::minutes(5))
            .await
            .unwrap();
        assert!(done.completed);
        assert!(store.query_tasks_due_for_evaluation(&window).await.unwrap().is_empty());
        assert_eq!(store.list_tasks("u1").await.unwrap().len(), 1);
        assert_eq!(
            store.owner("u1").await.unwrap().unwrap().email,
            "u1@example.com"
        );
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let store = MemoryTaskStore::new();
        let err = store
            .update_task("task-missing", &TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HabitflowError::NotFound(_)));
    }
}
