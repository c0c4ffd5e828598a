//! # Persisted Task Repository
//!
//! The repository is the durable owner of queued tasks. The engine writes a
//! task when it is admitted, records every step escalation, and deletes the
//! task when it is reserved or removed. After a restart
//! `RoutingEngine::restore_from_repository` re-enqueues everything
//! [`TaskRepository::load_all`] returns and re-arms each escalation timer
//! from the task's remaining per-step budget.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::Result;
use crate::queue::{QueuedTask, TaskId};

pub use sqlite::SqliteTaskRepository;

/// Storage seam for queued tasks
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert or replace a task
    async fn save(&self, task: &QueuedTask) -> Result<()>;

    /// Record a step change
    async fn update_step(
        &self,
        task_id: &TaskId,
        step_index: usize,
        step_started_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Delete a task; returns false if it was not stored
    async fn remove(&self, task_id: &TaskId) -> Result<bool>;

    /// Every stored task
    async fn load_all(&self) -> Result<Vec<QueuedTask>>;
}

/// Repository kept in memory, for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: DashMap<TaskId, QueuedTask>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, task_id: &TaskId) -> Option<QueuedTask> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &QueuedTask) -> Result<()> {
        self.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn update_step(
        &self,
        task_id: &TaskId,
        step_index: usize,
        step_started_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.step_index = step_index;
            task.step_started_at = step_started_at;
        }
        Ok(())
    }

    async fn remove(&self, task_id: &TaskId) -> Result<bool> {
        Ok(self.tasks.remove(task_id).is_some())
    }

    async fn load_all(&self) -> Result<Vec<QueuedTask>> {
        Ok(self.tasks.iter().map(|entry| entry.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MediaDomainId;
    use crate::queue::QueueId;

    #[tokio::test]
    async fn test_in_memory_lifecycle() {
        let repo = InMemoryTaskRepository::new();
        let task = QueuedTask::new("t1", "c1", QueueId::from("q"), MediaDomainId::from("chat"), 3);
        repo.save(&task).await.unwrap();

        let now = Utc::now();
        repo.update_step(&task.task_id, 2, now).await.unwrap();
        let stored = repo.get(&task.task_id).unwrap();
        assert_eq!(stored.step_index, 2);
        assert_eq!(stored.step_started_at, now);

        assert!(repo.remove(&task.task_id).await.unwrap());
        assert!(!repo.remove(&task.task_id).await.unwrap());
        assert!(repo.load_all().await.unwrap().is_empty());
    }
}
