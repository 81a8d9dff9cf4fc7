//! Background task supervisor.
//!
//! Fire-and-forget control operations are spawned through here. Each task
//! is registered while it runs, deregisters itself on completion and
//! leaves a typed [`TaskOutcome`] in a bounded history. On shutdown every
//! live task is aborted and awaited before the caller proceeds.

use crate::core::{now, Error, Result, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Identifier of a supervised task.
pub type TaskId = Uuid;

/// Completed tasks remembered for inspection.
const HISTORY_CAPACITY: usize = 1024;

/// Kind of control operation a task performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    InitCommunicator,
    UpdateNamedParam,
    ResetPrefixCache,
    CloseCommunicator,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::InitCommunicator => write!(f, "init_communicator"),
            TaskKind::UpdateNamedParam => write!(f, "update_named_param"),
            TaskKind::ResetPrefixCache => write!(f, "reset_prefix_cache"),
            TaskKind::CloseCommunicator => write!(f, "close_communicator"),
        }
    }
}

/// How a supervised task ended.
#[derive(Clone, Debug)]
pub enum TaskOutcome {
    Succeeded,
    Failed(Arc<Error>),
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }

    /// The failure, if the task failed.
    pub fn error(&self) -> Option<&Error> {
        match self {
            TaskOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// A task that is still running.
#[derive(Clone, Debug, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub kind: TaskKind,
    pub started_at: Timestamp,
}

/// A task that has finished.
#[derive(Clone, Debug)]
pub struct CompletedTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub outcome: TaskOutcome,
    pub finished_at: Timestamp,
}

/// Lifetime counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub spawned: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub live: usize,
}

/// What a shutdown drain observed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}

struct Entry {
    kind: TaskKind,
    started_at: Timestamp,
    handle: JoinHandle<TaskOutcome>,
}

#[derive(Default)]
struct Inner {
    tasks: Mutex<HashMap<TaskId, Entry>>,
    history: Mutex<VecDeque<CompletedTask>>,
    closed: AtomicBool,
    changed: Notify,
    spawned: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Inner {
    fn record(&self, id: TaskId, kind: TaskKind, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Succeeded => &self.succeeded,
            TaskOutcome::Failed(_) => &self.failed,
            TaskOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(CompletedTask {
            id,
            kind,
            outcome: outcome.clone(),
            finished_at: now(),
        });
        drop(history);
        self.changed.notify_waiters();
    }
}

/// Removes a task from the live set when its future finishes or is dropped.
struct Deregister {
    inner: Arc<Inner>,
    id: TaskId,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.inner.tasks.lock().remove(&self.id);
        self.inner.changed.notify_waiters();
    }
}

/// Registry of fire-and-forget tasks.
#[derive(Clone, Default)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

impl TaskSupervisor {
    /// Create an empty supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` as a supervised task and return immediately.
    ///
    /// Fails with `ShuttingDown` once [`shutdown`](Self::shutdown) has begun.
    pub fn spawn<F>(&self, kind: TaskKind, future: F) -> Result<TaskId>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let id = Uuid::new_v4();
        let inner = self.inner.clone();
        // The task cannot deregister before it is inserted: removal needs
        // the lock held here.
        let handle = tokio::spawn(async move {
            let _guard = Deregister {
                inner: inner.clone(),
                id,
            };
            let outcome = match future.await {
                Ok(()) => TaskOutcome::Succeeded,
                Err(e) => {
                    tracing::error!(task_id = %id, %kind, error = %e, "background task failed");
                    TaskOutcome::Failed(Arc::new(e))
                }
            };
            inner.record(id, kind, &outcome);
            outcome
        });

        tasks.insert(
            id,
            Entry {
                kind,
                started_at: now(),
                handle,
            },
        );
        self.inner.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(task_id = %id, %kind, live = tasks.len(), "background task scheduled");
        Ok(id)
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Tasks still running, oldest first.
    pub fn live_tasks(&self) -> Vec<TaskInfo> {
        let mut live: Vec<TaskInfo> = self
            .inner
            .tasks
            .lock()
            .iter()
            .map(|(id, e)| TaskInfo {
                id: *id,
                kind: e.kind,
                started_at: e.started_at,
            })
            .collect();
        live.sort_by_key(|t| t.started_at);
        live
    }

    /// Outcome of a finished task, if it is still in the history.
    pub fn outcome(&self, id: TaskId) -> Option<TaskOutcome> {
        self.inner
            .history
            .lock()
            .iter()
            .rev()
            .find(|t| t.id == id)
            .map(|t| t.outcome.clone())
    }

    /// Recently finished tasks, oldest first.
    pub fn history(&self) -> Vec<CompletedTask> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// Wait until the task has finished and return its outcome.
    pub async fn wait_for(&self, id: TaskId) -> Option<TaskOutcome> {
        loop {
            let changed = self.inner.changed.notified();
            if let Some(outcome) = self.outcome(id) {
                return Some(outcome);
            }
            if !self.inner.tasks.lock().contains_key(&id) {
                // Finished without a record, or never existed.
                return self.outcome(id);
            }
            changed.await;
        }
    }

    /// Wait until no task is running.
    pub async fn wait_idle(&self) {
        loop {
            let changed = self.inner.changed.notified();
            if self.is_empty() {
                return;
            }
            changed.await;
        }
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            spawned: self.inner.spawned.load(Ordering::SeqCst),
            succeeded: self.inner.succeeded.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
            cancelled: self.inner.cancelled.load(Ordering::SeqCst),
            live: self.len(),
        }
    }

    /// Refuse new tasks, cancel every live one and wait for all of them.
    ///
    /// Task errors are logged and counted, never returned.
    pub async fn shutdown(&self) -> DrainReport {
        let entries: Vec<(TaskId, Entry)> = {
            let mut tasks = self.inner.tasks.lock();
            self.inner.closed.store(true, Ordering::SeqCst);
            tasks.drain().collect()
        };

        tracing::info!(tasks = entries.len(), "cancelling background tasks");
        for (_, entry) in &entries {
            entry.handle.abort();
        }

        let mut report = DrainReport::default();
        for (id, entry) in entries {
            match entry.handle.await {
                Ok(TaskOutcome::Succeeded) => report.succeeded += 1,
                Ok(TaskOutcome::Failed(_)) => report.failed += 1,
                Ok(TaskOutcome::Cancelled) => report.cancelled += 1,
                Err(e) if e.is_cancelled() => {
                    report.cancelled += 1;
                    self.inner.record(id, entry.kind, &TaskOutcome::Cancelled);
                }
                Err(e) => {
                    tracing::error!(task_id = %id, kind = %entry.kind, error = %e, "background task panicked");
                    report.failed += 1;
                    let failure = TaskOutcome::Failed(Arc::new(Error::Engine(e.to_string())));
                    self.inner.record(id, entry.kind, &failure);
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "background tasks drained"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_removed_on_completion() {
        let supervisor = TaskSupervisor::new();
        let id = supervisor
            .spawn(TaskKind::ResetPrefixCache, async { Ok(()) })
            .unwrap();

        let outcome = supervisor.wait_for(id).await.unwrap();
        assert!(outcome.is_success());
        supervisor.wait_idle().await;
        assert!(supervisor.is_empty());
        assert_eq!(supervisor.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_propagated() {
        let supervisor = TaskSupervisor::new();
        let id = supervisor
            .spawn(TaskKind::UpdateNamedParam, async { Err(Error::NotInitialized) })
            .unwrap();

        let outcome = supervisor.wait_for(id).await.unwrap();
        assert!(matches!(outcome.error(), Some(Error::NotInitialized)));
        assert_eq!(supervisor.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_live_tasks() {
        let supervisor = TaskSupervisor::new();
        for _ in 0..3 {
            supervisor
                .spawn(TaskKind::InitCommunicator, async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(supervisor.live_tasks().len(), 3);

        let report = supervisor.shutdown().await;
        assert_eq!(report.cancelled, 3);
        assert_eq!(report.total(), 3);
        assert!(supervisor.is_empty());
        assert_eq!(supervisor.stats().cancelled, 3);
        assert!(supervisor
            .history()
            .iter()
            .all(|t| matches!(t.outcome, TaskOutcome::Cancelled)));
    }

    #[tokio::test]
    async fn test_spawn_rejected_after_shutdown() {
        let supervisor = TaskSupervisor::new();
        supervisor.shutdown().await;
        let err = supervisor
            .spawn(TaskKind::CloseCommunicator, async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        assert!(supervisor.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_with_mixed_tasks() {
        let supervisor = TaskSupervisor::new();
        let done = supervisor
            .spawn(TaskKind::CloseCommunicator, async { Ok(()) })
            .unwrap();
        supervisor.wait_for(done).await;
        supervisor
            .spawn(TaskKind::UpdateNamedParam, futures::future::pending())
            .unwrap();

        let report = supervisor.shutdown().await;
        assert_eq!(report.cancelled, 1);
        let stats = supervisor.stats();
        assert_eq!((stats.spawned, stats.succeeded, stats.cancelled), (2, 1, 1));
    }
}
