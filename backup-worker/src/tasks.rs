//! Tracking of exclusive long-running operations on this node.
//!
//! At most one backup and one restore can be registered at a time. A task is
//! released when its guard is dropped, so every exit path (including errors
//! and panics) clears it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Result, WorkerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Backup,
    Restore,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Backup => write!(f, "backup"),
            Op::Restore => write!(f, "restore"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub op: Op,
    pub ts: u64,
    pub started_at: DateTime<Utc>,
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.op, self.ts)
    }
}

#[derive(Clone, Default)]
pub struct TaskTracker {
    tasks: Arc<Mutex<HashMap<Op, TaskInfo>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Op, TaskInfo>> {
        // A panic while holding the lock leaves the map consistent
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `op` at timestamp `ts`.
    ///
    /// A backup cannot overlap another backup or a restore; a restore cannot
    /// overlap another restore.
    pub fn start_task(&self, op: Op, ts: u64) -> Result<TaskGuard> {
        let mut tasks = self.lock();

        match op {
            Op::Backup => {
                if let Some(running) = tasks.get(&Op::Restore).or_else(|| tasks.get(&Op::Backup)) {
                    return Err(WorkerError::TaskConflict {
                        requested: format!("{}@{}", op, ts),
                        running: running.to_string(),
                    });
                }
            }
            Op::Restore => {
                if tasks.contains_key(&Op::Restore) {
                    return Err(WorkerError::RestoreInProgress);
                }
            }
        }

        tasks.insert(
            op,
            TaskInfo {
                op,
                ts,
                started_at: Utc::now(),
            },
        );
        tracing::debug!(%op, ts, "Task started");

        Ok(TaskGuard {
            tracker: self.clone(),
            op,
        })
    }

    pub fn is_running(&self, op: Op) -> bool {
        self.lock().contains_key(&op)
    }

    /// Snapshot of the running tasks, for status queries
    pub fn ongoing(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.lock().values().cloned().collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    fn finish(&self, op: Op) {
        if let Some(task) = self.lock().remove(&op) {
            tracing::debug!(task = %task, "Task finished");
        }
    }
}

/// Releases its task when dropped.
#[must_use = "the task is released as soon as the guard is dropped"]
pub struct TaskGuard {
    tracker: TaskTracker,
    op: Op,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.op);
    }
}
