//! Task queue access
//!
//! The walker only needs a task's status and definition. Downloading is done
//! by a collaborator; `DirectoryQueue` reads what it left in the work
//! directory:
//!
//! ```text
//! <work>/<taskId>/status.json
//! <work>/<taskId>/task.json
//! <work>/<taskId>/artifacts/...
//! ```

use crate::trust::error::{CotError, CotResult};
use crate::trust::manifest::TaskDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::trace;

pub const STATUS_FILE: &str = "status.json";
pub const TASK_FILE: &str = "task.json";
pub const ARTIFACTS_DIR: &str = "artifacts";

const COMPLETED: &str = "completed";

/// One run of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: u32,
    pub state: String,
    #[serde(default)]
    pub worker_group: String,
    #[serde(default)]
    pub worker_id: String,
}

/// Queue status of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    pub state: String,
    #[serde(default)]
    pub runs: Vec<RunInfo>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: TaskStatus,
}

impl TaskStatus {
    pub fn last_run(&self) -> Option<&RunInfo> {
        self.runs.last()
    }

    /// The last run, provided both the task and that run completed
    pub fn ensure_completed(&self) -> CotResult<&RunInfo> {
        let last_run_state = self.last_run().map_or("none", |r| r.state.as_str());
        match self.last_run() {
            Some(run) if self.state == COMPLETED && run.state == COMPLETED => Ok(run),
            _ => Err(CotError::TaskNotCompleted {
                task_id: self.task_id.clone(),
                state: self.state.clone(),
                last_run_state: last_run_state.to_string(),
            }),
        }
    }
}

/// Read access to the task queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn status(&self, task_id: &str) -> CotResult<TaskStatus>;

    async fn task(&self, task_id: &str) -> CotResult<TaskDefinition>;
}

/// Queue view over a work directory populated by the downloader
#[derive(Debug, Clone)]
pub struct DirectoryQueue {
    root: PathBuf,
}

impl DirectoryQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryQueue { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    pub fn artifact_dir(&self, task_id: &str) -> PathBuf {
        artifact_dir(&self.root, task_id)
    }

    // A file the downloader has not produced yet is worth waiting for.
    async fn read(&self, task_id: &str, file: &str) -> CotResult<String> {
        let path = self.task_dir(task_id).join(file);
        trace!("Reading {}", path.display());
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CotError::TransientFetch {
                task_id: task_id.to_string(),
                message: format!("{} not available yet", path.display()),
            }),
            Err(e) => Err(CotError::io(path, e)),
        }
    }
}

/// Artifact directory of `task_id` under a work directory
pub fn artifact_dir(work_dir: &Path, task_id: &str) -> PathBuf {
    work_dir.join(task_id).join(ARTIFACTS_DIR)
}

#[async_trait]
impl TaskQueue for DirectoryQueue {
    async fn status(&self, task_id: &str) -> CotResult<TaskStatus> {
        let text = self.read(task_id, STATUS_FILE).await?;
        // Accept both the queue's `{"status": {...}}` envelope and a bare status.
        let status = match serde_json::from_str::<StatusResponse>(&text) {
            Ok(response) => response.status,
            Err(_) => serde_json::from_str::<TaskStatus>(&text)
                .map_err(|e| CotError::json(format!("status of task {task_id}"), e))?,
        };
        if status.task_id != task_id {
            return Err(CotError::TaskGraph {
                task_id: task_id.to_string(),
                message: format!("status file describes task {}", status.task_id),
            });
        }
        Ok(status)
    }

    async fn task(&self, task_id: &str) -> CotResult<TaskDefinition> {
        let text = self.read(task_id, TASK_FILE).await?;
        serde_json::from_str(&text).map_err(|e| CotError::json(format!("task {task_id}"), e))
    }
}
