//! Remote execution platform surface consumed by the pipeline.
//!
//! [`Platform`] is the seam between the submission logic and the service:
//! [`http::SbgClient`] talks to the public API, [`retry::RetryingPlatform`]
//! wraps any implementation with the error-handler chain, and
//! [`memory::MemoryPlatform`] keeps everything in process.

pub mod config;
pub mod http;
pub mod memory;
pub mod retry;

use crate::error::PlatformResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Published, revisioned form of a workflow document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct App {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub raw: Value,
}

/// Opaque reference to file content stored on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileHandle {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_on: Option<String>,
}

impl FileHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        FileHandle {
            id: id.into(),
            name: name.into(),
            size: None,
            modified_on: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Draft,
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Draft => "DRAFT",
            TaskStatus::Created => "CREATED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Aborted => "ABORTED",
            TaskStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub outputs: Value,
}

/// Body of a task creation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTask {
    pub name: String,
    pub project: String,
    pub app: String,
    pub inputs: Value,
    pub use_interruptible_instances: bool,
    /// Start immediately instead of leaving the task as a draft.
    #[serde(skip)]
    pub run: bool,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn current_user(&self) -> PlatformResult<User>;

    /// Look up a project by its qualified `<owner>/<name>` id.
    async fn get_project(&self, id: &str) -> PlatformResult<Project>;

    async fn get_app(&self, id: &str) -> PlatformResult<App>;

    /// Create a new app at `id` from a raw document.
    async fn install_app(&self, id: &str, raw: &Value) -> PlatformResult<App>;

    async fn create_app_revision(&self, id: &str, revision: u64, raw: &Value)
    -> PlatformResult<App>;

    /// Files in `project` whose name equals `name` exactly.
    async fn query_files(&self, project: &str, name: &str) -> PlatformResult<Vec<FileHandle>>;

    async fn get_file(&self, id: &str) -> PlatformResult<FileHandle>;

    /// Upload the content of `source` into `project` under `name`.
    async fn upload_file(
        &self,
        project: &str,
        source: &Path,
        name: &str,
    ) -> PlatformResult<FileHandle>;

    /// Write the content of `file` to `destination`.
    async fn download_file(&self, file: &FileHandle, destination: &Path) -> PlatformResult<()>;

    async fn create_task(&self, request: &NewTask) -> PlatformResult<Task>;

    async fn get_task(&self, id: &str) -> PlatformResult<Task>;
}
