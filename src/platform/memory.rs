//! In-process [`Platform`] with scripted tasks and call accounting.

use super::{App, FileHandle, NewTask, Platform, Project, Task, TaskStatus, User};
use crate::error::{PlatformError, PlatformResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Number of times each mutating or polled operation was invoked.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallCounts {
    pub get_app: usize,
    pub install_app: usize,
    pub create_app_revision: usize,
    pub query_files: usize,
    pub get_file: usize,
    pub upload_file: usize,
    pub download_file: usize,
    pub create_task: usize,
    pub get_task: usize,
}

#[derive(Debug, Clone)]
struct StoredFile {
    project: String,
    handle: FileHandle,
    content: Vec<u8>,
}

#[derive(Debug, Clone)]
struct TaskScript {
    statuses: VecDeque<TaskStatus>,
    outputs: Value,
}

#[derive(Debug)]
struct TaskRecord {
    task: Task,
    pending: VecDeque<TaskStatus>,
    outputs: Value,
}

#[derive(Debug, Default)]
struct MemoryState {
    username: String,
    projects: BTreeSet<String>,
    apps: BTreeMap<String, App>,
    files: Vec<StoredFile>,
    scripts: VecDeque<TaskScript>,
    tasks: BTreeMap<String, TaskRecord>,
    submitted: Vec<NewTask>,
    calls: CallCounts,
    next_id: u64,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Monotonic timestamp so "most recent" is well defined.
    fn next_timestamp(&mut self) -> String {
        self.next_id += 1;
        let n = self.next_id;
        format!(
            "2020-01-01T{:02}:{:02}:{:02}Z",
            (n / 3600) % 24,
            (n / 60) % 60,
            n % 60
        )
    }

    fn file(&self, id: &str) -> PlatformResult<&StoredFile> {
        self.files
            .iter()
            .find(|f| f.handle.id == id)
            .ok_or_else(|| PlatformError::not_found(format!("file {id}")))
    }
}

#[derive(Debug, Default)]
pub struct MemoryPlatform {
    state: Mutex<MemoryState>,
}

impl MemoryPlatform {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                username: username.into(),
                ..MemoryState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_project(&self, id: impl Into<String>) {
        self.state().projects.insert(id.into());
    }

    /// Store a file as if it had been uploaded earlier.
    pub fn add_file(&self, project: &str, name: &str, content: impl Into<Vec<u8>>) -> FileHandle {
        let mut state = self.state();
        let content = content.into();
        let handle = FileHandle {
            id: state.next_id("file"),
            name: name.to_string(),
            size: Some(content.len() as u64),
            modified_on: Some(state.next_timestamp()),
        };
        state.files.push(StoredFile {
            project: project.to_string(),
            handle: handle.clone(),
            content,
        });
        handle
    }

    /// Queue the status sequence of the next created task. The first status is
    /// what creation returns; each refresh advances one step and the last one sticks.
    pub fn script_task(&self, statuses: Vec<TaskStatus>, outputs: Value) {
        self.state().scripts.push_back(TaskScript {
            statuses: statuses.into(),
            outputs,
        });
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls.clone()
    }

    pub fn submitted_tasks(&self) -> Vec<NewTask> {
        self.state().submitted.clone()
    }

    pub fn file_content(&self, id: &str) -> Option<Vec<u8>> {
        self.state().file(id).ok().map(|f| f.content.clone())
    }

    pub fn files_in(&self, project: &str) -> Vec<FileHandle> {
        self.state()
            .files
            .iter()
            .filter(|f| f.project == project)
            .map(|f| f.handle.clone())
            .collect()
    }

    pub fn app(&self, id: &str) -> Option<App> {
        self.state().apps.get(id).cloned()
    }
}

fn app_name(id: &str) -> String {
    id.rsplit('/').next().unwrap_or(id).to_string()
}

fn task_view(record: &TaskRecord) -> Task {
    let mut task = record.task.clone();
    task.outputs = if task.status.is_terminal() {
        record.outputs.clone()
    } else {
        Value::Null
    };
    task
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn current_user(&self) -> PlatformResult<User> {
        Ok(User {
            username: self.state().username.clone(),
        })
    }

    async fn get_project(&self, id: &str) -> PlatformResult<Project> {
        let state = self.state();
        if !state.projects.contains(id) {
            return Err(PlatformError::not_found(format!("project {id}")));
        }
        Ok(Project {
            id: id.to_string(),
            name: app_name(id),
        })
    }

    async fn get_app(&self, id: &str) -> PlatformResult<App> {
        let mut state = self.state();
        state.calls.get_app += 1;
        state
            .apps
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::not_found(format!("app {id}")))
    }

    async fn install_app(&self, id: &str, raw: &Value) -> PlatformResult<App> {
        let mut state = self.state();
        state.calls.install_app += 1;
        if state.apps.contains_key(id) {
            return Err(PlatformError::Client {
                status: 409,
                message: format!("app {id} already exists"),
            });
        }
        let app = App {
            id: id.to_string(),
            name: app_name(id),
            revision: 0,
            raw: raw.clone(),
        };
        state.apps.insert(id.to_string(), app.clone());
        Ok(app)
    }

    async fn create_app_revision(
        &self,
        id: &str,
        revision: u64,
        raw: &Value,
    ) -> PlatformResult<App> {
        let mut state = self.state();
        state.calls.create_app_revision += 1;
        let current = state
            .apps
            .get_mut(id)
            .ok_or_else(|| PlatformError::not_found(format!("app {id}")))?;
        if revision != current.revision + 1 {
            return Err(PlatformError::Client {
                status: 409,
                message: format!(
                    "revision {revision} does not follow current revision {}",
                    current.revision
                ),
            });
        }
        current.revision = revision;
        current.raw = raw.clone();
        Ok(current.clone())
    }

    async fn query_files(&self, project: &str, name: &str) -> PlatformResult<Vec<FileHandle>> {
        let mut state = self.state();
        state.calls.query_files += 1;
        Ok(state
            .files
            .iter()
            .filter(|f| f.project == project && f.handle.name == name)
            .map(|f| f.handle.clone())
            .collect())
    }

    async fn get_file(&self, id: &str) -> PlatformResult<FileHandle> {
        let mut state = self.state();
        state.calls.get_file += 1;
        state.file(id).map(|f| f.handle.clone())
    }

    async fn upload_file(
        &self,
        project: &str,
        source: &Path,
        name: &str,
    ) -> PlatformResult<FileHandle> {
        self.state().calls.upload_file += 1;
        let content = tokio::fs::read(source)
            .await
            .map_err(|e| PlatformError::Io {
                path: source.to_path_buf(),
                message: e.to_string(),
            })?;
        if content.is_empty() {
            return Err(PlatformError::Client {
                status: 400,
                message: "file size must be greater than zero".to_string(),
            });
        }
        Ok(self.add_file(project, name, content))
    }

    async fn download_file(&self, file: &FileHandle, destination: &Path) -> PlatformResult<()> {
        let content = {
            let mut state = self.state();
            state.calls.download_file += 1;
            state.file(&file.id)?.content.clone()
        };
        tokio::fs::write(destination, content)
            .await
            .map_err(|e| PlatformError::Io {
                path: destination.to_path_buf(),
                message: e.to_string(),
            })
    }

    async fn create_task(&self, request: &NewTask) -> PlatformResult<Task> {
        let mut state = self.state();
        state.calls.create_task += 1;
        if !state.projects.contains(&request.project) {
            return Err(PlatformError::not_found(format!(
                "project {}",
                request.project
            )));
        }
        state.submitted.push(request.clone());
        let script = state.scripts.pop_front().unwrap_or_else(|| TaskScript {
            statuses: VecDeque::from([TaskStatus::Completed]),
            outputs: Value::Object(Default::default()),
        });
        let mut pending = script.statuses;
        let initial = if request.run {
            pending.pop_front().unwrap_or(TaskStatus::Completed)
        } else {
            TaskStatus::Draft
        };
        let record = TaskRecord {
            task: Task {
                id: state.next_id("task"),
                name: request.name.clone(),
                status: initial,
                outputs: Value::Null,
            },
            pending,
            outputs: script.outputs,
        };
        let view = task_view(&record);
        state.tasks.insert(view.id.clone(), record);
        Ok(view)
    }

    async fn get_task(&self, id: &str) -> PlatformResult<Task> {
        let mut state = self.state();
        state.calls.get_task += 1;
        let record = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| PlatformError::not_found(format!("task {id}")))?;
        if let Some(next) = record.pending.pop_front() {
            record.task.status = next;
        }
        Ok(task_view(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn revisions_must_be_sequential() {
        let platform = MemoryPlatform::new("u");
        platform.install_app("u/p/a", &json!({})).await.unwrap();
        let err = platform
            .create_app_revision("u/p/a", 2, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Client { status: 409, .. }));
        let app = platform
            .create_app_revision("u/p/a", 1, &json!({"v": 1}))
            .await
            .unwrap();
        assert_eq!(app.revision, 1);
    }

    #[tokio::test]
    async fn scripted_task_advances_on_refresh() {
        let platform = MemoryPlatform::new("u");
        platform.add_project("u/p");
        platform.script_task(
            vec![TaskStatus::Queued, TaskStatus::Completed],
            json!({"n": 1}),
        );
        let task = platform
            .create_task(&NewTask {
                name: "t".into(),
                project: "u/p".into(),
                app: "u/p/a".into(),
                inputs: json!({}),
                use_interruptible_instances: false,
                run: true,
            })
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.outputs, Value::Null);
        let task = platform.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.outputs, json!({"n": 1}));
    }

    #[test]
    fn timestamps_increase() {
        let platform = MemoryPlatform::new("u");
        let a = platform.add_file("u/p", "x", "1");
        let b = platform.add_file("u/p", "x", "2");
        assert!(a.modified_on < b.modified_on);
    }
}
