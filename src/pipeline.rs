//! End-to-end submission: load, publish, resolve inputs, run, collect outputs.

use crate::{
    clock::Sleeper,
    document::JobNode,
    error::{Result, RunnerError},
    job::resolve_job,
    loader::{ensure_document_id, fill_job_defaults, load_job, load_workflow},
    outputs::resolve_outputs,
    platform::{Platform, TaskStatus},
    publish::publish_app,
    task::{await_completion, submit_task, task_name},
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PROJECT: &str = "default-sbg-cwl-runner-project";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Verbose,
}

impl Verbosity {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub fn filter_directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Verbose => "warn,sbg_cwl_runner=debug",
        }
    }
}

/// Settings for one invocation, built once at the entry point.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workflow: PathBuf,
    pub job: Option<PathBuf>,
    pub outdir: PathBuf,
    pub project: String,
    pub poll_interval: Duration,
    pub max_wait: Option<Duration>,
    pub verbosity: Verbosity,
}

impl RunConfig {
    pub fn new(workflow: impl Into<PathBuf>) -> Self {
        RunConfig {
            workflow: workflow.into(),
            job: None,
            outdir: PathBuf::from("./"),
            project: DEFAULT_PROJECT.to_string(),
            poll_interval: Duration::from_secs(60),
            max_wait: None,
            verbosity: Verbosity::default(),
        }
    }
}

/// Local documents, loaded before any platform call is made.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub workflow: Value,
    pub job: Value,
    inputs: JobNode,
    job_path: Option<PathBuf>,
}

impl PreparedRun {
    pub fn prepare(config: &RunConfig) -> Result<Self> {
        let mut workflow = load_workflow(&config.workflow)?;
        ensure_document_id(&mut workflow, &config.workflow);
        let mut job = load_job(config.job.as_deref())?;
        fill_job_defaults(&mut job, &workflow);
        let inputs = JobNode::from_job_value(job.clone())?;
        Ok(PreparedRun {
            workflow,
            job,
            inputs,
            job_path: config.job.clone(),
        })
    }

    /// Run the prepared documents on `platform` and return the local output document.
    pub async fn execute(
        self,
        platform: &dyn Platform,
        sleeper: &dyn Sleeper,
        config: &RunConfig,
    ) -> Result<Value> {
        let project = resolve_project(platform, &config.project).await?;

        let app = publish_app(platform, &project, self.workflow).await?;
        let name = task_name(&app, &self.job)?;

        let inputs = resolve_job(platform, &project, self.inputs, self.job_path.as_deref()).await?;

        let task = submit_task(platform, &project, &app, name, inputs.into_value()).await?;
        let task = await_completion(
            platform,
            sleeper,
            task,
            config.poll_interval,
            config.max_wait,
        )
        .await?;
        if task.status != TaskStatus::Completed {
            warn!(task = %task.id, status = %task.status, "task did not complete successfully");
        }

        create_outdir(&config.outdir).await?;
        let outputs = resolve_outputs(
            platform,
            JobNode::from_output_value(task.outputs),
            &config.outdir,
        )
        .await?;
        Ok(outputs.into_value())
    }
}

/// Load everything locally, then submit. Convenience over [`PreparedRun`].
pub async fn run(
    platform: &dyn Platform,
    sleeper: &dyn Sleeper,
    config: &RunConfig,
) -> Result<Value> {
    PreparedRun::prepare(config)?
        .execute(platform, sleeper, config)
        .await
}

async fn resolve_project(platform: &dyn Platform, project: &str) -> Result<String> {
    let user = platform.current_user().await?;
    let id = format!("{}/{project}", user.username);
    match platform.get_project(&id).await {
        Ok(found) => {
            info!(project = %found.id, "using project");
            Ok(found.id)
        }
        Err(err) if err.is_not_found() => Err(RunnerError::ProjectNotFound { project: id }),
        Err(err) => Err(err.into()),
    }
}

async fn create_outdir(outdir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(outdir)
        .await
        .map_err(|e| RunnerError::io(outdir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::platform::memory::MemoryPlatform;
    use serde_json::json;

    #[test]
    fn quiet_keeps_errors_only() {
        assert_eq!(Verbosity::Quiet.filter_directive(), "error");
        assert!(Verbosity::Verbose.filter_directive().contains("debug"));
    }

    #[tokio::test]
    async fn project_id_is_qualified_by_username() {
        let platform = MemoryPlatform::new("alice");
        platform.add_project("alice/p");
        assert_eq!(resolve_project(&platform, "p").await.unwrap(), "alice/p");

        let err = resolve_project(&platform, "missing").await.unwrap_err();
        assert!(
            matches!(err, RunnerError::ProjectNotFound { ref project } if project == "alice/missing")
        );
    }

    #[tokio::test]
    async fn missing_project_stops_before_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = dir.path().join("tool.cwl");
        std::fs::write(&workflow, "class: CommandLineTool\ninputs: []\noutputs: []\n").unwrap();
        let platform = MemoryPlatform::new("u");
        let mut config = RunConfig::new(&workflow);
        config.project = "p".into();

        let err = run(&platform, &RecordingSleeper::new(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::ProjectNotFound { .. }));
        let calls = platform.calls();
        assert_eq!(calls.get_app, 0);
        assert_eq!(calls.create_task, 0);
    }

    #[tokio::test]
    async fn task_is_named_after_app_and_job() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = dir.path().join("echo.cwl");
        std::fs::write(
            &workflow,
            "class: CommandLineTool\ninputs:\n  - id: msg\n    type: string\n    default: hi\noutputs: []\n",
        )
        .unwrap();
        let platform = MemoryPlatform::new("u");
        platform.add_project("u/p");
        let mut config = RunConfig::new(&workflow);
        config.project = "p".into();
        config.outdir = dir.path().join("out");

        run(&platform, &RecordingSleeper::new(), &config)
            .await
            .unwrap();

        let submitted = platform.submitted_tasks();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].name.starts_with("echo: "));
        assert_eq!(submitted[0].app, "u/p/echo");
        assert_eq!(submitted[0].inputs, json!({"msg": "hi"}));
        assert!(config.outdir.is_dir());
    }
}
