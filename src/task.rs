use crate::{
    clock::Sleeper,
    error::{Result, RunnerError},
    hasher::job_fingerprint,
    platform::{App, NewTask, Platform, Task},
};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// `"<app name>: <fingerprint>"`, where the fingerprint is the first ten hex
/// characters of a hash over the job document.
pub fn task_name(app: &App, job: &Value) -> Result<String> {
    let name = if app.name.is_empty() {
        app.id.rsplit('/').next().unwrap_or(&app.id)
    } else {
        app.name.as_str()
    };
    Ok(format!("{name}: {}", job_fingerprint(job)?))
}

/// Create and start a non-interruptible task.
pub async fn submit_task(
    platform: &dyn Platform,
    project: &str,
    app: &App,
    name: String,
    inputs: Value,
) -> Result<Task> {
    let request = NewTask {
        name,
        project: project.to_string(),
        app: app.id.clone(),
        inputs,
        use_interruptible_instances: false,
        run: true,
    };
    let task = platform.create_task(&request).await?;
    info!(task = %task.id, name = %task.name, status = %task.status, "task submitted");
    Ok(task)
}

/// Poll until the task reaches COMPLETED, FAILED or ABORTED.
///
/// Each round sleeps `poll_interval` and then refreshes the status, so a task
/// seen as RUNNING twice before COMPLETED costs exactly two refreshes. With
/// `max_wait` set, the loop gives up once the accumulated sleep would exceed
/// it; the remote task keeps running.
pub async fn await_completion(
    platform: &dyn Platform,
    sleeper: &dyn Sleeper,
    mut task: Task,
    poll_interval: Duration,
    max_wait: Option<Duration>,
) -> Result<Task> {
    let mut waited = Duration::ZERO;
    while !task.status.is_terminal() {
        if let Some(limit) = max_wait
            && waited + poll_interval > limit
        {
            return Err(RunnerError::Timeout {
                task_id: task.id,
                status: task.status.to_string(),
                waited,
            });
        }
        sleeper.sleep(poll_interval).await;
        waited += poll_interval;

        let previous = task.status;
        task = platform.get_task(&task.id).await?;
        if task.status != previous {
            info!(task = %task.id, status = %task.status, "task status changed");
        }
    }
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::platform::{TaskStatus, memory::MemoryPlatform};
    use serde_json::json;

    fn app() -> App {
        App {
            id: "u/p/add".into(),
            name: "add".into(),
            revision: 0,
            raw: json!({}),
        }
    }

    fn platform_with(statuses: Vec<TaskStatus>) -> MemoryPlatform {
        let platform = MemoryPlatform::new("u");
        platform.add_project("u/p");
        platform.script_task(statuses, json!({"sum": 3}));
        platform
    }

    #[test]
    fn name_combines_app_and_fingerprint() {
        let name = task_name(&app(), &json!({"a": 1, "b": 2})).unwrap();
        let (prefix, fingerprint) = name.split_once(": ").unwrap();
        assert_eq!(prefix, "add");
        assert_eq!(fingerprint.len(), 10);
        assert_eq!(name, task_name(&app(), &json!({"b": 2, "a": 1})).unwrap());
        assert_ne!(name, task_name(&app(), &json!({"a": 1, "b": 3})).unwrap());
    }

    #[tokio::test]
    async fn submission_requests_immediate_non_interruptible_run() {
        let platform = platform_with(vec![TaskStatus::Running]);
        submit_task(&platform, "u/p", &app(), "add: x".into(), json!({"a": 1}))
            .await
            .unwrap();
        let submitted = platform.submitted_tasks();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].run);
        assert!(!submitted[0].use_interruptible_instances);
        assert_eq!(submitted[0].app, "u/p/add");
    }

    #[tokio::test]
    async fn polls_until_terminal() {
        let platform = platform_with(vec![
            TaskStatus::Running,
            TaskStatus::Running,
            TaskStatus::Completed,
        ]);
        let sleeper = RecordingSleeper::new();
        let task = submit_task(&platform, "u/p", &app(), "t".into(), json!({}))
            .await
            .unwrap();
        let done = await_completion(&platform, &sleeper, task, Duration::from_secs(60), None)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.outputs, json!({"sum": 3}));
        assert_eq!(platform.calls().get_task, 2);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(60); 2]);
    }

    #[tokio::test]
    async fn failed_and_aborted_are_terminal_too() {
        for terminal in [TaskStatus::Failed, TaskStatus::Aborted] {
            let platform = platform_with(vec![TaskStatus::Queued, terminal]);
            let sleeper = RecordingSleeper::new();
            let task = submit_task(&platform, "u/p", &app(), "t".into(), json!({}))
                .await
                .unwrap();
            let done = await_completion(&platform, &sleeper, task, Duration::from_secs(1), None)
                .await
                .unwrap();
            assert_eq!(done.status, terminal);
            assert_eq!(platform.calls().get_task, 1);
        }
    }

    #[tokio::test]
    async fn already_terminal_task_is_not_polled() {
        let platform = platform_with(vec![TaskStatus::Completed]);
        let sleeper = RecordingSleeper::new();
        let task = submit_task(&platform, "u/p", &app(), "t".into(), json!({}))
            .await
            .unwrap();
        await_completion(&platform, &sleeper, task, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(platform.calls().get_task, 0);
        assert!(sleeper.sleeps().is_empty());
    }

    #[tokio::test]
    async fn max_wait_bounds_the_loop() {
        let platform = platform_with(vec![TaskStatus::Running; 10]);
        let sleeper = RecordingSleeper::new();
        let task = submit_task(&platform, "u/p", &app(), "t".into(), json!({}))
            .await
            .unwrap();
        let err = await_completion(
            &platform,
            &sleeper,
            task,
            Duration::from_secs(60),
            Some(Duration::from_secs(150)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { waited, .. } if waited == Duration::from_secs(120)));
        assert_eq!(platform.calls().get_task, 2);
    }
}
