//! Retry decorator for any [`Platform`].
//!
//! Each failing call is offered to a chain of [`ErrorHandler`]s. The first
//! handler that claims the error decides how long to wait; the call is then
//! repeated. When no handler claims it the error is returned unchanged, so
//! not-found and client errors reach the pipeline exactly as produced.
//!
//! Every handler keeps its own retry budget per call. Requests that create
//! resources are marked non-idempotent: a dropped connection may hide a
//! committed request, so transport failures on them are not replayed.

use super::{App, FileHandle, NewTask, Platform, Project, Task, User};
use crate::clock::Sleeper;
use crate::error::{PlatformError, PlatformResult};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

pub trait ErrorHandler: Send + Sync {
    /// Delay before retrying `error`, or `None` to let it propagate.
    /// `attempt` counts retries this handler already granted for the call.
    fn retry_after(&self, error: &PlatformError, attempt: u32, idempotent: bool)
    -> Option<Duration>;
}

/// Waits out HTTP 429 until the advertised reset time.
#[derive(Debug, Clone)]
pub struct RateLimitSleeper {
    pub fallback: Duration,
    pub max_attempts: u32,
}

impl Default for RateLimitSleeper {
    fn default() -> Self {
        Self {
            fallback: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl ErrorHandler for RateLimitSleeper {
    fn retry_after(&self, error: &PlatformError, attempt: u32, _: bool) -> Option<Duration> {
        let PlatformError::RateLimited { reset_at } = error else {
            return None;
        };
        if attempt >= self.max_attempts {
            return None;
        }
        let wait = reset_at
            .map(|reset| {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                Duration::from_secs(reset.saturating_sub(now).max(1))
            })
            .unwrap_or(self.fallback);
        Some(wait)
    }
}

/// Waits while the platform reports maintenance (HTTP 503).
#[derive(Debug, Clone)]
pub struct MaintenanceSleeper {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for MaintenanceSleeper {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(300),
            max_attempts: 12,
        }
    }
}

impl ErrorHandler for MaintenanceSleeper {
    fn retry_after(&self, error: &PlatformError, attempt: u32, _: bool) -> Option<Duration> {
        match error {
            PlatformError::Maintenance { .. } if attempt < self.max_attempts => Some(self.delay),
            _ => None,
        }
    }
}

/// Exponential backoff for other server-side failures, and for transport
/// failures of idempotent requests.
#[derive(Debug, Clone)]
pub struct GeneralErrorSleeper {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for GeneralErrorSleeper {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl ErrorHandler for GeneralErrorSleeper {
    fn retry_after(
        &self,
        error: &PlatformError,
        attempt: u32,
        idempotent: bool,
    ) -> Option<Duration> {
        let retryable = match error {
            PlatformError::Server { .. } => true,
            PlatformError::Transport(_) => idempotent,
            _ => false,
        };
        if !retryable || attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt);
        Some(self.base.saturating_mul(factor).min(self.cap))
    }
}

pub fn default_handlers() -> Vec<Box<dyn ErrorHandler>> {
    vec![
        Box::new(RateLimitSleeper::default()),
        Box::new(MaintenanceSleeper::default()),
        Box::new(GeneralErrorSleeper::default()),
    ]
}

pub struct RetryingPlatform<P> {
    inner: P,
    handlers: Vec<Box<dyn ErrorHandler>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<P: Platform> RetryingPlatform<P> {
    pub fn new(inner: P, handlers: Vec<Box<dyn ErrorHandler>>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            inner,
            handlers,
            sleeper,
        }
    }

    pub fn with_default_handlers(inner: P, sleeper: Arc<dyn Sleeper>) -> Self {
        Self::new(inner, default_handlers(), sleeper)
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    async fn call<T, F, Fut>(&self, operation: &str, idempotent: bool, f: F) -> PlatformResult<T>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = PlatformResult<T>> + Send,
    {
        let mut granted = vec![0u32; self.handlers.len()];
        loop {
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some((index, delay)) = self
                .handlers
                .iter()
                .zip(&granted)
                .enumerate()
                .find_map(|(index, (handler, &attempt))| {
                    handler
                        .retry_after(&err, attempt, idempotent)
                        .map(|delay| (index, delay))
                })
            else {
                return Err(err);
            };
            let attempt = granted[index];
            warn!(operation, attempt, ?delay, error = %err, "retrying platform call");
            self.sleeper.sleep(delay).await;
            granted[index] += 1;
        }
    }
}

#[async_trait]
impl<P: Platform> Platform for RetryingPlatform<P> {
    async fn current_user(&self) -> PlatformResult<User> {
        self.call("current_user", true, move || self.inner.current_user())
            .await
    }

    async fn get_project(&self, id: &str) -> PlatformResult<Project> {
        self.call("get_project", true, move || self.inner.get_project(id))
            .await
    }

    async fn get_app(&self, id: &str) -> PlatformResult<App> {
        self.call("get_app", true, move || self.inner.get_app(id)).await
    }

    async fn install_app(&self, id: &str, raw: &Value) -> PlatformResult<App> {
        self.call("install_app", false, move || self.inner.install_app(id, raw))
            .await
    }

    async fn create_app_revision(
        &self,
        id: &str,
        revision: u64,
        raw: &Value,
    ) -> PlatformResult<App> {
        self.call("create_app_revision", false, move || {
            self.inner.create_app_revision(id, revision, raw)
        })
        .await
    }

    async fn query_files(&self, project: &str, name: &str) -> PlatformResult<Vec<FileHandle>> {
        self.call("query_files", true, move || self.inner.query_files(project, name))
            .await
    }

    async fn get_file(&self, id: &str) -> PlatformResult<FileHandle> {
        self.call("get_file", true, move || self.inner.get_file(id)).await
    }

    async fn upload_file(
        &self,
        project: &str,
        source: &Path,
        name: &str,
    ) -> PlatformResult<FileHandle> {
        self.call("upload_file", false, move || {
            self.inner.upload_file(project, source, name)
        })
        .await
    }

    async fn download_file(&self, file: &FileHandle, destination: &Path) -> PlatformResult<()> {
        self.call("download_file", true, move || {
            self.inner.download_file(file, destination)
        })
        .await
    }

    async fn create_task(&self, request: &NewTask) -> PlatformResult<Task> {
        self.call("create_task", false, move || self.inner.create_task(request))
            .await
    }

    async fn get_task(&self, id: &str) -> PlatformResult<Task> {
        self.call("get_task", true, move || self.inner.get_task(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::platform::memory::MemoryPlatform;
    use std::sync::Mutex;

    /// Fails `get_app` with queued errors before delegating. `create_task`
    /// commits on the inner platform and then loses the reply with a queued error.
    struct Flaky {
        inner: MemoryPlatform,
        failures: Mutex<Vec<PlatformError>>,
        lost_replies: Mutex<Vec<PlatformError>>,
    }

    #[async_trait]
    impl Platform for Flaky {
        async fn current_user(&self) -> PlatformResult<User> {
            self.inner.current_user().await
        }
        async fn get_project(&self, id: &str) -> PlatformResult<Project> {
            self.inner.get_project(id).await
        }
        async fn get_app(&self, id: &str) -> PlatformResult<App> {
            let next = self.failures.lock().unwrap().pop();
            match next {
                Some(err) => Err(err),
                None => self.inner.get_app(id).await,
            }
        }
        async fn install_app(&self, id: &str, raw: &Value) -> PlatformResult<App> {
            self.inner.install_app(id, raw).await
        }
        async fn create_app_revision(
            &self,
            id: &str,
            revision: u64,
            raw: &Value,
        ) -> PlatformResult<App> {
            self.inner.create_app_revision(id, revision, raw).await
        }
        async fn query_files(&self, project: &str, name: &str) -> PlatformResult<Vec<FileHandle>> {
            self.inner.query_files(project, name).await
        }
        async fn get_file(&self, id: &str) -> PlatformResult<FileHandle> {
            self.inner.get_file(id).await
        }
        async fn upload_file(
            &self,
            project: &str,
            source: &Path,
            name: &str,
        ) -> PlatformResult<FileHandle> {
            self.inner.upload_file(project, source, name).await
        }
        async fn download_file(&self, file: &FileHandle, destination: &Path) -> PlatformResult<()> {
            self.inner.download_file(file, destination).await
        }
        async fn create_task(&self, request: &NewTask) -> PlatformResult<Task> {
            let task = self.inner.create_task(request).await?;
            let lost = self.lost_replies.lock().unwrap().pop();
            match lost {
                Some(err) => Err(err),
                None => Ok(task),
            }
        }
        async fn get_task(&self, id: &str) -> PlatformResult<Task> {
            self.inner.get_task(id).await
        }
    }

    fn flaky(failures: Vec<PlatformError>) -> Flaky {
        let inner = MemoryPlatform::new("alice");
        inner.add_project("alice/p");
        Flaky {
            inner,
            failures: Mutex::new(failures),
            lost_replies: Mutex::new(Vec::new()),
        }
    }

    fn server_error() -> PlatformError {
        PlatformError::Server {
            status: 502,
            message: "bad gateway".into(),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let platform = flaky(vec![
            server_error(),
            PlatformError::Maintenance {
                message: "upgrade".into(),
            },
            PlatformError::RateLimited { reset_at: None },
        ]);
        platform
            .inner
            .install_app("alice/p/tool", &serde_json::json!({"id": "tool"}))
            .await
            .unwrap();
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrying = RetryingPlatform::with_default_handlers(platform, sleeper.clone());

        let app = retrying.get_app("alice/p/tool").await.unwrap();
        assert_eq!(app.revision, 0);
        assert_eq!(
            sleeper.sleeps(),
            vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(5),
            ]
        );
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrying = RetryingPlatform::with_default_handlers(flaky(Vec::new()), sleeper.clone());
        let err = retrying.get_app("alice/p/missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(sleeper.sleeps().is_empty());
    }

    #[tokio::test]
    async fn general_sleeper_gives_up_after_max_attempts() {
        let failures = (0..3)
            .map(|_| PlatformError::Transport("connection reset".into()))
            .collect();
        let handlers: Vec<Box<dyn ErrorHandler>> = vec![Box::new(GeneralErrorSleeper {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(3),
            max_attempts: 2,
        })];
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrying = RetryingPlatform::new(flaky(failures), handlers, sleeper.clone());
        let err = retrying.get_app("alice/p/x").await.unwrap_err();
        assert!(matches!(err, PlatformError::Transport(_)));
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn each_handler_spends_its_own_budget() {
        let platform = flaky(vec![
            server_error(),
            PlatformError::RateLimited { reset_at: None },
            PlatformError::RateLimited { reset_at: None },
        ]);
        platform
            .inner
            .install_app("alice/p/tool", &serde_json::json!({"id": "tool"}))
            .await
            .unwrap();
        let handlers: Vec<Box<dyn ErrorHandler>> = vec![
            Box::new(RateLimitSleeper {
                fallback: Duration::from_secs(7),
                max_attempts: 2,
            }),
            Box::new(GeneralErrorSleeper {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(3),
                max_attempts: 1,
            }),
        ];
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrying = RetryingPlatform::new(platform, handlers, sleeper.clone());

        retrying.get_app("alice/p/tool").await.unwrap();
        assert_eq!(
            sleeper.sleeps(),
            vec![
                Duration::from_secs(7),
                Duration::from_secs(7),
                Duration::from_secs(1),
            ]
        );
    }

    #[tokio::test]
    async fn task_creation_is_not_replayed_after_a_lost_reply() {
        let platform = flaky(Vec::new());
        platform
            .lost_replies
            .lock()
            .unwrap()
            .push(PlatformError::Transport("connection reset".into()));
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrying = RetryingPlatform::with_default_handlers(platform, sleeper.clone());

        let err = retrying
            .create_task(&NewTask {
                name: "add - 2026-10-17".into(),
                project: "alice/p".into(),
                app: "alice/p/add".into(),
                inputs: serde_json::json!({}),
                use_interruptible_instances: false,
                run: true,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PlatformError::Transport(_)));
        assert!(sleeper.sleeps().is_empty());
        let inner = &retrying.inner().inner;
        assert_eq!(inner.calls().create_task, 1);
        assert_eq!(inner.submitted_tasks().len(), 1);
    }

    #[test]
    fn transport_errors_are_replayed_only_for_idempotent_requests() {
        let sleeper = GeneralErrorSleeper::default();
        let reset = PlatformError::Transport("connection reset".into());
        assert_eq!(
            sleeper.retry_after(&reset, 0, true),
            Some(Duration::from_secs(5))
        );
        assert_eq!(sleeper.retry_after(&reset, 0, false), None);
        assert_eq!(
            sleeper.retry_after(&server_error(), 0, false),
            Some(Duration::from_secs(5))
        );
        let limited = PlatformError::RateLimited { reset_at: None };
        assert_eq!(
            RateLimitSleeper::default().retry_after(&limited, 0, false),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn backoff_is_capped() {
        let sleeper = GeneralErrorSleeper::default();
        let err = PlatformError::Server {
            status: 500,
            message: String::new(),
        };
        assert_eq!(sleeper.retry_after(&err, 0, true), Some(Duration::from_secs(5)));
        assert_eq!(sleeper.retry_after(&err, 4, true), Some(Duration::from_secs(80)));
        assert_eq!(sleeper.retry_after(&err, 5, true), None);
        let capped = GeneralErrorSleeper {
            max_attempts: 20,
            ..GeneralErrorSleeper::default()
        };
        assert_eq!(capped.retry_after(&err, 10, true), Some(Duration::from_secs(300)));
    }
}
