//! Client for the Seven Bridges public API (v2).
//!
//! Every call maps the HTTP status onto [`PlatformError`] so the retry chain
//! and the pipeline's not-found branches can match on kind:
//!
//! - 404 -> `NotFound`
//! - 429 -> `RateLimited` (with the `X-RateLimit-Reset` epoch when sent)
//! - 503 -> `Maintenance`
//! - other 5xx -> `Server`, other 4xx -> `Client`

use super::{App, FileHandle, NewTask, Platform, Project, Task, User, config::ApiProfile};
use crate::error::{PlatformError, PlatformResult};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use url::Url;

const AUTH_HEADER: &str = "x-sbg-auth-token";
const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];
/// Part size requested for multipart uploads.
const UPLOAD_PART_SIZE: u64 = 32 * 1024 * 1024;
const QUERY_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct SbgClient {
    pub base_url: String,
    pub http: Client,
    pub user_agent: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct DownloadInfo {
    url: String,
}

#[derive(Debug, Deserialize)]
struct UploadSession {
    upload_id: String,
    #[serde(default)]
    part_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PartTarget {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl SbgClient {
    pub fn new(profile: &ApiProfile) -> anyhow::Result<Self> {
        validate_base_url(&profile.endpoint)?;

        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(
            header::HeaderName::from_static(AUTH_HEADER),
            header::HeaderValue::from_str(&profile.auth_token)
                .map_err(|e| anyhow::anyhow!("auth token is not a valid header value: {e}"))?,
        );
        default_headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let http = Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("build http client: {e}"))?;

        Ok(Self {
            base_url: profile.endpoint.trim_end_matches('/').to_string(),
            http,
            user_agent: format!(
                "sbg-cwl-runner/{}; {}",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS
            ),
        })
    }

    /// Build a request for an API-relative path.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "building request");
        self.http
            .request(method, url)
            .header(header::USER_AGENT, &self.user_agent)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        resource: &str,
    ) -> PlatformResult<T> {
        let response = check_status(builder.send().await?, resource).await?;
        response.json::<T>().await.map_err(|e| {
            PlatformError::Decode(format!("{resource}: {e}"))
        })
    }

    /// Installs and revisions answer with the raw document; fetch the app it names.
    async fn app_from_raw_response(&self, raw: Value, fallback_id: &str) -> PlatformResult<App> {
        let id = raw
            .get("sbg:id")
            .and_then(Value::as_str)
            .unwrap_or(fallback_id)
            .to_string();
        self.get_app(&id).await
    }

    async fn upload_part(&self, upload_id: &str, part_number: u64, chunk: Vec<u8>) -> PlatformResult<()> {
        let resource = format!("upload {upload_id} part {part_number}");
        let target: PartTarget = self
            .send_json(
                self.request(
                    Method::GET,
                    &format!("/upload/multipart/{upload_id}/part/{part_number}"),
                ),
                &resource,
            )
            .await?;

        let method = target
            .method
            .as_deref()
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .unwrap_or(Method::PUT);
        // Part URLs are pre-signed storage URLs; the API token must not be sent there.
        let mut put = Client::new().request(method, &target.url).body(chunk);
        for (name, value) in &target.headers {
            if let Some(value) = value.as_str() {
                put = put.header(name.as_str(), value);
            }
        }
        let stored = check_status(put.send().await?, &resource).await?;
        let etag = stored
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let report = json!({
            "part_number": part_number,
            "response": {"headers": {"ETag": etag}},
        });
        check_status(
            self.request(Method::POST, &format!("/upload/multipart/{upload_id}/part"))
                .json(&report)
                .send()
                .await?,
            &resource,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Platform for SbgClient {
    async fn current_user(&self) -> PlatformResult<User> {
        self.send_json(self.request(Method::GET, "/user"), "user")
            .await
    }

    async fn get_project(&self, id: &str) -> PlatformResult<Project> {
        self.send_json(
            self.request(Method::GET, &format!("/projects/{id}")),
            &format!("project {id}"),
        )
        .await
    }

    async fn get_app(&self, id: &str) -> PlatformResult<App> {
        self.send_json(
            self.request(Method::GET, &format!("/apps/{id}")),
            &format!("app {id}"),
        )
        .await
    }

    async fn install_app(&self, id: &str, raw: &Value) -> PlatformResult<App> {
        let created: Value = self
            .send_json(
                self.request(Method::POST, &format!("/apps/{id}/raw")).json(raw),
                &format!("app {id}"),
            )
            .await?;
        self.app_from_raw_response(created, id).await
    }

    async fn create_app_revision(
        &self,
        id: &str,
        revision: u64,
        raw: &Value,
    ) -> PlatformResult<App> {
        let created: Value = self
            .send_json(
                self.request(Method::POST, &format!("/apps/{id}/{revision}/raw"))
                    .json(raw),
                &format!("app {id} revision {revision}"),
            )
            .await?;
        self.app_from_raw_response(created, &format!("{id}/{revision}"))
            .await
    }

    async fn query_files(&self, project: &str, name: &str) -> PlatformResult<Vec<FileHandle>> {
        let limit = QUERY_PAGE_LIMIT.to_string();
        let page: Page<FileHandle> = self
            .send_json(
                self.request(Method::GET, "/files").query(&[
                    ("project", project),
                    ("name", name),
                    ("fields", "_all"),
                    ("limit", limit.as_str()),
                ]),
                &format!("files named {name} in {project}"),
            )
            .await?;
        Ok(page.items)
    }

    async fn get_file(&self, id: &str) -> PlatformResult<FileHandle> {
        self.send_json(
            self.request(Method::GET, &format!("/files/{id}")),
            &format!("file {id}"),
        )
        .await
    }

    async fn upload_file(
        &self,
        project: &str,
        source: &Path,
        name: &str,
    ) -> PlatformResult<FileHandle> {
        let io_err = |e: std::io::Error| PlatformError::Io {
            path: source.to_path_buf(),
            message: e.to_string(),
        };
        let size = tokio::fs::metadata(source).await.map_err(io_err)?.len();
        let session: UploadSession = self
            .send_json(
                self.request(Method::POST, "/upload/multipart").json(&json!({
                    "project": project,
                    "name": name,
                    "size": size,
                    "part_size": UPLOAD_PART_SIZE,
                })),
                &format!("upload of {name}"),
            )
            .await?;
        let part_size = session.part_size.unwrap_or(UPLOAD_PART_SIZE).max(1);
        debug!(upload_id = %session.upload_id, size, part_size, "multipart upload started");

        let mut file = tokio::fs::File::open(source).await.map_err(io_err)?;
        let mut remaining = size;
        let mut part_number = 1;
        while remaining > 0 {
            let len = remaining.min(part_size);
            let mut chunk = vec![0u8; len as usize];
            file.read_exact(&mut chunk).await.map_err(io_err)?;
            self.upload_part(&session.upload_id, part_number, chunk)
                .await?;
            remaining -= len;
            part_number += 1;
        }

        self.send_json(
            self.request(
                Method::POST,
                &format!("/upload/multipart/{}/complete", session.upload_id),
            ),
            &format!("upload of {name}"),
        )
        .await
    }

    async fn download_file(&self, file: &FileHandle, destination: &Path) -> PlatformResult<()> {
        let info: DownloadInfo = self
            .send_json(
                self.request(Method::GET, &format!("/files/{}/download_info", file.id)),
                &format!("file {}", file.id),
            )
            .await?;
        let mut response = check_status(
            Client::new().get(&info.url).send().await?,
            &format!("download of {}", file.name),
        )
        .await?;

        let io_err = |e: std::io::Error| PlatformError::Io {
            path: destination.to_path_buf(),
            message: e.to_string(),
        };
        let mut out = tokio::fs::File::create(destination).await.map_err(io_err)?;
        while let Some(chunk) = response.chunk().await? {
            out.write_all(&chunk).await.map_err(io_err)?;
        }
        out.flush().await.map_err(io_err)?;
        Ok(())
    }

    async fn create_task(&self, request: &NewTask) -> PlatformResult<Task> {
        let mut builder = self.request(Method::POST, "/tasks").json(request);
        if request.run {
            builder = builder.query(&[("action", "run")]);
        }
        self.send_json(builder, &format!("task {}", request.name))
            .await
    }

    async fn get_task(&self, id: &str) -> PlatformResult<Task> {
        self.send_json(
            self.request(Method::GET, &format!("/tasks/{id}")),
            &format!("task {id}"),
        )
        .await
    }
}

async fn check_status(response: Response, resource: &str) -> PlatformResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let reset_at = response
        .headers()
        .get(RATE_LIMIT_RESET_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.message)
        .unwrap_or(text);
    Err(error_for_status(status, resource, message, reset_at))
}

fn error_for_status(
    status: StatusCode,
    resource: &str,
    message: String,
    reset_at: Option<u64>,
) -> PlatformError {
    match status {
        StatusCode::NOT_FOUND => PlatformError::not_found(resource),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited { reset_at },
        StatusCode::SERVICE_UNAVAILABLE => PlatformError::Maintenance { message },
        s if s.is_server_error() => PlatformError::Server {
            status: s.as_u16(),
            message,
        },
        s => PlatformError::Client {
            status: s.as_u16(),
            message,
        },
    }
}

/// Non-localhost endpoints must use HTTPS.
fn validate_base_url(base: &str) -> anyhow::Result<()> {
    let parsed = Url::parse(base).map_err(|e| anyhow::anyhow!("invalid API endpoint '{base}': {e}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("API endpoint must include a host: {base}"))?;
    if LOCALHOST_DOMAINS
        .iter()
        .any(|allowed| host.eq_ignore_ascii_case(allowed))
    {
        return Ok(());
    }
    if parsed.scheme() != "https" {
        anyhow::bail!(
            "API endpoint must use https for non-localhost hosts; got '{}://'",
            parsed.scheme()
        );
    }
    Ok(())
}
