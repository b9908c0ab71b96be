use crate::{
    error::{Result, RunnerError},
    hasher::{app_digest, stamp_digest},
    platform::{App, Platform},
};
use serde_json::Value;
use tracing::debug;

/// Qualified app id: `<project>/<document id>`.
pub fn app_id(project: &str, document: &Value) -> Result<String> {
    let id = document
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RunnerError::invalid("workflow", "document has no string `id`"))?;
    Ok(format!("{project}/{}", id.trim_start_matches('#')))
}

/// Make sure the platform holds an app whose content matches `document`.
///
/// The document is stamped with its digest first. An existing app with the
/// same digest is returned untouched; a different digest produces the next
/// revision; a missing app is installed. Revisions are computed from a read
/// followed by a write, so concurrent publishers of the same app id race and
/// the loser sees the platform's conflict error.
pub async fn publish_app(platform: &dyn Platform, project: &str, mut document: Value) -> Result<App> {
    let digest = stamp_digest(&mut document)?;
    let id = app_id(project, &document)?;

    let existing = match platform.get_app(&id).await {
        Ok(app) => app,
        Err(err) if err.is_not_found() => {
            debug!(app = %id, "creating new app");
            return Ok(platform.install_app(&id, &document).await?);
        }
        Err(err) => return Err(err.into()),
    };

    if app_digest(&existing.raw)? == digest {
        debug!(app = %id, revision = existing.revision, "using existing app");
        return Ok(existing);
    }

    let revision = existing.revision + 1;
    debug!(app = %id, revision, "creating revised app");
    Ok(platform
        .create_app_revision(&id, revision, &document)
        .await?)
}
