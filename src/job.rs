//! Job input resolution: every local `File` becomes a platform file handle.

use crate::{
    document::JobNode,
    error::{Result, RunnerError},
    platform::{FileHandle, Platform},
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Content uploaded in place of an empty file; the upload API rejects zero bytes.
const PLACEHOLDER_CONTENT: &[u8] = b" ";

/// Replace every [`JobNode::LocalFile`] in `node` with a [`JobNode::RemoteFile`].
///
/// `job_path` is the job document's own path; relative file paths resolve
/// against its directory rather than the working directory.
pub async fn resolve_job(
    platform: &dyn Platform,
    project: &str,
    node: JobNode,
    job_path: Option<&Path>,
) -> Result<JobNode> {
    match node {
        JobNode::LocalFile(path) => Ok(JobNode::RemoteFile(
            resolve_file(platform, project, &path, job_path).await?,
        )),
        JobNode::Mapping(map) => {
            let mut out = indexmap::IndexMap::with_capacity(map.len());
            for (key, value) in map {
                let resolved = Box::pin(resolve_job(platform, project, value, job_path)).await?;
                out.insert(key, resolved);
            }
            Ok(JobNode::Mapping(out))
        }
        JobNode::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(resolve_job(platform, project, item, job_path)).await?);
            }
            Ok(JobNode::Sequence(out))
        }
        other @ (JobNode::Scalar(_) | JobNode::RemoteFile(_)) => Ok(other),
    }
}

/// Resolve one file reference to a handle, uploading when the project has no
/// file of that name yet.
pub async fn resolve_file(
    platform: &dyn Platform,
    project: &str,
    path: &str,
    job_path: Option<&Path>,
) -> Result<FileHandle> {
    let basename = basename(path);
    let local = local_path(path, job_path);
    if !local.exists() {
        // Not on disk: the job already names a platform file id.
        debug!(file = %basename, "treating missing local path as a file id");
        return Ok(platform.get_file(&basename).await?);
    }

    let mut matches = platform.query_files(project, &basename).await?;
    match matches.len() {
        0 => upload(platform, project, &local, &basename).await,
        1 => {
            debug!(file = %basename, "reusing project file");
            Ok(matches.remove(0))
        }
        n => {
            matches.sort_by(|a, b| {
                a.modified_on
                    .cmp(&b.modified_on)
                    .then_with(|| a.id.cmp(&b.id))
            });
            let chosen = matches.pop().ok_or_else(|| {
                RunnerError::Internal(format!("no match left for {basename}"))
            })?;
            warn!(file = %basename, matches = n, id = %chosen.id, "several project files share this name; reusing the most recent");
            Ok(chosen)
        }
    }
}

async fn upload(
    platform: &dyn Platform,
    project: &str,
    local: &Path,
    basename: &str,
) -> Result<FileHandle> {
    let size = tokio::fs::metadata(local)
        .await
        .map_err(|e| RunnerError::io(local, e))?
        .len();
    if size > 0 {
        debug!(file = %local.display(), "uploading file");
        return Ok(platform.upload_file(project, local, basename).await?);
    }

    warn!(file = %local.display(), "uploading a one-byte placeholder for an empty file");
    // The temp dir is removed on drop, including when the upload fails.
    let scratch = tempfile::tempdir().map_err(|e| RunnerError::io(std::env::temp_dir(), e))?;
    let placeholder = scratch.path().join("onebytefile.txt");
    tokio::fs::write(&placeholder, PLACEHOLDER_CONTENT)
        .await
        .map_err(|e| RunnerError::io(&placeholder, e))?;
    Ok(platform
        .upload_file(project, &placeholder, basename)
        .await?)
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn local_path(path: &str, job_path: Option<&Path>) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    match job_path.and_then(Path::parent) {
        Some(dir) => dir.join(candidate),
        None => candidate.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::MemoryPlatform;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn relative_paths_follow_the_job_file() {
        let job = Path::new("/data/jobs/job.yml");
        assert_eq!(
            local_path("reads/r1.fq", Some(job)),
            PathBuf::from("/data/jobs/reads/r1.fq")
        );
        assert_eq!(local_path("/abs/r1.fq", Some(job)), PathBuf::from("/abs/r1.fq"));
        assert_eq!(local_path("r1.fq", None), PathBuf::from("r1.fq"));
    }

    #[tokio::test]
    async fn missing_local_path_is_fetched_as_file_id() {
        let platform = MemoryPlatform::new("u");
        let existing = platform.add_file("u/p", "ref.fa", "ACGT");
        let handle = resolve_file(&platform, "u/p", &existing.id, None)
            .await
            .unwrap();
        assert_eq!(handle, existing);
        assert_eq!(platform.calls().get_file, 1);
        assert_eq!(platform.calls().query_files, 0);
    }

    #[tokio::test]
    async fn most_recent_duplicate_wins() {
        let dir = tempdir().unwrap();
        let job = dir.path().join("job.json");
        fs::write(dir.path().join("a.txt"), "local").unwrap();
        let platform = MemoryPlatform::new("u");
        platform.add_file("u/p", "a.txt", "old");
        let newer = platform.add_file("u/p", "a.txt", "new");

        let handle = resolve_file(&platform, "u/p", "a.txt", Some(&job))
            .await
            .unwrap();
        assert_eq!(handle.id, newer.id);
        assert_eq!(platform.calls().upload_file, 0);
    }

    #[tokio::test]
    async fn structure_is_preserved() {
        let dir = tempdir().unwrap();
        let job = dir.path().join("job.json");
        fs::write(dir.path().join("x.txt"), "x").unwrap();
        let platform = MemoryPlatform::new("u");
        let node = JobNode::from_job_value(json!({
            "n": 3,
            "flags": [true, "s"],
            "nested": {"f": {"class": "File", "path": "x.txt"}}
        }))
        .unwrap();

        let resolved = resolve_job(&platform, "u/p", node, Some(&job))
            .await
            .unwrap();
        assert_eq!(resolved.local_file_count(), 0);
        let value = resolved.into_value();
        assert_eq!(value["n"], json!(3));
        assert_eq!(value["flags"], json!([true, "s"]));
        assert_eq!(value["nested"]["f"]["class"], json!("File"));
        assert_eq!(value["nested"]["f"]["name"], json!("x.txt"));
    }
}
