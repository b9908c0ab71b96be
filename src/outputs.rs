//! Task output resolution: platform files are downloaded next to each other
//! in the output directory and rewritten as local references.

use crate::{
    document::JobNode,
    error::Result,
    path_safety::join_under_root,
    platform::{FileHandle, Platform},
};
use std::path::Path;
use tracing::debug;

/// Download every [`JobNode::RemoteFile`] under `node` into `outdir` and
/// replace it with a [`JobNode::LocalFile`] carrying the downloaded name.
///
/// Names are not de-duplicated; two outputs with the same name overwrite
/// each other, last one wins.
pub async fn resolve_outputs(
    platform: &dyn Platform,
    node: JobNode,
    outdir: &Path,
) -> Result<JobNode> {
    match node {
        JobNode::RemoteFile(handle) => {
            let name = download(platform, handle, outdir).await?;
            Ok(JobNode::LocalFile(name))
        }
        JobNode::Mapping(map) => {
            let mut out = indexmap::IndexMap::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key, Box::pin(resolve_outputs(platform, value, outdir)).await?);
            }
            Ok(JobNode::Mapping(out))
        }
        JobNode::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(resolve_outputs(platform, item, outdir)).await?);
            }
            Ok(JobNode::Sequence(out))
        }
        other @ (JobNode::Scalar(_) | JobNode::LocalFile(_)) => Ok(other),
    }
}

async fn download(platform: &dyn Platform, handle: FileHandle, outdir: &Path) -> Result<String> {
    let handle = if handle.name.is_empty() {
        platform.get_file(&handle.id).await?
    } else {
        handle
    };
    let destination = join_under_root(outdir, &handle.name)?;
    debug!(file = %handle.id, to = %destination.display(), "downloading output");
    platform.download_file(&handle, &destination).await?;
    Ok(handle.name)
}
