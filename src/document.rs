//! Typed view over job and output documents.
//!
//! Job input and task output documents are arbitrary JSON trees whose only
//! meaningful leaves are `File` objects. [`JobNode`] closes that shape so the
//! resolvers can recurse with an exhaustive `match`.

use crate::{
    error::{Result, RunnerError},
    platform::FileHandle,
};
use indexmap::IndexMap;
use serde_json::{Map, Value};

pub const CLASS_KEY: &str = "class";
pub const FILE_CLASS: &str = "File";

#[derive(Debug, Clone, PartialEq)]
pub enum JobNode {
    /// Null, boolean, number or string.
    Scalar(Value),
    Sequence(Vec<JobNode>),
    Mapping(IndexMap<String, JobNode>),
    /// A `File` that names a local path (or an identifier not yet resolved).
    LocalFile(String),
    /// A file owned by the platform.
    RemoteFile(FileHandle),
}

impl JobNode {
    /// Read a job input document: every `File` object becomes [`JobNode::LocalFile`],
    /// taking `location` when present and `path` otherwise. A `File` with neither
    /// as a non-empty string is rejected.
    pub fn from_job_value(value: Value) -> Result<JobNode> {
        Ok(match value {
            Value::Object(map) => {
                if is_file_object(&map) {
                    let raw = map
                        .get("location")
                        .or_else(|| map.get("path"))
                        .and_then(Value::as_str)
                        .map(strip_file_scheme)
                        .filter(|raw| !raw.is_empty())
                        .ok_or_else(|| {
                            RunnerError::invalid(
                                "job",
                                "File input needs a non-empty string `location` or `path`",
                            )
                        })?;
                    JobNode::LocalFile(raw.to_string())
                } else {
                    JobNode::Mapping(
                        map.into_iter()
                            .map(|(k, v)| Ok((k, JobNode::from_job_value(v)?)))
                            .collect::<Result<_>>()?,
                    )
                }
            }
            Value::Array(items) => JobNode::Sequence(
                items
                    .into_iter()
                    .map(JobNode::from_job_value)
                    .collect::<Result<_>>()?,
            ),
            other => JobNode::Scalar(other),
        })
    }

    /// Read a task output document: every `File` object is a platform file whose
    /// `path` carries the file id.
    pub fn from_output_value(value: Value) -> JobNode {
        match value {
            Value::Object(map) => {
                if is_file_object(&map) {
                    let id = map
                        .get("path")
                        .or_else(|| map.get("location"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let name = map
                        .get("name")
                        .or_else(|| map.get("basename"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    JobNode::RemoteFile(FileHandle {
                        id,
                        name,
                        size: map.get("size").and_then(Value::as_u64),
                        modified_on: None,
                    })
                } else {
                    JobNode::Mapping(
                        map.into_iter()
                            .map(|(k, v)| (k, JobNode::from_output_value(v)))
                            .collect(),
                    )
                }
            }
            Value::Array(items) => {
                JobNode::Sequence(items.into_iter().map(JobNode::from_output_value).collect())
            }
            other => JobNode::Scalar(other),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            JobNode::Scalar(value) => value,
            JobNode::Sequence(items) => {
                Value::Array(items.into_iter().map(JobNode::into_value).collect())
            }
            JobNode::Mapping(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_value()))
                    .collect::<Map<_, _>>(),
            ),
            JobNode::LocalFile(path) => {
                let mut map = Map::new();
                map.insert(CLASS_KEY.to_string(), Value::String(FILE_CLASS.to_string()));
                map.insert("path".to_string(), Value::String(path));
                Value::Object(map)
            }
            JobNode::RemoteFile(handle) => {
                let mut map = Map::new();
                map.insert(CLASS_KEY.to_string(), Value::String(FILE_CLASS.to_string()));
                map.insert("path".to_string(), Value::String(handle.id));
                map.insert("name".to_string(), Value::String(handle.name));
                Value::Object(map)
            }
        }
    }

    /// Count of file leaves that still point at local paths.
    pub fn local_file_count(&self) -> usize {
        match self {
            JobNode::LocalFile(_) => 1,
            JobNode::Sequence(items) => items.iter().map(JobNode::local_file_count).sum(),
            JobNode::Mapping(map) => map.values().map(JobNode::local_file_count).sum(),
            JobNode::Scalar(_) | JobNode::RemoteFile(_) => 0,
        }
    }
}

fn is_file_object(map: &Map<String, Value>) -> bool {
    map.get(CLASS_KEY).and_then(Value::as_str) == Some(FILE_CLASS)
}

fn strip_file_scheme(raw: &str) -> &str {
    raw.strip_prefix("file://").unwrap_or(raw)
}
