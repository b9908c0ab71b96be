use crate::error::{Result, RunnerError};
use serde_json::{Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const WORKFLOW_CLASS: &str = "Workflow";

/// Parse a YAML (or JSON) document from disk.
pub fn load_document(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).map_err(|e| RunnerError::io(path, e))?;
    serde_yaml_bw::from_str::<Value>(&content).map_err(|e| RunnerError::Yaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load a workflow and inline every step whose `run` names another file.
///
/// Relative `run` paths resolve against the directory of the document that
/// contains them. Any unreadable document aborts the whole load.
pub fn load_workflow(path: &Path) -> Result<Value> {
    let mut stack = Vec::new();
    load_inlined(path, &mut stack)
}

fn load_inlined(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Value> {
    let key = fs::canonicalize(path).map_err(|e| RunnerError::io(path, e))?;
    if stack.contains(&key) {
        return Err(RunnerError::invalid(
            path.display().to_string(),
            "workflow references itself through its steps",
        ));
    }

    let mut doc = load_document(path)?;
    if !doc.is_object() {
        return Err(RunnerError::invalid(
            path.display().to_string(),
            "document must be a mapping",
        ));
    }
    if !is_workflow(&doc) {
        return Ok(doc);
    }

    stack.push(key);
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    if let Some(steps) = doc.get_mut("steps") {
        for step in step_entries(steps) {
            let Some(Value::String(reference)) = step.get("run") else {
                continue;
            };
            let target = resolve_reference(base, reference);
            debug!(step = %target.display(), "inlining workflow step");
            let inlined = load_inlined(&target, stack)?;
            if let Some(obj) = step.as_object_mut() {
                obj.insert("run".to_string(), inlined);
            }
        }
    }
    stack.pop();
    Ok(doc)
}

pub fn is_workflow(doc: &Value) -> bool {
    doc.get("class").and_then(Value::as_str) == Some(WORKFLOW_CLASS)
}

/// Steps may be a list or a mapping keyed by step id.
fn step_entries(steps: &mut Value) -> Vec<&mut Value> {
    match steps {
        Value::Array(items) => items.iter_mut().collect(),
        Value::Object(map) => map.values_mut().collect(),
        _ => Vec::new(),
    }
}

fn resolve_reference(base: &Path, reference: &str) -> PathBuf {
    let reference = reference.strip_prefix("file://").unwrap_or(reference);
    let candidate = Path::new(reference);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

/// Give the document an `id` derived from the file stem when it has none.
pub fn ensure_document_id(doc: &mut Value, path: &Path) {
    let Some(map) = doc.as_object_mut() else {
        return;
    };
    if map.get("id").is_some_and(|id| !id.is_null()) {
        return;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());
    map.insert("id".to_string(), Value::String(stem));
}

/// Load the job document; no path means an empty job.
pub fn load_job(path: Option<&Path>) -> Result<Value> {
    let Some(path) = path else {
        return Ok(Value::Object(Map::new()));
    };
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let job = match extension.as_str() {
        "json" => {
            let content = fs::read_to_string(path).map_err(|e| RunnerError::io(path, e))?;
            serde_json::from_str::<Value>(&content).map_err(|e| RunnerError::Json {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        }
        "yaml" | "yml" => load_document(path)?,
        _ => {
            return Err(RunnerError::UnsupportedJobFormat {
                path: path.to_path_buf(),
            });
        }
    };
    match job {
        Value::Object(_) => Ok(job),
        Value::Null => Ok(Value::Object(Map::new())),
        _ => Err(RunnerError::invalid(
            path.display().to_string(),
            "job document must be a mapping",
        )),
    }
}

/// Copy declared input defaults into the job for every input it leaves unset.
pub fn fill_job_defaults(job: &mut Value, workflow: &Value) {
    let Some(job_map) = job.as_object_mut() else {
        return;
    };
    for (id, default) in input_defaults(workflow) {
        if !job_map.contains_key(&id) {
            job_map.insert(id, default);
        }
    }
}

fn input_defaults(workflow: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    match workflow.get("inputs") {
        Some(Value::Array(inputs)) => {
            for input in inputs {
                let id = input.get("id").and_then(Value::as_str);
                if let (Some(id), Some(default)) = (id, input.get("default")) {
                    out.push((normalize_input_id(id), default.clone()));
                }
            }
        }
        Some(Value::Object(inputs)) => {
            for (id, input) in inputs {
                if let Some(default) = input.get("default") {
                    out.push((normalize_input_id(id), default.clone()));
                }
            }
        }
        _ => {}
    }
    out
}

fn normalize_input_id(id: &str) -> String {
    id.trim_start_matches('#').to_string()
}
