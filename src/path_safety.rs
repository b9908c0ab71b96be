use std::path::{Component, Path, PathBuf};

use crate::error::{Result, RunnerError};

/// Join a platform-supplied file name onto `root`, refusing anything that is
/// not a single plain path component.
/// Rejects absolute names, separators and `..`.
pub fn join_under_root(root: &Path, name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    let mut components = candidate.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(root.join(candidate)),
        _ => Err(RunnerError::invalid(
            "output",
            format!("file name escapes output directory ({}): {name}", root.display()),
        )),
    }
}
