//! Task file discovery and reading.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::core::tasks::{TaskCounts, compliance_violations, count_tasks};

const WELL_KNOWN: &[&str] = &["tasks.md", "TASKS.md", "specs/tasks.md", "spec/tasks.md"];
const SUBDIR_ROOTS: &[&str] = &["specs", "spec"];

/// Resolve the task file: `explicit` if given, else the first well-known
/// location under `root`, else `specs/*/tasks.md` or `spec/*/tasks.md`.
pub fn discover_tasks_file(root: &Path, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        if !resolved.is_file() {
            bail!("tasks file not found: {}", path.display());
        }
        return Ok(resolved);
    }

    for rel in WELL_KNOWN {
        let candidate = root.join(rel);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "discovered tasks file");
            return Ok(candidate);
        }
    }

    for sub in SUBDIR_ROOTS {
        let Ok(entries) = fs::read_dir(root.join(sub)) else {
            continue;
        };
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join("tasks.md"))
            .filter(|path| path.is_file())
            .collect();
        candidates.sort();
        if let Some(first) = candidates.into_iter().next() {
            debug!(path = %first.display(), "discovered tasks file");
            return Ok(first);
        }
    }

    bail!(
        "no tasks file found under {} (searched tasks.md, TASKS.md, specs/, spec/)",
        root.display()
    )
}

pub fn read_task_counts(path: &Path) -> Result<TaskCounts> {
    let content = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(count_tasks(&content))
}

/// Log every forbidden command in the task file. Violations do not stop the run.
pub fn warn_on_violations(path: &Path) -> Result<usize> {
    let content = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let violations = compliance_violations(&content);
    for violation in &violations {
        warn!(tasks_file = %path.display(), "{violation}");
    }
    Ok(violations.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "- [ ] task\n").unwrap();
    }

    #[test]
    fn explicit_path_must_exist() {
        let temp = tempfile::tempdir().unwrap();
        assert!(discover_tasks_file(temp.path(), Some(Path::new("nope.md"))).is_err());
        touch(&temp.path().join("plan/todo.md"));
        let found = discover_tasks_file(temp.path(), Some(Path::new("plan/todo.md"))).unwrap();
        assert_eq!(found, temp.path().join("plan/todo.md"));
    }

    #[test]
    fn well_known_locations_win_over_subdirectories() {
        let temp = tempfile::tempdir().unwrap();
        touch(&temp.path().join("specs/feature/tasks.md"));
        touch(&temp.path().join("spec/tasks.md"));
        let found = discover_tasks_file(temp.path(), None).unwrap();
        assert_eq!(found, temp.path().join("spec/tasks.md"));
    }

    #[test]
    fn subdirectory_matches_are_sorted() {
        let temp = tempfile::tempdir().unwrap();
        touch(&temp.path().join("specs/b-second/tasks.md"));
        touch(&temp.path().join("specs/a-first/tasks.md"));
        let found = discover_tasks_file(temp.path(), None).unwrap();
        assert_eq!(found, temp.path().join("specs/a-first/tasks.md"));
    }

    #[test]
    fn nothing_found_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        assert!(discover_tasks_file(temp.path(), None).is_err());
    }

    #[test]
    fn counts_and_violations_from_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("tasks.md");
        fs::write(&path, "- [x] done\n- [ ] git push the branch\n").unwrap();
        assert_eq!(read_task_counts(&path).unwrap().unchecked, 1);
        assert_eq!(warn_on_violations(&path).unwrap(), 1);
    }
}
