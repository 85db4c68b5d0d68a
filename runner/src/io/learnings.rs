//! Learnings file shared across iterations.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::debug;

const TEMPLATE: &str = "# Ralph Loop Learnings\n\n## Codebase Patterns\n<!-- Add reusable patterns discovered during implementation -->\n\n---\n\n## Iteration Log\n";

#[derive(Debug, Clone)]
pub struct LearningsFile {
    path: PathBuf,
}

impl LearningsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file from the template unless it already exists.
    pub fn init(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&self.path, TEMPLATE)
            .with_context(|| format!("write {}", self.path.display()))
    }

    /// Current contents, or an empty string when the file does not exist.
    pub fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err).with_context(|| format!("read {}", self.path.display())),
        }
    }

    pub fn append(&self, iteration: u32, content: &str) -> Result<()> {
        self.init()?;
        let entry = format!(
            "\n## Iteration {iteration} ({})\n\n{}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            content.trim()
        );
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(entry.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))?;
        debug!(iteration, path = %self.path.display(), "learnings appended");
        Ok(())
    }
}
