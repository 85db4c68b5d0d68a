//! Per-iteration artifacts under `<state_dir>/iteration-NNN/`.
//!
//! Agent outputs are written as soon as each phase finishes; their presence is
//! also what lets an interrupted iteration resume at the next phase.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::Phase;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub session_id: String,
    pub iteration: u32,
    pub verdict: Option<String>,
    pub cross_verdict: Option<String>,
    pub decision: String,
    pub remaining_tasks: u32,
    pub inadmissible_count: u32,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
}

impl IterationPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            meta_path: dir.join("meta.json"),
            dir,
        }
    }

    /// Decoded agent text for a phase.
    pub fn output_path(&self, phase: Phase) -> PathBuf {
        self.dir.join(format!("{}-output.txt", file_stem(phase)))
    }

    /// Raw event stream captured while the phase's agent ran.
    pub fn stream_path(&self, phase: Phase) -> PathBuf {
        self.dir.join(format!("{}-output.stream.jsonl", file_stem(phase)))
    }

    /// Output of a phase completed by an earlier, interrupted run.
    pub fn completed_output(&self, phase: Phase) -> Result<Option<String>> {
        let path = self.output_path(phase);
        if !path.is_file() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("read {}", path.display()))
    }

    pub fn write_output(&self, phase: Phase, output: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))?;
        let path = self.output_path(phase);
        write_text(&path, output)?;
        Ok(path)
    }

    pub fn write_meta(&self, meta: &IterationMeta) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))?;
        let mut buf = serde_json::to_string_pretty(meta)?;
        buf.push('\n');
        write_text(&self.meta_path, &buf)
    }
}

fn file_stem(phase: Phase) -> &'static str {
    match phase {
        Phase::TasksValidation => "tasks-validation",
        Phase::FinalPlanValidation => "final-plan-validation",
        Phase::Implementation => "implementation",
        Phase::Validation => "validation",
        Phase::CrossValidation => "cross-validation",
        Phase::Decision => "decision",
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path().join("iteration-007"));

        assert!(paths.meta_path.ends_with("iteration-007/meta.json"));
        assert!(paths.output_path(Phase::Implementation).ends_with("implementation-output.txt"));
        assert!(
            paths
                .stream_path(Phase::CrossValidation)
                .ends_with("cross-validation-output.stream.jsonl")
        );
    }

    #[test]
    fn outputs_are_found_after_writing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path().join("iteration-001"));
        assert_eq!(paths.completed_output(Phase::Validation).expect("read"), None);

        paths.write_output(Phase::Validation, "verdict text").expect("write");
        assert_eq!(
            paths.completed_output(Phase::Validation).expect("read").as_deref(),
            Some("verdict text")
        );

        paths
            .write_meta(&IterationMeta {
                session_id: "ralph-1".to_string(),
                iteration: 1,
                verdict: Some("APPROVED".to_string()),
                cross_verdict: None,
                decision: "success".to_string(),
                remaining_tasks: 0,
                inadmissible_count: 0,
                started_at: None,
                ended_at: None,
                duration_ms: Some(12),
            })
            .expect("meta");
        let meta = fs::read_to_string(&paths.meta_path).expect("read meta");
        assert!(meta.contains("\"decision\": \"success\""));
    }
}
