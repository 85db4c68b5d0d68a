//! Durable session state (`<state_dir>/current-state.json`).
//!
//! The state file is the resume contract: it is rewritten atomically after
//! every completed phase and read back by `--resume` and `status`. Unknown
//! fields are ignored on load so older and newer binaries can share a
//! directory.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::backend::Backend;
use crate::core::types::{Phase, SessionStatus};
use crate::core::verdicts::Discrepancy;
use crate::io::atomic::write_atomic;

pub const STATE_FILE: &str = "current-state.json";
pub const CANCEL_FILE: &str = "cancel.request";
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningsState {
    pub enabled: bool,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossValidationState {
    pub enabled: bool,
    pub backend: Option<Backend>,
    pub model: String,
    pub available: bool,
}

/// What one phase of an iteration produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub summary: String,
}

/// Bookkeeping for one completed implementation/validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationRecord {
    pub index: u32,
    pub finished_at: String,
    pub outcomes: Vec<PhaseOutcome>,
    pub verdict: Option<String>,
    pub cross_verdict: Option<String>,
    /// Reported by a rejecting cross-validator.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub discrepancies: Vec<Discrepancy>,
    pub decision: String,
    pub inadmissible_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub schema_version: u32,
    pub session_id: String,
    pub started_at: String,
    pub last_updated: String,
    /// Completed implementation/validation passes.
    pub iteration: u32,
    pub status: SessionStatus,
    /// Phase in progress, or the next phase to run.
    pub phase: Phase,
    pub verdict: Option<String>,
    pub tasks_file: PathBuf,
    pub tasks_file_hash: String,
    pub backend: Backend,
    pub implementation_model: String,
    pub validation_model: String,
    pub max_iterations: u32,
    pub max_inadmissible: u32,
    pub inadmissible_count: u32,
    pub original_plan_file: Option<PathBuf>,
    pub github_issue: Option<String>,
    pub learnings: LearningsState,
    pub cross_validation: CrossValidationState,
    pub tasks_validated: bool,
    pub last_feedback: Option<String>,
    pub history: Vec<IterationRecord>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: String::new(),
            started_at: String::new(),
            last_updated: String::new(),
            iteration: 0,
            status: SessionStatus::InProgress,
            phase: Phase::Implementation,
            verdict: None,
            tasks_file: PathBuf::new(),
            tasks_file_hash: String::new(),
            backend: Backend::Claude,
            implementation_model: String::new(),
            validation_model: String::new(),
            max_iterations: 20,
            max_inadmissible: 5,
            inadmissible_count: 0,
            original_plan_file: None,
            github_issue: None,
            learnings: LearningsState::default(),
            cross_validation: CrossValidationState::default(),
            tasks_validated: false,
            last_feedback: None,
            history: Vec::new(),
        }
    }
}

impl SessionState {
    /// Fresh state stamped with a new session id and start time.
    pub fn start(tasks_file: PathBuf, tasks_file_hash: String) -> Self {
        let now = Local::now();
        Self {
            session_id: format!("ralph-{}", now.format("%Y%m%d-%H%M%S")),
            started_at: now.to_rfc3339_opts(SecondsFormat::Secs, false),
            last_updated: now.to_rfc3339_opts(SecondsFormat::Secs, false),
            tasks_file,
            tasks_file_hash,
            ..Self::default()
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = timestamp();
    }
}

pub fn timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// The task file changed since the session last saw it.
#[derive(Debug, Error)]
#[error(
    "task file {} changed since the session was saved (stored {stored}, current {current}); use --resume-force to continue anyway",
    .path.display()
)]
pub struct FingerprintMismatch {
    pub path: PathBuf,
    pub stored: String,
    pub current: String,
}

/// Lowercase hex SHA-256 of a file.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Compare the stored fingerprint with the file on disk.
///
/// With `force`, a mismatch is logged and the stored fingerprint replaced.
pub fn verify_fingerprint(state: &mut SessionState, force: bool) -> Result<()> {
    let current = fingerprint_file(&state.tasks_file)?;
    if state.tasks_file_hash.is_empty() || state.tasks_file_hash == current {
        state.tasks_file_hash = current;
        return Ok(());
    }
    if !force {
        return Err(FingerprintMismatch {
            path: state.tasks_file.clone(),
            stored: state.tasks_file_hash.clone(),
            current,
        }
        .into());
    }
    warn!(
        tasks_file = %state.tasks_file.display(),
        "task file changed since last save; continuing because of --resume-force"
    );
    state.tasks_file_hash = current;
    Ok(())
}

/// Filesystem layout of a state directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn cancel_path(&self) -> PathBuf {
        self.dir.join(CANCEL_FILE)
    }

    pub fn issue_path(&self) -> PathBuf {
        self.dir.join("github-issue.md")
    }

    pub fn iteration_dir(&self, index: u32) -> PathBuf {
        self.dir.join(format!("iteration-{index:03}"))
    }

    pub fn exists(&self) -> bool {
        self.state_path().exists()
    }

    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create state dir {}", self.dir.display()))
    }

    pub fn load(&self) -> Result<SessionState> {
        let path = self.state_path();
        debug!(path = %path.display(), "loading session state");
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read session state {}", path.display()))?;
        let state: SessionState = serde_json::from_str(&contents)
            .with_context(|| format!("parse session state {}", path.display()))?;
        debug!(session_id = %state.session_id, iteration = state.iteration, status = %state.status, "session state loaded");
        Ok(state)
    }

    pub fn save(&self, state: &SessionState) -> Result<()> {
        debug!(session_id = %state.session_id, iteration = state.iteration, phase = %state.phase, status = %state.status, "writing session state");
        let mut buf = serde_json::to_string_pretty(state).context("serialize session state")?;
        buf.push('\n');
        write_atomic(&self.state_path(), &buf)
    }

    /// Remove the whole state directory.
    pub fn clean(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("remove state dir {}", self.dir.display()))?;
            info!(dir = %self.dir.display(), "state directory removed");
        }
        Ok(())
    }

    /// Remove per-iteration artifacts left by an earlier session.
    pub fn clear_iterations(&self) -> Result<()> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok(());
        };
        for entry in entries {
            let entry = entry.with_context(|| format!("list {}", self.dir.display()))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("iteration-") && entry.path().is_dir() {
                fs::remove_dir_all(entry.path())
                    .with_context(|| format!("remove {}", entry.path().display()))?;
            }
        }
        Ok(())
    }

    /// Ask a running loop in this state directory to stop.
    pub fn request_cancel(&self) -> Result<()> {
        self.init()?;
        write_atomic(&self.cancel_path(), &format!("{}\n", timestamp()))
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_path().exists()
    }

    pub fn clear_cancel_request(&self) -> Result<()> {
        let path = self.cancel_path();
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }
}

/// Human-readable summary for `ralph-loop status`.
pub fn format_status(state: &SessionState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Session:      {}", state.session_id);
    let _ = writeln!(out, "Status:       {}", state.status);
    let _ = writeln!(out, "Phase:        {}", state.phase);
    let _ = writeln!(
        out,
        "Iteration:    {}/{}",
        state.iteration, state.max_iterations
    );
    let _ = writeln!(
        out,
        "Inadmissible: {}/{}",
        state.inadmissible_count, state.max_inadmissible
    );
    let _ = writeln!(
        out,
        "Backend:      {} (implementation {}, validation {})",
        state.backend, state.implementation_model, state.validation_model
    );
    if state.cross_validation.enabled {
        let backend = state
            .cross_validation
            .backend
            .map_or_else(|| "-".to_string(), |b| b.to_string());
        let _ = writeln!(
            out,
            "Cross:        {} {}{}",
            backend,
            state.cross_validation.model,
            if state.cross_validation.available { "" } else { " (unavailable)" }
        );
    }
    let _ = writeln!(out, "Tasks file:   {}", state.tasks_file.display());
    if let Some(verdict) = &state.verdict {
        let _ = writeln!(out, "Last verdict: {verdict}");
    }
    if let Some(feedback) = state.last_feedback.as_deref().filter(|f| !f.is_empty()) {
        let _ = writeln!(out, "Feedback:     {}", feedback.lines().next().unwrap_or_default());
    }
    if let Some(last) = state.history.last() {
        for d in &last.discrepancies {
            let _ = writeln!(out, "Discrepancy:  {}: claimed {}; actual {}", d.task_id, d.claimed, d.actual);
        }
    }
    let _ = writeln!(out, "Updated:      {}", state.last_updated);
    out
}
