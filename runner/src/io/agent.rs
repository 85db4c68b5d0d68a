//! Agent runner abstraction and the CLI-backed implementation.
//!
//! The [`AgentRunner`] trait decouples the loop from the agent backend. The
//! production [`CliAgent`] spawns `claude` or `codex`, watches it for
//! inactivity and decodes its event stream into plain text. Tests use scripted
//! runners that return predetermined outputs without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::backend::{Backend, CODEX_DEFAULT_MODEL};
use crate::core::stream::{ClaudeEvent, decode_claude_line, decode_claude_stream, decode_codex_line, decode_codex_stream};
use crate::io::process::{Termination, WatchOptions, run_watched};

/// Hard cap on a single agent invocation, independent of activity.
pub const MAX_RUNTIME: Duration = Duration::from_secs(7200);

/// Closed set of agent failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid agent configuration: {0}")]
    Config(String),
    #[error("{program} is not installed or not on PATH")]
    Unavailable { program: String },
    #[error("agent produced no output for {}s and was killed", .after.as_secs())]
    Timeout { after: Duration },
    #[error("agent process failed: {0}")]
    Process(String),
    #[error("agent run cancelled")]
    Cancelled,
}

impl AgentError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Timeout { .. } | AgentError::Process(_))
    }
}

/// One prompt to run.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    /// Raw event stream is copied here while the agent runs.
    pub stream_path: Option<PathBuf>,
}

/// Runs a prompt to completion and returns the agent's text output.
pub trait AgentRunner {
    fn execute(&self, cancel: &CancelToken, request: &AgentRequest) -> Result<String, AgentError>;
}

impl<R: AgentRunner + ?Sized> AgentRunner for Box<R> {
    fn execute(&self, cancel: &CancelToken, request: &AgentRequest) -> Result<String, AgentError> {
        (**self).execute(cancel, request)
    }
}

/// How to invoke one backend.
#[derive(Debug, Clone)]
pub struct AgentInvocationSpec {
    pub backend: Backend,
    pub model: String,
    pub max_turns: u32,
    pub inactivity_timeout: Duration,
    pub output_limit_bytes: usize,
    /// Log decoded agent text at info level instead of debug.
    pub verbose: bool,
    pub workdir: Option<PathBuf>,
}

impl AgentInvocationSpec {
    /// Command-line arguments for `prompt`, excluding the program name.
    pub fn args(&self, prompt: &str) -> Vec<String> {
        match self.backend {
            Backend::Claude => vec![
                "--print".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "--model".to_string(),
                self.model.clone(),
                "--max-turns".to_string(),
                self.max_turns.to_string(),
                "--".to_string(),
                prompt.to_string(),
            ],
            Backend::Codex => {
                let mut args = vec![
                    "exec".to_string(),
                    "--json".to_string(),
                    "--dangerously-bypass-approvals-and-sandbox".to_string(),
                ];
                if !self.model.is_empty() && !self.model.eq_ignore_ascii_case(CODEX_DEFAULT_MODEL) {
                    args.push("--model".to_string());
                    args.push(self.model.clone());
                }
                args.push(prompt.to_string());
                args
            }
        }
    }
}

/// Agent backed by the `claude` or `codex` CLI.
#[derive(Debug, Clone)]
pub struct CliAgent {
    spec: AgentInvocationSpec,
}

impl CliAgent {
    pub fn new(spec: AgentInvocationSpec) -> Self {
        Self { spec }
    }

    fn log_line(&self, line: &str) {
        let text = match self.spec.backend {
            Backend::Claude => match decode_claude_line(line) {
                Some(ClaudeEvent::Assistant(text)) => text,
                _ => return,
            },
            Backend::Codex => match decode_codex_line(line) {
                Some(text) => text,
                None => return,
            },
        };
        if self.spec.verbose {
            info!(backend = %self.spec.backend, "{}", text.trim_end());
        } else {
            debug!(backend = %self.spec.backend, "{}", text.trim_end());
        }
    }
}

impl AgentRunner for CliAgent {
    #[instrument(skip_all, fields(backend = %self.spec.backend, model = %self.spec.model))]
    fn execute(&self, cancel: &CancelToken, request: &AgentRequest) -> Result<String, AgentError> {
        self.spec
            .backend
            .check_model(&self.spec.model)
            .map_err(AgentError::Config)?;

        let mut cmd = Command::new(self.spec.backend.program());
        cmd.args(self.spec.args(&request.prompt));
        if let Some(dir) = &self.spec.workdir {
            cmd.current_dir(dir);
        }

        let opts = WatchOptions {
            inactivity: self.spec.inactivity_timeout,
            max_runtime: Some(MAX_RUNTIME),
            output_limit_bytes: self.spec.output_limit_bytes,
            stream_path: request.stream_path.as_deref(),
            ..WatchOptions::default()
        };
        let output = run_watched(cmd, &opts, cancel, |line| self.log_line(line))
            .map_err(|err| AgentError::Process(format!("{err:#}")))?;

        let status = match output.termination {
            Termination::Cancelled => return Err(AgentError::Cancelled),
            Termination::Inactive => {
                return Err(AgentError::Timeout {
                    after: self.spec.inactivity_timeout,
                });
            }
            Termination::Overran => return Err(AgentError::Timeout { after: MAX_RUNTIME }),
            Termination::Exited(status) => status,
        };

        let raw = String::from_utf8_lossy(&output.stdout);
        if !status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?status.code(), "agent exited with failure");
            return Err(AgentError::Process(format!(
                "{} exited with status {:?}: {}",
                self.spec.backend,
                status.code(),
                tail(&stderr, 2000)
            )));
        }

        let text = match self.spec.backend {
            Backend::Claude => decode_claude_stream(&raw),
            Backend::Codex => decode_codex_stream(&raw),
        };
        if text.trim().is_empty() {
            debug!("no decodable events, returning raw stdout");
            return Ok(raw.into_owned());
        }
        Ok(text)
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let trimmed = text.trim_end();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed;
    }
    let skip = trimmed
        .char_indices()
        .nth(count - max_chars)
        .map_or(0, |(at, _)| at);
    &trimmed[skip..]
}
