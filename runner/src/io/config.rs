//! Loop configuration stored as TOML (default `<state_dir>/config.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backend::Backend;
use crate::core::retry::RetryPolicy;
use crate::io::agent::AgentInvocationSpec;

pub const DEFAULT_STATE_DIR: &str = ".ralph-loop";
pub const CONFIG_FILE: &str = "config.toml";

/// Loop configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults
/// below. CLI flags are applied on top after loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Backend for implementation and validation.
    pub backend: Backend,
    pub implementation_model: String,
    pub validation_model: String,

    /// Ask a second backend to confirm approvals.
    pub cross_validate: bool,
    /// Defaults to the opposite of `backend`.
    pub cross_backend: Option<Backend>,
    /// Defaults to the cross backend's default model.
    pub cross_model: Option<String>,

    /// Defaults to the cross-validation settings.
    pub final_plan_backend: Option<Backend>,
    pub final_plan_model: Option<String>,

    /// Defaults to the implementation settings.
    pub tasks_validation_backend: Option<Backend>,
    pub tasks_validation_model: Option<String>,

    pub max_iterations: u32,
    pub max_inadmissible: u32,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub max_turns: u32,
    /// Kill an agent that produced no output for this many seconds.
    pub inactivity_timeout_secs: u64,
    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Task list; discovered from well-known locations when unset.
    pub tasks_file: Option<PathBuf>,
    /// Plan the task list was derived from, checked by tasks validation.
    pub original_plan_file: Option<PathBuf>,
    /// Issue reference passed to `gh issue view`.
    pub github_issue: Option<String>,

    pub enable_learnings: bool,
    /// Relative paths resolve against the state directory.
    pub learnings_file: PathBuf,

    pub verbose: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Claude,
            implementation_model: Backend::Claude.default_model().to_string(),
            validation_model: Backend::Claude.default_model().to_string(),
            cross_validate: true,
            cross_backend: None,
            cross_model: None,
            final_plan_backend: None,
            final_plan_model: None,
            tasks_validation_backend: None,
            tasks_validation_model: None,
            max_iterations: 20,
            max_inadmissible: 5,
            max_retries: 10,
            retry_base_delay_secs: 5,
            max_turns: 100,
            inactivity_timeout_secs: 1800,
            output_limit_bytes: 8 * 1024 * 1024,
            tasks_file: None,
            original_plan_file: None,
            github_issue: None,
            enable_learnings: true,
            learnings_file: PathBuf::from("learnings.md"),
            verbose: false,
        }
    }
}

/// Backend and model for one agent role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentChoice {
    pub backend: Backend,
    pub model: String,
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_inadmissible == 0 {
            return Err(anyhow!("max_inadmissible must be > 0"));
        }
        if self.inactivity_timeout_secs == 0 {
            return Err(anyhow!("inactivity_timeout_secs must be > 0"));
        }
        if self.max_turns == 0 {
            return Err(anyhow!("max_turns must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        let roles = [
            ("implementation_model", self.implementation()),
            ("validation_model", self.validation()),
            ("cross_model", self.cross()),
            ("final_plan_model", self.final_plan()),
            ("tasks_validation_model", self.tasks_validation()),
        ];
        for (label, choice) in roles {
            choice
                .backend
                .check_model(&choice.model)
                .map_err(|msg| anyhow!("{label}: {msg}"))?;
        }
        Ok(())
    }

    pub fn implementation(&self) -> AgentChoice {
        AgentChoice {
            backend: self.backend,
            model: self.implementation_model.clone(),
        }
    }

    pub fn validation(&self) -> AgentChoice {
        AgentChoice {
            backend: self.backend,
            model: self.validation_model.clone(),
        }
    }

    pub fn cross(&self) -> AgentChoice {
        let backend = self.cross_backend.unwrap_or_else(|| self.backend.opposite());
        let model = self
            .cross_model
            .clone()
            .unwrap_or_else(|| backend.default_model().to_string());
        AgentChoice { backend, model }
    }

    pub fn final_plan(&self) -> AgentChoice {
        let cross = self.cross();
        AgentChoice {
            backend: self.final_plan_backend.unwrap_or(cross.backend),
            model: self.final_plan_model.clone().unwrap_or(cross.model),
        }
    }

    pub fn tasks_validation(&self) -> AgentChoice {
        AgentChoice {
            backend: self.tasks_validation_backend.unwrap_or(self.backend),
            model: self
                .tasks_validation_model
                .clone()
                .unwrap_or_else(|| self.implementation_model.clone()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
        }
    }

    pub fn invocation(&self, choice: &AgentChoice) -> AgentInvocationSpec {
        AgentInvocationSpec {
            backend: choice.backend,
            model: choice.model.clone(),
            max_turns: self.max_turns,
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
            verbose: self.verbose,
            workdir: None,
        }
    }

    pub fn learnings_path(&self, state_dir: &Path) -> PathBuf {
        if self.learnings_file.is_absolute() {
            self.learnings_file.clone()
        } else {
            state_dir.join(&self.learnings_file)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        return Ok(RunnerConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn full_file_overrides_every_role() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
backend = "codex"
implementation_model = "gpt-5-codex"
validation_model = "default"
cross_model = "sonnet"
github_issue = "owner/repo#12"
inactivity_timeout_secs = 600
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.backend, Backend::Codex);
        assert_eq!(cfg.implementation_model, "gpt-5-codex");
        assert_eq!(
            cfg.cross(),
            AgentChoice {
                backend: Backend::Claude,
                model: "sonnet".to_string()
            }
        );
        assert_eq!(cfg.github_issue.as_deref(), Some("owner/repo#12"));
        assert_eq!(
            cfg.invocation(&cfg.implementation()).inactivity_timeout,
            Duration::from_secs(600)
        );
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 3\ncross_validate = false\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 3);
        assert!(!cfg.cross_validate);
        assert_eq!(cfg.max_inadmissible, 5);
    }

    #[test]
    fn role_defaults_follow_the_primary_backend() {
        let cfg = RunnerConfig::default();
        assert_eq!(
            cfg.cross(),
            AgentChoice {
                backend: Backend::Codex,
                model: "default".to_string()
            }
        );
        assert_eq!(cfg.final_plan(), cfg.cross());
        assert_eq!(cfg.tasks_validation(), cfg.implementation());
    }

    #[test]
    fn rejects_mismatched_models_and_zero_limits() {
        let cfg = RunnerConfig {
            implementation_model: "gpt-4o".to_string(),
            ..RunnerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("implementation_model"));

        let cfg = RunnerConfig {
            max_inadmissible: 0,
            ..RunnerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
