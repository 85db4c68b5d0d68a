//! Supported agent CLIs and model-name compatibility checks.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static CODEX_MODEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(o[0-9]|gpt|chatgpt|text|ft)").expect("codex model regex"));

const CLAUDE_HINTS: &[&str] = &["opus", "sonnet", "haiku", "claude-"];

/// Model name that lets the Codex CLI choose its own default.
pub const CODEX_DEFAULT_MODEL: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Claude,
    Codex,
}

impl Backend {
    /// Executable looked up on `PATH`.
    pub fn program(self) -> &'static str {
        match self {
            Backend::Claude => "claude",
            Backend::Codex => "codex",
        }
    }

    pub fn opposite(self) -> Backend {
        match self {
            Backend::Claude => Backend::Codex,
            Backend::Codex => Backend::Claude,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Backend::Claude => "opus",
            Backend::Codex => CODEX_DEFAULT_MODEL,
        }
    }

    /// Reject model names that obviously belong to the other backend.
    ///
    /// An empty model is always accepted.
    pub fn check_model(self, model: &str) -> Result<(), String> {
        if model.is_empty() {
            return Ok(());
        }
        let lower = model.to_ascii_lowercase();
        if lower == CODEX_DEFAULT_MODEL {
            return match self {
                Backend::Codex => Ok(()),
                Backend::Claude => Err(format!(
                    "model {model:?} is not compatible with claude (\"default\" is a codex model)"
                )),
            };
        }
        match self {
            Backend::Codex if CLAUDE_HINTS.iter().any(|hint| lower.starts_with(hint)) => {
                Err(format!("model {model:?} looks like a claude model but backend is codex"))
            }
            Backend::Claude if CODEX_MODEL.is_match(&lower) => Err(format!(
                "model {model:?} looks like a codex/openai model but backend is claude"
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Backend::Claude),
            "codex" => Ok(Backend::Codex),
            other => Err(format!("unknown backend {other:?} (expected claude or codex)")),
        }
    }
}
