//! Shared deterministic types for the loop core.
//!
//! These types are persisted in session state and reported by the CLI, so their
//! serialized names are stable.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exit_codes;

/// Phase of a loop iteration. Also records where a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    TasksValidation,
    FinalPlanValidation,
    #[default]
    Implementation,
    Validation,
    CrossValidation,
    Decision,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::TasksValidation => "tasks_validation",
            Phase::FinalPlanValidation => "final_plan_validation",
            Phase::Implementation => "implementation",
            Phase::Validation => "validation",
            Phase::CrossValidation => "cross_validation",
            Phase::Decision => "decision",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    #[default]
    InProgress,
    Interrupted,
    Cancelled,
    Complete,
    Failed,
    MaxIterations,
    Escalated,
    Blocked,
    TasksInvalid,
    Inadmissible,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Interrupted => "INTERRUPTED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Complete => "COMPLETE",
            SessionStatus::Failed => "FAILED",
            SessionStatus::MaxIterations => "MAX_ITERATIONS",
            SessionStatus::Escalated => "ESCALATED",
            SessionStatus::Blocked => "BLOCKED",
            SessionStatus::TasksInvalid => "TASKS_INVALID",
            SessionStatus::Inadmissible => "INADMISSIBLE",
        }
    }

    /// Completed sessions have nothing left to resume.
    pub fn is_resumable(self) -> bool {
        self != SessionStatus::Complete
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a run. Each maps to exactly one process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Success,
    Error,
    MaxIterations,
    Escalate,
    Blocked,
    TasksInvalid,
    Inadmissible,
    Interrupted,
}

impl Terminal {
    pub fn exit_code(self) -> i32 {
        match self {
            Terminal::Success => exit_codes::SUCCESS,
            Terminal::Error => exit_codes::ERROR,
            Terminal::MaxIterations => exit_codes::MAX_ITERATIONS,
            Terminal::Escalate => exit_codes::ESCALATE,
            Terminal::Blocked => exit_codes::BLOCKED,
            Terminal::TasksInvalid => exit_codes::TASKS_INVALID,
            Terminal::Inadmissible => exit_codes::INADMISSIBLE,
            Terminal::Interrupted => exit_codes::INTERRUPTED,
        }
    }

    pub fn name(self) -> &'static str {
        exit_codes::name(self.exit_code())
    }

    /// Session status recorded when a run ends with this outcome.
    pub fn session_status(self) -> SessionStatus {
        match self {
            Terminal::Success => SessionStatus::Complete,
            Terminal::Error => SessionStatus::Failed,
            Terminal::MaxIterations => SessionStatus::MaxIterations,
            Terminal::Escalate => SessionStatus::Escalated,
            Terminal::Blocked => SessionStatus::Blocked,
            Terminal::TasksInvalid => SessionStatus::TasksInvalid,
            Terminal::Inadmissible => SessionStatus::Inadmissible,
            Terminal::Interrupted => SessionStatus::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_outcomes_have_distinct_exit_codes() {
        let all = [
            Terminal::Success,
            Terminal::Error,
            Terminal::MaxIterations,
            Terminal::Escalate,
            Terminal::Blocked,
            Terminal::TasksInvalid,
            Terminal::Inadmissible,
            Terminal::Interrupted,
        ];
        let mut codes: Vec<i32> = all.iter().map(|t| t.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6, 130]);
    }

    #[test]
    fn session_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&SessionStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        assert_eq!(SessionStatus::TasksInvalid.as_str(), "TASKS_INVALID");
        assert!(SessionStatus::Interrupted.is_resumable());
        assert!(!SessionStatus::Complete.is_resumable());
    }
}
