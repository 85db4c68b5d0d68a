//! Pure decision step applied after each validation pass.

use crate::core::types::Terminal;
use crate::core::verdicts::ValidationStatus;

/// Inputs the decision depends on. `status` is `None` when the validator
/// produced no usable envelope.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub status: Option<ValidationStatus>,
    pub feedback: &'a str,
    /// Unchecked tasks left in the task file.
    pub remaining: u32,
    /// Tasks the validator reported as blocked.
    pub blocked: u32,
    pub inadmissible_count: u32,
    pub max_inadmissible: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Continue,
    Stop(Terminal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub next: Next,
    /// Inadmissible counter after this pass.
    pub inadmissible_count: u32,
    /// Feedback carried into the next implementation prompt.
    pub feedback: String,
}

pub fn decide(input: &DecisionInput<'_>) -> Decision {
    let feedback = input.feedback.trim().to_string();
    let doable = input.remaining.saturating_sub(input.blocked);
    let keep_count = input.inadmissible_count;

    match input.status {
        Some(ValidationStatus::Approved) => {
            if input.remaining == 0 {
                stop(Terminal::Success, keep_count, feedback)
            } else if doable > 0 {
                Decision {
                    next: Next::Continue,
                    inadmissible_count: keep_count,
                    feedback: format!(
                        "Validation approved but {} tasks remain unchecked. Continuing implementation.",
                        input.remaining
                    ),
                }
            } else {
                stop(Terminal::Blocked, keep_count, feedback)
            }
        }
        Some(ValidationStatus::NeedsMoreWork) => Decision {
            next: Next::Continue,
            inadmissible_count: keep_count,
            feedback,
        },
        Some(ValidationStatus::Escalate) => stop(Terminal::Escalate, keep_count, feedback),
        Some(ValidationStatus::Blocked) => {
            if doable > 0 {
                Decision {
                    next: Next::Continue,
                    inadmissible_count: keep_count,
                    feedback,
                }
            } else {
                stop(Terminal::Blocked, keep_count, feedback)
            }
        }
        Some(ValidationStatus::Rejected | ValidationStatus::Inadmissible | ValidationStatus::Unknown)
        | None => {
            let count = input.inadmissible_count.saturating_add(1);
            let feedback = if feedback.is_empty() {
                "The previous pass was not admissible. Re-read the task list and address every unchecked task."
                    .to_string()
            } else {
                feedback
            };
            if count >= input.max_inadmissible {
                stop(Terminal::Inadmissible, count, feedback)
            } else {
                Decision {
                    next: Next::Continue,
                    inadmissible_count: count,
                    feedback,
                }
            }
        }
    }
}

fn stop(terminal: Terminal, inadmissible_count: u32, feedback: String) -> Decision {
    Decision {
        next: Next::Stop(terminal),
        inadmissible_count,
        feedback,
    }
}
