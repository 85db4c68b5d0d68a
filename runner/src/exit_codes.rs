//! Stable exit codes for `ralph-loop run`.

/// All tasks were validated as complete.
pub const SUCCESS: i32 = 0;
/// Configuration, I/O or agent failures that could not be recovered.
pub const ERROR: i32 = 1;
/// The iteration budget ran out before a terminal verdict.
pub const MAX_ITERATIONS: i32 = 2;
/// The validator asked for human attention.
pub const ESCALATE: i32 = 3;
/// Every remaining task is blocked.
pub const BLOCKED: i32 = 4;
/// The task list was rejected against the original plan.
pub const TASKS_INVALID: i32 = 5;
/// Too many inadmissible validation verdicts.
pub const INADMISSIBLE: i32 = 6;
/// The run was interrupted by a signal or a cancel request.
pub const INTERRUPTED: i32 = 130;

/// Human-readable name for an exit code.
pub fn name(code: i32) -> &'static str {
    match code {
        SUCCESS => "SUCCESS",
        ERROR => "ERROR",
        MAX_ITERATIONS => "MAX_ITERATIONS",
        ESCALATE => "ESCALATE",
        BLOCKED => "BLOCKED",
        TASKS_INVALID => "TASKS_INVALID",
        INADMISSIBLE => "INADMISSIBLE",
        INTERRUPTED => "INTERRUPTED",
        _ => "UNKNOWN",
    }
}
