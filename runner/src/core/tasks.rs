//! Task-list text analysis: checkbox counts and forbidden commands.

use std::sync::LazyLock;

use regex::Regex;

static UNCHECKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*- \[ \]").expect("unchecked task regex"));
static CHECKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*- \[[xX]\]").expect("checked task regex"));

/// Commands a task list must not ask the agent to run.
const FORBIDDEN: &[(&str, &str)] = &[
    ("git push", "contains 'git push' command"),
    ("gh pr create", "contains 'gh pr create' command"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub unchecked: u32,
    pub checked: u32,
}

impl TaskCounts {
    pub fn total(&self) -> u32 {
        self.unchecked + self.checked
    }
}

pub fn count_tasks(content: &str) -> TaskCounts {
    TaskCounts {
        unchecked: UNCHECKED.find_iter(content).count() as u32,
        checked: CHECKED.find_iter(content).count() as u32,
    }
}

/// One entry per offending line, e.g. `line 4: contains 'git push' command`.
pub fn compliance_violations(content: &str) -> Vec<String> {
    let mut violations = Vec::new();
    for (index, line) in content.lines().enumerate() {
        for (pattern, description) in FORBIDDEN {
            if line.contains(pattern) {
                violations.push(format!("line {}: {description}", index + 1));
            }
        }
    }
    violations
}
