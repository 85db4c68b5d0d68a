//! Test-only fakes: scripted agents, a fake PATH probe and a workspace fixture.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::io::agent::{AgentError, AgentRequest, AgentRunner};
use crate::io::availability::Availability;
use crate::io::config::RunnerConfig;
use crate::io::session_store::SessionStore;

type Response = Box<dyn FnMut(&CancelToken, &AgentRequest) -> Result<String, AgentError>>;

/// Agent that replays queued responses in order.
///
/// Panics when called more often than scripted, so an unexpected extra phase
/// fails the test loudly.
#[derive(Default)]
pub struct ScriptedRunner {
    name: String,
    responses: RefCell<VecDeque<Response>>,
    calls: Cell<usize>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            ..Self::default()
        })
    }

    /// Queue a response computed at call time.
    pub fn then(
        self: &Rc<Self>,
        response: impl FnMut(&CancelToken, &AgentRequest) -> Result<String, AgentError> + 'static,
    ) -> Rc<Self> {
        self.responses.borrow_mut().push_back(Box::new(response));
        Rc::clone(self)
    }

    pub fn then_output(self: &Rc<Self>, output: impl Into<String>) -> Rc<Self> {
        let output = output.into();
        self.then(move |_, _| Ok(output.clone()))
    }

    pub fn then_error(self: &Rc<Self>, make: fn() -> AgentError) -> Rc<Self> {
        self.then(move |_, _| Err(make()))
    }

    /// Simulate a signal arriving while the agent runs.
    pub fn then_interrupt(self: &Rc<Self>) -> Rc<Self> {
        self.then(|cancel, _| {
            cancel.cancel();
            Err(AgentError::Cancelled)
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn boxed(self: &Rc<Self>) -> Box<dyn AgentRunner> {
        Box::new(Rc::clone(self))
    }
}

impl AgentRunner for Rc<ScriptedRunner> {
    fn execute(&self, cancel: &CancelToken, request: &AgentRequest) -> Result<String, AgentError> {
        self.calls.set(self.calls.get() + 1);
        self.prompts.borrow_mut().push(request.prompt.clone());
        let mut response = self
            .responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("{} runner called more times than scripted", self.name));
        response(cancel, request)
    }
}

/// Probe that reports a fixed set of installed programs.
#[derive(Debug, Clone, Default)]
pub struct FakeAvailability {
    installed: Arc<BTreeSet<String>>,
}

impl FakeAvailability {
    pub fn new(programs: &[&str]) -> Self {
        Self {
            installed: Arc::new(programs.iter().map(|p| (*p).to_string()).collect()),
        }
    }
}

impl Availability for FakeAvailability {
    fn is_installed(&self, program: &str) -> bool {
        self.installed.contains(program)
    }
}

/// Validator reply carrying a `RALPH_VALIDATION` envelope.
pub fn validation_output(verdict: &str, feedback: &str) -> String {
    envelope(
        "RALPH_VALIDATION",
        json!({ "verdict": verdict, "feedback": feedback }),
    )
}

pub fn blocked_output(blocked_count: u32, tasks: &[&str]) -> String {
    envelope(
        "RALPH_VALIDATION",
        json!({
            "verdict": "BLOCKED",
            "feedback": "waiting on credentials",
            "blocked_count": blocked_count,
            "blocked_tasks": tasks,
        }),
    )
}

pub fn cross_output(verdict: &str) -> String {
    let confirmed = verdict == "CONFIRMED";
    let feedback = if confirmed { "" } else { "T2 has no production caller" };
    let discrepancies = if confirmed {
        json!([])
    } else {
        json!([{ "task_id": "T2", "claimed": "wired in", "actual": "dead code" }])
    };
    envelope(
        "RALPH_CROSS_VALIDATION",
        json!({
            "verdict": verdict,
            "tasks_verified": 2,
            "files_actually_read": ["src/lib.rs"],
            "feedback": feedback,
            "discrepancies": discrepancies,
        }),
    )
}

pub fn tasks_validation_output(verdict: &str) -> String {
    let missing = if verdict == "VALID" { json!([]) } else { json!(["export to CSV"]) };
    envelope(
        "RALPH_TASKS_VALIDATION",
        json!({
            "verdict": verdict,
            "feedback": "coverage check",
            "missing_requirements": missing,
            "quality_score": "7/10 - covers the plan",
        }),
    )
}

pub fn final_plan_output(verdict: &str) -> String {
    envelope(
        "RALPH_FINAL_PLAN_VALIDATION",
        json!({ "verdict": verdict, "feedback": "plan review" }),
    )
}

fn envelope(marker: &str, body: serde_json::Value) -> String {
    let wrapped = json!({ marker: body });
    format!("Review finished.\n\n```json\n{wrapped:#}\n```\n")
}

pub const TWO_TASKS: &str = "# Tasks\n\n- [ ] T1 add parser\n- [ ] T2 wire parser into CLI\n";

/// Temporary project with a task list at `tasks.md`.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new(tasks: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("tasks.md"), tasks).expect("write tasks.md");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.root().join("tasks.md")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root().join(".ralph-loop")
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::new(self.state_dir())
    }

    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, content).expect("write file");
        path
    }

    /// Mark every task in `tasks.md` done.
    pub fn check_all(&self) {
        check_all_tasks(&self.tasks_path());
    }
}

/// What a successful implementation agent does to the task list.
pub fn check_all_tasks(path: &Path) {
    let content = fs::read_to_string(path).expect("read task list");
    fs::write(path, content.replace("- [ ]", "- [x]")).expect("write task list");
}

/// Config with no cross-validation and no learnings, so tests script only
/// the two primary agents unless they opt in.
pub fn test_config() -> RunnerConfig {
    RunnerConfig {
        cross_validate: false,
        enable_learnings: false,
        max_retries: 0,
        retry_base_delay_secs: 0,
        ..RunnerConfig::default()
    }
}
