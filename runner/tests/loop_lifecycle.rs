//! Loop-level tests for terminal outcomes.
//!
//! Each test scripts the agents, drives `Orchestrator::run` to completion and
//! checks the exit outcome together with the persisted session state.

use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use ralph_loop::cancel::CancelToken;
use ralph_loop::core::types::{Phase, SessionStatus, Terminal};
use ralph_loop::io::agent::AgentError;
use ralph_loop::io::config::RunnerConfig;
use ralph_loop::orchestrator::{Orchestrator, RunOptions, Runners};
use ralph_loop::test_support::{
    ScriptedRunner, TWO_TASKS, Workspace, blocked_output, check_all_tasks, cross_output,
    final_plan_output, tasks_validation_output, test_config, validation_output,
};

fn runners(implementation: &Rc<ScriptedRunner>, validation: &Rc<ScriptedRunner>) -> Runners {
    Runners {
        implementation: implementation.boxed(),
        validation: validation.boxed(),
        cross_validation: None,
        tasks_validation: None,
        final_plan: None,
    }
}

fn run(ws: &Workspace, cfg: RunnerConfig, runners: Runners) -> Terminal {
    Orchestrator::new(cfg, ws.store(), runners, CancelToken::new(), ws.root()).run(RunOptions::default())
}

/// Implementation agent that checks off every task.
fn finishing(ws: &Workspace, runner: &Rc<ScriptedRunner>) {
    let tasks = ws.tasks_path();
    runner.then(move |_, _| {
        check_all_tasks(&tasks);
        Ok("Implemented T1 and T2.".to_string())
    });
}

/// Happy path: one pass checks off every task and the validator approves.
#[test]
fn approved_pass_with_all_tasks_checked_succeeds() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation");
    finishing(&ws, &implementation);
    let validation = ScriptedRunner::new("validation").then_output(validation_output("APPROVED", ""));

    let terminal = run(&ws, test_config(), runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::Success);
    assert_eq!(terminal.exit_code(), 0);
    let state = ws.store().load().expect("state");
    assert_eq!(state.status, SessionStatus::Complete);
    assert_eq!(state.iteration, 1);
    assert_eq!(state.phase, Phase::Decision);
    assert_eq!(state.verdict.as_deref(), Some("APPROVED"));

    let iteration = ws.state_dir().join("iteration-001");
    assert!(iteration.join("implementation-output.txt").is_file());
    assert!(iteration.join("validation-output.txt").is_file());
    let meta = fs::read_to_string(iteration.join("meta.json")).expect("meta");
    assert!(meta.contains("\"decision\": \"SUCCESS\""));
}

/// A task list with nothing unchecked finishes without running any agent.
#[test]
fn nothing_to_do_succeeds_without_agents() {
    let ws = Workspace::new("# Tasks\n\n- [x] T1 done already\n");
    let implementation = ScriptedRunner::new("implementation");
    let validation = ScriptedRunner::new("validation");

    let terminal = run(&ws, test_config(), runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::Success);
    assert_eq!(implementation.calls(), 0);
    assert_eq!(validation.calls(), 0);
}

/// Five consecutive rejections exhaust the inadmissible budget (exit 6), and
/// each rejection's feedback reaches the next implementation prompt.
#[test]
fn repeated_rejections_stop_as_inadmissible() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation");
    let validation = ScriptedRunner::new("validation");
    for pass in 1..=5 {
        implementation.then_output(format!("pass {pass}: stubbed T1"));
        validation.then_output(validation_output("REJECTED", &format!("T1 is still a stub (pass {pass})")));
    }

    let terminal = run(&ws, test_config(), runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::Inadmissible);
    assert_eq!(terminal.exit_code(), 6);
    let state = ws.store().load().expect("state");
    assert_eq!(state.status, SessionStatus::Inadmissible);
    assert_eq!(state.inadmissible_count, 5);
    assert_eq!(state.iteration, 5);
    assert_eq!(state.history.len(), 5);

    let prompts = implementation.prompts();
    assert!(!prompts[0].contains("T1 is still a stub"));
    assert!(prompts[1].contains("T1 is still a stub (pass 1)"));
    assert!(prompts[4].contains("T1 is still a stub (pass 4)"));
}

/// Replies without an envelope count against the inadmissible budget.
#[test]
fn missing_verdicts_count_as_inadmissible() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation")
        .then_output("worked")
        .then_output("worked more");
    let validation = ScriptedRunner::new("validation")
        .then_output("Looks fine to me.")
        .then_output("RALPH_VALIDATION: {\"verdict\": ");
    let cfg = RunnerConfig {
        max_inadmissible: 2,
        ..test_config()
    };

    let terminal = run(&ws, cfg, runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::Inadmissible);
    assert_eq!(ws.store().load().expect("state").inadmissible_count, 2);
}

/// The iteration budget ends a run that keeps needing more work (exit 2).
#[test]
fn iteration_budget_is_enforced() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation");
    let validation = ScriptedRunner::new("validation");
    for _ in 0..3 {
        implementation.then_output("partial progress");
        validation.then_output(validation_output("NEEDS_MORE_WORK", "T2 not started"));
    }
    let cfg = RunnerConfig {
        max_iterations: 3,
        ..test_config()
    };

    let terminal = run(&ws, cfg, runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::MaxIterations);
    assert_eq!(terminal.exit_code(), 2);
    let state = ws.store().load().expect("state");
    assert_eq!(state.status, SessionStatus::MaxIterations);
    assert_eq!(state.iteration, 3);
    assert_eq!(state.inadmissible_count, 0);
}

/// Approval while boxes remain unchecked keeps the loop going with a reminder.
#[test]
fn approval_with_unchecked_tasks_continues() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation").then_output("did T1 but forgot the boxes");
    finishing(&ws, &implementation);
    let validation = ScriptedRunner::new("validation")
        .then_output(validation_output("APPROVED", ""))
        .then_output(validation_output("APPROVED", ""));

    let terminal = run(&ws, test_config(), runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::Success);
    assert_eq!(implementation.calls(), 2);
    assert!(implementation.prompts()[1].contains("2 tasks remain unchecked"));
}

/// ESCALATE stops immediately with exit 3.
#[test]
fn escalation_stops_the_loop() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation").then_output("tried");
    let validation = ScriptedRunner::new("validation")
        .then_output(validation_output("ESCALATE", "requirements contradict each other"));

    let terminal = run(&ws, test_config(), runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::Escalate);
    assert_eq!(terminal.exit_code(), 3);
    let state = ws.store().load().expect("state");
    assert_eq!(state.status, SessionStatus::Escalated);
    assert_eq!(
        state.last_feedback.as_deref(),
        Some("requirements contradict each other")
    );
}

/// When every remaining task is blocked the run stops with exit 4.
#[test]
fn all_remaining_tasks_blocked_stops() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation").then_output("cannot reach the API");
    let validation = ScriptedRunner::new("validation").then_output(blocked_output(2, &["T1", "T2"]));

    let terminal = run(&ws, test_config(), runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::Blocked);
    assert_eq!(terminal.exit_code(), 4);
    assert_eq!(ws.store().load().expect("state").status, SessionStatus::Blocked);
}

/// Blocked tasks alongside doable ones keep the loop running.
#[test]
fn partially_blocked_list_continues() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation").then_output("T1 blocked");
    finishing(&ws, &implementation);
    let validation = ScriptedRunner::new("validation")
        .then_output(blocked_output(1, &["T1"]))
        .then_output(validation_output("APPROVED", ""));

    let terminal = run(&ws, test_config(), runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::Success);
    assert_eq!(implementation.calls(), 2);
}

/// A cross-validation rejection overrides the approval and its discrepancies
/// become the next pass's feedback.
#[test]
fn cross_validation_rejection_overrides_approval() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation");
    finishing(&ws, &implementation);
    implementation.then_output("wired T2 into the CLI");
    let validation = ScriptedRunner::new("validation")
        .then_output(validation_output("APPROVED", ""))
        .then_output(validation_output("APPROVED", ""));
    let cross = ScriptedRunner::new("cross")
        .then_output(cross_output("REJECTED"))
        .then_output(cross_output("CONFIRMED"));
    let mut runners = runners(&implementation, &validation);
    runners.cross_validation = Some(cross.boxed());

    let terminal = run(&ws, test_config(), runners);

    assert_eq!(terminal, Terminal::Success);
    assert_eq!(cross.calls(), 2);
    let second_prompt = &implementation.prompts()[1];
    assert!(second_prompt.contains("T2 has no production caller"));
    assert!(second_prompt.contains("- T2: claimed wired in; actual dead code"));

    let state = ws.store().load().expect("state");
    assert_eq!(state.inadmissible_count, 1);
    assert_eq!(state.history[0].cross_verdict.as_deref(), Some("REJECTED"));
    assert_eq!(state.history[0].discrepancies.len(), 1);
    assert_eq!(state.history[0].discrepancies[0].task_id, "T2");
    assert_eq!(state.history[0].discrepancies[0].actual, "dead code");
    assert_eq!(state.history[1].cross_verdict.as_deref(), Some("CONFIRMED"));
    assert!(state.history[1].discrepancies.is_empty());
}

/// Cross-validation only runs once the primary validator would accept.
#[test]
fn cross_validation_skipped_until_approval() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation").then_output("partial");
    let validation = ScriptedRunner::new("validation").then_output(validation_output("NEEDS_MORE_WORK", "T2"));
    let cross = ScriptedRunner::new("cross");
    let mut runners = runners(&implementation, &validation);
    runners.cross_validation = Some(cross.boxed());
    let cfg = RunnerConfig {
        max_iterations: 1,
        ..test_config()
    };

    assert_eq!(run(&ws, cfg, runners), Terminal::MaxIterations);
    assert_eq!(cross.calls(), 0);
}

/// An INVALID task list stops the run before implementation (exit 5).
#[test]
fn invalid_task_list_stops_before_implementation() {
    let ws = Workspace::new(TWO_TASKS);
    ws.write("plan.md", "# Plan\n\nParser, CLI wiring and CSV export.\n");
    let implementation = ScriptedRunner::new("implementation");
    let validation = ScriptedRunner::new("validation");
    let tasks_validation = ScriptedRunner::new("tasks").then_output(tasks_validation_output("INVALID"));
    let mut runners = runners(&implementation, &validation);
    runners.tasks_validation = Some(tasks_validation.boxed());
    let cfg = RunnerConfig {
        original_plan_file: Some(PathBuf::from("plan.md")),
        ..test_config()
    };

    let terminal = run(&ws, cfg, runners);

    assert_eq!(terminal, Terminal::TasksInvalid);
    assert_eq!(terminal.exit_code(), 5);
    assert_eq!(implementation.calls(), 0);
    assert!(tasks_validation.prompts()[0].contains("plan.md"));
    assert!(ws.state_dir().join("tasks-validation-output.txt").is_file());
    let state = ws.store().load().expect("state");
    assert_eq!(state.status, SessionStatus::TasksInvalid);
    assert!(!state.tasks_validated);
}

/// A rejected plan check also maps to exit 5.
#[test]
fn rejected_plan_check_stops_before_implementation() {
    let ws = Workspace::new(TWO_TASKS);
    ws.write("plan.md", "# Plan\n");
    let implementation = ScriptedRunner::new("implementation");
    let validation = ScriptedRunner::new("validation");
    let mut runners = runners(&implementation, &validation);
    runners.tasks_validation = Some(
        ScriptedRunner::new("tasks")
            .then_output(tasks_validation_output("VALID"))
            .boxed(),
    );
    runners.final_plan = Some(ScriptedRunner::new("final").then_output(final_plan_output("REJECT")).boxed());
    let cfg = RunnerConfig {
        original_plan_file: Some(PathBuf::from("plan.md")),
        ..test_config()
    };

    assert_eq!(run(&ws, cfg, runners), Terminal::TasksInvalid);
    assert_eq!(implementation.calls(), 0);
}

/// Passing pre-loop checks are recorded and the loop proceeds.
#[test]
fn validated_task_list_proceeds_to_loop() {
    let ws = Workspace::new(TWO_TASKS);
    ws.write("plan.md", "# Plan\n");
    let implementation = ScriptedRunner::new("implementation");
    finishing(&ws, &implementation);
    let validation = ScriptedRunner::new("validation").then_output(validation_output("COMPLETE", ""));
    let mut runners = runners(&implementation, &validation);
    runners.tasks_validation = Some(
        ScriptedRunner::new("tasks")
            .then_output(tasks_validation_output("VALID"))
            .boxed(),
    );
    runners.final_plan = Some(ScriptedRunner::new("final").then_output(final_plan_output("APPROVE")).boxed());
    let cfg = RunnerConfig {
        original_plan_file: Some(PathBuf::from("plan.md")),
        ..test_config()
    };

    assert_eq!(run(&ws, cfg, runners), Terminal::Success);
    assert!(ws.store().load().expect("state").tasks_validated);
}

/// Without a VALID task list verdict the plan check is skipped and the loop
/// still runs.
#[test]
fn plan_check_requires_valid_task_list() {
    let ws = Workspace::new(TWO_TASKS);
    ws.write("plan.md", "# Plan\n");
    let implementation = ScriptedRunner::new("implementation");
    finishing(&ws, &implementation);
    let validation = ScriptedRunner::new("validation").then_output(validation_output("APPROVED", ""));
    let final_plan = ScriptedRunner::new("final");
    let mut runners = runners(&implementation, &validation);
    runners.tasks_validation = Some(
        ScriptedRunner::new("tasks")
            .then_output("Reviewed the list, looks mostly fine.")
            .boxed(),
    );
    runners.final_plan = Some(final_plan.boxed());
    let cfg = RunnerConfig {
        original_plan_file: Some(PathBuf::from("plan.md")),
        ..test_config()
    };

    assert_eq!(run(&ws, cfg, runners), Terminal::Success);
    assert_eq!(final_plan.calls(), 0);
    assert!(!ws.state_dir().join("final-plan-validation-output.txt").exists());
}

/// Learnings reported by the implementation agent are appended to the file
/// and fed into the next implementation prompt.
#[test]
fn learnings_are_collected_between_iterations() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation = ScriptedRunner::new("implementation")
        .then_output("Did T1.\n\nRALPH_LEARNINGS:\n- run the parser tests with --release\n")
        .then_output("Started T2.");
    let validation = ScriptedRunner::new("validation")
        .then_output(validation_output("NEEDS_MORE_WORK", "T2"))
        .then_output(validation_output("NEEDS_MORE_WORK", "T2"));
    let cfg = RunnerConfig {
        enable_learnings: true,
        max_iterations: 2,
        ..test_config()
    };

    assert_eq!(run(&ws, cfg, runners(&implementation, &validation)), Terminal::MaxIterations);

    let learnings = fs::read_to_string(ws.state_dir().join("learnings.md")).expect("learnings");
    assert!(learnings.contains("## Iteration 1 ("));
    assert!(learnings.contains("- run the parser tests with --release"));
    let prompts = implementation.prompts();
    assert!(prompts[0].contains("learnings.md"));
    assert!(!prompts[0].contains("run the parser tests"));
    assert!(prompts[1].contains("- run the parser tests with --release"));
}

/// A non-retryable agent failure ends the run with exit 1 and FAILED state.
#[test]
fn agent_failure_is_fatal() {
    let ws = Workspace::new(TWO_TASKS);
    let implementation =
        ScriptedRunner::new("implementation").then_error(|| AgentError::Config("bad model".to_string()));
    let validation = ScriptedRunner::new("validation");

    let terminal = run(&ws, test_config(), runners(&implementation, &validation));

    assert_eq!(terminal, Terminal::Error);
    assert_eq!(terminal.exit_code(), 1);
    assert_eq!(ws.store().load().expect("state").status, SessionStatus::Failed);
    assert_eq!(validation.calls(), 0);
}
