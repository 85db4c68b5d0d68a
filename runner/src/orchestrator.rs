//! The implement → validate → cross-validate loop.
//!
//! An [`Orchestrator`] owns one session. It persists [`SessionState`] at every
//! phase boundary and only after a phase has fully completed, so the state file
//! never reflects a half-applied pass. Agent outputs are written to the
//! iteration directory as they arrive; on resume, outputs already on disk are
//! reused instead of rerunning the phase that produced them.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{Result, bail};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::core::decision::{DecisionInput, Next, decide};
use crate::core::learnings::extract_learnings;
use crate::core::types::{Phase, SessionStatus, Terminal};
use crate::core::verdicts::{
    CrossStatus, CrossValidationVerdict, Envelope, FinalPlanStatus, FinalPlanVerdict,
    TasksStatus, TasksValidationVerdict, ValidationStatus, ValidationVerdict, extract,
};
use crate::io::agent::{AgentError, AgentRequest, AgentRunner};
use crate::io::config::RunnerConfig;
use crate::io::issue::{IssueRef, cached_issue};
use crate::io::iteration_log::{IterationMeta, IterationPaths};
use crate::io::learnings::LearningsFile;
use crate::io::prompt::{ImplementationInputs, PromptEngine};
use crate::io::session_store::{
    CrossValidationState, IterationRecord, LearningsState, PhaseOutcome, SessionState,
    SessionStore, fingerprint_file, timestamp, verify_fingerprint,
};
use crate::io::tasks::{discover_tasks_file, read_task_counts, warn_on_violations};

/// Agent runners for each role. Optional roles are `None` when disabled or
/// when their backend is not installed.
pub struct Runners {
    pub implementation: Box<dyn AgentRunner>,
    pub validation: Box<dyn AgentRunner>,
    pub cross_validation: Option<Box<dyn AgentRunner>>,
    pub tasks_validation: Option<Box<dyn AgentRunner>>,
    pub final_plan: Option<Box<dyn AgentRunner>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub resume: bool,
    /// Resume even when the task file changed since the last save.
    pub force_resume: bool,
}

type Committed = Arc<Mutex<Option<SessionState>>>;

fn lock(committed: &Committed) -> MutexGuard<'_, Option<SessionState>> {
    committed.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writes the last committed state from outside the loop thread.
///
/// Used by signal handlers so an interrupted run is recorded even while the
/// loop is blocked on an agent.
#[derive(Debug, Clone)]
pub struct SessionFlush {
    store: SessionStore,
    committed: Committed,
}

impl SessionFlush {
    /// Persist the committed state as interrupted (or cancelled, when a cancel
    /// request file exists). Returns `false` when nothing was committed yet.
    pub fn flush_interrupted(&self) -> Result<bool> {
        let guard = lock(&self.committed);
        let Some(state) = guard.as_ref() else {
            return Ok(false);
        };
        let mut state = state.clone();
        state.status = interrupted_status(&self.store);
        if let Err(err) = stamp(&mut state) {
            warn!(err = %format!("{err:#}"), "could not fingerprint task file");
        }
        self.store.save(&state)?;
        Ok(true)
    }
}

/// Refresh the timestamp and the task file fingerprint before a save.
///
/// The fingerprint always describes the file as of the last save, so agent
/// edits during the run never count as outside changes on resume.
fn stamp(state: &mut SessionState) -> Result<()> {
    state.touch();
    if !state.tasks_file.as_os_str().is_empty() {
        state.tasks_file_hash = fingerprint_file(&state.tasks_file)?;
    }
    Ok(())
}

fn interrupted_status(store: &SessionStore) -> SessionStatus {
    if store.cancel_requested() {
        SessionStatus::Cancelled
    } else {
        SessionStatus::Interrupted
    }
}

pub struct Orchestrator {
    config: RunnerConfig,
    store: SessionStore,
    runners: Runners,
    prompts: PromptEngine,
    cancel: CancelToken,
    workdir: PathBuf,
    committed: Committed,
}

impl Orchestrator {
    pub fn new(
        config: RunnerConfig,
        store: SessionStore,
        runners: Runners,
        cancel: CancelToken,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            store,
            runners,
            prompts: PromptEngine::new(),
            cancel,
            workdir: workdir.into(),
            committed: Arc::new(Mutex::new(None)),
        }
    }

    pub fn flush_handle(&self) -> SessionFlush {
        SessionFlush {
            store: self.store.clone(),
            committed: Arc::clone(&self.committed),
        }
    }

    /// Run the session to a terminal outcome and record it.
    ///
    /// Cancellation takes precedence over whatever the interrupted phase
    /// would have produced.
    pub fn run(&self, options: RunOptions) -> Terminal {
        let terminal = match self.run_session(options) {
            Ok(terminal) => terminal,
            Err(err) => {
                error!(err = %format!("{err:#}"), "run failed");
                Terminal::Error
            }
        };
        let terminal = if self.cancel.is_cancelled() {
            Terminal::Interrupted
        } else {
            terminal
        };
        if let Err(err) = self.finish(terminal) {
            error!(err = %format!("{err:#}"), "failed to record final session state");
        }
        info!(outcome = terminal.name(), exit_code = terminal.exit_code(), "run finished");
        terminal
    }

    fn run_session(&self, options: RunOptions) -> Result<Terminal> {
        self.store.init()?;
        let mut session = if options.resume {
            self.resume_session(options.force_resume)?
        } else {
            self.fresh_session()?
        };

        let counts = read_task_counts(&session.tasks_file)?;
        info!(
            tasks_file = %session.tasks_file.display(),
            unchecked = counts.unchecked,
            total = counts.total(),
            "task list loaded"
        );
        if counts.unchecked == 0 && !options.resume {
            info!("no unchecked tasks, nothing to do");
            return Ok(Terminal::Success);
        }
        warn_on_violations(&session.tasks_file)?;

        let learnings = if session.learnings.enabled {
            let file = LearningsFile::new(session.learnings.file.clone());
            file.init()?;
            Some(file)
        } else {
            None
        };

        if !session.tasks_validated
            && let Some(terminal) = self.validate_task_list(&mut session)?
        {
            return Ok(terminal);
        }

        while session.iteration < session.max_iterations {
            if self.cancel.is_cancelled() {
                return Ok(Terminal::Interrupted);
            }
            if let Next::Stop(terminal) = self.run_iteration(&mut session, learnings.as_ref())? {
                return Ok(terminal);
            }
        }
        warn!(max_iterations = session.max_iterations, "iteration budget exhausted");
        Ok(Terminal::MaxIterations)
    }

    fn fresh_session(&self) -> Result<SessionState> {
        let tasks_file = discover_tasks_file(&self.workdir, self.config.tasks_file.as_deref())?;
        let hash = fingerprint_file(&tasks_file)?;
        self.store.clear_iterations()?;
        self.store.clear_cancel_request()?;

        let cross = self.config.cross();
        let mut session = SessionState::start(tasks_file, hash);
        session.backend = self.config.backend;
        session.implementation_model = self.config.implementation_model.clone();
        session.validation_model = self.config.validation_model.clone();
        session.max_iterations = self.config.max_iterations;
        session.max_inadmissible = self.config.max_inadmissible;
        session.original_plan_file = self.config.original_plan_file.clone();
        session.github_issue = self.config.github_issue.clone();
        session.learnings = LearningsState {
            enabled: self.config.enable_learnings,
            file: self.config.learnings_path(self.store.dir()),
        };
        session.cross_validation = CrossValidationState {
            enabled: self.config.cross_validate,
            backend: Some(cross.backend),
            model: cross.model,
            available: self.runners.cross_validation.is_some(),
        };
        info!(session_id = %session.session_id, tasks_file = %session.tasks_file.display(), "starting session");
        self.persist(&mut session)?;
        Ok(session)
    }

    fn resume_session(&self, force: bool) -> Result<SessionState> {
        if !self.store.exists() {
            bail!("no session to resume in {}", self.store.dir().display());
        }
        let mut session = self.store.load()?;
        if !session.status.is_resumable() {
            bail!(
                "session {} is {} and cannot be resumed",
                session.session_id,
                session.status
            );
        }
        verify_fingerprint(&mut session, force)?;
        session.status = SessionStatus::InProgress;
        session.max_iterations = self.config.max_iterations;
        session.max_inadmissible = self.config.max_inadmissible;
        session.learnings.enabled = self.config.enable_learnings;
        if session.learnings.file.as_os_str().is_empty() {
            session.learnings.file = self.config.learnings_path(self.store.dir());
        }
        session.cross_validation.available = self.runners.cross_validation.is_some();
        self.store.clear_cancel_request()?;
        info!(
            session_id = %session.session_id,
            iteration = session.iteration,
            phase = %session.phase,
            "resuming session"
        );
        self.persist(&mut session)?;
        Ok(session)
    }

    /// Pre-loop check of the task list against its source plan.
    ///
    /// Returns a terminal outcome when the run must stop.
    fn validate_task_list(&self, session: &mut SessionState) -> Result<Option<Terminal>> {
        let plan = match (&session.original_plan_file, &session.github_issue) {
            (Some(plan), _) => self.resolve(plan),
            (None, Some(issue)) => {
                let issue: IssueRef = issue.parse()?;
                cached_issue(&issue, &self.store.issue_path())?
            }
            (None, None) => return Ok(None),
        };
        if !plan.is_file() {
            bail!("plan file not found: {}", plan.display());
        }
        let paths = IterationPaths::new(self.store.dir().to_path_buf());

        let tasks_valid = match &self.runners.tasks_validation {
            Some(runner) => {
                self.enter_phase(session, Phase::TasksValidation)?;
                let prompt = self.prompts.tasks_validation(&session.tasks_file, &plan)?;
                let Some(output) = self.run_agent(runner.as_ref(), Phase::TasksValidation, prompt, &paths)? else {
                    return Ok(Some(Terminal::Interrupted));
                };
                match parse_envelope::<TasksValidationVerdict>(&output) {
                    Some(verdict) if verdict.status() == TasksStatus::Invalid => {
                        warn!(
                            feedback = %verdict.feedback,
                            missing = ?verdict.missing_requirements,
                            out_of_scope = ?verdict.out_of_scope_tasks,
                            vague = ?verdict.vague_tasks,
                            "task list rejected"
                        );
                        session.verdict = Some(verdict.verdict.clone());
                        session.last_feedback = Some(verdict.feedback.clone());
                        self.persist(session)?;
                        return Ok(Some(Terminal::TasksInvalid));
                    }
                    Some(verdict) if verdict.status() == TasksStatus::Valid => {
                        info!(quality_score = %verdict.quality_score, "task list validated");
                        true
                    }
                    Some(verdict) => {
                        warn!(verdict = %verdict.verdict, "unrecognized tasks validation verdict, proceeding");
                        false
                    }
                    None => {
                        warn!("tasks validation produced no verdict, proceeding");
                        false
                    }
                }
            }
            None => {
                warn!("tasks validation backend unavailable, skipping");
                false
            }
        };

        // Final plan validation only follows a task list that was judged VALID.
        if !tasks_valid && self.runners.final_plan.is_some() {
            warn!("task list not confirmed valid, skipping final plan validation");
        } else if let Some(runner) = &self.runners.final_plan {
            self.enter_phase(session, Phase::FinalPlanValidation)?;
            let prompt = self.prompts.final_plan(&session.tasks_file, &plan)?;
            let Some(output) = self.run_agent(runner.as_ref(), Phase::FinalPlanValidation, prompt, &paths)? else {
                return Ok(Some(Terminal::Interrupted));
            };
            match parse_envelope::<FinalPlanVerdict>(&output) {
                Some(verdict) if verdict.status() == FinalPlanStatus::NotImplemented => {
                    warn!(feedback = %verdict.feedback, "plan rejected by final plan validation");
                    session.verdict = Some(verdict.verdict.clone());
                    session.last_feedback = Some(verdict.feedback.clone());
                    self.persist(session)?;
                    return Ok(Some(Terminal::TasksInvalid));
                }
                Some(verdict) if verdict.status() == FinalPlanStatus::Confirmed => {
                    info!("plan confirmed");
                }
                Some(verdict) => {
                    warn!(verdict = %verdict.verdict, "unrecognized final plan verdict, proceeding");
                }
                None => warn!("final plan validation produced no verdict, proceeding"),
            }
        }

        session.tasks_validated = true;
        session.phase = Phase::Implementation;
        self.persist(session)?;
        Ok(None)
    }

    /// One implementation → validation (→ cross-validation) → decision pass.
    fn run_iteration(&self, session: &mut SessionState, learnings: Option<&LearningsFile>) -> Result<Next> {
        let index = session.iteration + 1;
        let started = Instant::now();
        let started_at = timestamp();
        let paths = IterationPaths::new(self.store.iteration_dir(index));
        let mut outcomes = Vec::new();
        info!(iteration = index, max_iterations = session.max_iterations, "starting iteration");

        let implementation = match paths.completed_output(Phase::Implementation)? {
            Some(output) => {
                info!(iteration = index, "reusing implementation output from interrupted run");
                output
            }
            None => {
                self.enter_phase(session, Phase::Implementation)?;
                let learned = learnings.map(LearningsFile::read).transpose()?;
                let prompt = self.prompts.implementation(
                    &session.tasks_file,
                    &ImplementationInputs {
                        iteration: index,
                        feedback: session.last_feedback.as_deref(),
                        learnings_file: learnings.map(LearningsFile::path),
                        learnings: learned.as_deref(),
                    },
                )?;
                let Some(output) = self.run_agent(self.runners.implementation.as_ref(), Phase::Implementation, prompt, &paths)? else {
                    return Ok(Next::Stop(Terminal::Interrupted));
                };
                if let Some(file) = learnings {
                    let learned = extract_learnings(&output);
                    if !learned.is_empty() {
                        file.append(index, &learned)?;
                    }
                }
                output
            }
        };
        outcomes.push(PhaseOutcome {
            phase: Phase::Implementation,
            summary: format!("{} bytes of output", implementation.len()),
        });

        let validation_output = match paths.completed_output(Phase::Validation)? {
            Some(output) => output,
            None => {
                self.enter_phase(session, Phase::Validation)?;
                let prompt = self.prompts.validation(
                    &session.tasks_file,
                    index,
                    &paths.output_path(Phase::Implementation),
                )?;
                let Some(output) = self.run_agent(self.runners.validation.as_ref(), Phase::Validation, prompt, &paths)? else {
                    return Ok(Next::Stop(Terminal::Interrupted));
                };
                output
            }
        };
        let verdict = parse_envelope::<ValidationVerdict>(&validation_output);
        outcomes.push(PhaseOutcome {
            phase: Phase::Validation,
            summary: verdict_summary(verdict.as_ref().map(|v| v.verdict.as_str())),
        });

        let remaining = read_task_counts(&session.tasks_file)?.unchecked;
        let blocked = verdict.as_ref().map_or(0, |v| v.blocked_count);
        let mut status = verdict.as_ref().map(ValidationVerdict::status);
        let mut feedback = verdict
            .as_ref()
            .map(|v| v.feedback.clone())
            .unwrap_or_default();

        let preliminary = decide(&DecisionInput {
            status,
            feedback: &feedback,
            remaining,
            blocked,
            inadmissible_count: session.inadmissible_count,
            max_inadmissible: session.max_inadmissible,
        });

        let mut cross_verdict = None;
        let mut discrepancies = Vec::new();
        if preliminary.next == Next::Stop(Terminal::Success)
            && let Some(runner) = &self.runners.cross_validation
        {
            let output = match paths.completed_output(Phase::CrossValidation)? {
                Some(output) => output,
                None => {
                    self.enter_phase(session, Phase::CrossValidation)?;
                    let prompt = self.prompts.cross_validation(
                        &session.tasks_file,
                        &paths.output_path(Phase::Implementation),
                        &paths.output_path(Phase::Validation),
                    )?;
                    let Some(output) = self.run_agent(runner.as_ref(), Phase::CrossValidation, prompt, &paths)? else {
                        return Ok(Next::Stop(Terminal::Interrupted));
                    };
                    output
                }
            };
            let cross = parse_envelope::<CrossValidationVerdict>(&output);
            match cross.as_ref().map(CrossValidationVerdict::status) {
                Some(CrossStatus::Confirmed) => info!(iteration = index, "cross-validation confirmed approval"),
                _ => {
                    warn!(
                        iteration = index,
                        verdict = ?cross.as_ref().map(|c| c.verdict.as_str()),
                        "cross-validation did not confirm approval"
                    );
                    status = Some(ValidationStatus::Rejected);
                    feedback = cross.as_ref().map_or_else(
                        || "Cross-validation did not confirm the approval. Re-check every task against the code.".to_string(),
                        CrossValidationVerdict::rejection_feedback,
                    );
                }
            }
            outcomes.push(PhaseOutcome {
                phase: Phase::CrossValidation,
                summary: verdict_summary(cross.as_ref().map(|c| c.verdict.as_str())),
            });
            if let Some(cross) = cross {
                if cross.status() != CrossStatus::Confirmed {
                    discrepancies = cross.discrepancies;
                }
                cross_verdict = Some(cross.verdict);
            }
        }

        let decision = decide(&DecisionInput {
            status,
            feedback: &feedback,
            remaining,
            blocked,
            inadmissible_count: session.inadmissible_count,
            max_inadmissible: session.max_inadmissible,
        });
        let decision_name = match &decision.next {
            Next::Continue => "continue",
            Next::Stop(terminal) => terminal.name(),
        };
        info!(
            iteration = index,
            verdict = ?verdict.as_ref().map(|v| v.verdict.as_str()),
            decision = decision_name,
            remaining,
            inadmissible = decision.inadmissible_count,
            "iteration decided"
        );

        session.iteration = index;
        session.inadmissible_count = decision.inadmissible_count;
        session.verdict = verdict.as_ref().map(|v| v.verdict.clone());
        session.last_feedback = (!decision.feedback.is_empty()).then(|| decision.feedback.clone());
        session.phase = match decision.next {
            Next::Continue => Phase::Implementation,
            Next::Stop(_) => Phase::Decision,
        };
        session.history.push(IterationRecord {
            index,
            finished_at: timestamp(),
            outcomes,
            verdict: session.verdict.clone(),
            cross_verdict: cross_verdict.clone(),
            discrepancies,
            decision: decision_name.to_string(),
            inadmissible_count: decision.inadmissible_count,
        });
        self.persist(session)?;

        paths.write_meta(&IterationMeta {
            session_id: session.session_id.clone(),
            iteration: index,
            verdict: session.verdict.clone(),
            cross_verdict,
            decision: decision_name.to_string(),
            remaining_tasks: remaining,
            inadmissible_count: decision.inadmissible_count,
            started_at: Some(started_at),
            ended_at: Some(timestamp()),
            duration_ms: Some(started.elapsed().as_millis() as u64),
        })?;
        Ok(decision.next)
    }

    /// Run one agent and store its output. `Ok(None)` means the run was cancelled.
    fn run_agent(
        &self,
        runner: &dyn AgentRunner,
        phase: Phase,
        prompt: String,
        paths: &IterationPaths,
    ) -> Result<Option<String>> {
        let request = AgentRequest {
            prompt,
            stream_path: Some(paths.stream_path(phase)),
        };
        info!(%phase, "running agent");
        let started = Instant::now();
        match runner.execute(&self.cancel, &request) {
            Ok(output) => {
                let path = paths.write_output(phase, &output)?;
                debug!(
                    %phase,
                    bytes = output.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    path = %path.display(),
                    "agent finished"
                );
                Ok(Some(output))
            }
            Err(AgentError::Cancelled) => {
                warn!(%phase, "agent run interrupted");
                Ok(None)
            }
            Err(err) => Err(anyhow::Error::new(err).context(format!("{phase} agent failed"))),
        }
    }

    fn enter_phase(&self, session: &mut SessionState, phase: Phase) -> Result<()> {
        session.phase = phase;
        self.persist(session)
    }

    fn persist(&self, session: &mut SessionState) -> Result<()> {
        let mut guard = lock(&self.committed);
        stamp(session)?;
        self.store.save(session)?;
        *guard = Some(session.clone());
        Ok(())
    }

    fn finish(&self, terminal: Terminal) -> Result<()> {
        {
            let mut guard = lock(&self.committed);
            if let Some(state) = guard.as_mut() {
                state.status = match terminal {
                    Terminal::Interrupted => interrupted_status(&self.store),
                    other => other.session_status(),
                };
                if let Err(err) = stamp(state) {
                    warn!(err = %format!("{err:#}"), "could not fingerprint task file");
                }
                self.store.save(state)?;
            }
        }
        self.store.clear_cancel_request()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }
}

/// Locate an envelope, treating malformed JSON like a missing verdict.
fn parse_envelope<E: Envelope>(output: &str) -> Option<E> {
    match extract::<E>(output) {
        Ok(Some(envelope)) => Some(envelope),
        Ok(None) => {
            warn!(marker = E::MARKER, "no verdict envelope in agent output");
            None
        }
        Err(err) => {
            warn!(marker = E::MARKER, err = %err, "malformed verdict envelope");
            None
        }
    }
}

fn verdict_summary(verdict: Option<&str>) -> String {
    match verdict {
        Some(verdict) if !verdict.is_empty() => format!("verdict {verdict}"),
        Some(_) => "verdict envelope without verdict".to_string(),
        None => "no verdict".to_string(),
    }
}
