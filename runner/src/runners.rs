//! Builds the agent runner for each role from config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::core::backend::Backend;
use crate::io::agent::{AgentRunner, CliAgent};
use crate::io::availability::{Availability, check_availability};
use crate::io::config::{AgentChoice, RunnerConfig};
use crate::io::resilient::ResilientRunner;
use crate::orchestrator::Runners;

/// Wrap a CLI agent for `choice` in retries.
fn build<A>(cfg: &RunnerConfig, choice: &AgentChoice, workdir: &Path, probe: &A) -> Box<dyn AgentRunner>
where
    A: Availability + Clone + 'static,
{
    let mut spec = cfg.invocation(choice);
    spec.workdir = Some(workdir.to_path_buf());
    Box::new(
        ResilientRunner::new(CliAgent::new(spec), choice.backend.program(), cfg.retry_policy())
            .with_probe(probe.clone()),
    )
}

fn optional<A>(
    cfg: &RunnerConfig,
    role: &str,
    choice: &AgentChoice,
    workdir: &Path,
    installed: &BTreeMap<String, bool>,
    probe: &A,
) -> Option<Box<dyn AgentRunner>>
where
    A: Availability + Clone + 'static,
{
    if is_installed(installed, choice.backend) {
        info!(role, backend = %choice.backend, model = %choice.model, "agent enabled");
        Some(build(cfg, choice, workdir, probe))
    } else {
        warn!(role, backend = %choice.backend, "backend not installed, role disabled");
        None
    }
}

fn is_installed(installed: &BTreeMap<String, bool>, backend: Backend) -> bool {
    installed.get(backend.program()).copied().unwrap_or(false)
}

/// Runners for every role the config enables.
///
/// The primary backend must be installed. Optional roles whose backend is
/// missing are left out and the loop runs without them.
pub fn build_runners<A>(cfg: &RunnerConfig, workdir: impl Into<PathBuf>, probe: &A) -> Result<Runners>
where
    A: Availability + Clone + 'static,
{
    let workdir = workdir.into();
    let installed = check_availability(probe, &[Backend::Claude.program(), Backend::Codex.program()]);
    debug!(?installed, "backend availability");
    let primary = cfg.backend;
    if !is_installed(&installed, primary) {
        bail!("{} is not installed or not on PATH", primary.program());
    }

    let implementation = cfg.implementation();
    let validation = cfg.validation();
    info!(
        backend = %primary,
        implementation_model = %implementation.model,
        validation_model = %validation.model,
        "primary agents"
    );

    let cross_validation = if cfg.cross_validate {
        optional(cfg, "cross_validation", &cfg.cross(), &workdir, &installed, probe)
    } else {
        None
    };
    let final_plan = if cfg.cross_validate || cfg.final_plan_backend.is_some() {
        optional(cfg, "final_plan_validation", &cfg.final_plan(), &workdir, &installed, probe)
    } else {
        None
    };
    let tasks_validation = if cfg.original_plan_file.is_some() || cfg.github_issue.is_some() {
        optional(cfg, "tasks_validation", &cfg.tasks_validation(), &workdir, &installed, probe)
    } else {
        None
    };

    Ok(Runners {
        implementation: build(cfg, &implementation, &workdir, probe),
        validation: build(cfg, &validation, &workdir, probe),
        cross_validation,
        tasks_validation,
        final_plan,
    })
}
