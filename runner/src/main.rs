//! `ralph-loop` command line.
//!
//! Runs the implement/validate loop over a markdown task list and reports the
//! outcome through the process exit code.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::error;

use ralph_loop::cancel::CancelToken;
use ralph_loop::core::backend::Backend;
use ralph_loop::core::types::Terminal;
use ralph_loop::exit_codes;
use ralph_loop::interrupt::{CANCEL_POLL, Interrupts};
use ralph_loop::io::availability::PathLookup;
use ralph_loop::io::config::{CONFIG_FILE, DEFAULT_STATE_DIR, RunnerConfig, load_config};
use ralph_loop::io::session_store::{SessionState, SessionStore, format_status};
use ralph_loop::logging;
use ralph_loop::orchestrator::{Orchestrator, RunOptions};
use ralph_loop::runners::build_runners;

#[derive(Parser)]
#[command(
    name = "ralph-loop",
    version,
    about = "Drive an AI coding agent through a task list with independent validation"
)]
struct Cli {
    /// Directory holding session state and iteration artifacts.
    #[arg(long, global = true, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,
    /// Config file. Defaults to `<state-dir>/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session, or resume the saved one.
    Run(RunArgs),
    /// Print the saved session.
    Status,
    /// Ask a running loop to stop after saving its state.
    Cancel,
    /// Delete the state directory.
    Clean,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Continue the saved session.
    #[arg(long, conflicts_with = "clean")]
    resume: bool,
    /// Continue even if the task file changed since the last save.
    #[arg(long, conflicts_with = "clean")]
    resume_force: bool,
    /// Delete existing state before starting.
    #[arg(long)]
    clean: bool,

    #[arg(long)]
    backend: Option<Backend>,
    #[arg(long)]
    implementation_model: Option<String>,
    #[arg(long)]
    validation_model: Option<String>,
    /// Accept completion on the primary validator's word alone.
    #[arg(long)]
    no_cross_validate: bool,
    #[arg(long)]
    cross_backend: Option<Backend>,
    #[arg(long)]
    cross_model: Option<String>,
    #[arg(long)]
    final_plan_backend: Option<Backend>,
    #[arg(long)]
    final_plan_model: Option<String>,
    #[arg(long)]
    tasks_validation_backend: Option<Backend>,
    #[arg(long)]
    tasks_validation_model: Option<String>,

    #[arg(long)]
    max_iterations: Option<u32>,
    /// Consecutive non-admissible passes tolerated before giving up.
    #[arg(long)]
    max_inadmissible: Option<u32>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    max_turns: Option<u32>,
    /// Seconds without agent output before the agent is killed.
    #[arg(long, value_name = "SECS")]
    inactivity_timeout: Option<u64>,

    /// Task list. Discovered under the working directory when omitted.
    #[arg(long)]
    tasks_file: Option<PathBuf>,
    /// Plan the task list is checked against before the loop starts.
    #[arg(long, conflicts_with = "github_issue")]
    original_plan_file: Option<PathBuf>,
    /// Issue used as the plan, as `owner/repo#number`.
    #[arg(long)]
    github_issue: Option<String>,
    #[arg(long)]
    no_learnings: bool,
    /// Stream agent output at info level.
    #[arg(short, long)]
    verbose: bool,
}

impl RunArgs {
    fn apply(&self, cfg: &mut RunnerConfig) {
        if let Some(backend) = self.backend {
            // Switching backends invalidates models picked for the old one.
            if backend != cfg.backend {
                cfg.implementation_model = backend.default_model().to_string();
                cfg.validation_model = backend.default_model().to_string();
            }
            cfg.backend = backend;
        }
        set(&mut cfg.implementation_model, self.implementation_model.clone());
        set(&mut cfg.validation_model, self.validation_model.clone());
        if self.no_cross_validate {
            cfg.cross_validate = false;
        }
        set_opt(&mut cfg.cross_backend, self.cross_backend);
        set_opt(&mut cfg.cross_model, self.cross_model.clone());
        set_opt(&mut cfg.final_plan_backend, self.final_plan_backend);
        set_opt(&mut cfg.final_plan_model, self.final_plan_model.clone());
        set_opt(&mut cfg.tasks_validation_backend, self.tasks_validation_backend);
        set_opt(&mut cfg.tasks_validation_model, self.tasks_validation_model.clone());
        set(&mut cfg.max_iterations, self.max_iterations);
        set(&mut cfg.max_inadmissible, self.max_inadmissible);
        set(&mut cfg.max_retries, self.max_retries);
        set(&mut cfg.max_turns, self.max_turns);
        set(&mut cfg.inactivity_timeout_secs, self.inactivity_timeout);
        set_opt(&mut cfg.tasks_file, self.tasks_file.clone());
        if let Some(plan) = &self.original_plan_file {
            cfg.original_plan_file = Some(plan.clone());
            cfg.github_issue = None;
        }
        if let Some(issue) = &self.github_issue {
            cfg.github_issue = Some(issue.clone());
            cfg.original_plan_file = None;
        }
        if self.no_learnings {
            cfg.enable_learnings = false;
        }
        if self.verbose {
            cfg.verbose = true;
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn set_opt<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Settings a resumed run inherits from the saved session.
fn restore_from_session(cfg: &mut RunnerConfig, session: &SessionState) {
    cfg.backend = session.backend;
    cfg.implementation_model = session.implementation_model.clone();
    cfg.validation_model = session.validation_model.clone();
    cfg.max_iterations = session.max_iterations;
    cfg.max_inadmissible = session.max_inadmissible;
    cfg.tasks_file = Some(session.tasks_file.clone());
    cfg.original_plan_file = session.original_plan_file.clone();
    cfg.github_issue = session.github_issue.clone();
    cfg.enable_learnings = session.learnings.enabled;
    cfg.cross_validate = session.cross_validation.enabled;
    if let Some(backend) = session.cross_validation.backend {
        cfg.cross_backend = Some(backend);
    }
    if !session.cross_validation.model.is_empty() {
        cfg.cross_model = Some(session.cross_validation.model.clone());
    }
}

fn main() {
    let cli = Cli::parse();
    let verbose = matches!(&cli.command, Command::Run(args) if args.verbose);
    logging::init(verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let store = SessionStore::new(&cli.state_dir);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.state_dir.join(CONFIG_FILE));
    match cli.command {
        Command::Run(args) => cmd_run(store, &config_path, &args).map(Terminal::exit_code),
        Command::Status => cmd_status(&store),
        Command::Cancel => cmd_cancel(&store),
        Command::Clean => cmd_clean(&store),
    }
}

fn cmd_run(store: SessionStore, config_path: &Path, args: &RunArgs) -> Result<Terminal> {
    let workdir = std::env::current_dir().context("resolve working directory")?;
    if args.clean {
        store.clean()?;
    }

    let mut cfg = load_config(config_path)?;
    let resume = args.resume || args.resume_force;
    if resume && store.exists() {
        let session = store.load()?;
        restore_from_session(&mut cfg, &session);
    }
    args.apply(&mut cfg);
    cfg.validate().context("invalid run options")?;

    let runners = build_runners(&cfg, &workdir, &PathLookup)?;

    store.init()?;
    // A request left over from a finished run must not stop this one.
    store.clear_cancel_request()?;

    let cancel = CancelToken::new();
    let interrupts = Interrupts::new(cancel.clone());
    let orchestrator = Orchestrator::new(cfg, store.clone(), runners, cancel, workdir);
    let flush = orchestrator.flush_handle();
    interrupts.set_flush_hook(move || match flush.flush_interrupted() {
        Ok(_) => {}
        Err(err) => error!(err = %format!("{err:#}"), "failed to save state on interrupt"),
    });
    interrupts.install_signal_handler()?;
    let _watcher = interrupts.watch_cancel_requests(store, CANCEL_POLL);

    Ok(orchestrator.run(RunOptions {
        resume,
        force_resume: args.resume_force,
    }))
}

fn cmd_status(store: &SessionStore) -> Result<i32> {
    if !store.exists() {
        println!("No session in {}", store.dir().display());
        return Ok(exit_codes::SUCCESS);
    }
    let state = store.load()?;
    print!("{}", format_status(&state));
    Ok(exit_codes::SUCCESS)
}

fn cmd_cancel(store: &SessionStore) -> Result<i32> {
    if !store.exists() {
        bail!("no session in {}", store.dir().display());
    }
    store.request_cancel()?;
    println!("Cancel requested; the running loop will stop and save its state.");
    Ok(exit_codes::SUCCESS)
}

fn cmd_clean(store: &SessionStore) -> Result<i32> {
    store.clean()?;
    println!("Removed {}", store.dir().display());
    Ok(exit_codes::SUCCESS)
}
