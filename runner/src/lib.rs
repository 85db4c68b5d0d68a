//! Ralph loop: drives an AI coding agent through a markdown task list.
//!
//! Each iteration runs an implementation agent, then an independent validation
//! agent, and optionally a cross-validation agent on a different backend before
//! accepting completion. The layout follows a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (envelope parsing, decisions,
//!   task counting, retry timing). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (agent processes, session state,
//!   config, artifacts).
//!
//! [`orchestrator`] ties the two together into the loop; [`interrupt`] and
//! [`runners`] wire it up for the CLI.

pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod interrupt;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod runners;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
