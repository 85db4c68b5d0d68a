//! I/O helpers: agent processes, state files and prompt rendering.

pub mod agent;
pub mod atomic;
pub mod availability;
pub mod config;
pub mod issue;
pub mod iteration_log;
pub mod learnings;
pub mod process;
pub mod prompt;
pub mod resilient;
pub mod session_store;
pub mod tasks;
