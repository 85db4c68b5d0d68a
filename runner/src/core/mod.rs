//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on agent output
//! text and in-memory values and return deterministic results suitable for tests.

pub mod backend;
pub mod decision;
pub mod envelope;
pub mod learnings;
pub mod retry;
pub mod stream;
pub mod tasks;
pub mod types;
pub mod verdicts;
