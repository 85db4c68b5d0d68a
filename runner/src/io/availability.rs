//! Backend CLI availability probing.

use std::collections::BTreeMap;

use tracing::debug;

/// Answers whether an executable can be launched.
pub trait Availability {
    fn is_installed(&self, program: &str) -> bool;
}

/// Probe that searches `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathLookup;

impl Availability for PathLookup {
    fn is_installed(&self, program: &str) -> bool {
        match which::which(program) {
            Ok(path) => {
                debug!(program, path = %path.display(), "found on PATH");
                true
            }
            Err(_) => false,
        }
    }
}

/// Installed state for each program, keyed by name.
pub fn check_availability<A: Availability + ?Sized>(probe: &A, programs: &[&str]) -> BTreeMap<String, bool> {
    programs
        .iter()
        .map(|program| ((*program).to_string(), probe.is_installed(program)))
        .collect()
}
