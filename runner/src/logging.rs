//! Operator-facing tracing output.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Progress and diagnostics on stderr. Filtered by
//!   `RUST_LOG` when set. Not persisted.
//!
//! - **Session artifacts (`io/session_store`, `io/iteration_log`)**: State file
//!   and per-iteration agent output under `.ralph-loop/`. Always written,
//!   unaffected by log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise logs at `info`, with this crate at
/// `debug` when `verbose` is on. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=ralph_loop=trace ralph-loop run
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

fn default_directives(verbose: bool) -> &'static str {
    if verbose { "info,ralph_loop=debug" } else { "info" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_crate_level_only() {
        assert_eq!(default_directives(false), "info");
        assert_eq!(default_directives(true), "info,ralph_loop=debug");
    }
}
