//! Retry wrapper around an [`AgentRunner`].

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::core::retry::RetryPolicy;
use crate::io::agent::{AgentError, AgentRequest, AgentRunner};
use crate::io::availability::{Availability, PathLookup};

/// Retries transient agent failures with exponential backoff.
///
/// The backend executable is probed before the first attempt. Backoff waits
/// return early when the cancel token fires.
pub struct ResilientRunner<R, A = PathLookup> {
    inner: R,
    program: String,
    policy: RetryPolicy,
    probe: A,
}

impl<R: AgentRunner> ResilientRunner<R> {
    pub fn new(inner: R, program: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            program: program.into(),
            policy,
            probe: PathLookup,
        }
    }
}

impl<R: AgentRunner, A: Availability> ResilientRunner<R, A> {
    pub fn with_probe<B: Availability>(self, probe: B) -> ResilientRunner<R, B> {
        ResilientRunner {
            inner: self.inner,
            program: self.program,
            policy: self.policy,
            probe,
        }
    }
}

impl<R: AgentRunner, A: Availability> AgentRunner for ResilientRunner<R, A> {
    fn execute(&self, cancel: &CancelToken, request: &AgentRequest) -> Result<String, AgentError> {
        if !self.probe.is_installed(&self.program) {
            warn!(program = %self.program, "agent backend not available");
            return Err(AgentError::Unavailable {
                program: self.program.clone(),
            });
        }

        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let err = match self.inner.execute(cancel, request) {
                Ok(output) => {
                    if attempt > 1 {
                        info!(program = %self.program, attempt, "agent succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if attempt > self.policy.max_retries {
                warn!(
                    program = %self.program,
                    attempts = attempt,
                    max_attempts = self.policy.max_attempts(),
                    err = %err,
                    "agent retries exhausted"
                );
                return Err(err);
            }
            let delay = self.policy.delay_for(attempt);
            match &err {
                AgentError::Timeout { .. } => warn!(
                    program = %self.program,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "agent went silent, retrying"
                ),
                _ => warn!(
                    program = %self.program,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    err = %err,
                    "agent failed, retrying"
                ),
            }
            if cancel.wait_timeout(delay) {
                return Err(AgentError::Cancelled);
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    use super::*;

    struct Flaky {
        results: RefCell<VecDeque<Result<String, AgentError>>>,
        calls: Cell<u32>,
    }

    impl Flaky {
        fn new(results: Vec<Result<String, AgentError>>) -> Self {
            Self {
                results: RefCell::new(results.into()),
                calls: Cell::new(0),
            }
        }
    }

    impl AgentRunner for &Flaky {
        fn execute(&self, _cancel: &CancelToken, _request: &AgentRequest) -> Result<String, AgentError> {
            self.calls.set(self.calls.get() + 1);
            self.results
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::Process("exhausted script".to_string())))
        }
    }

    struct Installed(bool);

    impl Availability for Installed {
        fn is_installed(&self, _program: &str) -> bool {
            self.0
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
        }
    }

    fn process_err() -> Result<String, AgentError> {
        Err(AgentError::Process("exit 1".to_string()))
    }

    #[test]
    fn recovers_after_transient_failures() {
        let flaky = Flaky::new(vec![process_err(), Err(AgentError::Timeout { after: Duration::from_secs(1) }), Ok("done".to_string())]);
        let runner = ResilientRunner::new(&flaky, "claude", policy(3)).with_probe(Installed(true));
        let out = runner.execute(&CancelToken::new(), &AgentRequest::default()).unwrap();
        assert_eq!(out, "done");
        assert_eq!(flaky.calls.get(), 3);
    }

    #[test]
    fn gives_up_after_max_retries_plus_one_attempts() {
        let flaky = Flaky::new(vec![process_err(), process_err(), process_err(), process_err()]);
        let runner = ResilientRunner::new(&flaky, "claude", policy(2)).with_probe(Installed(true));
        let err = runner.execute(&CancelToken::new(), &AgentRequest::default()).unwrap_err();
        assert!(matches!(err, AgentError::Process(_)));
        assert_eq!(flaky.calls.get(), 3);
    }

    #[test]
    fn does_not_retry_configuration_errors() {
        let flaky = Flaky::new(vec![Err(AgentError::Config("bad model".to_string()))]);
        let runner = ResilientRunner::new(&flaky, "claude", policy(5)).with_probe(Installed(true));
        let err = runner.execute(&CancelToken::new(), &AgentRequest::default()).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert_eq!(flaky.calls.get(), 1);
    }

    #[test]
    fn missing_backend_is_reported_without_running() {
        let flaky = Flaky::new(vec![Ok("never".to_string())]);
        let runner = ResilientRunner::new(&flaky, "codex", policy(5)).with_probe(Installed(false));
        let err = runner.execute(&CancelToken::new(), &AgentRequest::default()).unwrap_err();
        assert!(matches!(err, AgentError::Unavailable { .. }));
        assert_eq!(flaky.calls.get(), 0);
    }

    #[test]
    fn cancellation_interrupts_backoff() {
        let flaky = Flaky::new(vec![process_err(), Ok("late".to_string())]);
        let slow = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
        };
        let runner = ResilientRunner::new(&flaky, "claude", slow).with_probe(Installed(true));
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let started = Instant::now();
        let err = runner.execute(&cancel, &AgentRequest::default()).unwrap_err();
        trigger.join().unwrap();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(flaky.calls.get(), 1);
    }
}
