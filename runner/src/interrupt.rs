//! Interrupt sources: OS signals and the cross-process cancel request file.
//!
//! Both end up in [`Interrupts::trigger`], which fires the shared cancel token
//! and then runs the flush hook so the last committed state is written even
//! while the loop thread is blocked waiting on an agent.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::io::session_store::SessionStore;

pub const CANCEL_POLL: Duration = Duration::from_millis(500);

type Hook = Box<dyn Fn() + Send>;

#[derive(Clone, Default)]
pub struct Interrupts {
    token: CancelToken,
    hook: Arc<Mutex<Option<Hook>>>,
}

impl Interrupts {
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            hook: Arc::default(),
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Runs once per trigger, after the token is cancelled.
    pub fn set_flush_hook(&self, hook: impl Fn() + Send + 'static) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    pub fn trigger(&self) {
        let first = !self.token.is_cancelled();
        self.token.cancel();
        if !first {
            return;
        }
        if let Some(hook) = self.hook.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            hook();
        }
    }

    /// Route SIGINT, SIGTERM and SIGHUP to [`Interrupts::trigger`].
    pub fn install_signal_handler(&self) -> Result<()> {
        let interrupts = self.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, stopping after saving state");
            interrupts.trigger();
        })
        .context("install signal handler")
    }

    /// Poll the store for a cancel request written by another process.
    pub fn watch_cancel_requests(&self, store: SessionStore, poll: Duration) -> CancelWatcher {
        let stop = CancelToken::new();
        let interrupts = self.clone();
        let stop_signal = stop.clone();
        let handle = thread::spawn(move || {
            loop {
                if store.cancel_requested() {
                    warn!(path = %store.cancel_path().display(), "cancel requested");
                    interrupts.trigger();
                    return;
                }
                if interrupts.token.is_cancelled() || stop_signal.wait_timeout(poll) {
                    return;
                }
            }
        });
        CancelWatcher {
            stop,
            handle: Some(handle),
        }
    }
}

/// Stops the cancel-file watcher thread when dropped.
pub struct CancelWatcher {
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Drop for CancelWatcher {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            debug!("cancel watcher panicked");
        }
    }
}
