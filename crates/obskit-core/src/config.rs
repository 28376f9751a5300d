#![forbid(unsafe_code)]

//! Dispatch configuration.
//!
//! [`DispatchConfig`] controls the queue that carries posted writes to the
//! designated delivery context. Defaults suit a UI loop pumping the queue
//! once per frame; [`DispatchConfig::from_env`] lets deployments tune it
//! without code changes.

use std::env;

use crate::error::{Error, Result};

/// Default number of tasks executed per [`MainLoop::run_pending`] call.
///
/// [`MainLoop::run_pending`]: crate::dispatch::MainLoop::run_pending
pub const DEFAULT_BATCH_LIMIT: usize = 256;

/// Default name of the thread spawned by [`DispatchThread`].
///
/// [`DispatchThread`]: crate::dispatch::DispatchThread
pub const DEFAULT_THREAD_NAME: &str = "obskit-dispatch";

/// Environment variable overriding [`DispatchConfig::queue_capacity`].
/// `0` or `unbounded` selects an unbounded queue.
pub const ENV_CAPACITY: &str = "OBSKIT_DISPATCH_CAPACITY";
/// Environment variable overriding [`DispatchConfig::batch_limit`].
pub const ENV_BATCH: &str = "OBSKIT_DISPATCH_BATCH";
/// Environment variable overriding [`DispatchConfig::thread_name`].
pub const ENV_THREAD: &str = "OBSKIT_DISPATCH_THREAD";

/// Configuration for a dispatch queue and its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Queue bound. `None` means unbounded.
    ///
    /// With a bound, [`Dispatcher::dispatch`] blocks when the queue is full,
    /// so tasks must not post into a full bounded queue they are draining.
    ///
    /// [`Dispatcher::dispatch`]: crate::dispatch::Dispatcher::dispatch
    pub queue_capacity: Option<usize>,
    /// Maximum tasks executed per pump iteration.
    pub batch_limit: usize,
    /// Thread name used by `DispatchThread`.
    pub thread_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            batch_limit: DEFAULT_BATCH_LIMIT,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl DispatchConfig {
    /// Default configuration with environment overrides applied.
    ///
    /// Unparseable values are ignored and the default is kept.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup(ENV_CAPACITY) {
            let val = val.trim();
            if val == "0" || val.eq_ignore_ascii_case("unbounded") {
                config.queue_capacity = None;
            } else if let Ok(n) = val.parse() {
                config.queue_capacity = Some(n);
            } else {
                tracing::warn!(message = "config.ignored", var = ENV_CAPACITY, value = val);
            }
        }
        if let Some(val) = lookup(ENV_BATCH) {
            let val = val.trim();
            match val.parse() {
                Ok(n) => config.batch_limit = n,
                Err(_) => {
                    tracing::warn!(message = "config.ignored", var = ENV_BATCH, value = val);
                }
            }
        }
        if let Some(val) = lookup(ENV_THREAD) {
            let val = val.trim();
            if val.is_empty() {
                tracing::warn!(message = "config.ignored", var = ENV_THREAD, value = val);
            } else {
                config.thread_name = val.to_string();
            }
        }

        config
    }

    /// Bound the queue to `capacity` tasks.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Remove the queue bound.
    #[must_use]
    pub fn unbounded(mut self) -> Self {
        self.queue_capacity = None;
        self
    }

    /// Set the per-pump batch limit.
    #[must_use]
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Set the dispatch thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Reject configurations that would stall the queue.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == Some(0) {
            return Err(Error::invalid_config(
                "queue_capacity must be > 0 (use None for unbounded)",
            ));
        }
        if self.batch_limit == 0 {
            return Err(Error::invalid_config("batch_limit must be > 0"));
        }
        if self.thread_name.contains('\0') {
            return Err(Error::invalid_config("thread_name must not contain NUL"));
        }
        Ok(())
    }
}
