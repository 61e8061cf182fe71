/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cancellable retry loops, used by channels to reopen sockets.
//!
//! Channels retry connecting forever by default: a network partition must not surface to operators.
//! Every loop however takes a [`CancellationToken`], so that a node shutdown or a planned rescale can
//! interrupt a reconnect that would otherwise never finish.
//!
//! ## Log throttling
//!
//! The first failed attempt, and then every [`ERROR_LOG_PERIOD`]th, is logged at error level. All the
//! other failures are logged at debug level, so an extended partition emits at most one error line per
//! `ERROR_LOG_PERIOD` consecutive failures.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const ERROR_LOG_PERIOD: u64 = 100;

/// Shared flag requesting every loop holding a clone of it to stop.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How many times, and how fast, an operation is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries until success or cancellation.
    pub max_attempts: Option<u64>,

    /// Constant pause between two attempts. There is no backoff.
    pub pause: Duration,
}

impl RetryPolicy {
    /// Retry until success or cancellation.
    pub const fn forever(pause: Duration) -> Self {
        Self {
            max_attempts: None,
            pause,
        }
    }

    pub const fn max_attempts(max_attempts: u64, pause: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            pause,
        }
    }

    /// Run `op` until it succeeds, returning its result and the number of attempts it took.
    pub fn run<T, E: Debug>(
        &self,
        cancellation: &CancellationToken,
        what: &str,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<(T, u64), RetryError> {
        let mut attempts = 0;
        loop {
            if cancellation.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }

            attempts += 1;
            match op() {
                Ok(value) => return Ok((value, attempts)),
                Err(err) => {
                    if logs_at_error_level(attempts) {
                        log::error!("{} failed (attempt {}): {:?}", what, attempts, err);
                    } else {
                        log::debug!("{} failed (attempt {}): {:?}", what, attempts, err);
                    }
                }
            }

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(RetryError::Exhausted { attempts });
            }

            pause(self.pause, cancellation);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::forever(Duration::from_millis(10))
    }
}

/// Whether the failure of the `attempt`th (1-based) attempt is logged at error level.
pub fn logs_at_error_level(attempt: u64) -> bool {
    attempt % ERROR_LOG_PERIOD == 1
}

// Sleep for `duration`, waking up early if `cancellation` is cancelled.
fn pause(duration: Duration, cancellation: &CancellationToken) {
    const SLICE: Duration = Duration::from_millis(50);
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline || cancellation.is_cancelled() {
            return;
        }
        thread::sleep((deadline - now).min(SLICE));
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError {
    Cancelled { attempts: u64 },
    Exhausted { attempts: u64 },
}
