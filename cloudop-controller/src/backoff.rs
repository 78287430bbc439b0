//! Retry pacing.
//!
//! Two policies are available:
//! - `BackoffPolicy`: exponentially growing, capped, jittered delays for a
//!   bounded number of steps. Used around provider calls that hand out a
//!   continuation token or fail transiently.
//! - `FixedIntervalPoll`: a constant interval until a deadline. Used where the
//!   only progress signal is a status field on the remote resource.
//!
//! Both run the probe once immediately. A sleep is never started once
//! shutdown has been requested.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::shutdown::Shutdown;

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_steps: usize,
    pub cap: Duration,
    /// Each delay is moved by up to `jitter * delay` in either direction.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            factor: 1.25,
            max_steps: 30,
            cap: Duration::from_secs(900),
            jitter: 1.0,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(format!("backoff factor must be >= 1, got {}", self.factor));
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("jitter must be within [0, 1], got {}", self.jitter));
        }
        if self.cap < self.initial_delay {
            return Err("backoff cap must not be below the initial delay".to_string());
        }
        Ok(())
    }

    /// The pre-jitter delays, one per step.
    pub fn delays(&self) -> Delays {
        Delays {
            next: self.initial_delay,
            factor: self.factor.max(1.0),
            cap: self.cap,
            remaining: self.max_steps,
        }
    }

    /// Pre-jitter delay before retry number `step` (0-based), with no step
    /// limit. Used for per-object requeue delays.
    pub fn delay_for(&self, step: usize) -> Duration {
        let mut delays = Delays {
            next: self.initial_delay,
            factor: self.factor.max(1.0),
            cap: self.cap,
            remaining: usize::MAX,
        };
        let mut delay = self.initial_delay.min(self.cap);
        for _ in 0..=step {
            match delays.next() {
                Some(d) => delay = d,
                None => break,
            }
            if delay == self.cap {
                break;
            }
        }
        delay
    }

    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-1.0..=1.0) * self.jitter;
        delay.mul_f64((1.0 + spread).max(0.0))
    }

    /// Start pacing a sequence of attempts.
    pub fn start(&self, shutdown: Shutdown) -> Backoff {
        Backoff {
            policy: self.clone(),
            delays: self.delays(),
            shutdown,
            attempts: 1,
        }
    }
}

/// Iterator over pre-jitter delays: `initial, initial*factor, ...` capped.
#[derive(Debug, Clone)]
pub struct Delays {
    next: Duration,
    factor: f64,
    cap: Duration,
    remaining: usize,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.next.min(self.cap);
        self.next = delay.mul_f64(self.factor).min(self.cap);
        Some(delay)
    }
}

/// Stateful pacer for one sequence of attempts.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    delays: Delays,
    shutdown: Shutdown,
    attempts: usize,
}

impl Backoff {
    /// Sleep before the next attempt. Fails with `Timeout` once the steps are
    /// used up and with `Cancelled` on shutdown.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(delay) = self.delays.next() else {
            return Err(Error::Timeout {
                attempts: self.attempts,
            });
        };
        sleep_unless_shutdown(self.policy.jittered(delay), &mut self.shutdown).await?;
        self.attempts += 1;
        Ok(())
    }
}

/// Constant-interval polling with an overall deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedIntervalPoll {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for FixedIntervalPoll {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(180),
        }
    }
}

impl FixedIntervalPoll {
    pub fn start(&self, shutdown: Shutdown) -> FixedPoller {
        FixedPoller {
            interval: self.interval,
            deadline: Instant::now() + self.timeout,
            shutdown,
            attempts: 1,
        }
    }
}

#[derive(Debug)]
pub struct FixedPoller {
    interval: Duration,
    deadline: Instant,
    shutdown: Shutdown,
    attempts: usize,
}

impl FixedPoller {
    pub async fn wait(&mut self) -> Result<()> {
        if Instant::now() + self.interval > self.deadline {
            return Err(Error::Timeout {
                attempts: self.attempts,
            });
        }
        sleep_unless_shutdown(self.interval, &mut self.shutdown).await?;
        self.attempts += 1;
        Ok(())
    }
}

async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut Shutdown) -> Result<()> {
    if shutdown.is_triggered() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = shutdown.triggered() => Err(Error::Cancelled),
    }
}

/// Run `probe` until it reports done, fails, or the policy runs out of steps.
pub async fn retry<F, Fut>(policy: &BackoffPolicy, shutdown: Shutdown, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut backoff = policy.start(shutdown);
    loop {
        if probe().await? {
            return Ok(());
        }
        backoff.wait().await?;
    }
}

/// Run `probe` at a fixed interval until it reports done, fails, or the
/// deadline passes.
pub async fn poll_until<F, Fut>(poll: &FixedIntervalPoll, shutdown: Shutdown, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut poller = poll.start(shutdown);
    loop {
        if probe().await? {
            return Ok(());
        }
        poller.wait().await?;
    }
}
