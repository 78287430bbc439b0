//! Runtime configuration and the command-line arguments shared by both
//! binaries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use thiserror::Error;

use crate::backoff::{BackoffPolicy, FixedIntervalPoll};
use crate::provider::{ArmProvider, CloudProvider, MemoryProvider, ProviderError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("no provider token; set --token or CLOUDOP_TOKEN, or use --simulate")]
    MissingToken,

    #[error("provider setup failed: {0}")]
    Provider(#[from] ProviderError),
}

/// Settings of the watch-triggered controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Period of the full re-list.
    pub resync_interval: Duration,
    /// Delay before another pass for objects that are still converging.
    pub requeue_interval: Duration,
    /// Per-object delay growth after failed reconciles.
    pub error_backoff: BackoffPolicy,
    /// Per-kind ceilings overriding the registry defaults.
    pub concurrency: BTreeMap<String, usize>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(60),
            requeue_interval: Duration::from_secs(10),
            error_backoff: BackoffPolicy::default(),
            concurrency: BTreeMap::new(),
        }
    }
}

/// Retry pacing flags.
#[derive(Args, Debug, Clone)]
pub struct BackoffArgs {
    /// Delay before the first retry, in seconds
    #[arg(long, default_value = "5")]
    pub backoff_initial: f64,

    /// Growth factor between retries
    #[arg(long, default_value = "1.25")]
    pub backoff_factor: f64,

    /// Number of retries before giving up
    #[arg(long, default_value = "30")]
    pub backoff_steps: usize,

    /// Upper bound for a single delay, in seconds
    #[arg(long, default_value = "900")]
    pub backoff_cap: f64,

    /// Random spread applied to each delay (0 = none, 1 = full)
    #[arg(long, default_value = "1.0")]
    pub backoff_jitter: f64,

    /// Poll interval for kinds that only report a status field, in seconds
    #[arg(long, default_value = "5")]
    pub poll_interval: u64,

    /// Give up polling such kinds after this many seconds
    #[arg(long, default_value = "180")]
    pub poll_timeout: u64,
}

fn seconds(value: f64, flag: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ConfigError::Invalid(format!("--{}: {}", flag, e)))
}

impl BackoffArgs {
    pub fn policy(&self) -> Result<BackoffPolicy, ConfigError> {
        let policy = BackoffPolicy {
            initial_delay: seconds(self.backoff_initial, "backoff-initial")?,
            factor: self.backoff_factor,
            max_steps: self.backoff_steps,
            cap: seconds(self.backoff_cap, "backoff-cap")?,
            jitter: self.backoff_jitter,
        };
        policy.validate().map_err(ConfigError::Invalid)?;
        Ok(policy)
    }

    pub fn fixed_poll(&self) -> FixedIntervalPoll {
        FixedIntervalPoll {
            interval: Duration::from_secs(self.poll_interval),
            timeout: Duration::from_secs(self.poll_timeout),
        }
    }
}

/// Cloud provider selection.
#[derive(Args, Debug, Clone)]
pub struct ProviderArgs {
    /// Management API endpoint
    #[arg(long, default_value = "https://management.azure.com")]
    pub endpoint: String,

    /// Bearer token for the management API
    #[arg(long, env = "CLOUDOP_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Use an in-process simulated cloud instead of the management API
    #[arg(long)]
    pub simulate: bool,

    /// Polls a simulated operation needs before it completes
    #[arg(long, default_value = "2")]
    pub simulate_polls: usize,
}

impl ProviderArgs {
    pub fn build(&self) -> Result<Arc<dyn CloudProvider>, ConfigError> {
        if self.simulate {
            let provider = MemoryProvider::new()
                .with_polls(self.simulate_polls)
                .status_only_for("/providers/Microsoft.Cache/Redis/");
            return Ok(Arc::new(provider));
        }
        let token = self.token.as_deref().ok_or(ConfigError::MissingToken)?;
        Ok(Arc::new(ArmProvider::new(&self.endpoint, token)?))
    }
}

/// Parse `KIND=N` for per-kind concurrency overrides.
pub fn parse_concurrency(s: &str) -> Result<(String, usize), String> {
    let (kind, limit) = s
        .split_once('=')
        .ok_or("Expected format: KIND=N".to_string())?;
    let limit: usize = limit.parse().map_err(|_| "Invalid limit".to_string())?;
    if kind.is_empty() || limit == 0 {
        return Err("Kind must be non-empty and limit positive".to_string());
    }
    Ok((kind.to_string(), limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        backoff: BackoffArgs,
        #[command(flatten)]
        provider: ProviderArgs,
    }

    #[test]
    fn test_defaults_match_production_policy() {
        let cli = Cli::parse_from(["test"]);
        assert_eq!(cli.backoff.policy().unwrap(), BackoffPolicy::default());
        assert_eq!(cli.backoff.fixed_poll(), FixedIntervalPoll::default());
        assert!(!cli.provider.simulate);
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let cli = Cli::parse_from(["test", "--backoff-factor", "0.5"]);
        assert!(matches!(cli.backoff.policy(), Err(ConfigError::Invalid(_))));

        let cli = Cli::parse_from(["test", "--backoff-cap", "0.1"]);
        assert!(cli.backoff.policy().is_err());
    }

    #[test]
    fn test_simulated_provider_needs_no_token() {
        let cli = Cli::parse_from(["test", "--simulate"]);
        assert!(cli.provider.build().is_ok());
    }

    #[test]
    fn test_parse_concurrency() {
        assert_eq!(parse_concurrency("RedisCache=15").unwrap(), ("RedisCache".to_string(), 15));
        assert!(parse_concurrency("RedisCache").is_err());
        assert!(parse_concurrency("RedisCache=0").is_err());
        assert!(parse_concurrency("=3").is_err());
    }
}
