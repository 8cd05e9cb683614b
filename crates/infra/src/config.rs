//! Runner configuration read from the process environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use agentops_agents::HttpModelConfig;
use agentops_core::RunnerId;

use crate::daemon::DaemonConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::queue::LEASE_DURATION;

const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_LEASE_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MODEL_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var} ({value:?}): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Model provider settings; present only when `AGENTOPS_MODEL_BASE_URL` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub prompt_price_per_1k: f64,
    pub completion_price_per_1k: f64,
}

impl ModelSettings {
    pub fn http_model_config(&self) -> HttpModelConfig {
        let config = HttpModelConfig::new(&self.base_url, &self.model)
            .with_timeout(self.timeout)
            .with_prices(self.prompt_price_per_1k, self.completion_price_per_1k);
        match &self.api_key {
            Some(key) => config.with_api_key(key),
            None => config,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub runner_id: RunnerId,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub lease_sweep_interval: Option<Duration>,
    pub environment: String,
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// `None` selects the scripted echo executor.
    pub model: Option<ModelSettings>,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let runner_id = match get("AGENTOPS_RUNNER_ID") {
            Some(value) => RunnerId::new(value.clone()).map_err(|e| ConfigError::Invalid {
                var: "AGENTOPS_RUNNER_ID",
                value,
                reason: e.to_string(),
            })?,
            None => RunnerId::generate(),
        };

        let poll_interval = millis(
            "AGENTOPS_POLL_INTERVAL_MS",
            get("AGENTOPS_POLL_INTERVAL_MS"),
        )?
        .unwrap_or(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "AGENTOPS_POLL_INTERVAL_MS",
                value: "0".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let lease = millis("AGENTOPS_LEASE_MS", get("AGENTOPS_LEASE_MS"))?.unwrap_or(LEASE_DURATION);
        if lease.is_zero() {
            return Err(ConfigError::Invalid {
                var: "AGENTOPS_LEASE_MS",
                value: "0".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let heartbeat_interval = millis(
            "AGENTOPS_HEARTBEAT_INTERVAL_MS",
            get("AGENTOPS_HEARTBEAT_INTERVAL_MS"),
        )?
        .filter(|d| !d.is_zero());

        // 0 disables the sweep.
        let lease_sweep_interval = match millis(
            "AGENTOPS_LEASE_SWEEP_INTERVAL_MS",
            get("AGENTOPS_LEASE_SWEEP_INTERVAL_MS"),
        )? {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => Some(Duration::from_millis(DEFAULT_LEASE_SWEEP_INTERVAL_MS)),
        };

        let model = match get("AGENTOPS_MODEL_BASE_URL") {
            Some(base_url) => Some(ModelSettings {
                base_url,
                api_key: get("AGENTOPS_MODEL_API_KEY"),
                model: get("AGENTOPS_MODEL_NAME").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                timeout: millis(
                    "AGENTOPS_MODEL_TIMEOUT_MS",
                    get("AGENTOPS_MODEL_TIMEOUT_MS"),
                )?
                .unwrap_or(Duration::from_millis(DEFAULT_MODEL_TIMEOUT_MS)),
                prompt_price_per_1k: price(
                    "AGENTOPS_MODEL_PROMPT_PRICE_PER_1K",
                    get("AGENTOPS_MODEL_PROMPT_PRICE_PER_1K"),
                )?,
                completion_price_per_1k: price(
                    "AGENTOPS_MODEL_COMPLETION_PRICE_PER_1K",
                    get("AGENTOPS_MODEL_COMPLETION_PRICE_PER_1K"),
                )?,
            }),
            None => None,
        };

        Ok(Self {
            runner_id,
            poll_interval,
            lease,
            heartbeat_interval,
            lease_sweep_interval,
            environment: get("AGENTOPS_ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            database_url: get("DATABASE_URL"),
            model,
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let config = OrchestratorConfig::new(self.runner_id.clone())
            .with_environment(self.environment.clone());
        match self.heartbeat_interval {
            Some(interval) => config.with_heartbeat(interval),
            None => config,
        }
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_lease_sweep(self.lease_sweep_interval)
    }
}

fn parse<T: FromStr>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn millis(var: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(var, value)?.map(Duration::from_millis))
}

fn price(var: &'static str, value: Option<String>) -> Result<f64, ConfigError> {
    match parse::<f64>(var, value.clone())? {
        Some(p) if p.is_finite() && p >= 0.0 => Ok(p),
        Some(_) => Err(ConfigError::Invalid {
            var,
            value: value.unwrap_or_default(),
            reason: "must be a non-negative number".into(),
        }),
        None => Ok(0.0),
    }
}
