use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{cli::Cli, error::AppError};

const MAX_CONCURRENT_PROBES: usize = 1024;

/// Relative weight of latency vs bandwidth in node scoring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RankWeights {
    /// Cost per millisecond of latency
    pub latency: f64,
    /// Credit per Mbps of bandwidth
    pub bandwidth: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            latency: 1.0,
            bandwidth: 0.0,
        }
    }
}

/// Probing and ranking policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Policy {
    #[serde(with = "humantime_serde")]
    pub recheck_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    pub max_concurrent_probes: usize,
    pub failure_threshold: u32,
    pub rank_weights: RankWeights,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            recheck_interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
            max_concurrent_probes: 25,
            failure_threshold: 3,
            rank_weights: RankWeights::default(),
        }
    }
}

/// Cadence of each periodic job, configured independently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Schedule {
    #[serde(with = "humantime_serde")]
    pub fetch_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub reset_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub push_interval: Duration,
    pub push_top_k: usize,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            fetch_interval: Duration::from_secs(12 * 3600),
            reset_interval: Duration::from_secs(7 * 24 * 3600),
            push_interval: Duration::from_secs(3600),
            push_top_k: 20,
        }
    }
}

/// The part of the configuration that may change while running
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimeConfig {
    pub policy: Policy,
    pub schedule: Schedule,
}

impl RuntimeConfig {
    /// Reject structurally invalid values before they reach any loop
    pub fn validate(&self) -> Result<(), AppError> {
        let policy = &self.policy;
        let schedule = &self.schedule;

        let positive = [
            ("policy.recheckInterval", policy.recheck_interval),
            ("policy.probeTimeout", policy.probe_timeout),
            ("schedule.fetchInterval", schedule.fetch_interval),
            ("schedule.resetInterval", schedule.reset_interval),
            ("schedule.pushInterval", schedule.push_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(AppError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if policy.max_concurrent_probes == 0 || policy.max_concurrent_probes > MAX_CONCURRENT_PROBES
        {
            return Err(AppError::ValidationError(format!(
                "policy.maxConcurrentProbes must be between 1 and {}",
                MAX_CONCURRENT_PROBES
            )));
        }

        if policy.failure_threshold == 0 {
            return Err(AppError::ValidationError(
                "policy.failureThreshold must be at least 1".to_string(),
            ));
        }

        let weights = policy.rank_weights;
        for (name, value) in [("latency", weights.latency), ("bandwidth", weights.bandwidth)] {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::ValidationError(format!(
                    "policy.rankWeights.{} must be a finite non-negative number",
                    name
                )));
            }
        }
        if weights.latency == 0.0 && weights.bandwidth == 0.0 {
            return Err(AppError::ValidationError(
                "policy.rankWeights must not both be zero".to_string(),
            ));
        }

        if schedule.push_top_k == 0 {
            return Err(AppError::ValidationError(
                "schedule.pushTopK must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Runtime configuration shared by every loop; replaced whole, never patched
#[derive(Debug)]
pub struct LiveConfig {
    inner: RwLock<RuntimeConfig>,
}

impl LiveConfig {
    pub fn new(initial: RuntimeConfig) -> Result<Self, AppError> {
        initial.validate()?;
        Ok(Self {
            inner: RwLock::new(initial),
        })
    }

    pub fn current(&self) -> RuntimeConfig {
        self.inner.read().clone()
    }

    pub fn policy(&self) -> Policy {
        self.inner.read().policy.clone()
    }

    pub fn schedule(&self) -> Schedule {
        self.inner.read().schedule.clone()
    }

    /// Validate and atomically swap in a complete new configuration
    pub fn replace(&self, update: RuntimeConfig) -> Result<RuntimeConfig, AppError> {
        update.validate()?;
        let mut guard = self.inner.write();
        *guard = update.clone();
        tracing::info!("Runtime configuration replaced: {:?}", update);
        Ok(update)
    }
}

#[derive(Debug, Clone)]
pub struct FeedCredentials {
    pub email: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub base_url: String,
    pub credentials: FeedCredentials,
    pub query: String,
    pub batch_size: usize,
    pub max_results: usize,
}

/// Account/credential pair used for configuration pushes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCredentials {
    pub tailnet: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub base_url: String,
    pub credentials: PushCredentials,
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub marker: String,
    pub bandwidth_path: String,
    pub bandwidth_window: Duration,
    pub bandwidth_max_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSettings {
    Redis(String),
    File(String),
    Memory,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub request_timeout: Duration,
    pub runtime: RuntimeConfig,
    pub feed: FeedSettings,
    pub push: Option<PushSettings>,
    pub probe: ProbeSettings,
    pub storage: StorageSettings,
    pub enable_admin: bool,
}

impl Config {
    /// Build and validate the startup configuration. Missing feed credentials are fatal.
    pub fn from_cli(cli: &Cli) -> Result<Self, AppError> {
        let email = cli.fofa_email.trim();
        let key = cli.fofa_key.trim();
        if email.is_empty() || key.is_empty() {
            return Err(AppError::ConfigError(
                "FOFA email and key must be set (--fofa-email/--fofa-key or FOFA_EMAIL/FOFA_KEY)"
                    .to_string(),
            ));
        }

        if cli.fetch_batch == 0 {
            return Err(AppError::ConfigError(
                "--fetch-batch must be at least 1".to_string(),
            ));
        }

        if cli.marker.is_empty() {
            return Err(AppError::ConfigError("--marker must not be empty".to_string()));
        }

        let runtime = RuntimeConfig {
            policy: Policy {
                recheck_interval: Duration::from_secs(cli.recheck_interval),
                probe_timeout: Duration::from_millis(cli.probe_timeout_ms),
                max_concurrent_probes: cli.max_concurrent_probes,
                failure_threshold: cli.failure_threshold,
                rank_weights: RankWeights {
                    latency: cli.latency_weight,
                    bandwidth: cli.bandwidth_weight,
                },
            },
            schedule: Schedule {
                fetch_interval: Duration::from_secs(cli.fetch_interval),
                reset_interval: Duration::from_secs(cli.reset_interval),
                push_interval: Duration::from_secs(cli.push_interval),
                push_top_k: cli.push_top_k,
            },
        };
        runtime
            .validate()
            .map_err(|e| AppError::ConfigError(e.to_string()))?;

        let push = match (&cli.tailnet, &cli.tailscale_api_key) {
            (Some(tailnet), Some(api_key)) if !tailnet.is_empty() && !api_key.is_empty() => {
                Some(PushSettings {
                    base_url: cli.tailscale_url.trim_end_matches('/').to_string(),
                    credentials: PushCredentials {
                        tailnet: tailnet.clone(),
                        api_key: api_key.clone(),
                    },
                })
            }
            (None, None) => None,
            _ => {
                tracing::warn!(
                    "Only one of TAILSCALE_TAILNET / TAILSCALE_API_KEY is set, configuration push disabled"
                );
                None
            }
        };

        let storage = match (&cli.redis_url, &cli.data_path) {
            (Some(url), _) if !url.is_empty() => StorageSettings::Redis(url.clone()),
            (_, Some(path)) if !path.is_empty() => StorageSettings::File(path.clone()),
            _ => StorageSettings::Memory,
        };

        let bandwidth_path = if cli.bandwidth_path.starts_with('/') {
            cli.bandwidth_path.clone()
        } else {
            format!("/{}", cli.bandwidth_path)
        };

        Ok(Config {
            bind_address: cli.bind_address(),
            request_timeout: cli.request_timeout(),
            runtime,
            feed: FeedSettings {
                base_url: cli.fofa_url.trim_end_matches('/').to_string(),
                credentials: FeedCredentials {
                    email: email.to_string(),
                    key: key.to_string(),
                },
                query: cli.feed_query.clone(),
                batch_size: cli.fetch_batch,
                max_results: cli.max_results,
            },
            push,
            probe: ProbeSettings {
                marker: cli.marker.clone(),
                bandwidth_path,
                bandwidth_window: Duration::from_millis(cli.bandwidth_window_ms),
                bandwidth_max_bytes: cli.bandwidth_max_bytes,
            },
            storage,
            enable_admin: cli.enable_admin,
        })
    }
}
