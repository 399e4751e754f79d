//! Validated pipeline configuration.
//!
//! Everything the pipeline recognizes is enumerated here and checked up
//! front; jobs never read loose environment variables. The environment the
//! *client suite* receives (`KAFKA_CONNECT` and friends) is an output
//! interface assembled by the executor, not an input to this tool.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two mutually exclusive broker implementation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendVariant {
    /// Apache Kafka. Carries an additional SASL-authenticated listener.
    Kafka,
    /// Redpanda. Plain and external listeners only.
    Redpanda,
}

impl BackendVariant {
    /// Container image used when provisioning this variant.
    #[must_use]
    pub fn image(&self) -> &'static str {
        match self {
            BackendVariant::Kafka => "apache/kafka:3.9.0",
            BackendVariant::Redpanda => "redpandadata/redpanda:v24.2.4",
        }
    }

    /// Whether this variant exposes a SASL-authenticated listener.
    #[must_use]
    pub fn supports_sasl(&self) -> bool {
        matches!(self, BackendVariant::Kafka)
    }
}

impl std::fmt::Display for BackendVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendVariant::Kafka => write!(f, "kafka"),
            BackendVariant::Redpanda => write!(f, "redpanda"),
        }
    }
}

/// Per-node container resource limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU share (fractional cores).
    pub cpus: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpus: 1.0,
        }
    }
}

/// Fuzz campaign parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzConfig {
    /// Registered fuzz target names, processed strictly in order.
    pub targets: Vec<String>,
    /// Iteration budget per target.
    pub runs: u64,
    /// Fixed cache tag under which corpus state accumulates.
    pub cache_tag: String,
    /// Directory holding the cargo-fuzz workspace of the client.
    pub fuzz_dir: PathBuf,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            targets: vec!["protocol_reader".to_string()],
            runs: 100_000,
            cache_tag: "fuzz-state".to_string(),
            fuzz_dir: PathBuf::from("fuzz"),
        }
    }
}

/// Top-level pipeline configuration. Construct, then [`validate`].
///
/// [`validate`]: PipelineConfig::validate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Backend variant to provision for single-variant invocations.
    pub backend: BackendVariant,
    /// Broker node count. Must be at least 3; the non-controller-first
    /// guarantee is meaningless below that.
    pub node_count: usize,
    /// First host port; each node derives plain/external/SASL ports from it.
    pub base_port: u16,
    /// Per-node container resource limits.
    pub limits: ResourceLimits,
    /// Gate for cases that need a live topology. Off keeps a fast
    /// unit-only mode where such cases are skipped.
    pub integration: bool,
    /// Bind address for the interposition gateway, when interposed.
    pub proxy_bind: Option<SocketAddr>,
    /// Prepend an unreachable placeholder to the handed-out address list.
    pub placeholder_first: bool,
    /// Workspace of the client library under test.
    pub client_dir: PathBuf,
    /// Root of both keyed cache stores.
    pub cache_dir: PathBuf,
    /// Where externally exposed artifacts land (docs bundle, crash inputs).
    pub artifacts_dir: PathBuf,
    /// Branch name contributing to the dependency-cache key.
    pub branch: String,
    /// Webhook for the failure notification sink. None disables it.
    pub webhook_url: Option<String>,
    /// Feature-flag sets for the build matrix; each entry is one build job.
    pub feature_matrix: Vec<FeatureSelection>,
    /// Fuzz campaign parameters.
    pub fuzz: FuzzConfig,
    /// How long to wait for a node to become ready before aborting.
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,
    /// Wall-clock ceiling applied to each DAG job by the runner.
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
    /// 0 = info, 1 = debug, 2+ = trace.
    pub verbosity: u8,
}

/// One cell of the feature build matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSelection {
    /// Job-name suffix, e.g. `"default"` or `"no-default"`.
    pub name: String,
    /// Extra features to enable.
    pub features: Vec<String>,
    /// Whether to pass `--no-default-features`.
    pub no_default_features: bool,
}

impl FeatureSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: Vec::new(),
            no_default_features: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node count {0} is below the minimum of 3")]
    TooFewNodes(usize),
    #[error("base port {0} leaves no room for per-node listener ports")]
    BasePortTooHigh(u16),
    #[error("fuzz iteration budget must be nonzero")]
    ZeroFuzzBudget,
    #[error("no fuzz targets registered")]
    NoFuzzTargets,
    #[error("webhook URL '{0}' is not http(s)")]
    BadWebhook(String),
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: BackendVariant::Kafka,
            node_count: 3,
            base_port: 9010,
            limits: ResourceLimits::default(),
            integration: false,
            proxy_bind: None,
            placeholder_first: true,
            client_dir: PathBuf::from("."),
            cache_dir: default_cache_dir(),
            artifacts_dir: PathBuf::from("artifacts"),
            branch: "main".to_string(),
            webhook_url: None,
            feature_matrix: vec![
                FeatureSelection::new("default"),
                FeatureSelection {
                    name: "no-default".to_string(),
                    features: Vec::new(),
                    no_default_features: true,
                },
                FeatureSelection {
                    name: "full".to_string(),
                    features: vec!["full".to_string()],
                    no_default_features: false,
                },
            ],
            fuzz: FuzzConfig::default(),
            readiness_timeout: Duration::from_secs(120),
            job_timeout: Duration::from_secs(1800),
            verbosity: 0,
        }
    }
}

impl PipelineConfig {
    /// Fast preset: unit-only conformance, small fuzz budget.
    #[must_use]
    pub fn ci() -> Self {
        Self {
            integration: false,
            fuzz: FuzzConfig {
                runs: 10_000,
                ..FuzzConfig::default()
            },
            readiness_timeout: Duration::from_secs(60),
            job_timeout: Duration::from_secs(600),
            ..Self::default()
        }
    }

    /// Check every recognized option for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count < 3 {
            return Err(ConfigError::TooFewNodes(self.node_count));
        }
        // Three port ranges (plain/external/SASL) of node_count each.
        let span = (self.node_count as u32) * 3;
        if u32::from(self.base_port) + span > u32::from(u16::MAX) {
            return Err(ConfigError::BasePortTooHigh(self.base_port));
        }
        if self.fuzz.runs == 0 {
            return Err(ConfigError::ZeroFuzzBudget);
        }
        if self.fuzz.targets.is_empty() {
            return Err(ConfigError::NoFuzzTargets);
        }
        if let Some(url) = &self.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::BadWebhook(url.clone()));
            }
        }
        Ok(())
    }
}

/// Platform cache directory, falling back to a local path.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("broker-conformance")
}
