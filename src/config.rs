//! Farm configuration.
//!
//! Covers the orchestration engine (batch size, pool cap, handler
//! concurrency, poll intervals), the gateway backends (redis URL,
//! namespace) and instance provisioning (images, injected environment).
//! Values come from defaults, a YAML file, or `DOCFARM_*` environment
//! variables.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the task farm.
#[derive(Debug, Clone)]
pub struct FarmConfig {
    // Orchestration settings
    /// Maximum number of tasks per dispatched batch.
    pub tasks_per_worker: usize,
    /// Hard cap on total instances, the coordinator's own slot included.
    pub max_instances: usize,
    /// Instance slots reserved for the coordinator itself.
    pub coordinator_headroom: usize,
    /// Concurrent message handlers per consumption loop.
    pub handler_concurrency: usize,
    /// Bounded wait for a single queue receive.
    pub poll_wait: Duration,
    /// Interval between drain-condition checks during shutdown.
    pub drain_poll_interval: Duration,

    // Gateway settings
    /// Redis connection URL backing queues and blobs.
    pub redis_url: String,
    /// Key namespace isolating this farm's queues and blobs.
    pub namespace: String,

    // Provisioning settings
    /// Image worker instances are started from.
    pub worker_image: String,
    /// Image the coordinator instance is started from.
    pub coordinator_image: String,
    /// Environment variables injected into started instances.
    pub worker_env: Vec<String>,

    // Worker settings
    /// Timeout for fetching a single source document.
    pub http_timeout: Duration,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            tasks_per_worker: 5,
            max_instances: 9,
            coordinator_headroom: 1,
            handler_concurrency: 10,
            poll_wait: Duration::from_secs(5),
            drain_poll_interval: Duration::from_secs(1),
            redis_url: "redis://localhost:6379".to_string(),
            namespace: "docfarm".to_string(),
            worker_image: "docfarm-worker:latest".to_string(),
            coordinator_image: "docfarm-coordinator:latest".to_string(),
            worker_env: Vec::new(),
            http_timeout: Duration::from_secs(15),
        }
    }
}

impl FarmConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DOCFARM_TASKS_PER_WORKER`: tasks per batch (default: 5)
    /// - `DOCFARM_MAX_INSTANCES`: instance cap (default: 9)
    /// - `DOCFARM_COORDINATOR_HEADROOM`: reserved slots (default: 1)
    /// - `DOCFARM_HANDLER_CONCURRENCY`: handlers per loop (default: 10)
    /// - `DOCFARM_POLL_WAIT_SECS`: queue receive wait (default: 5)
    /// - `DOCFARM_DRAIN_POLL_SECS`: drain check interval (default: 1)
    /// - `DOCFARM_REDIS_URL`: redis URL (default: redis://localhost:6379)
    /// - `DOCFARM_NAMESPACE`: key namespace (default: docfarm)
    /// - `DOCFARM_WORKER_IMAGE`: worker image
    /// - `DOCFARM_COORDINATOR_IMAGE`: coordinator image
    /// - `DOCFARM_HTTP_TIMEOUT_SECS`: document fetch timeout (default: 15)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DOCFARM_TASKS_PER_WORKER") {
            config.tasks_per_worker = parse_env_value(&val, "DOCFARM_TASKS_PER_WORKER")?;
        }

        if let Ok(val) = std::env::var("DOCFARM_MAX_INSTANCES") {
            config.max_instances = parse_env_value(&val, "DOCFARM_MAX_INSTANCES")?;
        }

        if let Ok(val) = std::env::var("DOCFARM_COORDINATOR_HEADROOM") {
            config.coordinator_headroom = parse_env_value(&val, "DOCFARM_COORDINATOR_HEADROOM")?;
        }

        if let Ok(val) = std::env::var("DOCFARM_HANDLER_CONCURRENCY") {
            config.handler_concurrency = parse_env_value(&val, "DOCFARM_HANDLER_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("DOCFARM_POLL_WAIT_SECS") {
            let secs: u64 = parse_env_value(&val, "DOCFARM_POLL_WAIT_SECS")?;
            config.poll_wait = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DOCFARM_DRAIN_POLL_SECS") {
            let secs: u64 = parse_env_value(&val, "DOCFARM_DRAIN_POLL_SECS")?;
            config.drain_poll_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DOCFARM_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("DOCFARM_NAMESPACE") {
            config.namespace = val;
        }

        if let Ok(val) = std::env::var("DOCFARM_WORKER_IMAGE") {
            config.worker_image = val;
        }

        if let Ok(val) = std::env::var("DOCFARM_COORDINATOR_IMAGE") {
            config.coordinator_image = val;
        }

        if let Ok(val) = std::env::var("DOCFARM_HTTP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DOCFARM_HTTP_TIMEOUT_SECS")?;
            config.http_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file, applied over the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parses configuration from YAML text, applied over the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_yaml::from_str(yaml)?;
        let mut config = Self::default();

        if let Some(val) = file.tasks_per_worker {
            config.tasks_per_worker = val;
        }
        if let Some(val) = file.max_instances {
            config.max_instances = val;
        }
        if let Some(val) = file.coordinator_headroom {
            config.coordinator_headroom = val;
        }
        if let Some(val) = file.handler_concurrency {
            config.handler_concurrency = val;
        }
        if let Some(val) = file.poll_wait_secs {
            config.poll_wait = Duration::from_secs(val);
        }
        if let Some(val) = file.drain_poll_secs {
            config.drain_poll_interval = Duration::from_secs(val);
        }
        if let Some(val) = file.redis_url {
            config.redis_url = val;
        }
        if let Some(val) = file.namespace {
            config.namespace = val;
        }
        if let Some(val) = file.worker_image {
            config.worker_image = val;
        }
        if let Some(val) = file.coordinator_image {
            config.coordinator_image = val;
        }
        if let Some(val) = file.worker_env {
            config.worker_env = val;
        }
        if let Some(val) = file.http_timeout_secs {
            config.http_timeout = Duration::from_secs(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks_per_worker == 0 {
            return Err(ConfigError::ValidationFailed(
                "tasks_per_worker must be greater than 0".to_string(),
            ));
        }

        if self.max_instances == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_instances must be greater than 0".to_string(),
            ));
        }

        if self.coordinator_headroom >= self.max_instances {
            return Err(ConfigError::ValidationFailed(
                "coordinator_headroom must be smaller than max_instances".to_string(),
            ));
        }

        if self.handler_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "handler_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.poll_wait.as_secs() == 0 && self.poll_wait.subsec_nanos() == 0 {
            return Err(ConfigError::ValidationFailed(
                "poll_wait must be greater than 0".to_string(),
            ));
        }

        if self.namespace.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "namespace cannot be empty".to_string(),
            ));
        }

        if self.worker_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "worker_image cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set tasks per batch.
    pub fn with_tasks_per_worker(mut self, tasks: usize) -> Self {
        self.tasks_per_worker = tasks;
        self
    }

    /// Builder method to set the instance cap.
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    /// Builder method to set the coordinator headroom.
    pub fn with_coordinator_headroom(mut self, headroom: usize) -> Self {
        self.coordinator_headroom = headroom;
        self
    }

    /// Builder method to set handler concurrency.
    pub fn with_handler_concurrency(mut self, concurrency: usize) -> Self {
        self.handler_concurrency = concurrency;
        self
    }

    /// Builder method to set the queue receive wait.
    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    /// Builder method to set the drain check interval.
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Builder method to set the redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Builder method to set the worker image.
    pub fn with_worker_image(mut self, image: impl Into<String>) -> Self {
        self.worker_image = image.into();
        self
    }

    /// Builder method to set the document fetch timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

/// Optional-field mirror of [`FarmConfig`] for YAML files.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    tasks_per_worker: Option<usize>,
    max_instances: Option<usize>,
    coordinator_headroom: Option<usize>,
    handler_concurrency: Option<usize>,
    poll_wait_secs: Option<u64>,
    drain_poll_secs: Option<u64>,
    redis_url: Option<String>,
    namespace: Option<String>,
    worker_image: Option<String>,
    coordinator_image: Option<String>,
    worker_env: Option<Vec<String>>,
    http_timeout_secs: Option<u64>,
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
