use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `OUTREACH__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Org-wide zone used when a recipient's zone cannot be resolved.
    #[serde(default = "default_utc_offset")]
    pub default_utc_offset: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Retries after the first failed attempt of a step.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry `n` fires `retry_backoff_secs * n` after the failure.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_unsubscribe_base_url")]
    pub unsubscribe_base_url: String,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_utc_offset() -> String {
    "+00:00".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    60
}
fn default_handler_timeout_ms() -> u64 {
    10_000
}
fn default_max_concurrency() -> usize {
    16
}
fn default_from_email() -> String {
    "noreply@outreach.local".to_string()
}
fn default_from_name() -> String {
    "Outreach".to_string()
}
fn default_unsubscribe_base_url() -> String {
    "https://outreach.local/unsubscribe".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_utc_offset: default_utc_offset(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            handler_timeout_ms: default_handler_timeout_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from_email: default_from_email(),
            from_name: default_from_name(),
            unsubscribe_base_url: default_unsubscribe_base_url(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("OUTREACH")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
