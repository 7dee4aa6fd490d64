//! Council configuration, loaded from TOML with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `CONCLAVE_CONFIG` environment variable (path to TOML file)
//! 2. `conclave.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The running config is held behind an [`arc_swap::ArcSwap`] so the
//! `PUT /config/council` endpoint can hot-swap the council without
//! restarting in-flight jobs: the orchestrator snapshots the config at the
//! start of each job and uses that snapshot for the job's lifetime.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Configuration errors surfaced at startup or on a config update.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {message}")]
    Io { path: String, message: String },
    #[error("could not parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a conclave deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Council membership and chairman selection
    #[serde(default)]
    pub council: CouncilConfig,

    /// Outbound gateway tuning (timeouts, retries, endpoint)
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage paths
    #[serde(default)]
    pub storage: StorageConfig,

    /// Per-model pricing for estimated cost accounting
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            council: CouncilConfig::default(),
            gateway: GatewayConfig::default(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

/// Council membership: which models answer, which model chairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilConfig {
    /// Council members - OpenRouter model identifiers
    #[serde(default = "default_council_models")]
    pub models: Vec<String>,

    /// Chairman model - synthesizes the final response
    #[serde(default = "default_chairman")]
    pub chairman: String,

    /// Cheap model used only for conversation title generation
    #[serde(default = "default_title_model")]
    pub title_model: String,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            models: default_council_models(),
            chairman: default_chairman(),
            title_model: default_title_model(),
        }
    }
}

fn default_council_models() -> Vec<String> {
    vec![
        "openai/gpt-5.1".to_string(),
        "google/gemini-3-pro-preview".to_string(),
        "anthropic/claude-sonnet-4.5".to_string(),
        "x-ai/grok-4".to_string(),
    ]
}

fn default_chairman() -> String {
    "google/gemini-3-pro-preview".to_string()
}

fn default_title_model() -> String {
    "google/gemini-2.5-flash".to_string()
}

/// Outbound gateway tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Chat completions endpoint base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-call timeout for council and chairman calls (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Per-call timeout for verification probes and title calls (seconds)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Retry attempts for transient provider errors, per call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries (milliseconds)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// How long to wait after job completion before polling the provider
    /// for billed generation costs (seconds)
    #[serde(default = "default_cost_reconcile_delay")]
    pub cost_reconcile_delay_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            cost_reconcile_delay_secs: default_cost_reconcile_delay(),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

const fn default_request_timeout() -> u64 {
    120
}

const fn default_probe_timeout() -> u64 {
    20
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_backoff_base_ms() -> u64 {
    500
}

const fn default_cost_reconcile_delay() -> u64 {
    3
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Number of concurrent job workers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            workers: default_workers(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:8001".to_string()
}

const fn default_workers() -> usize {
    2
}

/// Storage paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the sled database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Per-model pricing (USD per 1M tokens) used for estimated cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Fallback rate for models without a pricing entry
    #[serde(default = "default_pricing_rate")]
    pub default: ModelPricing,

    /// Known model rates, keyed by model identifier
    #[serde(default = "default_pricing_table")]
    pub models: BTreeMap<String, ModelPricing>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default: default_pricing_rate(),
            models: default_pricing_table(),
        }
    }
}

impl PricingConfig {
    /// Rate for a model, falling back to the default rate.
    pub fn rate_for(&self, model: &str) -> &ModelPricing {
        self.models.get(model).unwrap_or(&self.default)
    }
}

/// Input/output token rates (USD per 1M tokens).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

const fn default_pricing_rate() -> ModelPricing {
    ModelPricing {
        input: 1.00,
        output: 3.00,
    }
}

fn default_pricing_table() -> BTreeMap<String, ModelPricing> {
    let rates = [
        ("openai/gpt-5.1", 1.25, 10.00),
        ("google/gemini-3-pro-preview", 2.00, 12.00),
        ("anthropic/claude-sonnet-4.5", 3.00, 15.00),
        ("x-ai/grok-4", 3.00, 15.00),
        ("google/gemini-2.5-flash", 0.30, 2.50),
    ];
    rates
        .into_iter()
        .map(|(model, input, output)| (model.to_string(), ModelPricing { input, output }))
        .collect()
}

// ============================================================================
// Loading & Validation
// ============================================================================

impl AppConfig {
    /// Load configuration following the documented search order.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("CONCLAVE_CONFIG") {
            match Self::load_from_file(Path::new(&path)) {
                Ok(config) => {
                    info!(path = %path, "Loaded config from CONCLAVE_CONFIG");
                    return config;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "CONCLAVE_CONFIG set but unusable, falling back");
                }
            }
        }

        let cwd_path = Path::new("conclave.toml");
        if cwd_path.exists() {
            match Self::load_from_file(cwd_path) {
                Ok(config) => {
                    info!("Loaded config from ./conclave.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "./conclave.toml unusable, falling back to defaults");
                }
            }
        }

        info!("No config file found, using built-in defaults");
        Self::default()
    }

    /// Load and parse a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config invariants. Called on load and on every hot update.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.council.validate()?;

        if self.gateway.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("gateway.base_url is empty".to_string()));
        }
        if self.gateway.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.gateway.probe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.probe_timeout_secs must be positive".to_string(),
            ));
        }
        if self.server.workers == 0 {
            return Err(ConfigError::Invalid(
                "server.workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize back to TOML for persistence after a hot update.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

impl CouncilConfig {
    /// Validate council membership.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::Invalid(
                "council.models must contain at least one model".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "council.models contains an empty model id".to_string(),
                ));
            }
            if !seen.insert(model.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "council.models contains duplicate model '{model}'"
                )));
            }
        }
        if self.chairman.trim().is_empty() {
            return Err(ConfigError::Invalid("council.chairman is empty".to_string()));
        }
        if self.title_model.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "council.title_model is empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Shared Handle
// ============================================================================

/// Lock-free shared handle to the running configuration.
///
/// Readers call [`SharedConfig::snapshot`] once per job and keep the `Arc`
/// for the job's lifetime, so a concurrent hot-swap never changes a job's
/// council mid-flight.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<AppConfig>>,
}

impl SharedConfig {
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Current config snapshot.
    pub fn snapshot(&self) -> Arc<AppConfig> {
        self.inner.load_full()
    }

    /// Atomically replace the running config.
    pub fn store(&self, config: AppConfig) {
        self.inner.store(Arc::new(config));
    }
}
