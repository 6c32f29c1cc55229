use config::{Config, ConfigError, Environment, File};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
const DEFAULT_SYNC_COOLDOWN_SECS: u64 = 300; // 5 minutes
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 600;
const DEFAULT_PAYMENT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_SETTLED_PAYMENT_TTL_SECS: u64 = 3600;
const DEFAULT_HOUSEKEEPING_INTERVAL_SECS: u64 = 300;
const DEFAULT_STORAGE_DIR: &str = ".lindas";

/// What to do when a requested quantity exceeds the last known stock level.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StockPolicy {
    /// Clamp the quantity to the known stock ceiling.
    #[default]
    Enforce,
    /// Accept the quantity and only surface a warning.
    Warn,
}

/// Storefront configuration with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Base URL of the storefront REST API (e.g. `https://shop.example/api`)
    #[validate(url)]
    pub api_base_url: String,

    /// Bearer token attached to every API request, when signed in
    #[serde(default)]
    pub api_token: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,

    /// Attempts per transport for idempotent requests
    #[serde(default = "default_max_retries")]
    #[validate(range(min = 1, max = 10))]
    pub max_retries: u32,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Backoff multiplier between retries
    #[serde(default = "default_retry_backoff_multiplier")]
    #[validate(custom = "validate_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,

    /// Failures before the primary transport's circuit opens
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failure_threshold: u32,

    /// Seconds before an open circuit lets a trial request through
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout_secs: u64,

    /// Flat shipping fee in KES
    #[serde(default = "default_flat_shipping_fee")]
    pub flat_shipping_fee: Decimal,

    /// Charge shipping even when the cart is empty
    #[serde(default)]
    pub charge_shipping_on_empty_cart: bool,

    /// Apply tax to cart totals
    #[serde(default)]
    pub tax_enabled: bool,

    /// Tax rate (as decimal, e.g., 0.16 for 16% VAT)
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: f64,

    /// Apply discount codes to cart totals
    #[serde(default)]
    pub discounts_enabled: bool,

    /// Discount code → percentage off the subtotal
    #[serde(default)]
    pub discount_codes: HashMap<String, Decimal>,

    /// Stock ceiling behaviour for quantity updates
    #[serde(default)]
    pub stock_policy: StockPolicy,

    /// Minimum seconds between two unforced catalog syncs
    #[serde(default = "default_sync_cooldown_secs")]
    pub sync_cooldown_secs: u64,

    /// Background catalog sync period in seconds
    #[serde(default = "default_sync_interval_secs")]
    #[validate(range(min = 1))]
    pub sync_interval_secs: u64,

    /// Payment status poll period in seconds
    #[serde(default = "default_payment_poll_interval_secs")]
    #[validate(range(min = 1))]
    pub payment_poll_interval_secs: u64,

    /// Seconds a settled payment or applied order update is remembered
    #[serde(default = "default_settled_payment_ttl_secs")]
    #[validate(range(min = 1))]
    pub settled_payment_ttl_secs: u64,

    /// Period of the sweep that forgets expired payment records, in seconds
    #[serde(default = "default_housekeeping_interval_secs")]
    #[validate(range(min = 1))]
    pub housekeeping_interval_secs: u64,

    /// Directory holding the persisted cart and wishlist
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the API location.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            api_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
            circuit_breaker_failure_threshold: default_circuit_breaker_failures(),
            circuit_breaker_timeout_secs: default_circuit_breaker_timeout(),
            flat_shipping_fee: default_flat_shipping_fee(),
            charge_shipping_on_empty_cart: false,
            tax_enabled: false,
            tax_rate: default_tax_rate(),
            discounts_enabled: false,
            discount_codes: HashMap::new(),
            stock_policy: StockPolicy::default(),
            sync_cooldown_secs: default_sync_cooldown_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            payment_poll_interval_secs: default_payment_poll_interval_secs(),
            settled_payment_ttl_secs: default_settled_payment_ttl_secs(),
            housekeeping_interval_secs: default_housekeeping_interval_secs(),
            storage_dir: default_storage_dir(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn sync_cooldown(&self) -> Duration {
        Duration::from_secs(self.sync_cooldown_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn payment_poll_interval(&self) -> Duration {
        Duration::from_secs(self.payment_poll_interval_secs)
    }

    pub fn settled_payment_ttl(&self) -> Duration {
        Duration::from_secs(self.settled_payment_ttl_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_secs)
    }

    /// Tax rate as an exact decimal
    pub fn tax_rate_decimal(&self) -> Decimal {
        Decimal::from_f64(self.tax_rate).unwrap_or(Decimal::ZERO)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_retry_backoff_multiplier() -> f64 {
    2.0
}

fn default_circuit_breaker_failures() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> u64 {
    30
}

fn default_flat_shipping_fee() -> Decimal {
    Decimal::from(300)
}

fn default_tax_rate() -> f64 {
    0.16 // Kenyan VAT
}

fn default_sync_cooldown_secs() -> u64 {
    DEFAULT_SYNC_COOLDOWN_SECS
}

fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_payment_poll_interval_secs() -> u64 {
    DEFAULT_PAYMENT_POLL_INTERVAL_SECS
}

fn default_settled_payment_ttl_secs() -> u64 {
    DEFAULT_SETTLED_PAYMENT_TTL_SECS
}

fn default_housekeeping_interval_secs() -> u64 {
    DEFAULT_HOUSEKEEPING_INTERVAL_SECS
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_DIR)
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        let mut err = ValidationError::new("tax_rate");
        err.message = Some("tax_rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_backoff_multiplier(multiplier: f64) -> Result<(), ValidationError> {
    if !multiplier.is_finite() || multiplier < 1.0 {
        let mut err = ValidationError::new("retry_backoff_multiplier");
        err.message = Some("retry_backoff_multiplier must be at least 1.0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("lindas_commerce={}", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let result = if json {
        fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init()
    } else {
        fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init()
    };

    if let Err(e) = result {
        // A subscriber is already installed (tests, embedding host)
        tracing::debug!("Tracing already initialised: {}", e);
    }
}

/// Loads storefront configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Same as [`load_config`] with an explicit config directory.
pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("api_base_url", "http://localhost:5000/api")?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(
            File::with_name(&config_dir.join("default").to_string_lossy()).required(false),
        )
        .add_source(File::with_name(&config_dir.join(&run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
