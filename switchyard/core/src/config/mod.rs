//! TOML Configuration File Support
//!
//! Loads the router's tunables and route table from
//! `~/.config/switchyard/router.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. Explicit overrides ([`ConfigOverrides`])
//! 2. Environment variables (`SWITCHYARD_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/switchyard/router.toml` (typically `~/.config/switchyard/router.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [health]
//! failure_threshold = 5
//! failure_window_secs = 60
//! min_success_rate = 0.8
//! cooldown_secs = 30
//! max_cooldown_secs = 300
//!
//! [bandit]
//! exploration_floor = 0.05
//! min_trials = 5
//! ema_decay = 0.1
//!
//! [sla]
//! emergency_ms = 5000
//! critical_ms = 10000
//! standard_ms = 30000
//!
//! [fallback]
//! grace_margin_ms = 500
//! min_attempt_window_ms = 200
//!
//! [router]
//! allow_degraded = true
//! decision_log_capacity = 1024
//!
//! [[routes]]
//! path = "direct"
//! provider = "anthropic"
//! supports_tools = true
//! default_latency_ms = 800
//! cost_per_unit = 12
//!
//! [[routes]]
//! path = "broker"
//! provider = "openrouter"
//! default_latency_ms = 1500
//! cost_per_unit = 9
//! ```
//!
//! Every section is optional. Values that fail to parse from the environment
//! are ignored; values that parse but are out of range fail validation.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::{
    BanditConfig, FallbackConfig, HealthConfig, PathKind, Route, RouteCapabilities, RouterConfig,
    SlaTable,
};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from explicit overrides
    Override,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Override => write!(f, "override"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Health section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Consecutive failures that open a circuit
    pub failure_threshold: Option<u32>,
    /// Sliding window in seconds
    pub failure_window_secs: Option<u64>,
    /// Minimum window success rate (0.0 - 1.0)
    pub min_success_rate: Option<f64>,
    /// Samples needed before the success rate can trip
    pub min_window_samples: Option<usize>,
    /// Base cooldown in seconds
    pub cooldown_secs: Option<u64>,
    /// Cooldown cap in seconds
    pub max_cooldown_secs: Option<u64>,
    /// Half-open probe timeout in milliseconds
    pub probe_timeout_ms: Option<u64>,
}

/// Bandit section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditToml {
    /// Guaranteed share for under-tried routes
    pub exploration_floor: Option<f64>,
    /// Trials below which the floor applies
    pub min_trials: Option<u64>,
    /// Moving average decay
    pub ema_decay: Option<f64>,
}

/// SLA section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaToml {
    /// Emergency deadline in milliseconds
    pub emergency_ms: Option<u64>,
    /// Critical deadline in milliseconds
    pub critical_ms: Option<u64>,
    /// Standard deadline in milliseconds
    pub standard_ms: Option<u64>,
}

/// Fallback section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackToml {
    /// Substitute routes after the primary (0 or 1)
    pub max_hops: Option<usize>,
    /// SLA grace margin in milliseconds
    pub grace_margin_ms: Option<u64>,
    /// Minimum residual budget for a fallback attempt in milliseconds
    pub min_attempt_window_ms: Option<u64>,
}

/// Router section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    /// Route to open circuits when nothing else matches
    pub allow_degraded: Option<bool>,
    /// Decisions kept in the in-memory log
    pub decision_log_capacity: Option<usize>,
}

/// One `[[routes]]` entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteToml {
    /// `direct` or `broker`
    pub path: String,
    /// Provider identifier
    pub provider: String,
    /// Tool calling support
    #[serde(default)]
    pub supports_tools: Option<bool>,
    /// Maximum tokens per request
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Expected latency in milliseconds
    #[serde(default)]
    pub default_latency_ms: Option<u64>,
    /// Cost per request in minor units
    #[serde(default)]
    pub cost_per_unit: Option<u64>,
    /// Domains served (empty = all)
    #[serde(default)]
    pub domains: Vec<String>,
}

impl RouteToml {
    fn to_route(&self) -> Result<Route, ConfigError> {
        let path_kind = self
            .path
            .parse::<PathKind>()
            .map_err(ConfigError::ValidationError)?;
        if self.provider.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "route provider must not be empty".to_string(),
            ));
        }
        let defaults = RouteCapabilities::default();
        Ok(Route {
            path_kind,
            provider_id: self.provider.trim().to_string(),
            capabilities: RouteCapabilities {
                supports_tools: self.supports_tools.unwrap_or(defaults.supports_tools),
                max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
                default_latency_ms: self
                    .default_latency_ms
                    .unwrap_or(defaults.default_latency_ms),
                cost_per_unit: self.cost_per_unit.unwrap_or(defaults.cost_per_unit),
                domains: self.domains.clone(),
            },
        })
    }
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardToml {
    /// Health settings
    pub health: HealthToml,
    /// Bandit settings
    pub bandit: BanditToml,
    /// SLA deadlines
    pub sla: SlaToml,
    /// Fallback settings
    pub fallback: FallbackToml,
    /// Router settings
    pub router: RouterToml,
    /// Route table
    pub routes: Vec<RouteToml>,
}

// =============================================================================
// Routing Settings
// =============================================================================

/// The hot-reloadable tuning surface of the router
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingSettings {
    /// Consecutive failures (inside the window) that open a circuit
    pub failure_threshold: u32,
    /// Sliding window for health accounting
    pub failure_window: Duration,
    /// Window success rate below which a circuit opens
    pub min_success_rate: f64,
    /// Samples needed before the success rate can trip
    pub min_window_samples: usize,
    /// Base time a circuit stays open
    pub cooldown_period: Duration,
    /// Cap for backed-off cooldowns
    pub max_cooldown: Duration,
    /// Half-open probe timeout
    pub probe_timeout: Duration,
    /// Per-priority SLA deadlines
    pub sla: SlaTable,
    /// Guaranteed share for under-tried routes
    pub exploration_floor: f64,
    /// Trials below which the floor applies
    pub min_trials: u64,
    /// Moving average decay for arm latency/cost
    pub ema_decay: f64,
    /// Substitute routes after the primary (0 or 1)
    pub max_hops: usize,
    /// SLA grace margin
    pub grace_margin: Duration,
    /// Minimum residual budget for a fallback attempt
    pub min_attempt_window: Duration,
    /// Route to open circuits when nothing else matches
    pub allow_degraded: bool,
    /// Decisions kept in the in-memory log
    pub decision_log_capacity: usize,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        let health = HealthConfig::default();
        let bandit = BanditConfig::default();
        let fallback = FallbackConfig::default();
        let router = RouterConfig::default();
        Self {
            failure_threshold: health.failure_threshold,
            failure_window: health.failure_window,
            min_success_rate: health.min_success_rate,
            min_window_samples: health.min_window_samples,
            cooldown_period: health.cooldown_period,
            max_cooldown: health.max_cooldown,
            probe_timeout: health.probe_timeout,
            sla: SlaTable::default(),
            exploration_floor: bandit.exploration_floor,
            min_trials: bandit.min_trials,
            ema_decay: bandit.ema_decay,
            max_hops: fallback.max_hops,
            grace_margin: fallback.grace_margin,
            min_attempt_window: fallback.min_attempt_window,
            allow_degraded: router.allow_degraded,
            decision_log_capacity: router.decision_log_capacity,
        }
    }
}

impl RoutingSettings {
    /// Check every value is in range
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.failure_threshold == 0 {
            return fail("failure_threshold must be at least 1");
        }
        if self.failure_window.is_zero() {
            return fail("failure_window must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return fail("min_success_rate must be within [0, 1]");
        }
        if self.min_window_samples == 0 {
            return fail("min_window_samples must be at least 1");
        }
        if self.cooldown_period.is_zero() {
            return fail("cooldown_period must be positive");
        }
        if self.cooldown_period > self.max_cooldown {
            return fail("cooldown_period must not exceed max_cooldown");
        }
        if self.probe_timeout.is_zero() {
            return fail("probe_timeout must be positive");
        }
        if self.sla.emergency.is_zero() || self.sla.critical.is_zero() || self.sla.standard.is_zero() {
            return fail("SLA deadlines must be positive");
        }
        if !(0.0..=0.5).contains(&self.exploration_floor) {
            return fail("exploration_floor must be within [0, 0.5]");
        }
        if !(self.ema_decay > 0.0 && self.ema_decay <= 1.0) {
            return fail("ema_decay must be within (0, 1]");
        }
        if self.max_hops > 1 {
            return fail("max_hops must be 0 or 1");
        }
        if self.decision_log_capacity == 0 {
            return fail("decision_log_capacity must be at least 1");
        }
        Ok(())
    }

    /// Health monitor settings
    #[must_use]
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            failure_threshold: self.failure_threshold,
            failure_window: self.failure_window,
            min_success_rate: self.min_success_rate,
            min_window_samples: self.min_window_samples,
            cooldown_period: self.cooldown_period,
            max_cooldown: self.max_cooldown,
            probe_timeout: self.probe_timeout,
            ..HealthConfig::default()
        }
    }

    /// Bandit settings
    #[must_use]
    pub fn bandit_config(&self) -> BanditConfig {
        BanditConfig {
            ema_decay: self.ema_decay,
            min_trials: self.min_trials,
            exploration_floor: self.exploration_floor,
        }
    }

    /// Fallback settings
    #[must_use]
    pub fn fallback_config(&self) -> FallbackConfig {
        FallbackConfig {
            max_hops: self.max_hops,
            grace_margin: self.grace_margin,
            min_attempt_window: self.min_attempt_window,
        }
    }

    /// Router settings
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            allow_degraded: self.allow_degraded,
            decision_log_capacity: self.decision_log_capacity,
        }
    }
}

// =============================================================================
// Loaded Configuration
// =============================================================================

/// Settings plus route table, with provenance
#[derive(Clone, Debug)]
pub struct SwitchyardConfig {
    /// Tunables
    pub settings: RoutingSettings,
    /// Routes to register at startup
    pub routes: Vec<Route>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for SwitchyardConfig {
    fn default() -> Self {
        Self {
            settings: RoutingSettings::default(),
            routes: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SwitchyardConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchyard/router.toml` or
/// `~/.config/switchyard/router.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchyard").join("router.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// or if the merged settings fail validation. A missing config file is not
/// an error (defaults are used).
pub fn load_config() -> Result<SwitchyardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the merged settings fail validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchyardConfig, ConfigError> {
    let mut config = SwitchyardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SwitchyardToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                routes = config.routes.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.settings.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut SwitchyardConfig, toml: &SwitchyardToml) -> Result<(), ConfigError> {
    let s = &mut config.settings;

    if let Some(v) = toml.health.failure_threshold {
        s.failure_threshold = v;
    }
    if let Some(v) = toml.health.failure_window_secs {
        s.failure_window = Duration::from_secs(v);
    }
    if let Some(v) = toml.health.min_success_rate {
        s.min_success_rate = v;
    }
    if let Some(v) = toml.health.min_window_samples {
        s.min_window_samples = v;
    }
    if let Some(v) = toml.health.cooldown_secs {
        s.cooldown_period = Duration::from_secs(v);
    }
    if let Some(v) = toml.health.max_cooldown_secs {
        s.max_cooldown = Duration::from_secs(v);
    }
    if let Some(v) = toml.health.probe_timeout_ms {
        s.probe_timeout = Duration::from_millis(v);
    }

    if let Some(v) = toml.bandit.exploration_floor {
        s.exploration_floor = v;
    }
    if let Some(v) = toml.bandit.min_trials {
        s.min_trials = v;
    }
    if let Some(v) = toml.bandit.ema_decay {
        s.ema_decay = v;
    }

    if let Some(v) = toml.sla.emergency_ms {
        s.sla.emergency = Duration::from_millis(v);
    }
    if let Some(v) = toml.sla.critical_ms {
        s.sla.critical = Duration::from_millis(v);
    }
    if let Some(v) = toml.sla.standard_ms {
        s.sla.standard = Duration::from_millis(v);
    }

    if let Some(v) = toml.fallback.max_hops {
        s.max_hops = v;
    }
    if let Some(v) = toml.fallback.grace_margin_ms {
        s.grace_margin = Duration::from_millis(v);
    }
    if let Some(v) = toml.fallback.min_attempt_window_ms {
        s.min_attempt_window = Duration::from_millis(v);
    }

    if let Some(v) = toml.router.allow_degraded {
        s.allow_degraded = v;
    }
    if let Some(v) = toml.router.decision_log_capacity {
        s.decision_log_capacity = v;
    }

    config.routes = toml
        .routes
        .iter()
        .map(RouteToml::to_route)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut SwitchyardConfig) {
    let before = config.settings.clone();
    let s = &mut config.settings;

    if let Some(v) = env_parse::<u32>("SWITCHYARD_FAILURE_THRESHOLD") {
        s.failure_threshold = v;
    }
    if let Some(v) = env_parse::<u64>("SWITCHYARD_FAILURE_WINDOW_SECS") {
        s.failure_window = Duration::from_secs(v);
    }
    if let Some(v) = env_parse::<f64>("SWITCHYARD_MIN_SUCCESS_RATE") {
        s.min_success_rate = v;
    }
    if let Some(v) = env_parse::<u64>("SWITCHYARD_COOLDOWN_SECS") {
        s.cooldown_period = Duration::from_secs(v);
    }
    if let Some(v) = env_parse::<u64>("SWITCHYARD_MAX_COOLDOWN_SECS") {
        s.max_cooldown = Duration::from_secs(v);
    }
    if let Some(v) = env_parse::<f64>("SWITCHYARD_EXPLORATION_FLOOR") {
        s.exploration_floor = v;
    }
    if let Some(v) = env_parse::<f64>("SWITCHYARD_EMA_DECAY") {
        s.ema_decay = v;
    }
    if let Some(v) = env_parse::<u64>("SWITCHYARD_SLA_EMERGENCY_MS") {
        s.sla.emergency = Duration::from_millis(v);
    }
    if let Some(v) = env_parse::<u64>("SWITCHYARD_SLA_CRITICAL_MS") {
        s.sla.critical = Duration::from_millis(v);
    }
    if let Some(v) = env_parse::<u64>("SWITCHYARD_SLA_STANDARD_MS") {
        s.sla.standard = Duration::from_millis(v);
    }
    if let Ok(raw) = std::env::var("SWITCHYARD_ALLOW_DEGRADED") {
        s.allow_degraded = raw != "0" && raw.to_lowercase() != "false";
    }

    if config.settings != before {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Explicit Overrides
// =============================================================================

/// Overrides supplied programmatically (highest priority)
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Failure threshold override
    pub failure_threshold: Option<u32>,
    /// Cooldown override
    pub cooldown_period: Option<Duration>,
    /// Minimum success rate override
    pub min_success_rate: Option<f64>,
    /// Exploration floor override
    pub exploration_floor: Option<f64>,
    /// EMA decay override
    pub ema_decay: Option<f64>,
    /// Degraded mode override
    pub allow_degraded: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold override
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set cooldown override
    #[must_use]
    pub fn with_cooldown_period(mut self, cooldown: Duration) -> Self {
        self.cooldown_period = Some(cooldown);
        self
    }

    /// Set minimum success rate override
    #[must_use]
    pub fn with_min_success_rate(mut self, rate: f64) -> Self {
        self.min_success_rate = Some(rate);
        self
    }

    /// Set exploration floor override
    #[must_use]
    pub fn with_exploration_floor(mut self, floor: f64) -> Self {
        self.exploration_floor = Some(floor);
        self
    }

    /// Set EMA decay override
    #[must_use]
    pub fn with_ema_decay(mut self, decay: f64) -> Self {
        self.ema_decay = Some(decay);
        self
    }

    /// Set degraded mode override
    #[must_use]
    pub fn with_allow_degraded(mut self, allow: bool) -> Self {
        self.allow_degraded = Some(allow);
        self
    }

    /// Apply overrides to a configuration and re-validate it
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if an override is out of range.
    pub fn apply(&self, config: &mut SwitchyardConfig) -> Result<(), ConfigError> {
        let before = config.settings.clone();
        let s = &mut config.settings;

        if let Some(v) = self.failure_threshold {
            s.failure_threshold = v;
        }
        if let Some(v) = self.cooldown_period {
            s.cooldown_period = v;
        }
        if let Some(v) = self.min_success_rate {
            s.min_success_rate = v;
        }
        if let Some(v) = self.exploration_floor {
            s.exploration_floor = v;
        }
        if let Some(v) = self.ema_decay {
            s.ema_decay = v;
        }
        if let Some(v) = self.allow_degraded {
            s.allow_degraded = v;
        }

        if config.settings != before {
            config.source = ConfigSource::Override;
        }
        config.settings.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
