//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use config::{Config, ConfigError, Environment as EnvSource, File};
use keel_core::Environment;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Venue endpoints and credentials.
#[derive(Clone, Debug, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_testnet_ws_url")]
    pub testnet_ws_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_environment")]
    pub environment: Environment,
}

impl ExchangeConfig {
    /// Endpoint for the configured environment.
    pub fn endpoint(&self) -> &str {
        match self.environment {
            Environment::Production => &self.ws_url,
            Environment::Testnet => &self.testnet_ws_url,
        }
    }
}

/// Connection resilience tuning.
#[derive(Clone, Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

impl TransportConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn initial_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

/// Bounds on the bracket placement protocol's polling steps.
#[derive(Clone, Debug, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_fill_poll_attempts")]
    pub fill_poll_attempts: u32,
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,
    #[serde(default = "default_position_confirm_attempts")]
    pub position_confirm_attempts: u32,
    #[serde(default = "default_position_confirm_interval_ms")]
    pub position_confirm_interval_ms: u64,
    #[serde(default = "default_cancel_verify_attempts")]
    pub cancel_verify_attempts: u32,
}

impl ExecutionConfig {
    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }

    pub fn position_confirm_interval(&self) -> Duration {
        Duration::from_millis(self.position_confirm_interval_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

impl ReconcileConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_default_risk_fraction")]
    pub default_risk_fraction: Decimal,
}

impl EngineConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            exchange: ExchangeConfig::default(),
            transport: TransportConfig::default(),
            execution: ExecutionConfig::default(),
            reconcile: ReconcileConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            testnet_ws_url: default_testnet_ws_url(),
            client_id: String::new(),
            client_secret: String::new(),
            environment: default_environment(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: default_backoff_jitter(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fill_poll_attempts: default_fill_poll_attempts(),
            fill_poll_interval_ms: default_fill_poll_interval_ms(),
            position_confirm_attempts: default_position_confirm_attempts(),
            position_confirm_interval_ms: default_position_confirm_interval_ms(),
            cancel_verify_attempts: default_cancel_verify_attempts(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            state_path: default_state_path(),
            default_risk_fraction: default_default_risk_fraction(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ws_url() -> String {
    "wss://www.deribit.com/ws/api/v2".to_string()
}

fn default_testnet_ws_url() -> String {
    "wss://test.deribit.com/ws/api/v2".to_string()
}

fn default_environment() -> Environment {
    Environment::Testnet
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    90
}

fn default_call_timeout_secs() -> u64 {
    10
}

fn default_initial_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_secs() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_fill_poll_attempts() -> u32 {
    30
}

fn default_fill_poll_interval_ms() -> u64 {
    500
}

fn default_position_confirm_attempts() -> u32 {
    5
}

fn default_position_confirm_interval_ms() -> u64 {
    500
}

fn default_cancel_verify_attempts() -> u32 {
    3
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./state/keel_state.json")
}

fn default_default_risk_fraction() -> Decimal {
    Decimal::new(1, 2) // 1%
}

impl AppConfig {
    /// Reject configurations that would break the transport invariants.
    pub fn validate(&self) -> Result<()> {
        if self.transport.heartbeat_interval_secs >= self.transport.stale_after_secs {
            bail!(
                "transport.heartbeat_interval_secs ({}) must be below stale_after_secs ({})",
                self.transport.heartbeat_interval_secs,
                self.transport.stale_after_secs
            );
        }
        if self.transport.backoff_multiplier < 1.0 {
            bail!("transport.backoff_multiplier must be at least 1.0");
        }
        if !(0.0..1.0).contains(&self.transport.backoff_jitter) {
            bail!("transport.backoff_jitter must be in [0, 1)");
        }
        if self.engine.default_risk_fraction <= Decimal::ZERO
            || self.engine.default_risk_fraction > Decimal::ONE
        {
            bail!("engine.default_risk_fraction must be in (0, 1]");
        }
        Ok(())
    }
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `KEEL_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    load_config_from(Path::new("config"), env)
}

/// Same as [`load_config`], but rooted at an explicit directory.
pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        EnvSource::with_prefix("KEEL")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    let app: AppConfig = config
        .try_deserialize()
        .map_err(|err: ConfigError| anyhow::Error::from(err))?;
    app.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.transport.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.transport.stale_after(), Duration::from_secs(90));
    }

    #[test]
    fn heartbeat_must_beat_staleness() {
        let mut config = AppConfig::default();
        config.transport.heartbeat_interval_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn layered_files_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "log_level = \"info\"\n[transport]\nheartbeat_interval_secs = 15\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("testnet.toml"),
            "[transport]\nheartbeat_interval_secs = 20\n",
        )
        .unwrap();

        let config = load_config_from(dir.path(), Some("testnet")).unwrap();
        assert_eq!(config.transport.heartbeat_interval_secs, 20);
        assert_eq!(config.transport.stale_after_secs, 90);
    }

    #[test]
    fn testnet_endpoint_selected_by_environment() {
        let exchange = ExchangeConfig::default();
        assert!(exchange.endpoint().contains("test.deribit.com"));
    }
}
