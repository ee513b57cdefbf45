use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::broker::PublisherConfig;
use crate::controller::TunerConfig;
use crate::discovery::DiscoveryConfig;
use crate::dispatch::StrategySpec;
use crate::domain::SignalKind;
use crate::repo::LogStoreConfig;
use crate::simulation::SimulationConfig;

pub const DEFAULT_CONFIG_FILE: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "V2G__";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub publisher: PublisherSection,
    pub broker: BrokerConfig,
    pub discovery: DiscoveryConfig,
    pub log_store: LogStoreConfig,
    pub tuner: TunerConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub strategy: StrategySpec,
    pub fallback: StrategySpec,
    pub ack_timeout_ms: u64,
    pub history_size: usize,
    /// Signal kinds solved with strict LP before the smart heuristic
    pub lp_first: Vec<SignalKind>,
    pub market_price: f64,
    pub track_participation: bool,
    /// Learn per-vehicle ack rates and scale availability with them
    pub predict_availability: bool,
    pub republish_fallback: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            strategy: StrategySpec::named("smart"),
            fallback: StrategySpec::named("balanced"),
            ack_timeout_ms: 5_000,
            history_size: 50,
            lp_first: Vec::new(),
            market_price: 0.0,
            track_participation: false,
            predict_availability: false,
            republish_fallback: false,
        }
    }
}

impl DispatchConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
}

impl Default for PublisherSection {
    fn default() -> Self {
        let base = PublisherConfig::default();
        Self {
            max_retries: base.max_retries,
            base_backoff_ms: base.base_backoff_ms,
        }
    }
}

/// Topic templates; `{id}` in the command topic is the vehicle id
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub command_topic: String,
    pub ack_topic: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let base = PublisherConfig::default();
        Self {
            command_topic: base.command_topic,
            ack_topic: base.ack_topic,
        }
    }
}

impl Config {
    /// `.env`, then `config/default.toml`, then `V2G__*` variables
    /// (`V2G__DISPATCH__ACK_TIMEOUT_MS=2000`).
    pub fn load() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "could not read .env");
            }
        }
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        figment.extract().context("invalid configuration")
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            max_retries: self.publisher.max_retries,
            base_backoff_ms: self.publisher.base_backoff_ms,
            command_topic: self.broker.command_topic.clone(),
            ack_topic: self.broker.ack_topic.clone(),
        }
    }
}
