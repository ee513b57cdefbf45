//! Fleet discovery over the broker
//!
//! A discovery round broadcasts a magic word and gathers the vehicle records
//! that answer on the response topics until the collection window closes.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::broker::BrokerTransport;
use crate::domain::Vehicle;

#[async_trait]
pub trait FleetDiscovery: Send + Sync {
    /// Vehicles currently reachable
    async fn discover(&self) -> Result<Vec<Vehicle>>;

    /// Stop answering; later calls fail
    async fn close(&self);
}

fn default_request_topic() -> String {
    "fleet/discovery/request".to_string()
}

fn default_response_filter() -> String {
    "fleet/discovery/response/+".to_string()
}

fn default_magic_word() -> String {
    "V2G_DISCOVER".to_string()
}

fn default_collect_ms() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_request_topic")]
    pub request_topic: String,
    #[serde(default = "default_response_filter")]
    pub response_filter: String,
    #[serde(default = "default_magic_word")]
    pub magic_word: String,
    /// How long responses are collected
    #[serde(default = "default_collect_ms")]
    pub collect_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            request_topic: default_request_topic(),
            response_filter: default_response_filter(),
            magic_word: default_magic_word(),
            collect_ms: default_collect_ms(),
        }
    }
}

pub struct BrokerDiscovery {
    transport: Arc<dyn BrokerTransport>,
    config: DiscoveryConfig,
    closed: AtomicBool,
}

impl BrokerDiscovery {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: DiscoveryConfig) -> Self {
        Self {
            transport,
            config,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FleetDiscovery for BrokerDiscovery {
    async fn discover(&self) -> Result<Vec<Vehicle>> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("discovery closed");
        }

        let mut responses = self
            .transport
            .subscribe(&self.config.response_filter)
            .await
            .context("subscribing to discovery responses")?;
        self.transport
            .publish(
                &self.config.request_topic,
                self.config.magic_word.as_bytes().to_vec(),
            )
            .await
            .context("broadcasting discovery request")?;

        let deadline = Instant::now() + Duration::from_millis(self.config.collect_ms);
        let mut found: BTreeMap<String, Vehicle> = BTreeMap::new();
        while let Ok(Some(message)) = timeout_at(deadline, responses.recv()).await {
            match serde_json::from_slice::<Vehicle>(&message.payload) {
                Ok(vehicle) if vehicle.is_valid() => {
                    debug!(vehicle_id = %vehicle.id, "vehicle answered discovery");
                    found.insert(vehicle.id.clone(), vehicle);
                }
                Ok(vehicle) => {
                    warn!(vehicle_id = %vehicle.id, "ignoring vehicle with invalid battery data")
                }
                Err(e) => warn!(topic = %message.topic, error = %e, "undecodable discovery response"),
            }
        }

        info!(count = found.len(), "discovery round finished");
        Ok(found.into_values().collect())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
