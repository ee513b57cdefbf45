//! Order publishing with ack correlation
//!
//! Each order gets a fresh command id. A background task listens on the ack
//! topic and completes the one-shot channel registered for that id, so a
//! waiter never polls and an ack that beats the waiter is not lost.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{vehicle_from_topic, BrokerError, BrokerMessage, BrokerTransport};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("transport failed after {attempts} attempts: {reason}")]
    Transport { attempts: u32, reason: String },
    /// No ack before the deadline
    #[error("ack timeout")]
    AckTimeout,
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("publisher closed")]
    Closed,
}

impl PublishError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PublishError::AckTimeout)
    }
}

/// Opaque id correlating an order with its ack
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sends setpoints to vehicles and waits for them to confirm
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn send_order(&self, vehicle_id: &str, power_kw: f64) -> Result<CommandId, PublishError>;

    /// Publish a setpoint nobody will wait on. No ack slot is kept for it.
    async fn send_setpoint(&self, vehicle_id: &str, power_kw: f64) -> Result<CommandId, PublishError>;

    /// `Ok(true)` on ack, `Ok(false)` on an explicit rejection,
    /// [`PublishError::AckTimeout`] when `timeout` elapses first.
    async fn wait_for_ack(&self, command: &CommandId, timeout: Duration)
        -> Result<bool, PublishError>;
}

/// Wire format of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command_id: CommandId,
    pub vehicle_id: String,
    pub power_kw: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

fn accepted_by_default() -> bool {
    true
}

/// Wire format of an ack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub command_id: CommandId,
    #[serde(default = "accepted_by_default")]
    pub accepted: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    100
}

fn default_command_topic() -> String {
    "vehicle/{id}/command".to_string()
}

fn default_ack_topic() -> String {
    "vehicle/+/ack".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay, doubled on each further retry
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// `{id}` is replaced by the vehicle id
    #[serde(default = "default_command_topic")]
    pub command_topic: String,
    #[serde(default = "default_ack_topic")]
    pub ack_topic: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            command_topic: default_command_topic(),
            ack_topic: default_ack_topic(),
        }
    }
}

impl PublisherConfig {
    pub fn command_topic_for(&self, vehicle_id: &str) -> String {
        self.command_topic.replace("{id}", vehicle_id)
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1u64 << retry.min(16)))
    }
}

#[derive(Default)]
struct PendingAcks {
    senders: HashMap<CommandId, oneshot::Sender<bool>>,
    receivers: HashMap<CommandId, oneshot::Receiver<bool>>,
}

pub struct BrokerPublisher {
    transport: Arc<dyn BrokerTransport>,
    config: PublisherConfig,
    pending: Arc<Mutex<PendingAcks>>,
    listener: JoinHandle<()>,
}

impl BrokerPublisher {
    /// Subscribe to the ack topic and start correlating.
    pub async fn connect(
        transport: Arc<dyn BrokerTransport>,
        config: PublisherConfig,
    ) -> Result<Self, BrokerError> {
        let acks = transport.subscribe(&config.ack_topic).await?;
        let pending = Arc::new(Mutex::new(PendingAcks::default()));
        let listener = tokio::spawn(listen_for_acks(acks, pending.clone()));
        tracing::info!(ack_topic = %config.ack_topic, "publisher listening for acks");
        Ok(Self {
            transport,
            config,
            pending,
            listener,
        })
    }

    /// Orders still holding an ack slot: not yet waited on, or waited on
    /// and not yet acked
    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock();
        let unclaimed = pending
            .senders
            .keys()
            .filter(|id| !pending.receivers.contains_key(*id))
            .count();
        pending.receivers.len() + unclaimed
    }

    pub fn close(&self) {
        self.listener.abort();
    }

    fn forget(&self, command: &CommandId) {
        let mut pending = self.pending.lock();
        pending.senders.remove(command);
        pending.receivers.remove(command);
    }

    fn encode_order(
        &self,
        vehicle_id: &str,
        power_kw: f64,
    ) -> Result<(CommandId, String, Vec<u8>), PublishError> {
        if self.listener.is_finished() {
            return Err(PublishError::Closed);
        }
        let command_id = CommandId::new();
        let payload = CommandPayload {
            command_id: command_id.clone(),
            vehicle_id: vehicle_id.to_string(),
            power_kw,
            timestamp: Utc::now().timestamp_millis(),
        };
        let bytes = serde_json::to_vec(&payload).map_err(|e| PublishError::Encode(e.to_string()))?;
        Ok((command_id, self.config.command_topic_for(vehicle_id), bytes))
    }

    async fn publish_with_retry(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let attempts = self.config.max_retries + 1;
        let mut retry = 0;
        loop {
            match self.transport.publish(topic, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if retry + 1 >= attempts => {
                    return Err(PublishError::Transport {
                        attempts,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.config.backoff(retry);
                    tracing::warn!(
                        topic,
                        attempt = retry + 1,
                        attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

impl Drop for BrokerPublisher {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen_for_acks(
    mut acks: mpsc::Receiver<BrokerMessage>,
    pending: Arc<Mutex<PendingAcks>>,
) {
    while let Some(message) = acks.recv().await {
        let ack: AckPayload = match serde_json::from_slice(&message.payload) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "dropping malformed ack");
                continue;
            }
        };
        let sender = pending.lock().senders.remove(&ack.command_id);
        match sender {
            Some(tx) => {
                // receiver gone means the waiter already timed out
                let _ = tx.send(ack.accepted);
            }
            None => tracing::debug!(
                command_id = %ack.command_id,
                vehicle_id = vehicle_from_topic(&message.topic).unwrap_or("?"),
                "ack for unknown command"
            ),
        }
    }
    tracing::debug!("ack subscription ended");
}

#[async_trait]
impl Publisher for BrokerPublisher {
    async fn send_order(&self, vehicle_id: &str, power_kw: f64) -> Result<CommandId, PublishError> {
        let (command_id, topic, bytes) = self.encode_order(vehicle_id, power_kw)?;

        // register before publishing so an immediate ack finds its slot
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            pending.senders.insert(command_id.clone(), tx);
            pending.receivers.insert(command_id.clone(), rx);
        }

        if let Err(e) = self.publish_with_retry(&topic, bytes).await {
            self.forget(&command_id);
            return Err(e);
        }
        tracing::debug!(vehicle_id, power_kw, command_id = %command_id, "order published");
        Ok(command_id)
    }

    async fn send_setpoint(&self, vehicle_id: &str, power_kw: f64) -> Result<CommandId, PublishError> {
        let (command_id, topic, bytes) = self.encode_order(vehicle_id, power_kw)?;
        self.publish_with_retry(&topic, bytes).await?;
        tracing::debug!(vehicle_id, power_kw, command_id = %command_id, "setpoint published");
        Ok(command_id)
    }

    async fn wait_for_ack(
        &self,
        command: &CommandId,
        timeout: Duration,
    ) -> Result<bool, PublishError> {
        let rx = self
            .pending
            .lock()
            .receivers
            .remove(command)
            .ok_or_else(|| PublishError::UnknownCommand(command.to_string()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(accepted)) => Ok(accepted),
            Ok(Err(_)) => Err(PublishError::Closed),
            Err(_) => {
                self.pending.lock().senders.remove(command);
                Err(PublishError::AckTimeout)
            }
        }
    }
}
