//! Simulated vehicles answering orders and discovery on a broker

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SimulationConfig;
use crate::broker::{AckPayload, BrokerError, BrokerMessage, BrokerTransport, CommandPayload, PublisherConfig};
use crate::discovery::{DiscoveryConfig, FleetDiscovery};
use crate::domain::Vehicle;

/// How a simulated vehicle reacts to an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleBehavior {
    Ack,
    /// Answers with `accepted: false`
    Reject,
    /// Never answers
    Silent,
}

pub struct SimulatedFleet {
    transport: Arc<dyn BrokerTransport>,
    config: SimulationConfig,
    vehicles: RwLock<Vec<Vehicle>>,
    overrides: RwLock<HashMap<String, VehicleBehavior>>,
    rng: Mutex<StdRng>,
    received: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SimulatedFleet {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        config: SimulationConfig,
        vehicles: Vec<Vehicle>,
    ) -> Arc<Self> {
        let rng = config.rng();
        Arc::new(Self {
            transport,
            config,
            vehicles: RwLock::new(vehicles),
            overrides: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
            received: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn vehicles(&self) -> Vec<Vehicle> {
        self.vehicles.read().clone()
    }

    pub fn set_vehicles(&self, vehicles: Vec<Vehicle>) {
        *self.vehicles.write() = vehicles;
    }

    /// Force a behaviour for one vehicle, overriding the failure rate
    pub fn set_behavior(&self, vehicle_id: &str, behavior: VehicleBehavior) {
        self.overrides.write().insert(vehicle_id.to_string(), behavior);
    }

    /// Orders seen so far, answered or not
    pub fn commands_received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Subscribe to orders (and discovery requests when enabled) and answer
    /// them in the background until [`SimulatedFleet::stop`].
    pub async fn start(
        self: &Arc<Self>,
        publisher: &PublisherConfig,
        discovery: &DiscoveryConfig,
    ) -> Result<(), BrokerError> {
        let command_filter = publisher.command_topic_for("+");
        let commands = self.transport.subscribe(&command_filter).await?;
        let fleet = self.clone();
        let ack_topic = publisher.ack_topic.clone();
        let handle = tokio::spawn(async move { fleet.answer_commands(commands, ack_topic).await });
        self.tasks.lock().push(handle);

        if discovery.enabled {
            let requests = self.transport.subscribe(&discovery.request_topic).await?;
            let fleet = self.clone();
            let discovery = discovery.clone();
            let handle =
                tokio::spawn(async move { fleet.answer_discovery(requests, discovery).await });
            self.tasks.lock().push(handle);
        }

        info!(
            vehicles = self.vehicles.read().len(),
            command_filter = %command_filter,
            "simulated fleet started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn behavior_for(&self, vehicle_id: &str) -> VehicleBehavior {
        if let Some(b) = self.overrides.read().get(vehicle_id) {
            return *b;
        }
        let rate = self.config.failure_rate.clamp(0.0, 1.0);
        if rate > 0.0 && self.rng.lock().gen_bool(rate) {
            VehicleBehavior::Silent
        } else {
            VehicleBehavior::Ack
        }
    }

    async fn answer_commands(self: Arc<Self>, mut commands: mpsc::Receiver<BrokerMessage>, ack_topic: String) {
        while let Some(message) = commands.recv().await {
            let command: CommandPayload = match serde_json::from_slice(&message.payload) {
                Ok(c) => c,
                Err(e) => {
                    warn!(topic = %message.topic, error = %e, "simulated vehicle got undecodable order");
                    continue;
                }
            };
            self.received.fetch_add(1, Ordering::SeqCst);

            let accepted = match self.behavior_for(&command.vehicle_id) {
                VehicleBehavior::Silent => {
                    debug!(vehicle_id = %command.vehicle_id, "simulated vehicle stays silent");
                    continue;
                }
                VehicleBehavior::Ack => true,
                VehicleBehavior::Reject => false,
            };

            let transport = self.transport.clone();
            let topic = ack_topic.replace('+', &command.vehicle_id);
            let latency = Duration::from_millis(self.config.ack_latency_ms);
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let ack = AckPayload {
                    command_id: command.command_id,
                    accepted,
                };
                let payload = match serde_json::to_vec(&ack) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "could not encode simulated ack");
                        return;
                    }
                };
                if let Err(e) = transport.publish(&topic, payload).await {
                    warn!(topic = %topic, error = %e, "simulated ack not delivered");
                }
            });
        }
    }

    async fn answer_discovery(self: Arc<Self>, mut requests: mpsc::Receiver<BrokerMessage>, config: DiscoveryConfig) {
        while let Some(message) = requests.recv().await {
            if message.payload != config.magic_word.as_bytes() {
                debug!(topic = %message.topic, "ignoring foreign discovery request");
                continue;
            }
            for vehicle in self.vehicles() {
                let topic = config.response_filter.replace('+', &vehicle.id);
                let payload = match serde_json::to_vec(&vehicle) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(vehicle_id = %vehicle.id, error = %e, "could not encode vehicle");
                        continue;
                    }
                };
                if let Err(e) = self.transport.publish(&topic, payload).await {
                    warn!(vehicle_id = %vehicle.id, error = %e, "discovery answer not delivered");
                }
            }
        }
    }
}

/// In-process discovery: the fleet reports itself directly
#[async_trait]
impl FleetDiscovery for SimulatedFleet {
    async fn discover(&self) -> anyhow::Result<Vec<Vehicle>> {
        Ok(self.vehicles())
    }

    async fn close(&self) {}
}

impl Drop for SimulatedFleet {
    fn drop(&mut self) {
        self.stop();
    }
}
