pub mod manager;
pub mod monitor;
pub mod prediction;
pub mod status;
pub mod tuner;

pub use manager::DispatchManager;
pub use monitor::{Monitor, TracingMonitor};
pub use prediction::{AckRatePredictor, AvailabilityPredictor};
pub use status::{InMemoryStatusStore, LastDispatch, StatusStore};
pub use tuner::{AckTuner, TunerConfig};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerPublisher, BrokerTransport, MemoryBroker};
use crate::config::Config;
use crate::discovery::BrokerDiscovery;
use crate::dispatch::{
    decode_params, DispatcherRegistry, LpDispatcher, Participation, RegistryError, SegmentedConfig,
    SmartConfig, SmartDispatcher, StrategySpec,
};
use crate::domain::FlexibilitySignal;
use crate::events::{DispatchEvent, EventBus};
use crate::fallback::FallbackRegistry;
use crate::metrics::PrometheusMetrics;
use crate::repo::open_log_store;
use crate::simulation::{self, SimulatedFleet};

const SIGNAL_QUEUE: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub manager: Arc<DispatchManager>,
    pub registry: Registry,
    pub fleet: Option<Arc<SimulatedFleet>>,
    pub signals: mpsc::Sender<FlexibilitySignal>,
    pub cancel: CancellationToken,
    signal_rx: Arc<Mutex<Option<mpsc::Receiver<FlexibilitySignal>>>>,
}

impl AppState {
    /// Wire transport, fleet, publisher, strategies, stores and metrics
    /// from configuration.
    pub async fn new(cfg: Config) -> Result<Self> {
        let transport: Arc<dyn BrokerTransport> = Arc::new(MemoryBroker::new());
        let publisher_cfg = cfg.publisher_config();

        let fleet = if cfg.simulation.enabled {
            let vehicles = simulation::generate_fleet(&cfg.simulation);
            let fleet = SimulatedFleet::new(transport.clone(), cfg.simulation.clone(), vehicles);
            fleet
                .start(&publisher_cfg, &cfg.discovery)
                .await
                .context("starting simulated fleet")?;
            Some(fleet)
        } else {
            None
        };

        let publisher = BrokerPublisher::connect(transport.clone(), publisher_cfg)
            .await
            .context("connecting publisher")?;

        let dispatcher = DispatcherRegistry::default()
            .create(&cfg.dispatch.strategy)
            .context("dispatch strategy")?;
        let fallback = FallbackRegistry::default()
            .create(&cfg.dispatch.fallback)
            .context("fallback strategy")?;

        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(&registry).context("registering metrics")?;
        let events = Arc::new(EventBus::new());
        let participation = Arc::new(Participation::new());

        let mut manager = DispatchManager::new(dispatcher.clone(), fallback, Arc::new(publisher))
            .with_ack_timeout(cfg.dispatch.ack_timeout())
            .with_history_size(cfg.dispatch.history_size)
            .with_metrics(Arc::new(metrics))
            .with_events(events)
            .with_status_store(Arc::new(InMemoryStatusStore::new()))
            .with_participation(participation, cfg.dispatch.track_participation)
            .with_republish_fallback(cfg.dispatch.republish_fallback);

        if let Some(store) = open_log_store(&cfg.log_store).await? {
            manager = manager.with_log_store(store);
        }
        if cfg.discovery.enabled {
            manager = manager.with_discovery(Arc::new(BrokerDiscovery::new(
                transport.clone(),
                cfg.discovery.clone(),
            )));
        } else if let Some(fleet) = &fleet {
            manager = manager.with_discovery(fleet.clone());
        }
        if cfg.dispatch.predict_availability {
            manager = manager.with_predictor(Arc::new(AckRatePredictor::default()));
        }

        let weights = dispatcher.tunable_weights();
        if cfg.tuner.enabled {
            match &weights {
                Some(w) => manager = manager.with_tuner(Arc::new(AckTuner::new(cfg.tuner.clone(), w.clone()))),
                None => info!(strategy = dispatcher.name(), "strategy has no tunable weights, tuner off"),
            }
        }
        if !cfg.dispatch.lp_first.is_empty() {
            // share the tuned weights so both paths score alike
            let smart_cfg = smart_config_for(&cfg.dispatch.strategy).context("lp-first parameters")?;
            let lp = match weights {
                Some(w) => LpDispatcher::from_smart(SmartDispatcher::with_shared_weights(smart_cfg, w)),
                None => LpDispatcher::new(smart_cfg),
            };
            manager = manager.with_lp_first(Arc::new(lp), cfg.dispatch.lp_first.iter().copied());
        }

        manager.set_market_price(cfg.dispatch.market_price);

        info!(
            strategy = manager.dispatcher_name(),
            fallback = %cfg.dispatch.fallback.kind,
            simulated = fleet.is_some(),
            discovery = cfg.discovery.enabled,
            "dispatch manager ready"
        );

        let (signals, signal_rx) = mpsc::channel(SIGNAL_QUEUE);
        Ok(Self {
            cfg: Arc::new(cfg),
            manager: Arc::new(manager),
            registry,
            fleet,
            signals,
            cancel: CancellationToken::new(),
            signal_rx: Arc::new(Mutex::new(Some(signal_rx))),
        })
    }

    /// Stop background work and release the manager's resources
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.manager.close().await;
        if let Some(fleet) = &self.fleet {
            fleet.stop();
        }
        info!("controller shut down");
    }
}

/// Rounds and SoC limits the configured strategy runs with, so the
/// lp-first path and its smart fallback behave like the primary dispatcher
fn smart_config_for(spec: &StrategySpec) -> Result<SmartConfig, RegistryError> {
    match spec.kind.as_str() {
        "smart" | "lp" => decode_params(&spec.kind, spec.params.clone()),
        "segmented" => {
            decode_params::<SegmentedConfig>(&spec.kind, spec.params.clone()).map(|c| c.base)
        }
        _ => Ok(SmartConfig::default()),
    }
}

/// Start the dispatch loop, the event logger and the signal generator.
/// Calling it a second time only starts the event logger again.
pub fn spawn_controller_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    match state.signal_rx.lock().take() {
        Some(rx) => {
            let manager = state.manager.clone();
            let cancel = state.cancel.clone();
            handles.push(tokio::spawn(async move { manager.run(rx, cancel).await }));
        }
        None => warn!("dispatch loop already running"),
    }

    if let Some(bus) = state.manager.events() {
        let mut subscription = bus.subscribe();
        let cancel = state.cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => log_event(&event),
                        None => break,
                    },
                }
            }
        }));
    }

    if state.cfg.simulation.enabled && state.cfg.simulation.signal_interval_secs > 0 {
        handles.push(tokio::spawn(simulation::run_signal_generator(
            state.cfg.simulation.clone(),
            state.signals.clone(),
            state.cancel.clone(),
        )));
    }

    handles
}

fn log_event(event: &DispatchEvent) {
    match event {
        DispatchEvent::Signal { signal, eligible } => {
            debug!(signal = %signal.kind, power_kw = signal.power_kw, eligible, "signal event")
        }
        DispatchEvent::Ack {
            vehicle_id,
            acknowledged,
            latency_ms,
            ..
        } => debug!(vehicle_id = %vehicle_id, acknowledged, latency_ms, "ack event"),
        DispatchEvent::Strategy {
            step,
            signal_kind,
            detail,
        } => info!(step = %step, signal = %signal_kind, detail = detail.as_deref(), "strategy event"),
    }
}
