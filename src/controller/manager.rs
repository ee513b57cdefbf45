//! Dispatch manager
//!
//! Runs one signal through the whole pipeline: discovery, eligibility,
//! allocation, concurrent publish and ack collection, fallback, then
//! bookkeeping (metrics, log record, status, tuning). Failures never abort
//! a dispatch; they end up in the returned [`DispatchResult`].

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::monitor::{Monitor, TracingMonitor};
use super::prediction::AvailabilityPredictor;
use super::status::{LastDispatch, StatusStore};
use super::tuner::AckTuner;
use crate::broker::Publisher;
use crate::discovery::FleetDiscovery;
use crate::dispatch::{
    Allocation, DispatchContext, Dispatcher, LpDispatcher, Participation, VehicleFilter,
    POWER_EPSILON,
};
use crate::events::{DispatchEvent, EventBus, StrategyStep};
use crate::fallback::FallbackStrategy;
use crate::metrics::MetricsSink;
use crate::repo::{LogRecord, LogStore};
use crate::domain::{DispatchResult, FailureKind, FlexibilitySignal, SignalKind, Vehicle};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DISCOVERY_DEADLINE: Duration = Duration::from_secs(1);
pub const DEFAULT_HISTORY_SIZE: usize = 50;
pub const MIN_PREDICTED_AVAILABILITY: f64 = 1e-3;
const MODULE_TAG: &str = "dispatch_manager";

/// What one per-vehicle unit of work reports back
#[derive(Debug)]
struct UnitOutcome {
    vehicle_id: String,
    acknowledged: bool,
    error: Option<FailureKind>,
    publish_failed: bool,
    latency: Duration,
}

pub struct DispatchManager {
    filter: VehicleFilter,
    dispatcher: RwLock<Arc<dyn Dispatcher>>,
    fallback: RwLock<Arc<dyn FallbackStrategy>>,
    publisher: Arc<dyn Publisher>,
    ack_timeout: Duration,
    participation: Arc<Participation>,
    market_price: RwLock<f64>,
    metrics: Option<Arc<dyn MetricsSink>>,
    events: Option<Arc<EventBus<DispatchEvent>>>,
    discovery: Option<Arc<dyn FleetDiscovery>>,
    monitor: Arc<dyn Monitor>,
    tuner: Option<Arc<AckTuner>>,
    predictor: Option<Arc<dyn AvailabilityPredictor>>,
    log_store: Option<Arc<dyn LogStore>>,
    status_store: Option<Arc<dyn StatusStore>>,
    history: Mutex<VecDeque<DispatchResult>>,
    history_size: usize,
    lp_first: HashSet<SignalKind>,
    lp: Option<Arc<LpDispatcher>>,
    track_participation: bool,
    republish_fallback: bool,
    serial: tokio::sync::Mutex<()>,
}

impl DispatchManager {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        fallback: Arc<dyn FallbackStrategy>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            filter: VehicleFilter,
            dispatcher: RwLock::new(dispatcher),
            fallback: RwLock::new(fallback),
            publisher,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            participation: Arc::new(Participation::new()),
            market_price: RwLock::new(0.0),
            metrics: None,
            events: None,
            discovery: None,
            monitor: Arc::new(TracingMonitor),
            tuner: None,
            predictor: None,
            log_store: None,
            status_store: None,
            history: Mutex::new(VecDeque::new()),
            history_size: DEFAULT_HISTORY_SIZE,
            lp_first: HashSet::new(),
            lp: None,
            track_participation: false,
            republish_fallback: false,
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Zero falls back to the 5 s default
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = if timeout.is_zero() {
            DEFAULT_ACK_TIMEOUT
        } else {
            timeout
        };
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus<DispatchEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn FleetDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_tuner(mut self, tuner: Arc<AckTuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn AvailabilityPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn with_log_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.log_store = Some(store);
        self
    }

    pub fn with_status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size.max(1);
        self
    }

    /// Solve these signal kinds with strict LP first, smart on failure
    pub fn with_lp_first(
        mut self,
        lp: Arc<LpDispatcher>,
        kinds: impl IntoIterator<Item = SignalKind>,
    ) -> Self {
        self.lp = Some(lp);
        self.lp_first = kinds.into_iter().collect();
        self
    }

    pub fn with_participation(mut self, participation: Arc<Participation>, track: bool) -> Self {
        self.participation = participation;
        self.track_participation = track;
        self
    }

    /// Also publish changed fallback setpoints, without waiting for acks
    pub fn with_republish_fallback(mut self, enabled: bool) -> Self {
        self.republish_fallback = enabled;
        self
    }

    /// Dispatcher used for lp-first signal kinds
    pub fn lp_dispatcher(&self) -> Option<&LpDispatcher> {
        self.lp.as_deref()
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        info!(strategy = dispatcher.name(), "dispatcher replaced");
        *self.dispatcher.write() = dispatcher;
    }

    pub fn set_fallback(&self, fallback: Arc<dyn FallbackStrategy>) {
        info!(fallback = fallback.name(), "fallback replaced");
        *self.fallback.write() = fallback;
    }

    pub fn dispatcher_name(&self) -> &'static str {
        self.dispatcher.read().name()
    }

    pub fn set_market_price(&self, price: f64) {
        *self.market_price.write() = price;
    }

    pub fn market_price(&self) -> f64 {
        *self.market_price.read()
    }

    pub fn participation(&self) -> &Arc<Participation> {
        &self.participation
    }

    pub fn events(&self) -> Option<&Arc<EventBus<DispatchEvent>>> {
        self.events.as_ref()
    }

    pub fn log_store(&self) -> Option<&Arc<dyn LogStore>> {
        self.log_store.as_ref()
    }

    pub fn status_store(&self) -> Option<&Arc<dyn StatusStore>> {
        self.status_store.as_ref()
    }

    /// Most recent results, oldest first
    pub fn history(&self) -> Vec<DispatchResult> {
        self.history.lock().iter().cloned().collect()
    }

    /// Dispatch signals from `signals` until cancelled or the channel closes.
    /// A dispatch in progress always runs to completion.
    pub async fn run(&self, mut signals: mpsc::Receiver<FlexibilitySignal>, cancel: CancellationToken) {
        info!("dispatch loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = signals.recv() => match next {
                    Some(signal) => {
                        self.dispatch(signal, Vec::new()).await;
                    }
                    None => break,
                },
            }
        }
        info!("dispatch loop stopped");
    }

    /// Release discovery, the event bus and the log store
    pub async fn close(&self) {
        if let Some(discovery) = &self.discovery {
            discovery.close().await;
        }
        if let Some(events) = &self.events {
            events.close();
        }
        if let Some(store) = &self.log_store {
            if let Err(e) = store.close().await {
                warn!(error = %e, "closing log store failed");
            }
        }
    }

    pub async fn dispatch(&self, signal: FlexibilitySignal, vehicles: Vec<Vehicle>) -> DispatchResult {
        let _one_at_a_time = self.serial.lock().await;
        let started = Instant::now();
        let market_price = self.market_price();
        let mut result = DispatchResult::new(signal.clone(), market_price);

        let vehicles = if vehicles.is_empty() {
            self.discover().await
        } else {
            vehicles
        };
        let mut fleet = self.filter.filter(&vehicles, &signal);
        self.apply_predictions(&mut fleet);

        self.emit(DispatchEvent::Signal {
            signal: signal.clone(),
            eligible: fleet.len(),
        });

        let ctx = DispatchContext::new(signal.clone(), market_price, self.participation.clone());
        let allocation = self.allocate(&fleet, &ctx);
        result.assignments = allocation.assignments;
        if let Some(scores) = allocation.scores {
            result.scores = scores;
        }

        let latencies = self.publish_all(&mut result).await;

        let failed: Vec<String> = result
            .assignments
            .keys()
            .filter(|id| !result.acknowledged.get(*id).copied().unwrap_or(false))
            .cloned()
            .collect();
        if !failed.is_empty() {
            let fallback = self.fallback.read().clone();
            result.fallback_assignments =
                fallback.reallocate(&fleet, &failed, &result.assignments, &signal);
            debug!(fallback = fallback.name(), failed = failed.len(), "fallback applied");
            if self.republish_fallback {
                self.republish(&result, &failed);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(&result);
            metrics.record_latencies(&latencies);
        }

        let selected: Vec<String> = fleet.iter().map(|v| v.id.clone()).collect();
        self.persist(&result, &selected).await;
        self.record_status(&result, &selected).await;
        self.learn(&result);

        info!(
            signal = %signal.kind,
            target_kw = signal.power_kw,
            eligible = fleet.len(),
            assigned = result.assignments.len(),
            acked = result.acked_count(),
            failed = failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatch complete"
        );
        result
    }

    async fn discover(&self) -> Vec<Vehicle> {
        let Some(discovery) = &self.discovery else {
            return Vec::new();
        };
        match tokio::time::timeout(DISCOVERY_DEADLINE, discovery.discover()).await {
            Ok(Ok(vehicles)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_fleet_size(vehicles.len());
                }
                vehicles
            }
            Ok(Err(e)) => {
                warn!(error = %e, "discovery failed, dispatching without vehicles");
                Vec::new()
            }
            Err(_) => {
                warn!("discovery deadline exceeded, dispatching without vehicles");
                Vec::new()
            }
        }
    }

    fn apply_predictions(&self, fleet: &mut [Vehicle]) {
        let Some(predictor) = &self.predictor else {
            return;
        };
        for vehicle in fleet {
            if let Some(rate) = predictor.predict(vehicle) {
                // zero reads as "unknown" downstream, so a bad record must stay above it
                let known = if vehicle.availability_prob > 0.0 {
                    vehicle.availability_prob
                } else {
                    1.0
                };
                vehicle.availability_prob = (known * rate).clamp(MIN_PREDICTED_AVAILABILITY, 1.0);
            }
        }
    }

    fn allocate(&self, fleet: &[Vehicle], ctx: &DispatchContext) -> Allocation {
        if ctx.signal.target_kw() <= POWER_EPSILON || fleet.is_empty() {
            return Allocation::empty();
        }

        let kind = ctx.signal.kind;
        if let Some(lp) = self.lp.as_ref().filter(|_| self.lp_first.contains(&kind)) {
            self.emit_step(StrategyStep::LpAttempt, kind, None);
            match lp.dispatch_strict(fleet, ctx) {
                Ok(allocation) => return allocation,
                Err(e) => {
                    warn!(signal = %kind, error = %e, "strict lp failed, falling back to smart");
                    self.emit_step(StrategyStep::LpFailure, kind, Some(e.to_string()));
                    let allocation = lp.smart().dispatch(fleet, ctx);
                    self.emit_step(StrategyStep::SmartFallback, kind, None);
                    return allocation;
                }
            }
        }

        let dispatcher = self.dispatcher.read().clone();
        dispatcher.dispatch(fleet, ctx)
    }

    /// Send every order and wait for its ack, one task per vehicle. Outcomes
    /// are merged into `result` once every task has finished.
    async fn publish_all(&self, result: &mut DispatchResult) -> Vec<(String, Duration)> {
        let mut units = JoinSet::new();
        for (vehicle_id, power_kw) in &result.assignments {
            let publisher = self.publisher.clone();
            let events = self.events.clone();
            let timeout = self.ack_timeout;
            let vehicle_id = vehicle_id.clone();
            let power_kw = *power_kw;
            units.spawn(async move {
                let outcome = publish_one(publisher.as_ref(), vehicle_id, power_kw, timeout).await;
                if let Some(bus) = events {
                    let _ = bus.publish(DispatchEvent::Ack {
                        vehicle_id: outcome.vehicle_id.clone(),
                        power_kw,
                        acknowledged: outcome.acknowledged,
                        error: outcome.error.clone(),
                        latency_ms: outcome.latency.as_secs_f64() * 1000.0,
                    });
                }
                outcome
            });
        }

        let mut latencies = Vec::with_capacity(result.assignments.len());
        while let Some(joined) = units.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.monitor
                        .capture_exception(&e, &[("module", MODULE_TAG.to_string())]);
                    continue;
                }
            };
            if outcome.publish_failed {
                if let Some(metrics) = &self.metrics {
                    metrics.record_publish_failure(&outcome.vehicle_id);
                }
            }
            if let Some(error) = &outcome.error {
                if !error.is_timeout() {
                    self.monitor.capture_exception(
                        error,
                        &[
                            ("module", MODULE_TAG.to_string()),
                            ("vehicle_id", outcome.vehicle_id.clone()),
                        ],
                    );
                }
                result.errors.insert(outcome.vehicle_id.clone(), error.clone());
            }
            result
                .acknowledged
                .insert(outcome.vehicle_id.clone(), outcome.acknowledged);
            latencies.push((outcome.vehicle_id, outcome.latency));
        }

        // a unit that died never reported; count it as failed
        let missing: Vec<String> = result
            .assignments
            .keys()
            .filter(|id| !result.acknowledged.contains_key(*id))
            .cloned()
            .collect();
        for id in missing {
            let error = FailureKind::AckFailed("dispatch worker aborted".into());
            self.monitor.capture_exception(
                &error,
                &[("module", MODULE_TAG.to_string()), ("vehicle_id", id.clone())],
            );
            result.errors.insert(id.clone(), error);
            result.acknowledged.insert(id, false);
        }
        latencies
    }

    fn republish(&self, result: &DispatchResult, failed: &[String]) {
        for (vehicle_id, power_kw) in &result.fallback_assignments {
            let before = result.assignments.get(vehicle_id).copied().unwrap_or(0.0);
            if failed.contains(vehicle_id)
                || power_kw.abs() <= POWER_EPSILON
                || (power_kw - before).abs() <= POWER_EPSILON
            {
                continue;
            }
            let publisher = self.publisher.clone();
            let vehicle_id = vehicle_id.clone();
            let power_kw = *power_kw;
            tokio::spawn(async move {
                if let Err(e) = publisher.send_setpoint(&vehicle_id, power_kw).await {
                    warn!(vehicle_id, error = %e, "fallback setpoint not published");
                }
            });
        }
    }

    async fn persist(&self, result: &DispatchResult, selected: &[String]) {
        let Some(store) = &self.log_store else {
            return;
        };
        let record = LogRecord::from_result(result, selected.to_vec(), Utc::now());
        if let Err(e) = store.append(&record).await {
            self.monitor.capture_exception(
                &e,
                &[("module", MODULE_TAG.to_string()), ("stage", "log_store".to_string())],
            );
        }
    }

    async fn record_status(&self, result: &DispatchResult, selected: &[String]) {
        let Some(store) = &self.status_store else {
            return;
        };
        let summary = LastDispatch {
            signal_kind: result.signal.kind,
            target_power_kw: result.signal.power_kw,
            timestamp: result.signal.timestamp,
            selected: selected.to_vec(),
        };
        join_all(
            result
                .assignments
                .keys()
                .map(|vehicle_id| store.record_last_dispatch(vehicle_id, summary.clone())),
        )
        .await;
    }

    fn learn(&self, result: &DispatchResult) {
        {
            let mut history = self.history.lock();
            history.push_back(result.clone());
            while history.len() > self.history_size {
                history.pop_front();
            }
            if let Some(tuner) = &self.tuner {
                tuner.tune(history.make_contiguous());
            }
        }
        if let Some(predictor) = &self.predictor {
            predictor.observe(result);
        }
        if self.track_participation {
            for (id, acked) in &result.acknowledged {
                if *acked {
                    self.participation.increment(id, 1.0);
                }
            }
        }
    }

    fn emit(&self, event: DispatchEvent) {
        if let Some(bus) = &self.events {
            if bus.publish(event).is_err() {
                debug!("event bus closed, event dropped");
            }
        }
    }

    fn emit_step(&self, step: StrategyStep, signal_kind: SignalKind, detail: Option<String>) {
        self.emit(DispatchEvent::Strategy {
            step,
            signal_kind,
            detail,
        });
    }
}

async fn publish_one(
    publisher: &dyn Publisher,
    vehicle_id: String,
    power_kw: f64,
    timeout: Duration,
) -> UnitOutcome {
    let started = Instant::now();
    let (acknowledged, error, publish_failed) = match publisher.send_order(&vehicle_id, power_kw).await {
        Err(e) => (false, Some(FailureKind::PublishFailed(e.to_string())), true),
        Ok(command) => match publisher.wait_for_ack(&command, timeout).await {
            Ok(true) => (true, None, false),
            Ok(false) => (false, Some(FailureKind::AckFailed("rejected".into())), false),
            Err(e) if e.is_timeout() => (false, Some(FailureKind::AckTimeout), false),
            Err(e) => (false, Some(FailureKind::AckFailed(e.to_string())), false),
        },
    };
    UnitOutcome {
        vehicle_id,
        acknowledged,
        error,
        publish_failed,
        latency: started.elapsed(),
    }
}
