//! # Fleet Simulation
//!
//! Stands in for real vehicles on a broker transport so the service can run
//! end to end without hardware:
//!
//! - **Fleet**: answers command orders with acks after a latency, can drop or
//!   refuse acks, and answers discovery broadcasts
//! - **Signals**: optional generator feeding random grid signals to the
//!   dispatch loop

pub mod fleet;

pub use fleet::{SimulatedFleet, VehicleBehavior};

use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{FlexibilitySignal, SignalKind, Vehicle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
    pub fleet_size: usize,
    pub ack_latency_ms: u64,
    /// Probability (0..1) that a vehicle never answers an order
    pub failure_rate: f64,
    /// Random seed for reproducibility
    pub random_seed: Option<u64>,
    /// Seconds between generated signals, 0 disables the generator
    pub signal_interval_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fleet_size: 10,
            ack_latency_ms: 20,
            failure_rate: 0.0,
            random_seed: None,
            signal_interval_secs: 0,
        }
    }
}

impl SimulationConfig {
    pub fn rng(&self) -> StdRng {
        match self.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// A plausible mixed fleet: some V2G cars, some only charging
pub fn generate_fleet(config: &SimulationConfig) -> Vec<Vehicle> {
    let mut rng = config.rng();
    let now = Utc::now();
    (0..config.fleet_size)
        .map(|i| {
            let v2g_capable = rng.gen_bool(0.7);
            let battery_kwh = *[40.0, 52.0, 64.0, 77.0]
                .get(rng.gen_range(0..4))
                .unwrap_or(&50.0);
            Vehicle {
                id: format!("sim-{i:03}"),
                soc: rng.gen_range(0.2..0.95),
                min_soc: rng.gen_range(0.1..0.4),
                battery_kwh,
                max_power_kw: if v2g_capable { 11.0 } else { 7.4 },
                v2g_capable,
                connected: rng.gen_bool(0.85),
                charging: rng.gen_bool(0.4),
                priority: rng.gen_bool(0.1),
                departure: Some(now + ChronoDuration::minutes(rng.gen_range(30..600))),
                segment: if i % 3 == 0 { "fleet".into() } else { "residential".into() },
                availability_prob: rng.gen_range(0.6..1.0),
                degradation: rng.gen_range(0.0..0.2),
            }
        })
        .collect()
}

/// Random signal, negative power for reduction products
pub fn random_signal(rng: &mut impl Rng) -> FlexibilitySignal {
    let kinds: Vec<SignalKind> = SignalKind::iter().collect();
    let kind = kinds[rng.gen_range(0..kinds.len())];
    let magnitude = rng.gen_range(5.0..60.0);
    let power_kw = match kind {
        SignalKind::Nebef | SignalKind::EcoWatt => -magnitude,
        _ => magnitude,
    };
    FlexibilitySignal::new(kind, power_kw, Duration::from_secs(rng.gen_range(1..5) * 900))
}

/// Feed random signals into `signals` every `interval` until cancelled.
pub async fn run_signal_generator(
    config: SimulationConfig,
    signals: mpsc::Sender<FlexibilitySignal>,
    cancel: CancellationToken,
) {
    if config.signal_interval_secs == 0 {
        return;
    }
    let mut rng = config.rng();
    let mut ticker = tokio::time::interval(Duration::from_secs(config.signal_interval_secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let signal = random_signal(&mut rng);
                tracing::debug!(signal = %signal.kind, power_kw = signal.power_kw, "simulated signal");
                if signals.send(signal).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_fleet_is_valid_and_reproducible() {
        let config = SimulationConfig {
            fleet_size: 25,
            random_seed: Some(42),
            ..Default::default()
        };
        let a = generate_fleet(&config);
        let b = generate_fleet(&config);
        assert_eq!(a.len(), 25);
        assert!(a.iter().all(Vehicle::is_valid));
        assert_eq!(
            a.iter().map(|v| v.soc).collect::<Vec<_>>(),
            b.iter().map(|v| v.soc).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_random_signal_direction() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let s = random_signal(&mut rng);
            match s.kind {
                SignalKind::Nebef | SignalKind::EcoWatt => assert!(s.power_kw < 0.0),
                _ => assert!(s.power_kw > 0.0),
            }
            assert!(s.duration >= Duration::from_secs(900));
        }
    }

    #[tokio::test]
    async fn test_generator_disabled_returns_immediately() {
        let (tx, mut rx) = mpsc::channel(1);
        run_signal_generator(SimulationConfig::default(), tx, CancellationToken::new()).await;
        assert!(rx.recv().await.is_none());
    }
}
