//! Fleet vehicle model
//!
//! A `Vehicle` is a value record describing one EV as seen by the aggregator
//! at dispatch time. The fleet itself is owned by an external source
//! (discovery or telemetry); dispatch only ever works on copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SoC below which a vehicle is never asked to take over unserved power.
pub const FALLBACK_MIN_SOC: f64 = 0.3;

/// Electric vehicle participating in the flexibility pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    /// State of charge (0..1)
    pub soc: f64,
    /// Minimum SoC the driver needs at departure (0..1)
    #[serde(default)]
    pub min_soc: f64,
    /// Nominal battery energy (kWh), must be > 0
    pub battery_kwh: f64,
    /// Peak charge/discharge power (kW)
    pub max_power_kw: f64,
    #[serde(default)]
    pub v2g_capable: bool,
    /// Currently plugged in
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub charging: bool,
    #[serde(default)]
    pub priority: bool,
    /// Planned departure; `None` when the driver has not announced one
    #[serde(default)]
    pub departure: Option<DateTime<Utc>>,
    #[serde(default)]
    pub segment: String,
    #[serde(default = "default_availability")]
    pub availability_prob: f64,
    #[serde(default)]
    pub degradation: f64,
}

fn default_availability() -> f64 {
    1.0
}

impl Default for Vehicle {
    fn default() -> Self {
        Self {
            id: String::new(),
            soc: 0.5,
            min_soc: 0.0,
            battery_kwh: 50.0,
            max_power_kw: 11.0,
            v2g_capable: false,
            connected: false,
            charging: false,
            priority: false,
            departure: None,
            segment: String::new(),
            availability_prob: 1.0,
            degradation: 0.0,
        }
    }
}

impl Vehicle {
    /// Battery and SoC values are physically meaningful
    pub fn is_valid(&self) -> bool {
        self.battery_kwh > 0.0
            && (0.0..=1.0).contains(&self.soc)
            && (0.0..=1.0).contains(&self.min_soc)
    }

    /// Minutes left until planned departure, `None` if unknown or already gone
    pub fn minutes_until_departure(&self, now: DateTime<Utc>) -> Option<f64> {
        let departure = self.departure?;
        let seconds = (departure - now).num_seconds();
        if seconds <= 0 {
            return None;
        }
        Some(seconds as f64 / 60.0)
    }

    /// Energy that can be drawn before hitting `floor` (kWh). Negative when
    /// the vehicle is already below the floor.
    pub fn energy_slack_kwh(&self, floor: f64) -> f64 {
        (self.soc - floor) * self.battery_kwh
    }

    /// Power this vehicle can still realistically absorb on top of `current`,
    /// discounted by wear, SoC and the probability it actually answers.
    pub fn effective_capacity(&self, current_kw: f64) -> f64 {
        if self.soc < FALLBACK_MIN_SOC {
            return 0.0;
        }
        let availability = if self.availability_prob == 0.0 {
            1.0
        } else {
            self.availability_prob
        };
        let headroom =
            (self.max_power_kw * (1.0 - self.degradation) - current_kw.abs()).max(0.0);
        headroom * self.soc * availability
    }
}
