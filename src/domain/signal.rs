//! Grid-operator flexibility signals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Kind of flexibility product requested by the grid operator
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum SignalKind {
    /// Frequency Containment Reserve
    #[serde(rename = "FCR")]
    #[strum(serialize = "FCR")]
    Fcr,
    /// automatic Frequency Restoration Reserve
    #[serde(rename = "aFRR")]
    #[strum(serialize = "aFRR")]
    Afrr,
    /// Market adjustment
    #[serde(rename = "MA")]
    #[strum(serialize = "MA")]
    Ma,
    /// Load shedding / effacement
    #[serde(rename = "NEBEF")]
    #[strum(serialize = "NEBEF")]
    Nebef,
    /// Tariff-driven demand response
    #[serde(rename = "EcoWatt")]
    #[strum(serialize = "EcoWatt")]
    EcoWatt,
}

impl SignalKind {
    /// Strict products must be delivered exactly when the fleet can.
    pub fn is_strict(self) -> bool {
        matches!(self, SignalKind::Fcr)
    }
}

/// One flexibility request.
///
/// `power_kw` is signed: positive asks the fleet to inject (discharge into the
/// grid), negative asks it to reduce consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlexibilitySignal {
    pub kind: SignalKind,
    pub power_kw: f64,
    #[serde(with = "duration_secs", default)]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl FlexibilitySignal {
    pub fn new(kind: SignalKind, power_kw: f64, duration: Duration) -> Self {
        Self {
            kind,
            power_kw,
            duration,
            timestamp: Utc::now(),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.kind.is_strict()
    }

    /// +1.0 for injection (and zero), -1.0 for reduction
    pub fn direction(&self) -> f64 {
        if self.power_kw < 0.0 {
            -1.0
        } else {
            1.0
        }
    }

    pub fn target_kw(&self) -> f64 {
        self.power_kw.abs()
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration.as_secs_f64() / 3600.0
    }

    /// Same signal with a different requested power, used when a target is
    /// split across fleet segments.
    pub fn with_power(&self, power_kw: f64) -> Self {
        Self {
            power_kw,
            ..self.clone()
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
