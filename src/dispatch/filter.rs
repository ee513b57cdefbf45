//! Eligibility filter

use crate::domain::{FlexibilitySignal, SignalKind, Vehicle};

/// Minimum SoC for a vehicle to take part in frequency containment
pub const FCR_MIN_SOC: f64 = 0.6;

/// Selects the vehicles that may take part in a given signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct VehicleFilter;

impl VehicleFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn is_eligible(&self, vehicle: &Vehicle, signal: &FlexibilitySignal) -> bool {
        if vehicle.battery_kwh <= 0.0 {
            return false;
        }
        match signal.kind {
            SignalKind::Fcr => {
                vehicle.connected && vehicle.v2g_capable && vehicle.soc >= FCR_MIN_SOC
            }
            // Only a vehicle that is charging has consumption to shed
            SignalKind::Nebef => vehicle.charging && !vehicle.priority,
            SignalKind::Afrr | SignalKind::Ma | SignalKind::EcoWatt => vehicle.connected,
        }
    }

    /// Eligible vehicles in input order
    pub fn filter(&self, vehicles: &[Vehicle], signal: &FlexibilitySignal) -> Vec<Vehicle> {
        vehicles
            .iter()
            .filter(|v| self.is_eligible(v, signal))
            .cloned()
            .collect()
    }
}
