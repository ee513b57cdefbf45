//! V2G flexibility dispatch engine
//!
//! Turns grid flexibility signals (FCR, aFRR, MA, NEBEF, EcoWatt) into
//! per-vehicle power setpoints, publishes them, collects acknowledgements and
//! reallocates what failed vehicles could not deliver.

pub mod api;
pub mod broker;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod dispatch;
pub mod domain;
pub mod events;
pub mod fallback;
pub mod metrics;
pub mod repo;
pub mod simulation;
pub mod telemetry;
