//! Message broker plumbing
//!
//! The dispatch core only sees [`Publisher`]; this module provides the
//! transport abstraction it is built on, an in-process transport, and the
//! broker-backed publisher with ack correlation.

pub mod memory;
pub mod publisher;

pub use memory::*;
pub use publisher::*;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("invalid topic filter '{0}'")]
    InvalidFilter(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Minimal pub/sub transport, MQTT-shaped
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Messages on every topic matching `filter` until the receiver is dropped
    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BrokerMessage>, BrokerError>;
}

/// MQTT topic filter matching: `+` matches one level, a trailing `#` any
/// number of levels (including none).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

/// `#` may only appear as the last level, wildcards never inside a level.
pub fn validate_filter(filter: &str) -> Result<(), BrokerError> {
    let parts: Vec<&str> = filter.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        let bad_hash = part.contains('#') && (*part != "#" || i + 1 != parts.len());
        let bad_plus = part.contains('+') && *part != "+";
        if filter.is_empty() || bad_hash || bad_plus {
            return Err(BrokerError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}

/// Vehicle id of a `vehicle/<id>/...` topic
pub fn vehicle_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next()) {
        (Some("vehicle"), Some(id)) if !id.is_empty() => Some(id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("vehicle/+/ack", "vehicle/ev-1/ack", true)]
    #[case("vehicle/+/ack", "vehicle/ev-1/command", false)]
    #[case("vehicle/+/ack", "vehicle/ack", false)]
    #[case("vehicle/#", "vehicle/ev-1/ack", true)]
    #[case("vehicle/#", "vehicle", true)]
    #[case("fleet/discovery/response", "fleet/discovery/response", true)]
    #[case("fleet/discovery", "fleet/discovery/response", false)]
    #[case("+/+", "a/b", true)]
    fn test_topic_matches(#[case] filter: &str, #[case] topic: &str, #[case] expected: bool) {
        assert_eq!(topic_matches(filter, topic), expected);
    }

    #[rstest]
    #[case("vehicle/+/ack", true)]
    #[case("vehicle/#", true)]
    #[case("vehicle/#/ack", false)]
    #[case("vehicle/ev+/ack", false)]
    #[case("", false)]
    fn test_validate_filter(#[case] filter: &str, #[case] ok: bool) {
        assert_eq!(validate_filter(filter).is_ok(), ok);
    }

    #[test]
    fn test_vehicle_from_topic() {
        assert_eq!(vehicle_from_topic("vehicle/ev-9/ack"), Some("ev-9"));
        assert_eq!(vehicle_from_topic("fleet/ev-9"), None);
    }
}
