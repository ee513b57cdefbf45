//! In-process broker
//!
//! Routes messages between tasks of one process. Used by the simulation
//! binary and tests; it can be told to fail publishes to exercise retries.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::{topic_matches, validate_filter, BrokerError, BrokerMessage, BrokerTransport};

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Default)]
pub struct MemoryBroker {
    subscriptions: Mutex<Vec<(String, mpsc::Sender<BrokerMessage>)>>,
    offline: AtomicBool,
    failures_left: AtomicUsize,
    failing_topics: Mutex<Vec<String>>,
    published: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject the next `count` publishes
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Reject every publish on topics matching `filter`
    pub fn fail_topic(&self, filter: &str) {
        self.failing_topics.lock().push(filter.to_string());
    }

    /// Publishes accepted so far
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    fn check_available(&self, topic: &str) -> Result<(), BrokerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("broker offline".into()));
        }
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(BrokerError::Unavailable("injected failure".into()));
        }
        if self
            .failing_topics
            .lock()
            .iter()
            .any(|f| topic_matches(f, topic))
        {
            return Err(BrokerError::Unavailable(format!("topic {topic} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.check_available(topic)?;

        let targets: Vec<mpsc::Sender<BrokerMessage>> = {
            let mut subs = self.subscriptions.lock();
            subs.retain(|(_, tx)| !tx.is_closed());
            subs.iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        for tx in targets {
            let message = BrokerMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if tx.send(message).await.is_err() {
                tracing::debug!(topic, "subscriber went away during publish");
            }
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BrokerMessage>, BrokerError> {
        validate_filter(filter)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscriptions.lock().push((filter.to_string(), tx));
        Ok(rx)
    }
}
