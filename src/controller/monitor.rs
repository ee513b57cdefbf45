//! Exception capture
//!
//! Internal failures during a dispatch are reported here with tags instead of
//! being propagated.

use itertools::Itertools;
use std::fmt::Display;

pub trait Monitor: Send + Sync {
    fn capture_exception(&self, error: &dyn Display, tags: &[(&str, String)]);
}

/// Reports captured errors as `error!` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn capture_exception(&self, error: &dyn Display, tags: &[(&str, String)]) {
        let tags = tags.iter().map(|(k, v)| format!("{k}={v}")).join(",");
        tracing::error!(error = %error, tags = %tags, "captured exception");
    }
}
