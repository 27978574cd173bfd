use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{info, warn};

/// Point-in-time view of a subscriber's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub connected: bool,
    pub group: String,
    pub topics: Vec<String>,
    pub brokers: Vec<String>,
}

/// Connection state tracked by the poll loop.
///
/// Flips to disconnected on "all brokers down" and back on the next successful assignment.
pub struct HealthState {
    connected: AtomicBool,
    group: String,
    topics: Vec<String>,
    brokers: Vec<String>,
}

impl HealthState {
    pub fn new(group: String, topics: Vec<String>, brokers: Vec<String>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            group,
            topics,
            brokers,
        }
    }

    pub fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!(group = %self.group, "Subscriber connected");
        }
    }

    pub fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(group = %self.group, "Subscriber lost connection to all brokers");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected: self.is_connected(),
            group: self.group.clone(),
            topics: self.topics.clone(),
            brokers: self.brokers.clone(),
        }
    }
}
