//! Structured events emitted by the dataplane. A real deployment wires
//! these into metrics/logging sinks; here they're just `tracing` records
//! plus a lightweight in-process broadcast for anything that wants to
//! observe them directly (tests, an admin API, etc).

use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    ProxySuccess {
        request_id: String,
        endpoint: String,
        duration: Duration,
        bytes_sent: u64,
        status: u16,
        model: Option<String>,
    },
    ClientDisconnect {
        request_id: String,
        bytes_sent: u64,
    },
    CircuitBreakerOpened {
        endpoint: String,
        failures: u32,
        threshold: u32,
    },
    CircuitBreakerHalfOpen {
        endpoint: String,
    },
    CircuitBreakerClosed {
        endpoint: String,
        previous_state: &'static str,
    },
}

/// Fan-out publisher. Cloning shares the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish never blocks callers on a full/unwatched channel; a dropped
    /// event with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
