//! SSE registry: live stream writers, bus fan-out, eviction of dead streams.
//!
//! A connection is the sending half of a bounded channel; the HTTP layer
//! drains the receiving half into the response stream. Writers that fail a
//! send (closed or full) are evicted on the spot: slow clients miss events
//! rather than stalling the broadcast.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::events::{EventBus, RunnerEvent};

const CHANNEL_CAP: usize = 64;
const PREAMBLE: &str = "retry: 3000\n: ok\n\n";

struct SseState {
    next_id: u64,
    connections: HashMap<u64, mpsc::Sender<String>>,
    subscription: Option<u64>,
}

/// Holds the set of connected SSE streams and the single bus subscription
/// that feeds them.
pub struct SseRegistry {
    state: Mutex<SseState>,
}

impl Default for SseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SseRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SseState {
                next_id: 1,
                connections: HashMap::new(),
                subscription: None,
            }),
        }
    }

    /// Subscribe once to the bus and install the fan-out handler.
    /// Idempotent: a second init keeps the existing subscription.
    pub fn init(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let mut st = self.state.lock().expect("sse state lock");
        if st.subscription.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        let id = bus.subscribe(move |event: &RunnerEvent| {
            registry.broadcast(event.event_type(), &event.payload());
        });
        st.subscription = Some(id);
    }

    /// Register a new stream. Returns the connection id and the receiving
    /// half the HTTP layer writes to the wire; the preamble is already
    /// queued on it.
    pub fn add_connection(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAP);
        // Queued before the connection is visible to broadcasts, so the
        // preamble always precedes the first event.
        let _ = tx.try_send(PREAMBLE.to_string());

        let mut st = self.state.lock().expect("sse state lock");
        let id = st.next_id;
        st.next_id += 1;
        st.connections.insert(id, tx);
        (id, rx)
    }

    /// Drop a stream (client disconnected). Unknown ids are ignored.
    pub fn remove_connection(&self, id: u64) {
        let mut st = self.state.lock().expect("sse state lock");
        st.connections.remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().expect("sse state lock").connections.len()
    }

    /// Format and write the event to every live stream, evicting writers
    /// that fail.
    pub fn broadcast(&self, event_type: &str, payload: &Value) {
        let frame = format!("event: {event_type}\ndata: {payload}\n\n");

        let mut st = self.state.lock().expect("sse state lock");
        let mut dead = Vec::new();
        for (id, tx) in &st.connections {
            if tx.try_send(frame.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            tracing::debug!(connection = id, "evicting sse stream");
            st.connections.remove(&id);
        }
    }

    /// Close every stream and drop the bus subscription. Idempotent.
    pub fn shutdown(&self, bus: &EventBus) {
        let mut st = self.state.lock().expect("sse state lock");
        st.connections.clear();
        if let Some(id) = st.subscription.take() {
            bus.unsubscribe(id);
        }
    }
}
