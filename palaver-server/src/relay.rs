//! Inter-worker fanout relay.
//!
//! Workers in the pool share one logical room table; live notifications
//! produced on one worker must reach connections held by the others. The
//! relay is a broadcast bus carrying typed frames. Delivery is
//! at-least-once: consumers skip frames from their own origin and keep a
//! bounded per-origin window of applied event ids, so duplicate delivery
//! of the same notification is harmless. Persisted messages never rely on
//! the relay for correctness — they are deduplicated by token at the store.
//!
//! Frame identity: `event_id = "{origin}:{counter}"`, with `origin` the
//! worker's id. Frames stay serde-encodable so the bus can be swapped for
//! a real cross-process transport without touching the protocol.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::events::ServerEvent;
use crate::router;
use crate::server::SharedState;

/// Bus capacity; a lagging consumer drops the oldest frames and logs.
pub const RELAY_CAPACITY: usize = 1024;

/// Maximum number of event ids to remember per origin for dedup.
const DEDUP_CAPACITY: usize = 10_000;

/// One relayed live notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayFrame {
    /// "{origin}:{counter}" — stable id for duplicate suppression.
    pub event_id: String,
    /// Worker id of the producer; consumers skip their own frames.
    pub origin: String,
    /// Target channel group, or None for every connection on the worker.
    pub channel: Option<String>,
    pub event: ServerEvent,
}

/// This worker's handle on the relay bus.
pub struct Relay {
    origin: String,
    counter: AtomicU64,
    tx: broadcast::Sender<RelayFrame>,
}

impl Relay {
    /// Create a relay with a fresh bus (single worker, or pool founder).
    pub fn new(origin: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(RELAY_CAPACITY);
        Self::with_bus(origin, tx)
    }

    /// Join an existing pool bus.
    pub fn with_bus(origin: impl Into<String>, tx: broadcast::Sender<RelayFrame>) -> Self {
        Self {
            origin: origin.into(),
            counter: AtomicU64::new(0),
            tx,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The underlying bus, for wiring additional workers onto it.
    pub fn bus(&self) -> broadcast::Sender<RelayFrame> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayFrame> {
        self.tx.subscribe()
    }

    fn next_event_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}", self.origin, n)
    }

    /// Publish a live notification to peer workers. A bus with no
    /// subscribers is not an error — the pool may be a single worker.
    pub fn publish(&self, channel: Option<&str>, event: &ServerEvent) {
        let frame = RelayFrame {
            event_id: self.next_event_id(),
            origin: self.origin.clone(),
            channel: channel.map(str::to_string),
            event: event.clone(),
        };
        let _ = self.tx.send(frame);
    }
}

/// Bounded per-origin window of event ids already applied.
pub struct DedupWindow {
    capacity: usize,
    seen: HashMap<String, (HashSet<String>, VecDeque<String>)>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashMap::new(),
        }
    }

    /// Record an event id. Returns true if it was new for this origin.
    pub fn check_and_insert(&mut self, origin: &str, event_id: &str) -> bool {
        let (set, order) = self.seen.entry(origin.to_string()).or_default();
        if !set.insert(event_id.to_string()) {
            return false;
        }
        order.push_back(event_id.to_string());
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                set.remove(&evicted);
            }
        }
        true
    }
}

/// Apply frames from peer workers until the bus closes.
pub async fn run_consumer(state: Arc<SharedState>, mut rx: broadcast::Receiver<RelayFrame>) {
    let mut dedup = DedupWindow::new(DEDUP_CAPACITY);
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if frame.origin == state.relay.origin() {
                    continue;
                }
                if !dedup.check_and_insert(&frame.origin, &frame.event_id) {
                    tracing::debug!(
                        origin = %frame.origin,
                        event_id = %frame.event_id,
                        "duplicate relay frame dropped"
                    );
                    continue;
                }
                apply(&state, &frame);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "relay consumer lagged, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Apply one deduplicated frame: deliver locally, then keep this worker's
/// live group table in step with directory changes. Delivery happens first
/// so a deletion notice reaches members before they are evicted.
pub fn apply(state: &Arc<SharedState>, frame: &RelayFrame) {
    match &frame.channel {
        Some(channel) => router::deliver_to_group(state, channel, &frame.event),
        None => router::deliver_to_all(state, &frame.event),
    }

    match &frame.event {
        ServerEvent::ChannelDeleted { name } => {
            state.groups.lock().remove(name);
        }
        ServerEvent::ChannelRenamed { old_name, new_name } => {
            let mut groups = state.groups.lock();
            if let Some(members) = groups.remove(old_name) {
                groups.insert(new_name.clone(), members);
            }
        }
        _ => {}
    }
}
