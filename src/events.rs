//! Observer feed consumed by the UI/CLI collaborator.
//!
//! The manager, the bridges, and the tunnel supervisor all publish into one
//! broadcast channel. Subscribers receive mapping state transitions (with the
//! fault message when a mapping enters `Error`) and raw log lines — bridge
//! session notices plus the forwarding client's combined output. The core
//! never depends on whoever is listening; sends to a feed with no subscribers
//! are silently dropped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::manager::{MappingId, MappingState};

/// Capacity of the observer feed. Slow subscribers lag rather than block.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A single observer event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A mapping changed state. `message` is set when the new state is
    /// `Error` and carries the human-readable fault description.
    State {
        id: MappingId,
        state: MappingState,
        message: Option<String>,
    },
    /// A raw log line: forwarding-client output or a bridge session notice.
    Log { line: String },
}

pub type EventSender = broadcast::Sender<Event>;

/// Create the observer feed.
pub fn channel() -> (EventSender, broadcast::Receiver<Event>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
