//! Event Model
//!
//! Every record routed through the [`EventBus`](crate::EventBus) is an
//! immutable [`Event`]: an origin, a timestamp and a payload drawn from a
//! closed set of per-subsystem variants. The variant determines the
//! [`EventType`] used for subscription routing, so the two can never
//! disagree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Routing tag for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Peer network events
    Peer,
    /// Soul state events
    Soul,
    /// Matrix simulation events
    Matrix,
    /// Agent execution events
    Agent,
    /// Training events
    Trainer,
}

impl EventType {
    /// Returns all event types.
    pub fn all() -> [EventType; 5] {
        [
            EventType::Peer,
            EventType::Soul,
            EventType::Matrix,
            EventType::Agent,
            EventType::Trainer,
        ]
    }

    /// Stable lowercase name (used in metric keys and logs).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Peer => "peer",
            EventType::Soul => "soul",
            EventType::Matrix => "matrix",
            EventType::Agent => "agent",
            EventType::Trainer => "trainer",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer network events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerEvent {
    Connected { peer: String },
    Disconnected { peer: String },
    /// Inbound payload received on a transport topic.
    Message {
        topic: String,
        from: String,
        payload: Vec<u8>,
    },
}

/// Soul state events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SoulEvent {
    MemoryAdded { soul_id: String, entry_type: String },
    ValueSet { soul_id: String, key: String, value: f64 },
    PersonaUpdated { soul_id: String },
}

/// Event produced by a matrix rule.
///
/// `kind` is rule-defined (e.g. `"energy_decay"`); `attributes` carries
/// numeric observations keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixEvent {
    pub kind: String,
    pub agent_id: Option<String>,
    pub attributes: BTreeMap<String, f64>,
}

impl MatrixEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            agent_id: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Attaches the agent this event concerns.
    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Adds a numeric attribute.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

/// Agent execution events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentEvent {
    Started,
    Stopped,
    /// A guest program wrote a log line.
    Log { message: String },
    /// A guest program asked for a message to be sent to `target`.
    OutboundMessage { target: String, payload: Vec<u8> },
    /// A sandbox call ended abnormally; `kind` is the error's stable label.
    Faulted { kind: String, detail: String },
}

/// Training progress events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerEvent {
    pub kind: String,
    pub metrics: BTreeMap<String, f64>,
}

/// Closed set of event payloads, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Peer(PeerEvent),
    Soul(SoulEvent),
    Matrix(MatrixEvent),
    Agent(AgentEvent),
    Trainer(TrainerEvent),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Peer(_) => EventType::Peer,
            EventPayload::Soul(_) => EventType::Soul,
            EventPayload::Matrix(_) => EventType::Matrix,
            EventPayload::Agent(_) => EventType::Agent,
            EventPayload::Trainer(_) => EventType::Trainer,
        }
    }
}

/// An immutable, typed, timestamped record.
///
/// Fields are private; an event cannot be altered after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    origin: String,
    timestamp_ms: i64,
    payload: EventPayload,
}

impl Event {
    /// Creates an event.
    ///
    /// # Arguments
    /// * `origin` - Identifier of the producer (matrix id, agent id, peer id)
    /// * `timestamp_ms` - Milliseconds since the Unix epoch
    /// * `payload` - Typed content; determines the event type
    pub fn new(origin: impl Into<String>, timestamp_ms: i64, payload: EventPayload) -> Self {
        Self {
            origin: origin.into(),
            timestamp_ms,
            payload,
        }
    }

    /// Shorthand for a matrix-rule event.
    pub fn matrix(origin: impl Into<String>, timestamp_ms: i64, event: MatrixEvent) -> Self {
        Self::new(origin, timestamp_ms, EventPayload::Matrix(event))
    }

    /// Shorthand for a peer event.
    pub fn peer(origin: impl Into<String>, timestamp_ms: i64, event: PeerEvent) -> Self {
        Self::new(origin, timestamp_ms, EventPayload::Peer(event))
    }

    /// Shorthand for an agent event.
    pub fn agent(origin: impl Into<String>, timestamp_ms: i64, event: AgentEvent) -> Self {
        Self::new(origin, timestamp_ms, EventPayload::Agent(event))
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Returns the matrix payload if this is a matrix event.
    pub fn as_matrix(&self) -> Option<&MatrixEvent> {
        match &self.payload {
            EventPayload::Matrix(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the agent payload if this is an agent event.
    pub fn as_agent(&self) -> Option<&AgentEvent> {
        match &self.payload {
            EventPayload::Agent(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_determines_type() {
        let e = Event::matrix("m1", 10, MatrixEvent::new("tick"));
        assert_eq!(e.event_type(), EventType::Matrix);

        let e = Event::agent("a1", 10, AgentEvent::Started);
        assert_eq!(e.event_type(), EventType::Agent);

        let e = Event::new(
            "p",
            0,
            EventPayload::Trainer(TrainerEvent {
                kind: "epoch".into(),
                metrics: BTreeMap::new(),
            }),
        );
        assert_eq!(e.event_type(), EventType::Trainer);
    }

    #[test]
    fn test_matrix_event_builder() {
        let e = MatrixEvent::new("energy_decay")
            .for_agent("a1")
            .with("energy", 0.5);
        assert_eq!(e.agent_id.as_deref(), Some("a1"));
        assert_eq!(e.attributes.get("energy"), Some(&0.5));
    }

    #[test]
    fn test_event_type_serializes_lowercase() {
        let json = serde_json::to_string(&EventType::Trainer).unwrap();
        assert_eq!(json, "\"trainer\"");
    }
}
