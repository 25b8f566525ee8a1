//! Matrix Core - runtime kernel of a peer-to-peer agent node.
//!
//! Hosts untrusted guest programs ("Souls" executed as "Agents") inside
//! rule-governed simulated environments ("Matrices"):
//! 1. **Agent Sandbox**: wasmtime instances bounded by fuel and memory, with
//!    four bounds-checked host calls as their only capability surface
//! 2. **Matrix Engine**: serialized, priority-ordered rule passes
//! 3. **Event Bus**: non-blocking, loss-tolerant fan-out between subsystems
//! 4. **Soul Store**: per-identity memory, values and persona

pub mod agent;
pub mod bridge;
pub mod event;
pub mod event_bus;
pub mod host_calls;
pub mod kv;
pub mod matrix;
pub mod metrics;
pub mod sandbox;
pub mod soul;

// Re-export key types for convenience
pub use agent::{Agent, StateValue};
pub use bridge::{agent_topic, TransportBridge};
pub use event::{
    AgentEvent, Event, EventPayload, EventType, MatrixEvent, PeerEvent, SoulEvent, TrainerEvent,
};
pub use event_bus::{BusConfig, EventBus, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use kv::SledStore;
pub use matrix::{
    Matrix, MatrixError, MatrixState, Rule, RuleContext, RuleError, StepReport,
};
pub use metrics::{InMemorySink, MatrixMetrics, MetricsRegistry, MetricsSink};
pub use sandbox::{
    AgentSandbox, ResourceLimits, SandboxConfig, SandboxEnv, SandboxError,
};
pub use soul::{MemoryEntry, Persona, SoulStore};
