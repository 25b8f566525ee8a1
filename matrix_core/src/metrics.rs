//! Matrix Metrics Module
//! =====================
//!
//! Metrics are pushed into an explicit [`MetricsSink`] handed to each
//! component at construction; there is no process-wide registry.
//!
//! - [`MetricsRegistry`]: node-wide counters and gauges, Prometheus-style keys
//! - [`MatrixMetrics`]: adapts the registry to one matrix
//! - [`InMemorySink`]: records every event (for tests)

use crate::event::{AgentEvent, Event, EventPayload, EventType};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

/// Destination for events and source of named numeric metrics.
pub trait MetricsSink: Send + Sync {
    /// Records one event.
    fn record_event(&self, event: &Event);

    /// Returns the current metric values by name.
    fn get_metrics(&self) -> HashMap<String, f64>;
}

/// Formats a metric key with labels: `name{k1=v1,k2=v2}`.
fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}{{{}}}", name, labels.join(","))
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Node-wide registry of counters and gauges.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<String, f64>>,
    gauges: Mutex<BTreeMap<String, f64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped registry for sharing across components.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Adds `by` to a counter, creating it at zero.
    pub fn increment(&self, key: impl Into<String>, by: f64) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(key.into()).or_insert(0.0) += by;
    }

    /// Sets a gauge.
    pub fn set_gauge(&self, key: impl Into<String>, value: f64) {
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.insert(key.into(), value);
    }

    /// Returns a counter or gauge by exact key.
    pub fn get(&self, key: &str) -> Option<f64> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = counters.get(key) {
            return Some(*v);
        }
        drop(counters);
        let gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.get(key).copied()
    }

    /// Returns every metric whose key satisfies `filter`.
    pub fn snapshot_where(&self, filter: impl Fn(&str) -> bool) -> HashMap<String, f64> {
        let mut out = HashMap::new();
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        out.extend(
            counters
                .iter()
                .filter(|(k, _)| filter(k))
                .map(|(k, v)| (k.clone(), *v)),
        );
        drop(counters);
        let gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        out.extend(
            gauges
                .iter()
                .filter(|(k, _)| filter(k))
                .map(|(k, v)| (k.clone(), *v)),
        );
        out
    }

    // ---- Node gauges -------------------------------------------------------

    pub fn record_peer_count(&self, count: usize) {
        self.set_gauge("matrix_peer_count", count as f64);
    }

    pub fn record_soul_count(&self, count: usize) {
        self.set_gauge("matrix_soul_count", count as f64);
    }

    pub fn record_matrix_count(&self, count: usize) {
        self.set_gauge("matrix_count", count as f64);
    }

    pub fn record_agent_count(&self, count: usize) {
        self.set_gauge("matrix_agent_count", count as f64);
    }

    /// Guest linear memory currently held by an agent, in bytes.
    pub fn record_agent_memory(&self, agent_id: &str, bytes: usize) {
        self.set_gauge(
            metric_key("matrix_agent_memory_usage", &[("agent_id", agent_id)]),
            bytes as f64,
        );
    }

    // ---- Counters ----------------------------------------------------------

    pub fn record_matrix_event(&self, matrix_id: &str, event_type: EventType) {
        self.increment(
            metric_key(
                "matrix_event_count",
                &[("matrix_id", matrix_id), ("event_type", event_type.as_str())],
            ),
            1.0,
        );
    }

    /// Counts one bridged message; `direction` is `"out"` or `"in"`.
    pub fn record_message(&self, topic: &str, direction: &str) {
        self.increment(
            metric_key(
                "matrix_message_count",
                &[("topic", topic), ("direction", direction)],
            ),
            1.0,
        );
    }

    /// Counts a sandbox fault by its stable kind label.
    pub fn record_sandbox_fault(&self, kind: &str) {
        self.increment(metric_key("matrix_sandbox_fault_count", &[("kind", kind)]), 1.0);
    }
}

impl MetricsSink for MetricsRegistry {
    fn record_event(&self, event: &Event) {
        self.increment(
            metric_key("event_count", &[("event_type", event.event_type().as_str())]),
            1.0,
        );
        if let EventPayload::Agent(AgentEvent::Faulted { kind, .. }) = event.payload() {
            self.record_sandbox_fault(kind);
        }
    }

    fn get_metrics(&self) -> HashMap<String, f64> {
        self.snapshot_where(|_| true)
    }
}

// =============================================================================
// MATRIX ADAPTER
// =============================================================================

/// Adapts a [`MetricsRegistry`] to the sink interface of one matrix.
pub struct MatrixMetrics {
    registry: Arc<MetricsRegistry>,
    matrix_id: String,
}

impl MatrixMetrics {
    pub fn new(registry: Arc<MetricsRegistry>, matrix_id: impl Into<String>) -> Self {
        Self {
            registry,
            matrix_id: matrix_id.into(),
        }
    }
}

impl MetricsSink for MatrixMetrics {
    fn record_event(&self, event: &Event) {
        self.registry.record_matrix_event(&self.matrix_id, event.event_type());
        if let Some(matrix_event) = event.as_matrix() {
            self.registry.increment(
                metric_key(
                    "matrix_rule_event_count",
                    &[("matrix_id", &self.matrix_id), ("kind", &matrix_event.kind)],
                ),
                1.0,
            );
        }
    }

    /// Returns only this matrix's metrics.
    fn get_metrics(&self) -> HashMap<String, f64> {
        let label = format!("matrix_id={}", self.matrix_id);
        self.registry
            .snapshot_where(|key| key.split(['{', ',', '}']).any(|part| part == label))
    }
}

// =============================================================================
// RECORDING SINK
// =============================================================================

/// Sink that keeps every recorded event in order.
#[derive(Debug, Default)]
pub struct InMemorySink {
    events: Mutex<Vec<Event>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded event, in record order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl MetricsSink for InMemorySink {
    fn record_event(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }

    fn get_metrics(&self) -> HashMap<String, f64> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = HashMap::new();
        out.insert("events_total".to_string(), events.len() as f64);
        for event in events.iter() {
            *out.entry(format!("events.{}", event.event_type())).or_insert(0.0) += 1.0;
        }
        out
    }
}

// =============================================================================
// TESTS
// =============================================================================
