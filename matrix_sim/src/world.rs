//! SimWorld - wires the kernel together the way a node orchestrator would.

use crate::context::SimContext;
use crate::network::{LoopbackNetwork, LoopbackTransport};

use matrix_core::{
    Agent, AgentSandbox, BusConfig, Event, EventBus, Matrix, MatrixError, MatrixMetrics, PeerEvent,
    MetricsRegistry, MetricsSink, ResourceLimits, SandboxConfig, SandboxEnv, SandboxError,
    SoulStore, StepReport, DEFAULT_QUEUE_CAPACITY,
};
use matrix_env::{CancelToken, NodeContext, PeerId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Working buffer given to simulated guests.
pub const GUEST_WORKING_BUFFER: usize = 4096;

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of agents to spawn
    pub num_agents: usize,

    /// Steps to run per matrix
    pub num_steps: u64,

    /// Steps per virtual second
    pub tick_rate_hz: u32,

    /// Per-subscriber bus queue capacity
    pub queue_capacity: usize,

    /// Limits applied to every guest sandbox
    pub limits: ResourceLimits,

    /// sled directory for soul persistence; in-memory when `None`
    pub storage_path: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_agents: 6,
            num_steps: 50,
            tick_rate_hz: 10,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            limits: ResourceLimits::default(),
            storage_path: None,
        }
    }
}

/// Outcome of stepping one matrix.
pub type MatrixStep = (String, Result<StepReport, MatrixError>);

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    pub config: SimConfig,

    /// Shared simulation context (virtual clock + RNG)
    pub context: Arc<SimContext>,

    pub bus: EventBus,
    pub souls: Arc<SoulStore>,
    pub registry: Arc<MetricsRegistry>,

    /// In-memory network every node of this world attaches to
    pub network: Arc<LoopbackNetwork>,

    matrices: Vec<Arc<Matrix>>,
    tick_count: u64,
}

impl SimWorld {
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let bus = EventBus::with_config(BusConfig {
            queue_capacity: config.queue_capacity,
        });
        let souls = Arc::new(SoulStore::new().with_events(bus.clone(), context.clone()));

        Self {
            config,
            context,
            bus,
            souls,
            registry: MetricsRegistry::shared(),
            network: LoopbackNetwork::new(),
            matrices: Vec::new(),
            tick_count: 0,
        }
    }

    /// Deterministic agent id: `agent-00`, `agent-01`, ...
    pub fn agent_id(index: usize) -> String {
        format!("agent-{:02}", index)
    }

    /// Creates a matrix bound to this world's bus, souls, clock and registry.
    pub fn add_matrix(&mut self, id: &str) -> Arc<Matrix> {
        let sink: Arc<dyn MetricsSink> = Arc::new(MatrixMetrics::new(self.registry.clone(), id));
        let matrix = Arc::new(
            Matrix::new(id, sink, self.bus.clone())
                .with_souls(self.souls.clone())
                .with_context(self.context.clone()),
        );
        self.matrices.push(matrix.clone());
        self.registry.record_matrix_count(self.matrices.len());
        matrix
    }

    pub fn matrices(&self) -> &[Arc<Matrix>] {
        &self.matrices
    }

    /// Environment for guest sandboxes: virtual clock, world bus, registry.
    pub fn sandbox_env(&self) -> SandboxEnv {
        SandboxEnv::new(self.context.clone())
            .with_bus(self.bus.clone())
            .with_metrics(self.registry.clone())
    }

    /// Builds an agent running `code` under the configured limits.
    pub fn spawn_guest(&self, agent_id: &str, code: &[u8]) -> Result<Agent, SandboxError> {
        let config = SandboxConfig::new(agent_id, code)
            .with_limits(self.config.limits)
            .with_working_buffer(GUEST_WORKING_BUFFER);
        let sandbox = AgentSandbox::new(config, self.sandbox_env())?;
        Ok(Agent::new(agent_id).with_sandbox(sandbox))
    }

    /// A transport for node `node` of this world.
    ///
    /// The first attach of a node publishes [`PeerEvent::Connected`] and
    /// updates the peer gauge.
    pub fn transport(&self, node: u64) -> LoopbackTransport {
        let peer = PeerId::from_seed(self.config.seed.wrapping_add(node));
        let before = self.network.peer_count();
        let transport = self.network.transport(peer);
        let after = self.network.peer_count();
        if after > before {
            debug!(%peer, peers = after, "peer attached");
            self.publish_peer(peer, PeerEvent::Connected { peer: peer.to_string() });
        }
        self.registry.record_peer_count(after);
        transport
    }

    /// Cuts `group_a` off from `group_b`. Each side sees the other
    /// disconnect.
    pub fn partition(&self, group_a: Vec<PeerId>, group_b: Vec<PeerId>) {
        self.announce(&group_a, &group_b, |peer| PeerEvent::Disconnected { peer });
        self.network.controller().partition(group_a, group_b);
    }

    /// Lifts every partition. Each side sees the other reconnect.
    pub fn heal_partitions(&self) {
        for (group_a, group_b) in self.network.controller().heal_all() {
            self.announce(&group_a, &group_b, |peer| PeerEvent::Connected { peer });
        }
    }

    fn announce(
        &self,
        group_a: &[PeerId],
        group_b: &[PeerId],
        event: impl Fn(String) -> PeerEvent,
    ) {
        for a in group_a {
            for b in group_b {
                self.publish_peer(*a, event(b.to_string()));
                self.publish_peer(*b, event(a.to_string()));
            }
        }
    }

    fn publish_peer(&self, origin: PeerId, event: PeerEvent) {
        self.bus
            .publish(Event::peer(origin.to_string(), self.context.unix_millis(), event));
    }

    /// Advances the virtual clock by one tick and steps every matrix once.
    pub fn step(&mut self, cancel: &CancelToken) -> Vec<MatrixStep> {
        let dt = Duration::from_secs_f64(1.0 / self.config.tick_rate_hz.max(1) as f64);
        self.context.advance_time(dt);
        self.tick_count += 1;

        let results = self
            .matrices
            .iter()
            .map(|m| (m.id().to_string(), m.step(cancel)))
            .collect();
        self.record_gauges();
        debug!(tick = self.tick_count, "world stepped");
        results
    }

    fn record_gauges(&self) {
        let mut agents = 0;
        for matrix in &self.matrices {
            agents += matrix.agent_count();
            for id in matrix.agent_ids() {
                let memory = matrix
                    .get_agent(&id)
                    .and_then(|agent| agent.with_sandbox_mut(|sb| sb.memory_size()));
                if let Some(bytes) = memory {
                    self.registry.record_agent_memory(&id, bytes);
                }
            }
        }
        self.registry.record_agent_count(agents);
        self.registry.record_soul_count(self.souls.len());
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn time_secs(&self) -> f64 {
        self.context.time_ns() as f64 / 1e9
    }

    /// Every counter and gauge in the registry, sorted by key.
    pub fn metrics_snapshot(&self) -> BTreeMap<String, f64> {
        self.registry.get_metrics().into_iter().collect()
    }
}
