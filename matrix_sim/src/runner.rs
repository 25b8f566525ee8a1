//! Scenario runner - drives the kernel through named scenarios and checks
//! the properties each one is meant to exercise.

use crate::context::SimContext;
use crate::exporter::{AgentFrame, SimEvent, SimFrame};
use crate::guests::{self, TARGET_OFFSET, TICKS_OFFSET};
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use matrix_core::{
    agent_topic, Agent, EventBus, EventType, Matrix, MatrixError, MatrixEvent, MatrixState, MemoryEntry,
    MetricsSink, ResourceLimits, Rule, RuleError, SledStore, SoulStore, StateValue,
    TransportBridge,
};
use matrix_env::{ByteStore, CancelToken, DeliveryTransport, MemoryStore};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Chance per step that a living agent finds food.
const FORAGE_CHANCE: f64 = 0.35;

/// Starting energy of an ecosystem agent.
const START_ENERGY: f64 = 10.0;

/// Events a flood burst publishes per step.
const FLOOD_BURST: usize = 150;

/// `faulty_rule` fails on every Nth attempt.
const FAULT_PERIOD: u64 = 3;

/// Upper bound on scheduler yields while waiting for bridged messages.
const SETTLE_YIELDS: usize = 10_000;

/// Results from running a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    pub total_steps: u64,

    /// Virtual time at the end, in seconds
    pub final_time_secs: f64,

    pub final_agent_count: usize,

    /// Every failed assertion, joined
    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,

    /// One frame per step, for export
    pub frames: Vec<SimFrame>,

    /// Final registry contents
    pub registry: BTreeMap<String, f64>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub rule_failures: u64,
    pub sandbox_faults: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub memories_recorded: u64,
}

/// Accumulates failed assertions.
#[derive(Default)]
struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn that(&mut self, ok: bool, what: impl FnOnce() -> String) {
        if !ok {
            let msg = what();
            warn!("check failed: {}", msg);
            self.failures.push(msg);
        }
    }

    fn reason(&self) -> Option<String> {
        (!self.failures.is_empty()).then(|| self.failures.join("; "))
    }
}

/// Runs scenarios.
pub struct ScenarioRunner {
    config: SimConfig,
}

impl ScenarioRunner {
    pub fn new(seed: u64, num_agents: usize) -> Self {
        Self::from_config(SimConfig {
            seed,
            num_agents,
            ..SimConfig::default()
        })
    }

    pub fn from_config(config: SimConfig) -> Self {
        Self { config }
    }

    pub fn with_steps(mut self, steps: u64) -> Self {
        self.config.num_steps = steps;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.config.seed);
        match scenario {
            ScenarioId::Ecosystem => self.run_ecosystem(),
            ScenarioId::FaultyRule => self.run_faulty_rule(),
            ScenarioId::Flood => self.run_flood(),
            ScenarioId::GuestAgents => self.run_guest_agents().await,
        }
    }

    fn finish(
        &self,
        scenario: ScenarioId,
        world: &SimWorld,
        checks: Checks,
        mut metrics: ScenarioMetrics,
        frames: Vec<SimFrame>,
    ) -> ScenarioResult {
        let registry = world.metrics_snapshot();
        metrics.events_published = world.bus.published();
        metrics.events_delivered = world.bus.delivered();
        metrics.events_dropped = world.bus.dropped();
        metrics.sandbox_faults = registry
            .iter()
            .filter(|(k, _)| k.starts_with("matrix_sandbox_fault_count"))
            .map(|(_, v)| *v as u64)
            .sum();
        metrics.messages_delivered = world.network.delivered();
        metrics.messages_dropped = world.network.dropped();
        metrics.memories_recorded = world
            .souls
            .ids()
            .iter()
            .map(|id| world.souls.memory_len(id) as u64)
            .sum();

        let failure_reason = checks.reason();
        ScenarioResult {
            scenario,
            seed: self.config.seed,
            passed: failure_reason.is_none(),
            total_steps: world.tick_count(),
            final_time_secs: world.time_secs(),
            final_agent_count: world.matrices().iter().map(|m| m.agent_count()).sum(),
            failure_reason,
            metrics,
            frames,
            registry,
        }
    }

    /// Ecosystem: metabolism (10) → forage (5) → census (1).
    ///
    /// **Assertion**: every step's events arrive in priority order, each
    /// meal is in the soul's memory, living agents have positive energy,
    /// and souls survive a persist/restore round trip.
    fn run_ecosystem(&self) -> ScenarioResult {
        let mut world = SimWorld::new(self.config.clone());
        let matrix = world.add_matrix("ecosystem");

        for i in 0..self.config.num_agents {
            let agent = Agent::new(SimWorld::agent_id(i))
                .with_state("energy", START_ENERGY)
                .with_state("alive", true)
                .with_state("meals", 0i64);
            if let Err(e) = matrix.add_agent(agent) {
                warn!("agent setup failed: {}", e);
            }
        }

        matrix.add_rule(Rule::new("metabolism", 10, |ctx| {
            let mut events = Vec::new();
            for agent in ctx.agents().iter().filter(|a| is_alive(a)) {
                let energy = agent.get_f64("energy").unwrap_or(0.0) - 1.0;
                agent.set("energy", energy);
                if energy <= 0.0 {
                    agent.set("alive", false);
                    events.push(ctx.event(MatrixEvent::new("starved").for_agent(agent.id())));
                }
            }
            events.push(ctx.event(MatrixEvent::new("metabolism").with("step", ctx.step() as f64)));
            Ok(events)
        }));

        let rng = world.context.clone();
        matrix.add_rule(Rule::new("forage", 5, move |ctx| {
            let souls = ctx.souls().ok_or_else(|| RuleError::failed("no soul store"))?;
            let mut events = Vec::new();
            for agent in ctx.agents().iter().filter(|a| is_alive(a)) {
                if ctx.is_cancelled() {
                    return Err(RuleError::Cancelled);
                }
                let (found, gain) = forage_roll(&rng);
                if !found {
                    continue;
                }
                let energy = agent.get_f64("energy").unwrap_or(0.0) + gain;
                agent.set("energy", energy);
                let meals = agent.get_f64("meals").unwrap_or(0.0) as i64 + 1;
                agent.set("meals", meals);

                souls.add_memory(
                    agent.id(),
                    MemoryEntry::new(ctx.timestamp_ms(), format!("found food worth {:.2}", gain), "forage")
                        .with_tags(["food", "energy"]),
                );
                souls.set_value(agent.id(), "energy", energy);
                events.push(ctx.event(MatrixEvent::new("forage").for_agent(agent.id()).with("gain", gain)));
            }
            Ok(events)
        }));

        matrix.add_rule(Rule::new("census", 1, |ctx| {
            let alive = ctx.agents().iter().filter(|a| is_alive(a)).count();
            Ok(vec![ctx.event(
                MatrixEvent::new("census")
                    .with("alive", alive as f64)
                    .with("population", ctx.agents().len() as f64),
            )])
        }));

        let cancel = CancelToken::new();
        let mut observer = world.bus.subscribe(EventType::Matrix, cancel.clone());
        let mut checks = Checks::default();
        let mut metrics = ScenarioMetrics::default();
        let mut frames = Vec::new();

        for _ in 0..self.config.num_steps {
            let dropped_before = world.bus.dropped();
            let results = world.step(&cancel);
            let mut notes = Vec::new();
            let mut published = 0;
            for (id, result) in results {
                match result {
                    Ok(report) => published += report.events_published,
                    Err(e) => {
                        metrics.rule_failures += 1;
                        notes.push(SimEvent::warn(format!("{}: {}", id, e)));
                    }
                }
            }

            let kinds: Vec<String> = observer
                .drain()
                .iter()
                .filter_map(|e| e.as_matrix().map(|m| m.kind.clone()))
                .collect();
            let tick = world.tick_count();
            if world.bus.dropped() > dropped_before {
                notes.push(SimEvent::warn("observer overflowed; ordering not checked"));
                frames.push(frame(&world, &matrix, published, notes));
                continue;
            }
            let metabolism = kinds.iter().position(|k| k == "metabolism");
            let first_forage = kinds.iter().position(|k| k == "forage");
            checks.that(kinds.last().map(String::as_str) == Some("census"), || {
                format!("step {}: census was not the last event", tick)
            });
            checks.that(
                match (metabolism, first_forage) {
                    (Some(m), Some(f)) => m < f,
                    (Some(_), None) => true,
                    _ => false,
                },
                || format!("step {}: forage ran before metabolism", tick),
            );

            frames.push(frame(&world, &matrix, published, notes));
        }

        for agent in matrix.agent_ids().iter().filter_map(|id| matrix.get_agent(id)) {
            let meals = agent.get_f64("meals").unwrap_or(0.0) as usize;
            let memories = world.souls.get_memories(agent.id(), &["food"]).len();
            checks.that(meals == memories, || {
                format!("{}: {} meals but {} food memories", agent.id(), meals, memories)
            });
            if is_alive(&agent) {
                let energy = agent.get_f64("energy").unwrap_or(0.0);
                checks.that(energy > 0.0, || {
                    format!("{} alive with energy {:.2}", agent.id(), energy)
                });
            }
        }

        match self.check_persistence(&world.souls) {
            Ok(restored) => checks.that(restored == world.souls.len(), || {
                format!("restored {} of {} souls", restored, world.souls.len())
            }),
            Err(e) => checks.that(false, || format!("soul persistence failed: {}", e)),
        }

        cancel.cancel();
        self.finish(ScenarioId::Ecosystem, &world, checks, metrics, frames)
    }

    /// Persists every soul, restores into a fresh store and compares.
    /// Returns how many souls came back identical.
    fn check_persistence(&self, souls: &SoulStore) -> Result<usize, matrix_env::EnvError> {
        let store: Box<dyn ByteStore> = match &self.config.storage_path {
            Some(path) => Box::new(SledStore::open(path)?),
            None => Box::new(MemoryStore::new()),
        };

        let restored = SoulStore::new();
        let mut matching = 0;
        for id in souls.ids() {
            souls.persist(&id, &*store)?;
            if restored.restore(&id, &*store)?
                && restored.get_memories(&id, &[]) == souls.get_memories(&id, &[])
                && restored.get_value(&id, "energy") == souls.get_value(&id, "energy")
            {
                matching += 1;
            }
        }
        debug!(souls = matching, "persistence round trip");
        Ok(matching)
    }

    /// FaultyRule: counter (3) → flaky (2, fails every 3rd attempt) → after (1).
    ///
    /// **Assertion**: a failed step keeps the counter's effects and events,
    /// never runs `after`, reports `flaky` as the culprit, and leaves the
    /// matrix usable.
    fn run_faulty_rule(&self) -> ScenarioResult {
        let mut world = SimWorld::new(self.config.clone());
        let matrix = world.add_matrix("faulty");
        if let Err(e) = matrix.add_agent(Agent::new("ledger").with_state("count", 0i64)) {
            warn!("ledger setup failed: {}", e);
        }

        matrix.add_rule(Rule::new("counter", 3, |ctx| {
            let ledger = ctx
                .agent("ledger")
                .ok_or_else(|| RuleError::AgentNotFound("ledger".into()))?;
            let count = ledger.get_f64("count").unwrap_or(0.0) as i64 + 1;
            ledger.set("count", count);
            Ok(vec![ctx.event(MatrixEvent::new("tick").with("count", count as f64))])
        }));

        let attempts = Arc::new(AtomicU64::new(0));
        let flaky_attempts = attempts.clone();
        matrix.add_rule(Rule::new("flaky", 2, move |_| {
            let attempt = flaky_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempt % FAULT_PERIOD == 0 {
                return Err(RuleError::failed(format!("injected failure on attempt {}", attempt)));
            }
            Ok(Vec::new())
        }));

        matrix.add_rule(Rule::new("after", 1, |ctx| {
            Ok(vec![ctx.event(MatrixEvent::new("after"))])
        }));

        let cancel = CancelToken::new();
        let mut checks = Checks::default();
        let mut metrics = ScenarioMetrics::default();
        let mut frames = Vec::new();

        for _ in 0..self.config.num_steps {
            let mut notes = Vec::new();
            let mut published = 0;
            for (id, result) in world.step(&cancel) {
                match result {
                    Ok(report) => published += report.events_published,
                    Err(MatrixError::RuleEvaluation { rule_id, source }) => {
                        metrics.rule_failures += 1;
                        let tick = world.tick_count();
                        checks.that(rule_id == "flaky", || {
                            format!("step {}: failure blamed on {}", tick, rule_id)
                        });
                        notes.push(SimEvent::warn(format!("{}: rule {} failed: {}", id, rule_id, source)));
                    }
                    Err(e) => {
                        metrics.rule_failures += 1;
                        checks.that(false, || format!("unexpected error: {}", e));
                    }
                }
            }
            frames.push(frame(&world, &matrix, published, notes));
        }

        let steps = self.config.num_steps;
        let expected_failures = steps / FAULT_PERIOD;
        let count = |kind: &str| {
            world
                .registry
                .get(&format!("matrix_rule_event_count{{matrix_id=faulty,kind={}}}", kind))
                .unwrap_or(0.0) as u64
        };

        checks.that(metrics.rule_failures == expected_failures, || {
            format!("{} failures, expected {}", metrics.rule_failures, expected_failures)
        });
        checks.that(count("tick") == steps, || {
            format!("counter published {} events over {} steps", count("tick"), steps)
        });
        checks.that(count("after") == steps - expected_failures, || {
            format!("after ran {} times, expected {}", count("after"), steps - expected_failures)
        });
        let ledger = matrix.get_agent("ledger").and_then(|a| a.get_f64("count"));
        checks.that(ledger == Some(steps as f64), || {
            format!("ledger count {:?}, expected {} (no rollback)", ledger, steps)
        });
        checks.that(matrix.step_count() == steps - expected_failures, || {
            format!("matrix completed {} steps", matrix.step_count())
        });
        checks.that(matrix.state() == MatrixState::Idle, || {
            format!("matrix left in {:?}", matrix.state())
        });

        self.finish(ScenarioId::FaultyRule, &world, checks, metrics, frames)
    }

    /// Flood: each step publishes a burst into a stalled and a live subscriber.
    ///
    /// **Assertion**: the stalled queue holds at most its capacity, the live
    /// subscriber loses only the overflow of each burst, every other delivery
    /// is counted as dropped, and closing the bus ends both sequences.
    fn run_flood(&self) -> ScenarioResult {
        let mut world = SimWorld::new(self.config.clone());
        let matrix = world.add_matrix("flood");
        matrix.add_rule(Rule::new("burst", 0, |ctx| {
            Ok((0..FLOOD_BURST)
                .map(|i| ctx.event(MatrixEvent::new("burst").with("seq", i as f64)))
                .collect())
        }));

        let capacity = self.config.queue_capacity as u64;
        let cancel = CancelToken::new();
        let mut stalled = world.bus.subscribe(EventType::Matrix, CancelToken::new());
        let mut live = world.bus.subscribe(EventType::Matrix, CancelToken::new());

        let mut checks = Checks::default();
        let metrics = ScenarioMetrics::default();
        let mut frames = Vec::new();
        let mut live_total = 0u64;

        for _ in 0..self.config.num_steps {
            let mut published = 0;
            for (_, result) in world.step(&cancel) {
                if let Ok(report) = result {
                    published += report.events_published;
                }
            }
            let got = live.drain().len() as u64;
            let tick = world.tick_count();
            checks.that(got == capacity.min(FLOOD_BURST as u64), || {
                format!("step {}: live subscriber got {} events", tick, got)
            });
            live_total += got;
            frames.push(frame(&world, &matrix, published, Vec::new()));
        }

        let total = self.config.num_steps * FLOOD_BURST as u64;
        let stalled_total = stalled.drain().len() as u64;
        checks.that(stalled_total == capacity.min(total), || {
            format!("stalled subscriber holds {} events", stalled_total)
        });
        let expected_dropped = 2 * total - live_total - stalled_total;
        checks.that(world.bus.dropped() == expected_dropped, || {
            format!("{} drops counted, expected {}", world.bus.dropped(), expected_dropped)
        });

        world.bus.close();
        checks.that(live.try_recv().is_none() && stalled.try_recv().is_none(), || {
            "subscriptions still yield events after close".to_string()
        });
        checks.that(world.bus.subscriber_count(EventType::Matrix) == 0, || {
            "subscribers left after close".to_string()
        });

        self.finish(ScenarioId::Flood, &world, checks, metrics, frames)
    }

    /// GuestAgents: pinger guests message their ring neighbour over the
    /// transport bridge; a spinner and a trespasser fault and are evicted. The
    /// mailbox node is partitioned away for the middle third of the run.
    ///
    /// **Assertion**: faults are classified (resource_exceeded vs
    /// invalid_access), healthy guests keep ticking, and every ping is either
    /// delivered or dropped by the partition.
    async fn run_guest_agents(&self) -> ScenarioResult {
        let mut world = SimWorld::new(self.config.clone());
        let matrix = world.add_matrix("guests");
        let mut checks = Checks::default();
        let mut metrics = ScenarioMetrics::default();

        let pingers = self.config.num_agents.max(2);
        let mut roster: Vec<(String, &str, &str)> = (0..pingers)
            .map(|i| (SimWorld::agent_id(i), "pinger", guests::PINGER))
            .collect();
        roster.push(("spinner".into(), "spinner", guests::SPINNER));
        roster.push(("trespasser".into(), "trespasser", guests::TRESPASSER));

        for (id, role, code) in &roster {
            let spawned = world
                .spawn_guest(id, code.as_bytes())
                .map(|agent| agent.with_state("role", *role));
            match spawned.map_err(|e| e.to_string()).and_then(|agent| {
                matrix.add_agent(agent).map_err(|e| e.to_string())
            }) {
                Ok(agent) => {
                    if let Err(e) = agent.start() {
                        checks.that(false, || format!("{} failed to start: {}", id, e));
                    }
                }
                Err(e) => checks.that(false, || format!("{} not spawned: {}", id, e)),
            }
        }

        // Node 0 hosts the matrix; node 1 hosts the agents' mailboxes.
        let home = world.transport(0);
        let mailbox = world.transport(1);
        let mailbox_bus = EventBus::new();
        let bridge_cancel = CancelToken::new();

        let outbound = TransportBridge::new(Arc::new(home.clone()), world.bus.clone(), world.context.clone())
            .with_registry(world.registry.clone())
            .spawn_outbound(CancelToken::new());
        let inbound_bridge =
            TransportBridge::new(Arc::new(mailbox.clone()), mailbox_bus.clone(), world.context.clone())
                .with_registry(world.registry.clone());
        let mut inbound = Vec::new();
        for i in 0..pingers {
            match inbound_bridge
                .spawn_inbound(&agent_topic(&SimWorld::agent_id(i)), bridge_cancel.clone())
                .await
            {
                Ok(handle) => inbound.push(handle),
                Err(e) => checks.that(false, || format!("mailbox subscribe failed: {}", e)),
            }
        }

        matrix.add_rule(Rule::new("guest_tick", 10, |ctx| {
            let ring: Vec<&str> = ctx
                .agents()
                .iter()
                .filter(|a| a.get("role").and_then(|r| r.as_str().map(|s| s == "pinger")) == Some(true))
                .map(|a| a.id())
                .collect();

            let mut events = Vec::new();
            for agent in ctx.agents() {
                if agent.get("faulted").is_some() {
                    continue;
                }
                if let Some(pos) = ring.iter().position(|id| *id == agent.id()) {
                    let target = guests::target_record(ring[(pos + 1) % ring.len()]);
                    agent
                        .with_sandbox_mut(|sb| sb.write_working_buffer(TARGET_OFFSET, &target))
                        .transpose()
                        .map_err(RuleError::failed)?;
                }

                match agent.call("tick") {
                    Ok(()) => {
                        if let Some(ticks) = agent.with_sandbox_mut(|sb| read_ticks(sb.working_buffer())).flatten() {
                            agent.set("ticks", ticks as i64);
                        }
                    }
                    Err(e) => {
                        agent.set("faulted", e.kind());
                        events.push(ctx.event(
                            MatrixEvent::new("agent_fault")
                                .for_agent(agent.id())
                                .with(e.kind(), 1.0),
                        ));
                    }
                }
            }
            Ok(events)
        }));

        let steps = self.config.num_steps;
        let partition = (steps / 3)..(2 * steps / 3);
        let cancel = CancelToken::new();
        let mut frames = Vec::new();
        let mut pings_sent = 0u64;
        let mut partitioned_pings = 0u64;

        for step in 0..steps {
            let mut notes = Vec::new();
            if step == partition.start && !partition.is_empty() {
                world.partition(vec![home.local_id()], vec![mailbox.local_id()]);
                notes.push(SimEvent::info("mailbox node partitioned"));
            } else if step == partition.end {
                world.heal_partitions();
                notes.push(SimEvent::info("partition healed"));
            }
            let partitioned = partition.contains(&step);

            let mut published = 0;
            for (id, result) in world.step(&cancel) {
                match result {
                    Ok(report) => published += report.events_published,
                    Err(e) => {
                        metrics.rule_failures += 1;
                        notes.push(SimEvent::warn(format!("{}: {}", id, e)));
                    }
                }
            }

            let healthy = matrix
                .agent_ids()
                .iter()
                .filter_map(|id| matrix.get_agent(id))
                .filter(|a| a.get("faulted").is_none() && a.get("ticks").is_some())
                .count() as u64;
            pings_sent += healthy;
            if partitioned {
                partitioned_pings += healthy;
            }

            for id in matrix.agent_ids() {
                let faulted = matrix
                    .get_agent(&id)
                    .and_then(|a| a.get("faulted"))
                    .and_then(|v| v.as_str().map(str::to_string));
                if let Some(kind) = faulted {
                    matrix.remove_agent(&id);
                    notes.push(SimEvent::warn(format!("evicted {} ({})", id, kind)));
                }
            }

            self.settle(&world, pings_sent).await;
            frames.push(frame(&world, &matrix, published, notes));
        }

        // Closing the bus lets the outbound bridge drain and exit; inbound
        // bridges drain their queues before honouring the cancel.
        world.bus.close();
        let _ = outbound.await;
        bridge_cancel.cancel();
        for handle in inbound {
            let _ = handle.await;
        }

        let faults = |kind: &str| {
            world
                .registry
                .get(&format!("matrix_sandbox_fault_count{{kind={}}}", kind))
                .unwrap_or(0.0)
        };
        checks.that(faults("resource_exceeded") == 1.0, || {
            format!("{} fuel faults", faults("resource_exceeded"))
        });
        checks.that(faults("invalid_access") == 1.0, || {
            format!("{} access faults", faults("invalid_access"))
        });
        checks.that(matrix.get_agent("spinner").is_none() && matrix.get_agent("trespasser").is_none(), || {
            "faulted guests were not evicted".to_string()
        });
        checks.that(matrix.agent_count() == pingers, || {
            format!("{} agents remain, expected {}", matrix.agent_count(), pingers)
        });

        for id in matrix.agent_ids() {
            let Some(agent) = matrix.get_agent(&id) else {
                continue;
            };
            let ticks = agent.get_f64("ticks").unwrap_or(0.0) as u64;
            checks.that(ticks == steps, || format!("{} ticked {} of {} times", id, ticks, steps));
            let logs = agent.with_sandbox_mut(|sb| sb.logs()).unwrap_or_default();
            checks.that(logs.iter().any(|l| l == "guest online"), || {
                format!("{} never logged its start", id)
            });
        }

        checks.that(world.registry.get("matrix_peer_count") == Some(2.0), || {
            format!("peer gauge reads {:?}, expected 2", world.registry.get("matrix_peer_count"))
        });
        let delivered = world.network.delivered();
        let dropped = world.network.dropped();
        checks.that(delivered == pings_sent - partitioned_pings, || {
            format!("{} pings delivered, expected {}", delivered, pings_sent - partitioned_pings)
        });
        checks.that(dropped == partitioned_pings, || {
            format!("{} pings dropped, expected {}", dropped, partitioned_pings)
        });
        let received: f64 = world
            .registry
            .get_metrics()
            .iter()
            .filter(|(k, _)| k.starts_with("matrix_message_count") && k.ends_with("direction=in}"))
            .map(|(_, v)| *v)
            .sum();
        checks.that(received as u64 == delivered, || {
            format!("mailboxes received {} of {} delivered pings", received, delivered)
        });

        matrix.stop();
        self.finish(ScenarioId::GuestAgents, &world, checks, metrics, frames)
    }

    /// Yields to the bridge tasks until `expected` pings have left node 0.
    async fn settle(&self, world: &SimWorld, expected: u64) {
        for _ in 0..SETTLE_YIELDS {
            if world.network.delivered() + world.network.dropped() >= expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        warn!(expected, "bridge did not settle");
    }
}

fn is_alive(agent: &Agent) -> bool {
    agent.get("alive") == Some(StateValue::Bool(true))
}

fn forage_roll(ctx: &SimContext) -> (bool, f64) {
    ctx.with_rng(|rng| {
        let found = rng.gen_bool(FORAGE_CHANCE);
        let gain = rng.gen_range(1.0..4.0);
        (found, gain)
    })
}

fn read_ticks(buffer: Option<&[u8]>) -> Option<u32> {
    let bytes = buffer?.get(TICKS_OFFSET..TICKS_OFFSET + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn frame(world: &SimWorld, matrix: &Matrix, events_published: usize, events: Vec<SimEvent>) -> SimFrame {
    let agents = matrix
        .agent_ids()
        .into_iter()
        .filter_map(|id| matrix.get_agent(&id))
        .map(|agent| AgentFrame {
            agent_id: agent.id().to_string(),
            state: agent.snapshot(),
        })
        .collect();
    SimFrame {
        step: world.tick_count(),
        time_sec: world.time_secs(),
        events_published,
        agents,
        events,
    }
}
