//! The Matrix Engine - rule-governed simulated environments.
//!
//! A Matrix owns an ordered rule set and a registry of agents. Each
//! [`Matrix::step`] runs exactly one rule pass:
//!
//! 1. snapshot the rule list
//! 2. stable-sort it by descending priority (ties keep insertion order)
//! 3. evaluate each rule against live state; forward its events to the
//!    metrics sink and the bus, in the order the rule returned them
//!
//! A failing rule aborts the rest of the pass. Whatever earlier rules did
//! in the same step stays done: steps are not transactional.

use crate::agent::Agent;
use crate::event::{Event, MatrixEvent};
use crate::event_bus::EventBus;
use crate::metrics::MetricsSink;
use crate::soul::SoulStore;
use matrix_env::{CancelToken, NodeContext, TokioContext};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use thiserror::Error;
use tracing::{debug, info, warn};

// =============================================================================
// ERRORS
// =============================================================================

/// Failure reported by a rule's evaluation function.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuleError {
    #[error("{0}")]
    Failed(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// The rule observed the step's cancellation signal.
    #[error("cancelled")]
    Cancelled,
}

impl RuleError {
    pub fn failed(msg: impl fmt::Display) -> Self {
        RuleError::Failed(msg.to_string())
    }
}

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("Rule {rule_id} failed: {source}")]
    RuleEvaluation {
        rule_id: String,
        #[source]
        source: RuleError,
    },

    #[error("Duplicate agent id: {0}")]
    DuplicateId(String),

    #[error("Step already in progress")]
    StepInProgress,

    #[error("Matrix is stopped")]
    Stopped,

    #[error("Step cancelled")]
    Cancelled,
}

// =============================================================================
// RULES
// =============================================================================

/// Everything a rule may look at while it runs.
pub struct RuleContext<'a> {
    matrix_id: &'a str,
    step: u64,
    timestamp_ms: i64,
    agents: &'a [Arc<Agent>],
    souls: Option<&'a SoulStore>,
    cancel: &'a CancelToken,
}

impl<'a> RuleContext<'a> {
    pub fn matrix_id(&self) -> &str {
        self.matrix_id
    }

    /// Index of the step being evaluated (first step is 1).
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Registered agents, ordered by id.
    pub fn agents(&self) -> &[Arc<Agent>] {
        self.agents
    }

    pub fn agent(&self, id: &str) -> Option<&Arc<Agent>> {
        self.agents.iter().find(|a| a.id() == id)
    }

    pub fn souls(&self) -> Option<&SoulStore> {
        self.souls
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wraps a matrix event with this matrix as origin and the step's timestamp.
    pub fn event(&self, event: MatrixEvent) -> Event {
        Event::matrix(self.matrix_id, self.timestamp_ms, event)
    }
}

pub type RuleFn = dyn Fn(&RuleContext<'_>) -> Result<Vec<Event>, RuleError> + Send + Sync;

/// A prioritized evaluation function. Higher priority runs first.
#[derive(Clone)]
pub struct Rule {
    id: String,
    priority: i32,
    evaluate: Arc<RuleFn>,
}

impl Rule {
    pub fn new<F>(id: impl Into<String>, priority: i32, evaluate: F) -> Self
    where
        F: Fn(&RuleContext<'_>) -> Result<Vec<Event>, RuleError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            priority,
            evaluate: Arc::new(evaluate),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Event>, RuleError> {
        (self.evaluate)(ctx)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish()
    }
}

// =============================================================================
// MATRIX
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixState {
    Idle,
    Stepping,
    Stopped,
}

/// Outcome of one successful step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: u64,
    pub rules_evaluated: usize,
    pub events_published: usize,
}

pub struct Matrix {
    id: String,
    rules: RwLock<Vec<Rule>>,
    agents: RwLock<BTreeMap<String, Arc<Agent>>>,
    metrics: Arc<dyn MetricsSink>,
    bus: EventBus,
    souls: Option<Arc<SoulStore>>,
    context: Arc<dyn NodeContext>,
    /// Held for the duration of a step (single writer).
    step_lock: Mutex<()>,
    state: Mutex<MatrixState>,
    steps: AtomicU64,
}

impl Matrix {
    pub fn new(id: impl Into<String>, metrics: Arc<dyn MetricsSink>, bus: EventBus) -> Self {
        Self {
            id: id.into(),
            rules: RwLock::new(Vec::new()),
            agents: RwLock::new(BTreeMap::new()),
            metrics,
            bus,
            souls: None,
            context: TokioContext::shared(),
            step_lock: Mutex::new(()),
            state: Mutex::new(MatrixState::Idle),
            steps: AtomicU64::new(0),
        }
    }

    /// Gives rules read/write access to a soul store.
    pub fn with_souls(mut self, souls: Arc<SoulStore>) -> Self {
        self.souls = Some(souls);
        self
    }

    /// Replaces the clock used to timestamp events.
    pub fn with_context(mut self, context: Arc<dyn NodeContext>) -> Self {
        self.context = context;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> MatrixState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completed steps so far.
    pub fn step_count(&self) -> u64 {
        self.steps.load(Ordering::Acquire)
    }

    // ---- Rules -------------------------------------------------------------

    /// Appends a rule. Takes effect from the next step.
    pub fn add_rule(&self, rule: Rule) {
        debug!(matrix_id = %self.id, rule_id = %rule.id, priority = rule.priority, "rule added");
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    // ---- Agents ------------------------------------------------------------

    /// Registers an agent; ids are unique within a matrix.
    pub fn add_agent(&self, agent: Agent) -> Result<Arc<Agent>, MatrixError> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if agents.contains_key(agent.id()) {
            return Err(MatrixError::DuplicateId(agent.id().to_string()));
        }
        let agent = Arc::new(agent);
        agents.insert(agent.id().to_string(), agent.clone());
        debug!(matrix_id = %self.id, agent_id = %agent.id(), "agent added");
        Ok(agent)
    }

    /// Unregisters an agent and tears down its sandbox.
    pub fn remove_agent(&self, id: &str) -> Option<Arc<Agent>> {
        let removed = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(agent) = &removed {
            agent.stop();
            debug!(matrix_id = %self.id, agent_id = %id, "agent removed");
        }
        removed
    }

    pub fn get_agent(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Snapshot of the bound metrics sink.
    pub fn get_metrics(&self) -> HashMap<String, f64> {
        self.metrics.get_metrics()
    }

    // ---- Stepping ----------------------------------------------------------

    /// Runs one full rule pass.
    ///
    /// Fails with [`MatrixError::StepInProgress`] if another step holds the
    /// matrix. The cancellation signal is checked before each rule; rules
    /// may also observe it through [`RuleContext::is_cancelled`].
    pub fn step(&self, cancel: &CancelToken) -> Result<StepReport, MatrixError> {
        let _guard = match self.step_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(MatrixError::StepInProgress),
        };

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == MatrixState::Stopped {
                return Err(MatrixError::Stopped);
            }
            *state = MatrixState::Stepping;
        }

        let result = self.run_rules(cancel);

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == MatrixState::Stepping {
                *state = MatrixState::Idle;
            }
        }
        result
    }

    fn run_rules(&self, cancel: &CancelToken) -> Result<StepReport, MatrixError> {
        let step = self.steps.load(Ordering::Acquire) + 1;

        let mut rules = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // Vec::sort_by is stable: equal priorities keep insertion order.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let agents: Vec<Arc<Agent>> = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let ctx = RuleContext {
            matrix_id: &self.id,
            step,
            timestamp_ms: self.context.unix_millis(),
            agents: &agents,
            souls: self.souls.as_deref(),
            cancel,
        };

        let mut published = 0;
        for (evaluated, rule) in rules.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(matrix_id = %self.id, step, evaluated, "step cancelled");
                return Err(MatrixError::Cancelled);
            }

            let events = match rule.evaluate(&ctx) {
                Ok(events) => events,
                Err(RuleError::Cancelled) => {
                    info!(matrix_id = %self.id, step, rule_id = %rule.id, "step cancelled by rule");
                    return Err(MatrixError::Cancelled);
                }
                Err(source) => {
                    warn!(matrix_id = %self.id, step, rule_id = %rule.id, error = %source, "rule failed");
                    return Err(MatrixError::RuleEvaluation {
                        rule_id: rule.id.clone(),
                        source,
                    });
                }
            };

            for event in events {
                self.metrics.record_event(&event);
                self.bus.publish(event);
                published += 1;
            }
        }

        self.steps.store(step, Ordering::Release);
        debug!(matrix_id = %self.id, step, rules = rules.len(), events = published, "step complete");
        Ok(StepReport {
            step,
            rules_evaluated: rules.len(),
            events_published: published,
        })
    }

    /// Moves the matrix to `Stopped` and tears down every agent sandbox.
    /// Waits for an in-flight step to finish.
    pub fn stop(&self) {
        let _guard = self.step_lock.lock().unwrap_or_else(PoisonError::into_inner);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = MatrixState::Stopped;
        for agent in self.agents.read().unwrap_or_else(PoisonError::into_inner).values() {
            agent.stop();
        }
        info!(matrix_id = %self.id, steps = self.step_count(), "matrix stopped");
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("rules", &self.rule_count())
            .field("agents", &self.agent_count())
            .field("steps", &self.step_count())
            .finish()
    }
}
