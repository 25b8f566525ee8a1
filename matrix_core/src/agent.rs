//! Agents hosted by a Matrix: identity, typed state bag, optional sandbox.

use crate::sandbox::{AgentSandbox, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError, RwLock};

/// One typed value in an agent's state bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl StateValue {
    /// Numeric view; `Text` has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            StateValue::Int(i) => Some(*i as f64),
            StateValue::Float(f) => Some(*f),
            StateValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Float(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Text(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Text(v)
    }
}

/// An agent registered in a Matrix.
///
/// State and sandbox are independently locked so rules can read and
/// update state while a guest call is in flight on another thread.
pub struct Agent {
    id: String,
    state: RwLock<BTreeMap<String, StateValue>>,
    sandbox: Mutex<Option<AgentSandbox>>,
}

impl Agent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(BTreeMap::new()),
            sandbox: Mutex::new(None),
        }
    }

    /// Attaches the sandbox that executes this agent's program.
    pub fn with_sandbox(self, sandbox: AgentSandbox) -> Self {
        *self.sandbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(sandbox);
        self
    }

    /// Seeds one state entry at construction.
    pub fn with_state(self, key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ---- State bag ---------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<StateValue> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Point-in-time copy of the whole state bag.
    pub fn snapshot(&self) -> BTreeMap<String, StateValue> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // ---- Sandbox -----------------------------------------------------------

    pub fn has_sandbox(&self) -> bool {
        self.sandbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Starts the sandbox. An agent without one has nothing to run.
    pub fn start(&self) -> Result<(), SandboxError> {
        match self.sandbox.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            Some(sandbox) => sandbox.start(),
            None => Ok(()),
        }
    }

    /// Invokes an exported guest function.
    pub fn call(&self, export: &str) -> Result<(), SandboxError> {
        match self.sandbox.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            Some(sandbox) => sandbox.call(export),
            None => Err(SandboxError::Runtime(format!("agent {} has no sandbox", self.id))),
        }
    }

    /// Tears down the sandbox. Idempotent.
    pub fn stop(&self) {
        if let Some(sandbox) = self.sandbox.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            sandbox.stop();
        }
    }

    /// Runs `f` against the sandbox, if one is attached.
    pub fn with_sandbox_mut<R>(&self, f: impl FnOnce(&mut AgentSandbox) -> R) -> Option<R> {
        self.sandbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(f)
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("state", &self.snapshot())
            .field("sandbox", &self.has_sandbox())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ResourceLimits, SandboxConfig, SandboxEnv};

    #[test]
    fn test_state_bag() {
        let agent = Agent::new("a1")
            .with_state("energy", 10.0)
            .with_state("alive", true)
            .with_state("name", "zed");

        assert_eq!(agent.get_f64("energy"), Some(10.0));
        assert_eq!(agent.get_f64("alive"), Some(1.0));
        assert_eq!(agent.get("name").unwrap().as_str(), Some("zed"));
        assert_eq!(agent.get_f64("name"), None);
        assert!(agent.get("missing").is_none());

        agent.set("energy", 4i64);
        assert_eq!(agent.get("energy"), Some(StateValue::Int(4)));
        assert_eq!(agent.snapshot().len(), 3);
    }

    #[test]
    fn test_state_value_serializes_untagged() {
        let json = serde_json::to_string(&StateValue::Float(1.5)).unwrap();
        assert_eq!(json, "1.5");
        let back: StateValue = serde_json::from_str("\"hi\"").unwrap();
        assert_eq!(back, StateValue::Text("hi".into()));
    }

    #[test]
    fn test_agent_without_sandbox() {
        let agent = Agent::new("plain");
        assert!(!agent.has_sandbox());
        assert!(agent.start().is_ok());
        assert!(agent.call("tick").is_err());
        agent.stop();
    }

    #[test]
    fn test_agent_runs_sandbox() {
        let code = wat::parse_str(
            r#"
            (module
              (import "env" "log" (func $log (param i32 i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "tick")
              (func (export "tick") (call $log (i32.const 0) (i32.const 4))))
        "#,
        )
        .unwrap();
        let config = SandboxConfig::new("guest", code).with_limits(ResourceLimits {
            max_memory_pages: 1,
            max_fuel: 50_000,
        });
        let sandbox = AgentSandbox::new(config, SandboxEnv::default()).unwrap();
        let agent = Agent::new("guest").with_sandbox(sandbox);

        agent.start().unwrap();
        agent.call("tick").unwrap();
        agent.call("tick").unwrap();
        let logs = agent.with_sandbox_mut(|sb| sb.logs()).unwrap();
        assert_eq!(logs, vec!["tick".to_string(), "tick".to_string()]);

        agent.stop();
        agent.stop();
        assert_eq!(agent.with_sandbox_mut(|sb| sb.is_stopped()), Some(true));
    }
}
