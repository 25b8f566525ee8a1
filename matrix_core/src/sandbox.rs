//! Agent Sandbox - isolated, metered execution of untrusted guest code.
//!
//! A guest is a WebAssembly module run under wasmtime with:
//!
//! - a **fuel** budget (instruction metering); exhaustion traps
//! - a **memory** bound of `max_memory_pages` 64 KiB pages, enforced by a
//!   store limiter; growth past it traps
//! - exactly four host calls (see [`crate::host_calls`])
//!
//! Guest failures never propagate as panics into the host. Every abnormal
//! end of a call is classified into a [`SandboxError`] and reported on the
//! event bus as [`AgentEvent::Faulted`].

use crate::event::AgentEvent;
use crate::event_bus::EventBus;
use crate::host_calls::{
    register_host_calls, HostFault, HostState, MemoryExhausted, SandboxObserver, WorkingBuffer,
    PAGE_SIZE,
};
use crate::metrics::MetricsSink;
use matrix_env::{NodeContext, TokioContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use wasmtime::{Engine, Instance, Linker, Memory, MemoryType, Module, Store, Trap};

/// Largest memory a 32-bit linear memory can address, in pages.
pub const MAX_ADDRESSABLE_PAGES: u32 = 65536;

/// Entry point invoked by [`AgentSandbox::start`] when exported.
pub const ENTRY_POINT: &str = "_start";

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Rejected before execution: bad limits or a module that fails to compile.
    #[error("Invalid sandbox configuration: {0}")]
    Config(String),

    /// Engine, linking or lifecycle failure.
    #[error("Sandbox runtime error: {0}")]
    Runtime(String),

    #[error("Guest trapped: {0}")]
    GuestTrap(String),

    /// Fuel or memory budget exhausted.
    #[error("Guest exceeded resource limit: {0}")]
    ResourceExceeded(String),

    /// A host call was given an out-of-bounds (offset, length).
    #[error("Invalid host-call access: {0}")]
    InvalidAccess(String),
}

impl SandboxError {
    /// Stable label used in logs, metrics and fault events.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Config(_) => "config",
            SandboxError::Runtime(_) => "runtime",
            SandboxError::GuestTrap(_) => "guest_trap",
            SandboxError::ResourceExceeded(_) => "resource_exceeded",
            SandboxError::InvalidAccess(_) => "invalid_access",
        }
    }
}

/// Per-sandbox execution budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Linear memory bound in 64 KiB pages (1..=65536)
    pub max_memory_pages: u32,
    /// Instruction fuel available to the instance
    pub max_fuel: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_pages: 256,
            max_fuel: 1_000_000,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.max_memory_pages == 0 {
            return Err(SandboxError::Config("max_memory_pages must be at least 1".into()));
        }
        if self.max_memory_pages > MAX_ADDRESSABLE_PAGES {
            return Err(SandboxError::Config(format!(
                "max_memory_pages {} exceeds addressable maximum {}",
                self.max_memory_pages, MAX_ADDRESSABLE_PAGES
            )));
        }
        if self.max_fuel == 0 {
            return Err(SandboxError::Config("max_fuel must be at least 1".into()));
        }
        Ok(())
    }

    /// Memory bound in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_pages as usize * PAGE_SIZE
    }
}

/// Everything needed to build one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub agent_id: String,
    /// WebAssembly binary (or text) module
    pub code: Vec<u8>,
    /// Working buffer size in bytes; `None` or zero sizes it to the memory bound
    pub working_buffer_size: Option<usize>,
    pub limits: ResourceLimits,
}

impl SandboxConfig {
    pub fn new(agent_id: impl Into<String>, code: impl Into<Vec<u8>>) -> Self {
        Self {
            agent_id: agent_id.into(),
            code: code.into(),
            working_buffer_size: None,
            limits: ResourceLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_working_buffer(mut self, size: usize) -> Self {
        self.working_buffer_size = Some(size);
        self
    }
}

/// Services a sandbox reports to. All optional except the clock.
#[derive(Clone)]
pub struct SandboxEnv {
    context: Arc<dyn NodeContext>,
    bus: Option<EventBus>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl Default for SandboxEnv {
    fn default() -> Self {
        Self::new(TokioContext::shared())
    }
}

impl SandboxEnv {
    pub fn new(context: Arc<dyn NodeContext>) -> Self {
        Self {
            context,
            bus: None,
            metrics: None,
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn observer(&self) -> SandboxObserver {
        SandboxObserver {
            context: self.context.clone(),
            bus: self.bus.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// One isolated guest instance.
pub struct AgentSandbox {
    agent_id: String,
    limits: ResourceLimits,
    store: Option<Store<HostState>>,
    instance: Option<Instance>,
    observer: SandboxObserver,
    /// Set once a call ends abnormally; the instance is not reused after.
    fault: Option<String>,
}

impl AgentSandbox {
    /// Builds a sandbox: validate limits, allocate the working buffer,
    /// register host calls, compile, provide `env.memory` if the module
    /// imports it, instantiate.
    ///
    /// A start function runs during instantiation; its faults are
    /// classified and reported like those of any later call. The guest's
    /// `_start` does not run until [`start`](Self::start).
    pub fn new(config: SandboxConfig, env: SandboxEnv) -> Result<Self, SandboxError> {
        config.limits.validate()?;

        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(true);
        let engine = Engine::new(&engine_config)
            .map_err(|e| SandboxError::Runtime(format!("engine: {e}")))?;

        let observer = env.observer();
        let max_bytes = config.limits.max_memory_bytes();
        let working_size = config
            .working_buffer_size
            .filter(|size| *size > 0)
            .unwrap_or(max_bytes);
        let working = WorkingBuffer::new(working_size);
        let state = HostState::new(config.agent_id.clone(), working, max_bytes, observer.clone());

        let mut store = Store::new(&engine, state);
        store.limiter(|state| &mut state.limiter);
        store
            .set_fuel(config.limits.max_fuel)
            .map_err(|e| SandboxError::Runtime(format!("fuel: {e}")))?;

        let mut linker = Linker::new(&engine);
        register_host_calls(&mut linker)
            .map_err(|e| SandboxError::Runtime(format!("host calls: {e}")))?;

        let module = Module::new(&engine, &config.code)
            .map_err(|e| SandboxError::Config(format!("module does not compile: {e}")))?;

        // Host memory only for guests that import it.
        let pages = config.limits.max_memory_pages;
        let imports_memory = module
            .imports()
            .any(|import| import.module() == "env" && import.name() == "memory");
        if imports_memory {
            let memory = Memory::new(&mut store, MemoryType::new(pages, Some(pages)))
                .map_err(|e| SandboxError::Runtime(format!("memory: {e}")))?;
            store.data_mut().memory = Some(memory);
            linker
                .define(&store, "env", "memory", memory)
                .map_err(|e| SandboxError::Runtime(format!("host memory: {e}")))?;
        }

        let instance = match linker.instantiate(&mut store, &module) {
            Ok(instance) => instance,
            Err(err) => {
                let exhausted = store.data().limiter.exhausted();
                let error = classify_instantiation(err, exhausted);
                if error.kind() != "runtime" {
                    let kind = error.kind();
                    warn!(
                        agent_id = %config.agent_id,
                        kind,
                        error = %error,
                        "agent faulted during instantiation"
                    );
                    observer.report(
                        &config.agent_id,
                        AgentEvent::Faulted {
                            kind: kind.to_string(),
                            detail: error.to_string(),
                        },
                    );
                }
                return Err(error);
            }
        };

        debug!(agent_id = %config.agent_id, pages, fuel = config.limits.max_fuel, "sandbox ready");

        Ok(Self {
            agent_id: config.agent_id,
            limits: config.limits,
            store: Some(store),
            instance: Some(instance),
            observer,
            fault: None,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn is_stopped(&self) -> bool {
        self.store.is_none()
    }

    /// The error label of the fault that ended this instance, if any.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Runs the exported `_start`, if any. A module without one is a
    /// reactive agent and starting it succeeds without running code.
    pub fn start(&mut self) -> Result<(), SandboxError> {
        self.ensure_runnable()?;
        let has_entry = self.has_export(ENTRY_POINT);
        if has_entry {
            self.invoke(ENTRY_POINT)?;
        }
        info!(agent_id = %self.agent_id, entry = has_entry, "agent started");
        self.observer.publish(&self.agent_id, AgentEvent::Started);
        Ok(())
    }

    /// Invokes a named export taking and returning nothing.
    pub fn call(&mut self, export: &str) -> Result<(), SandboxError> {
        self.ensure_runnable()?;
        if !self.has_export(export) {
            return Err(SandboxError::Runtime(format!("no exported function `{export}`")));
        }
        self.invoke(export)
    }

    /// Releases the instance. Idempotent.
    pub fn stop(&mut self) {
        self.instance = None;
        if self.store.take().is_some() {
            info!(agent_id = %self.agent_id, "agent stopped");
            self.observer.publish(&self.agent_id, AgentEvent::Stopped);
        }
    }

    /// The most recent lines written through the `log` host call, oldest
    /// first. At most
    /// [`LOG_TAIL_BYTES`](crate::host_calls::LOG_TAIL_BYTES) of text is retained.
    pub fn logs(&self) -> Vec<String> {
        self.store
            .as_ref()
            .map(|s| s.data().logs.lines())
            .unwrap_or_default()
    }

    /// Bytes of log text currently retained.
    pub fn log_bytes(&self) -> usize {
        self.store.as_ref().map(|s| s.data().logs.bytes()).unwrap_or(0)
    }

    /// Linear memory allocated by the instance across all its memories.
    pub fn committed_memory(&self) -> usize {
        self.store
            .as_ref()
            .map(|s| s.data().limiter.committed())
            .unwrap_or(0)
    }

    /// Fuel burned so far.
    pub fn fuel_consumed(&self) -> u64 {
        self.store
            .as_ref()
            .and_then(|s| s.get_fuel().ok())
            .map(|remaining| self.limits.max_fuel.saturating_sub(remaining))
            .unwrap_or(0)
    }

    /// Current size of the guest's linear memory in bytes.
    pub fn memory_size(&mut self) -> usize {
        match self.active_memory() {
            Some((memory, store)) => memory.data_size(&*store),
            None => 0,
        }
    }

    pub fn working_buffer(&self) -> Option<&[u8]> {
        self.store.as_ref().map(|s| s.data().working.as_slice())
    }

    /// Host-side write into the working buffer. Bounds are checked the
    /// same way as for guest calls.
    pub fn write_working_buffer(&mut self, offset: u32, data: &[u8]) -> Result<(), SandboxError> {
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| SandboxError::Runtime("sandbox stopped".into()))?;
        let len = u32::try_from(data.len())
            .map_err(|_| SandboxError::InvalidAccess("write larger than 4 GiB".into()))?;
        let target = store
            .data_mut()
            .working
            .slice_mut("write_working_buffer", offset, len)
            .map_err(|e| SandboxError::InvalidAccess(e.to_string()))?;
        target.copy_from_slice(data);
        Ok(())
    }

    /// Host-side read of guest linear memory.
    pub fn read_memory(&mut self, offset: u32, len: u32) -> Result<Vec<u8>, SandboxError> {
        let (memory, store) = self
            .active_memory()
            .ok_or_else(|| SandboxError::Runtime("sandbox stopped".into()))?;
        let data = memory.data(&*store);
        let range = crate::host_calls::checked_range("read_memory", offset, len, data.len())
            .map_err(|e| SandboxError::InvalidAccess(e.to_string()))?;
        Ok(data[range].to_vec())
    }

    fn ensure_runnable(&self) -> Result<(), SandboxError> {
        if self.store.is_none() {
            return Err(SandboxError::Runtime("sandbox stopped".into()));
        }
        if let Some(kind) = &self.fault {
            return Err(SandboxError::Runtime(format!(
                "instance faulted ({kind}); recreate the sandbox"
            )));
        }
        Ok(())
    }

    fn has_export(&mut self, name: &str) -> bool {
        match (self.instance, self.store.as_mut()) {
            (Some(instance), Some(store)) => instance.get_func(&mut *store, name).is_some(),
            _ => false,
        }
    }

    /// The guest's exported memory, else the host-provided one.
    fn active_memory(&mut self) -> Option<(Memory, &mut Store<HostState>)> {
        let instance = self.instance?;
        let store = self.store.as_mut()?;
        let memory = instance
            .get_memory(&mut *store, "memory")
            .or(store.data().memory)?;
        Some((memory, store))
    }

    fn invoke(&mut self, export: &str) -> Result<(), SandboxError> {
        let (Some(instance), Some(store)) = (self.instance, self.store.as_mut()) else {
            return Err(SandboxError::Runtime("sandbox stopped".into()));
        };
        let func = instance
            .get_typed_func::<(), ()>(&mut *store, export)
            .map_err(|e| SandboxError::Runtime(format!("`{export}` has wrong signature: {e}")))?;

        let outcome = func.call(&mut *store, ());
        let exhausted = store.data().limiter.exhausted();
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                let error = classify(err, exhausted);
                self.report_fault(&error);
                Err(error)
            }
        }
    }

    fn report_fault(&mut self, error: &SandboxError) {
        let kind = error.kind();
        warn!(agent_id = %self.agent_id, kind, error = %error, "agent faulted");
        self.fault = Some(kind.to_string());
        self.observer.report(
            &self.agent_id,
            AgentEvent::Faulted {
                kind: kind.to_string(),
                detail: error.to_string(),
            },
        );
    }
}

impl std::fmt::Debug for AgentSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSandbox")
            .field("agent_id", &self.agent_id)
            .field("limits", &self.limits)
            .field("stopped", &self.is_stopped())
            .field("fault", &self.fault)
            .finish()
    }
}

/// Maps a failed instantiation onto the sandbox error taxonomy.
///
/// Link errors (unknown imports, type mismatches) stay `Runtime`. Traps from
/// a start function and memory limits hit while allocating the module's own
/// memories are guest faults like any other.
fn classify_instantiation(err: anyhow::Error, memory_exhausted: bool) -> SandboxError {
    let guest_fault = memory_exhausted
        || err.downcast_ref::<Trap>().is_some()
        || err.downcast_ref::<MemoryExhausted>().is_some()
        || err.downcast_ref::<HostFault>().is_some();
    if guest_fault {
        classify(err, memory_exhausted)
    } else {
        SandboxError::Runtime(format!("instantiation: {err}"))
    }
}

/// Maps a failed guest call onto the sandbox error taxonomy.
fn classify(err: anyhow::Error, memory_exhausted: bool) -> SandboxError {
    if let Some(fault) = err.downcast_ref::<HostFault>() {
        return SandboxError::InvalidAccess(fault.to_string());
    }
    if let Some(exhausted) = err.downcast_ref::<MemoryExhausted>() {
        return SandboxError::ResourceExceeded(exhausted.to_string());
    }
    if memory_exhausted {
        return SandboxError::ResourceExceeded("memory limit reached".into());
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => SandboxError::ResourceExceeded("fuel exhausted".into()),
        Some(trap) => SandboxError::GuestTrap(trap.to_string()),
        None => SandboxError::GuestTrap(format!("{err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, EventType};
    use crate::metrics::MetricsRegistry;
    use matrix_env::CancelToken;

    fn wasm(text: &str) -> Vec<u8> {
        wat::parse_str(text).expect("valid wat")
    }

    fn small_limits() -> ResourceLimits {
        ResourceLimits {
            max_memory_pages: 1,
            max_fuel: 100_000,
        }
    }

    fn sandbox(text: &str) -> AgentSandbox {
        let config = SandboxConfig::new("agent-1", wasm(text)).with_limits(small_limits());
        AgentSandbox::new(config, SandboxEnv::default()).expect("sandbox builds")
    }

    const LOGGER: &str = r#"
        (module
          (import "env" "log" (func $log (param i32 i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "hello from guest")
          (func (export "_start")
            (call $log (i32.const 0) (i32.const 16))))
    "#;

    #[test]
    fn test_limits_validation() {
        assert!(ResourceLimits::default().validate().is_ok());
        for limits in [
            ResourceLimits { max_memory_pages: 0, max_fuel: 10 },
            ResourceLimits { max_memory_pages: 65537, max_fuel: 10 },
            ResourceLimits { max_memory_pages: 1, max_fuel: 0 },
        ] {
            let err = limits.validate().unwrap_err();
            assert_eq!(err.kind(), "config");
        }
    }

    #[test]
    fn test_zero_pages_rejected_before_compile() {
        // Garbage code: the limits check must fire first.
        let config = SandboxConfig::new("a", b"not wasm".to_vec()).with_limits(ResourceLimits {
            max_memory_pages: 0,
            max_fuel: 1000,
        });
        let err = AgentSandbox::new(config, SandboxEnv::default()).unwrap_err();
        assert!(matches!(err, SandboxError::Config(ref msg) if msg.contains("max_memory_pages")));
    }

    #[test]
    fn test_invalid_module_is_config_error() {
        let config = SandboxConfig::new("a", vec![0x00, 0x61, 0x73, 0x6d, 0xff])
            .with_limits(small_limits());
        let err = AgentSandbox::new(config, SandboxEnv::default()).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_unknown_import_fails_instantiation() {
        let config = SandboxConfig::new(
            "a",
            wasm(r#"(module (import "env" "open_socket" (func)))"#),
        )
        .with_limits(small_limits());
        let err = AgentSandbox::new(config, SandboxEnv::default()).unwrap_err();
        assert_eq!(err.kind(), "runtime");
    }

    #[test]
    fn test_start_without_entry_point_succeeds() {
        let mut sb = sandbox(r#"(module (memory (export "memory") 1))"#);
        sb.start().unwrap();
        assert!(sb.logs().is_empty());
    }

    #[test]
    fn test_log_is_captured() {
        let mut sb = sandbox(LOGGER);
        sb.start().unwrap();
        assert_eq!(sb.logs(), ["hello from guest".to_string()]);
        assert!(sb.fuel_consumed() > 0);
    }

    #[test]
    fn test_host_memory_used_when_guest_exports_none() {
        let mut sb = sandbox(
            r#"
            (module
              (import "env" "memory" (memory 1))
              (import "env" "log" (func $log (param i32 i32)))
              (data (i32.const 8) "imported")
              (func (export "_start")
                (call $log (i32.const 8) (i32.const 8))))
        "#,
        );
        sb.start().unwrap();
        assert_eq!(sb.logs(), ["imported".to_string()]);
        assert_eq!(sb.memory_size(), PAGE_SIZE);
    }

    #[test]
    fn test_infinite_loop_exhausts_fuel() {
        let config = SandboxConfig::new(
            "spinner",
            wasm(r#"(module (func (export "_start") (loop $l (br $l))))"#),
        )
        .with_limits(ResourceLimits {
            max_memory_pages: 1,
            max_fuel: 10_000,
        });
        let mut sb = AgentSandbox::new(config, SandboxEnv::default()).unwrap();
        let err = sb.start().unwrap_err();
        assert_eq!(err.kind(), "resource_exceeded");
        assert_eq!(sb.fault(), Some("resource_exceeded"));
    }

    #[test]
    fn test_unreachable_is_guest_trap_and_not_reused() {
        let mut sb = sandbox(r#"(module (func (export "_start") unreachable))"#);
        let err = sb.start().unwrap_err();
        assert!(matches!(err, SandboxError::GuestTrap(_)));

        let err = sb.start().unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
    }

    #[test]
    fn test_memory_growth_beyond_limit_traps() {
        let config = SandboxConfig::new(
            "grower",
            wasm(
                r#"
                (module
                  (memory (export "memory") 1)
                  (func (export "_start")
                    (drop (memory.grow (i32.const 10)))))
            "#,
            ),
        )
        .with_limits(ResourceLimits {
            max_memory_pages: 2,
            max_fuel: 100_000,
        });
        let mut sb = AgentSandbox::new(config, SandboxEnv::default()).unwrap();
        let err = sb.start().unwrap_err();
        assert_eq!(err.kind(), "resource_exceeded");
    }

    #[test]
    fn test_growth_within_limit_is_fine() {
        let config = SandboxConfig::new(
            "grower",
            wasm(
                r#"
                (module
                  (memory (export "memory") 1)
                  (func (export "_start")
                    (drop (memory.grow (i32.const 1)))))
            "#,
            ),
        )
        .with_limits(ResourceLimits {
            max_memory_pages: 2,
            max_fuel: 100_000,
        });
        let mut sb = AgentSandbox::new(config, SandboxEnv::default()).unwrap();
        sb.start().unwrap();
        assert_eq!(sb.memory_size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_out_of_bounds_log_is_invalid_access() {
        let mut sb = sandbox(
            r#"
            (module
              (import "env" "log" (func $log (param i32 i32)))
              (memory (export "memory") 1)
              (func (export "_start")
                (call $log (i32.const 65530) (i32.const 100))))
        "#,
        );
        let err = sb.start().unwrap_err();
        assert!(matches!(err, SandboxError::InvalidAccess(_)));
        assert!(sb.logs().is_empty());
    }

    #[test]
    fn test_out_of_bounds_set_memory_leaves_buffer_untouched() {
        let config = SandboxConfig::new(
            "a",
            wasm(
                r#"
                (module
                  (import "env" "set_memory" (func $set (param i32 i32)))
                  (memory (export "memory") 1)
                  (data (i32.const 0) "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx")
                  (func (export "_start")
                    (call $set (i32.const 0) (i32.const 32))))
            "#,
            ),
        )
        .with_limits(small_limits())
        .with_working_buffer(16);
        let mut sb = AgentSandbox::new(config, SandboxEnv::default()).unwrap();

        let err = sb.start().unwrap_err();
        assert_eq!(err.kind(), "invalid_access");
        assert_eq!(sb.working_buffer().unwrap(), &[0u8; 16]);
    }

    #[test]
    fn test_out_of_bounds_get_memory_leaves_guest_untouched() {
        let mut sb = sandbox(
            r#"
            (module
              (import "env" "get_memory" (func $get (param i32 i32)))
              (memory (export "memory") 1)
              (func (export "_start")
                (call $get (i32.const 65535) (i32.const 2))))
        "#,
        );
        sb.write_working_buffer(65534, &[7, 7]).unwrap();
        let err = sb.start().unwrap_err();
        assert_eq!(err.kind(), "invalid_access");
        assert_eq!(sb.read_memory(65534, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_working_buffer_round_trip() {
        let mut sb = sandbox(
            r#"
            (module
              (import "env" "get_memory" (func $get (param i32 i32)))
              (import "env" "set_memory" (func $set (param i32 i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "state")
              (func (export "_start")
                (call $set (i32.const 0) (i32.const 5)))
              (func (export "load")
                (call $get (i32.const 100) (i32.const 3))))
        "#,
        );
        sb.start().unwrap();
        assert_eq!(&sb.working_buffer().unwrap()[..5], b"state");

        sb.write_working_buffer(100, b"xyz").unwrap();
        sb.call("load").unwrap();
        assert_eq!(sb.read_memory(100, 3).unwrap(), b"xyz".to_vec());
    }

    #[test]
    fn test_log_retention_is_bounded() {
        // 100 lines of 4 KiB each; only the newest fit in the tail.
        let mut sb = sandbox(
            r#"
            (module
              (import "env" "log" (func $log (param i32 i32)))
              (memory (export "memory") 1)
              (func (export "_start") (local $i i32)
                (loop $again
                  (call $log (i32.const 0) (i32.const 4096))
                  (local.set $i (i32.add (local.get $i) (i32.const 1)))
                  (br_if $again (i32.lt_u (local.get $i) (i32.const 100))))))
        "#,
        );
        sb.start().unwrap();
        assert!(sb.log_bytes() <= crate::host_calls::LOG_TAIL_BYTES);
        assert_eq!(sb.log_bytes(), sb.logs().iter().map(String::len).sum::<usize>());
        assert_eq!(sb.logs().len(), crate::host_calls::LOG_TAIL_BYTES / 4096);
    }

    #[test]
    fn test_start_function_spin_is_resource_exceeded() {
        let config = SandboxConfig::new(
            "spinner",
            wasm(r#"(module (func $spin (loop $l (br $l))) (start $spin))"#),
        )
        .with_limits(ResourceLimits {
            max_memory_pages: 1,
            max_fuel: 10_000,
        });
        let err = AgentSandbox::new(config, SandboxEnv::default()).unwrap_err();
        assert_eq!(err.kind(), "resource_exceeded");
    }

    #[test]
    fn test_start_function_trap_is_guest_trap() {
        let config = SandboxConfig::new(
            "crashy",
            wasm(r#"(module (func $boom unreachable) (start $boom))"#),
        )
        .with_limits(small_limits());
        let err = AgentSandbox::new(config, SandboxEnv::default()).unwrap_err();
        assert_eq!(err.kind(), "guest_trap");
    }

    #[test]
    fn test_declared_memory_over_bound_is_resource_exceeded() {
        let config = SandboxConfig::new("greedy", wasm(r#"(module (memory 3))"#)).with_limits(
            ResourceLimits {
                max_memory_pages: 2,
                max_fuel: 10_000,
            },
        );
        let err = AgentSandbox::new(config, SandboxEnv::default()).unwrap_err();
        assert_eq!(err.kind(), "resource_exceeded");
    }

    #[tokio::test]
    async fn test_start_function_fault_is_published() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventType::Agent, CancelToken::new());
        let config = SandboxConfig::new(
            "crashy",
            wasm(r#"(module (func $boom unreachable) (start $boom))"#),
        )
        .with_limits(small_limits());
        let env = SandboxEnv::default().with_bus(bus.clone());
        assert!(AgentSandbox::new(config, env).is_err());

        match sub.recv().await.unwrap().as_agent() {
            Some(AgentEvent::Faulted { kind, .. }) => assert_eq!(kind, "guest_trap"),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_guest_with_table_instantiates() {
        let mut sb = sandbox(
            r#"
            (module
              (table 4 funcref)
              (func $noop)
              (elem (i32.const 0) $noop)
              (func (export "_start")
                (drop (table.grow (ref.null func) (i32.const 2)))))
        "#,
        );
        sb.start().unwrap();
    }

    #[test]
    fn test_zero_working_buffer_defaults_to_memory_bound() {
        let config = SandboxConfig::new("a", wasm(r#"(module (memory (export "memory") 1))"#))
            .with_limits(small_limits())
            .with_working_buffer(0);
        let sb = AgentSandbox::new(config, SandboxEnv::default()).unwrap();
        assert_eq!(sb.working_buffer().unwrap().len(), PAGE_SIZE);
    }

    #[test]
    fn test_guest_defined_memory_gets_no_host_memory() {
        let config = SandboxConfig::new(
            "own",
            wasm(
                r#"
                (module
                  (memory (export "memory") 1)
                  (func (export "grow")
                    (drop (memory.grow (i32.const 1)))))
            "#,
            ),
        )
        .with_limits(ResourceLimits {
            max_memory_pages: 4,
            max_fuel: 100_000,
        });
        let mut sb = AgentSandbox::new(config, SandboxEnv::default()).unwrap();
        assert!(sb.store.as_ref().unwrap().data().memory.is_none());
        assert_eq!(sb.committed_memory(), PAGE_SIZE);

        sb.call("grow").unwrap();
        assert_eq!(sb.committed_memory(), 2 * PAGE_SIZE);
        assert_eq!(sb.memory_size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_guest_importing_memory_gets_host_memory() {
        let sb = sandbox(r#"(module (import "env" "memory" (memory 1)))"#);
        assert!(sb.store.as_ref().unwrap().data().memory.is_some());
    }

    #[test]
    fn test_host_call_without_any_memory_is_invalid_access() {
        let mut sb = sandbox(
            r#"
            (module
              (import "env" "log" (func $log (param i32 i32)))
              (func (export "_start")
                (call $log (i32.const 0) (i32.const 0))))
        "#,
        );
        let err = sb.start().unwrap_err();
        assert_eq!(err.kind(), "invalid_access");
    }

    #[tokio::test]
    async fn test_out_of_bounds_send_publishes_nothing() {
        // Target range overruns memory in one guest, payload range in the other.
        let guests = [
            "(call $send (i32.const 65530) (i32.const 100) (i32.const 16) (i32.const 2))",
            "(call $send (i32.const 0) (i32.const 3) (i32.const 65530) (i32.const 100))",
        ];
        for body in guests {
            let bus = EventBus::new();
            let mut sub = bus.subscribe(EventType::Agent, CancelToken::new());
            let text = format!(
                r#"
                (module
                  (import "env" "send" (func $send (param i32 i32 i32 i32)))
                  (memory (export "memory") 1)
                  (data (i32.const 0) "bob")
                  (data (i32.const 16) "hi")
                  (func (export "_start") {body}))
            "#
            );
            let config = SandboxConfig::new("alice", wasm(&text)).with_limits(small_limits());
            let env = SandboxEnv::default().with_bus(bus.clone());
            let mut sb = AgentSandbox::new(config, env).unwrap();

            let err = sb.start().unwrap_err();
            assert_eq!(err.kind(), "invalid_access");

            let events = sub.drain();
            assert!(events.iter().all(|e| !matches!(
                e.as_agent(),
                Some(AgentEvent::OutboundMessage { .. })
            )));
            assert!(matches!(
                events.first().and_then(|e| e.as_agent()),
                Some(AgentEvent::Faulted { .. })
            ));
        }
    }

    #[test]
    fn test_call_missing_export() {
        let mut sb = sandbox(r#"(module (memory (export "memory") 1))"#);
        let err = sb.call("tick").unwrap_err();
        assert_eq!(err.kind(), "runtime");
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut sb = sandbox(LOGGER);
        sb.stop();
        sb.stop();
        assert!(sb.is_stopped());
        assert!(sb.logs().is_empty());
        assert!(matches!(sb.start(), Err(SandboxError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_send_publishes_outbound_message() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventType::Agent, CancelToken::new());
        let config = SandboxConfig::new(
            "alice",
            wasm(
                r#"
                (module
                  (import "env" "send" (func $send (param i32 i32 i32 i32)))
                  (memory (export "memory") 1)
                  (data (i32.const 0) "bob")
                  (data (i32.const 16) "hi")
                  (func (export "_start")
                    (call $send (i32.const 0) (i32.const 3) (i32.const 16) (i32.const 2))))
            "#,
            ),
        )
        .with_limits(small_limits());
        let env = SandboxEnv::default().with_bus(bus.clone());
        let mut sb = AgentSandbox::new(config, env).unwrap();
        sb.start().unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.origin(), "alice");
        assert_eq!(
            first.payload(),
            &EventPayload::Agent(AgentEvent::OutboundMessage {
                target: "bob".into(),
                payload: b"hi".to_vec(),
            })
        );
        assert_eq!(sub.recv().await.unwrap().as_agent(), Some(&AgentEvent::Started));
    }

    #[tokio::test]
    async fn test_fault_is_published_and_counted() {
        let bus = EventBus::new();
        let registry = MetricsRegistry::shared();
        let mut sub = bus.subscribe(EventType::Agent, CancelToken::new());
        let config = SandboxConfig::new(
            "crashy",
            wasm(r#"(module (func (export "_start") unreachable))"#),
        )
        .with_limits(small_limits());
        let env = SandboxEnv::default()
            .with_bus(bus.clone())
            .with_metrics(registry.clone());
        let mut sb = AgentSandbox::new(config, env).unwrap();
        assert!(sb.start().is_err());

        match sub.recv().await.unwrap().as_agent() {
            Some(AgentEvent::Faulted { kind, .. }) => assert_eq!(kind, "guest_trap"),
            other => panic!("expected fault, got {other:?}"),
        }
        assert_eq!(
            registry.get("matrix_sandbox_fault_count{kind=guest_trap}"),
            Some(1.0)
        );

        sb.stop();
        assert_eq!(sub.recv().await.unwrap().as_agent(), Some(&AgentEvent::Stopped));
    }
}
