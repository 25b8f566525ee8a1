//! Host calls - the complete capability surface of a sandboxed agent.
//!
//! A guest can reach the outside world only through these four imports
//! (module `env`):
//!
//! | import       | signature                              | effect                          |
//! |--------------|----------------------------------------|---------------------------------|
//! | `log`        | `(offset, len)`                        | guest bytes → tracing + bus     |
//! | `send`       | `(t_offset, t_len, m_offset, m_len)`   | outbound agent message → bus    |
//! | `get_memory` | `(offset, len)`                        | working buffer → guest memory   |
//! | `set_memory` | `(offset, len)`                        | guest memory → working buffer   |
//!
//! Every `(offset, len)` pair is checked against the bound of the memory it
//! touches before any byte moves. A failed check raises [`HostFault`],
//! which traps the instance.

use crate::event::{AgentEvent, Event};
use crate::event_bus::EventBus;
use crate::metrics::MetricsSink;
use matrix_env::NodeContext;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use wasmtime::{Caller, Linker, Memory, ResourceLimiter};

/// WebAssembly page size in bytes.
pub const PAGE_SIZE: usize = 65536;

/// Bytes of guest log output a sandbox keeps for inspection.
pub const LOG_TAIL_BYTES: usize = 64 * 1024;

/// A host-call contract violation. Always fatal to the call.
#[derive(Debug, Error)]
pub enum HostFault {
    #[error("{call}: range {offset}+{len} exceeds {bound}-byte bound")]
    OutOfBounds {
        call: &'static str,
        offset: u32,
        len: u32,
        bound: usize,
    },

    #[error("{call}: guest has no linear memory")]
    NoMemory { call: &'static str },
}

/// Raised by the store limiter when guest memory would exceed its bound.
#[derive(Debug, Error)]
#[error("guest memory would grow to {desired} bytes, limit is {limit}")]
pub struct MemoryExhausted {
    pub desired: usize,
    pub limit: usize,
}

/// Validates `offset + len <= bound` without overflow.
pub(crate) fn checked_range(
    call: &'static str,
    offset: u32,
    len: u32,
    bound: usize,
) -> Result<Range<usize>, HostFault> {
    let start = offset as usize;
    start
        .checked_add(len as usize)
        .filter(|end| *end <= bound)
        .map(|end| start..end)
        .ok_or(HostFault::OutOfBounds {
            call,
            offset,
            len,
            bound,
        })
}

/// The agent's state outside guest address space.
///
/// Only reachable from the guest through `get_memory`/`set_memory`.
#[derive(Debug, Clone)]
pub struct WorkingBuffer {
    bytes: Vec<u8>,
}

impl WorkingBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn slice(&self, call: &'static str, offset: u32, len: u32) -> Result<&[u8], HostFault> {
        let range = checked_range(call, offset, len, self.bytes.len())?;
        Ok(&self.bytes[range])
    }

    pub fn slice_mut(
        &mut self,
        call: &'static str,
        offset: u32,
        len: u32,
    ) -> Result<&mut [u8], HostFault> {
        let range = checked_range(call, offset, len, self.bytes.len())?;
        Ok(&mut self.bytes[range])
    }
}

/// Where a sandbox reports what it does: clock, bus, metrics.
#[derive(Clone)]
pub struct SandboxObserver {
    pub context: Arc<dyn NodeContext>,
    pub bus: Option<EventBus>,
    pub metrics: Option<Arc<dyn MetricsSink>>,
}

impl SandboxObserver {
    /// Publishes an agent event on the bus (if any).
    pub(crate) fn publish(&self, agent_id: &str, event: AgentEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::agent(agent_id, self.context.unix_millis(), event));
        }
    }

    /// Records an agent event with the metrics sink and publishes it.
    pub(crate) fn report(&self, agent_id: &str, event: AgentEvent) {
        let event = Event::agent(agent_id, self.context.unix_millis(), event);
        if let Some(metrics) = &self.metrics {
            metrics.record_event(&event);
        }
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

/// Caps the linear memory committed by the instance at `max_memory_bytes`.
///
/// Every memory in the store counts against one budget, whether the guest
/// defines it or the host provides it.
pub(crate) struct GuestLimiter {
    max_memory_bytes: usize,
    committed: usize,
    exhausted: bool,
}

impl GuestLimiter {
    pub(crate) fn new(max_memory_bytes: usize) -> Self {
        Self {
            max_memory_bytes,
            committed: 0,
            exhausted: false,
        }
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Bytes of linear memory allocated across the store.
    pub(crate) fn committed(&self) -> usize {
        self.committed
    }
}

impl ResourceLimiter for GuestLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let total = self
            .committed
            .saturating_sub(current)
            .saturating_add(desired);
        if total > self.max_memory_bytes {
            self.exhausted = true;
            return Err(MemoryExhausted {
                desired: total,
                limit: self.max_memory_bytes,
            }
            .into());
        }
        self.committed = total;
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: u32,
        _desired: u32,
        _maximum: Option<u32>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// The most recent guest log lines, bounded by total bytes.
#[derive(Debug, Default)]
pub(crate) struct LogTail {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl LogTail {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Appends `line`, evicting the oldest lines until the tail fits.
    ///
    /// A single line longer than the limit is cut at a char boundary.
    pub(crate) fn push(&mut self, mut line: String) {
        if line.len() > self.limit {
            let mut end = self.limit;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            line.truncate(end);
        }
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.limit {
            match self.lines.pop_front() {
                Some(evicted) => self.bytes -= evicted.len(),
                None => break,
            }
        }
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Per-instance state visible to host calls.
pub struct HostState {
    pub(crate) agent_id: String,
    pub(crate) working: WorkingBuffer,
    /// Host-provided `env.memory`, used when the guest exports none.
    pub(crate) memory: Option<Memory>,
    pub(crate) limiter: GuestLimiter,
    pub(crate) observer: SandboxObserver,
    pub(crate) logs: LogTail,
}

impl HostState {
    pub(crate) fn new(
        agent_id: String,
        working: WorkingBuffer,
        max_memory_bytes: usize,
        observer: SandboxObserver,
    ) -> Self {
        Self {
            agent_id,
            working,
            memory: None,
            limiter: GuestLimiter::new(max_memory_bytes),
            observer,
            logs: LogTail::new(LOG_TAIL_BYTES),
        }
    }
}

/// The guest's exported `memory`, else the host-provided one.
fn guest_memory(caller: &mut Caller<'_, HostState>, call: &'static str) -> Result<Memory, HostFault> {
    if let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) {
        return Ok(memory);
    }
    caller.data().memory.ok_or(HostFault::NoMemory { call })
}

/// Copies `len` bytes at `offset` out of guest memory.
fn read_guest(
    caller: &mut Caller<'_, HostState>,
    call: &'static str,
    offset: u32,
    len: u32,
) -> Result<Vec<u8>, HostFault> {
    let memory = guest_memory(caller, call)?;
    let data = memory.data(&*caller);
    let range = checked_range(call, offset, len, data.len())?;
    Ok(data[range].to_vec())
}

/// Registers the four host calls. Nothing else is importable.
pub fn register_host_calls(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    // log(offset, len)
    linker.func_wrap(
        "env",
        "log",
        |mut caller: Caller<'_, HostState>, offset: u32, len: u32| -> anyhow::Result<()> {
            let bytes = read_guest(&mut caller, "log", offset, len)?;
            let message = String::from_utf8_lossy(&bytes).into_owned();
            let state = caller.data_mut();
            tracing::info!(target: "matrix_core::guest", agent_id = %state.agent_id, "{}", message);
            state.observer.publish(
                &state.agent_id,
                AgentEvent::Log {
                    message: message.clone(),
                },
            );
            state.logs.push(message);
            Ok(())
        },
    )?;

    // send(target_offset, target_len, msg_offset, msg_len)
    linker.func_wrap(
        "env",
        "send",
        |mut caller: Caller<'_, HostState>,
         target_offset: u32,
         target_len: u32,
         msg_offset: u32,
         msg_len: u32|
         -> anyhow::Result<()> {
            // Both ranges are validated before anything leaves the sandbox.
            let target = read_guest(&mut caller, "send", target_offset, target_len)?;
            let payload = read_guest(&mut caller, "send", msg_offset, msg_len)?;
            let target = String::from_utf8_lossy(&target).into_owned();
            let state = caller.data();
            tracing::debug!(agent_id = %state.agent_id, %target, bytes = payload.len(), "guest send");
            state
                .observer
                .publish(&state.agent_id, AgentEvent::OutboundMessage { target, payload });
            Ok(())
        },
    )?;

    // get_memory(offset, len): working buffer -> guest
    linker.func_wrap(
        "env",
        "get_memory",
        |mut caller: Caller<'_, HostState>, offset: u32, len: u32| -> anyhow::Result<()> {
            let memory = guest_memory(&mut caller, "get_memory")?;
            let (guest, state) = memory.data_and_store_mut(&mut caller);
            let guest_range = checked_range("get_memory", offset, len, guest.len())?;
            let source = state.working.slice("get_memory", offset, len)?;
            guest[guest_range].copy_from_slice(source);
            Ok(())
        },
    )?;

    // set_memory(offset, len): guest -> working buffer
    linker.func_wrap(
        "env",
        "set_memory",
        |mut caller: Caller<'_, HostState>, offset: u32, len: u32| -> anyhow::Result<()> {
            let memory = guest_memory(&mut caller, "set_memory")?;
            let (guest, state) = memory.data_and_store_mut(&mut caller);
            let guest_range = checked_range("set_memory", offset, len, guest.len())?;
            let target = state.working.slice_mut("set_memory", offset, len)?;
            target.copy_from_slice(&guest[guest_range]);
            Ok(())
        },
    )?;

    Ok(())
}
