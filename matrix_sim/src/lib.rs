//! Matrix node deterministic simulation harness
//!
//! Runs the kernel (matrices, rules, agents, guest sandboxes, event bus,
//! soul store, transport bridge) inside a world where every source of
//! non-determinism is controlled:
//! - **Time**: a virtual clock advanced one tick per world step
//! - **Network**: an in-memory loopback transport with partitions
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! ```text
//! ┌──────────────────────────── SimWorld ────────────────────────────┐
//! │  SimContext (clock + ChaCha8)   MetricsRegistry   SoulStore      │
//! │        │                              ▲                ▲         │
//! │  ┌─────▼─────┐   events   ┌─────────┐ │                │         │
//! │  │  Matrix   │───────────►│EventBus │─┼──► subscribers  │         │
//! │  │ rules +   │            └────┬────┘ │                │         │
//! │  │ agents    │─────────────────┼──────┴────────────────┘         │
//! │  └───────────┘                 ▼                                 │
//! │                 TransportBridge ◄──► LoopbackNetwork (nodes)     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use matrix_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 6).run(ScenarioId::Ecosystem).await;
//! assert!(result.passed);
//! ```

mod config;
mod context;
mod exporter;
pub mod guests;
mod network;
mod runner;
pub mod scenarios;
mod world;

pub use config::{ConfigError, NodeConfig};
pub use context::SimContext;
pub use exporter::{AgentFrame, SimEvent, SimExport, SimFrame};
pub use network::{LoopbackNetwork, LoopbackTransport, SimNetworkController};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{MatrixStep, SimConfig, SimWorld, GUEST_WORKING_BUFFER};
