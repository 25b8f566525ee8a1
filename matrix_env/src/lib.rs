//! Matrix Environment Abstraction Layer
//!
//! This crate provides the narrow interfaces the node kernel consumes from
//! the outside world, so the same kernel code runs in **Production** (tokio,
//! real peers, durable storage) and in **Simulation** (virtual clock,
//! loopback transport, in-memory storage).
//!
//! # Consumed Interfaces
//!
//! - Time: [`NodeContext`] (`now()`, `system_time()`, `sleep()`)
//! - Delivery: [`DeliveryTransport`] (`deliver(topic, bytes)`, `subscribe(topic)`)
//! - Storage: [`ByteStore`] (`get`, `put`, `delete`, `snapshot`)
//! - Cancellation: [`CancelToken`] (cooperative, cloneable)
//!
//! # Example
//!
//! ```ignore
//! use matrix_env::{CancelToken, DeliveryTransport, NodeContext};
//!
//! async fn relay<Ctx: NodeContext, Net: DeliveryTransport>(
//!     ctx: &Ctx,
//!     net: &Net,
//!     cancel: CancelToken,
//! ) {
//!     let mut inbound = net.subscribe("agents").await.unwrap();
//!     loop {
//!         tokio::select! {
//!             _ = cancel.cancelled() => break,
//!             msg = inbound.recv() => handle(ctx.unix_millis(), msg),
//!         }
//!     }
//! }
//! ```

mod cancel;
mod context;
mod error;
mod store;
mod tokio_impl;
mod transport;
mod types;

pub use cancel::CancelToken;
pub use context::NodeContext;
pub use error::EnvError;
pub use store::{ByteStore, MemoryStore, StoreSnapshot};
pub use tokio_impl::TokioContext;
pub use transport::{DeliveryTransport, InboundMessage};
pub use types::PeerId;
