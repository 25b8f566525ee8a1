//! Delivery transport abstraction for the node kernel.

use crate::error::EnvError;
use crate::types::PeerId;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A message received from a remote peer on a subscribed topic.
pub type InboundMessage = (PeerId, Vec<u8>);

/// Abstraction for topic-based message delivery between nodes.
///
/// The kernel knows nothing about peer discovery, NAT traversal or the
/// gossip protocol underneath; it only hands bytes to a topic and reads
/// bytes back.
///
/// # Implementations
///
/// - **Production**: a gossip pub/sub layer over the peer host
/// - **Simulation**: `LoopbackTransport` (matrix_sim) with partitions
///
/// # Message Flow
///
/// ```text
/// Node A                     Transport                   Node B
///   |                           |                          |
///   |-- deliver(topic, bytes) ->|                          |
///   |                           |-- fan-out to topic ----->|
///   |                           |                          |-- rx.recv() -> (A, bytes)
/// ```
#[async_trait]
pub trait DeliveryTransport: Send + Sync + 'static {
    /// Hands a payload to every subscriber of `topic`.
    ///
    /// # Returns
    /// * `Ok(())` - Payload accepted for delivery
    /// * `Err(EnvError::NetworkError)` - Immediate failure (e.g., closed)
    ///
    /// Success does not guarantee delivery.
    async fn deliver(&self, topic: &str, payload: Vec<u8>) -> Result<(), EnvError>;

    /// Joins `topic` and returns a lazy sequence of `(sender, payload)`.
    ///
    /// The sequence ends (`recv()` returns `None`) when the transport shuts down.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<InboundMessage>, EnvError>;

    /// Returns this node's peer ID.
    fn local_id(&self) -> PeerId;
}
