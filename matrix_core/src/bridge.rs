//! Transport bridge - joins the event bus to the delivery transport.
//!
//! ```text
//!   sandbox `send` ─► bus (AgentEvent::OutboundMessage) ─► deliver("agent/<target>")
//!   transport subscribe(topic) ─► (sender, bytes) ─► bus (PeerEvent::Message)
//! ```
//!
//! Guest computation never waits on the network: the host call only
//! publishes, and the outbound task delivers in the background.

use crate::event::{AgentEvent, Event, EventPayload, EventType, PeerEvent};
use crate::event_bus::EventBus;
use crate::metrics::MetricsRegistry;
use matrix_env::{CancelToken, DeliveryTransport, EnvError, NodeContext};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Transport topic carrying messages addressed to agent `target`.
pub fn agent_topic(target: &str) -> String {
    format!("agent/{}", target)
}

#[derive(Clone)]
pub struct TransportBridge {
    transport: Arc<dyn DeliveryTransport>,
    bus: EventBus,
    context: Arc<dyn NodeContext>,
    registry: Option<Arc<MetricsRegistry>>,
}

impl TransportBridge {
    pub fn new(
        transport: Arc<dyn DeliveryTransport>,
        bus: EventBus,
        context: Arc<dyn NodeContext>,
    ) -> Self {
        Self {
            transport,
            bus,
            context,
            registry: None,
        }
    }

    /// Counts every bridged message per topic.
    pub fn with_registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Forwards outbound agent messages from the bus to the transport
    /// until `cancel` fires or the bus closes.
    ///
    /// The bus subscription is taken before this returns, so nothing
    /// published afterwards is missed.
    pub fn spawn_outbound(&self, cancel: CancelToken) -> JoinHandle<()> {
        let mut subscription = self.bus.subscribe(EventType::Agent, cancel);
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(AgentEvent::OutboundMessage { target, payload }) = event.as_agent() else {
                    continue;
                };
                let topic = agent_topic(target);
                match bridge.transport.deliver(&topic, payload.clone()).await {
                    Ok(()) => {
                        debug!(from = %event.origin(), %topic, bytes = payload.len(), "message delivered");
                        bridge.count(&topic, "out");
                    }
                    Err(e) => {
                        warn!(from = %event.origin(), %topic, error = %e, "delivery failed");
                    }
                }
            }
            debug!("outbound bridge stopped");
        })
    }

    /// Subscribes to `topic` on the transport and republishes each inbound
    /// message on the bus as [`PeerEvent::Message`] until `cancel` fires or
    /// the transport drops the subscription.
    pub async fn spawn_inbound(
        &self,
        topic: &str,
        cancel: CancelToken,
    ) -> Result<JoinHandle<()>, EnvError> {
        let mut inbound = self.transport.subscribe(topic).await?;
        let topic = topic.to_string();
        let bridge = self.clone();
        let origin = self.transport.local_id().as_uuid().to_string();

        Ok(tokio::spawn(async move {
            loop {
                // Queued messages are drained before cancellation is honoured.
                let message = tokio::select! {
                    biased;
                    message = inbound.recv() => message,
                    _ = cancel.cancelled() => break,
                };
                let Some((from, payload)) = message else {
                    break;
                };
                bridge.count(&topic, "in");
                bridge.bus.publish(Event::new(
                    origin.clone(),
                    bridge.context.unix_millis(),
                    EventPayload::Peer(PeerEvent::Message {
                        topic: topic.clone(),
                        from: from.as_uuid().to_string(),
                        payload,
                    }),
                ));
            }
            debug!(%topic, "inbound bridge stopped");
        }))
    }

    fn count(&self, topic: &str, direction: &str) {
        if let Some(registry) = &self.registry {
            registry.record_message(topic, direction);
        }
    }
}
