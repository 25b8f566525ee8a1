//! In-memory delivery transport with partition injection.

use async_trait::async_trait;
use matrix_env::{DeliveryTransport, EnvError, InboundMessage, PeerId};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

/// Per-subscription inbound queue depth.
const INBOX_CAPACITY: usize = 1024;

/// Shared medium all loopback transports attach to.
pub struct LoopbackNetwork {
    topics: Mutex<HashMap<String, Vec<(PeerId, mpsc::Sender<InboundMessage>)>>>,
    peers: Mutex<BTreeSet<PeerId>>,
    controller: SimNetworkController,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            peers: Mutex::new(BTreeSet::new()),
            controller: SimNetworkController::new(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Attaches a node to the network. Attaching the same node twice hands
    /// out another handle to it.
    pub fn transport(self: &Arc<Self>, local_id: PeerId) -> LoopbackTransport {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(local_id);
        LoopbackTransport {
            local_id,
            network: Arc::clone(self),
        }
    }

    /// Distinct nodes attached so far.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn controller(&self) -> &SimNetworkController {
        &self.controller
    }

    /// Messages handed to a subscriber.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Messages lost to partitions, full inboxes or closed subscribers.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One node's view of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    local_id: PeerId,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl DeliveryTransport for LoopbackTransport {
    async fn deliver(&self, topic: &str, payload: Vec<u8>) -> Result<(), EnvError> {
        let subscribers = self
            .network
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for (peer, tx) in subscribers {
            if !self.network.controller.can_communicate(self.local_id, peer) {
                trace!(from = %self.local_id, to = %peer, topic, "partitioned");
                self.network.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match tx.try_send((self.local_id, payload.clone())) {
                Ok(()) => {
                    self.network.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.network.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<InboundMessage>, EnvError> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.network
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push((self.local_id, tx));
        Ok(rx)
    }

    fn local_id(&self) -> PeerId {
        self.local_id
    }
}

/// Network controller for fault injection.
pub struct SimNetworkController {
    /// Active partitions (groups that cannot reach each other)
    partitions: Mutex<Vec<(Vec<PeerId>, Vec<PeerId>)>>,
}

impl SimNetworkController {
    pub fn new() -> Self {
        Self {
            partitions: Mutex::new(Vec::new()),
        }
    }

    /// Creates a network partition between two groups.
    pub fn partition(&self, group_a: Vec<PeerId>, group_b: Vec<PeerId>) {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((group_a, group_b));
    }

    /// Heals all active partitions, returning the ones that were lifted.
    pub fn heal_all(&self) -> Vec<(Vec<PeerId>, Vec<PeerId>)> {
        std::mem::take(&mut *self.partitions.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Checks if two nodes can communicate (not partitioned).
    pub fn can_communicate(&self, from: PeerId, to: PeerId) -> bool {
        let partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        !partitions.iter().any(|(a, b)| {
            (a.contains(&from) && b.contains(&to)) || (b.contains(&from) && a.contains(&to))
        })
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new()
    }
}
