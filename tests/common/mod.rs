#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, RwLock};

use ring_dht::core::{DEFAULT_HISTORY_CAPACITY, DEFAULT_SUSPICION_THRESHOLD};
use ring_dht::{
    handle_datagram, handle_stream, FileResponse, MembershipState, Message, PeerId, RingNetwork,
    RingNode, SendError,
};

/// Which transport a recorded send used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Datagram,
    Stream,
}

#[derive(Clone, Debug)]
pub struct Sent {
    pub to: PeerId,
    pub channel: Channel,
    pub payload: Vec<u8>,
}

impl Sent {
    pub fn message(&self) -> Option<Message> {
        match self.channel {
            Channel::Datagram => Message::decode_datagram(&self.payload).ok(),
            Channel::Stream => Message::decode_stream(&self.payload).ok(),
        }
    }
}

/// In-memory transport that delivers straight into registered nodes.
///
/// Datagrams to unknown or crashed peers vanish. Streams to crashed peers
/// fail as unreachable; streams to peers that were never registered are
/// recorded and dropped.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_id: PeerId,
    sent: Arc<Mutex<Vec<Sent>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_id: PeerId) -> Self {
        Self {
            registry,
            self_id,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn sent(&self) -> Vec<Sent> {
        self.sent.lock().await.clone()
    }

    pub async fn stream_messages(&self) -> Vec<(PeerId, Message)> {
        self.sent()
            .await
            .into_iter()
            .filter(|s| s.channel == Channel::Stream)
            .filter_map(|s| s.message().map(|m| (s.to, m)))
            .collect()
    }

    pub async fn successor_requests(&self) -> Vec<PeerId> {
        self.stream_messages()
            .await
            .into_iter()
            .filter(|(_, m)| matches!(m, Message::SuccessorRequest { .. }))
            .map(|(to, _)| to)
            .collect()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }

    async fn record(&self, to: PeerId, channel: Channel, payload: &[u8]) {
        self.sent.lock().await.push(Sent {
            to,
            channel,
            payload: payload.to_vec(),
        });
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<PeerId, Arc<RingNode<TestNetwork>>>>,
    crashed: RwLock<HashSet<PeerId>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: Arc<RingNode<TestNetwork>>) {
        self.crashed.write().await.remove(&node.id);
        self.peers.write().await.insert(node.id, node);
    }

    pub async fn get(&self, id: PeerId) -> Option<Arc<RingNode<TestNetwork>>> {
        self.peers.read().await.get(&id).cloned()
    }

    /// Remove a peer without any notification.
    pub async fn crash(&self, id: PeerId) {
        self.peers.write().await.remove(&id);
        self.crashed.write().await.insert(id);
    }

    pub async fn is_crashed(&self, id: PeerId) -> bool {
        self.crashed.read().await.contains(&id)
    }

    pub async fn live_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait::async_trait]
impl RingNetwork for TestNetwork {
    async fn send_datagram(&self, to: PeerId, payload: Vec<u8>) -> Result<(), SendError> {
        self.record(to, Channel::Datagram, &payload).await;
        let Some(peer) = self.registry.get(to).await else {
            return Ok(());
        };
        let reply = handle_datagram(&peer, &payload, Some(self.self_id)).await;
        if let (Some(reply), Some(me)) = (reply, self.registry.get(self.self_id).await) {
            handle_datagram(&me, &reply, Some(to)).await;
        }
        Ok(())
    }

    async fn send_stream(&self, to: PeerId, payload: Vec<u8>) -> Result<(), SendError> {
        self.record(to, Channel::Stream, &payload).await;
        if self.registry.is_crashed(to).await {
            return Err(SendError::Unreachable { peer: to });
        }
        if let Some(peer) = self.registry.get(to).await {
            handle_stream(&peer, &payload).await;
        }
        Ok(())
    }
}

pub struct TestNode {
    pub node: Arc<RingNode<TestNetwork>>,
    pub network: TestNetwork,
    pub file_responses: Arc<StdMutex<Vec<FileResponse>>>,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, id: PeerId, successors: &[PeerId]) -> Self {
        let network = TestNetwork::new(registry.clone(), id);
        let state = MembershipState::new(
            id,
            successors,
            DEFAULT_SUSPICION_THRESHOLD,
            DEFAULT_HISTORY_CAPACITY,
        );
        let file_responses = Arc::new(StdMutex::new(Vec::new()));
        let sink = file_responses.clone();
        let node = Arc::new(
            RingNode::new(state, network.clone()).with_file_response_hook(Arc::new(
                move |response: &FileResponse| {
                    sink.lock().unwrap().push(response.clone());
                },
            )),
        );
        registry.register(node.clone()).await;
        Self {
            node,
            network,
            file_responses,
        }
    }

    pub fn id(&self) -> PeerId {
        self.node.id
    }

    pub fn file_responses(&self) -> Vec<FileResponse> {
        self.file_responses.lock().unwrap().clone()
    }
}

/// Build a ring where every peer starts with its two true successors.
pub async fn make_ring(registry: Arc<NetworkRegistry>, ids: &[PeerId]) -> Vec<TestNode> {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let mut nodes = Vec::with_capacity(n);
    for (i, id) in sorted.iter().enumerate() {
        let successors = [sorted[(i + 1) % n], sorted[(i + 2) % n]];
        nodes.push(TestNode::new(registry.clone(), *id, &successors).await);
    }
    nodes
}

/// Tick every live node once, in ring order.
pub async fn tick_round(registry: &NetworkRegistry, nodes: &[TestNode]) {
    for node in nodes {
        if registry.get(node.id()).await.is_some() {
            node.node.on_tick().await;
        }
    }
}

pub async fn tick_rounds(registry: &NetworkRegistry, nodes: &[TestNode], rounds: usize) {
    for _ in 0..rounds {
        tick_round(registry, nodes).await;
    }
}

pub fn find<'a>(nodes: &'a [TestNode], id: PeerId) -> &'a TestNode {
    nodes
        .iter()
        .find(|n| n.id() == id)
        .expect("node exists in ring")
}
