//! A running peer: bound endpoints, listener tasks and the liveness timer.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::PeerConfig;
use crate::core::{FileKey, FileResponseHook, MembershipState, PeerId, RingNode};
use crate::net::SocketNetwork;
use crate::scheduler::LivenessScheduler;
use crate::server::{spawn_tcp_listener, spawn_udp_listener};

/// A ring peer serving UDP probes and TCP messages on `port_base + id`.
///
/// Dropping a `Peer` stops its tasks without notifying anyone, which looks
/// like a crash to the rest of the ring. Use [`shutdown`](Self::shutdown) to
/// leave gracefully.
pub struct Peer {
    node: Arc<RingNode<SocketNetwork>>,
    scheduler: LivenessScheduler,
    udp_task: JoinHandle<()>,
    tcp_task: JoinHandle<()>,
}

impl Peer {
    pub async fn start(config: PeerConfig) -> Result<Self> {
        Self::start_with_hook(config, None).await
    }

    /// Bind both endpoints, then start serving and probing.
    ///
    /// Fails before anything is spawned if the configuration is invalid or
    /// either port cannot be bound.
    pub async fn start_with_hook(config: PeerConfig, hook: Option<FileResponseHook>) -> Result<Self> {
        config.validate()?;
        let addr = config.bind_addr();
        let udp = Arc::new(
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("binding udp endpoint {addr}"))?,
        );
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding tcp endpoint {addr}"))?;

        let network = SocketNetwork::new(udp.clone(), &config);
        let mut node = RingNode::new(MembershipState::from_config(&config), network);
        if let Some(hook) = hook {
            node = node.with_file_response_hook(hook);
        }
        let node = Arc::new(node);

        let udp_task = spawn_udp_listener(node.clone(), udp, &config);
        let tcp_task = spawn_tcp_listener(node.clone(), tcp, &config);
        let scheduler = LivenessScheduler::spawn(node.clone(), config.ping_interval);

        info!(peer = config.id, %addr, successors = ?node.successors().await, "peer started");
        Ok(Self {
            node,
            scheduler,
            udp_task,
            tcp_task,
        })
    }

    pub fn id(&self) -> PeerId {
        self.node.id
    }

    pub fn node(&self) -> &Arc<RingNode<SocketNetwork>> {
        &self.node
    }

    /// Send a FileRequest for `key` to the first successor.
    pub async fn request_file(&self, key: FileKey) -> Result<PeerId> {
        self.node
            .request_file(key)
            .await
            .context("no successor to send the file request to")
    }

    /// Leave the ring: notify recent predecessors, then stop all tasks.
    ///
    /// Returns the predecessors that were notified. Delivery is best effort.
    pub async fn shutdown(self) -> Vec<PeerId> {
        let notified = self.node.depart().await;
        info!(peer = self.node.id, ?notified, "departing");
        self.stop();
        notified
    }

    fn stop(&self) {
        self.scheduler.stop();
        self.udp_task.abort();
        self.tcp_task.abort();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop();
    }
}
