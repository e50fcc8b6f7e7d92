//! Configuration for a ring peer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{ensure, Result};

use crate::core::{PeerId, DEFAULT_HISTORY_CAPACITY, DEFAULT_SUSPICION_THRESHOLD, PORT_BASE};
use crate::net::peer_port;

/// Settings for one peer.
///
/// Only `id` and `successors` are normally chosen per peer; the rest have
/// defaults suited to a ring running on a single host.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// This peer's ring position.
    pub id: PeerId,
    /// The initially known successors.
    pub successors: Vec<PeerId>,
    /// Address every peer binds to and is reached at.
    ///
    /// Default: 127.0.0.1
    pub host: IpAddr,
    /// Peer `n` listens on `port_base + n`.
    ///
    /// Default: 50000
    pub port_base: u16,
    /// Time between liveness probes.
    ///
    /// Default: 1s
    pub ping_interval: Duration,
    /// Unacknowledged probes before a successor is declared dead.
    ///
    /// Default: 4
    pub suspicion_threshold: usize,
    /// Predecessor observations remembered for departure notices.
    ///
    /// Default: 10
    pub history_capacity: usize,
    /// Concurrent datagram handlers.
    ///
    /// Default: 3
    pub udp_workers: usize,
    /// Concurrent connection handlers.
    ///
    /// Default: 5
    pub tcp_workers: usize,
    /// Largest datagram read; longer datagrams are truncated.
    pub max_datagram_payload: usize,
    /// Largest stream payload read per connection.
    pub max_stream_payload: usize,
    /// How long a connection may stay silent before its payload is taken as complete.
    pub stream_idle_timeout: Duration,
    /// Limit for establishing an outbound connection.
    pub connect_timeout: Duration,
}

impl PeerConfig {
    pub fn new(id: PeerId, successors: [PeerId; 2]) -> Self {
        Self {
            id,
            successors: successors.to_vec(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_base: PORT_BASE,
            ping_interval: Duration::from_secs(1),
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            udp_workers: 3,
            tcp_workers: 5,
            max_datagram_payload: 64,
            max_stream_payload: 1024,
            stream_idle_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_port_base(mut self, port_base: u16) -> Self {
        self.port_base = port_base;
        self
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_suspicion_threshold(mut self, threshold: usize) -> Self {
        self.suspicion_threshold = threshold;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_workers(mut self, udp: usize, tcp: usize) -> Self {
        self.udp_workers = udp;
        self.tcp_workers = tcp;
        self
    }

    /// The UDP and TCP port of this peer.
    pub fn port(&self) -> u16 {
        peer_port(self.port_base, self.id)
    }

    /// Local bind address for both endpoints.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port())
    }

    /// Reject settings that cannot run.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.port_base <= u16::MAX - u16::from(PeerId::MAX),
            "port base {} leaves no room for peer ports",
            self.port_base
        );
        ensure!(!self.ping_interval.is_zero(), "ping interval must be positive");
        ensure!(self.suspicion_threshold > 0, "suspicion threshold must be positive");
        ensure!(self.history_capacity > 0, "history capacity must be positive");
        ensure!(
            self.udp_workers > 0 && self.tcp_workers > 0,
            "worker pools need at least one worker"
        );
        ensure!(
            self.max_datagram_payload >= crate::protocol::PING_SIZE,
            "datagram buffer too small for probes"
        );
        ensure!(self.max_stream_payload > 0, "stream buffer must be positive");
        Ok(())
    }
}
