//! Socket transport built on tokio UDP and TCP.
//!
//! This module provides [`SocketNetwork`], the [`RingNetwork`] implementation
//! used by the binary. Every peer listens on `port_base + id` for both
//! protocols on the same host.
//!
//! # Addressing
//!
//! Probes are sent from the peer's own bound UDP socket, so the receiver can
//! recover the sender's id from the datagram's source port with
//! [`peer_from_port`]. Stream messages open a fresh TCP connection per
//! message and close it after writing.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};

use crate::config::PeerConfig;
use crate::core::{PeerId, RingNetwork};
use crate::framing::write_payload;

/// Failure of a single outbound send.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection was refused: the peer is not listening any more.
    #[error("peer {peer} is unreachable")]
    Unreachable { peer: PeerId },
    #[error("connecting to peer {peer} timed out")]
    Timeout { peer: PeerId },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The port a peer listens on.
pub fn peer_port(port_base: u16, peer: PeerId) -> u16 {
    port_base.saturating_add(u16::from(peer))
}

/// Recover a peer id from a port, if the port lies in the ring's range.
pub fn peer_from_port(port_base: u16, port: u16) -> Option<PeerId> {
    port.checked_sub(port_base)
        .and_then(|offset| PeerId::try_from(offset).ok())
}

/// Whether a connect error means nobody is listening at the far end.
fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// [`RingNetwork`] over real sockets.
///
/// Shares the UDP socket with the datagram listener so that probes carry the
/// local peer's port as their source.
pub struct SocketNetwork {
    udp: Arc<UdpSocket>,
    host: IpAddr,
    port_base: u16,
    connect_timeout: Duration,
}

impl SocketNetwork {
    pub fn new(udp: Arc<UdpSocket>, config: &PeerConfig) -> Self {
        Self {
            udp,
            host: config.host,
            port_base: config.port_base,
            connect_timeout: config.connect_timeout,
        }
    }

    fn addr(&self, peer: PeerId) -> SocketAddr {
        SocketAddr::new(self.host, peer_port(self.port_base, peer))
    }
}

#[async_trait]
impl RingNetwork for SocketNetwork {
    async fn send_datagram(&self, to: PeerId, payload: Vec<u8>) -> Result<(), SendError> {
        self.udp.send_to(&payload, self.addr(to)).await?;
        Ok(())
    }

    async fn send_stream(&self, to: PeerId, payload: Vec<u8>) -> Result<(), SendError> {
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(self.addr(to))).await {
            Err(_) => return Err(SendError::Timeout { peer: to }),
            Ok(Err(err)) if is_unreachable(&err) => return Err(SendError::Unreachable { peer: to }),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(stream)) => stream,
        };
        write_payload(&mut stream, &payload).await?;
        Ok(())
    }
}
