use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, warn};

use crate::config::PeerConfig;
use crate::core::{PeerId, RingNetwork, RingNode};
use crate::framing::{read_payload, write_payload};
use crate::net::peer_from_port;
use crate::protocol::{Message, PING_SIZE};

/// Pause after a failed receive or accept before trying again.
pub const LISTENER_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Handles one inbound datagram.
///
/// `sender` is the peer derived from the datagram's source port. Returns the
/// bytes to send back: a PingResponse for a PingRequest, the payload itself
/// for an unrecognised probe-sized datagram, nothing otherwise.
pub async fn handle_datagram<N: RingNetwork>(
    node: &RingNode<N>,
    payload: &[u8],
    sender: Option<PeerId>,
) -> Option<Vec<u8>> {
    match Message::decode_datagram(payload) {
        Ok(Message::PingRequest { seq }) => {
            match sender {
                Some(peer) => node.on_ping_request(peer).await,
                None => debug!(peer = node.id, %seq, "probe from outside the ring"),
            }
            Some(Message::PingResponse { seq }.encode())
        }
        Ok(Message::PingResponse { seq }) => {
            match sender {
                Some(peer) => node.on_ping_response(peer, seq).await,
                None => debug!(peer = node.id, %seq, "acknowledgement from outside the ring"),
            }
            None
        }
        _ if payload.len() == PING_SIZE => {
            debug!(peer = node.id, "unknown ping type, echoing");
            Some(payload.to_vec())
        }
        _ => {
            debug!(peer = node.id, len = payload.len(), "dropping unknown datagram");
            None
        }
    }
}

/// Handles the payload of one inbound connection.
///
/// Returns bytes to echo back on the same connection when the payload is
/// not a known message.
pub async fn handle_stream<N: RingNetwork>(node: &RingNode<N>, payload: &[u8]) -> Option<Vec<u8>> {
    let message = match Message::decode_stream(payload) {
        Ok(message) => message,
        Err(err) => {
            debug!(peer = node.id, len = payload.len(), "echoing stream payload: {err}");
            return Some(payload.to_vec());
        }
    };

    match message {
        Message::DepartNotice { peer, successors } => {
            node.on_depart_notice(peer, &successors).await;
        }
        Message::SuccessorRequest { peer } => {
            node.handle_successor_request(peer).await;
        }
        Message::SuccessorResponse { peer, successors } => {
            node.on_successor_response(peer, &successors).await;
        }
        Message::FileRequest { requester, key } => {
            node.handle_file_request(requester, key, payload).await;
        }
        Message::FileResponse(response) => {
            node.handle_file_response(&response).await;
        }
        Message::PingRequest { .. } | Message::PingResponse { .. } => {
            // decode_stream never yields probe kinds.
            return Some(payload.to_vec());
        }
    }
    None
}

/// Receive datagrams on `socket`, handling each on a bounded worker pool.
pub fn spawn_udp_listener<N: RingNetwork>(
    node: Arc<RingNode<N>>,
    socket: Arc<UdpSocket>,
    config: &PeerConfig,
) -> JoinHandle<()> {
    let port_base = config.port_base;
    let max_payload = config.max_datagram_payload;
    let workers = Arc::new(Semaphore::new(config.udp_workers));

    tokio::spawn(async move {
        let mut buf = vec![0u8; max_payload];
        loop {
            let Ok(permit) = workers.clone().acquire_owned().await else {
                break;
            };
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    drop(permit);
                    pause_after_listener_error(node.id, "udp receive", &err).await;
                    continue;
                }
            };
            let payload = buf[..len].to_vec();
            let node = node.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let sender = peer_from_port(port_base, from.port());
                if let Some(reply) = handle_datagram(&node, &payload, sender).await {
                    if let Err(err) = socket.send_to(&reply, from).await {
                        warn!(peer = node.id, %from, "udp reply failed: {err}");
                    }
                }
            });
        }
    })
}

/// Accept connections on `listener`, handling each on a bounded worker pool.
pub fn spawn_tcp_listener<N: RingNetwork>(
    node: Arc<RingNode<N>>,
    listener: TcpListener,
    config: &PeerConfig,
) -> JoinHandle<()> {
    let max_payload = config.max_stream_payload;
    let idle = config.stream_idle_timeout;
    let workers = Arc::new(Semaphore::new(config.tcp_workers));

    tokio::spawn(async move {
        loop {
            let Ok(permit) = workers.clone().acquire_owned().await else {
                break;
            };
            let (stream, from) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    drop(permit);
                    pause_after_listener_error(node.id, "tcp accept", &err).await;
                    continue;
                }
            };
            let node = node.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = serve_connection(&node, stream, max_payload, idle).await {
                    warn!(peer = node.id, %from, "connection failed: {err}");
                }
            });
        }
    })
}

/// Log a listener failure, then wait [`LISTENER_ERROR_BACKOFF`] before the
/// next attempt.
async fn pause_after_listener_error(peer: PeerId, operation: &str, err: &std::io::Error) {
    error!(peer, "{operation} failed: {err}");
    time::sleep(LISTENER_ERROR_BACKOFF).await;
}

async fn serve_connection<N: RingNetwork>(
    node: &RingNode<N>,
    mut stream: TcpStream,
    max_payload: usize,
    idle: Duration,
) -> std::io::Result<()> {
    let payload = read_payload(&mut stream, max_payload, idle).await?;
    if payload.is_empty() {
        return Ok(());
    }
    if let Some(echo) = handle_stream(node, &payload).await {
        write_payload(&mut stream, &echo).await?;
    }
    Ok(())
}
