//! # Ring DHT
//!
//! This crate implements one peer of a circular distributed hash table. Peers
//! sit on a 256-slot ring, each responsible for the arc of key space up to
//! its first successor, and each tracks two successors so the ring survives a
//! single failure between probes.
//!
//! The crate is split into a handful of modules:
//!
//! - [`core`]: the transport-agnostic membership logic: successor probing,
//!   death detection, recovery, departures, and the [`RingNode`] that wraps
//!   it behind a single lock.
//! - [`protocol`]: the seven wire messages and their ASCII/byte codec.
//! - [`net`]: a tokio UDP/TCP [`RingNetwork`] implementation.
//! - [`framing`]: reading and writing one payload per TCP connection.
//! - [`server`]: inbound datagram and connection dispatch with bounded
//!   worker pools.
//! - [`scheduler`]: the fixed-period liveness timer.
//! - [`config`] and [`peer`]: configuration and the runtime that ties the
//!   pieces together.
//!
//! ## Getting started
//!
//! ```no_run
//! use anyhow::Result;
//! use ring_dht::{Peer, PeerConfig};
//!
//! # async fn launch() -> Result<()> {
//! let peer = Peer::start(PeerConfig::new(4, [5, 8])).await?;
//! peer.request_file(2012).await?;
//! peer.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wraps [`Peer`] with a command line and an
//! interactive `request <key>` / `quit` console.

pub mod config;
pub mod core;
pub mod framing;
pub mod net;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod server;

pub use config::PeerConfig;
pub use self::core::{
    hash_file_name, hash_key, owns_key, ring_distance, FileKey, FileResponseHook,
    MembershipSnapshot, MembershipState, PeerId, RingNetwork, RingNode, SeqNum, PORT_BASE,
};
pub use net::{SendError, SocketNetwork};
pub use peer::Peer;
pub use protocol::{DecodeError, FileResponse, Message, MessageKind};
pub use server::{handle_datagram, handle_stream};
