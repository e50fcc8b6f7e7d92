//! Core ring logic: transport-agnostic membership and failure detection.
//!
//! This module contains the building blocks of a single ring peer:
//!
//! - **Identity & Hashing**: [`PeerId`], [`FileKey`], [`hash_key`], [`hash_file_name`]
//! - **Ring Geometry**: [`ring_distance`] and the [`owns_key`] ownership rule
//! - **Probing**: [`SeqNum`] and [`SuccessorEntry`] for wrapping liveness probes
//! - **Membership**: [`PredecessorHistory`] and [`MembershipState`], the pure
//!   state machine behind successor tracking, death detection and recovery
//! - **Node**: [`RingNetwork`] and [`RingNode`], which wrap the membership
//!   state in a single lock and perform the resulting network effects

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::num::ParseIntError;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::net::SendError;
use crate::protocol::{FileResponse, Message};

// ============================================================================
// Type Aliases
// ============================================================================

/// A ring position in `[0, 255]`.
///
/// Peer identities and hashed file keys share the same modulo-256 space.
pub type PeerId = u8;

/// A raw, unhashed file key as typed by a user (for example `2012`).
///
/// Raw keys are mapped onto the ring with [`hash_key`].
pub type FileKey = u32;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Ports are derived as `PORT_BASE + peer id` for both UDP and TCP.
pub const PORT_BASE: u16 = 50_000;

/// Number of successors each peer tracks.
pub const MAX_SUCCESSORS: usize = 2;

/// Consecutive unacknowledged probes before a successor is declared dead.
pub const DEFAULT_SUSPICION_THRESHOLD: usize = 4;

/// Number of probe-request senders remembered for departure notices.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// At most this many distinct predecessors are notified on departure.
const MAX_NOTIFIED_PREDECESSORS: usize = 2;

// ============================================================================
// Hashing & Ring Geometry
// ============================================================================

/// Map a raw file key onto the ring: `(raw + 1) mod 256`.
///
/// ```
/// use ring_dht::hash_key;
///
/// assert_eq!(hash_key(5), 6);
/// assert_eq!(hash_key(255), 0);
/// assert_eq!(hash_key(2012), 221);
/// ```
pub fn hash_key(raw: FileKey) -> PeerId {
    ((raw % 256) as PeerId).wrapping_add(1)
}

/// Parse a decimal file name (surrounding whitespace ignored) and hash it.
pub fn hash_file_name(name: &str) -> Result<PeerId, ParseIntError> {
    let raw: FileKey = name.trim().parse()?;
    Ok(hash_key(raw))
}

/// Clockwise distance from `from` to `to` on the 256-slot ring.
pub fn ring_distance(from: PeerId, to: PeerId) -> u8 {
    to.wrapping_sub(from)
}

/// Whether `self_id` is responsible for the hashed `key`.
///
/// The key must lie above `self_id`, and either below `first_successor` or
/// on the last arc of the ring, where the successor id is below `self_id`.
/// Keys equal to a peer id, and keys no greater than the smallest peer id,
/// are owned by nobody.
pub fn owns_key(self_id: PeerId, first_successor: PeerId, key: PeerId) -> bool {
    key > self_id && (first_successor < self_id || key < first_successor)
}

// ============================================================================
// Sequence Numbers
// ============================================================================

/// A probe sequence number carried on the wire as a signed byte.
///
/// Increments wrap modulo 256, so `127` is followed by `-128`. Ordering is
/// never interpreted; acknowledgements are matched by value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SeqNum(i8);

impl SeqNum {
    pub const fn new(raw: i8) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i8 {
        self.0
    }

    /// The following sequence number, wrapping from `127` to `-128`.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub const fn to_byte(self) -> u8 {
        self.0 as u8
    }

    pub const fn from_byte(byte: u8) -> Self {
        Self(byte as i8)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Successor Tracking
// ============================================================================

/// A known successor together with its outstanding probes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuccessorEntry {
    id: PeerId,
    next_seq: SeqNum,
    unacked: Vec<SeqNum>,
}

impl SuccessorEntry {
    /// A freshly adopted successor: alive, with no outstanding probes.
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            next_seq: SeqNum::default(),
            unacked: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    pub fn unacked(&self) -> &[SeqNum] {
        &self.unacked
    }

    /// Record an outgoing probe and advance the counter.
    ///
    /// Returns the sequence number the probe must carry.
    pub fn probe(&mut self) -> SeqNum {
        let seq = self.next_seq;
        self.unacked.push(seq);
        self.next_seq = seq.next();
        seq
    }

    /// Cumulatively acknowledge every probe up to and including `seq`.
    ///
    /// Returns the number of cleared probes, or `None` if `seq` is not
    /// outstanding.
    pub fn acknowledge(&mut self, seq: SeqNum) -> Option<usize> {
        let position = self.unacked.iter().position(|s| *s == seq)?;
        self.unacked.drain(..=position);
        Some(position + 1)
    }

    pub fn is_suspected(&self, threshold: usize) -> bool {
        self.unacked.len() >= threshold
    }
}

/// Bounded FIFO of peers recently observed sending probe requests.
///
/// Inserts never deduplicate; [`recent`](Self::recent) deduplicates on read.
#[derive(Clone, Debug)]
pub struct PredecessorHistory {
    entries: VecDeque<PeerId>,
    capacity: usize,
}

impl PredecessorHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an observation, evicting the oldest one when full.
    pub fn record(&mut self, peer: PeerId) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(peer);
    }

    /// Drop every observation of `peer`.
    pub fn remove(&mut self, peer: PeerId) {
        self.entries.retain(|p| *p != peer);
    }

    /// Up to `limit` distinct peers, chosen by most recent occurrence and
    /// returned oldest to newest.
    pub fn recent(&self, limit: usize) -> Vec<PeerId> {
        let mut picked = Vec::with_capacity(limit);
        for peer in self.entries.iter().rev() {
            if picked.len() == limit {
                break;
            }
            if !picked.contains(peer) {
                picked.push(*peer);
            }
        }
        picked.reverse();
        picked
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.entries.iter().copied()
    }
}

// ============================================================================
// Membership State
// ============================================================================

/// A successor judged dead during a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Death {
    /// The successor that exceeded the suspicion threshold.
    pub peer: PeerId,
    /// Nearest remaining successor to ask for a replacement, if any.
    pub recovery_target: Option<PeerId>,
}

/// Everything a tick decided, to be sent once the lock is released.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub deaths: Vec<Death>,
    pub probes: Vec<(PeerId, SeqNum)>,
}

/// Result of applying a probe acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// `cleared` outstanding probes were acknowledged.
    Acknowledged { cleared: usize },
    /// The peer is a successor but the sequence number is not outstanding.
    UnknownSequence,
    /// The peer is not (or no longer) a successor.
    UnknownPeer,
}

/// Point-in-time view of one successor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuccessorStatus {
    pub id: PeerId,
    pub next_seq: SeqNum,
    pub unacked: Vec<SeqNum>,
}

/// Point-in-time view of a peer's membership state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub self_id: PeerId,
    pub successors: Vec<SuccessorStatus>,
    /// Raw predecessor observations, oldest first.
    pub predecessor_history: Vec<PeerId>,
    pub death_watch: Vec<PeerId>,
}

/// Successor list, predecessor history and death watch of a single peer.
///
/// The type is synchronous and performs no I/O. Operations that need to
/// contact other peers return a description of what to send, which
/// [`RingNode`] performs after releasing its lock.
///
/// Successors are kept ordered by clockwise distance from the local peer,
/// so entry 0 is always the nearest known neighbour.
#[derive(Clone, Debug)]
pub struct MembershipState {
    self_id: PeerId,
    successors: Vec<SuccessorEntry>,
    history: PredecessorHistory,
    death_watch: HashSet<PeerId>,
    suspicion_threshold: usize,
}

impl MembershipState {
    /// Create the state for `self_id` with its initially configured successors.
    ///
    /// Ids equal to `self_id` or repeated ids are skipped.
    pub fn new(
        self_id: PeerId,
        initial_successors: &[PeerId],
        suspicion_threshold: usize,
        history_capacity: usize,
    ) -> Self {
        let mut state = Self {
            self_id,
            successors: Vec::with_capacity(MAX_SUCCESSORS + 1),
            history: PredecessorHistory::new(history_capacity),
            death_watch: HashSet::new(),
            suspicion_threshold: suspicion_threshold.max(1),
        };
        for id in initial_successors {
            if !state.adopt(*id) {
                warn!(peer = self_id, successor = id, "ignoring unusable initial successor");
            }
        }
        state
    }

    pub fn from_config(config: &PeerConfig) -> Self {
        Self::new(
            config.id,
            &config.successors,
            config.suspicion_threshold,
            config.history_capacity,
        )
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Detect dead successors, then probe every remaining one.
    ///
    /// A successor with at least `suspicion_threshold` unacknowledged probes
    /// is removed from the successor list and the predecessor history and
    /// placed on the death watch. Each such death names the nearest surviving
    /// successor as the peer to ask for a replacement.
    pub fn tick(&mut self) -> TickPlan {
        let threshold = self.suspicion_threshold;
        let dead: Vec<PeerId> = self
            .successors
            .iter()
            .filter(|entry| entry.is_suspected(threshold))
            .map(SuccessorEntry::id)
            .collect();

        for peer in &dead {
            self.remove_peer(*peer);
            self.death_watch.insert(*peer);
        }

        let recovery_target = self.successor(1);
        let deaths = dead
            .into_iter()
            .map(|peer| Death {
                peer,
                recovery_target,
            })
            .collect();

        let probes = self
            .successors
            .iter_mut()
            .map(|entry| (entry.id, entry.probe()))
            .collect();

        TickPlan { deaths, probes }
    }

    /// Apply a probe acknowledgement from `peer`.
    pub fn on_ping_response(&mut self, peer: PeerId, seq: SeqNum) -> AckOutcome {
        let Some(entry) = self.successors.iter_mut().find(|e| e.id == peer) else {
            return AckOutcome::UnknownPeer;
        };
        match entry.acknowledge(seq) {
            Some(cleared) => AckOutcome::Acknowledged { cleared },
            None => AckOutcome::UnknownSequence,
        }
    }

    /// Remember `peer` as a recent predecessor.
    pub fn on_ping_request(&mut self, peer: PeerId) {
        self.history.record(peer);
    }

    /// Handle a graceful departure, adopting at most one offered successor.
    ///
    /// Returns the adopted successor, if any.
    pub fn on_depart_notice(&mut self, departing: PeerId, offered: &[PeerId]) -> Option<PeerId> {
        self.remove_peer(departing);
        offered.iter().copied().find(|id| self.adopt(*id))
    }

    /// Handle a successor-list response, adopting at most one offered id.
    ///
    /// An offered id on the death watch is taken as proof of life: it leaves
    /// the watch but is not adopted.
    pub fn on_successor_response(&mut self, responder: PeerId, offered: &[PeerId]) -> Option<PeerId> {
        for id in offered.iter().copied() {
            if self.death_watch.remove(&id) {
                debug!(
                    peer = self.self_id,
                    responder,
                    confirmed = id,
                    "suspected peer reported alive"
                );
                continue;
            }
            if self.adopt(id) {
                return Some(id);
            }
        }
        None
    }

    /// Forget `peer` after a failed connection attempt.
    ///
    /// Returns `true` if it was a successor.
    pub fn on_death_detected_externally(&mut self, peer: PeerId) -> bool {
        self.remove_peer(peer)
    }

    /// Current successor ids, nearest first.
    pub fn successors(&self) -> Vec<PeerId> {
        self.successors.iter().map(SuccessorEntry::id).collect()
    }

    /// The successor at `rank` (1 = nearest, 2 = second), if known.
    pub fn successor(&self, rank: usize) -> Option<PeerId> {
        rank.checked_sub(1)
            .and_then(|index| self.successors.get(index))
            .map(SuccessorEntry::id)
    }

    /// Up to two distinct recent predecessors, or `None` when no peer has
    /// probed us (or all of them have since been removed).
    pub fn recent_predecessors(&self) -> Option<Vec<PeerId>> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.recent(MAX_NOTIFIED_PREDECESSORS))
    }

    pub fn is_watched(&self, peer: PeerId) -> bool {
        self.death_watch.contains(&peer)
    }

    pub fn entry(&self, peer: PeerId) -> Option<&SuccessorEntry> {
        self.successors.iter().find(|e| e.id == peer)
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        let death_watch: BTreeSet<PeerId> = self.death_watch.iter().copied().collect();
        MembershipSnapshot {
            self_id: self.self_id,
            successors: self
                .successors
                .iter()
                .map(|e| SuccessorStatus {
                    id: e.id,
                    next_seq: e.next_seq,
                    unacked: e.unacked.clone(),
                })
                .collect(),
            predecessor_history: self.history.iter().collect(),
            death_watch: death_watch.into_iter().collect(),
        }
    }

    /// Insert `id` as a successor, keeping the nearest [`MAX_SUCCESSORS`].
    ///
    /// Adoption fails for the local id, an id already present, or an id
    /// farther away than every current successor when the list is full.
    fn adopt(&mut self, id: PeerId) -> bool {
        if id == self.self_id || self.successors.iter().any(|e| e.id == id) {
            return false;
        }
        let self_id = self.self_id;
        self.successors.push(SuccessorEntry::new(id));
        self.successors
            .sort_by_key(|entry| ring_distance(self_id, entry.id));
        self.successors.truncate(MAX_SUCCESSORS);
        self.successors.iter().any(|e| e.id == id)
    }

    fn remove_peer(&mut self, peer: PeerId) -> bool {
        self.history.remove(peer);
        let before = self.successors.len();
        self.successors.retain(|e| e.id != peer);
        self.successors.len() != before
    }
}

// ============================================================================
// Network Abstraction
// ============================================================================

/// Outbound transport used by a [`RingNode`].
///
/// Payloads are already encoded. Implementations address peers as
/// `port_base + id`; datagrams must leave from the local UDP endpoint so
/// receivers can identify the sender by its source port.
#[async_trait]
pub trait RingNetwork: Send + Sync + 'static {
    /// Send a single UDP datagram.
    async fn send_datagram(&self, to: PeerId, payload: Vec<u8>) -> Result<(), SendError>;

    /// Open a connection, write the payload, and close it.
    ///
    /// Must report [`SendError::Unreachable`] when the connection is refused.
    async fn send_stream(&self, to: PeerId, payload: Vec<u8>) -> Result<(), SendError>;
}

/// Callback invoked for every FileResponse addressed to this peer.
pub type FileResponseHook = Arc<dyn Fn(&FileResponse) + Send + Sync>;

fn log_file_response(response: &FileResponse) {
    info!(
        responder = response.responder,
        key = response.key,
        found = response.found,
        "received a response message from peer {}, which has the file {}",
        response.responder,
        response.key
    );
}

// ============================================================================
// Ring Node
// ============================================================================

/// A ring peer: [`MembershipState`] behind one lock plus a [`RingNetwork`].
///
/// Every operation takes the lock, computes what has to be sent, releases
/// the lock, and only then touches the network. The node is `Arc`-friendly
/// and is shared by the liveness scheduler and all dispatch workers.
pub struct RingNode<N: RingNetwork> {
    /// This peer's ring position.
    pub id: PeerId,
    membership: Mutex<MembershipState>,
    network: Arc<N>,
    file_response_hook: FileResponseHook,
}

impl<N: RingNetwork> RingNode<N> {
    pub fn new(state: MembershipState, network: N) -> Self {
        Self {
            id: state.self_id(),
            membership: Mutex::new(state),
            network: Arc::new(network),
            file_response_hook: Arc::new(log_file_response),
        }
    }

    /// Replace the default (logging) FileResponse handler.
    pub fn with_file_response_hook(mut self, hook: FileResponseHook) -> Self {
        self.file_response_hook = hook;
        self
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    /// One liveness round: handle deaths, then probe all successors.
    pub async fn on_tick(&self) {
        let plan = {
            let mut state = self.membership.lock().await;
            let plan = state.tick();
            if !plan.deaths.is_empty() {
                log_successors(&state);
            }
            plan
        };

        for death in &plan.deaths {
            info!(peer = self.id, dead = death.peer, "peer {} is no longer alive", death.peer);
            match death.recovery_target {
                Some(target) => {
                    let request = Message::SuccessorRequest { peer: self.id };
                    self.send_stream(target, request.encode()).await;
                }
                None => warn!(
                    peer = self.id,
                    dead = death.peer,
                    "no successor remains to ask for a replacement"
                ),
            }
        }

        for (to, seq) in plan.probes {
            let payload = Message::PingRequest { seq }.encode();
            if let Err(err) = self.network.send_datagram(to, payload).await {
                debug!(peer = self.id, to, %seq, "probe send failed: {err}");
            }
        }
    }

    pub async fn on_ping_response(&self, from: PeerId, seq: SeqNum) {
        let outcome = {
            let mut state = self.membership.lock().await;
            state.on_ping_response(from, seq)
        };
        match outcome {
            AckOutcome::Acknowledged { cleared } => {
                debug!(peer = self.id, from, %seq, cleared, "probe acknowledged");
            }
            AckOutcome::UnknownSequence => {
                warn!(peer = self.id, from, %seq, "sequence number {seq} does not exist for peer {from}");
            }
            AckOutcome::UnknownPeer => {
                debug!(peer = self.id, from, %seq, "ignoring acknowledgement from non-successor");
            }
        }
    }

    pub async fn on_ping_request(&self, from: PeerId) {
        let mut state = self.membership.lock().await;
        state.on_ping_request(from);
    }

    pub async fn on_depart_notice(&self, departing: PeerId, offered: &[PeerId]) {
        info!(peer = self.id, departing, "peer {departing} will depart from the network");
        let mut state = self.membership.lock().await;
        let adopted = state.on_depart_notice(departing, offered);
        debug!(peer = self.id, departing, ?adopted, "applied departure notice");
        log_successors(&state);
    }

    pub async fn on_successor_response(&self, responder: PeerId, offered: &[PeerId]) {
        let mut state = self.membership.lock().await;
        let adopted = state.on_successor_response(responder, offered);
        if adopted.is_some() {
            log_successors(&state);
        } else {
            debug!(peer = self.id, responder, ?offered, "no successor adopted from response");
        }
    }

    pub async fn on_death_detected_externally(&self, peer: PeerId) {
        let mut state = self.membership.lock().await;
        if state.on_death_detected_externally(peer) {
            info!(peer = self.id, dead = peer, "peer {peer} is no longer alive");
            log_successors(&state);
        }
    }

    /// Current successor ids, nearest first.
    pub async fn successors(&self) -> Vec<PeerId> {
        self.membership.lock().await.successors()
    }

    /// The successor at `rank` (1 or 2), if known.
    pub async fn successor_id(&self, rank: usize) -> Option<PeerId> {
        self.membership.lock().await.successor(rank)
    }

    pub async fn recent_predecessors(&self) -> Option<Vec<PeerId>> {
        self.membership.lock().await.recent_predecessors()
    }

    pub async fn snapshot(&self) -> MembershipSnapshot {
        self.membership.lock().await.snapshot()
    }

    /// Answer a SuccessorRequest with our successor list.
    pub async fn handle_successor_request(&self, requester: PeerId) {
        let successors = self.successors().await;
        if successors.is_empty() {
            warn!(peer = self.id, requester, "no successors to report");
            return;
        }
        let response = Message::SuccessorResponse {
            peer: self.id,
            successors,
        };
        self.send_stream(requester, response.encode()).await;
    }

    /// Answer a FileRequest if we own the key, otherwise pass the untouched
    /// request on to our first successor.
    ///
    /// A request of our own that returns unanswered is dropped, so a key no
    /// peer owns circles the ring once.
    pub async fn handle_file_request(&self, requester: PeerId, key: FileKey, original: &[u8]) {
        let hashed = hash_key(key);
        let first = self.successor_id(1).await;
        let owned = first.map_or(true, |successor| owns_key(self.id, successor, hashed));

        if owned {
            info!(peer = self.id, key, hashed, "file {key} is here");
            let response = Message::FileResponse(FileResponse {
                responder: self.id,
                key,
                found: true,
                requester,
            });
            self.send_stream(requester, response.encode()).await;
            info!(
                peer = self.id,
                requester,
                "a response message, destined for peer {requester}, has been sent"
            );
            return;
        }

        info!(peer = self.id, key, hashed, "file {key} is not stored here");
        if requester == self.id {
            // Our own request came all the way round: no peer owns the key.
            warn!(peer = self.id, key, hashed, "no peer owns file {key}, dropping request");
            return;
        }
        if let Some(successor) = first {
            self.send_stream(successor, original.to_vec()).await;
            info!(peer = self.id, successor, "file request message has been forwarded to my successor");
        }
    }

    pub async fn handle_file_response(&self, response: &FileResponse) {
        (self.file_response_hook)(response);
    }

    /// Start a lookup for `key` at our first successor.
    ///
    /// Returns the successor the request was sent to.
    pub async fn request_file(&self, key: FileKey) -> Option<PeerId> {
        let Some(successor) = self.successor_id(1).await else {
            warn!(peer = self.id, key, "no successor to send the file request to");
            return None;
        };
        let request = Message::FileRequest {
            requester: self.id,
            key,
        };
        self.send_stream(successor, request.encode()).await;
        Some(successor)
    }

    /// Notify recent predecessors that we are leaving.
    ///
    /// Returns the predecessors a DepartNotice was sent to.
    pub async fn depart(&self) -> Vec<PeerId> {
        let (predecessors, successors) = {
            let state = self.membership.lock().await;
            (state.recent_predecessors(), state.successors())
        };
        let Some(predecessors) = predecessors else {
            info!(peer = self.id, "no known predecessor to notify");
            return Vec::new();
        };
        if successors.is_empty() {
            warn!(peer = self.id, "no successors to hand over on departure");
            return Vec::new();
        }

        let notice = Message::DepartNotice {
            peer: self.id,
            successors,
        }
        .encode();
        future::join_all(
            predecessors
                .iter()
                .map(|predecessor| self.send_stream(*predecessor, notice.clone())),
        )
        .await;
        predecessors
    }

    /// Fire-and-forget stream send; a refused connection marks the peer dead.
    async fn send_stream(&self, to: PeerId, payload: Vec<u8>) {
        match self.network.send_stream(to, payload).await {
            Ok(()) => {}
            Err(SendError::Unreachable { peer }) => {
                debug!(peer = self.id, to = peer, "connection refused");
                self.on_death_detected_externally(peer).await;
            }
            Err(err) => warn!(peer = self.id, to, "stream send failed: {err}"),
        }
    }
}

fn log_successors(state: &MembershipState) {
    match state.successor(1) {
        Some(id) => info!(peer = state.self_id(), "my first successor is now peer {id}"),
        None => warn!(peer = state.self_id(), "no first successor remains"),
    }
    match state.successor(2) {
        Some(id) => info!(peer = state.self_id(), "my second successor is now peer {id}"),
        None => debug!(peer = state.self_id(), "no second successor known"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(self_id: PeerId, successors: &[PeerId]) -> MembershipState {
        MembershipState::new(
            self_id,
            successors,
            DEFAULT_SUSPICION_THRESHOLD,
            DEFAULT_HISTORY_CAPACITY,
        )
    }

    #[test]
    fn hash_key_wraps_modulo_256() {
        assert_eq!(hash_file_name("5").unwrap(), 6);
        assert_eq!(hash_file_name("255").unwrap(), 0);
        assert_eq!(hash_file_name(" 2012\n").unwrap(), 221);
        assert!(hash_file_name("abc").is_err());
        assert_eq!(hash_key(FileKey::MAX), 0);
    }

    #[test]
    fn ownership_matches_worked_examples() {
        assert!(owns_key(250, 5, 255), "arc crossing zero");
        assert!(owns_key(10, 20, 15));
        assert!(!owns_key(10, 20, 25));
        assert!(!owns_key(10, 20, 5));
        assert!(!owns_key(250, 5, 2), "keys below the smallest peer are unowned");
        assert!(!owns_key(10, 20, 20), "the successor's own id is excluded");
        assert!(!owns_key(10, 20, 10), "the local id is excluded");
    }

    #[test]
    fn ownership_agrees_with_open_interval_rule_everywhere() {
        for self_id in PeerId::MIN..=PeerId::MAX {
            for successor in PeerId::MIN..=PeerId::MAX {
                for key in [0, 2, 5, 20, 255] {
                    let expected =
                        key > self_id && (successor < self_id || key < successor);
                    assert_eq!(
                        owns_key(self_id, successor, key),
                        expected,
                        "owns_key({self_id}, {successor}, {key})"
                    );
                }
            }
        }
    }

    #[test]
    fn ring_distance_is_clockwise() {
        assert_eq!(ring_distance(10, 20), 10);
        assert_eq!(ring_distance(250, 5), 11);
        assert_eq!(ring_distance(7, 7), 0);
    }

    #[test]
    fn seq_num_wraps_through_negative_values() {
        // The counter is a plain modulo-256 counter: after 127 comes -128,
        // not a reset to 0.
        assert_eq!(SeqNum::new(127).next(), SeqNum::new(-128));
        assert_eq!(SeqNum::new(-1).next(), SeqNum::new(0));
        assert_eq!(SeqNum::from_byte(0x80), SeqNum::new(-128));
        assert_eq!(SeqNum::new(-128).to_byte(), 0x80);
    }

    #[test]
    fn successor_probes_wrap_and_still_acknowledge() {
        let mut entry = SuccessorEntry::new(9);
        for _ in 0..127 {
            let seq = entry.probe();
            entry.acknowledge(seq);
        }
        assert_eq!(entry.next_seq(), SeqNum::new(127));
        assert_eq!(entry.probe(), SeqNum::new(127));
        assert_eq!(entry.probe(), SeqNum::new(-128));
        assert_eq!(entry.acknowledge(SeqNum::new(-128)), Some(2));
        assert!(entry.unacked().is_empty());
    }

    #[test]
    fn acknowledgement_is_cumulative() {
        let mut s = state(1, &[3, 5]);
        for _ in 0..3 {
            s.tick();
        }
        assert_eq!(
            s.entry(3).unwrap().unacked(),
            &[SeqNum::new(0), SeqNum::new(1), SeqNum::new(2)]
        );

        assert_eq!(
            s.on_ping_response(3, SeqNum::new(1)),
            AckOutcome::Acknowledged { cleared: 2 }
        );
        assert_eq!(s.entry(3).unwrap().unacked(), &[SeqNum::new(2)]);

        assert_eq!(
            s.on_ping_response(3, SeqNum::new(2)),
            AckOutcome::Acknowledged { cleared: 1 }
        );
        assert!(s.entry(3).unwrap().unacked().is_empty());
    }

    #[test]
    fn unknown_acknowledgement_changes_nothing() {
        let mut s = state(1, &[3, 5]);
        s.tick();
        let before = s.snapshot();
        assert_eq!(s.on_ping_response(3, SeqNum::new(42)), AckOutcome::UnknownSequence);
        assert_eq!(s.on_ping_response(77, SeqNum::new(0)), AckOutcome::UnknownPeer);
        assert_eq!(s.snapshot(), before);
    }

    #[test]
    fn fourth_unacknowledged_probe_triggers_death_once() {
        let mut s = state(1, &[3, 5]);
        s.on_ping_request(3);
        for _ in 0..4 {
            let plan = s.tick();
            assert!(plan.deaths.is_empty());
            let seq = s.entry(5).unwrap().unacked()[0];
            s.on_ping_response(5, seq);
        }

        let plan = s.tick();
        assert_eq!(
            plan.deaths,
            vec![Death {
                peer: 3,
                recovery_target: Some(5)
            }]
        );
        assert_eq!(plan.probes.len(), 1, "dead successor is no longer probed");
        assert_eq!(s.successors(), vec![5]);
        assert!(s.is_watched(3));
        assert_eq!(s.recent_predecessors(), None, "dead peer leaves the history");

        let plan = s.tick();
        assert!(plan.deaths.is_empty(), "death is reported once per episode");
    }

    #[test]
    fn death_without_survivors_has_no_recovery_target() {
        let mut s = state(1, &[3]);
        for _ in 0..4 {
            s.tick();
        }
        let plan = s.tick();
        assert_eq!(
            plan.deaths,
            vec![Death {
                peer: 3,
                recovery_target: None
            }]
        );
        assert!(plan.probes.is_empty());
        assert!(s.successors().is_empty());
    }

    #[test]
    fn adopting_present_id_is_not_an_adoption() {
        let mut s = state(10, &[30]);
        let adopted = s.on_successor_response(30, &[30, 10, 40]);
        assert_eq!(adopted, Some(40), "duplicates and self are skipped, loop continues");
        assert_eq!(s.successors(), vec![30, 40]);
    }

    #[test]
    fn departure_replaces_departing_successor() {
        // P = 10 with successors [A = 20, D = 30]; A departs offering [B = 30, C = 40].
        let mut s = state(10, &[20, 30]);
        let adopted = s.on_depart_notice(20, &[30, 40]);
        assert_eq!(adopted, Some(40));
        assert_eq!(s.successors(), vec![30, 40]);

        let mut s = state(10, &[20, 30]);
        let adopted = s.on_depart_notice(20, &[35, 40]);
        assert_eq!(adopted, Some(35), "only the first acceptable id is adopted");
        assert_eq!(s.successors(), vec![30, 35]);
    }

    #[test]
    fn departure_removes_predecessor_observations() {
        let mut s = state(10, &[20, 30]);
        s.on_ping_request(5);
        s.on_ping_request(250);
        s.on_depart_notice(5, &[10, 20]);
        assert_eq!(s.recent_predecessors(), Some(vec![250]));
        assert_eq!(s.successors(), vec![20, 30]);
    }

    #[test]
    fn successor_list_orders_by_ring_distance() {
        let s = state(250, &[3, 252]);
        assert_eq!(s.successors(), vec![252, 3]);
        assert_eq!(s.successor(1), Some(252));
        assert_eq!(s.successor(2), Some(3));
        assert_eq!(s.successor(3), None);
        assert_eq!(s.successor(0), None);
    }

    #[test]
    fn initial_successors_skip_self_and_duplicates() {
        let s = state(7, &[7, 9, 9]);
        assert_eq!(s.successors(), vec![9]);
    }

    #[test]
    fn watched_peer_is_confirmed_not_adopted() {
        let mut s = state(1, &[3, 5]);
        for _ in 0..5 {
            s.tick();
            let seq = *s.entry(5).unwrap().unacked().last().unwrap();
            s.on_ping_response(5, seq);
        }
        assert!(s.is_watched(3));

        let adopted = s.on_successor_response(5, &[3, 8]);
        assert_eq!(adopted, Some(8));
        assert!(!s.is_watched(3));
        assert_eq!(s.successors(), vec![5, 8]);
    }

    #[test]
    fn external_death_removes_successor_and_predecessor() {
        let mut s = state(1, &[3, 5]);
        s.on_ping_request(3);
        s.on_ping_request(200);
        assert!(s.on_death_detected_externally(3));
        assert!(!s.on_death_detected_externally(3));
        assert_eq!(s.successors(), vec![5]);
        assert_eq!(s.recent_predecessors(), Some(vec![200]));
        assert!(!s.is_watched(3));
    }

    #[test]
    fn history_evicts_oldest_first() {
        let capacity = 10;
        let mut history = PredecessorHistory::new(capacity);
        for peer in 0..(capacity as PeerId + 5) {
            history.record(peer);
        }
        let remaining: Vec<PeerId> = history.iter().collect();
        assert_eq!(remaining, (5..15).collect::<Vec<PeerId>>());
        assert_eq!(history.len(), capacity);
    }

    #[test]
    fn recent_predecessors_are_distinct_and_capped() {
        let mut s = state(1, &[3, 5]);
        assert_eq!(s.recent_predecessors(), None);

        for peer in [200, 201, 200, 200, 199, 200] {
            s.on_ping_request(peer);
        }
        assert_eq!(s.recent_predecessors(), Some(vec![199, 200]));
    }
}
