// Copyright (c) 2024 Botho Foundation

//! In-memory network implementing every collaborator trait.
//!
//! Used by the unit and integration tests and by the `tunnel-sim` binary.
//! Each peer has a scripted [`PeerBehavior`]; every request that reaches a
//! peer is logged so tests can check ordering and absence of traffic.

use async_trait::async_trait;
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};
use tracing::trace;

use crate::{
    error::{CryptoError, LeaseError, TransportError},
    messages::{JoinReply, JoinStatus, TunnelMessage},
    traits::{CryptoEngine, LeasePublisher, LeaseSet, MessageTransport, PeerInfo, PeerLookup},
    types::{Destination, SigningKeys, SigningPrivateKey, SymmetricKey, TunnelId, SIGNING_KEY_LEN},
};

/// How a simulated peer answers join requests and probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    Accept { latency: Duration },
    Reject(JoinStatus),
    /// Never answers.
    Timeout,
    Unreachable,
    /// Answers with a reply whose signature does not verify.
    BadSignature,
}

impl Default for PeerBehavior {
    fn default() -> Self {
        PeerBehavior::Accept {
            latency: Duration::from_millis(20),
        }
    }
}

/// One message delivered to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub target: PeerId,
    pub via: TunnelId,
    pub reply_via: TunnelId,
    /// Circuit being built; `None` for test probes.
    pub circuit: Option<TunnelId>,
}

impl SentRequest {
    pub fn is_probe(&self) -> bool {
        self.circuit.is_none()
    }
}

struct SimPeer {
    info: PeerInfo,
    behavior: PeerBehavior,
}

#[derive(Default)]
pub struct SimNetwork {
    order: RwLock<Vec<PeerId>>,
    peers: RwLock<HashMap<PeerId, SimPeer>>,
    unknown: RwLock<Vec<PeerId>>,
    resolvable: RwLock<HashSet<PeerId>>,
    requests: Mutex<Vec<SentRequest>>,
    failed_circuits: RwLock<HashSet<TunnelId>>,
    disconnected: RwLock<HashSet<Destination>>,
    leases: Mutex<Vec<LeaseSet>>,
    reject_leases: RwLock<bool>,
    failure_rate: RwLock<f64>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `count` well-behaved peers, each in its own /16.
    pub fn with_peers(count: usize) -> Arc<Self> {
        let network = Self::new();
        for i in 0..count {
            let ip = Ipv4Addr::new(10 + (i / 256) as u8, (i % 256) as u8, 0, 1);
            network.add_peer_with(PeerId::random(), Some(ip), 1.0, PeerBehavior::default());
        }
        network
    }

    pub fn add_peer_with(
        &self,
        peer: PeerId,
        ip_addr: Option<Ipv4Addr>,
        relay_score: f64,
        behavior: PeerBehavior,
    ) {
        let info = PeerInfo::new(peer, ip_addr, relay_score);
        if self
            .peers
            .write()
            .insert(peer, SimPeer { info, behavior })
            .is_none()
        {
            self.order.write().push(peer);
        }
    }

    /// A candidate without routing metadata.
    pub fn add_unknown_candidate(&self, peer: PeerId) {
        self.unknown.write().push(peer);
    }

    /// A peer only found by a waiting lookup.
    pub fn add_resolvable(&self, peer: PeerId) {
        self.resolvable.write().insert(peer);
    }

    /// Known peers in insertion order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.order.read().clone()
    }

    pub fn set_behavior(&self, peer: &PeerId, behavior: PeerBehavior) {
        if let Some(entry) = self.peers.write().get_mut(peer) {
            entry.behavior = behavior;
        }
    }

    /// Chance that a join request is refused or a probe is lost.
    pub fn set_failure_rate(&self, rate: f64) {
        *self.failure_rate.write() = rate.clamp(0.0, 1.0);
    }

    /// Make `circuit` drop everything sent through it.
    pub fn fail_circuit(&self, circuit: TunnelId) {
        self.failed_circuits.write().insert(circuit);
    }

    pub fn repair_circuit(&self, circuit: &TunnelId) {
        self.failed_circuits.write().remove(circuit);
    }

    pub fn requests(&self) -> Vec<SentRequest> {
        self.requests.lock().clone()
    }

    pub fn join_requests(&self) -> Vec<SentRequest> {
        self.requests().into_iter().filter(|r| !r.is_probe()).collect()
    }

    pub fn requests_to(&self, peer: &PeerId) -> usize {
        self.requests.lock().iter().filter(|r| &r.target == peer).count()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    pub fn disconnect(&self, destination: Destination) {
        self.disconnected.write().insert(destination);
    }

    pub fn reconnect(&self, destination: &Destination) {
        self.disconnected.write().remove(destination);
    }

    pub fn set_reject_leases(&self, reject: bool) {
        *self.reject_leases.write() = reject;
    }

    pub fn published_leases(&self) -> Vec<LeaseSet> {
        self.leases.lock().clone()
    }

    fn behavior_of(&self, peer: &PeerId) -> PeerBehavior {
        self.peers
            .read()
            .get(peer)
            .map(|p| p.behavior)
            .unwrap_or(PeerBehavior::Accept {
                latency: Duration::ZERO,
            })
    }

    fn roll_failure(&self) -> bool {
        let rate = *self.failure_rate.read();
        rate > 0.0 && rand::thread_rng().gen_bool(rate)
    }
}

#[async_trait]
impl PeerLookup for SimNetwork {
    fn lookup_known(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(peer).map(|p| p.info.clone())
    }

    async fn lookup_and_wait(&self, peer: &PeerId, _timeout: Duration) -> Option<PeerInfo> {
        if let Some(info) = self.lookup_known(peer) {
            return Some(info);
        }
        self.resolvable
            .read()
            .contains(peer)
            .then(|| PeerInfo::new(*peer, None, 0.5))
    }

    fn candidate_peers(&self) -> Vec<PeerId> {
        let mut peers = self.peers();
        peers.extend(self.unknown.read().iter().copied());
        peers
    }
}

#[async_trait]
impl MessageTransport for SimNetwork {
    async fn send_through_circuit(
        &self,
        via: TunnelId,
        target: PeerId,
        payload: Vec<u8>,
        reply_via: TunnelId,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let (via_failed, reply_failed) = {
            let failed = self.failed_circuits.read();
            (failed.contains(&via), failed.contains(&reply_via))
        };
        if via_failed {
            return Err(TransportError::CircuitFailed(via.to_string()));
        }
        if reply_failed {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout);
        }

        let message = open(&target, &payload)
            .ok()
            .and_then(|bytes| TunnelMessage::decode(&bytes).ok());
        let Some(message) = message else {
            return Err(TransportError::Unreachable(format!("{target} cannot read message")));
        };

        let circuit = match &message {
            TunnelMessage::JoinRequest(request) => Some(request.circuit),
            _ => None,
        };
        self.requests.lock().push(SentRequest {
            target,
            via,
            reply_via,
            circuit,
        });
        trace!(target = %target, via = %via, "Simulated delivery");

        let behavior = self.behavior_of(&target);
        let lost = self.roll_failure();
        match behavior {
            PeerBehavior::Unreachable => {
                return Err(TransportError::Unreachable(target.to_string()));
            }
            PeerBehavior::Timeout => {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout);
            }
            PeerBehavior::Accept { latency } if latency >= timeout => {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout);
            }
            PeerBehavior::Accept { latency } => tokio::time::sleep(latency).await,
            PeerBehavior::Reject(_) | PeerBehavior::BadSignature => {}
        }

        let reply = match message {
            TunnelMessage::JoinRequest(request) => {
                let status = match behavior {
                    PeerBehavior::Reject(status) => status,
                    _ if lost => JoinStatus::Overloaded,
                    _ => JoinStatus::Accepted,
                };
                TunnelMessage::JoinReply(JoinReply {
                    nonce: request.reply_nonce,
                    status,
                })
            }
            TunnelMessage::TestProbe { nonce, .. } => {
                if lost {
                    return Err(TransportError::Timeout);
                }
                TunnelMessage::TestEcho { nonce }
            }
            _ => return Err(TransportError::Unreachable("unexpected message".to_string())),
        };

        let bytes = reply.encode();
        Ok(match behavior {
            PeerBehavior::BadSignature => seal_with(&target, &bytes, FLAG_BAD_SIGNATURE),
            _ => seal(&target, &bytes),
        })
    }
}

#[async_trait]
impl LeasePublisher for SimNetwork {
    async fn request_lease(
        &self,
        destination: &Destination,
        lease_set: LeaseSet,
        _timeout: Duration,
    ) -> Result<(), LeaseError> {
        if !self.is_connected(destination) {
            return Err(LeaseError::NotConnected);
        }
        if *self.reject_leases.read() {
            return Err(LeaseError::Rejected("simulated rejection".to_string()));
        }
        self.leases.lock().push(lease_set);
        Ok(())
    }

    fn is_connected(&self, destination: &Destination) -> bool {
        !self.disconnected.read().contains(destination)
    }
}

const TAG_LEN: usize = 8;
const FLAG_OK: u8 = 0;
const FLAG_BAD_SIGNATURE: u8 = 1;

fn tag(peer: &PeerId) -> [u8; TAG_LEN] {
    let digest = Sha256::digest(peer.to_bytes());
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

fn seal_with(peer: &PeerId, payload: &[u8], flag: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + TAG_LEN + payload.len());
    out.push(flag);
    out.extend_from_slice(&tag(peer));
    out.extend_from_slice(payload);
    out
}

fn seal(peer: &PeerId, payload: &[u8]) -> Vec<u8> {
    seal_with(peer, payload, FLAG_OK)
}

fn open(peer: &PeerId, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < 1 + TAG_LEN {
        return Err(CryptoError::Malformed);
    }
    if envelope[0] == FLAG_BAD_SIGNATURE {
        return Err(CryptoError::BadSignature);
    }
    if envelope[1..1 + TAG_LEN] != tag(peer) {
        return Err(CryptoError::WrongRecipient);
    }
    Ok(envelope[1 + TAG_LEN..].to_vec())
}

/// Envelope "encryption" that only binds a message to a peer id.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimCrypto;

impl SimCrypto {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoEngine for SimCrypto {
    fn generate_session_key(&self) -> SymmetricKey {
        SymmetricKey::random(&mut rand::thread_rng())
    }

    fn generate_signing_keys(&self) -> SigningKeys {
        let mut rng = rand::thread_rng();
        let mut public = [0u8; SIGNING_KEY_LEN];
        let mut private = [0u8; SIGNING_KEY_LEN];
        rng.fill(&mut public);
        rng.fill(&mut private);
        SigningKeys {
            public,
            private: Some(SigningPrivateKey::from_bytes(private)),
        }
    }

    fn wrap(&self, recipient: &PeerId, payload: &[u8]) -> Vec<u8> {
        seal(recipient, payload)
    }

    fn unwrap(&self, sender: &PeerId, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(sender, payload)
    }
}
