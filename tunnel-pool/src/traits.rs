// Copyright (c) 2024 Botho Foundation

//! Seams to the rest of the router.
//!
//! The tunnel subsystem never touches the network database, the transport or
//! key material directly. Everything it needs from outside goes through the
//! traits below, implemented by the router at start-up (and by
//! [`crate::sim`] in tests).

use async_trait::async_trait;
use libp2p::PeerId;
use std::{net::Ipv4Addr, time::Duration};

use crate::{
    error::{CryptoError, LeaseError, TransportError},
    types::{Destination, SigningKeys, SymmetricKey, TunnelId},
};

/// Routing metadata known about a remote router.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: PeerId,

    /// Used for /16 subnet diversity; unknown addresses count as unique.
    pub ip_addr: Option<Ipv4Addr>,

    /// Advertised relay capacity in `0.0..=1.0`.
    pub relay_score: f64,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, ip_addr: Option<Ipv4Addr>, relay_score: f64) -> Self {
        Self {
            peer_id,
            ip_addr,
            relay_score,
        }
    }

    /// First two octets of the address, packed into a `u16`.
    pub fn subnet_prefix(&self) -> Option<u16> {
        self.ip_addr.map(|ip| {
            let octets = ip.octets();
            ((octets[0] as u16) << 8) | (octets[1] as u16)
        })
    }
}

/// Read access to the network database.
#[async_trait]
pub trait PeerLookup: Send + Sync {
    /// Local-only lookup; never blocks.
    fn lookup_known(&self, peer: &PeerId) -> Option<PeerInfo>;

    /// Lookup that may query the network for up to `timeout`.
    async fn lookup_and_wait(&self, peer: &PeerId, timeout: Duration) -> Option<PeerInfo>;

    /// Every router currently considered for hop selection.
    fn candidate_peers(&self) -> Vec<PeerId>;
}

/// Delivery of handshake and test traffic through existing circuits.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send `payload` out through circuit `via` to `target` and wait for the
    /// reply to come back on `reply_via`.
    ///
    /// Resolves exactly once: with the reply bytes, or with the reason no
    /// reply arrived before `timeout`.
    async fn send_through_circuit(
        &self,
        via: TunnelId,
        target: PeerId,
        payload: Vec<u8>,
        reply_via: TunnelId,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Key generation and layered wrapping.
///
/// Infallible apart from [`CryptoEngine::unwrap`], whose failure is treated
/// as a rejected hop.
pub trait CryptoEngine: Send + Sync {
    fn generate_session_key(&self) -> SymmetricKey;

    /// A fresh keypair; the private half is always present.
    fn generate_signing_keys(&self) -> SigningKeys;

    /// Wrap `payload` so only `recipient` can read it.
    fn wrap(&self, recipient: &PeerId, payload: &[u8]) -> Vec<u8>;

    /// Open a reply that claims to come from `sender`.
    fn unwrap(&self, sender: &PeerId, payload: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// One inbound circuit advertised in a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub tunnel: TunnelId,
    /// Entry router; `None` for a zero-hop circuit.
    pub gateway: Option<PeerId>,
    pub gateway_receive_id: u32,
    pub end_ms: u64,
}

/// Proposed set of leases for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSet {
    pub destination: Destination,
    pub leases: Vec<Lease>,
    pub created_ms: u64,
}

impl LeaseSet {
    /// Latest expiration among the leases.
    pub fn max_expiration_ms(&self) -> u64 {
        self.leases.iter().map(|l| l.end_ms).max().unwrap_or(0)
    }
}

/// The client side that signs and publishes leases.
#[async_trait]
pub trait LeasePublisher: Send + Sync {
    async fn request_lease(
        &self,
        destination: &Destination,
        lease_set: LeaseSet,
        timeout: Duration,
    ) -> Result<(), LeaseError>;

    /// Whether the client behind `destination` is still attached.
    fn is_connected(&self, destination: &Destination) -> bool;
}
