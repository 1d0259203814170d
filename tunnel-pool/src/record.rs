// Copyright (c) 2024 Botho Foundation

//! Circuit records: the hop chain and the settings shared by every hop.
//!
//! A circuit is an owned, ordered list of [`HopConfig`]s plus one shared
//! [`TunnelSettings`] value. Hops are addressed by position; the hop after
//! position `i` is simply position `i + 1`.
//!
//! ```text
//! inbound:   gateway(remote) -> ... -> local terminus
//! outbound:  local origin    -> ... -> endpoint(remote)
//! ```
//!
//! Exactly one hop is the local router (`peer == None`). Hop identities and
//! settings never change after construction; only the readiness flag and the
//! bound client destination are mutated, always by the pool that owns the
//! record.

use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    error::RecordError,
    policy::ClientCircuitPolicy,
    types::{peer_serde, Destination, SigningKeys, SymmetricKey, TunnelId, TunnelKind},
};

/// Settings shared by every hop of one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Expiration in milliseconds since the unix epoch.
    pub expiration_ms: u64,
    pub bytes_per_minute_avg: u64,
    pub bytes_per_minute_peak: u64,
    pub messages_per_minute_avg: u64,
    pub messages_per_minute_peak: u64,
    /// Number of remote hops.
    pub depth: usize,
    pub include_dummy: bool,
    pub reorder: bool,
}

impl TunnelSettings {
    pub fn from_policy(policy: &ClientCircuitPolicy, depth: usize, now_ms: u64) -> Self {
        Self {
            expiration_ms: now_ms.saturating_add(policy.duration_ms),
            bytes_per_minute_avg: policy.bytes_per_minute_avg,
            bytes_per_minute_peak: policy.bytes_per_minute_peak,
            messages_per_minute_avg: policy.messages_per_minute_avg,
            messages_per_minute_peak: policy.messages_per_minute_peak,
            depth,
            include_dummy: policy.include_dummy,
            reorder: policy.reorder,
        }
    }
}

/// Configuration of one hop.
#[derive(Debug, Serialize, Deserialize)]
pub struct HopConfig {
    /// Router at this hop; `None` is the local router.
    #[serde(with = "peer_serde::option")]
    pub peer: Option<PeerId>,

    /// Identifier this hop receives the circuit's messages on.
    pub receive_id: u32,

    /// Per-hop key for reply and housekeeping traffic.
    pub housekeeping_key: SymmetricKey,

    /// Circuit-wide layer key, only held by the gateway and endpoint.
    pub encryption_key: Option<SymmetricKey>,

    /// Circuit signing material, only held by the gateway and endpoint.
    pub signing: Option<SigningKeys>,
}

impl HopConfig {
    #[inline]
    pub fn is_local(&self) -> bool {
        self.peer.is_none()
    }
}

/// One circuit as tracked by the pool.
///
/// Cloning is cheap: hops and settings sit behind reference-counted handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    id: TunnelId,
    hops: Arc<Vec<HopConfig>>,
    settings: Arc<TunnelSettings>,
    ready: bool,
    created_ms: u64,
    destination: Option<Destination>,
}

impl TunnelRecord {
    /// Create an unbuilt (not ready) record.
    pub fn new(
        id: TunnelId,
        hops: Vec<HopConfig>,
        settings: TunnelSettings,
        created_ms: u64,
        destination: Option<Destination>,
    ) -> Self {
        Self {
            id,
            hops: Arc::new(hops),
            settings: Arc::new(settings),
            ready: false,
            created_ms,
            destination,
        }
    }

    #[inline]
    pub fn id(&self) -> TunnelId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> TunnelKind {
        self.id.kind()
    }

    #[inline]
    pub fn hops(&self) -> &[HopConfig] {
        &self.hops
    }

    /// The hop following `index`, if any.
    pub fn next_hop(&self, index: usize) -> Option<&HopConfig> {
        self.hops.get(index + 1)
    }

    #[inline]
    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    #[inline]
    pub fn expiration_ms(&self) -> u64 {
        self.settings.expiration_ms
    }

    #[inline]
    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    #[inline]
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub(crate) fn set_destination(&mut self, destination: Option<Destination>) {
        self.destination = destination;
    }

    /// Number of hops that are not the local router.
    pub fn remote_hops(&self) -> usize {
        self.hops.iter().filter(|h| !h.is_local()).count()
    }

    pub fn is_zero_hop(&self) -> bool {
        self.remote_hops() == 0
    }

    /// Position of the local router in the chain.
    pub fn local_index(&self) -> Option<usize> {
        self.hops.iter().position(HopConfig::is_local)
    }

    /// First hop of the chain (`None` if it is the local router).
    pub fn gateway(&self) -> Option<&PeerId> {
        self.hops.first().and_then(|h| h.peer.as_ref())
    }

    /// Last hop of the chain (`None` if it is the local router).
    pub fn endpoint(&self) -> Option<&PeerId> {
        self.hops.last().and_then(|h| h.peer.as_ref())
    }

    /// Remote peers in chain order.
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.hops.iter().filter_map(|h| h.peer.as_ref())
    }

    pub fn contains_peer(&self, peer: &PeerId) -> bool {
        self.peers().any(|p| p == peer)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.settings.expiration_ms
    }

    /// Remaining lifetime, zero if already expired.
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.settings.expiration_ms.saturating_sub(now_ms)
    }

    /// Check the structural invariants of the chain.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.hops.is_empty() {
            return Err(RecordError::EmptyChain);
        }

        let local: Vec<usize> = self
            .hops
            .iter()
            .enumerate()
            .filter(|(_, h)| h.is_local())
            .map(|(i, _)| i)
            .collect();
        if local.len() != 1 {
            return Err(RecordError::LocalHopCount(local.len()));
        }
        let local_index = local[0];
        let last = self.hops.len() - 1;

        let expected = match self.kind() {
            TunnelKind::Inbound => Some(last),
            TunnelKind::Outbound => Some(0),
            TunnelKind::Participant | TunnelKind::Unspecified => None,
        };
        let Some(expected) = expected else {
            return Ok(());
        };
        if local_index != expected {
            return Err(RecordError::LocalHopPosition {
                kind: self.kind(),
                index: local_index,
            });
        }

        if self.settings.depth != last {
            return Err(RecordError::DepthMismatch {
                depth: self.settings.depth,
                hops: self.hops.len(),
            });
        }

        for index in [0, last] {
            let hop = &self.hops[index];
            if hop.encryption_key.is_none() {
                return Err(RecordError::MissingKey {
                    index,
                    key: "encryption",
                });
            }
            if hop.signing.is_none() {
                return Err(RecordError::MissingKey {
                    index,
                    key: "signing",
                });
            }
        }
        if self.hops[local_index]
            .signing
            .as_ref()
            .and_then(|s| s.private.as_ref())
            .is_none()
        {
            return Err(RecordError::MissingKey {
                index: local_index,
                key: "signing private",
            });
        }

        Ok(())
    }
}
