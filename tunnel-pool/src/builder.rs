// Copyright (c) 2024 Botho Foundation

//! Construction of unbuilt circuit records.
//!
//! The builder picks peers, generates key material and lays out the hop
//! chain. It never talks to the network; the handshake protocol does that
//! afterwards.
//!
//! Key layout of one circuit:
//!
//! | hop                 | housekeeping | layer key | signing          |
//! |---------------------|--------------|-----------|------------------|
//! | gateway / endpoint  | own          | shared    | shared (public)  |
//! | local edge          | own          | shared    | shared (+private)|
//! | interior            | own          | -         | -                |

use libp2p::PeerId;
use rand::Rng;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, trace, warn};

use crate::{
    error::BuildError,
    policy::ClientCircuitPolicy,
    record::{HopConfig, TunnelRecord, TunnelSettings},
    selection::{PeerSelector, SelectionError},
    traits::CryptoEngine,
    types::{Destination, TunnelId, TunnelKind},
};

/// Produces [`TunnelRecord`]s ready to be handed to the handshake.
pub struct TunnelBuilder {
    selector: PeerSelector,
    crypto: Arc<dyn CryptoEngine>,
    zero_hop_probability: f64,
}

impl TunnelBuilder {
    pub fn new(
        selector: PeerSelector,
        crypto: Arc<dyn CryptoEngine>,
        zero_hop_probability: f64,
    ) -> Self {
        Self {
            selector,
            crypto,
            zero_hop_probability: zero_hop_probability.clamp(0.0, 1.0),
        }
    }

    pub fn selector(&self) -> &PeerSelector {
        &self.selector
    }

    pub fn build_inbound(
        &self,
        destination: Option<Destination>,
        policy: &ClientCircuitPolicy,
        force_local: bool,
        now_ms: u64,
    ) -> Result<TunnelRecord, BuildError> {
        self.build(TunnelKind::Inbound, destination, policy, force_local, now_ms)
    }

    pub fn build_outbound(
        &self,
        destination: Option<Destination>,
        policy: &ClientCircuitPolicy,
        force_local: bool,
        now_ms: u64,
    ) -> Result<TunnelRecord, BuildError> {
        self.build(TunnelKind::Outbound, destination, policy, force_local, now_ms)
    }

    /// Build one circuit of `kind`.
    ///
    /// Falls back to a zero-hop circuit when `force_local` is set, on the
    /// configured random chance, or when peer selection fails; a strict
    /// policy turns the selection failure into an error instead.
    pub fn build(
        &self,
        kind: TunnelKind,
        destination: Option<Destination>,
        policy: &ClientCircuitPolicy,
        force_local: bool,
        now_ms: u64,
    ) -> Result<TunnelRecord, BuildError> {
        let depth = depth_for(kind, policy);
        if force_local || depth == 0 {
            return Ok(self.build_zero_hop(kind, destination, policy, now_ms));
        }

        let strict = policy.enforce_strict_minimum_length;
        if !strict && rand::thread_rng().gen_bool(self.zero_hop_probability) {
            trace!(kind = %kind, "Building zero-hop circuit by chance");
            return Ok(self.build_zero_hop(kind, destination, policy, now_ms));
        }

        match self.selector.select_hops(depth, &HashSet::new()) {
            Ok(peers) => Ok(self.assemble(kind, &peers, destination, policy, now_ms)),
            Err(err) if strict => {
                warn!(kind = %kind, depth, error = %err, "Peer selection failed for strict policy");
                Err(selection_to_build_error(err, depth))
            }
            Err(err) => {
                debug!(kind = %kind, depth, error = %err, "Peer selection failed, using zero-hop");
                Ok(self.build_zero_hop(kind, destination, policy, now_ms))
            }
        }
    }

    /// A circuit that consists of the local router only.
    pub fn build_zero_hop(
        &self,
        kind: TunnelKind,
        destination: Option<Destination>,
        policy: &ClientCircuitPolicy,
        now_ms: u64,
    ) -> TunnelRecord {
        self.assemble(kind, &[], destination, policy, now_ms)
    }

    /// Build `count` circuits from a single selection pass.
    ///
    /// Selected peers are dealt to the chains round-robin starting from a
    /// random offset. A chain never holds the same peer twice; chains that
    /// cannot be filled become zero-hop circuits, or are dropped under a
    /// strict policy.
    pub fn build_batch(
        &self,
        kind: TunnelKind,
        count: usize,
        destination: Option<Destination>,
        policy: &ClientCircuitPolicy,
        now_ms: u64,
    ) -> Vec<TunnelRecord> {
        let depth = depth_for(kind, policy);
        let strict = policy.enforce_strict_minimum_length;
        if depth == 0 {
            return (0..count)
                .map(|_| self.build_zero_hop(kind, destination, policy, now_ms))
                .collect();
        }

        let peers = match self.selector.select_up_to(count * depth, &HashSet::new()) {
            Ok(peers) => peers,
            Err(err) => {
                debug!(kind = %kind, error = %err, "Batch selection failed");
                Vec::new()
            }
        };

        let mut rng = rand::thread_rng();
        let offset = if peers.is_empty() {
            0
        } else {
            rng.gen_range(0..peers.len())
        };

        let mut records = Vec::with_capacity(count);
        for chain in 0..count {
            match deal_chain(&peers, offset, chain, count, depth) {
                Some(hops) => records.push(self.assemble(kind, &hops, destination, policy, now_ms)),
                None if strict => {
                    warn!(kind = %kind, chain, "Not enough peers for strict batch circuit");
                }
                None => records.push(self.build_zero_hop(kind, destination, policy, now_ms)),
            }
        }
        records
    }

    /// Lay out the hop chain for `peers`, listed gateway-first for inbound
    /// and first-after-origin for outbound.
    fn assemble(
        &self,
        kind: TunnelKind,
        peers: &[PeerId],
        destination: Option<Destination>,
        policy: &ClientCircuitPolicy,
        now_ms: u64,
    ) -> TunnelRecord {
        let mut rng = rand::thread_rng();
        let layer_key = self.crypto.generate_session_key();
        let signing = self.crypto.generate_signing_keys();

        let chain: Vec<Option<PeerId>> = match kind {
            TunnelKind::Inbound => peers.iter().copied().map(Some).chain([None]).collect(),
            _ => [None].into_iter().chain(peers.iter().copied().map(Some)).collect(),
        };
        let last = chain.len() - 1;

        let hops = chain
            .into_iter()
            .enumerate()
            .map(|(index, peer)| {
                let edge = index == 0 || index == last;
                HopConfig {
                    peer,
                    receive_id: rng.gen_range(1..=u32::MAX),
                    housekeeping_key: self.crypto.generate_session_key(),
                    encryption_key: edge.then(|| layer_key.duplicate()),
                    signing: edge.then(|| {
                        if peer.is_none() {
                            signing.duplicate()
                        } else {
                            signing.public_only()
                        }
                    }),
                }
            })
            .collect();

        let settings = TunnelSettings::from_policy(policy, peers.len(), now_ms);
        let id = TunnelId::random(kind, &mut rng);
        trace!(tunnel = %id, hops = peers.len(), "Assembled circuit");
        TunnelRecord::new(id, hops, settings, now_ms, destination)
    }
}

fn depth_for(kind: TunnelKind, policy: &ClientCircuitPolicy) -> usize {
    match kind {
        TunnelKind::Inbound => policy.inbound_depth,
        _ => policy.outbound_depth,
    }
}

fn selection_to_build_error(err: SelectionError, depth: usize) -> BuildError {
    match err {
        SelectionError::InsufficientPeers { needed, available } => {
            BuildError::InsufficientPeers { needed, available }
        }
        SelectionError::InsufficientDiversity { needed, found } => BuildError::InsufficientPeers {
            needed,
            available: found,
        },
        SelectionError::NoQualifiedPeers { .. } => BuildError::InsufficientPeers {
            needed: depth,
            available: 0,
        },
    }
}

/// Peers for chain `chain` of `count`, or `None` if it cannot be filled with
/// `depth` distinct peers.
fn deal_chain(
    peers: &[PeerId],
    offset: usize,
    chain: usize,
    count: usize,
    depth: usize,
) -> Option<Vec<PeerId>> {
    if peers.len() < depth {
        return None;
    }

    let mut hops: Vec<PeerId> = Vec::with_capacity(depth);
    for slot in 0..depth {
        let start = offset + slot * count + chain;
        let pick = (0..peers.len())
            .map(|step| peers[(start + step) % peers.len()])
            .find(|peer| !hops.contains(peer))?;
        hops.push(pick);
    }
    Some(hops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reputation::ReputationManager,
        selection::SelectionConfig,
        sim::{SimCrypto, SimNetwork},
    };
    use parking_lot::Mutex;

    fn builder(peers: usize, zero_hop_probability: f64) -> (Arc<SimNetwork>, TunnelBuilder) {
        let network = SimNetwork::with_peers(peers);
        let selector = PeerSelector::new(
            SelectionConfig::default(),
            network.clone(),
            Arc::new(Mutex::new(ReputationManager::new())),
        );
        let builder = TunnelBuilder::new(selector, Arc::new(SimCrypto::new()), zero_hop_probability);
        (network, builder)
    }

    fn policy(depth: usize) -> ClientCircuitPolicy {
        ClientCircuitPolicy {
            inbound_depth: depth,
            outbound_depth: depth,
            ..Default::default()
        }
    }

    #[test]
    fn test_inbound_layout_and_keys() {
        let (_, builder) = builder(5, 0.0);
        let record = builder.build_inbound(None, &policy(2), false, 1_000).unwrap();

        assert_eq!(record.kind(), TunnelKind::Inbound);
        assert_eq!(record.hops().len(), 3);
        assert_eq!(record.remote_hops(), 2);
        assert_eq!(record.local_index(), Some(2));
        assert!(!record.is_ready());
        assert!(record.validate().is_ok());

        let hops = record.hops();
        // Interior hop carries no shared material
        assert!(hops[1].encryption_key.is_none());
        assert!(hops[1].signing.is_none());
        // Remote gateway never sees the private signing key
        assert!(hops[0].signing.as_ref().unwrap().private.is_none());
        assert!(hops[2].signing.as_ref().unwrap().private.is_some());
        assert_eq!(
            hops[0].encryption_key.as_ref().unwrap().as_bytes(),
            hops[2].encryption_key.as_ref().unwrap().as_bytes()
        );
        assert_eq!(
            hops[0].signing.as_ref().unwrap().public,
            hops[2].signing.as_ref().unwrap().public
        );
        assert_eq!(record.expiration_ms(), 1_000 + policy(2).duration_ms);
    }

    #[test]
    fn test_outbound_layout() {
        let (_, builder) = builder(5, 0.0);
        let record = builder.build_outbound(None, &policy(3), false, 0).unwrap();

        assert_eq!(record.local_index(), Some(0));
        assert_eq!(record.remote_hops(), 3);
        assert!(record.endpoint().is_some());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_force_local_builds_zero_hop() {
        let (_, builder) = builder(5, 0.0);
        let dest = Destination::random(&mut rand::thread_rng());
        let record = builder.build_inbound(Some(dest), &policy(2), true, 0).unwrap();

        assert!(record.is_zero_hop());
        assert_eq!(record.destination(), Some(&dest));
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_zero_hop_probability_one() {
        let (_, builder) = builder(5, 1.0);
        let record = builder.build_outbound(None, &policy(2), false, 0).unwrap();
        assert!(record.is_zero_hop());
    }

    #[test]
    fn test_selection_failure_falls_back_unless_strict() {
        let (_, builder) = builder(1, 0.0);

        let relaxed = builder.build_inbound(None, &policy(2), false, 0).unwrap();
        assert!(relaxed.is_zero_hop());

        let strict = ClientCircuitPolicy {
            enforce_strict_minimum_length: true,
            ..policy(2)
        };
        assert_eq!(
            builder.build_inbound(None, &strict, false, 0).unwrap_err(),
            BuildError::InsufficientPeers {
                needed: 2,
                available: 1
            }
        );
    }

    #[test]
    fn test_batch_chains_have_distinct_peers() {
        let (_, builder) = builder(4, 0.0);
        let records = builder.build_batch(TunnelKind::Inbound, 3, None, &policy(3), 0);

        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.remote_hops(), 3);
            let peers: HashSet<_> = record.peers().collect();
            assert_eq!(peers.len(), 3);
            assert!(record.validate().is_ok());
        }
    }

    #[test]
    fn test_batch_without_peers() {
        let (_, builder) = builder(1, 0.0);
        let relaxed = builder.build_batch(TunnelKind::Outbound, 2, None, &policy(2), 0);
        assert_eq!(relaxed.len(), 2);
        assert!(relaxed.iter().all(TunnelRecord::is_zero_hop));

        let strict = ClientCircuitPolicy {
            enforce_strict_minimum_length: true,
            ..policy(2)
        };
        assert!(builder
            .build_batch(TunnelKind::Outbound, 2, None, &strict, 0)
            .is_empty());
    }

    #[test]
    fn test_deal_chain_round_robin() {
        let peers: Vec<PeerId> = (0..6).map(|_| PeerId::random()).collect();

        let first = deal_chain(&peers, 0, 0, 3, 2).unwrap();
        let second = deal_chain(&peers, 0, 1, 3, 2).unwrap();
        assert_eq!(first, vec![peers[0], peers[3]]);
        assert_eq!(second, vec![peers[1], peers[4]]);

        // Wraps and skips duplicates within a chain
        let wrapped = deal_chain(&peers[..2], 1, 0, 2, 2).unwrap();
        assert_eq!(wrapped, vec![peers[1], peers[0]]);
        assert!(deal_chain(&peers[..1], 0, 0, 1, 2).is_none());
    }
}
