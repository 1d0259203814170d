// Copyright (c) 2024 Botho Foundation

//! Hop selection for new circuits.
//!
//! Candidates come from the peer lookup collaborator and are only used if the
//! router already holds routing metadata for them; unknown peers are dropped
//! silently. The rest is weighted random selection:
//!
//! - weight = advertised relay score x local reliability weight
//! - no two hops of one circuit in the same /16 subnet, when possible
//! - banned and below-threshold peers are never picked
//!
//! Selection is non-deterministic so an observer cannot predict paths.

use libp2p::PeerId;
use parking_lot::Mutex;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::trace;

use crate::{reputation::ReputationManager, traits::PeerLookup};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SelectionError {
    #[error("insufficient peers: need {needed}, have {available}")]
    InsufficientPeers { needed: usize, available: usize },

    #[error("insufficient diversity: need {needed} unique subnets, found {found}")]
    InsufficientDiversity { needed: usize, found: usize },

    #[error("no peers meet minimum relay score {min_score}")]
    NoQualifiedPeers { min_score: f64 },
}

/// Peer selection tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Minimum advertised relay score (0.0 - 1.0).
    pub min_relay_score: f64,

    /// Maximum weighted draws per selection.
    pub max_attempts: usize,

    /// Treat peers without a known address as being in a unique subnet.
    pub allow_unknown_ip: bool,

    /// Fail instead of reusing a subnet when diversity cannot be met.
    pub strict_diversity: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_relay_score: 0.2,
            max_attempts: 100,
            allow_unknown_ip: true,
            strict_diversity: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    peer_id: PeerId,
    subnet: Option<u16>,
    weight: f64,
}

/// Chooses remote peers for the hops of new circuits.
pub struct PeerSelector {
    config: SelectionConfig,
    lookup: Arc<dyn PeerLookup>,
    reputation: Arc<Mutex<ReputationManager>>,
}

impl PeerSelector {
    pub fn new(
        config: SelectionConfig,
        lookup: Arc<dyn PeerLookup>,
        reputation: Arc<Mutex<ReputationManager>>,
    ) -> Self {
        Self {
            config,
            lookup,
            reputation,
        }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Known, unbanned peers above the score threshold, minus `exclude`.
    fn qualified(&self, exclude: &HashSet<PeerId>) -> Result<Vec<Candidate>, SelectionError> {
        let reputation = self.reputation.lock();
        let mut known = 0usize;
        let candidates: Vec<Candidate> = self
            .lookup
            .candidate_peers()
            .into_iter()
            .filter(|peer| !exclude.contains(peer))
            .filter_map(|peer| {
                let info = self.lookup.lookup_known(&peer);
                if info.is_none() {
                    trace!(peer = %peer, "Dropping candidate without routing info");
                }
                info
            })
            .inspect(|_| known += 1)
            // NaN scores fall through the threshold below
            .map(|mut info| {
                info.relay_score = info.relay_score.clamp(0.0, 1.0);
                info
            })
            .filter(|info| info.relay_score >= self.config.min_relay_score)
            .filter(|info| {
                let banned = reputation.is_banned(&info.peer_id);
                if banned {
                    trace!(peer = %info.peer_id, "Skipping banned peer");
                }
                !banned
            })
            .map(|info| Candidate {
                peer_id: info.peer_id,
                subnet: info.subnet_prefix(),
                weight: info.relay_score * reputation.weight(&info.peer_id),
            })
            .collect();

        if candidates.is_empty() && known > 0 {
            return Err(SelectionError::NoQualifiedPeers {
                min_score: self.config.min_relay_score,
            });
        }
        Ok(candidates)
    }

    /// Select `count` distinct, subnet-diverse hops for one circuit.
    pub fn select_hops(
        &self,
        count: usize,
        exclude: &HashSet<PeerId>,
    ) -> Result<Vec<PeerId>, SelectionError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let qualified = self.qualified(exclude)?;
        if qualified.len() < count {
            return Err(SelectionError::InsufficientPeers {
                needed: count,
                available: qualified.len(),
            });
        }

        let mut rng = rand::thread_rng();
        let mut selected = Vec::with_capacity(count);
        let mut used_subnets: HashSet<u16> = HashSet::new();
        let mut used_peers: HashSet<PeerId> = HashSet::new();
        let mut attempts = 0;

        while selected.len() < count && attempts < self.config.max_attempts {
            attempts += 1;

            let candidates: Vec<&Candidate> = qualified
                .iter()
                .filter(|c| !used_peers.contains(&c.peer_id))
                .filter(|c| match c.subnet {
                    Some(subnet) => !used_subnets.contains(&subnet),
                    None => self.config.allow_unknown_ip,
                })
                .collect();

            let Some(pick) = weighted_random_select(&candidates, &mut rng) else {
                break;
            };
            if let Some(subnet) = pick.subnet {
                used_subnets.insert(subnet);
            }
            used_peers.insert(pick.peer_id);
            selected.push(pick.peer_id);
        }

        if selected.len() < count {
            if self.config.strict_diversity {
                return Err(SelectionError::InsufficientDiversity {
                    needed: count,
                    found: selected.len(),
                });
            }

            let mut rest: Vec<&Candidate> = qualified
                .iter()
                .filter(|c| !used_peers.contains(&c.peer_id))
                .collect();
            rest.shuffle(&mut rng);
            for candidate in rest.into_iter().take(count - selected.len()) {
                trace!(peer = %candidate.peer_id, "Filling hop without subnet diversity");
                selected.push(candidate.peer_id);
            }
        }

        Ok(selected)
    }

    /// Up to `count` distinct peers drawn by weight, for batch builds that
    /// partition one selection pass over several circuits.
    pub fn select_up_to(
        &self,
        count: usize,
        exclude: &HashSet<PeerId>,
    ) -> Result<Vec<PeerId>, SelectionError> {
        let mut remaining = self.qualified(exclude)?;
        let mut rng = rand::thread_rng();
        let mut selected = Vec::with_capacity(count.min(remaining.len()));

        while selected.len() < count && !remaining.is_empty() {
            let refs: Vec<&Candidate> = remaining.iter().collect();
            let Some(pick) = weighted_random_select(&refs, &mut rng).map(|c| c.peer_id) else {
                break;
            };
            remaining.retain(|c| c.peer_id != pick);
            selected.push(pick);
        }

        Ok(selected)
    }
}

/// Pick one candidate with probability proportional to its weight.
fn weighted_random_select<'a, R: Rng>(
    candidates: &[&'a Candidate],
    rng: &mut R,
) -> Option<&'a Candidate> {
    if candidates.is_empty() {
        return None;
    }

    let total_weight: f64 = candidates.iter().map(|c| c.weight).sum();
    if total_weight <= 0.0 {
        return candidates.choose(rng).copied();
    }

    let mut value = rng.gen_range(0.0..total_weight);
    for candidate in candidates {
        value -= candidate.weight;
        if value <= 0.0 {
            return Some(candidate);
        }
    }

    candidates.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reputation::HopOutcome,
        sim::{PeerBehavior, SimNetwork},
    };
    use std::{net::Ipv4Addr, time::Duration};

    fn selector(network: &Arc<SimNetwork>, config: SelectionConfig) -> PeerSelector {
        PeerSelector::new(
            config,
            network.clone(),
            Arc::new(Mutex::new(ReputationManager::new())),
        )
    }

    #[test]
    fn test_selects_distinct_diverse_hops() {
        let network = SimNetwork::with_peers(5);
        let selector = selector(&network, SelectionConfig::default());

        let hops = selector.select_hops(3, &HashSet::new()).unwrap();
        assert_eq!(hops.len(), 3);
        assert_eq!(hops.iter().collect::<HashSet<_>>().len(), 3);

        let subnets: HashSet<_> = hops
            .iter()
            .map(|p| network.lookup_known(p).unwrap().subnet_prefix())
            .collect();
        assert_eq!(subnets.len(), 3);
    }

    #[test]
    fn test_unknown_peers_are_dropped() {
        let network = SimNetwork::with_peers(2);
        network.add_unknown_candidate(PeerId::random());
        let selector = selector(&network, SelectionConfig::default());

        let result = selector.select_hops(3, &HashSet::new());
        assert_eq!(
            result,
            Err(SelectionError::InsufficientPeers {
                needed: 3,
                available: 2
            })
        );
    }

    #[test]
    fn test_excluded_peers_are_not_selected() {
        let network = SimNetwork::with_peers(3);
        let selector = selector(&network, SelectionConfig::default());
        let excluded: HashSet<PeerId> = network.peers().into_iter().take(1).collect();

        let hops = selector.select_hops(2, &excluded).unwrap();
        assert!(hops.iter().all(|p| !excluded.contains(p)));
    }

    #[test]
    fn test_banned_peers_are_skipped() {
        let network = SimNetwork::with_peers(3);
        let reputation = Arc::new(Mutex::new(ReputationManager::new()));
        let banned = network.peers()[0];
        for _ in 0..4 {
            reputation
                .lock()
                .record(&banned, HopOutcome::TimedOut, Duration::ZERO, 0);
        }
        let selector = PeerSelector::new(SelectionConfig::default(), network.clone(), reputation);

        for _ in 0..20 {
            let hops = selector.select_hops(2, &HashSet::new()).unwrap();
            assert!(!hops.contains(&banned));
        }
    }

    #[test]
    fn test_low_score_peers_rejected() {
        let network = SimNetwork::new();
        network.add_peer_with(
            PeerId::random(),
            Some(Ipv4Addr::new(10, 1, 0, 1)),
            0.05,
            PeerBehavior::default(),
        );
        let selector = selector(&network, SelectionConfig::default());

        assert!(matches!(
            selector.select_hops(1, &HashSet::new()),
            Err(SelectionError::NoQualifiedPeers { .. })
        ));
    }

    #[test]
    fn test_same_subnet_strict_vs_relaxed() {
        let network = SimNetwork::new();
        for i in 0..3 {
            network.add_peer_with(
                PeerId::random(),
                Some(Ipv4Addr::new(10, 1, 0, i + 1)),
                1.0,
                PeerBehavior::default(),
            );
        }

        let strict = selector(
            &network,
            SelectionConfig {
                strict_diversity: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            strict.select_hops(2, &HashSet::new()),
            Err(SelectionError::InsufficientDiversity { needed: 2, found: 1 })
        ));

        let relaxed = selector(&network, SelectionConfig::default());
        assert_eq!(relaxed.select_hops(2, &HashSet::new()).unwrap().len(), 2);
    }

    #[test]
    fn test_out_of_range_scores_are_clamped() {
        let network = SimNetwork::with_peers(2);
        let wild = PeerId::random();
        let broken = PeerId::random();
        network.add_peer_with(
            wild,
            Some(Ipv4Addr::new(172, 16, 0, 1)),
            f64::INFINITY,
            PeerBehavior::default(),
        );
        network.add_peer_with(
            broken,
            Some(Ipv4Addr::new(172, 17, 0, 1)),
            f64::NAN,
            PeerBehavior::default(),
        );
        let selector = selector(&network, SelectionConfig::default());

        for _ in 0..50 {
            let peers = selector.select_up_to(4, &HashSet::new()).unwrap();
            assert_eq!(peers.len(), 3);
            assert!(peers.contains(&wild));
            assert!(!peers.contains(&broken));
        }
    }

    #[test]
    fn test_select_up_to_caps_at_available() {
        let network = SimNetwork::with_peers(4);
        let selector = selector(&network, SelectionConfig::default());

        let peers = selector.select_up_to(10, &HashSet::new()).unwrap();
        assert_eq!(peers.len(), 4);
        assert_eq!(peers.iter().collect::<HashSet<_>>().len(), 4);
    }

    #[test]
    fn test_weighted_selection_prefers_high_weight() {
        let heavy = Candidate {
            peer_id: PeerId::random(),
            subnet: None,
            weight: 100.0,
        };
        let light = Candidate {
            peer_id: PeerId::random(),
            subnet: None,
            weight: 1.0,
        };
        let candidates = vec![&heavy, &light];
        let mut rng = rand::thread_rng();

        let heavy_picks = (0..1000)
            .filter(|_| {
                weighted_random_select(&candidates, &mut rng).unwrap().peer_id == heavy.peer_id
            })
            .count();
        assert!(heavy_picks > 900);
    }
}
