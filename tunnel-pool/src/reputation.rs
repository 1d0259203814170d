// Copyright (c) 2024 Botho Foundation

//! Hop reliability scoring.
//!
//! Every join reply, handshake timeout and failed circuit test lands here.
//! Latency is tracked as an exponential moving average; failures push the
//! average up and lower the success rate. Peer selection reads the resulting
//! score and skips banned peers.

use libp2p::PeerId;
use std::{collections::HashMap, time::Duration};

/// Weight of the newest sample in the moving average.
const EMA_ALPHA: f64 = 0.3;

/// Latency charged for a failure.
const FAILURE_LATENCY_MS: u64 = 30_000;

/// Samples needed before the score stops being neutral.
const MIN_SAMPLES: u32 = 3;

/// Score of a peer we know nothing about.
const NEUTRAL_SCORE: f64 = 500.0;

/// What happened the last time we used a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopOutcome {
    /// Accepted a join request.
    Accepted,
    /// Explicitly refused a join request.
    Rejected,
    /// Did not answer in time.
    TimedOut,
    /// Part of a circuit that later failed a test or was reported dead.
    CircuitFailed,
}

/// Reliability record of one peer.
#[derive(Debug, Clone, Default)]
pub struct PeerReliability {
    pub avg_latency_ms: f64,
    pub accepts: u32,
    pub rejects: u32,
    pub timeouts: u32,
    pub circuit_failures: u32,
    /// When the peer last accepted a join request.
    pub last_accept_ms: Option<u64>,
}

impl PeerReliability {
    pub fn record_accept(&mut self, latency: Duration, now_ms: u64) {
        self.update_latency(latency.as_millis() as f64);
        self.accepts += 1;
        self.last_accept_ms = Some(now_ms);
    }

    pub fn record_failure(&mut self, outcome: HopOutcome) {
        self.update_latency(FAILURE_LATENCY_MS as f64);
        match outcome {
            HopOutcome::Rejected => self.rejects += 1,
            HopOutcome::TimedOut => self.timeouts += 1,
            HopOutcome::CircuitFailed => self.circuit_failures += 1,
            HopOutcome::Accepted => {}
        }
    }

    fn update_latency(&mut self, latency_ms: f64) {
        if self.samples() == 0 {
            self.avg_latency_ms = latency_ms;
        } else {
            self.avg_latency_ms = EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * self.avg_latency_ms;
        }
    }

    pub fn failures(&self) -> u32 {
        self.rejects + self.timeouts + self.circuit_failures
    }

    pub fn samples(&self) -> u32 {
        self.accepts + self.failures()
    }

    pub fn success_rate(&self) -> f64 {
        if self.samples() == 0 {
            1.0
        } else {
            self.accepts as f64 / self.samples() as f64
        }
    }

    /// Lower is better.
    pub fn score(&self) -> f64 {
        let base = if self.samples() < MIN_SAMPLES {
            NEUTRAL_SCORE
        } else {
            self.avg_latency_ms
        };
        base * (2.0 - self.success_rate())
    }

    pub fn is_banned(&self) -> bool {
        self.samples() >= MIN_SAMPLES && self.success_rate() < 0.25
    }
}

/// Reliability records of every peer we have routed through.
#[derive(Debug, Default)]
pub struct ReputationManager {
    peers: HashMap<PeerId, PeerReliability>,
}

impl ReputationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerReliability> {
        self.peers.get(peer)
    }

    pub fn record(&mut self, peer: &PeerId, outcome: HopOutcome, latency: Duration, now_ms: u64) {
        let entry = self.peers.entry(*peer).or_default();
        match outcome {
            HopOutcome::Accepted => entry.record_accept(latency, now_ms),
            _ => entry.record_failure(outcome),
        }
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).map(|r| r.is_banned()).unwrap_or(false)
    }

    /// Score used to weight selection; unknown peers are neutral.
    pub fn score(&self, peer: &PeerId) -> f64 {
        self.peers.get(peer).map(|r| r.score()).unwrap_or(NEUTRAL_SCORE)
    }

    /// Selection weight multiplier in `(0.0, 1.0]`, higher for faster and
    /// more reliable peers.
    pub fn weight(&self, peer: &PeerId) -> f64 {
        (NEUTRAL_SCORE / self.score(peer).max(1.0)).min(1.0)
    }

    /// `(peer, score, accepts, failures)` for every tracked peer.
    pub fn all_scores(&self) -> Vec<(PeerId, f64, u32, u32)> {
        self.peers
            .iter()
            .map(|(id, rep)| (*id, rep.score(), rep.accepts, rep.failures()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_peer_is_neutral() {
        let rep = PeerReliability::default();
        assert_eq!(rep.success_rate(), 1.0);
        assert_eq!(rep.score(), NEUTRAL_SCORE);
        assert!(!rep.is_banned());
    }

    #[test]
    fn test_ema_latency() {
        let mut rep = PeerReliability::default();
        rep.record_accept(Duration::from_millis(100), 1);
        assert_eq!(rep.avg_latency_ms, 100.0);

        rep.record_accept(Duration::from_millis(200), 2);
        // 0.3 * 200 + 0.7 * 100
        assert!((rep.avg_latency_ms - 130.0).abs() < 0.01);
        assert_eq!(rep.last_accept_ms, Some(2));
    }

    #[test]
    fn test_failure_kinds_are_counted_separately() {
        let mut rep = PeerReliability::default();
        rep.record_failure(HopOutcome::Rejected);
        rep.record_failure(HopOutcome::TimedOut);
        rep.record_failure(HopOutcome::TimedOut);
        rep.record_failure(HopOutcome::CircuitFailed);

        assert_eq!(rep.rejects, 1);
        assert_eq!(rep.timeouts, 2);
        assert_eq!(rep.circuit_failures, 1);
        assert_eq!(rep.failures(), 4);
        assert!(rep.is_banned());
    }

    #[test]
    fn test_ban_needs_min_samples() {
        let mut rep = PeerReliability::default();
        rep.record_failure(HopOutcome::Rejected);
        rep.record_failure(HopOutcome::Rejected);
        assert!(!rep.is_banned());
    }

    #[test]
    fn test_unreliable_scores_worse() {
        let mut reliable = PeerReliability::default();
        let mut unreliable = PeerReliability::default();
        for _ in 0..3 {
            reliable.record_accept(Duration::from_millis(100), 0);
        }
        unreliable.record_accept(Duration::from_millis(100), 0);
        unreliable.record_failure(HopOutcome::TimedOut);
        unreliable.record_failure(HopOutcome::TimedOut);

        assert!(unreliable.score() > reliable.score());
    }

    #[test]
    fn test_manager_weight_and_ban() {
        let mut manager = ReputationManager::new();
        let fast = PeerId::random();
        let dead = PeerId::random();

        for _ in 0..3 {
            manager.record(&fast, HopOutcome::Accepted, Duration::from_millis(50), 0);
        }
        for _ in 0..4 {
            manager.record(&dead, HopOutcome::Rejected, Duration::ZERO, 0);
        }

        assert_eq!(manager.weight(&fast), 1.0);
        assert!(manager.weight(&dead) < 0.1);
        assert!(manager.is_banned(&dead));
        assert!(!manager.is_banned(&PeerId::random()));
        assert_eq!(manager.weight(&PeerId::random()), 1.0);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_all_scores() {
        let mut manager = ReputationManager::new();
        let peer = PeerId::random();
        manager.record(&peer, HopOutcome::Accepted, Duration::from_millis(10), 0);
        manager.record(&peer, HopOutcome::CircuitFailed, Duration::ZERO, 0);

        let scores = manager.all_scores();
        assert_eq!(scores.len(), 1);
        let (id, _, accepts, failures) = scores[0];
        assert_eq!(id, peer);
        assert_eq!(accepts, 1);
        assert_eq!(failures, 1);
    }
}
