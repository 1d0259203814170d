// Copyright (c) 2024 Botho Foundation

//! Liveness probes for owned circuits.
//!
//! Each pass samples a few eligible circuits and sends a self-addressed
//! probe through each one:
//!
//! ```text
//! outbound:  local ─▶ circuit ─▶ endpoint ─▶ local   (echo via another inbound)
//! inbound:   local ─▶ some outbound ─▶ gateway ─▶ circuit ─▶ local
//! ```
//!
//! A missing or wrong echo marks the circuit failed.

use futures::future::join_all;
use libp2p::PeerId;
use rand::{seq::SliceRandom, Rng};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    config::TesterConfig,
    messages::TunnelMessage,
    metrics,
    pool::TunnelPool,
    record::TunnelRecord,
    reputation::HopOutcome,
    selector::{SelectionCriteria, TunnelSelector},
    traits::{CryptoEngine, MessageTransport},
    types::{TunnelId, TunnelKind},
};

/// Counts from one test pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestReport {
    pub tested: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed(Duration),
    Failed(String),
    /// No circuit available to carry the probe.
    Skipped,
}

pub struct TunnelTester {
    pool: Arc<TunnelPool>,
    selector: TunnelSelector,
    transport: Arc<dyn MessageTransport>,
    crypto: Arc<dyn CryptoEngine>,
    config: TesterConfig,
    local_peer: PeerId,
}

impl TunnelTester {
    pub fn new(
        pool: Arc<TunnelPool>,
        selector: TunnelSelector,
        transport: Arc<dyn MessageTransport>,
        crypto: Arc<dyn CryptoEngine>,
        config: TesterConfig,
        local_peer: PeerId,
    ) -> Self {
        Self {
            pool,
            selector,
            transport,
            crypto,
            config,
            local_peer,
        }
    }

    pub fn config(&self) -> &TesterConfig {
        &self.config
    }

    /// Owned circuits worth testing, sampled and capped.
    pub fn candidates(&self, now_ms: u64) -> Vec<TunnelRecord> {
        let window_ms = self.config.window_secs * 1_000;
        let min_age_ms = self.config.min_age_secs * 1_000;
        let mut rng = rand::thread_rng();

        let mut eligible: Vec<TunnelRecord> = self
            .pool
            .managed_circuits()
            .into_iter()
            .filter(|r| !r.is_zero_hop() && r.is_ready())
            .filter(|r| r.remaining_ms(now_ms) > window_ms)
            .filter(|r| now_ms.saturating_sub(r.created_ms()) >= min_age_ms)
            .filter(|_| rng.gen_bool(self.config.probability.clamp(0.0, 1.0)))
            .collect();

        eligible.shuffle(&mut rng);
        eligible.truncate(self.config.max_per_pass);
        eligible
    }

    /// Probe one circuit.
    pub async fn test_circuit(&self, record: &TunnelRecord, now_ms: u64) -> TestOutcome {
        let route = match record.kind() {
            TunnelKind::Outbound => self
                .pick(TunnelKind::Inbound, record.id(), now_ms)
                .map(|reply_via| (record.id(), self.local_peer, reply_via)),
            TunnelKind::Inbound => match record.gateway() {
                Some(gateway) => self
                    .pick(TunnelKind::Outbound, record.id(), now_ms)
                    .map(|via| (via, *gateway, record.id())),
                None => None,
            },
            _ => None,
        };
        let Some((via, target, reply_via)) = route else {
            return TestOutcome::Skipped;
        };

        let nonce: u64 = rand::random();
        let probe = TunnelMessage::TestProbe {
            tunnel: record.id(),
            nonce,
        };
        let payload = self.crypto.wrap(&target, &probe.encode());
        let timeout = self.config.probe_timeout();
        trace!(tunnel = %record.id(), via = %via, reply_via = %reply_via, "Sending test probe");

        let started = Instant::now();
        let sent = tokio::time::timeout(
            timeout,
            self.transport
                .send_through_circuit(via, target, payload, reply_via, timeout),
        )
        .await;

        let bytes = match sent {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => return TestOutcome::Failed(err.to_string()),
            Err(_) => return TestOutcome::Failed("probe timed out".to_string()),
        };
        let echo = self
            .crypto
            .unwrap(&target, &bytes)
            .ok()
            .and_then(|opened| TunnelMessage::decode(&opened).ok());
        match echo {
            Some(TunnelMessage::TestEcho { nonce: n }) if n == nonce => {
                TestOutcome::Passed(started.elapsed())
            }
            _ => TestOutcome::Failed("bad echo".to_string()),
        }
    }

    fn pick(&self, kind: TunnelKind, exclude: TunnelId, now_ms: u64) -> Option<TunnelId> {
        let criteria = SelectionCriteria::new(1).excluding([exclude]);
        self.selector
            .select(&self.pool, kind, &criteria, now_ms)
            .into_iter()
            .next()
    }

    /// Test a sample of circuits concurrently and apply the verdicts.
    pub async fn run_pass(&self, now_ms: u64) -> TestReport {
        let candidates = self.candidates(now_ms);
        let outcomes = join_all(candidates.iter().map(|r| self.test_circuit(r, now_ms))).await;

        let mut report = TestReport::default();
        for (record, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                TestOutcome::Passed(latency) => {
                    report.passed += 1;
                    metrics::TESTS_PASSED.inc();
                    let mut reputation = self.pool.reputation().lock();
                    for peer in record.peers() {
                        reputation.record(peer, HopOutcome::Accepted, latency, now_ms);
                    }
                    trace!(tunnel = %record.id(), latency_ms = latency.as_millis() as u64, "Circuit test passed");
                }
                TestOutcome::Failed(reason) => {
                    report.failed += 1;
                    metrics::TESTS_FAILED.inc();
                    warn!(tunnel = %record.id(), reason = %reason, "Circuit test failed");
                    self.pool.mark_failed(&record.id(), now_ms);
                }
                TestOutcome::Skipped => report.skipped += 1,
            }
        }
        report.tested = report.passed + report.failed;

        if report.tested > 0 || report.skipped > 0 {
            debug!(
                tested = report.tested,
                passed = report.passed,
                failed = report.failed,
                skipped = report.skipped,
                "Circuit test pass finished"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pool::test_utils::{insert_built, make_pool},
        record::test_utils::make_record,
        sim::{PeerBehavior, SimCrypto, SimNetwork},
    };

    const HOUR: u64 = 3_600_000;

    fn tester(network: &Arc<SimNetwork>, pool: &Arc<TunnelPool>) -> TunnelTester {
        TunnelTester::new(
            pool.clone(),
            TunnelSelector::new(pool.config().safety_margin_ms()),
            network.clone(),
            Arc::new(SimCrypto::new()),
            TesterConfig {
                probability: 1.0,
                min_age_secs: 0,
                ..Default::default()
            },
            PeerId::random(),
        )
    }

    #[test]
    fn test_candidates_skip_ineligible() {
        let (network, pool) = make_pool(0);
        let tester = tester(&network, &pool);
        pool.ensure_minimum_fallback_circuits(0);
        let good = insert_built(&pool, make_record(TunnelKind::Outbound, 2, HOUR));
        insert_built(&pool, make_record(TunnelKind::Outbound, 2, 60_000));
        let failed = insert_built(&pool, make_record(TunnelKind::Inbound, 2, HOUR));
        pool.mark_failed(&failed, 0);

        let ids: Vec<_> = tester.candidates(0).iter().map(TunnelRecord::id).collect();
        assert_eq!(ids, vec![good]);
    }

    #[tokio::test]
    async fn test_healthy_circuits_pass() {
        let (network, pool) = make_pool(0);
        let tester = tester(&network, &pool);
        pool.ensure_minimum_fallback_circuits(0);
        let outbound = make_record(TunnelKind::Outbound, 2, HOUR);
        let inbound = make_record(TunnelKind::Inbound, 2, HOUR);
        for peer in outbound.peers().chain(inbound.peers()) {
            network.add_peer_with(*peer, None, 1.0, PeerBehavior::default());
        }
        insert_built(&pool, outbound);
        insert_built(&pool, inbound);

        let report = tester.run_pass(0).await;
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(network.requests().iter().filter(|r| r.is_probe()).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_circuit_marked_failed() {
        let (network, pool) = make_pool(0);
        let tester = tester(&network, &pool);
        pool.ensure_minimum_fallback_circuits(0);
        let broken = insert_built(&pool, make_record(TunnelKind::Inbound, 1, HOUR));
        network.fail_circuit(broken);

        let report = tester.run_pass(0).await;
        assert_eq!(report.failed, 1);
        assert!(!pool.get(&broken).unwrap().is_ready());
    }
}
