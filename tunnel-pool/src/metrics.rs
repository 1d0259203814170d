// Copyright (c) 2024 Botho Foundation

//! Prometheus metrics for the tunnel subsystem.
//!
//! - **Build metrics**: handshake outcomes and latency
//! - **Lifecycle metrics**: expirations, failures, fallback circuits
//! - **Pool gauges**: size of each circuit category
//! - **Client metrics**: lease publication, participation decisions
//!
//! # Integration
//!
//! ```ignore
//! use bth_tunnel_pool::metrics::register_tunnel_metrics;
//!
//! let registry = prometheus::Registry::new();
//! register_tunnel_metrics(&registry)?;
//! ```
//!
//! # Dashboard Queries
//!
//! ```promql
//! # Build success rate
//! rate(bth_tunnel_circuits_built_total[5m]) /
//! (rate(bth_tunnel_circuits_built_total[5m]) +
//!  rate(bth_tunnel_build_failures_total[5m]))
//!
//! # Share of circuits that had to fall back to zero hops
//! rate(bth_tunnel_fallback_circuits_total[15m])
//! ```

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use tracing::info;

// ============================================================================
// Build Metrics
// ============================================================================

lazy_static! {
    /// Circuits whose handshake succeeded.
    pub static ref CIRCUITS_BUILT: IntCounter = IntCounter::new(
        "bth_tunnel_circuits_built_total",
        "Total number of circuits successfully built"
    ).expect("Failed to create circuits_built metric");

    /// Circuits whose handshake failed.
    pub static ref BUILD_FAILURES: IntCounter = IntCounter::new(
        "bth_tunnel_build_failures_total",
        "Total number of circuit build failures"
    ).expect("Failed to create build_failures metric");

    /// Handshake duration (milliseconds).
    pub static ref BUILD_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bth_tunnel_build_latency_ms",
            "Circuit handshake latency in milliseconds"
        ).buckets(vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0])
    ).expect("Failed to create build_latency metric");

    /// Join requests sent to remote hops.
    pub static ref HOP_REQUESTS_SENT: IntCounter = IntCounter::new(
        "bth_tunnel_hop_requests_total",
        "Total number of join requests sent to remote hops"
    ).expect("Failed to create hop_requests metric");

    /// Hops that did not reply in time.
    pub static ref HOP_TIMEOUTS: IntCounter = IntCounter::new(
        "bth_tunnel_hop_timeouts_total",
        "Total number of join requests that timed out"
    ).expect("Failed to create hop_timeouts metric");
}

// ============================================================================
// Lifecycle Metrics
// ============================================================================

lazy_static! {
    /// Zero-hop circuits added to keep the fallback floor.
    pub static ref FALLBACK_CIRCUITS_BUILT: IntCounter = IntCounter::new(
        "bth_tunnel_fallback_circuits_total",
        "Total number of zero-hop circuits built to keep the fallback floor"
    ).expect("Failed to create fallback_circuits metric");

    pub static ref CIRCUITS_EXPIRED: IntCounter = IntCounter::new(
        "bth_tunnel_circuits_expired_total",
        "Total number of circuits removed on expiration"
    ).expect("Failed to create circuits_expired metric");

    /// Circuits demoted after a failed test or a peer failure.
    pub static ref CIRCUITS_FAILED: IntCounter = IntCounter::new(
        "bth_tunnel_circuits_failed_total",
        "Total number of circuits marked failed"
    ).expect("Failed to create circuits_failed metric");

    pub static ref TESTS_PASSED: IntCounter = IntCounter::new(
        "bth_tunnel_tests_passed_total",
        "Total number of circuit tests that passed"
    ).expect("Failed to create tests_passed metric");

    pub static ref TESTS_FAILED: IntCounter = IntCounter::new(
        "bth_tunnel_tests_failed_total",
        "Total number of circuit tests that failed"
    ).expect("Failed to create tests_failed metric");
}

// ============================================================================
// Pool Gauges
// ============================================================================

lazy_static! {
    pub static ref OUTBOUND_CIRCUITS: IntGauge = IntGauge::new(
        "bth_tunnel_outbound_circuits",
        "Number of outbound circuits in the pool"
    ).expect("Failed to create outbound_circuits metric");

    pub static ref FREE_INBOUND_CIRCUITS: IntGauge = IntGauge::new(
        "bth_tunnel_free_inbound_circuits",
        "Number of unbound inbound circuits in the pool"
    ).expect("Failed to create free_inbound_circuits metric");

    pub static ref PARTICIPATING_CIRCUITS: IntGauge = IntGauge::new(
        "bth_tunnel_participating_circuits",
        "Number of circuits relayed for other routers"
    ).expect("Failed to create participating_circuits metric");

    pub static ref PENDING_CIRCUITS: IntGauge = IntGauge::new(
        "bth_tunnel_pending_circuits",
        "Number of circuits with a handshake in flight"
    ).expect("Failed to create pending_circuits metric");

    pub static ref CLIENT_POOLS: IntGauge = IntGauge::new(
        "bth_tunnel_client_pools",
        "Number of client circuit pools"
    ).expect("Failed to create client_pools metric");
}

// ============================================================================
// Client Metrics
// ============================================================================

lazy_static! {
    pub static ref LEASES_PUBLISHED: IntCounter = IntCounter::new(
        "bth_tunnel_leases_published_total",
        "Total number of leases accepted by clients"
    ).expect("Failed to create leases_published metric");

    pub static ref LEASES_REJECTED: IntCounter = IntCounter::new(
        "bth_tunnel_leases_rejected_total",
        "Total number of lease requests rejected or timed out"
    ).expect("Failed to create leases_rejected metric");

    pub static ref JOINS_ACCEPTED: IntCounter = IntCounter::new(
        "bth_tunnel_joins_accepted_total",
        "Total number of participation requests accepted"
    ).expect("Failed to create joins_accepted metric");

    pub static ref JOINS_REJECTED: IntCounter = IntCounter::new(
        "bth_tunnel_joins_rejected_total",
        "Total number of participation requests rejected"
    ).expect("Failed to create joins_rejected metric");
}

/// Register every tunnel metric with `registry`.
pub fn register_tunnel_metrics(registry: &Registry) -> prometheus::Result<()> {
    // Build metrics
    registry.register(Box::new(CIRCUITS_BUILT.clone()))?;
    registry.register(Box::new(BUILD_FAILURES.clone()))?;
    registry.register(Box::new(BUILD_LATENCY.clone()))?;
    registry.register(Box::new(HOP_REQUESTS_SENT.clone()))?;
    registry.register(Box::new(HOP_TIMEOUTS.clone()))?;

    // Lifecycle metrics
    registry.register(Box::new(FALLBACK_CIRCUITS_BUILT.clone()))?;
    registry.register(Box::new(CIRCUITS_EXPIRED.clone()))?;
    registry.register(Box::new(CIRCUITS_FAILED.clone()))?;
    registry.register(Box::new(TESTS_PASSED.clone()))?;
    registry.register(Box::new(TESTS_FAILED.clone()))?;

    // Pool gauges
    registry.register(Box::new(OUTBOUND_CIRCUITS.clone()))?;
    registry.register(Box::new(FREE_INBOUND_CIRCUITS.clone()))?;
    registry.register(Box::new(PARTICIPATING_CIRCUITS.clone()))?;
    registry.register(Box::new(PENDING_CIRCUITS.clone()))?;
    registry.register(Box::new(CLIENT_POOLS.clone()))?;

    // Client metrics
    registry.register(Box::new(LEASES_PUBLISHED.clone()))?;
    registry.register(Box::new(LEASES_REJECTED.clone()))?;
    registry.register(Box::new(JOINS_ACCEPTED.clone()))?;
    registry.register(Box::new(JOINS_REJECTED.clone()))?;

    info!("Tunnel metrics registered with Prometheus");
    Ok(())
}

/// Point-in-time copy of the counters, used by status output.
#[derive(Debug, Clone, Default)]
pub struct TunnelMetricsSnapshot {
    pub circuits_built: u64,
    pub build_failures: u64,
    pub fallback_circuits: u64,
    pub circuits_expired: u64,
    pub circuits_failed: u64,
    pub tests_passed: u64,
    pub tests_failed: u64,
    pub leases_published: u64,
    pub leases_rejected: u64,
}

impl TunnelMetricsSnapshot {
    pub fn capture() -> Self {
        Self {
            circuits_built: CIRCUITS_BUILT.get(),
            build_failures: BUILD_FAILURES.get(),
            fallback_circuits: FALLBACK_CIRCUITS_BUILT.get(),
            circuits_expired: CIRCUITS_EXPIRED.get(),
            circuits_failed: CIRCUITS_FAILED.get(),
            tests_passed: TESTS_PASSED.get(),
            tests_failed: TESTS_FAILED.get(),
            leases_published: LEASES_PUBLISHED.get(),
            leases_rejected: LEASES_REJECTED.get(),
        }
    }

    /// Returns 1.0 if nothing has been built yet.
    pub fn build_success_rate(&self) -> f64 {
        let total = self.circuits_built + self.build_failures;
        if total == 0 {
            1.0
        } else {
            self.circuits_built as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice_fails() {
        let registry = Registry::new();
        register_tunnel_metrics(&registry).unwrap();
        assert!(register_tunnel_metrics(&registry).is_err());
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn test_snapshot_counts_builds() {
        let before = TunnelMetricsSnapshot::capture();
        CIRCUITS_BUILT.inc();
        let after = TunnelMetricsSnapshot::capture();
        assert!(after.circuits_built > before.circuits_built);
    }

    #[test]
    fn test_success_rate_defaults_to_one() {
        let snapshot = TunnelMetricsSnapshot::default();
        assert_eq!(snapshot.build_success_rate(), 1.0);

        let snapshot = TunnelMetricsSnapshot {
            circuits_built: 3,
            build_failures: 1,
            ..Default::default()
        };
        assert!((snapshot.build_success_rate() - 0.75).abs() < 1e-9);
    }
}
