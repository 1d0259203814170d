// Copyright (c) 2024 Botho Foundation
//
//! Shared setup for the tunnel pool integration tests.
//!
//! A [`TestRouter`] is a facade over a [`SimNetwork`] with exploratory
//! builds and random zero-hop circuits switched off, so every circuit a
//! test builds has exactly the depth it asked for.

#![allow(dead_code)]

use std::sync::Arc;

use bth_tunnel_pool::{
    now_ms, CircuitRequestProtocol, ClientCircuitPolicy, Collaborators, SimNetwork, TunnelConfig,
    TunnelKind, TunnelManagerFacade, TunnelPool, TunnelRecord,
};
use libp2p::PeerId;

pub struct TestRouter {
    pub network: Arc<SimNetwork>,
    pub facade: TunnelManagerFacade,
}

impl TestRouter {
    pub fn new(peers: usize) -> Self {
        Self::with_config(peers, test_config())
    }

    pub fn with_config(peers: usize, config: TunnelConfig) -> Self {
        let network = SimNetwork::with_peers(peers);
        let facade = TunnelManagerFacade::new(
            config,
            PeerId::random(),
            Collaborators::simulated(&network),
        );
        Self { network, facade }
    }

    /// Same as [`TestRouter::new`] with the zero-hop carrier circuits in place.
    pub fn with_carriers(peers: usize) -> Self {
        let router = Self::new(peers);
        router.pool().ensure_minimum_fallback_circuits(now_ms());
        router
    }

    pub fn pool(&self) -> &Arc<TunnelPool> {
        self.facade.pool()
    }

    pub fn protocol(&self) -> Arc<CircuitRequestProtocol> {
        self.facade.maintenance().protocol().clone()
    }

    /// An unbound circuit of `kind` with `depth` remote hops.
    pub fn record(&self, kind: TunnelKind, depth: usize) -> TunnelRecord {
        let record = self
            .pool()
            .builder()
            .build(kind, None, &policy(depth), false, now_ms())
            .expect("circuit should be assembled");
        assert_eq!(record.remote_hops(), depth);
        record
    }

    /// Join requests sent for `record`, in the order they arrived.
    pub fn request_targets(&self, record: &TunnelRecord) -> Vec<PeerId> {
        self.network
            .join_requests()
            .into_iter()
            .filter(|r| r.circuit == Some(record.id()))
            .map(|r| r.target)
            .collect()
    }
}

pub fn test_config() -> TunnelConfig {
    let mut config = TunnelConfig::default();
    config.pool.zero_hop_probability = 0.0;
    config.pool.exploratory_inbound = 0;
    config.pool.exploratory_outbound = 0;
    config
}

pub fn policy(depth: usize) -> ClientCircuitPolicy {
    ClientCircuitPolicy {
        inbound_depth: depth,
        outbound_depth: depth,
        ..Default::default()
    }
}

/// Remote peers of `record` in hop order.
pub fn remote_peers(record: &TunnelRecord) -> Vec<PeerId> {
    record.hops().iter().filter_map(|hop| hop.peer).collect()
}
