// Copyright (c) 2024 Botho Foundation

//! Entry point used by the rest of the router.
//!
//! [`TunnelManagerFacade`] wires the pool, builder, request protocol, tester
//! and maintenance loops together from a [`TunnelConfig`] and the
//! [`Collaborators`] the router provides. There are no process-wide
//! singletons; every component hangs off the facade.

use libp2p::PeerId;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    builder::TunnelBuilder,
    client::ClientCircuitPool,
    config::TunnelConfig,
    error::JoinRejection,
    handshake::CircuitRequestProtocol,
    lease::LeaseManager,
    maintenance::{JobReport, Maintenance, MaintenanceJob},
    metrics::{self, TunnelMetricsSnapshot},
    persist,
    policy::ClientCircuitPolicy,
    pool::{RestoreReport, TunnelPool},
    record::TunnelRecord,
    reputation::ReputationManager,
    selection::PeerSelector,
    selector::{SelectionCriteria, TunnelSelector},
    sim::{SimCrypto, SimNetwork},
    tester::TunnelTester,
    traits::{CryptoEngine, LeasePublisher, MessageTransport, PeerLookup},
    types::{now_ms, Destination, TunnelId, TunnelKind},
};

/// Everything the tunnel subsystem needs from the router.
#[derive(Clone)]
pub struct Collaborators {
    pub lookup: Arc<dyn PeerLookup>,
    pub transport: Arc<dyn MessageTransport>,
    pub crypto: Arc<dyn CryptoEngine>,
    pub leases: Arc<dyn LeasePublisher>,
}

impl Collaborators {
    /// Every seam backed by one simulated network.
    pub fn simulated(network: &Arc<SimNetwork>) -> Self {
        Self {
            lookup: network.clone(),
            transport: network.clone(),
            crypto: Arc::new(SimCrypto::new()),
            leases: network.clone(),
        }
    }
}

pub struct TunnelManagerFacade {
    config: TunnelConfig,
    pool: Arc<TunnelPool>,
    selector: TunnelSelector,
    maintenance: Arc<Maintenance>,
    lookup: Arc<dyn PeerLookup>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelManagerFacade {
    pub fn new(config: TunnelConfig, local_peer: PeerId, collaborators: Collaborators) -> Self {
        let Collaborators {
            lookup,
            transport,
            crypto,
            leases,
        } = collaborators;

        let reputation = Arc::new(Mutex::new(ReputationManager::new()));
        let peer_selector =
            PeerSelector::new(config.selection.clone(), lookup.clone(), reputation.clone());
        let builder = Arc::new(TunnelBuilder::new(
            peer_selector,
            crypto.clone(),
            config.pool.zero_hop_probability,
        ));
        let pool = Arc::new(TunnelPool::new(builder, reputation, config.pool.clone()));
        let selector = TunnelSelector::new(config.pool.safety_margin_ms());

        let protocol = Arc::new(CircuitRequestProtocol::new(
            pool.clone(),
            selector,
            transport.clone(),
            crypto.clone(),
            lookup.clone(),
            &config.handshake,
            local_peer,
        ));
        let tester = TunnelTester::new(
            pool.clone(),
            selector,
            transport,
            crypto,
            config.tester.clone(),
            local_peer,
        );
        let lease_manager = LeaseManager::new(
            leases.clone(),
            Duration::from_secs(config.maintenance.lease_request_timeout_secs),
            config.pool.safety_margin_ms(),
        );
        let maintenance = Arc::new(Maintenance::new(
            pool.clone(),
            protocol,
            tester,
            lease_manager,
            leases,
            config.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            pool,
            selector,
            maintenance,
            lookup,
            shutdown,
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<TunnelPool> {
        &self.pool
    }

    pub fn maintenance(&self) -> &Arc<Maintenance> {
        &self.maintenance
    }

    /// Restore the pool file, fill the fallback floor and start the
    /// maintenance loops.
    pub async fn start(&self) -> RestoreReport {
        let now = now_ms();
        let report = match &self.config.persist.path {
            Some(path) => {
                let path = path.clone();
                let snapshot = tokio::task::spawn_blocking(move || persist::load_or_empty(&path))
                    .await
                    .unwrap_or_default();
                self.pool.restore(snapshot, now)
            }
            None => RestoreReport::default(),
        };
        self.pool.ensure_minimum_fallback_circuits(now);

        let mut loops = self.loops.lock();
        if loops.is_empty() {
            self.shutdown.send_replace(false);
            loops.extend(self.maintenance.spawn(self.shutdown.subscribe()));
        }
        info!(
            loops = loops.len(),
            restored = report.restored,
            "Tunnel manager started"
        );
        report
    }

    /// Stop the loops, abort in-flight builds and write the pool file.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(err) = handle.await {
                warn!(error = %err, "Maintenance loop ended abnormally");
            }
        }
        self.maintenance.abort_builds().await;

        if self.config.persist.path.is_some() {
            if let JobReport::PersistFailed(err) = self.maintenance.run_job(MaintenanceJob::Persist).await {
                warn!(error = %err, "Tunnel pool not saved at shutdown");
            }
        }
        info!("Tunnel manager stopped");
    }

    pub async fn run_job(&self, job: MaintenanceJob) -> JobReport {
        self.maintenance.run_job(job).await
    }

    /// Decide whether to relay a circuit someone else is building.
    pub async fn decide_join(&self, record: TunnelRecord) -> Result<(), JoinRejection> {
        let next = record
            .local_index()
            .and_then(|index| record.next_hop(index))
            .and_then(|hop| hop.peer);
        if let Some(peer) = next {
            let found = self
                .lookup
                .lookup_and_wait(&peer, self.config.handshake.lookup_timeout())
                .await;
            if found.is_none() {
                return Err(JoinRejection::UnknownNextHop(peer));
            }
        }
        self.pool.add_participating(record, now_ms())
    }

    pub async fn join_circuit(&self, record: TunnelRecord) -> bool {
        let id = record.id();
        match self.decide_join(record).await {
            Ok(()) => {
                metrics::JOINS_ACCEPTED.inc();
                debug!(tunnel = %id, "Joined circuit");
                true
            }
            Err(err) => {
                metrics::JOINS_REJECTED.inc();
                debug!(tunnel = %id, error = %err, status = ?err.status(), "Refused to join circuit");
                false
            }
        }
    }

    pub fn select_outbound(&self, criteria: &SelectionCriteria) -> Vec<TunnelId> {
        self.selector
            .select(&self.pool, TunnelKind::Outbound, criteria, now_ms())
    }

    pub fn select_inbound(&self, criteria: &SelectionCriteria) -> Vec<TunnelId> {
        self.selector
            .select(&self.pool, TunnelKind::Inbound, criteria, now_ms())
    }

    /// Register a client; circuits and a lease follow on later passes.
    pub fn create_circuits_for(
        &self,
        destination: Destination,
        policy: ClientCircuitPolicy,
    ) -> Arc<ClientCircuitPool> {
        let wanted = policy.inbound_quantity;
        let client = self.pool.create_client(destination, policy);
        let claimed = self.pool.claim_free_for(&destination, wanted, now_ms());
        if claimed > 0 {
            debug!(client = %destination, claimed, "Claimed free circuits for new client");
        }
        client
    }

    pub fn peer_failed(&self, peer: &PeerId) -> usize {
        self.pool.peer_failed(peer, now_ms())
    }

    pub fn is_peer_in_use(&self, peer: &PeerId) -> bool {
        self.pool.is_peer_in_use(peer)
    }

    pub fn render_status(&self) -> String {
        let snapshot = TunnelMetricsSnapshot::capture();
        format!(
            "{}builds: in_flight={} success_rate={:.2} replies_outstanding={}\n",
            self.pool.status(now_ms()),
            self.maintenance.builds_in_flight(),
            snapshot.build_success_rate(),
            self.maintenance.protocol().replies().len(),
        )
    }
}
