// Copyright (c) 2024 Botho Foundation

//! Recurring maintenance passes.
//!
//! | job            | does                                                   |
//! |----------------|--------------------------------------------------------|
//! | PoolManager    | starts builds for exploratory and client deficits      |
//! | Expiration     | drops expired circuits, destroys finished clients      |
//! | ClientManager  | stops disconnected clients, hands free circuits out    |
//! | LeaseCheck     | publishes leases for clients that need one             |
//! | Tester         | probes a sample of owned circuits                      |
//! | Persist        | writes the pool file                                   |
//!
//! Every job goes through [`Maintenance::run_job`]. [`Maintenance::spawn`]
//! runs one loop per job until the shutdown signal flips. Circuit builds are
//! spawned into a [`JoinSet`] so they can be aborted together on shutdown.

use parking_lot::Mutex;
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, task::JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::TunnelConfig,
    handshake::CircuitRequestProtocol,
    lease::{LeaseCheck, LeaseManager},
    persist,
    policy::ClientCircuitPolicy,
    pool::TunnelPool,
    record::TunnelRecord,
    tester::{TestReport, TunnelTester},
    traits::LeasePublisher,
    types::{now_ms, Destination, TunnelKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaintenanceJob {
    PoolManager,
    Expiration,
    ClientManager,
    LeaseCheck,
    Tester,
    Persist,
}

impl MaintenanceJob {
    pub const ALL: [MaintenanceJob; 6] = [
        MaintenanceJob::PoolManager,
        MaintenanceJob::Expiration,
        MaintenanceJob::ClientManager,
        MaintenanceJob::LeaseCheck,
        MaintenanceJob::Tester,
        MaintenanceJob::Persist,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MaintenanceJob::PoolManager => "pool-manager",
            MaintenanceJob::Expiration => "expiration",
            MaintenanceJob::ClientManager => "client-manager",
            MaintenanceJob::LeaseCheck => "lease-check",
            MaintenanceJob::Tester => "tester",
            MaintenanceJob::Persist => "persist",
        }
    }

    /// Delay before the next run. The tester adds random jitter.
    pub fn interval(&self, config: &TunnelConfig) -> Duration {
        let secs = match self {
            MaintenanceJob::PoolManager => config.maintenance.pool_manager_interval_secs,
            MaintenanceJob::Expiration => config.maintenance.expiration_interval_secs,
            MaintenanceJob::ClientManager => config.maintenance.client_manager_interval_secs,
            MaintenanceJob::LeaseCheck => config.maintenance.lease_check_interval_secs,
            MaintenanceJob::Tester => {
                let jitter = match config.tester.jitter_secs {
                    0 => 0,
                    max => rand::thread_rng().gen_range(0..=max),
                };
                config.tester.interval_secs + jitter
            }
            MaintenanceJob::Persist => config.persist.interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// What one job run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    BuildsStarted(usize),
    Expired(usize),
    Clients {
        stopped: usize,
        restarted: usize,
        claimed: usize,
    },
    Leases {
        published: usize,
        insufficient: usize,
        failed: usize,
    },
    Tests(TestReport),
    Persisted { circuits: usize },
    PersistFailed(String),
    Idle,
}

pub struct Maintenance {
    pool: Arc<TunnelPool>,
    protocol: Arc<CircuitRequestProtocol>,
    tester: TunnelTester,
    leases: LeaseManager,
    publisher: Arc<dyn LeasePublisher>,
    config: TunnelConfig,
    builds: Mutex<JoinSet<()>>,
}

impl Maintenance {
    pub fn new(
        pool: Arc<TunnelPool>,
        protocol: Arc<CircuitRequestProtocol>,
        tester: TunnelTester,
        leases: LeaseManager,
        publisher: Arc<dyn LeasePublisher>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            pool,
            protocol,
            tester,
            leases,
            publisher,
            config,
            builds: Mutex::new(JoinSet::new()),
        }
    }

    pub fn protocol(&self) -> &Arc<CircuitRequestProtocol> {
        &self.protocol
    }

    pub async fn run_job(&self, job: MaintenanceJob) -> JobReport {
        let now = now_ms();
        let report = match job {
            MaintenanceJob::PoolManager => JobReport::BuildsStarted(self.manage_pool(now)),
            MaintenanceJob::Expiration => JobReport::Expired(self.pool.expire(now)),
            MaintenanceJob::ClientManager => self.manage_clients(now),
            MaintenanceJob::LeaseCheck => self.check_leases(now).await,
            MaintenanceJob::Tester => JobReport::Tests(self.tester.run_pass(now).await),
            MaintenanceJob::Persist => self.persist().await,
        };
        trace!(job = job.name(), report = ?report, "Maintenance job finished");
        report
    }

    // ------------------------------------------------------------------
    // Pool manager
    // ------------------------------------------------------------------

    fn manage_pool(&self, now_ms: u64) -> usize {
        self.reap_builds();
        let margin = self.pool.config().safety_margin_ms();

        let exploratory = self.pool.config().exploratory_policy();
        let inbound = exploratory.inbound_quantity.saturating_sub(
            self.pool.exploratory_count(TunnelKind::Inbound, now_ms)
                + self.pool.pending_for(None, TunnelKind::Inbound),
        );
        let outbound = exploratory.outbound_quantity.saturating_sub(
            self.pool.exploratory_count(TunnelKind::Outbound, now_ms)
                + self.pool.pending_for(None, TunnelKind::Outbound),
        );
        let mut started = self.start_builds(TunnelKind::Inbound, inbound, None, &exploratory, now_ms);
        started += self.start_builds(TunnelKind::Outbound, outbound, None, &exploratory, now_ms);

        for client in self.pool.clients() {
            if client.is_stopped() {
                continue;
            }
            let destination = *client.destination();
            let policy = client.policy();
            let inbound = policy.inbound_quantity.saturating_sub(
                client.safe_count(now_ms, margin)
                    + self.pool.pending_for(Some(&destination), TunnelKind::Inbound),
            );
            let outbound = policy.outbound_quantity.saturating_sub(
                self.pool.outbound_for(Some(&destination), now_ms)
                    + self.pool.pending_for(Some(&destination), TunnelKind::Outbound),
            );
            started +=
                self.start_builds(TunnelKind::Inbound, inbound, Some(destination), &policy, now_ms);
            started +=
                self.start_builds(TunnelKind::Outbound, outbound, Some(destination), &policy, now_ms);
        }

        if started > 0 {
            debug!(started, "Started circuit builds");
        }
        started
    }

    fn start_builds(
        &self,
        kind: TunnelKind,
        count: usize,
        destination: Option<Destination>,
        policy: &ClientCircuitPolicy,
        now_ms: u64,
    ) -> usize {
        if count == 0 {
            return 0;
        }
        let depth = match kind {
            TunnelKind::Inbound => policy.inbound_depth,
            _ => policy.outbound_depth,
        };

        let records: Vec<TunnelRecord> = self
            .pool
            .builder()
            .build_batch(kind, count, destination, policy, now_ms)
            .into_iter()
            // The fallback floor already covers unbound zero-hop circuits
            .filter(|r| destination.is_some() || depth == 0 || !r.is_zero_hop())
            .collect();
        self.spawn_builds(records)
    }

    fn spawn_builds(&self, records: Vec<TunnelRecord>) -> usize {
        let count = records.len();
        let mut builds = self.builds.lock();
        for record in records {
            let protocol = self.protocol.clone();
            builds.spawn(async move {
                if let Err(err) = protocol.execute(record).await {
                    trace!(error = %err, "Build task ended without a circuit");
                }
            });
        }
        count
    }

    fn reap_builds(&self) {
        let mut builds = self.builds.lock();
        while let Some(result) = builds.try_join_next() {
            if let Err(err) = result {
                if err.is_panic() {
                    error!(error = %err, "Circuit build task panicked");
                }
            }
        }
    }

    pub fn builds_in_flight(&self) -> usize {
        self.builds.lock().len()
    }

    /// Wait until every build started so far has finished.
    pub async fn wait_for_builds(&self) {
        let mut builds = std::mem::replace(&mut *self.builds.lock(), JoinSet::new());
        while builds.join_next().await.is_some() {}
    }

    /// Abort every in-flight build; their pending entries are released.
    pub async fn abort_builds(&self) {
        let mut builds = std::mem::replace(&mut *self.builds.lock(), JoinSet::new());
        let aborted = builds.len();
        builds.abort_all();
        while builds.join_next().await.is_some() {}
        if aborted > 0 {
            info!(aborted, "Aborted in-flight circuit builds");
        }
    }

    // ------------------------------------------------------------------
    // Clients and leases
    // ------------------------------------------------------------------

    fn manage_clients(&self, now_ms: u64) -> JobReport {
        let margin = self.pool.config().safety_margin_ms();
        let (mut stopped, mut restarted, mut claimed) = (0, 0, 0);

        for client in self.pool.clients() {
            let destination = *client.destination();
            if !self.publisher.is_connected(&destination) {
                if !client.is_stopped() {
                    client.stop();
                    stopped += 1;
                }
                continue;
            }
            if client.is_stopped() {
                info!(client = %destination, "Client reconnected");
                client.restart();
                restarted += 1;
            }

            let wanted = client
                .policy()
                .inbound_quantity
                .saturating_sub(client.safe_count(now_ms, margin));
            claimed += self.pool.claim_free_for(&destination, wanted, now_ms);
        }

        JobReport::Clients {
            stopped,
            restarted,
            claimed,
        }
    }

    async fn check_leases(&self, now_ms: u64) -> JobReport {
        let (mut published, mut insufficient, mut failed) = (0, 0, 0);
        for client in self.pool.clients() {
            match self.leases.check(&client, now_ms).await {
                LeaseCheck::Published { .. } => published += 1,
                LeaseCheck::Insufficient { .. } => insufficient += 1,
                LeaseCheck::Failed(_) => failed += 1,
                LeaseCheck::Stopped | LeaseCheck::UpToDate => {}
            }
        }
        JobReport::Leases {
            published,
            insufficient,
            failed,
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    async fn persist(&self) -> JobReport {
        let Some(path) = self.config.persist.path.clone() else {
            return JobReport::Idle;
        };
        let snapshot = self.pool.snapshot();
        let circuits = snapshot.circuit_count();

        match tokio::task::spawn_blocking(move || persist::save(&path, &snapshot)).await {
            Ok(Ok(())) => JobReport::Persisted { circuits },
            Ok(Err(err)) => {
                warn!(error = %err, "Failed to save tunnel pool");
                JobReport::PersistFailed(err.to_string())
            }
            Err(err) => {
                error!(error = %err, "Tunnel pool save task failed");
                JobReport::PersistFailed(err.to_string())
            }
        }
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    /// One loop per job until `shutdown` becomes `true`.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        MaintenanceJob::ALL
            .into_iter()
            .filter(|job| *job != MaintenanceJob::Persist || self.config.persist.path.is_some())
            .map(|job| {
                let this = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let delay = job.interval(&this.config);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                this.run_job(job).await;
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!(job = job.name(), "Maintenance loop stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pool::test_utils::make_pool,
        selector::TunnelSelector,
        sim::{SimCrypto, SimNetwork},
    };
    use libp2p::PeerId;

    fn maintenance(peers: usize) -> (Arc<SimNetwork>, Arc<TunnelPool>, Arc<Maintenance>) {
        let (network, pool) = make_pool(peers);
        let config = TunnelConfig::default();
        let selector = TunnelSelector::new(config.pool.safety_margin_ms());
        let crypto = Arc::new(SimCrypto::new());
        let local = PeerId::random();
        let protocol = Arc::new(CircuitRequestProtocol::new(
            pool.clone(),
            selector,
            network.clone(),
            crypto.clone(),
            network.clone(),
            &config.handshake,
            local,
        ));
        let tester = TunnelTester::new(
            pool.clone(),
            selector,
            network.clone(),
            crypto,
            config.tester.clone(),
            local,
        );
        let leases = LeaseManager::new(network.clone(), Duration::from_secs(5), config.pool.safety_margin_ms());
        let maintenance = Arc::new(Maintenance::new(
            pool.clone(),
            protocol,
            tester,
            leases,
            network.clone(),
            config,
        ));
        (network, pool, maintenance)
    }

    #[test]
    fn test_intervals() {
        let mut config = TunnelConfig::default();
        assert_eq!(
            MaintenanceJob::LeaseCheck.interval(&config),
            Duration::from_secs(15)
        );
        let tester = MaintenanceJob::Tester.interval(&config);
        assert!(tester >= Duration::from_secs(60) && tester <= Duration::from_secs(90));

        config.maintenance.expiration_interval_secs = 0;
        assert_eq!(
            MaintenanceJob::Expiration.interval(&config),
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn test_pool_manager_builds_exploratory_circuits() {
        let (network, pool, maintenance) = maintenance(6);
        pool.ensure_minimum_fallback_circuits(now_ms());

        assert_eq!(
            maintenance.run_job(MaintenanceJob::PoolManager).await,
            JobReport::BuildsStarted(4)
        );
        maintenance.wait_for_builds().await;

        let now = now_ms();
        assert_eq!(pool.exploratory_count(TunnelKind::Inbound, now), 2);
        assert_eq!(pool.exploratory_count(TunnelKind::Outbound, now), 2);
        assert_eq!(pool.pending_count(), 0);
        assert!(!network.join_requests().is_empty());

        // Targets met
        assert_eq!(
            maintenance.run_job(MaintenanceJob::PoolManager).await,
            JobReport::BuildsStarted(0)
        );
    }

    #[tokio::test]
    async fn test_client_manager_stops_and_restarts() {
        let (network, pool, maintenance) = maintenance(0);
        let destination = Destination::random(&mut rand::thread_rng());
        let client = pool.create_client(destination, ClientCircuitPolicy::default());

        network.disconnect(destination);
        assert!(matches!(
            maintenance.run_job(MaintenanceJob::ClientManager).await,
            JobReport::Clients { stopped: 1, .. }
        ));
        assert!(client.is_stopped());

        network.reconnect(&destination);
        assert!(matches!(
            maintenance.run_job(MaintenanceJob::ClientManager).await,
            JobReport::Clients { restarted: 1, .. }
        ));
        assert!(!client.is_stopped());
        assert!(client.refresh_requested());
    }

    #[tokio::test]
    async fn test_persist_idle_without_path() {
        let (_, _, maintenance) = maintenance(0);
        assert_eq!(
            maintenance.run_job(MaintenanceJob::Persist).await,
            JobReport::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_stop_on_shutdown() {
        let (_, _, maintenance) = maintenance(0);
        let (tx, rx) = watch::channel(false);
        let handles = maintenance.spawn(rx);
        assert_eq!(handles.len(), MaintenanceJob::ALL.len() - 1);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
