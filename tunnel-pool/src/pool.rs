// Copyright (c) 2024 Botho Foundation

//! The categorized circuit store.
//!
//! [`TunnelPool`] owns every circuit the router knows about and is the only
//! place where a circuit moves between categories:
//!
//! ```text
//!               build_succeeded            allocate
//!  pending ──────────────────────▶ free_inbound ─────────▶ client.active
//!     │                   └──────▶ outbound                    │ lease
//!     │ build_failed                                           ▼
//!     ▼                                                   client.inactive
//!  (dropped)          join_circuit ──▶ participating
//! ```
//!
//! Each category sits behind its own lock. A circuit id is in at most one of
//! `outbound`, `free_inbound`, `participating` (plus `pending` while built).
//!
//! Lock order: `clients` (released before anything else is taken), then
//! `free_inbound`, then a client's own maps.

use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    builder::TunnelBuilder,
    client::{ClientCircuitPool, PublishedLease},
    config::PoolConfig,
    error::JoinRejection,
    handshake,
    metrics,
    persist::{ClientSnapshot, PoolSnapshot},
    policy::ClientCircuitPolicy,
    record::TunnelRecord,
    reputation::{HopOutcome, ReputationManager},
    types::{Destination, TunnelId, TunnelKind},
};

type CircuitMap = RwLock<HashMap<TunnelId, TunnelRecord>>;

/// Outcome of loading a persisted snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
    pub clients: usize,
}

pub struct TunnelPool {
    outbound: CircuitMap,
    free_inbound: CircuitMap,
    participating: CircuitMap,
    pending: CircuitMap,
    clients: RwLock<HashMap<Destination, Arc<ClientCircuitPool>>>,
    builder: Arc<TunnelBuilder>,
    reputation: Arc<Mutex<ReputationManager>>,
    config: PoolConfig,
    fallback_lock: Mutex<()>,
}

impl TunnelPool {
    pub fn new(
        builder: Arc<TunnelBuilder>,
        reputation: Arc<Mutex<ReputationManager>>,
        config: PoolConfig,
    ) -> Self {
        Self {
            outbound: RwLock::new(HashMap::new()),
            free_inbound: RwLock::new(HashMap::new()),
            participating: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            builder,
            reputation,
            config,
            fallback_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn builder(&self) -> &Arc<TunnelBuilder> {
        &self.builder
    }

    pub fn reputation(&self) -> &Arc<Mutex<ReputationManager>> {
        &self.reputation
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Whether `id` is known in any category, pending included.
    pub fn contains(&self, id: &TunnelId) -> bool {
        self.outbound.read().contains_key(id)
            || self.free_inbound.read().contains_key(id)
            || self.participating.read().contains_key(id)
            || self.pending.read().contains_key(id)
            || self.clients().iter().any(|c| c.contains(id))
    }

    pub fn get(&self, id: &TunnelId) -> Option<TunnelRecord> {
        for map in [&self.outbound, &self.free_inbound, &self.participating, &self.pending] {
            if let Some(record) = map.read().get(id) {
                return Some(record.clone());
            }
        }
        self.clients().iter().find_map(|c| c.get(id))
    }

    pub fn is_pending(&self, id: &TunnelId) -> bool {
        self.pending.read().contains_key(id)
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.read().len()
    }

    pub fn free_inbound_count(&self) -> usize {
        self.free_inbound.read().len()
    }

    pub fn participating_count(&self) -> usize {
        self.participating.read().len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    /// Selectable circuits of one direction: free inbound or outbound.
    pub fn candidates(&self, kind: TunnelKind) -> Vec<TunnelRecord> {
        match kind {
            TunnelKind::Inbound => self.free_inbound.read().values().cloned().collect(),
            TunnelKind::Outbound => self.outbound.read().values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Every circuit the router owns: outbound, free inbound and client-bound.
    pub fn managed_circuits(&self) -> Vec<TunnelRecord> {
        let mut records: Vec<TunnelRecord> = self.outbound.read().values().cloned().collect();
        records.extend(self.free_inbound.read().values().cloned());
        for client in self.clients() {
            records.extend(client.active());
            records.extend(client.inactive());
        }
        records
    }

    /// Pending builds of `kind` for `destination` (`None` = exploratory).
    pub fn pending_for(&self, destination: Option<&Destination>, kind: TunnelKind) -> usize {
        self.pending
            .read()
            .values()
            .filter(|r| r.kind() == kind && r.destination() == destination)
            .count()
    }

    /// Ready outbound circuits built for `destination` that outlive the
    /// safety margin.
    pub fn outbound_for(&self, destination: Option<&Destination>, now_ms: u64) -> usize {
        let margin = self.config.safety_margin_ms();
        self.outbound
            .read()
            .values()
            .filter(|r| r.destination() == destination && is_usable(r, now_ms, margin))
            .count()
    }

    /// Ready free inbound circuits that outlive the safety margin.
    pub fn usable_free_inbound(&self, now_ms: u64) -> usize {
        let margin = self.config.safety_margin_ms();
        self.free_inbound
            .read()
            .values()
            .filter(|r| is_usable(r, now_ms, margin))
            .count()
    }

    /// Usable unbound circuits of `kind` with at least one remote hop.
    /// Zero-hop fallbacks are not counted.
    pub fn exploratory_count(&self, kind: TunnelKind, now_ms: u64) -> usize {
        let margin = self.config.safety_margin_ms();
        let map = match kind {
            TunnelKind::Inbound => &self.free_inbound,
            TunnelKind::Outbound => &self.outbound,
            _ => return 0,
        };
        map.read()
            .values()
            .filter(|r| r.destination().is_none() && !r.is_zero_hop() && is_usable(r, now_ms, margin))
            .count()
    }

    // ------------------------------------------------------------------
    // Build lifecycle
    // ------------------------------------------------------------------

    /// Register an unbuilt circuit whose handshake is about to start.
    pub fn add_pending(&self, record: TunnelRecord) -> bool {
        let id = record.id();
        if let Err(err) = record.validate() {
            error!(tunnel = %id, error = %err, "Refusing malformed circuit");
            return false;
        }
        if self.contains(&id) {
            warn!(tunnel = %id, "Circuit id already in use");
            return false;
        }
        self.pending.write().insert(id, record);
        self.update_gauges();
        true
    }

    pub fn remove_pending(&self, id: &TunnelId) -> Option<TunnelRecord> {
        let record = self.pending.write().remove(id);
        if record.is_some() {
            self.update_gauges();
        }
        record
    }

    /// Handshake finished: move the circuit out of `pending` and mark it
    /// ready. Inbound circuits built for a client are allocated to it.
    pub fn build_succeeded(&self, id: &TunnelId) -> bool {
        let Some(mut record) = self.pending.write().remove(id) else {
            warn!(tunnel = %id, "Build succeeded for unknown pending circuit");
            return false;
        };
        record.set_ready(true);

        match record.kind() {
            TunnelKind::Inbound => {
                let destination = record.destination().copied();
                record.set_destination(None);
                self.free_inbound.write().insert(*id, record);
                if let Some(destination) = destination {
                    if !self.allocate(id, &destination) {
                        debug!(tunnel = %id, client = %destination, "Built circuit stays free");
                    }
                }
            }
            TunnelKind::Outbound => {
                self.outbound.write().insert(*id, record);
            }
            kind => {
                error!(tunnel = %id, kind = %kind, "Built circuit has no owning category");
                return false;
            }
        }

        self.update_gauges();
        true
    }

    /// Handshake failed or was abandoned.
    pub fn build_failed(&self, id: &TunnelId, now_ms: u64) {
        self.remove_pending(id);
        self.ensure_minimum_fallback_circuits(now_ms);
    }

    /// Move a free inbound circuit into a client's active map.
    ///
    /// Either the circuit ends up bound to `destination` or nothing changes.
    pub fn allocate(&self, id: &TunnelId, destination: &Destination) -> bool {
        let Some(client) = self.client(destination) else {
            return false;
        };

        let mut free = self.free_inbound.write();
        match free.get(id) {
            None => return false,
            Some(record) if record.destination().is_some() => {
                error!(tunnel = %id, "Free inbound circuit is already bound, skipping");
                return false;
            }
            Some(_) => {}
        }
        let Some(mut record) = free.remove(id) else {
            return false;
        };
        record.set_destination(Some(*destination));
        client.insert_active(record);
        drop(free);

        debug!(tunnel = %id, client = %destination, "Allocated circuit to client");
        self.update_gauges();
        true
    }

    /// Allocate up to `wanted` free circuits deep enough for the client's
    /// policy. Returns how many were claimed.
    pub fn claim_free_for(&self, destination: &Destination, wanted: usize, now_ms: u64) -> usize {
        let Some(client) = self.client(destination) else {
            return 0;
        };
        if wanted == 0 || client.is_stopped() {
            return 0;
        }

        let depth = client.policy().inbound_depth;
        let margin = self.config.safety_margin_ms();
        let ids: Vec<TunnelId> = self
            .free_inbound
            .read()
            .values()
            .filter(|r| is_usable(r, now_ms, margin) && r.remote_hops() >= depth)
            .map(TunnelRecord::id)
            .take(wanted)
            .collect();

        ids.iter().filter(|id| self.allocate(id, destination)).count()
    }

    /// Top up unbound free-inbound and outbound circuits to the fallback
    /// floor with zero-hop circuits. Returns how many were added.
    pub fn ensure_minimum_fallback_circuits(&self, now_ms: u64) -> usize {
        let _guard = self.fallback_lock.lock();
        let policy = ClientCircuitPolicy::zero_hop(self.config.default_duration());
        let margin = self.config.safety_margin_ms();
        let mut added = 0;

        for (kind, map) in [
            (TunnelKind::Inbound, &self.free_inbound),
            (TunnelKind::Outbound, &self.outbound),
        ] {
            let usable = map
                .read()
                .values()
                .filter(|r| r.destination().is_none() && is_usable(r, now_ms, margin))
                .count();

            for _ in usable..self.config.fallback_floor {
                let mut record = self.builder.build_zero_hop(kind, None, &policy, now_ms);
                if let Err(err) = handshake::complete_local(&mut record) {
                    error!(kind = %kind, error = %err, "Zero-hop circuit failed to complete");
                    break;
                }
                map.write().insert(record.id(), record);
                metrics::FALLBACK_CIRCUITS_BUILT.inc();
                added += 1;
            }
        }

        if added > 0 {
            info!(added, "Added zero-hop fallback circuits");
            self.update_gauges();
        }
        added
    }

    // ------------------------------------------------------------------
    // Failure and expiry
    // ------------------------------------------------------------------

    fn set_not_ready(&self, id: &TunnelId) -> Option<TunnelRecord> {
        for map in [&self.outbound, &self.free_inbound, &self.participating] {
            if let Some(record) = map.write().get_mut(id) {
                record.set_ready(false);
                return Some(record.clone());
            }
        }
        self.clients().iter().find_map(|c| c.set_not_ready(id))
    }

    /// Demote a circuit to not-ready and penalize every remote hop on it.
    pub fn mark_failed(&self, id: &TunnelId, now_ms: u64) -> bool {
        let Some(record) = self.set_not_ready(id) else {
            debug!(tunnel = %id, "Failed circuit is already gone");
            return false;
        };

        {
            let mut reputation = self.reputation.lock();
            for peer in record.peers() {
                reputation.record(peer, HopOutcome::CircuitFailed, Duration::ZERO, now_ms);
            }
        }
        metrics::CIRCUITS_FAILED.inc();
        warn!(tunnel = %id, hops = record.remote_hops(), "Circuit marked failed");

        self.ensure_minimum_fallback_circuits(now_ms);
        true
    }

    /// Penalize `peer` and demote every owned circuit routed through it.
    pub fn peer_failed(&self, peer: &PeerId, now_ms: u64) -> usize {
        self.reputation
            .lock()
            .record(peer, HopOutcome::CircuitFailed, Duration::ZERO, now_ms);

        let mut ids: Vec<TunnelId> = Vec::new();
        for map in [&self.outbound, &self.free_inbound] {
            ids.extend(
                map.read()
                    .values()
                    .filter(|r| r.contains_peer(peer))
                    .map(TunnelRecord::id),
            );
        }
        let clients = self.clients();
        for client in &clients {
            ids.extend(client.circuits_through(peer));
        }

        let demoted = ids
            .iter()
            .filter(|id| self.set_not_ready(id).is_some())
            .count();
        if demoted > 0 {
            metrics::CIRCUITS_FAILED.inc_by(demoted as u64);
            info!(peer = %peer, demoted, "Demoted circuits through failed peer");
            self.ensure_minimum_fallback_circuits(now_ms);
        }
        demoted
    }

    /// Whether any circuit, pending or participating included, uses `peer`.
    pub fn is_peer_in_use(&self, peer: &PeerId) -> bool {
        [&self.outbound, &self.free_inbound, &self.participating, &self.pending]
            .iter()
            .any(|map| map.read().values().any(|r| r.contains_peer(peer)))
            || self.clients().iter().any(|c| c.contains_peer(peer))
    }

    /// Drop expired circuits everywhere and destroy stopped, empty clients.
    pub fn expire(&self, now_ms: u64) -> usize {
        let mut removed = 0;
        for map in [&self.outbound, &self.free_inbound, &self.participating] {
            let mut map = map.write();
            let before = map.len();
            map.retain(|_, r| !r.is_expired(now_ms));
            removed += before - map.len();
        }

        let mut finished = Vec::new();
        for client in self.clients() {
            removed += client.expire(now_ms);
            if client.is_stopped() && client.is_empty() {
                finished.push(*client.destination());
            }
        }
        if !finished.is_empty() {
            let mut clients = self.clients.write();
            for destination in finished {
                // Re-check under the write lock; the client may have restarted
                let done = clients
                    .get(&destination)
                    .map(|c| c.is_stopped() && c.is_empty())
                    .unwrap_or(false);
                if done {
                    clients.remove(&destination);
                    info!(client = %destination, "Client pool destroyed");
                }
            }
        }

        if removed > 0 {
            metrics::CIRCUITS_EXPIRED.inc_by(removed as u64);
            debug!(removed, "Expired circuits");
        }
        self.ensure_minimum_fallback_circuits(now_ms);
        self.update_gauges();
        removed
    }

    // ------------------------------------------------------------------
    // Participation
    // ------------------------------------------------------------------

    /// Accept a circuit we only relay for.
    pub fn add_participating(&self, mut record: TunnelRecord, now_ms: u64) -> Result<(), JoinRejection> {
        let id = record.id();
        if record.is_expired(now_ms) {
            return Err(JoinRejection::Expired);
        }
        record.validate()?;
        if self.contains(&id) {
            return Err(JoinRejection::DuplicateId);
        }

        let mut participating = self.participating.write();
        if participating.len() >= self.config.max_participating {
            return Err(JoinRejection::Overloaded(self.config.max_participating));
        }
        if participating.contains_key(&id) {
            return Err(JoinRejection::DuplicateId);
        }
        record.set_ready(true);
        participating.insert(id, record);
        drop(participating);

        self.update_gauges();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    pub fn client(&self, destination: &Destination) -> Option<Arc<ClientCircuitPool>> {
        self.clients.read().get(destination).cloned()
    }

    pub fn clients(&self) -> Vec<Arc<ClientCircuitPool>> {
        self.clients.read().values().cloned().collect()
    }

    /// Create the client's pool, or reconfigure and restart an existing one.
    pub fn create_client(
        &self,
        destination: Destination,
        policy: ClientCircuitPolicy,
    ) -> Arc<ClientCircuitPool> {
        let mut clients = self.clients.write();
        if let Some(existing) = clients.get(&destination) {
            if !existing.reconfigure(policy) && existing.is_stopped() {
                existing.restart();
            }
            return existing.clone();
        }

        let client = Arc::new(ClientCircuitPool::new(destination, policy));
        clients.insert(destination, client.clone());
        drop(clients);

        info!(client = %destination, "Client pool created");
        self.update_gauges();
        client
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Point-in-time copy of every category.
    pub fn snapshot(&self) -> PoolSnapshot {
        let copy = |map: &CircuitMap| map.read().values().cloned().collect::<Vec<_>>();
        PoolSnapshot {
            free_inbound: copy(&self.free_inbound),
            outbound: copy(&self.outbound),
            participating: copy(&self.participating),
            pending: copy(&self.pending),
            clients: self
                .clients()
                .iter()
                .map(|client| ClientSnapshot {
                    destination: *client.destination(),
                    policy: client.policy().to_properties(),
                    active: client.active(),
                    inactive: client.inactive(),
                })
                .collect(),
        }
    }

    /// Re-populate from a snapshot. Expired and malformed records are
    /// skipped; pending circuits are dropped since their handshakes did not
    /// survive. Recovered clients restart with a forced lease refresh.
    ///
    /// Client blocks are restored first, so a circuit that also appears in
    /// the free inbound list stays bound to its client. Any id already
    /// restored is skipped, as is a record filed under the wrong category.
    pub fn restore(&self, snapshot: PoolSnapshot, now_ms: u64) -> RestoreReport {
        let mut report = RestoreReport::default();
        let mut seen = HashSet::new();

        let mut keep = |record: &TunnelRecord, kind: TunnelKind, report: &mut RestoreReport| {
            if record.kind() != kind {
                error!(
                    tunnel = %record.id(),
                    kind = ?record.kind(),
                    expected = ?kind,
                    "Persisted circuit filed under the wrong category, skipping"
                );
                report.skipped += 1;
                return false;
            }
            if seen.contains(&record.id()) || self.contains(&record.id()) {
                error!(tunnel = %record.id(), "Persisted circuit appears twice, skipping");
                report.skipped += 1;
                return false;
            }
            if record.is_expired(now_ms) {
                report.skipped += 1;
                return false;
            }
            if let Err(err) = record.validate() {
                error!(tunnel = %record.id(), error = %err, "Skipping malformed persisted circuit");
                report.skipped += 1;
                return false;
            }
            seen.insert(record.id());
            report.restored += 1;
            true
        };

        for block in snapshot.clients {
            let policy = ClientCircuitPolicy::from_properties(&block.policy);
            let client = Arc::new(ClientCircuitPool::new(block.destination, policy));
            for record in block.active {
                if keep(&record, TunnelKind::Inbound, &mut report) {
                    client.insert_active(record);
                }
            }
            for record in block.inactive {
                if keep(&record, TunnelKind::Inbound, &mut report) {
                    client.insert_inactive(record);
                }
            }
            client.restart();
            self.clients.write().insert(block.destination, client);
            report.clients += 1;
        }

        for record in snapshot.free_inbound {
            if record.destination().is_some() {
                error!(tunnel = %record.id(), "Persisted free circuit is bound, skipping");
                report.skipped += 1;
                continue;
            }
            if keep(&record, TunnelKind::Inbound, &mut report) {
                self.free_inbound.write().insert(record.id(), record);
            }
        }
        for (records, map, kind) in [
            (snapshot.outbound, &self.outbound, TunnelKind::Outbound),
            (snapshot.participating, &self.participating, TunnelKind::Participant),
        ] {
            for record in records {
                if keep(&record, kind, &mut report) {
                    map.write().insert(record.id(), record);
                }
            }
        }
        if !snapshot.pending.is_empty() {
            debug!(count = snapshot.pending.len(), "Dropping persisted pending circuits");
            report.skipped += snapshot.pending.len();
        }

        info!(
            restored = report.restored,
            skipped = report.skipped,
            clients = report.clients,
            "Tunnel pool restored"
        );
        self.update_gauges();
        report
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status(&self, now_ms: u64) -> PoolStatus {
        let line = |record: &TunnelRecord, category: &'static str| CircuitLine {
            id: record.id(),
            category,
            remote_hops: record.remote_hops(),
            remaining_secs: record.remaining_ms(now_ms) / 1_000,
            ready: record.is_ready(),
        };

        let mut circuits = Vec::new();
        for (map, category) in [
            (&self.outbound, "outbound"),
            (&self.free_inbound, "free"),
            (&self.participating, "participating"),
            (&self.pending, "pending"),
        ] {
            circuits.extend(map.read().values().map(|r| line(r, category)));
        }

        let clients = self
            .clients()
            .iter()
            .map(|client| {
                circuits.extend(client.active().iter().map(|r| line(r, "active")));
                circuits.extend(client.inactive().iter().map(|r| line(r, "inactive")));
                ClientStatus {
                    destination: *client.destination(),
                    stopped: client.is_stopped(),
                    active: client.active_count(),
                    inactive: client.inactive_count(),
                    lease: client.current_lease(),
                }
            })
            .collect();
        circuits.sort_by_key(|c| (c.category, c.remaining_secs));

        PoolStatus {
            outbound: self.outbound_count(),
            free_inbound: self.free_inbound_count(),
            participating: self.participating_count(),
            pending: self.pending_count(),
            clients,
            circuits,
        }
    }

    fn update_gauges(&self) {
        metrics::OUTBOUND_CIRCUITS.set(self.outbound_count() as i64);
        metrics::FREE_INBOUND_CIRCUITS.set(self.free_inbound_count() as i64);
        metrics::PARTICIPATING_CIRCUITS.set(self.participating_count() as i64);
        metrics::PENDING_CIRCUITS.set(self.pending_count() as i64);
        metrics::CLIENT_POOLS.set(self.clients.read().len() as i64);
    }
}

fn is_usable(record: &TunnelRecord, now_ms: u64, margin_ms: u64) -> bool {
    record.is_ready() && record.remaining_ms(now_ms) > margin_ms
}

#[derive(Debug, Clone)]
pub struct CircuitLine {
    pub id: TunnelId,
    pub category: &'static str,
    pub remote_hops: usize,
    pub remaining_secs: u64,
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub destination: Destination,
    pub stopped: bool,
    pub active: usize,
    pub inactive: usize,
    pub lease: Option<PublishedLease>,
}

/// Summary of the pool for operators.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub outbound: usize,
    pub free_inbound: usize,
    pub participating: usize,
    pub pending: usize,
    pub clients: Vec<ClientStatus>,
    pub circuits: Vec<CircuitLine>,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "circuits: outbound={} free_inbound={} participating={} pending={}",
            self.outbound, self.free_inbound, self.participating, self.pending
        )?;

        for client in &self.clients {
            let lease = match &client.lease {
                Some(lease) => format!("{} leases", lease.tunnels.len()),
                None => "no lease".to_string(),
            };
            writeln!(
                f,
                "client {}{}: active={} inactive={} {}",
                client.destination,
                if client.stopped { " (stopped)" } else { "" },
                client.active,
                client.inactive,
                lease
            )?;
        }

        for circuit in &self.circuits {
            writeln!(
                f,
                "  {:<14} {:<13} hops={} expires_in={}s{}",
                circuit.id.to_string(),
                circuit.category,
                circuit.remote_hops,
                circuit.remaining_secs,
                if circuit.ready { "" } else { " not-ready" }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::{
        selection::{PeerSelector, SelectionConfig},
        sim::{SimCrypto, SimNetwork},
    };

    /// Pool over a simulated network with `peers` known peers.
    pub fn make_pool(peers: usize) -> (Arc<SimNetwork>, Arc<TunnelPool>) {
        let network = SimNetwork::with_peers(peers);
        let reputation = Arc::new(Mutex::new(ReputationManager::new()));
        let selector = PeerSelector::new(
            SelectionConfig::default(),
            network.clone(),
            reputation.clone(),
        );
        let builder = Arc::new(TunnelBuilder::new(selector, Arc::new(SimCrypto::new()), 0.0));
        let pool = Arc::new(TunnelPool::new(builder, reputation, PoolConfig::default()));
        (network, pool)
    }

    /// Insert a record straight into pending and complete it.
    pub fn insert_built(pool: &TunnelPool, record: TunnelRecord) -> TunnelId {
        let id = record.id();
        assert!(pool.add_pending(record));
        assert!(pool.build_succeeded(&id));
        id
    }
}
