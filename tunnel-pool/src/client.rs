// Copyright (c) 2024 Botho Foundation

//! Per-destination circuit pools.
//!
//! A [`ClientCircuitPool`] holds the inbound circuits bound to one local
//! client. Active circuits are lease candidates; inactive ones were pushed
//! out of a lease and are only kept until they expire. A pool is created when
//! the client first asks for circuits, stopped when the client disconnects
//! and destroyed by the pool once it is stopped and empty.
//!
//! Lock order: `active` before `inactive`, and both before `lease`.

use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, info};

use crate::{
    policy::ClientCircuitPolicy,
    record::TunnelRecord,
    types::{Destination, TunnelId},
};

/// The lease a client last accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedLease {
    pub tunnels: Vec<TunnelId>,
    pub max_expiration_ms: u64,
    pub published_ms: u64,
}

#[derive(Debug, Default)]
struct LeaseState {
    current: Option<PublishedLease>,
    force_refresh: bool,
}

pub struct ClientCircuitPool {
    destination: Destination,
    policy: RwLock<ClientCircuitPolicy>,
    active: RwLock<HashMap<TunnelId, TunnelRecord>>,
    inactive: RwLock<HashMap<TunnelId, TunnelRecord>>,
    stopped: AtomicBool,
    lease: Mutex<LeaseState>,
}

impl ClientCircuitPool {
    pub fn new(destination: Destination, policy: ClientCircuitPolicy) -> Self {
        Self {
            destination,
            policy: RwLock::new(policy),
            active: RwLock::new(HashMap::new()),
            inactive: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            lease: Mutex::new(LeaseState::default()),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn policy(&self) -> ClientCircuitPolicy {
        self.policy.read().clone()
    }

    /// Replace the policy and restart. Returns `false` if nothing changed.
    pub fn reconfigure(&self, policy: ClientCircuitPolicy) -> bool {
        {
            let mut current = self.policy.write();
            if *current == policy {
                return false;
            }
            *current = policy;
        }
        info!(client = %self.destination, "Client policy changed, restarting pool");
        self.restart();
        true
    }

    /// Stop requesting circuits; existing ones are kept until they expire.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!(client = %self.destination, "Client pool stopped");
        }
    }

    /// Resume and republish the lease at the next check.
    pub fn restart(&self) {
        self.stopped.store(false, Ordering::Release);
        self.request_refresh();
        debug!(client = %self.destination, "Client pool running");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn insert_active(&self, record: TunnelRecord) {
        self.active.write().insert(record.id(), record);
    }

    pub(crate) fn insert_inactive(&self, record: TunnelRecord) {
        self.inactive.write().insert(record.id(), record);
    }

    pub fn active(&self) -> Vec<TunnelRecord> {
        self.active.read().values().cloned().collect()
    }

    pub fn inactive(&self) -> Vec<TunnelRecord> {
        self.inactive.read().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn inactive_count(&self) -> usize {
        self.inactive.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty() && self.inactive.read().is_empty()
    }

    pub fn contains(&self, id: &TunnelId) -> bool {
        self.active.read().contains_key(id) || self.inactive.read().contains_key(id)
    }

    pub fn get(&self, id: &TunnelId) -> Option<TunnelRecord> {
        if let Some(record) = self.active.read().get(id) {
            return Some(record.clone());
        }
        self.inactive.read().get(id).cloned()
    }

    pub fn contains_peer(&self, peer: &PeerId) -> bool {
        self.active.read().values().any(|r| r.contains_peer(peer))
            || self.inactive.read().values().any(|r| r.contains_peer(peer))
    }

    /// Ids of circuits routed through `peer`.
    pub fn circuits_through(&self, peer: &PeerId) -> Vec<TunnelId> {
        let active = self.active.read();
        let inactive = self.inactive.read();
        active
            .values()
            .chain(inactive.values())
            .filter(|r| r.contains_peer(peer))
            .map(TunnelRecord::id)
            .collect()
    }

    /// Active circuits that are ready and outlive `now + margin`.
    pub fn safe_count(&self, now_ms: u64, margin_ms: u64) -> usize {
        self.active
            .read()
            .values()
            .filter(|r| r.is_ready() && r.expiration_ms() >= now_ms.saturating_add(margin_ms))
            .count()
    }

    /// Move circuits from the active to the inactive map.
    pub(crate) fn demote(&self, ids: &[TunnelId]) -> usize {
        let mut active = self.active.write();
        let mut inactive = self.inactive.write();
        let mut moved = 0;
        for id in ids {
            if let Some(record) = active.remove(id) {
                inactive.insert(*id, record);
                moved += 1;
            }
        }
        moved
    }

    /// Mark a circuit not ready, returning a copy for reliability accounting.
    pub(crate) fn set_not_ready(&self, id: &TunnelId) -> Option<TunnelRecord> {
        let mut active = self.active.write();
        let mut inactive = self.inactive.write();
        let record = active.get_mut(id).or_else(|| inactive.get_mut(id))?;
        record.set_ready(false);
        Some(record.clone())
    }

    /// Drop expired circuits from both maps.
    pub(crate) fn expire(&self, now_ms: u64) -> usize {
        let mut removed = 0;
        for map in [&self.active, &self.inactive] {
            let mut map = map.write();
            let before = map.len();
            map.retain(|_, r| !r.is_expired(now_ms));
            removed += before - map.len();
        }
        if removed > 0 {
            debug!(client = %self.destination, removed, "Expired client circuits");
        }
        removed
    }

    pub fn current_lease(&self) -> Option<PublishedLease> {
        self.lease.lock().current.clone()
    }

    pub fn request_refresh(&self) {
        self.lease.lock().force_refresh = true;
    }

    pub fn refresh_requested(&self) -> bool {
        self.lease.lock().force_refresh
    }

    pub(crate) fn lease_published(&self, lease: PublishedLease) {
        let mut state = self.lease.lock();
        state.current = Some(lease);
        state.force_refresh = false;
    }
}
