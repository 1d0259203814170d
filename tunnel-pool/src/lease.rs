// Copyright (c) 2024 Botho Foundation

//! Lease publication for client pools.
//!
//! A lease is only ever requested for the full number of inbound circuits
//! the client asked for. Once one is published it is replaced only when
//!
//! - a better circuit appeared (one not in the lease that expires strictly
//!   later than everything in it),
//! - the lease is older than the policy's circuit duration, or
//! - a refresh was forced (reconnect, policy change, restore).

use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    client::{ClientCircuitPool, PublishedLease},
    error::LeaseError,
    metrics,
    record::TunnelRecord,
    traits::{Lease, LeasePublisher, LeaseSet},
    types::TunnelId,
};

/// What the lease check wants to do for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// Fewer safe circuits than wanted; nothing is published.
    Insufficient { safe: usize, wanted: usize },
    UpToDate,
    Publish {
        lease_set: LeaseSet,
        /// Safe circuits left out of the lease.
        demote: Vec<TunnelId>,
        reason: &'static str,
    },
}

/// Decide whether `client` needs a new lease at `now_ms`.
pub fn evaluate(client: &ClientCircuitPool, now_ms: u64, margin_ms: u64) -> LeaseDecision {
    let policy = client.policy();
    let wanted = policy.inbound_quantity;
    if wanted == 0 {
        return LeaseDecision::UpToDate;
    }

    let floor = now_ms.saturating_add(margin_ms);
    let mut safe: Vec<TunnelRecord> = client
        .active()
        .into_iter()
        .filter(|r| r.is_ready() && r.expiration_ms() >= floor)
        .collect();
    if safe.len() < wanted {
        return LeaseDecision::Insufficient {
            safe: safe.len(),
            wanted,
        };
    }

    safe.sort_by(|a, b| b.expiration_ms().cmp(&a.expiration_ms()));
    let excess = safe.split_off(wanted);

    let reason = match client.current_lease() {
        None => "initial",
        Some(_) if client.refresh_requested() => "forced",
        Some(current) if now_ms.saturating_sub(current.published_ms) >= policy.duration_ms => {
            "aged"
        }
        Some(current)
            if safe.iter().any(|r| {
                !current.tunnels.contains(&r.id()) && r.expiration_ms() > current.max_expiration_ms
            }) =>
        {
            "newer circuits"
        }
        Some(_) => return LeaseDecision::UpToDate,
    };

    LeaseDecision::Publish {
        lease_set: LeaseSet {
            destination: *client.destination(),
            leases: safe.iter().map(lease_for).collect(),
            created_ms: now_ms,
        },
        demote: excess.iter().map(TunnelRecord::id).collect(),
        reason,
    }
}

fn lease_for(record: &TunnelRecord) -> Lease {
    Lease {
        tunnel: record.id(),
        gateway: record.gateway().copied(),
        gateway_receive_id: record.hops().first().map(|h| h.receive_id).unwrap_or(0),
        end_ms: record.expiration_ms(),
    }
}

/// Result of one lease check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseCheck {
    Stopped,
    Insufficient { safe: usize, wanted: usize },
    UpToDate,
    Published { leases: usize, demoted: usize },
    Failed(LeaseError),
}

/// Runs [`evaluate`] and talks to the lease collaborator.
pub struct LeaseManager {
    publisher: Arc<dyn LeasePublisher>,
    request_timeout: Duration,
    margin_ms: u64,
}

impl LeaseManager {
    pub fn new(publisher: Arc<dyn LeasePublisher>, request_timeout: Duration, margin_ms: u64) -> Self {
        Self {
            publisher,
            request_timeout,
            margin_ms,
        }
    }

    pub async fn check(&self, client: &ClientCircuitPool, now_ms: u64) -> LeaseCheck {
        if client.is_stopped() {
            return LeaseCheck::Stopped;
        }

        let (lease_set, demote, reason) = match evaluate(client, now_ms, self.margin_ms) {
            LeaseDecision::Insufficient { safe, wanted } => {
                debug!(client = %client.destination(), safe, wanted, "Not enough circuits for a lease");
                return LeaseCheck::Insufficient { safe, wanted };
            }
            LeaseDecision::UpToDate => return LeaseCheck::UpToDate,
            LeaseDecision::Publish {
                lease_set,
                demote,
                reason,
            } => (lease_set, demote, reason),
        };

        let published = PublishedLease {
            tunnels: lease_set.leases.iter().map(|l| l.tunnel).collect(),
            max_expiration_ms: lease_set.max_expiration_ms(),
            published_ms: now_ms,
        };
        let leases = published.tunnels.len();

        let request = self
            .publisher
            .request_lease(client.destination(), lease_set, self.request_timeout);
        let outcome = tokio::time::timeout(self.request_timeout, request)
            .await
            .unwrap_or(Err(LeaseError::Timeout));

        match outcome {
            Ok(()) => {
                client.lease_published(published);
                let demoted = client.demote(&demote);
                metrics::LEASES_PUBLISHED.inc();
                info!(client = %client.destination(), leases, demoted, reason, "Lease published");
                LeaseCheck::Published { leases, demoted }
            }
            Err(err) => {
                metrics::LEASES_REJECTED.inc();
                warn!(client = %client.destination(), error = %err, "Lease request failed");
                LeaseCheck::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        policy::ClientCircuitPolicy, record::test_utils::make_ready, sim::SimNetwork,
        types::{Destination, TunnelKind},
    };

    const MARGIN: u64 = 1_000;

    fn client(wanted: usize) -> ClientCircuitPool {
        ClientCircuitPool::new(
            Destination::random(&mut rand::thread_rng()),
            ClientCircuitPolicy {
                inbound_quantity: wanted,
                duration_ms: 60_000,
                ..Default::default()
            },
        )
    }

    fn add(client: &ClientCircuitPool, expiration_ms: u64) -> TunnelId {
        let record = make_ready(TunnelKind::Inbound, 2, expiration_ms);
        let id = record.id();
        client.insert_active(record);
        id
    }

    fn publish(client: &ClientCircuitPool, now_ms: u64) {
        match evaluate(client, now_ms, MARGIN) {
            LeaseDecision::Publish {
                lease_set, demote, ..
            } => {
                client.lease_published(PublishedLease {
                    tunnels: lease_set.leases.iter().map(|l| l.tunnel).collect(),
                    max_expiration_ms: lease_set.max_expiration_ms(),
                    published_ms: now_ms,
                });
                client.demote(&demote);
            }
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[test]
    fn test_insufficient_never_publishes() {
        let client = client(2);
        add(&client, 50_000);
        add(&client, 500);

        assert_eq!(
            evaluate(&client, 0, MARGIN),
            LeaseDecision::Insufficient { safe: 1, wanted: 2 }
        );
    }

    #[test]
    fn test_picks_latest_expiring_and_demotes_rest() {
        let client = client(2);
        let early = add(&client, 10_000);
        let mid = add(&client, 20_000);
        let late = add(&client, 30_000);

        match evaluate(&client, 0, MARGIN) {
            LeaseDecision::Publish {
                lease_set,
                demote,
                reason,
            } => {
                let ids: Vec<_> = lease_set.leases.iter().map(|l| l.tunnel).collect();
                assert_eq!(ids, vec![late, mid]);
                assert_eq!(demote, vec![early]);
                assert_eq!(reason, "initial");
                assert!(lease_set.leases.iter().all(|l| l.gateway.is_some()));
                assert_eq!(lease_set.max_expiration_ms(), 30_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_no_republish_without_strictly_later_circuit() {
        let client = client(1);
        add(&client, 30_000);
        publish(&client, 0);

        // Same expiration is not better
        add(&client, 30_000);
        assert_eq!(evaluate(&client, 100, MARGIN), LeaseDecision::UpToDate);

        add(&client, 30_001);
        assert!(matches!(
            evaluate(&client, 100, MARGIN),
            LeaseDecision::Publish {
                reason: "newer circuits",
                ..
            }
        ));
    }

    #[test]
    fn test_republish_when_aged_or_forced() {
        let client = client(1);
        add(&client, 200_000);
        publish(&client, 0);
        assert_eq!(evaluate(&client, 59_999, MARGIN), LeaseDecision::UpToDate);
        assert!(matches!(
            evaluate(&client, 60_000, MARGIN),
            LeaseDecision::Publish { reason: "aged", .. }
        ));

        client.request_refresh();
        assert!(matches!(
            evaluate(&client, 10, MARGIN),
            LeaseDecision::Publish { reason: "forced", .. }
        ));
    }

    #[tokio::test]
    async fn test_manager_publishes_and_demotes() {
        let network = SimNetwork::new();
        let manager = LeaseManager::new(network.clone(), Duration::from_secs(1), MARGIN);
        let client = client(1);
        add(&client, 10_000);
        add(&client, 20_000);

        assert_eq!(
            manager.check(&client, 0).await,
            LeaseCheck::Published {
                leases: 1,
                demoted: 1
            }
        );
        assert_eq!(client.active_count(), 1);
        assert_eq!(client.inactive_count(), 1);
        assert_eq!(network.published_leases().len(), 1);
        assert_eq!(manager.check(&client, 0).await, LeaseCheck::UpToDate);
    }

    #[tokio::test]
    async fn test_manager_rejection_keeps_state() {
        let network = SimNetwork::new();
        network.set_reject_leases(true);
        let manager = LeaseManager::new(network.clone(), Duration::from_secs(1), MARGIN);
        let client = client(1);
        add(&client, 10_000);
        add(&client, 20_000);

        assert!(matches!(
            manager.check(&client, 0).await,
            LeaseCheck::Failed(LeaseError::Rejected(_))
        ));
        assert!(client.current_lease().is_none());
        assert_eq!(client.active_count(), 2);

        client.stop();
        assert_eq!(manager.check(&client, 0).await, LeaseCheck::Stopped);
    }

    /// Never answers a lease request.
    struct SilentPublisher;

    #[async_trait::async_trait]
    impl LeasePublisher for SilentPublisher {
        async fn request_lease(
            &self,
            _destination: &Destination,
            _lease_set: LeaseSet,
            _timeout: Duration,
        ) -> Result<(), LeaseError> {
            futures::future::pending().await
        }

        fn is_connected(&self, _destination: &Destination) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let manager = LeaseManager::new(Arc::new(SilentPublisher), Duration::from_secs(5), MARGIN);
        let client = client(1);
        add(&client, 10_000);

        let started = tokio::time::Instant::now();
        assert_eq!(
            manager.check(&client, 0).await,
            LeaseCheck::Failed(LeaseError::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(client.current_lease().is_none());
        assert_eq!(client.active_count(), 1);
    }
}
