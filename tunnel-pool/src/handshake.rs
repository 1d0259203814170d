// Copyright (c) 2024 Botho Foundation

//! Circuit request protocol.
//!
//! Hops are asked to join one at a time, innermost first, so every request
//! can travel through hops that have already agreed:
//!
//! ```text
//!   inbound [h0 gateway, h1, h2, local]     requests: h2, h1, h0
//!   outbound [local, h1, h2 endpoint]       requests: h2, h1
//!
//!   Router                 carrier (outbound)              Hop
//!     │                                                    │
//!     │── wrap(JoinRequest{nonce, reply_via}) ───────────▶ │
//!     │                                                    │
//!     │ ◀──────────── wrap(JoinReply{nonce, status}) ──────│
//!     │              (back through reply_via inbound)      │
//! ```
//!
//! The first rejection or timeout ends the build; no further hop is asked.
//! The whole handshake is bounded by `hop_timeout × remote_hops`.
//!
//! [`CircuitRequest`] is the pure state machine; [`CircuitRequestProtocol`]
//! drives it against the collaborators. Dropping an in-flight
//! [`CircuitRequestProtocol::execute`] future abandons the build and releases
//! its pending entry and reply nonces.

use libp2p::PeerId;
use parking_lot::Mutex;
use rand::Rng;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{
    config::HandshakeConfig,
    error::{BuildError, CryptoError, TransportError},
    messages::{JoinReply, JoinRequest, JoinStatus, TunnelMessage},
    metrics,
    pool::TunnelPool,
    record::TunnelRecord,
    reputation::HopOutcome,
    selector::{SelectionCriteria, TunnelSelector},
    traits::{CryptoEngine, MessageTransport, PeerLookup},
    types::{now_ms, TunnelId, TunnelKind},
};

/// How often a hop request is re-sent when its carrier circuit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total sends per hop, the first one included.
    pub max_send_attempts: u32,
    /// Delay before retry `n` is `backoff × n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_send_attempts: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Whether another send may follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_send_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// Where a circuit request stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    NotStarted,
    /// About to send the join request to hop `i`.
    RequestingHop(usize),
    /// Join request to hop `i` sent, reply outstanding.
    WaitingReply(usize),
    HopAccepted(usize),
    Succeeded,
    Failed(BuildError),
}

impl RequestState {
    pub fn is_finished(&self) -> bool {
        matches!(self, RequestState::Succeeded | RequestState::Failed(_))
    }
}

/// State machine over one circuit's hops, innermost first.
#[derive(Debug, Clone)]
pub struct CircuitRequest {
    circuit: TunnelId,
    order: Vec<usize>,
    step: usize,
    state: RequestState,
    history: Vec<RequestState>,
}

impl CircuitRequest {
    pub fn new(record: &TunnelRecord) -> Self {
        Self {
            circuit: record.id(),
            order: (0..record.hops().len()).rev().collect(),
            step: 0,
            state: RequestState::NotStarted,
            history: Vec::new(),
        }
    }

    pub fn circuit(&self) -> TunnelId {
        self.circuit
    }

    pub fn state(&self) -> &RequestState {
        &self.state
    }

    /// Hop indices in request order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Every state entered so far, the current one included.
    pub fn history(&self) -> &[RequestState] {
        &self.history
    }

    /// Hop currently being requested, if the machine is at that step.
    pub fn requesting_hop(&self) -> Option<usize> {
        match self.state {
            RequestState::RequestingHop(index) => Some(index),
            _ => None,
        }
    }

    fn enter(&mut self, state: RequestState) {
        trace!(tunnel = %self.circuit, state = ?state, "Circuit request transition");
        self.history.push(state.clone());
        self.state = state;
    }

    pub fn start(&mut self) {
        if self.state != RequestState::NotStarted {
            return;
        }
        match self.order.first() {
            Some(&first) => self.enter(RequestState::RequestingHop(first)),
            None => self.enter(RequestState::Failed(BuildError::InsufficientPeers {
                needed: 1,
                available: 0,
            })),
        }
    }

    pub fn request_sent(&mut self) {
        if let RequestState::RequestingHop(index) = self.state {
            self.enter(RequestState::WaitingReply(index));
        }
    }

    /// The current hop agreed; move on to the next one or finish.
    pub fn hop_accepted(&mut self) {
        let index = match self.state {
            RequestState::RequestingHop(index) | RequestState::WaitingReply(index) => index,
            _ => return,
        };
        self.enter(RequestState::HopAccepted(index));
        self.step += 1;
        match self.order.get(self.step) {
            Some(&next) => self.enter(RequestState::RequestingHop(next)),
            None => self.enter(RequestState::Succeeded),
        }
    }

    pub fn fail(&mut self, err: BuildError) {
        if !self.state.is_finished() {
            self.enter(RequestState::Failed(err));
        }
    }
}

/// Run the request machine for a circuit made of the local router only and
/// mark it ready.
pub fn complete_local(record: &mut TunnelRecord) -> Result<(), BuildError> {
    let mut request = CircuitRequest::new(record);
    request.start();
    while let Some(index) = request.requesting_hop() {
        if record.hops()[index].is_local() {
            request.hop_accepted();
        } else {
            request.fail(BuildError::Transport(format!(
                "hop {index} of a local-only circuit is remote"
            )));
        }
    }

    match request.state() {
        RequestState::Succeeded => {
            record.set_ready(true);
            Ok(())
        }
        RequestState::Failed(err) => Err(err.clone()),
        _ => Err(BuildError::Cancelled),
    }
}

/// Outstanding reply nonces, keyed to the circuit being built.
#[derive(Debug, Default)]
pub struct ReplyRegistry {
    outstanding: Mutex<HashMap<u64, TunnelId>>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh nonce for `circuit`; released when the guard drops.
    pub fn register(self: &Arc<Self>, circuit: TunnelId) -> PendingReply {
        let mut rng = rand::thread_rng();
        let mut outstanding = self.outstanding.lock();
        let nonce = loop {
            let nonce: u64 = rng.gen();
            if !outstanding.contains_key(&nonce) {
                break nonce;
            }
        };
        outstanding.insert(nonce, circuit);
        PendingReply {
            registry: self.clone(),
            nonce,
        }
    }

    pub fn circuit_for(&self, nonce: u64) -> Option<TunnelId> {
        self.outstanding.lock().get(&nonce).copied()
    }

    pub fn len(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.lock().is_empty()
    }
}

/// A reserved reply nonce.
#[derive(Debug)]
pub struct PendingReply {
    registry: Arc<ReplyRegistry>,
    nonce: u64,
}

impl PendingReply {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.outstanding.lock().remove(&self.nonce);
    }
}

/// Removes the circuit from `pending` unless the build reached a verdict.
struct PendingGuard {
    pool: Arc<TunnelPool>,
    id: TunnelId,
    armed: bool,
}

impl PendingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed && self.pool.remove_pending(&self.id).is_some() {
            debug!(tunnel = %self.id, "Abandoned circuit build released");
        }
    }
}

/// Drives [`CircuitRequest`]s over the network.
pub struct CircuitRequestProtocol {
    pool: Arc<TunnelPool>,
    selector: TunnelSelector,
    transport: Arc<dyn MessageTransport>,
    crypto: Arc<dyn CryptoEngine>,
    lookup: Arc<dyn PeerLookup>,
    replies: Arc<ReplyRegistry>,
    hop_timeout: Duration,
    retry: RetryPolicy,
    local_peer: PeerId,
}

impl CircuitRequestProtocol {
    pub fn new(
        pool: Arc<TunnelPool>,
        selector: TunnelSelector,
        transport: Arc<dyn MessageTransport>,
        crypto: Arc<dyn CryptoEngine>,
        lookup: Arc<dyn PeerLookup>,
        config: &HandshakeConfig,
        local_peer: PeerId,
    ) -> Self {
        Self {
            pool,
            selector,
            transport,
            crypto,
            lookup,
            replies: Arc::new(ReplyRegistry::new()),
            hop_timeout: config.hop_timeout(),
            retry: config.retry_policy(),
            local_peer,
        }
    }

    pub fn replies(&self) -> &Arc<ReplyRegistry> {
        &self.replies
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Deadline for the whole handshake of `record`.
    pub fn overall_timeout(&self, record: &TunnelRecord) -> Duration {
        self.hop_timeout
            .saturating_mul(record.remote_hops().max(1) as u32)
    }

    /// Register `record` as pending and build it.
    ///
    /// On success the circuit is ready in the pool; on failure it is gone
    /// from `pending` and the fallback floor has been checked.
    pub async fn execute(&self, record: TunnelRecord) -> Result<TunnelId, BuildError> {
        let id = record.id();
        if !self.pool.add_pending(record.clone()) {
            return Err(BuildError::NotRegistered(id));
        }
        let guard = PendingGuard {
            pool: self.pool.clone(),
            id,
            armed: true,
        };

        let started = Instant::now();
        let overall = self.overall_timeout(&record);
        let mut request = CircuitRequest::new(&record);
        if tokio::time::timeout(overall, self.drive(&record, &mut request))
            .await
            .is_err()
        {
            request.fail(BuildError::OverallTimeout(overall));
        }
        guard.disarm();

        match request.state().clone() {
            RequestState::Succeeded => {
                if !self.pool.build_succeeded(&id) {
                    return Err(BuildError::Cancelled);
                }
                let elapsed = started.elapsed();
                metrics::CIRCUITS_BUILT.inc();
                metrics::BUILD_LATENCY.observe(elapsed.as_secs_f64());
                info!(
                    tunnel = %id,
                    hops = record.remote_hops(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Circuit built"
                );
                Ok(id)
            }
            RequestState::Failed(err) => {
                self.pool.build_failed(&id, now_ms());
                metrics::BUILD_FAILURES.inc();
                warn!(tunnel = %id, error = %err, "Circuit build failed");
                Err(err)
            }
            _ => {
                self.pool.build_failed(&id, now_ms());
                Err(BuildError::Cancelled)
            }
        }
    }

    async fn drive(&self, record: &TunnelRecord, request: &mut CircuitRequest) {
        request.start();
        while let Some(index) = request.requesting_hop() {
            let Some(peer) = record.hops()[index].peer else {
                trace!(tunnel = %record.id(), hop = index, "Local hop accepted");
                request.hop_accepted();
                continue;
            };

            request.request_sent();
            match self.request_hop(record, index, peer).await {
                Ok(latency) => {
                    self.pool
                        .reputation()
                        .lock()
                        .record(&peer, HopOutcome::Accepted, latency, now_ms());
                    debug!(
                        tunnel = %record.id(),
                        hop = index,
                        peer = %peer,
                        latency_ms = latency.as_millis() as u64,
                        "Hop accepted"
                    );
                    request.hop_accepted();
                }
                Err(err) => {
                    let outcome = match &err {
                        BuildError::Rejected { .. } | BuildError::MalformedReply(_) => {
                            Some(HopOutcome::Rejected)
                        }
                        BuildError::HopTimeout(_) => Some(HopOutcome::TimedOut),
                        _ => None,
                    };
                    if let Some(outcome) = outcome {
                        self.pool
                            .reputation()
                            .lock()
                            .record(&peer, outcome, Duration::ZERO, now_ms());
                    }
                    debug!(tunnel = %record.id(), hop = index, peer = %peer, error = %err, "Hop failed");
                    request.fail(err);
                }
            }
        }
    }

    /// Ask one remote hop to join; returns the round-trip time.
    async fn request_hop(
        &self,
        record: &TunnelRecord,
        index: usize,
        peer: PeerId,
    ) -> Result<Duration, BuildError> {
        if self.lookup.lookup_known(&peer).is_none() {
            return Err(BuildError::UnknownPeer(peer));
        }

        let mut tried: Vec<TunnelId> = Vec::new();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (carrier, reply_via) = self.pick_carriers(&tried)?;
            let reply = self.replies.register(record.id());
            let message = TunnelMessage::JoinRequest(self.join_request(
                record,
                index,
                reply.nonce(),
                reply_via,
            ));
            let payload = self.crypto.wrap(&peer, &message.encode());

            metrics::HOP_REQUESTS_SENT.inc();
            trace!(
                tunnel = %record.id(),
                hop = index,
                peer = %peer,
                carrier = %carrier,
                reply_via = %reply_via,
                attempt,
                "Sending join request"
            );
            let sent_at = Instant::now();
            let sent = tokio::time::timeout(
                self.hop_timeout,
                self.transport.send_through_circuit(
                    carrier,
                    peer,
                    payload,
                    reply_via,
                    self.hop_timeout,
                ),
            )
            .await;

            match sent {
                Ok(Ok(bytes)) => {
                    self.check_reply(&peer, reply.nonce(), &bytes)?;
                    return Ok(sent_at.elapsed());
                }
                Err(_) | Ok(Err(TransportError::Timeout)) => {
                    metrics::HOP_TIMEOUTS.inc();
                    return Err(BuildError::HopTimeout(peer));
                }
                Ok(Err(err)) if self.retry.should_retry(attempt) => {
                    debug!(
                        tunnel = %record.id(),
                        peer = %peer,
                        carrier = %carrier,
                        attempt,
                        error = %err,
                        "Carrier failed, retrying with another"
                    );
                    tried.push(carrier);
                    drop(reply);
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Ok(Err(err)) => return Err(BuildError::Transport(err.to_string())),
            }
        }
    }

    /// One outbound circuit to carry the request and one inbound circuit for
    /// the reply.
    fn pick_carriers(&self, tried: &[TunnelId]) -> Result<(TunnelId, TunnelId), BuildError> {
        let now = now_ms();
        let outbound = SelectionCriteria::new(1).excluding(tried.iter().copied());
        let carrier = self
            .selector
            .select(&self.pool, TunnelKind::Outbound, &outbound, now)
            .into_iter()
            .next()
            .ok_or(BuildError::NoCarrierCircuit)?;
        let reply_via = self
            .selector
            .select(&self.pool, TunnelKind::Inbound, &SelectionCriteria::new(1), now)
            .into_iter()
            .next()
            .ok_or(BuildError::NoCarrierCircuit)?;
        Ok((carrier, reply_via))
    }

    fn join_request(
        &self,
        record: &TunnelRecord,
        index: usize,
        nonce: u64,
        reply_via: TunnelId,
    ) -> JoinRequest {
        let hop = &record.hops()[index];
        let next = record.next_hop(index);
        JoinRequest {
            circuit: record.id(),
            receive_id: hop.receive_id,
            next_peer: next.map(|h| h.peer.unwrap_or(self.local_peer)),
            next_receive_id: next.map(|h| h.receive_id),
            settings: record.settings().clone(),
            housekeeping_key: hop.housekeeping_key.duplicate(),
            layer_key: hop.encryption_key.as_ref().map(|k| k.duplicate()),
            is_gateway: index == 0,
            is_endpoint: index + 1 == record.hops().len(),
            reply_nonce: nonce,
            reply_via,
        }
    }

    fn check_reply(&self, peer: &PeerId, nonce: u64, bytes: &[u8]) -> Result<(), BuildError> {
        let opened = self.crypto.unwrap(peer, bytes).map_err(|err| match err {
            CryptoError::BadSignature => BuildError::Rejected {
                peer: *peer,
                status: JoinStatus::CertificateRejected,
            },
            _ => BuildError::MalformedReply(*peer),
        })?;

        match TunnelMessage::decode(&opened) {
            Ok(TunnelMessage::JoinReply(JoinReply { nonce: n, status })) if n == nonce => {
                if status.is_accepted() {
                    Ok(())
                } else {
                    Err(BuildError::Rejected {
                        peer: *peer,
                        status,
                    })
                }
            }
            _ => Err(BuildError::MalformedReply(*peer)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_utils::make_record;

    #[test]
    fn test_request_order_is_innermost_first() {
        let record = make_record(TunnelKind::Inbound, 3, 10_000);
        let request = CircuitRequest::new(&record);
        assert_eq!(request.order(), &[3, 2, 1, 0]);
    }

    #[test]
    fn test_machine_walks_all_hops() {
        let record = make_record(TunnelKind::Outbound, 2, 10_000);
        let mut request = CircuitRequest::new(&record);
        request.start();
        assert_eq!(request.state(), &RequestState::RequestingHop(2));

        request.request_sent();
        assert_eq!(request.state(), &RequestState::WaitingReply(2));
        request.hop_accepted();
        assert_eq!(request.state(), &RequestState::RequestingHop(1));
        request.request_sent();
        request.hop_accepted();
        request.hop_accepted();

        assert_eq!(request.state(), &RequestState::Succeeded);
        assert!(request.history().contains(&RequestState::HopAccepted(0)));
    }

    #[test]
    fn test_failure_is_terminal() {
        let record = make_record(TunnelKind::Inbound, 2, 10_000);
        let mut request = CircuitRequest::new(&record);
        request.start();
        request.request_sent();
        request.fail(BuildError::NoCarrierCircuit);

        request.hop_accepted();
        request.fail(BuildError::Cancelled);
        assert_eq!(
            request.state(),
            &RequestState::Failed(BuildError::NoCarrierCircuit)
        );
        assert_eq!(request.requesting_hop(), None);
    }

    #[test]
    fn test_complete_local() {
        let mut record = make_record(TunnelKind::Inbound, 0, 10_000);
        complete_local(&mut record).unwrap();
        assert!(record.is_ready());

        let mut remote = make_record(TunnelKind::Inbound, 1, 10_000);
        assert!(matches!(
            complete_local(&mut remote),
            Err(BuildError::Transport(_))
        ));
        assert!(!remote.is_ready());
    }

    #[test]
    fn test_reply_registry_releases_on_drop() {
        let registry = Arc::new(ReplyRegistry::new());
        let circuit = TunnelId::new(5, TunnelKind::Inbound);
        let a = registry.register(circuit);
        let b = registry.register(circuit);

        assert_ne!(a.nonce(), b.nonce());
        assert_eq!(registry.circuit_for(a.nonce()), Some(circuit));
        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy {
            max_send_attempts: 3,
            backoff: Duration::from_millis(100),
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
    }
}
