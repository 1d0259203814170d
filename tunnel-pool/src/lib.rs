// Copyright (c) 2024 Botho Foundation

//! Tunnel lifecycle engine.
//!
//! Builds, tests, allocates and expires the multi-hop circuits a router uses
//! for its own traffic, and decides which circuits it relays for others.
//!
//! # Architecture
//!
//! ```text
//!                    TunnelManagerFacade
//!                            │
//!   Maintenance ─────────────┼──────────────────────────┐
//!     │ pool manager         │ select_*                 │ lease check
//!     ▼                      ▼                          ▼
//!   TunnelBuilder       TunnelSelector             LeaseManager
//!     │ (PeerSelector)       │                          │
//!     ▼                      ▼                          ▼
//!   CircuitRequestProtocol ─▶ TunnelPool ───────▶ ClientCircuitPool
//!                            ▲
//!   TunnelTester ── mark_failed
//!
//!   seams: PeerLookup, MessageTransport, CryptoEngine, LeasePublisher
//! ```
//!
//! The router plugs its network database, transport, crypto and client
//! connections in through the traits in [`traits`]; [`sim`] provides an
//! in-memory implementation of all of them.
//!
//! # Example
//!
//! ```
//! use bth_tunnel_pool::{
//!     Collaborators, SelectionCriteria, SimNetwork, TunnelConfig, TunnelManagerFacade,
//! };
//! use libp2p::PeerId;
//!
//! let network = SimNetwork::with_peers(5);
//! let facade = TunnelManagerFacade::new(
//!     TunnelConfig::default(),
//!     PeerId::random(),
//!     Collaborators::simulated(&network),
//! );
//!
//! // Without any built circuits the selector falls back to zero-hop ones
//! let outbound = facade.select_outbound(&SelectionCriteria::new(2));
//! assert_eq!(outbound.len(), 2);
//! ```

#![deny(clippy::print_stdout)]

pub mod builder;
pub mod client;
pub mod config;
pub mod error;
pub mod facade;
pub mod handshake;
pub mod lease;
pub mod maintenance;
pub mod messages;
pub mod metrics;
pub mod persist;
pub mod policy;
pub mod pool;
pub mod record;
pub mod reputation;
pub mod selection;
pub mod selector;
pub mod sim;
pub mod tester;
pub mod traits;
pub mod types;

pub use builder::TunnelBuilder;
pub use client::{ClientCircuitPool, PublishedLease};
pub use config::{
    HandshakeConfig, MaintenanceConfig, PersistConfig, PoolConfig, TesterConfig, TunnelConfig,
};
pub use error::{
    BuildError, CryptoError, JoinRejection, LeaseError, PersistError, RecordError, TransportError,
};
pub use facade::{Collaborators, TunnelManagerFacade};
pub use handshake::{CircuitRequest, CircuitRequestProtocol, ReplyRegistry, RequestState, RetryPolicy};
pub use lease::{LeaseCheck, LeaseDecision, LeaseManager};
pub use maintenance::{JobReport, Maintenance, MaintenanceJob};
pub use messages::{JoinReply, JoinRequest, JoinStatus, TunnelMessage};
pub use persist::{ClientSnapshot, PoolSnapshot};
pub use policy::ClientCircuitPolicy;
pub use pool::{PoolStatus, RestoreReport, TunnelPool};
pub use record::{HopConfig, TunnelRecord, TunnelSettings};
pub use reputation::{HopOutcome, ReputationManager};
pub use selection::{PeerSelector, SelectionConfig, SelectionError};
pub use selector::{SelectionCriteria, TunnelSelector};
pub use sim::{PeerBehavior, SentRequest, SimCrypto, SimNetwork};
pub use tester::{TestOutcome, TestReport, TunnelTester};
pub use traits::{
    CryptoEngine, Lease, LeasePublisher, LeaseSet, MessageTransport, PeerInfo, PeerLookup,
};
pub use types::{now_ms, Destination, SigningKeys, SymmetricKey, TunnelId, TunnelKind};
