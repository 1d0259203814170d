// Copyright (c) 2024 Botho Foundation

//! Error types for the tunnel subsystem.
//!
//! None of these are fatal to the router: a failed build is corrected by the
//! next maintenance pass, a corrupt pool file means starting empty, and a
//! malformed record is logged and skipped.

use libp2p::PeerId;
use std::{io, time::Duration};
use thiserror::Error;

use crate::{
    messages::JoinStatus,
    types::{TunnelId, TunnelKind},
};

/// Structural problems with a hop chain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("hop chain is empty")]
    EmptyChain,

    #[error("expected exactly one local hop, found {0}")]
    LocalHopCount(usize),

    #[error("local hop of {kind} circuit at wrong position {index}")]
    LocalHopPosition { kind: TunnelKind, index: usize },

    #[error("settings depth {depth} does not match {hops} hops")]
    DepthMismatch { depth: usize, hops: usize },

    #[error("hop {index} is missing its {key} key")]
    MissingKey { index: usize, key: &'static str },
}

/// Why a circuit build did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("insufficient peers: need {needed}, have {available}")]
    InsufficientPeers { needed: usize, available: usize },

    #[error("no routing information for peer {0}")]
    UnknownPeer(PeerId),

    #[error("no circuit available to carry the request")]
    NoCarrierCircuit,

    #[error("peer {peer} rejected the circuit: {status:?}")]
    Rejected { peer: PeerId, status: JoinStatus },

    #[error("peer {0} did not reply in time")]
    HopTimeout(PeerId),

    #[error("handshake exceeded overall deadline of {0:?}")]
    OverallTimeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed reply from {0}")]
    MalformedReply(PeerId),

    #[error("circuit {0} could not be registered as pending")]
    NotRegistered(TunnelId),

    #[error("build was abandoned")]
    Cancelled,
}

/// Why a remotely initiated circuit was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    #[error("circuit already expired")]
    Expired,

    #[error("circuit id already in use")]
    DuplicateId,

    #[error("malformed hop chain: {0}")]
    Malformed(#[from] RecordError),

    #[error("participating circuit limit of {0} reached")]
    Overloaded(usize),

    #[error("next hop {0} could not be resolved")]
    UnknownNextHop(PeerId),
}

impl JoinRejection {
    /// Status reported back to the requester.
    pub fn status(&self) -> JoinStatus {
        match self {
            JoinRejection::Expired => JoinStatus::Deleted,
            JoinRejection::DuplicateId => JoinStatus::DuplicateId,
            JoinRejection::Malformed(_) => JoinStatus::CertificateRejected,
            JoinRejection::Overloaded(_) | JoinRejection::UnknownNextHop(_) => JoinStatus::Overloaded,
        }
    }
}

/// Failures of the message transport collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("target unreachable: {0}")]
    Unreachable(String),

    #[error("carrier circuit failed: {0}")]
    CircuitFailed(String),
}

/// Failures of the crypto collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("signature verification failed")]
    BadSignature,

    #[error("message was not addressed to this router")]
    WrongRecipient,

    #[error("malformed envelope")]
    Malformed,
}

/// The lease collaborator refused or failed to publish a lease.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("client rejected the lease: {0}")]
    Rejected(String),

    #[error("lease request timed out")]
    Timeout,

    #[error("client is not connected")]
    NotConnected,
}

/// Errors reading or writing the persisted pool file.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a pool file (bad magic)")]
    BadMagic,

    #[error("unsupported pool file version {0}")]
    UnsupportedVersion(u8),

    #[error("corrupt pool file: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for PersistError {
    fn from(err: bincode::Error) -> Self {
        PersistError::Corrupt(err.to_string())
    }
}
