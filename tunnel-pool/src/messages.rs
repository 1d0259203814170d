// Copyright (c) 2024 Botho Foundation

//! Messages exchanged with remote hops while building and testing circuits.
//!
//! Envelopes are fixed binary records encoded with `bincode`; the crypto
//! collaborator wraps the encoded bytes for delivery to one specific router.

use libp2p::PeerId;
use serde::{Deserialize, Serialize};

use crate::{
    record::TunnelSettings,
    types::{peer_serde, SymmetricKey, TunnelId},
};

/// Answer of a hop to a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinStatus {
    Accepted,
    /// The request's signature or certificate did not verify.
    CertificateRejected,
    /// The hop already relays a circuit with this receive id.
    DuplicateId,
    /// The hop refuses more participating circuits.
    Overloaded,
    /// The hop has dropped the circuit.
    Deleted,
}

impl JoinStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, JoinStatus::Accepted)
    }
}

/// "May we route this circuit through you" request for one hop.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub circuit: TunnelId,
    /// Receive id assigned to the target hop.
    pub receive_id: u32,
    /// Router after the target hop; `None` when the target is the endpoint.
    #[serde(with = "peer_serde::option")]
    pub next_peer: Option<PeerId>,
    pub next_receive_id: Option<u32>,
    pub settings: TunnelSettings,
    pub housekeeping_key: SymmetricKey,
    pub layer_key: Option<SymmetricKey>,
    pub is_gateway: bool,
    pub is_endpoint: bool,
    /// Random value echoed back in the reply for correlation.
    pub reply_nonce: u64,
    /// Circuit the reply should travel back on.
    pub reply_via: TunnelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReply {
    pub nonce: u64,
    pub status: JoinStatus,
}

/// Every envelope the tunnel subsystem sends or expects back.
#[derive(Debug, Serialize, Deserialize)]
pub enum TunnelMessage {
    JoinRequest(JoinRequest),
    JoinReply(JoinReply),
    /// Self-addressed liveness probe sent through a circuit.
    TestProbe { tunnel: TunnelId, nonce: u64 },
    TestEcho { nonce: u64 },
}

impl TunnelMessage {
    pub fn encode(&self) -> Vec<u8> {
        // Serializing plain data into a Vec cannot fail
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{policy::ClientCircuitPolicy, types::TunnelKind};

    #[test]
    fn test_join_request_roundtrip_keeps_keys() {
        let mut rng = rand::thread_rng();
        let key = SymmetricKey::random(&mut rng);
        let next = PeerId::random();
        let request = TunnelMessage::JoinRequest(JoinRequest {
            circuit: TunnelId::new(5, TunnelKind::Inbound),
            receive_id: 77,
            next_peer: Some(next),
            next_receive_id: Some(78),
            settings: TunnelSettings::from_policy(&ClientCircuitPolicy::default(), 2, 1_000),
            housekeeping_key: key.duplicate(),
            layer_key: None,
            is_gateway: true,
            is_endpoint: false,
            reply_nonce: 42,
            reply_via: TunnelId::new(9, TunnelKind::Inbound),
        });

        let decoded = TunnelMessage::decode(&request.encode()).unwrap();
        match decoded {
            TunnelMessage::JoinRequest(req) => {
                assert_eq!(req.next_peer, Some(next));
                assert_eq!(req.reply_nonce, 42);
                assert_eq!(req.housekeeping_key.as_bytes(), key.as_bytes());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(TunnelMessage::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
