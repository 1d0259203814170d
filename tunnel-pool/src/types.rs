// Copyright (c) 2024 Botho Foundation

//! Core identifiers and key material shared by every tunnel component.
//!
//! - [`TunnelId`]: router-local circuit identifier tagged with its [`TunnelKind`]
//! - [`Destination`]: identity hash of a local client
//! - [`SymmetricKey`] / [`SigningKeys`]: per-circuit key material
//!
//! # Security
//!
//! All secret key material uses `zeroize` so it does not persist in memory
//! after the owning circuit is dropped.

use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of symmetric keys in bytes (256-bit).
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// Length of destination identity hashes in bytes.
pub const DESTINATION_LEN: usize = 32;

/// Length of signing keys in bytes.
pub const SIGNING_KEY_LEN: usize = 32;

/// Current wall-clock time in milliseconds since the unix epoch.
///
/// Expirations are epoch-ms so they survive a save/restore of the pool.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Role of a circuit relative to the local router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelKind {
    /// Terminates at the local router.
    Inbound,
    /// Originates at the local router.
    Outbound,
    /// Someone else's circuit that we relay for.
    Participant,
    Unspecified,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKind::Inbound => write!(f, "in"),
            TunnelKind::Outbound => write!(f, "out"),
            TunnelKind::Participant => write!(f, "part"),
            TunnelKind::Unspecified => write!(f, "any"),
        }
    }
}

/// Router-local circuit identifier.
///
/// Uniqueness is only guaranteed within one router. The kind tag is part of
/// the key, so an inbound and an outbound circuit may share a numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelId {
    id: u32,
    kind: TunnelKind,
}

impl TunnelId {
    pub fn new(id: u32, kind: TunnelKind) -> Self {
        Self { id, kind }
    }

    /// Generate a new random non-zero identifier.
    pub fn random<R: RngCore>(kind: TunnelKind, rng: &mut R) -> Self {
        Self {
            id: rng.gen_range(1..=u32::MAX),
            kind,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> TunnelKind {
        self.kind
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Identity hash of a local client destination.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination([u8; DESTINATION_LEN]);

impl Destination {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; DESTINATION_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns `None` if the slice length is not exactly [`DESTINATION_LEN`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; DESTINATION_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; DESTINATION_LEN] {
        &self.0
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A symmetric key used for layer encryption or hop housekeeping.
///
/// Zeroed from memory on drop. Clone is intentionally not derived; use
/// [`SymmetricKey::duplicate`] when a second copy is really needed.
#[derive(Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns `None` if the slice length is not exactly [`SYMMETRIC_KEY_LEN`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; SYMMETRIC_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.0
    }

    pub fn duplicate(&self) -> Self {
        Self(self.0)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the actual key - show a hash fingerprint instead
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(self.0);
        write!(f, "SymmetricKey(sha256:{})", hex::encode(&hash[..4]))
    }
}

/// Private half of a circuit signing keypair.
#[derive(Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SigningPrivateKey([u8; SIGNING_KEY_LEN]);

impl SigningPrivateKey {
    pub fn from_bytes(bytes: [u8; SIGNING_KEY_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; SIGNING_KEY_LEN] {
        &self.0
    }

    pub fn duplicate(&self) -> Self {
        Self(self.0)
    }
}

impl fmt::Debug for SigningPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPrivateKey(..)")
    }
}

/// Circuit signing material held by the gateway and endpoint hops.
///
/// The private key is present only on the hop that is the local router, which
/// needs it to authorize lease assertions for the circuit.
#[derive(Debug, Serialize, Deserialize)]
pub struct SigningKeys {
    pub public: [u8; SIGNING_KEY_LEN],
    pub private: Option<SigningPrivateKey>,
}

impl SigningKeys {
    /// Copy of these keys with the private half stripped.
    pub fn public_only(&self) -> Self {
        Self {
            public: self.public,
            private: None,
        }
    }

    pub fn duplicate(&self) -> Self {
        Self {
            public: self.public,
            private: self.private.as_ref().map(SigningPrivateKey::duplicate),
        }
    }
}

/// Serde helpers for [`libp2p::PeerId`], encoded as its multihash bytes.
pub(crate) mod peer_serde {
    use libp2p::PeerId;
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(peer: &PeerId, s: S) -> Result<S::Ok, S::Error> {
        peer.to_bytes().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PeerId, D::Error> {
        let bytes = Vec::<u8>::deserialize(d)?;
        PeerId::from_bytes(&bytes).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(peer: &Option<PeerId>, s: S) -> Result<S::Ok, S::Error> {
            peer.as_ref().map(|p| p.to_bytes()).serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PeerId>, D::Error> {
            Option::<Vec<u8>>::deserialize(d)?
                .map(|bytes| PeerId::from_bytes(&bytes).map_err(D::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tunnel_id_random_is_nonzero_and_unique() {
        let mut rng = rand::thread_rng();
        let ids: HashSet<_> = (0..100)
            .map(|_| TunnelId::random(TunnelKind::Inbound, &mut rng))
            .collect();

        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.id() != 0));
    }

    #[test]
    fn test_tunnel_id_kind_is_part_of_key() {
        let inbound = TunnelId::new(7, TunnelKind::Inbound);
        let outbound = TunnelId::new(7, TunnelKind::Outbound);

        assert_ne!(inbound, outbound);
        assert_eq!(inbound.to_string(), "in:7");
        assert_eq!(outbound.to_string(), "out:7");
    }

    #[test]
    fn test_destination_from_bytes_wrong_length() {
        assert!(Destination::from_bytes(&[1u8; 16]).is_none());
        let dest = Destination::from_bytes(&[1u8; DESTINATION_LEN]).unwrap();
        assert_eq!(dest.as_bytes(), &[1u8; DESTINATION_LEN]);
    }

    #[test]
    fn test_symmetric_key_debug_does_not_leak() {
        let key = SymmetricKey([0x42u8; SYMMETRIC_KEY_LEN]);
        let debug = format!("{:?}", key);

        assert!(!debug.contains("42424242"));
        assert!(debug.contains("sha256:"));
    }

    #[test]
    fn test_signing_keys_public_only_strips_private() {
        let keys = SigningKeys {
            public: [1u8; SIGNING_KEY_LEN],
            private: Some(SigningPrivateKey::from_bytes([2u8; SIGNING_KEY_LEN])),
        };

        let public = keys.public_only();
        assert_eq!(public.public, keys.public);
        assert!(public.private.is_none());
        assert!(keys.duplicate().private.is_some());
    }

    #[test]
    fn test_peer_serde_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "peer_serde")]
            peer: libp2p::PeerId,
            #[serde(with = "peer_serde::option")]
            maybe: Option<libp2p::PeerId>,
        }

        let peer = libp2p::PeerId::random();
        let encoded = bincode::serialize(&Wrapper {
            peer,
            maybe: None,
        })
        .unwrap();
        let decoded: Wrapper = bincode::deserialize(&encoded).unwrap();

        assert_eq!(decoded.peer, peer);
        assert!(decoded.maybe.is_none());

        let next = libp2p::PeerId::random();
        let encoded = bincode::serialize(&Wrapper {
            peer,
            maybe: Some(next),
        })
        .unwrap();
        let decoded: Wrapper = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded.maybe, Some(next));
    }
}
