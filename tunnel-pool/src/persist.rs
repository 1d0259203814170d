// Copyright (c) 2024 Botho Foundation

//! Pool file save/restore.
//!
//! File layout:
//!
//! ```text
//! +--------+---------+--------------------------------+
//! | "BTPL" | version | bincode(PoolSnapshot)          |
//! | 4 B    | 1 B     | categories, then client blocks |
//! +--------+---------+--------------------------------+
//! ```
//!
//! Writes go to a temporary file that is renamed over the old one, so a
//! crash mid-write leaves the previous file intact.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::Path,
};
use tracing::{debug, warn};

use crate::{error::PersistError, record::TunnelRecord, types::Destination};

const MAGIC: &[u8; 4] = b"BTPL";
const VERSION: u8 = 1;

/// One client pool as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub destination: Destination,
    /// Policy as key/value properties.
    pub policy: BTreeMap<String, String>,
    pub active: Vec<TunnelRecord>,
    pub inactive: Vec<TunnelRecord>,
}

/// Every category of the pool at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub free_inbound: Vec<TunnelRecord>,
    pub outbound: Vec<TunnelRecord>,
    pub participating: Vec<TunnelRecord>,
    pub pending: Vec<TunnelRecord>,
    pub clients: Vec<ClientSnapshot>,
}

impl PoolSnapshot {
    pub fn circuit_count(&self) -> usize {
        self.free_inbound.len()
            + self.outbound.len()
            + self.participating.len()
            + self.pending.len()
            + self
                .clients
                .iter()
                .map(|c| c.active.len() + c.inactive.len())
                .sum::<usize>()
    }
}

pub fn encode(snapshot: &PoolSnapshot) -> Result<Vec<u8>, PersistError> {
    let body = bincode::serialize(snapshot)?;
    let mut bytes = Vec::with_capacity(MAGIC.len() + 1 + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.push(VERSION);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<PoolSnapshot, PersistError> {
    if bytes.len() < MAGIC.len() + 1 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(PersistError::BadMagic);
    }
    let version = bytes[MAGIC.len()];
    if version != VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }
    Ok(bincode::deserialize(&bytes[MAGIC.len() + 1..])?)
}

/// Write `snapshot` to `path` atomically.
pub fn save(path: &Path, snapshot: &PoolSnapshot) -> Result<(), PersistError> {
    let bytes = encode(snapshot)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    debug!(
        path = %path.display(),
        circuits = snapshot.circuit_count(),
        bytes = bytes.len(),
        "Saved tunnel pool"
    );
    Ok(())
}

/// Read the pool file; `Ok(None)` if there is none.
pub fn load(path: &Path) -> Result<Option<PoolSnapshot>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    decode(&bytes).map(Some)
}

/// Like [`load`], but any error means starting empty.
pub fn load_or_empty(path: &Path) -> PoolSnapshot {
    match load(path) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => PoolSnapshot::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Ignoring unreadable tunnel pool file");
            PoolSnapshot::default()
        }
    }
}
