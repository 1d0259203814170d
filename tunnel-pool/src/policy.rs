// Copyright (c) 2024 Botho Foundation

//! Per-client circuit requirements.
//!
//! A [`ClientCircuitPolicy`] is supplied by a client when it asks for
//! circuits. It can only change through an explicit reconfiguration, which
//! restarts the client's pool.
//!
//! The persisted pool file stores policies as flat key/value properties so
//! fields can be added without breaking older files.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, str::FromStr, time::Duration};

/// Default number of inbound circuits a client wants in its lease.
pub const DEFAULT_INBOUND_QUANTITY: usize = 2;

/// Default number of outbound circuits a client wants available.
pub const DEFAULT_OUTBOUND_QUANTITY: usize = 2;

/// Default remote hop count per circuit.
pub const DEFAULT_DEPTH: usize = 2;

/// Default circuit lifetime (10 minutes).
pub const DEFAULT_DURATION: Duration = Duration::from_secs(600);

const PROP_INBOUND_QUANTITY: &str = "inbound.quantity";
const PROP_OUTBOUND_QUANTITY: &str = "outbound.quantity";
const PROP_INBOUND_DEPTH: &str = "inbound.depth";
const PROP_OUTBOUND_DEPTH: &str = "outbound.depth";
const PROP_DURATION_MS: &str = "duration.ms";
const PROP_STRICT_MINIMUM_LENGTH: &str = "enforce.strict.minimum.length";
const PROP_BYTES_AVG: &str = "bytes.per.minute.avg";
const PROP_BYTES_PEAK: &str = "bytes.per.minute.peak";
const PROP_MESSAGES_AVG: &str = "messages.per.minute.avg";
const PROP_MESSAGES_PEAK: &str = "messages.per.minute.peak";
const PROP_INCLUDE_DUMMY: &str = "include.dummy";
const PROP_REORDER: &str = "reorder";

/// Circuit requirements of one client destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCircuitPolicy {
    /// Inbound circuits to keep in the published lease.
    pub inbound_quantity: usize,
    /// Outbound circuits to keep available.
    pub outbound_quantity: usize,
    /// Remote hops per inbound circuit.
    pub inbound_depth: usize,
    /// Remote hops per outbound circuit.
    pub outbound_depth: usize,
    /// Lifetime of each circuit, also the maximum age of a published lease.
    pub duration_ms: u64,
    /// Never fall back to shorter (zero-hop) circuits.
    pub enforce_strict_minimum_length: bool,
    pub bytes_per_minute_avg: u64,
    pub bytes_per_minute_peak: u64,
    pub messages_per_minute_avg: u64,
    pub messages_per_minute_peak: u64,
    pub include_dummy: bool,
    pub reorder: bool,
}

impl Default for ClientCircuitPolicy {
    fn default() -> Self {
        Self {
            inbound_quantity: DEFAULT_INBOUND_QUANTITY,
            outbound_quantity: DEFAULT_OUTBOUND_QUANTITY,
            inbound_depth: DEFAULT_DEPTH,
            outbound_depth: DEFAULT_DEPTH,
            duration_ms: DEFAULT_DURATION.as_millis() as u64,
            enforce_strict_minimum_length: false,
            bytes_per_minute_avg: 0,
            bytes_per_minute_peak: 0,
            messages_per_minute_avg: 0,
            messages_per_minute_peak: 0,
            include_dummy: false,
            reorder: false,
        }
    }
}

impl ClientCircuitPolicy {
    /// Policy used for the router's own zero-hop fallback circuits.
    pub fn zero_hop(duration: Duration) -> Self {
        Self {
            inbound_quantity: 0,
            outbound_quantity: 0,
            inbound_depth: 0,
            outbound_depth: 0,
            duration_ms: duration.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Encode as flat key/value properties.
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        [
            (PROP_INBOUND_QUANTITY, self.inbound_quantity.to_string()),
            (PROP_OUTBOUND_QUANTITY, self.outbound_quantity.to_string()),
            (PROP_INBOUND_DEPTH, self.inbound_depth.to_string()),
            (PROP_OUTBOUND_DEPTH, self.outbound_depth.to_string()),
            (PROP_DURATION_MS, self.duration_ms.to_string()),
            (
                PROP_STRICT_MINIMUM_LENGTH,
                self.enforce_strict_minimum_length.to_string(),
            ),
            (PROP_BYTES_AVG, self.bytes_per_minute_avg.to_string()),
            (PROP_BYTES_PEAK, self.bytes_per_minute_peak.to_string()),
            (PROP_MESSAGES_AVG, self.messages_per_minute_avg.to_string()),
            (PROP_MESSAGES_PEAK, self.messages_per_minute_peak.to_string()),
            (PROP_INCLUDE_DUMMY, self.include_dummy.to_string()),
            (PROP_REORDER, self.reorder.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Decode from properties; missing or unparsable keys keep their defaults.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Self {
        fn get<T: FromStr>(props: &BTreeMap<String, String>, key: &str, default: T) -> T {
            props
                .get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let defaults = Self::default();
        Self {
            inbound_quantity: get(props, PROP_INBOUND_QUANTITY, defaults.inbound_quantity),
            outbound_quantity: get(props, PROP_OUTBOUND_QUANTITY, defaults.outbound_quantity),
            inbound_depth: get(props, PROP_INBOUND_DEPTH, defaults.inbound_depth),
            outbound_depth: get(props, PROP_OUTBOUND_DEPTH, defaults.outbound_depth),
            duration_ms: get(props, PROP_DURATION_MS, defaults.duration_ms),
            enforce_strict_minimum_length: get(
                props,
                PROP_STRICT_MINIMUM_LENGTH,
                defaults.enforce_strict_minimum_length,
            ),
            bytes_per_minute_avg: get(props, PROP_BYTES_AVG, defaults.bytes_per_minute_avg),
            bytes_per_minute_peak: get(props, PROP_BYTES_PEAK, defaults.bytes_per_minute_peak),
            messages_per_minute_avg: get(
                props,
                PROP_MESSAGES_AVG,
                defaults.messages_per_minute_avg,
            ),
            messages_per_minute_peak: get(
                props,
                PROP_MESSAGES_PEAK,
                defaults.messages_per_minute_peak,
            ),
            include_dummy: get(props, PROP_INCLUDE_DUMMY, defaults.include_dummy),
            reorder: get(props, PROP_REORDER, defaults.reorder),
        }
    }
}
