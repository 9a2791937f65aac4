//! Device identity and device-reported metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Name given to a device that was connected by IP alone and never seen by
/// discovery.
pub const PLACEHOLDER_NAME: &str = "unknown";

/// Input rejected before any I/O happens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid IPv4 address: {0:?}")]
    InvalidIpv4(String),
}

/// Parses a dotted-quad IPv4 address, tolerating surrounding whitespace.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidIpv4`] for anything that is not exactly
/// four decimal octets in `0..=255`.
pub fn parse_ipv4(input: &str) -> Result<Ipv4Addr, ValidationError> {
    input
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| ValidationError::InvalidIpv4(input.to_string()))
}

// ── DeviceIdentity ────────────────────────────────────────────────────────────

/// A device on the local network: its mDNS host name and IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub ip: Ipv4Addr,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }

    /// Identity for a device known only by address.
    pub fn placeholder(ip: Ipv4Addr) -> Self {
        Self::new(PLACEHOLDER_NAME, ip)
    }

    pub fn is_placeholder(&self) -> bool {
        self.name == PLACEHOLDER_NAME
    }

    /// Whether two identities refer to the same physical device.
    ///
    /// Addresses are authoritative.  Names only count when neither side is a
    /// placeholder, since every IP-only connection shares the placeholder name.
    pub fn same_device(&self, other: &DeviceIdentity) -> bool {
        if self.ip == other.ip {
            return true;
        }
        !self.is_placeholder() && !other.is_placeholder() && self.name == other.name
    }

    /// Key that tells devices apart in per-device maps: the name, or the
    /// dotted IP when only the placeholder name is known.
    pub fn key(&self) -> String {
        if self.is_placeholder() {
            self.ip.to_string()
        } else {
            self.name.clone()
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.ip)
    }
}

// ── DeviceMetadata ────────────────────────────────────────────────────────────

/// What the device reports about itself in its `DeviceInfoAck` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Operating system image version.
    #[serde(rename = "sysVer", default)]
    pub sys_version: Option<String>,
    /// MaixPy runtime version.
    #[serde(rename = "maixpyVer", default)]
    pub runtime_version: Option<String>,
    #[serde(rename = "apiKey", default)]
    pub api_key: Option<String>,
}

impl DeviceMetadata {
    /// Parses the JSON object sent by the device.  Unknown keys are ignored.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
