//! Core identifier and measurement types shared across the orchestrator
//!
//! This module defines the stable device identifier, session handle,
//! technology tags and bitmaps, and the measurement/stop-reason types that
//! flow between adapters, the fusion engine and the session manager.

use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Device Identity
// ----------------------------------------------------------------------------

/// Stable 6-byte device identifier for a ranging peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId([u8; 6]);

impl DeviceId {
    pub const SIZE: usize = 6;

    /// Create a device ID from raw bytes
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Opaque handle identifying one ranging session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    /// Allocate a fresh session handle
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role the local device plays toward one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    /// Controller/initiator side of the session
    Initiator,
    /// Controlee/responder side of the session
    Responder,
}

// ----------------------------------------------------------------------------
// Ranging Technologies
// ----------------------------------------------------------------------------

/// A distance-measurement technology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Technology {
    /// Ultra-wideband two-way ranging
    Uwb,
    /// Bluetooth channel sounding
    BleCs,
    /// WiFi round-trip-time
    WifiRtt,
    /// BLE received-signal-strength ranging
    BleRssi,
}

impl Technology {
    /// Global preference order used whenever a single technology must be
    /// picked from a mutual set. Index 0 is most preferred.
    pub const PRIORITY_ORDER: [Technology; 4] = [
        Technology::Uwb,
        Technology::BleCs,
        Technology::WifiRtt,
        Technology::BleRssi,
    ];

    /// Stable wire identifier for this technology
    pub fn id(&self) -> u8 {
        match self {
            Technology::Uwb => 0,
            Technology::BleCs => 1,
            Technology::WifiRtt => 2,
            Technology::BleRssi => 3,
        }
    }

    /// Look up a technology by wire identifier
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Technology::Uwb),
            1 => Some(Technology::BleCs),
            2 => Some(Technology::WifiRtt),
            3 => Some(Technology::BleRssi),
            _ => None,
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Technology::Uwb => "uwb",
            Technology::BleCs => "ble-cs",
            Technology::WifiRtt => "wifi-rtt",
            Technology::BleRssi => "ble-rssi",
        };
        write!(f, "{}", name)
    }
}

/// Bitmap of technologies, wire-compatible with the OOB message format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TechnologySet(u16);

impl TechnologySet {
    /// Empty set
    pub fn empty() -> Self {
        Self(0)
    }

    /// Set containing every known technology
    pub fn all() -> Self {
        let mut set = Self::empty();
        for tech in Technology::PRIORITY_ORDER {
            set.insert(tech);
        }
        set
    }

    /// Reconstruct a set from its raw bitmap. Bits that do not map to a
    /// known technology are preserved so decoding can reject them explicitly.
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw bitmap value
    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn insert(&mut self, tech: Technology) {
        self.0 |= 1 << tech.id();
    }

    pub fn remove(&mut self, tech: Technology) {
        self.0 &= !(1 << tech.id());
    }

    pub fn contains(&self, tech: Technology) -> bool {
        self.0 & (1 << tech.id()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Set intersection
    pub fn intersect(&self, other: &TechnologySet) -> TechnologySet {
        TechnologySet(self.0 & other.0)
    }

    /// True if any bit is set that does not correspond to a known technology
    pub fn has_unknown_bits(&self) -> bool {
        let known: u16 = Technology::PRIORITY_ORDER
            .iter()
            .fold(0, |acc, t| acc | (1 << t.id()));
        self.0 & !known != 0
    }

    /// Iterate the contained technologies in global priority order
    pub fn iter(&self) -> impl Iterator<Item = Technology> + '_ {
        Technology::PRIORITY_ORDER
            .into_iter()
            .filter(|t| self.contains(*t))
    }

    /// Most preferred technology in the set, if any
    pub fn highest_priority(&self) -> Option<Technology> {
        self.iter().next()
    }
}

impl FromIterator<Technology> for TechnologySet {
    fn from_iter<I: IntoIterator<Item = Technology>>(iter: I) -> Self {
        let mut set = TechnologySet::empty();
        for tech in iter {
            set.insert(tech);
        }
        set
    }
}

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------

/// Milliseconds since the UNIX epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Measurements
// ----------------------------------------------------------------------------

/// One distance measurement produced by a technology adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangingMeasurement {
    /// Technology that produced this measurement
    pub technology: Technology,
    /// Distance to the peer in meters
    pub distance_m: f64,
    /// Angle of arrival azimuth in degrees, if the technology supports AoA
    pub azimuth_deg: Option<f64>,
    /// Angle of arrival elevation in degrees, if the technology supports AoA
    pub elevation_deg: Option<f64>,
    /// Received signal strength in dBm, where measured
    pub rssi_dbm: Option<i8>,
    /// Measurement time
    pub timestamp: Timestamp,
}

impl RangingMeasurement {
    /// Create a distance-only measurement
    pub fn distance(technology: Technology, distance_m: f64) -> Self {
        Self {
            technology,
            distance_m,
            azimuth_deg: None,
            elevation_deg: None,
            rssi_dbm: None,
            timestamp: Timestamp::now(),
        }
    }
}

// ----------------------------------------------------------------------------
// Stop Reasons
// ----------------------------------------------------------------------------

/// Why a peer or adapter stopped ranging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Cause unknown
    Unknown,
    /// Hardware or stack error
    Error,
    /// Adapter never reached the started state
    FailedToStart,
    /// The local client requested the stop
    LocalRequest,
    /// The remote peer requested the stop
    RemoteRequest,
    /// Connection to the peer was lost
    LostConnection,
    /// Platform policy terminated the session
    SystemPolicy,
    /// No measurement arrived before the initial-data timeout
    NoInitialDataTimeout,
    /// Measurements stopped arriving before the update timeout
    NoUpdatedDataTimeout,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Unknown => "unknown",
            StopReason::Error => "error",
            StopReason::FailedToStart => "failed-to-start",
            StopReason::LocalRequest => "local-request",
            StopReason::RemoteRequest => "remote-request",
            StopReason::LostConnection => "lost-connection",
            StopReason::SystemPolicy => "system-policy",
            StopReason::NoInitialDataTimeout => "no-initial-data-timeout",
            StopReason::NoUpdatedDataTimeout => "no-updated-data-timeout",
        };
        write!(f, "{}", name)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
