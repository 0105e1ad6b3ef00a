//! Technology configuration model
//!
//! Per-technology parameter structs, the unicast/multicast target split, the
//! ranging-mode preference, and the discrete update-rate tables with the
//! shared rate-selection boundary rule.
//!
//! Peer identity never lives inside a parameter struct: the target carries
//! the addresses, so parameter equality is exactly the multicast-grouping
//! equality.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SelectionError;
use crate::types::{DeviceId, DeviceRole, Technology};

// ----------------------------------------------------------------------------
// Ranging Mode
// ----------------------------------------------------------------------------

/// Client preference for which technologies a session should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangingMode {
    /// Pick the best mutually supported technology automatically
    Auto,
    /// UWB or nothing
    HighAccuracy,
    /// Prefer UWB, fall back down the priority order
    HighAccuracyPreferred,
    /// Run every mutually supported technology concurrently and fuse
    Fused,
}

// ----------------------------------------------------------------------------
// Update Rates
// ----------------------------------------------------------------------------

/// Discrete measurement update rate, ordered fastest to slowest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UpdateRate {
    Frequent,
    Normal,
    Infrequent,
}

impl UpdateRate {
    /// Stable wire identifier
    pub fn id(&self) -> u8 {
        match self {
            UpdateRate::Frequent => 0,
            UpdateRate::Normal => 1,
            UpdateRate::Infrequent => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(UpdateRate::Frequent),
            1 => Some(UpdateRate::Normal),
            2 => Some(UpdateRate::Infrequent),
            _ => None,
        }
    }

    /// The discrete rate table for a technology, fastest first. Technologies
    /// without a negotiable rate return an empty table.
    pub fn table(technology: Technology) -> &'static [(UpdateRate, Duration)] {
        const UWB: &[(UpdateRate, Duration)] = &[
            (UpdateRate::Frequent, Duration::from_millis(100)),
            (UpdateRate::Normal, Duration::from_millis(240)),
            (UpdateRate::Infrequent, Duration::from_millis(600)),
        ];
        const RSSI: &[(UpdateRate, Duration)] = &[
            (UpdateRate::Frequent, Duration::from_millis(500)),
            (UpdateRate::Normal, Duration::from_millis(1000)),
            (UpdateRate::Infrequent, Duration::from_millis(3000)),
        ];
        match technology {
            Technology::Uwb => UWB,
            Technology::BleRssi => RSSI,
            Technology::BleCs | Technology::WifiRtt => &[],
        }
    }
}

/// Preferred measurement interval range, fastest bound first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalRange {
    /// Shortest acceptable interval between measurements
    pub fastest: Duration,
    /// Longest acceptable interval between measurements
    pub slowest: Duration,
}

impl IntervalRange {
    pub fn new(fastest: Duration, slowest: Duration) -> Self {
        debug_assert!(fastest <= slowest);
        Self { fastest, slowest }
    }

    pub fn contains(&self, interval: Duration) -> bool {
        interval >= self.fastest && interval <= self.slowest
    }
}

/// Select the discrete update rate for a preferred interval range.
///
/// Boundary rule shared by UWB and BLE-RSSI: if the whole range is slower
/// than the slowest discrete rate, clamp to INFREQUENT; if the whole range is
/// faster than the fastest, clamp to FREQUENT; otherwise take the fastest
/// discrete rate whose duration lies inside the range, and fail if none does.
pub fn select_update_rate(
    technology: Technology,
    preferred: &IntervalRange,
) -> Result<UpdateRate, SelectionError> {
    let table = UpdateRate::table(technology);
    if table.is_empty() {
        return Err(SelectionError::NoUsableUpdateRate { technology });
    }

    let (fastest_rate, fastest_duration) = table[0];
    let (slowest_rate, slowest_duration) = table[table.len() - 1];

    if preferred.fastest > slowest_duration {
        return Ok(slowest_rate);
    }
    if preferred.slowest < fastest_duration {
        return Ok(fastest_rate);
    }

    table
        .iter()
        .find(|(_, duration)| preferred.contains(*duration))
        .map(|(rate, _)| *rate)
        .ok_or(SelectionError::NoUsableUpdateRate { technology })
}

// ----------------------------------------------------------------------------
// Technology Parameters
// ----------------------------------------------------------------------------

/// UWB session parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UwbParams {
    pub session_id: u32,
    pub channel: u8,
    pub preamble_index: u8,
    pub update_rate: UpdateRate,
    /// Static STS key material distributed over the OOB channel
    pub sts_key: [u8; 8],
    pub role: DeviceRole,
}

impl Default for UwbParams {
    fn default() -> Self {
        Self {
            session_id: 0,
            channel: 9,
            preamble_index: 10,
            update_rate: UpdateRate::Normal,
            sts_key: [0; 8],
            role: DeviceRole::Initiator,
        }
    }
}

/// Bluetooth channel sounding parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsParams {
    pub security_level: u8,
    pub role: DeviceRole,
}

impl Default for CsParams {
    fn default() -> Self {
        Self {
            security_level: 1,
            role: DeviceRole::Initiator,
        }
    }
}

/// WiFi round-trip-time parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttParams {
    pub channel: u8,
    pub bandwidth_mhz: u16,
}

impl Default for RttParams {
    fn default() -> Self {
        Self {
            channel: 36,
            bandwidth_mhz: 80,
        }
    }
}

/// BLE RSSI ranging parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssiParams {
    pub update_rate: UpdateRate,
    /// Reference TX power at 1m, dBm
    pub tx_power_dbm: i8,
}

impl Default for RssiParams {
    fn default() -> Self {
        Self {
            update_rate: UpdateRate::Normal,
            tx_power_dbm: -50,
        }
    }
}

/// Technology-specific parameters, excluding peer identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TechnologyParams {
    Uwb(UwbParams),
    BleCs(CsParams),
    WifiRtt(RttParams),
    BleRssi(RssiParams),
}

impl TechnologyParams {
    pub fn technology(&self) -> Technology {
        match self {
            TechnologyParams::Uwb(_) => Technology::Uwb,
            TechnologyParams::BleCs(_) => Technology::BleCs,
            TechnologyParams::WifiRtt(_) => Technology::WifiRtt,
            TechnologyParams::BleRssi(_) => Technology::BleRssi,
        }
    }

    /// Default parameters for a technology
    pub fn defaults(technology: Technology) -> Self {
        match technology {
            Technology::Uwb => TechnologyParams::Uwb(UwbParams::default()),
            Technology::BleCs => TechnologyParams::BleCs(CsParams::default()),
            Technology::WifiRtt => TechnologyParams::WifiRtt(RttParams::default()),
            Technology::BleRssi => TechnologyParams::BleRssi(RssiParams::default()),
        }
    }
}

// ----------------------------------------------------------------------------
// Technology Config
// ----------------------------------------------------------------------------

/// Which peers one underlying technology session serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigTarget {
    /// One session, one peer
    Unicast(DeviceId),
    /// One session shared by several peers with identical parameters
    Multicast(Vec<DeviceId>),
}

impl ConfigTarget {
    pub fn peers(&self) -> &[DeviceId] {
        match self {
            ConfigTarget::Unicast(peer) => std::slice::from_ref(peer),
            ConfigTarget::Multicast(peers) => peers,
        }
    }

    pub fn contains(&self, peer: DeviceId) -> bool {
        self.peers().contains(&peer)
    }
}

/// One technology session description: a technology's parameters plus the
/// peers it serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnologyConfig {
    pub target: ConfigTarget,
    pub params: TechnologyParams,
}

impl TechnologyConfig {
    pub fn unicast(peer: DeviceId, params: TechnologyParams) -> Self {
        Self {
            target: ConfigTarget::Unicast(peer),
            params,
        }
    }

    pub fn technology(&self) -> Technology {
        self.params.technology()
    }
}

// ----------------------------------------------------------------------------
// Session Config
// ----------------------------------------------------------------------------

/// How one peer's concurrent measurement streams are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionPolicy {
    /// Forward the first live source unfiltered
    PassThrough,
    /// Blend live sources through the configured strategy
    Filtering,
}

/// Session-level configuration supplied by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mode: RangingMode,
    pub fusion: FusionPolicy,
    /// Stop the session after this many fused measurements, if set
    pub measurement_limit: Option<u32>,
    pub preferred_interval: IntervalRange,
    /// How long to wait for the first fused measurement
    pub no_initial_data_timeout: Duration,
    /// How long to wait between fused measurements
    pub no_update_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: RangingMode::Auto,
            fusion: FusionPolicy::PassThrough,
            measurement_limit: None,
            preferred_interval: IntervalRange::new(
                Duration::from_millis(100),
                Duration::from_millis(5000),
            ),
            no_initial_data_timeout: Duration::from_secs(5),
            no_update_timeout: Duration::from_secs(10),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
