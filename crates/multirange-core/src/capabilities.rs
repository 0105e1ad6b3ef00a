//! Per-technology capability model and the process-wide registry
//!
//! The registry caches one `Capabilities` snapshot for the whole process. It
//! is rebuilt lazily from the registered capability sources, refreshed on
//! every push notification from an adapter stack, and broadcast to listeners
//! whose channels are pruned automatically once closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::UpdateRate;
use crate::types::{Technology, TechnologySet};

// ----------------------------------------------------------------------------
// Capability Types
// ----------------------------------------------------------------------------

/// Whether a technology can be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    /// Hardware present and switched on
    Enabled,
    /// Hardware present but the user disabled it
    DisabledByUser,
    /// Hardware absent
    NotSupported,
}

/// UWB capability payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UwbCapability {
    pub supported_channels: SmallVec<[u8; 4]>,
    pub supported_rates: SmallVec<[UpdateRate; 3]>,
    pub supports_azimuth: bool,
    pub supports_elevation: bool,
}

impl Default for UwbCapability {
    fn default() -> Self {
        Self {
            supported_channels: SmallVec::from_slice(&[5, 9]),
            supported_rates: SmallVec::from_slice(&[
                UpdateRate::Frequent,
                UpdateRate::Normal,
                UpdateRate::Infrequent,
            ]),
            supports_azimuth: false,
            supports_elevation: false,
        }
    }
}

/// Bluetooth channel sounding capability payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CsCapability {
    pub security_levels: SmallVec<[u8; 4]>,
}

/// WiFi RTT capability payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RttCapability {
    pub bandwidths_mhz: SmallVec<[u16; 4]>,
    pub supports_one_sided: bool,
}

/// BLE RSSI capability payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssiCapability {
    pub supported_rates: SmallVec<[UpdateRate; 3]>,
}

impl Default for RssiCapability {
    fn default() -> Self {
        Self {
            supported_rates: SmallVec::from_slice(&[
                UpdateRate::Frequent,
                UpdateRate::Normal,
                UpdateRate::Infrequent,
            ]),
        }
    }
}

/// Technology-specific capability payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityPayload {
    Uwb(UwbCapability),
    BleCs(CsCapability),
    WifiRtt(RttCapability),
    BleRssi(RssiCapability),
}

impl CapabilityPayload {
    pub fn technology(&self) -> Technology {
        match self {
            CapabilityPayload::Uwb(_) => Technology::Uwb,
            CapabilityPayload::BleCs(_) => Technology::BleCs,
            CapabilityPayload::WifiRtt(_) => Technology::WifiRtt,
            CapabilityPayload::BleRssi(_) => Technology::BleRssi,
        }
    }

    /// Default payload for a technology
    pub fn defaults(technology: Technology) -> Self {
        match technology {
            Technology::Uwb => CapabilityPayload::Uwb(UwbCapability::default()),
            Technology::BleCs => CapabilityPayload::BleCs(CsCapability::default()),
            Technology::WifiRtt => CapabilityPayload::WifiRtt(RttCapability::default()),
            Technology::BleRssi => CapabilityPayload::BleRssi(RssiCapability::default()),
        }
    }
}

/// Availability plus optional payload for one technology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnologyCapability {
    pub availability: Availability,
    pub payload: Option<CapabilityPayload>,
}

impl TechnologyCapability {
    pub fn enabled(payload: CapabilityPayload) -> Self {
        Self {
            availability: Availability::Enabled,
            payload: Some(payload),
        }
    }

    pub fn not_supported() -> Self {
        Self {
            availability: Availability::NotSupported,
            payload: None,
        }
    }
}

/// Snapshot of local capabilities across all technologies
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    entries: HashMap<Technology, TechnologyCapability>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, technology: Technology, capability: TechnologyCapability) {
        self.entries.insert(technology, capability);
    }

    pub fn availability(&self, technology: Technology) -> Availability {
        self.entries
            .get(&technology)
            .map(|c| c.availability)
            .unwrap_or(Availability::NotSupported)
    }

    pub fn payload(&self, technology: Technology) -> Option<&CapabilityPayload> {
        self.entries.get(&technology).and_then(|c| c.payload.as_ref())
    }

    /// Technologies currently enabled
    pub fn enabled(&self) -> TechnologySet {
        self.entries
            .iter()
            .filter(|(_, c)| c.availability == Availability::Enabled)
            .map(|(t, _)| *t)
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Capability Sources
// ----------------------------------------------------------------------------

/// Probes one technology's stack for its current capability. Implemented by
/// the per-technology adapter layers.
pub trait CapabilitySource: Send + Sync {
    fn technology(&self) -> Technology;
    fn current(&self) -> TechnologyCapability;
}

// ----------------------------------------------------------------------------
// Capability Registry
// ----------------------------------------------------------------------------

/// Revocable handle for a registered capability listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

struct RegistryState {
    cached: Option<Capabilities>,
    listeners: HashMap<ListenerToken, mpsc::UnboundedSender<Capabilities>>,
}

/// Process-wide capability cache.
///
/// Guarded by its own lock, independent of any session lock: its lifecycle
/// spans sessions. Snapshots rebuild lazily and on every push notification.
pub struct CapabilityRegistry {
    sources: Vec<Box<dyn CapabilitySource>>,
    state: Mutex<RegistryState>,
    next_token: AtomicU64,
}

impl CapabilityRegistry {
    pub fn new(sources: Vec<Box<dyn CapabilitySource>>) -> Self {
        Self {
            sources,
            state: Mutex::new(RegistryState {
                cached: None,
                listeners: HashMap::new(),
            }),
            next_token: AtomicU64::new(1),
        }
    }

    /// Current capabilities, rebuilding the cache if stale
    pub fn snapshot(&self) -> Capabilities {
        let mut state = self.state.lock().expect("capability registry lock poisoned");
        if let Some(ref cached) = state.cached {
            return cached.clone();
        }
        let rebuilt = self.rebuild();
        state.cached = Some(rebuilt.clone());
        rebuilt
    }

    /// Register a listener; it receives a snapshot on every refresh until its
    /// channel closes or the token is revoked.
    pub fn register_listener(&self, sender: mpsc::UnboundedSender<Capabilities>) -> ListenerToken {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock().expect("capability registry lock poisoned");
        state.listeners.insert(token, sender);
        token
    }

    /// Revoke a previously registered listener
    pub fn unregister_listener(&self, token: ListenerToken) {
        let mut state = self.state.lock().expect("capability registry lock poisoned");
        state.listeners.remove(&token);
    }

    /// Handle a push notification from a technology stack: recompute the
    /// snapshot and broadcast it. Listeners whose channel has closed are
    /// pruned here.
    pub fn notify_push(&self, technology: Technology) {
        debug!(%technology, "capability push notification, refreshing snapshot");
        let rebuilt = self.rebuild();
        let mut state = self.state.lock().expect("capability registry lock poisoned");
        state.cached = Some(rebuilt.clone());
        state
            .listeners
            .retain(|_, sender| sender.send(rebuilt.clone()).is_ok());
    }

    fn rebuild(&self) -> Capabilities {
        let mut caps = Capabilities::new();
        for source in &self.sources {
            caps.insert(source.technology(), source.current());
        }
        // Anything without a source is not supported on this device
        for tech in Technology::PRIORITY_ORDER {
            if caps.availability(tech) == Availability::NotSupported
                && caps.payload(tech).is_none()
            {
                caps.insert(tech, TechnologyCapability::not_supported());
            }
        }
        caps
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        technology: Technology,
        capability: TechnologyCapability,
    }

    impl CapabilitySource for FixedSource {
        fn technology(&self) -> Technology {
            self.technology
        }

        fn current(&self) -> TechnologyCapability {
            self.capability.clone()
        }
    }

    fn uwb_registry() -> CapabilityRegistry {
        CapabilityRegistry::new(vec![Box::new(FixedSource {
            technology: Technology::Uwb,
            capability: TechnologyCapability::enabled(CapabilityPayload::defaults(
                Technology::Uwb,
            )),
        })])
    }

    #[test]
    fn test_snapshot_marks_missing_sources_not_supported() {
        let registry = uwb_registry();
        let caps = registry.snapshot();

        assert_eq!(caps.availability(Technology::Uwb), Availability::Enabled);
        assert_eq!(
            caps.availability(Technology::WifiRtt),
            Availability::NotSupported
        );
        assert!(caps.enabled().contains(Technology::Uwb));
        assert_eq!(caps.enabled().len(), 1);
    }

    #[tokio::test]
    async fn test_push_broadcasts_to_listeners() {
        let registry = uwb_registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register_listener(tx);

        registry.notify_push(Technology::Uwb);

        let caps = rx.recv().await.expect("listener should receive snapshot");
        assert_eq!(caps.availability(Technology::Uwb), Availability::Enabled);
    }

    #[tokio::test]
    async fn test_closed_listeners_are_pruned() {
        let registry = uwb_registry();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register_listener(tx);
        drop(rx);

        registry.notify_push(Technology::Uwb);

        let state = registry.state.lock().unwrap();
        assert!(state.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let registry = uwb_registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = registry.register_listener(tx);
        registry.unregister_listener(token);

        registry.notify_push(Technology::Uwb);
        assert!(rx.try_recv().is_err());
    }
}
