//! Technology adapter seam
//!
//! Each ranging technology's hardware stack sits behind this trait: start,
//! stop, and an event callback channel. Adapters are built per technology by
//! an external factory; the orchestrator is polymorphic only over this
//! surface and never reaches into ranging physics.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{IntervalRange, TechnologyConfig};
use crate::errors::{AdapterError, Result};
use crate::types::{DeviceId, RangingMeasurement, StopReason, Technology};

// ----------------------------------------------------------------------------
// Caller Attribution
// ----------------------------------------------------------------------------

/// Caller identity, resolved once at the orchestrator boundary and passed by
/// value into adapter starts. Never re-derived below this point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributionContext {
    pub package: String,
    pub uid: u32,
}

impl AttributionContext {
    pub fn new<P: Into<String>>(package: P, uid: u32) -> Self {
        Self {
            package: package.into(),
            uid,
        }
    }
}

// ----------------------------------------------------------------------------
// Adapter Events
// ----------------------------------------------------------------------------

/// Events an adapter reports back to its owning peer state machine.
///
/// A multicast adapter serves several peers with one session and tags every
/// event with the peers it concerns.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// The underlying session started for the given peers
    Started {
        technology: Technology,
        peers: Vec<DeviceId>,
    },
    /// The underlying session stopped for the given peers
    Stopped {
        technology: Technology,
        peers: Vec<DeviceId>,
        reason: StopReason,
    },
    /// One measurement for one peer
    RangingData {
        technology: Technology,
        peer: DeviceId,
        measurement: RangingMeasurement,
    },
    /// The whole adapter session closed
    Closed {
        technology: Technology,
        reason: StopReason,
    },
}

impl AdapterEvent {
    pub fn technology(&self) -> Technology {
        match self {
            AdapterEvent::Started { technology, .. }
            | AdapterEvent::Stopped { technology, .. }
            | AdapterEvent::RangingData { technology, .. }
            | AdapterEvent::Closed { technology, .. } => *technology,
        }
    }
}

/// Channel on which an adapter delivers its events
pub type AdapterEventSender = mpsc::UnboundedSender<AdapterEvent>;

// ----------------------------------------------------------------------------
// Adapter Trait
// ----------------------------------------------------------------------------

/// One technology's hardware stack behind start/stop/callback.
///
/// `start` and `stop` return once the request is handed to the stack; actual
/// state changes arrive asynchronously on the event channel. Dynamic peer
/// management and reconfiguration default to unsupported.
#[async_trait]
pub trait TechnologyAdapter: Send {
    fn technology(&self) -> Technology;

    async fn start(
        &mut self,
        config: TechnologyConfig,
        context: AttributionContext,
        events: AdapterEventSender,
    ) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    async fn add_peer(&mut self, _peer: DeviceId) -> Result<()> {
        Err(AdapterError::Unsupported {
            technology: self.technology(),
        }
        .into())
    }

    async fn remove_peer(&mut self, _peer: DeviceId) -> Result<()> {
        Err(AdapterError::Unsupported {
            technology: self.technology(),
        }
        .into())
    }

    async fn reconfigure(&mut self, _interval: IntervalRange) -> Result<()> {
        Err(AdapterError::Unsupported {
            technology: self.technology(),
        }
        .into())
    }

    /// App moved to the foreground
    fn on_foreground(&mut self) {}

    /// App moved to the background
    fn on_background(&mut self) {}

    /// Background grace period expired
    fn on_background_timeout(&mut self) {}
}

/// Builds adapters per technology. One adapter instance serves all the peers
/// of one config (one peer for unicast, the whole group for multicast).
pub trait AdapterFactory: Send + Sync {
    fn create(&self, technology: Technology) -> Result<Box<dyn TechnologyAdapter>>;
}
