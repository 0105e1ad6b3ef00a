//! Client-facing session events
//!
//! Everything a client observes about a session arrives on one unbounded
//! channel as these events. Terminal events (`OpenFailed` per peer that
//! never started, `PeerStopped` per peer that had, `Closed` per session) are
//! each delivered exactly once.

use multirange_core::{
    DeviceId, RangingMeasurement, SelectionError, SessionHandle, StopReason, Technology,
};
use tokio::sync::mpsc;

/// Why a session or peer failed to open
#[derive(Debug, Clone, PartialEq)]
pub enum OpenFailedReason {
    /// The local device cannot satisfy the requested mode
    Unsupported,
    /// Negotiation with the peer found no usable configuration
    CapabilityMismatch(SelectionError),
    /// The peer's adapters never reached the started state
    FailedToStart(StopReason),
}

/// Events reported to the session's client
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session is live; peers are starting
    Opened { session: SessionHandle },
    /// The session (peer = None) or one peer (peer = Some) failed to open
    OpenFailed {
        session: SessionHandle,
        peer: Option<DeviceId>,
        reason: OpenFailedReason,
    },
    /// First adapter for this peer reported started
    PeerStarted {
        session: SessionHandle,
        peer: DeviceId,
    },
    /// One technology started ranging with this peer
    TechnologyStarted {
        session: SessionHandle,
        peer: DeviceId,
        technology: Technology,
    },
    /// One technology stopped ranging with this peer
    TechnologyStopped {
        session: SessionHandle,
        peer: DeviceId,
        technology: Technology,
    },
    /// One fused measurement for this peer
    Results {
        session: SessionHandle,
        peer: DeviceId,
        measurement: RangingMeasurement,
    },
    /// A peer that had started stopped for good
    PeerStopped {
        session: SessionHandle,
        peer: DeviceId,
        reason: StopReason,
    },
    /// The session closed; no further events follow
    Closed {
        session: SessionHandle,
        reason: StopReason,
    },
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventReceiver = mpsc::UnboundedReceiver<SessionEvent>;
