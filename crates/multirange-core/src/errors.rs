//! Error taxonomy for the ranging orchestrator
//!
//! Four failure domains: configuration selection, OOB codec, adapter, and
//! session management. Each is its own enum so call sites can match on the
//! domain they care about; `RangingError` unifies them for crate boundaries.

use crate::types::{DeviceId, SessionHandle, Technology};

// ----------------------------------------------------------------------------
// Selection Errors
// ----------------------------------------------------------------------------

/// Negotiation/config-selection failures. These surface to the client as
/// open-failed events, never as panics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("no local technology usable for the requested mode")]
    NoLocalTechnology,
    #[error("peer {peer} supports none of the locally usable technologies")]
    NoMutualTechnology { peer: DeviceId },
    #[error("peer {peer} does not support {technology}, required by the requested mode")]
    RequiredTechnologyMissing {
        peer: DeviceId,
        technology: Technology,
    },
    #[error("no discrete update rate fits the preferred interval range for {technology}")]
    NoUsableUpdateRate { technology: Technology },
    #[error("no {technology} channel is supported by both sides")]
    NoUsableChannel { technology: Technology },
    #[error("peer {peer} already answered this negotiation")]
    DuplicateResponse { peer: DeviceId },
    #[error("peer {peer} sent a malformed capability response")]
    MalformedResponse { peer: DeviceId },
    #[error("peer {peer} became unreachable during negotiation")]
    PeerUnreachable { peer: DeviceId },
    #[error("peer {peer} is not part of this negotiation")]
    UnknownPeer { peer: DeviceId },
}

// ----------------------------------------------------------------------------
// Codec Errors
// ----------------------------------------------------------------------------

/// OOB wire decode failures. A malformed message fails only the sending
/// peer's negotiation; it must never abort the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("buffer truncated: needed {needed} more byte(s), {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown technology id {0:#04x}")]
    UnknownTechnology(u8),
    #[error("duplicate technology {0} in priority list")]
    DuplicatePriority(Technology),
    #[error("bitmap and priority list disagree: {0} has no matching entry")]
    BitmapPriorityMismatch(Technology),
    #[error("block sequence disagrees with bitmap: unexpected block for {0}")]
    UnexpectedBlock(Technology),
    #[error("bitmap carries bits for no known technology")]
    UnknownBitmapBits,
    #[error("{0} byte(s) of trailing data after message end")]
    TrailingBytes(usize),
    #[error("block payload malformed for {technology}: {reason}")]
    MalformedBlock {
        technology: Technology,
        reason: &'static str,
    },
}

// ----------------------------------------------------------------------------
// Adapter Errors
// ----------------------------------------------------------------------------

/// Failures crossing the technology-adapter boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter for {technology} failed to start: {reason}")]
    StartFailed {
        technology: Technology,
        reason: String,
    },
    #[error("adapter for {technology} failed to stop: {reason}")]
    StopFailed {
        technology: Technology,
        reason: String,
    },
    #[error("operation not supported by the {technology} adapter")]
    Unsupported { technology: Technology },
    #[error("no adapter available for {technology}")]
    Unavailable { technology: Technology },
}

// ----------------------------------------------------------------------------
// Session Errors
// ----------------------------------------------------------------------------

/// Session-manager level failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session {handle} not found")]
    SessionNotFound { handle: SessionHandle },
    #[error("peer {peer} not found in session {handle}")]
    PeerNotFound {
        handle: SessionHandle,
        peer: DeviceId,
    },
    #[error("session {handle} already exists")]
    SessionAlreadyExists { handle: SessionHandle },
    #[error("session {handle} has no peers")]
    NoPeers { handle: SessionHandle },
    #[error("session task queue closed")]
    QueueClosed,
    #[error("OOB transport send to peer {peer} failed: {reason}")]
    TransportSend { peer: DeviceId, reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Crate-wide error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangingError {
    #[error("selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl RangingError {
    /// Create a transport-send session error
    pub fn transport_send<R: Into<String>>(peer: DeviceId, reason: R) -> Self {
        RangingError::Session(SessionError::TransportSend {
            peer,
            reason: reason.into(),
        })
    }

    /// Create an adapter start failure
    pub fn start_failed<R: Into<String>>(technology: Technology, reason: R) -> Self {
        RangingError::Adapter(AdapterError::StartFailed {
            technology,
            reason: reason.into(),
        })
    }
}

pub type Result<T> = core::result::Result<T, RangingError>;
