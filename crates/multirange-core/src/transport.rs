//! Out-of-band transport seam
//!
//! The OOB channel is a bidirectional byte-message pipe keyed by
//! (session, peer), supplied by the host platform. The orchestrator only
//! sends bytes; inbound traffic and connection lifecycle arrive as
//! [`OobEvent`]s routed through the session manager's task queue.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{DeviceId, SessionHandle};

/// Outbound half of the OOB channel
#[async_trait]
pub trait OobTransport: Send + Sync {
    /// Send one message to the peer of a session
    async fn send(&self, session: SessionHandle, peer: DeviceId, bytes: Vec<u8>) -> Result<()>;
}

/// Inbound OOB traffic and transport lifecycle, keyed by (session, peer)
#[derive(Debug, Clone)]
pub enum OobEvent {
    /// A message arrived from the peer
    Delivered {
        session: SessionHandle,
        peer: DeviceId,
        bytes: Vec<u8>,
    },
    /// The channel to the peer dropped
    Disconnected {
        session: SessionHandle,
        peer: DeviceId,
    },
    /// The channel to the peer came back
    Reconnected {
        session: SessionHandle,
        peer: DeviceId,
    },
    /// The channel closed for good
    Closed {
        session: SessionHandle,
        peer: DeviceId,
    },
}
