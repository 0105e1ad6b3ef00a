//! Tokio runtime for the multirange orchestrator
//!
//! Everything that spawns: the ordered session-manager loop, per-peer state
//! machines with their liveness timers, shared adapter handles with event
//! fan-out, and the worker pool that keeps hardware calls off the manager
//! loop. The protocol and negotiation logic lives in `multirange-core`.

pub mod adapters;
pub mod builder;
pub mod events;
pub mod peer;
pub mod session;
pub mod timers;
pub mod workers;

pub use adapters::{AppVisibility, SharedAdapterHandle};
pub use builder::{Orchestrator, OrchestratorBuilder};
pub use events::{OpenFailedReason, SessionEvent, SessionEventReceiver, SessionEventSender};
pub use peer::{PeerLifecycle, PeerNotice, PeerNoticeSender, PeerStateMachine};
pub use session::SessionManager;
pub use timers::LivenessTimer;
pub use workers::WorkerPool;
