//! Core protocol and negotiation logic for the multirange orchestrator
//!
//! This crate holds everything that does not spawn tasks: the shared type
//! vocabulary, the error taxonomy, technology configuration, the capability
//! model and registry, the OOB wire codec, the negotiation algorithm, the
//! fusion engine, and the adapter/transport trait seams. The tokio
//! orchestration lives in `multirange-runtime`.

pub mod adapter;
pub mod capabilities;
pub mod config;
pub mod errors;
pub mod fusion;
pub mod protocol;
pub mod selector;
pub mod transport;
pub mod types;

pub use adapter::{
    AdapterEvent, AdapterEventSender, AdapterFactory, AttributionContext, TechnologyAdapter,
};
pub use capabilities::{
    Availability, Capabilities, CapabilityPayload, CapabilityRegistry, CapabilitySource,
    ListenerToken, TechnologyCapability,
};
pub use config::{
    select_update_rate, ConfigTarget, FusionPolicy, IntervalRange, RangingMode, SessionConfig,
    TechnologyConfig, TechnologyParams, UpdateRate,
};
pub use errors::{
    AdapterError, CodecError, RangingError, Result, SelectionError, SessionError,
};
pub use fusion::{FusionEngine, FusionStrategy, PriorityWeightedStrategy};
pub use protocol::{
    CapabilityRequest, CapabilityResponse, OobCodec, OobMessage, SetConfiguration,
};
pub use selector::{ConfigSelector, PeerSelection, SelectionOutcome};
pub use transport::{OobEvent, OobTransport};
pub use types::{
    DeviceId, DeviceRole, RangingMeasurement, SessionHandle, StopReason, Technology,
    TechnologySet, Timestamp,
};
