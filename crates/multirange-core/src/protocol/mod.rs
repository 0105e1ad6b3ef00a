//! Out-of-band capability and configuration protocol
//!
//! Messages exchanged with peers over an externally supplied transport to
//! agree on which technologies to range with and how. The wire format is a
//! compact self-describing binary codec; see [`wire`].

pub mod messages;
pub mod wire;

pub use messages::{
    CapabilityRequest, CapabilityResponse, Header, MessageType, OobMessage, SetConfiguration,
    PROTOCOL_VERSION,
};
pub use wire::OobCodec;
