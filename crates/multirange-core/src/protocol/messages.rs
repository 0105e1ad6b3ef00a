//! OOB message types
//!
//! The tagged union of messages the orchestrator exchanges with peers:
//! a capability request soliciting a response, the capability response
//! itself, and the configuration distribution message.

use crate::capabilities::CapabilityPayload;
use crate::config::TechnologyParams;
use crate::errors::CodecError;
use crate::types::{Technology, TechnologySet};

/// Current OOB protocol version
pub const PROTOCOL_VERSION: u8 = 1;

// ----------------------------------------------------------------------------
// Header
// ----------------------------------------------------------------------------

/// Message discriminator carried in every header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    CapabilityRequest,
    CapabilityResponse,
    SetConfiguration,
}

impl MessageType {
    pub fn id(&self) -> u8 {
        match self {
            MessageType::CapabilityRequest => 0x01,
            MessageType::CapabilityResponse => 0x02,
            MessageType::SetConfiguration => 0x03,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, CodecError> {
        match id {
            0x01 => Ok(MessageType::CapabilityRequest),
            0x02 => Ok(MessageType::CapabilityResponse),
            0x03 => Ok(MessageType::SetConfiguration),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

/// Two-byte header opening every OOB message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub protocol_version: u8,
}

impl Header {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Solicits a [`CapabilityResponse`] for the requested technologies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub requested: TechnologySet,
}

/// Advertises the sender's capabilities, one block per supported technology.
///
/// Entries are kept in the sender's priority order; the wire bitmap and the
/// block sequence are both derived from (and validated against) this list.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityResponse {
    entries: Vec<(Technology, CapabilityPayload)>,
}

impl CapabilityResponse {
    /// Build a response from priority-ordered entries. Fails on duplicate
    /// technologies so an invalid message cannot be constructed, let alone
    /// encoded.
    pub fn new(entries: Vec<(Technology, CapabilityPayload)>) -> Result<Self, CodecError> {
        let mut seen = TechnologySet::empty();
        for (tech, payload) in &entries {
            debug_assert_eq!(*tech, payload.technology());
            if seen.contains(*tech) {
                return Err(CodecError::DuplicatePriority(*tech));
            }
            seen.insert(*tech);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[(Technology, CapabilityPayload)] {
        &self.entries
    }

    /// Advertised technologies as a bitmap
    pub fn technologies(&self) -> TechnologySet {
        self.entries.iter().map(|(t, _)| *t).collect()
    }

    /// Sender's priority order
    pub fn priority(&self) -> impl Iterator<Item = Technology> + '_ {
        self.entries.iter().map(|(t, _)| *t)
    }

    pub fn payload_for(&self, technology: Technology) -> Option<&CapabilityPayload> {
        self.entries
            .iter()
            .find(|(t, _)| *t == technology)
            .map(|(_, p)| p)
    }
}

/// Distributes the negotiated configuration to one peer: which technologies
/// to activate, which of those to start ranging with immediately, and the
/// parameters the peer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SetConfiguration {
    pub activate: TechnologySet,
    pub start_immediately: TechnologySet,
    pub configs: Vec<TechnologyParams>,
}

/// Tagged union of every OOB message
#[derive(Debug, Clone, PartialEq)]
pub enum OobMessage {
    CapabilityRequest(CapabilityRequest),
    CapabilityResponse(CapabilityResponse),
    SetConfiguration(SetConfiguration),
}

impl OobMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            OobMessage::CapabilityRequest(_) => MessageType::CapabilityRequest,
            OobMessage::CapabilityResponse(_) => MessageType::CapabilityResponse,
            OobMessage::SetConfiguration(_) => MessageType::SetConfiguration,
        }
    }
}
