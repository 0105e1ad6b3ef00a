//! Binary wire codec for OOB messages
//!
//! Layout, all multi-byte integers little-endian:
//!
//! ```text
//! Header            := message_type:u8  protocol_version:u8
//! CapabilityRequest := Header  bitmap:u16
//! CapabilityResponse:= Header  bitmap:u16  count:u8
//!                      tech_id:u8 * count   (priority list)
//!                      Block * count        (in list order)
//! SetConfiguration  := Header  activate:u16  start:u16  count:u8  Block * count
//! Block             := tech_id:u8  block_size:u8  payload:[u8; block_size]
//! ```
//!
//! Decoding fails on truncation, unknown message types or technology ids,
//! bitmap/priority/block disagreement, duplicate priority entries, and
//! trailing bytes. Encoding is deterministic: identical logical messages
//! always produce byte-identical output.

use smallvec::SmallVec;

use crate::capabilities::{
    CapabilityPayload, CsCapability, RssiCapability, RttCapability, UwbCapability,
};
use crate::config::{CsParams, RssiParams, RttParams, TechnologyParams, UpdateRate, UwbParams};
use crate::errors::CodecError;
use crate::protocol::messages::{
    CapabilityRequest, CapabilityResponse, Header, MessageType, OobMessage, SetConfiguration,
    PROTOCOL_VERSION,
};
use crate::types::{DeviceRole, Technology, TechnologySet};

// ----------------------------------------------------------------------------
// Byte Reader
// ----------------------------------------------------------------------------

/// Bounds-checked cursor over a decode buffer
struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n - self.remaining(),
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.u8()? as i8)
    }

    fn u16_le(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.remaining() != 0 {
            return Err(CodecError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Encoder/decoder for the OOB message set
pub struct OobCodec;

impl OobCodec {
    /// Encode a message to its wire representation
    pub fn encode(message: &OobMessage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32);
        bytes.push(message.message_type().id());
        bytes.push(PROTOCOL_VERSION);

        match message {
            OobMessage::CapabilityRequest(req) => {
                bytes.extend_from_slice(&req.requested.bits().to_le_bytes());
            }
            OobMessage::CapabilityResponse(resp) => {
                let entries = resp.entries();
                bytes.extend_from_slice(&resp.technologies().bits().to_le_bytes());
                bytes.push(entries.len() as u8);
                for (tech, _) in entries {
                    bytes.push(tech.id());
                }
                for (tech, payload) in entries {
                    let body = encode_capability_payload(payload);
                    bytes.push(tech.id());
                    bytes.push(body.len() as u8);
                    bytes.extend_from_slice(&body);
                }
            }
            OobMessage::SetConfiguration(config) => {
                bytes.extend_from_slice(&config.activate.bits().to_le_bytes());
                bytes.extend_from_slice(&config.start_immediately.bits().to_le_bytes());
                bytes.push(config.configs.len() as u8);
                for params in &config.configs {
                    let body = encode_params(params);
                    bytes.push(params.technology().id());
                    bytes.push(body.len() as u8);
                    bytes.extend_from_slice(&body);
                }
            }
        }

        bytes
    }

    /// Decode a message from its wire representation
    pub fn decode(bytes: &[u8]) -> Result<OobMessage, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let header = Self::decode_header(&mut reader)?;

        let message = match header.message_type {
            MessageType::CapabilityRequest => {
                let bitmap = TechnologySet::from_bits(reader.u16_le()?);
                if bitmap.has_unknown_bits() {
                    return Err(CodecError::UnknownBitmapBits);
                }
                OobMessage::CapabilityRequest(CapabilityRequest { requested: bitmap })
            }
            MessageType::CapabilityResponse => {
                OobMessage::CapabilityResponse(Self::decode_capability_response(&mut reader)?)
            }
            MessageType::SetConfiguration => {
                OobMessage::SetConfiguration(Self::decode_set_configuration(&mut reader)?)
            }
        };

        reader.finish()?;
        Ok(message)
    }

    fn decode_header(reader: &mut ByteReader<'_>) -> Result<Header, CodecError> {
        let message_type = MessageType::from_id(reader.u8()?)?;
        let protocol_version = reader.u8()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(protocol_version));
        }
        Ok(Header {
            message_type,
            protocol_version,
        })
    }

    fn decode_capability_response(
        reader: &mut ByteReader<'_>,
    ) -> Result<CapabilityResponse, CodecError> {
        let bitmap = TechnologySet::from_bits(reader.u16_le()?);
        if bitmap.has_unknown_bits() {
            return Err(CodecError::UnknownBitmapBits);
        }

        // Priority list, duplicates rejected
        let count = reader.u8()? as usize;
        let mut priority: SmallVec<[Technology; 4]> = SmallVec::new();
        let mut seen = TechnologySet::empty();
        for _ in 0..count {
            let id = reader.u8()?;
            let tech = Technology::from_id(id).ok_or(CodecError::UnknownTechnology(id))?;
            if seen.contains(tech) {
                return Err(CodecError::DuplicatePriority(tech));
            }
            seen.insert(tech);
            priority.push(tech);
        }

        // Bitmap must agree with the priority list exactly
        for tech in bitmap.iter() {
            if !seen.contains(tech) {
                return Err(CodecError::BitmapPriorityMismatch(tech));
            }
        }
        for tech in &priority {
            if !bitmap.contains(*tech) {
                return Err(CodecError::BitmapPriorityMismatch(*tech));
            }
        }

        // One block per priority entry, in priority order
        let mut entries = Vec::with_capacity(priority.len());
        for expected in &priority {
            let id = reader.u8()?;
            let tech = Technology::from_id(id).ok_or(CodecError::UnknownTechnology(id))?;
            if tech != *expected {
                return Err(CodecError::UnexpectedBlock(tech));
            }
            let size = reader.u8()? as usize;
            let body = reader.take(size)?;
            let payload = decode_capability_payload(tech, body)?;
            entries.push((tech, payload));
        }

        CapabilityResponse::new(entries)
    }

    fn decode_set_configuration(
        reader: &mut ByteReader<'_>,
    ) -> Result<SetConfiguration, CodecError> {
        let activate = TechnologySet::from_bits(reader.u16_le()?);
        let start_immediately = TechnologySet::from_bits(reader.u16_le()?);
        if activate.has_unknown_bits() || start_immediately.has_unknown_bits() {
            return Err(CodecError::UnknownBitmapBits);
        }

        let count = reader.u8()? as usize;
        let mut configs = Vec::with_capacity(count);
        let mut seen = TechnologySet::empty();
        for _ in 0..count {
            let id = reader.u8()?;
            let tech = Technology::from_id(id).ok_or(CodecError::UnknownTechnology(id))?;
            if seen.contains(tech) {
                return Err(CodecError::UnexpectedBlock(tech));
            }
            seen.insert(tech);
            let size = reader.u8()? as usize;
            let body = reader.take(size)?;
            configs.push(decode_params(tech, body)?);
        }

        Ok(SetConfiguration {
            activate,
            start_immediately,
            configs,
        })
    }
}

// ----------------------------------------------------------------------------
// Capability Payload Blocks
// ----------------------------------------------------------------------------

fn rate_mask(rates: &[UpdateRate]) -> u8 {
    rates.iter().fold(0u8, |acc, r| acc | (1 << r.id()))
}

fn rates_from_mask(mask: u8) -> SmallVec<[UpdateRate; 3]> {
    [UpdateRate::Frequent, UpdateRate::Normal, UpdateRate::Infrequent]
        .into_iter()
        .filter(|r| mask & (1 << r.id()) != 0)
        .collect()
}

fn encode_capability_payload(payload: &CapabilityPayload) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    match payload {
        CapabilityPayload::Uwb(uwb) => {
            let mut flags = 0u8;
            if uwb.supports_azimuth {
                flags |= 0x01;
            }
            if uwb.supports_elevation {
                flags |= 0x02;
            }
            body.push(flags);
            body.push(rate_mask(&uwb.supported_rates));
            body.push(uwb.supported_channels.len() as u8);
            body.extend_from_slice(&uwb.supported_channels);
        }
        CapabilityPayload::BleCs(cs) => {
            body.push(cs.security_levels.len() as u8);
            body.extend_from_slice(&cs.security_levels);
        }
        CapabilityPayload::WifiRtt(rtt) => {
            body.push(u8::from(rtt.supports_one_sided));
            body.push(rtt.bandwidths_mhz.len() as u8);
            for bw in &rtt.bandwidths_mhz {
                body.extend_from_slice(&bw.to_le_bytes());
            }
        }
        CapabilityPayload::BleRssi(rssi) => {
            body.push(rate_mask(&rssi.supported_rates));
        }
    }
    body
}

fn decode_capability_payload(
    technology: Technology,
    body: &[u8],
) -> Result<CapabilityPayload, CodecError> {
    let mut reader = ByteReader::new(body);
    let payload = match technology {
        Technology::Uwb => {
            let flags = reader.u8()?;
            let rates = rates_from_mask(reader.u8()?);
            let channel_count = reader.u8()? as usize;
            let channels = SmallVec::from_slice(reader.take(channel_count)?);
            CapabilityPayload::Uwb(UwbCapability {
                supported_channels: channels,
                supported_rates: rates,
                supports_azimuth: flags & 0x01 != 0,
                supports_elevation: flags & 0x02 != 0,
            })
        }
        Technology::BleCs => {
            let count = reader.u8()? as usize;
            let levels = SmallVec::from_slice(reader.take(count)?);
            CapabilityPayload::BleCs(CsCapability {
                security_levels: levels,
            })
        }
        Technology::WifiRtt => {
            let supports_one_sided = reader.u8()? != 0;
            let count = reader.u8()? as usize;
            let mut bandwidths = SmallVec::new();
            for _ in 0..count {
                bandwidths.push(reader.u16_le()?);
            }
            CapabilityPayload::WifiRtt(RttCapability {
                bandwidths_mhz: bandwidths,
                supports_one_sided,
            })
        }
        Technology::BleRssi => CapabilityPayload::BleRssi(RssiCapability {
            supported_rates: rates_from_mask(reader.u8()?),
        }),
    };
    reader.finish().map_err(|_| CodecError::MalformedBlock {
        technology,
        reason: "trailing bytes in capability block",
    })?;
    Ok(payload)
}

// ----------------------------------------------------------------------------
// Config Parameter Blocks
// ----------------------------------------------------------------------------

fn role_id(role: DeviceRole) -> u8 {
    match role {
        DeviceRole::Initiator => 0,
        DeviceRole::Responder => 1,
    }
}

fn role_from_id(technology: Technology, id: u8) -> Result<DeviceRole, CodecError> {
    match id {
        0 => Ok(DeviceRole::Initiator),
        1 => Ok(DeviceRole::Responder),
        _ => Err(CodecError::MalformedBlock {
            technology,
            reason: "invalid device role",
        }),
    }
}

fn update_rate_from_id(technology: Technology, id: u8) -> Result<UpdateRate, CodecError> {
    UpdateRate::from_id(id).ok_or(CodecError::MalformedBlock {
        technology,
        reason: "invalid update rate",
    })
}

fn encode_params(params: &TechnologyParams) -> Vec<u8> {
    let mut body = Vec::with_capacity(16);
    match params {
        TechnologyParams::Uwb(uwb) => {
            body.extend_from_slice(&uwb.session_id.to_le_bytes());
            body.push(uwb.channel);
            body.push(uwb.preamble_index);
            body.push(uwb.update_rate.id());
            body.extend_from_slice(&uwb.sts_key);
            body.push(role_id(uwb.role));
        }
        TechnologyParams::BleCs(cs) => {
            body.push(cs.security_level);
            body.push(role_id(cs.role));
        }
        TechnologyParams::WifiRtt(rtt) => {
            body.push(rtt.channel);
            body.extend_from_slice(&rtt.bandwidth_mhz.to_le_bytes());
        }
        TechnologyParams::BleRssi(rssi) => {
            body.push(rssi.update_rate.id());
            body.push(rssi.tx_power_dbm as u8);
        }
    }
    body
}

fn decode_params(technology: Technology, body: &[u8]) -> Result<TechnologyParams, CodecError> {
    let mut reader = ByteReader::new(body);
    let params = match technology {
        Technology::Uwb => {
            let session_id = reader.u32_le()?;
            let channel = reader.u8()?;
            let preamble_index = reader.u8()?;
            let update_rate = update_rate_from_id(technology, reader.u8()?)?;
            let mut sts_key = [0u8; 8];
            sts_key.copy_from_slice(reader.take(8)?);
            let role = role_from_id(technology, reader.u8()?)?;
            TechnologyParams::Uwb(UwbParams {
                session_id,
                channel,
                preamble_index,
                update_rate,
                sts_key,
                role,
            })
        }
        Technology::BleCs => {
            let security_level = reader.u8()?;
            let role = role_from_id(technology, reader.u8()?)?;
            TechnologyParams::BleCs(CsParams {
                security_level,
                role,
            })
        }
        Technology::WifiRtt => {
            let channel = reader.u8()?;
            let bandwidth_mhz = reader.u16_le()?;
            TechnologyParams::WifiRtt(RttParams {
                channel,
                bandwidth_mhz,
            })
        }
        Technology::BleRssi => {
            let update_rate = update_rate_from_id(technology, reader.u8()?)?;
            let tx_power_dbm = reader.i8()?;
            TechnologyParams::BleRssi(RssiParams {
                update_rate,
                tx_power_dbm,
            })
        }
    };
    reader.finish().map_err(|_| CodecError::MalformedBlock {
        technology,
        reason: "trailing bytes in config block",
    })?;
    Ok(params)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
