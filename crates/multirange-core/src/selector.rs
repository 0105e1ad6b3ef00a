//! Configuration selection and negotiation
//!
//! Given local capabilities and a ranging-mode preference, the selector
//! consumes one capability response per peer, intersects support under the
//! mode policy, restricts technology parameters to what both sides can
//! honor, and finally emits the local config set plus one configuration
//! message per peer. Peers sharing byte-identical parameters collapse into
//! one multicast config.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::capabilities::{Capabilities, CapabilityPayload};
use crate::config::{
    select_update_rate, ConfigTarget, IntervalRange, RangingMode, SessionConfig, TechnologyConfig,
    TechnologyParams,
};
use crate::errors::SelectionError;
use crate::protocol::{CapabilityRequest, CapabilityResponse, SetConfiguration};
use crate::types::{DeviceId, Technology, TechnologySet};

// ----------------------------------------------------------------------------
// Selection Outcome
// ----------------------------------------------------------------------------

/// Per-peer result of a completed negotiation
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSelection {
    pub peer: DeviceId,
    /// Technologies agreed for this peer (full mutual set in Fused mode)
    pub negotiated: TechnologySet,
    /// Technologies the peer should start ranging with immediately. Kept
    /// distinct from `negotiated` so callers can defer technologies without
    /// re-negotiating.
    pub start_immediately: TechnologySet,
    /// Parameters per negotiated technology
    pub params: Vec<TechnologyParams>,
}

/// Final product of a negotiation round
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOutcome {
    /// Local configs, multicast-grouped, handed to the peer state machines
    pub local_configs: Vec<TechnologyConfig>,
    /// One configuration message per successfully negotiated peer
    pub peer_messages: Vec<(DeviceId, SetConfiguration)>,
    /// Peers whose negotiation failed, with the reason
    pub failed_peers: Vec<(DeviceId, SelectionError)>,
}

// ----------------------------------------------------------------------------
// Config Selector
// ----------------------------------------------------------------------------

/// Drives one negotiation round for a set of peers
pub struct ConfigSelector {
    local: Capabilities,
    mode: RangingMode,
    preferred_interval: IntervalRange,
    /// Locally usable technologies for the requested mode
    candidates: TechnologySet,
    pending: Vec<DeviceId>,
    selections: HashMap<DeviceId, PeerSelection>,
    failures: Vec<(DeviceId, SelectionError)>,
}

impl ConfigSelector {
    /// Start a negotiation. Fails immediately when no local technology can
    /// satisfy the requested mode.
    pub fn new(
        local: Capabilities,
        session: &SessionConfig,
        peers: Vec<DeviceId>,
    ) -> Result<Self, SelectionError> {
        let enabled = local.enabled();
        let candidates = match session.mode {
            RangingMode::HighAccuracy => {
                if enabled.contains(Technology::Uwb) {
                    let mut set = TechnologySet::empty();
                    set.insert(Technology::Uwb);
                    set
                } else {
                    TechnologySet::empty()
                }
            }
            RangingMode::Auto | RangingMode::HighAccuracyPreferred | RangingMode::Fused => enabled,
        };

        if candidates.is_empty() {
            return Err(SelectionError::NoLocalTechnology);
        }

        Ok(Self {
            local,
            mode: session.mode,
            preferred_interval: session.preferred_interval,
            candidates,
            pending: peers,
            selections: HashMap::new(),
            failures: Vec::new(),
        })
    }

    /// The request to send to every peer in this round
    pub fn capability_request(&self) -> CapabilityRequest {
        CapabilityRequest {
            requested: self.candidates,
        }
    }

    /// Peers that have not answered yet
    pub fn pending_peers(&self) -> &[DeviceId] {
        &self.pending
    }

    /// True once every peer has either answered or failed
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record that a peer cannot answer (malformed response, transport loss).
    /// Fails that peer only; the round continues for the rest.
    pub fn fail_peer(&mut self, peer: DeviceId, error: SelectionError) {
        if self.take_pending(peer) {
            warn!(%peer, %error, "peer negotiation failed");
            self.failures.push((peer, error));
        }
    }

    /// Consume one peer's capability response
    pub fn handle_response(
        &mut self,
        peer: DeviceId,
        response: &CapabilityResponse,
    ) -> Result<(), SelectionError> {
        if self.selections.contains_key(&peer) {
            return Err(SelectionError::DuplicateResponse { peer });
        }
        if !self.take_pending(peer) {
            return Err(SelectionError::UnknownPeer { peer });
        }

        match self.select_for_peer(peer, response) {
            Ok(selection) => {
                debug!(%peer, negotiated = ?selection.negotiated, "peer negotiation succeeded");
                self.selections.insert(peer, selection);
                Ok(())
            }
            Err(error) => {
                warn!(%peer, %error, "peer negotiation failed");
                self.failures.push((peer, error.clone()));
                Err(error)
            }
        }
    }

    /// Produce the final local configs and per-peer messages. Callable once
    /// the round is complete; peers that failed appear in `failed_peers`.
    pub fn finish(self) -> SelectionOutcome {
        let mut selections: Vec<PeerSelection> = self.selections.into_values().collect();
        // Deterministic output independent of response arrival order
        selections.sort_by_key(|s| s.peer);

        let local_configs = group_configs(&selections);
        let peer_messages = selections
            .into_iter()
            .map(|s| {
                (
                    s.peer,
                    SetConfiguration {
                        activate: s.negotiated,
                        start_immediately: s.start_immediately,
                        configs: s.params,
                    },
                )
            })
            .collect();

        SelectionOutcome {
            local_configs,
            peer_messages,
            failed_peers: self.failures,
        }
    }

    // ------------------------------------------------------------------
    // Per-peer policy
    // ------------------------------------------------------------------

    fn take_pending(&mut self, peer: DeviceId) -> bool {
        if let Some(index) = self.pending.iter().position(|p| *p == peer) {
            self.pending.swap_remove(index);
            true
        } else {
            false
        }
    }

    fn select_for_peer(
        &self,
        peer: DeviceId,
        response: &CapabilityResponse,
    ) -> Result<PeerSelection, SelectionError> {
        let mutual = self.candidates.intersect(&response.technologies());

        let negotiated = match self.mode {
            RangingMode::HighAccuracy => {
                if !mutual.contains(Technology::Uwb) {
                    return Err(SelectionError::RequiredTechnologyMissing {
                        peer,
                        technology: Technology::Uwb,
                    });
                }
                let mut set = TechnologySet::empty();
                set.insert(Technology::Uwb);
                set
            }
            RangingMode::Auto | RangingMode::HighAccuracyPreferred => {
                let best = mutual
                    .highest_priority()
                    .ok_or(SelectionError::NoMutualTechnology { peer })?;
                let mut set = TechnologySet::empty();
                set.insert(best);
                set
            }
            RangingMode::Fused => {
                if mutual.is_empty() {
                    return Err(SelectionError::NoMutualTechnology { peer });
                }
                mutual
            }
        };

        let mut params = Vec::with_capacity(negotiated.len());
        for tech in negotiated.iter() {
            params.push(self.restrict_params(tech, response.payload_for(tech))?);
        }

        Ok(PeerSelection {
            peer,
            negotiated,
            start_immediately: negotiated,
            params,
        })
    }

    /// Restrict the local default parameters for a technology against the
    /// peer's advertised capability payload.
    fn restrict_params(
        &self,
        technology: Technology,
        peer_payload: Option<&CapabilityPayload>,
    ) -> Result<TechnologyParams, SelectionError> {
        let mut params = TechnologyParams::defaults(technology);

        match (&mut params, peer_payload, self.local.payload(technology)) {
            (
                TechnologyParams::Uwb(uwb),
                Some(CapabilityPayload::Uwb(peer)),
                Some(CapabilityPayload::Uwb(local)),
            ) => {
                uwb.update_rate = select_update_rate(technology, &self.preferred_interval)?;
                if !peer.supported_rates.contains(&uwb.update_rate)
                    || !local.supported_rates.contains(&uwb.update_rate)
                {
                    return Err(SelectionError::NoUsableUpdateRate { technology });
                }
                // First channel both sides support, in local preference order
                uwb.channel = local
                    .supported_channels
                    .iter()
                    .copied()
                    .find(|c| peer.supported_channels.contains(c))
                    .ok_or(SelectionError::NoUsableChannel { technology })?;
            }
            (TechnologyParams::BleRssi(rssi), Some(CapabilityPayload::BleRssi(peer)), _) => {
                rssi.update_rate = select_update_rate(technology, &self.preferred_interval)?;
                if !peer.supported_rates.contains(&rssi.update_rate) {
                    return Err(SelectionError::NoUsableUpdateRate { technology });
                }
            }
            (TechnologyParams::BleCs(cs), Some(CapabilityPayload::BleCs(peer)), _) => {
                if let Some(level) = peer.security_levels.iter().copied().max() {
                    cs.security_level = level;
                }
            }
            (TechnologyParams::WifiRtt(rtt), Some(CapabilityPayload::WifiRtt(peer)), _) => {
                if let Some(bw) = peer.bandwidths_mhz.iter().copied().max() {
                    rtt.bandwidth_mhz = bw;
                }
            }
            // Peer advertised the technology without a payload: defaults stand
            _ => {}
        }

        Ok(params)
    }
}

// ----------------------------------------------------------------------------
// Multicast Grouping
// ----------------------------------------------------------------------------

/// Merge per-peer selections into the local config set: peers requesting one
/// technology with byte-identical parameters share one multicast config, any
/// differing field yields separate unicast configs.
fn group_configs(selections: &[PeerSelection]) -> Vec<TechnologyConfig> {
    let mut groups: Vec<(TechnologyParams, Vec<DeviceId>)> = Vec::new();

    for selection in selections {
        for params in &selection.params {
            match groups.iter_mut().find(|(p, _)| p == params) {
                Some((_, peers)) => peers.push(selection.peer),
                None => groups.push((params.clone(), vec![selection.peer])),
            }
        }
    }

    groups
        .into_iter()
        .map(|(params, peers)| {
            let target = if peers.len() == 1 {
                ConfigTarget::Unicast(peers[0])
            } else {
                ConfigTarget::Multicast(peers)
            };
            TechnologyConfig { target, params }
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
