//! Session management
//!
//! One manager task owns every session. All mutations arrive as tasks on one
//! unbounded queue and are processed strictly in order, so negotiation,
//! lifecycle, and OOB traffic never race each other. Adapter hardware calls
//! are the only thing allowed off this loop; they run on the worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use multirange_core::{
    AdapterFactory, AttributionContext, Capabilities, CapabilityRegistry, CapabilityRequest,
    CapabilityResponse, ConfigSelector, DeviceId, IntervalRange, OobCodec, OobEvent, OobMessage,
    OobTransport, SelectionError, SessionConfig, SessionError, SessionHandle, StopReason,
    TechnologyConfig,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapters::{AppVisibility, SharedAdapterHandle};
use crate::events::{OpenFailedReason, SessionEvent, SessionEventReceiver, SessionEventSender};
use crate::peer::{PeerNotice, PeerStateMachine};
use crate::workers::WorkerPool;

// ----------------------------------------------------------------------------
// Session Tasks
// ----------------------------------------------------------------------------

/// Work items for the manager loop. Public entry points enqueue and return;
/// the loop applies them in arrival order.
enum SessionTask {
    Start {
        handle: SessionHandle,
        config: SessionConfig,
        peers: Vec<DeviceId>,
        /// Pre-agreed local configs; skips the negotiation round
        preconfigured: Option<Vec<TechnologyConfig>>,
        events: SessionEventSender,
    },
    Stop {
        handle: SessionHandle,
    },
    AddPeer {
        handle: SessionHandle,
        peer: DeviceId,
    },
    RemovePeer {
        handle: SessionHandle,
        peer: DeviceId,
    },
    Reconfigure {
        handle: SessionHandle,
        interval: IntervalRange,
    },
    Oob(OobEvent),
    Visibility {
        state: AppVisibility,
    },
    Notice(PeerNotice),
}

/// A missing local technology is a device limitation, not a peer mismatch
fn open_failed_reason(error: SelectionError) -> OpenFailedReason {
    match error {
        SelectionError::NoLocalTechnology => OpenFailedReason::Unsupported,
        other => OpenFailedReason::CapabilityMismatch(other),
    }
}

struct SessionEntry {
    config: SessionConfig,
    events: SessionEventSender,
    peers: HashMap<DeviceId, Arc<PeerStateMachine>>,
    /// Running negotiation round, initial or dynamic-add
    negotiation: Option<ConfigSelector>,
    handles: Vec<SharedAdapterHandle>,
    opened: bool,
    /// Set once a session-level stop was requested; wins as close reason
    closing: Option<StopReason>,
}

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

/// Owns all sessions and the ordered task loop driving them
pub struct SessionManager {
    registry: Arc<CapabilityRegistry>,
    factory: Arc<dyn AdapterFactory>,
    transport: Arc<dyn OobTransport>,
    context: AttributionContext,
    workers: Arc<WorkerPool>,
    sessions: Arc<DashMap<SessionHandle, SessionEntry>>,
    tasks: mpsc::UnboundedSender<SessionTask>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        factory: Arc<dyn AdapterFactory>,
        transport: Arc<dyn OobTransport>,
        context: AttributionContext,
        workers: Arc<WorkerPool>,
    ) -> Arc<Self> {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            registry,
            factory,
            transport,
            context,
            workers,
            sessions: Arc::new(DashMap::new()),
            tasks: tasks_tx,
        });

        let loop_manager = Arc::clone(&manager);
        tokio::spawn(async move {
            loop_manager.run(tasks_rx).await;
        });

        manager
    }

    // ------------------------------------------------------------------
    // Public surface (non-blocking, enqueue only)
    // ------------------------------------------------------------------

    /// Open a session toward `peers`. Negotiation and startup proceed
    /// asynchronously; progress arrives on the returned event channel.
    pub fn start_session(
        &self,
        config: SessionConfig,
        peers: Vec<DeviceId>,
    ) -> multirange_core::Result<(SessionHandle, SessionEventReceiver)> {
        let handle = SessionHandle::generate();
        if peers.is_empty() {
            return Err(SessionError::NoPeers { handle }.into());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.enqueue(SessionTask::Start {
            handle,
            config,
            peers,
            preconfigured: None,
            events: events_tx,
        })?;
        Ok((handle, events_rx))
    }

    /// Open a session with configs already agreed out of band; no
    /// negotiation round runs. Peers are taken from the config targets.
    pub fn start_preconfigured(
        &self,
        config: SessionConfig,
        local_configs: Vec<TechnologyConfig>,
    ) -> multirange_core::Result<(SessionHandle, SessionEventReceiver)> {
        let handle = SessionHandle::generate();
        let mut peers: Vec<DeviceId> = Vec::new();
        for technology_config in &local_configs {
            for peer in technology_config.target.peers() {
                if !peers.contains(peer) {
                    peers.push(*peer);
                }
            }
        }
        if peers.is_empty() {
            return Err(SessionError::NoPeers { handle }.into());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.enqueue(SessionTask::Start {
            handle,
            config,
            peers,
            preconfigured: Some(local_configs),
            events: events_tx,
        })?;
        Ok((handle, events_rx))
    }

    pub fn stop_session(&self, handle: SessionHandle) -> multirange_core::Result<()> {
        self.enqueue(SessionTask::Stop { handle })
    }

    pub fn add_peer(&self, handle: SessionHandle, peer: DeviceId) -> multirange_core::Result<()> {
        self.enqueue(SessionTask::AddPeer { handle, peer })
    }

    pub fn remove_peer(
        &self,
        handle: SessionHandle,
        peer: DeviceId,
    ) -> multirange_core::Result<()> {
        self.enqueue(SessionTask::RemovePeer { handle, peer })
    }

    /// Request a new preferred update interval for every running adapter
    pub fn reconfigure(
        &self,
        handle: SessionHandle,
        interval: IntervalRange,
    ) -> multirange_core::Result<()> {
        self.enqueue(SessionTask::Reconfigure { handle, interval })
    }

    /// Route one inbound OOB event into the ordered loop
    pub fn oob_event(&self, event: OobEvent) -> multirange_core::Result<()> {
        self.enqueue(SessionTask::Oob(event))
    }

    /// Forward an app visibility transition to every running adapter
    pub fn app_visibility(&self, state: AppVisibility) -> multirange_core::Result<()> {
        self.enqueue(SessionTask::Visibility { state })
    }

    /// The client process went away; all of its sessions stop
    pub fn client_disconnected(&self) -> multirange_core::Result<()> {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| *e.key()).collect();
        for handle in handles {
            self.enqueue(SessionTask::Stop { handle })?;
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        self.registry.snapshot()
    }

    fn enqueue(&self, task: SessionTask) -> multirange_core::Result<()> {
        self.tasks
            .send(task)
            .map_err(|_| SessionError::QueueClosed.into())
    }

    // ------------------------------------------------------------------
    // Task loop
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>, mut tasks: mpsc::UnboundedReceiver<SessionTask>) {
        while let Some(task) = tasks.recv().await {
            match task {
                SessionTask::Start {
                    handle,
                    config,
                    peers,
                    preconfigured,
                    events,
                } => {
                    self.handle_start(handle, config, peers, preconfigured, events)
                        .await
                }
                SessionTask::Stop { handle } => self.handle_stop(handle, StopReason::LocalRequest),
                SessionTask::AddPeer { handle, peer } => self.handle_add_peer(handle, peer).await,
                SessionTask::RemovePeer { handle, peer } => self.handle_remove_peer(handle, peer),
                SessionTask::Reconfigure { handle, interval } => {
                    self.handle_reconfigure(handle, interval)
                }
                SessionTask::Oob(event) => self.handle_oob(event).await,
                SessionTask::Visibility { state } => self.handle_visibility(state),
                SessionTask::Notice(notice) => self.handle_notice(notice),
            }
        }
    }

    async fn handle_start(
        &self,
        handle: SessionHandle,
        config: SessionConfig,
        peers: Vec<DeviceId>,
        preconfigured: Option<Vec<TechnologyConfig>>,
        events: SessionEventSender,
    ) {
        info!(session = %handle, mode = ?config.mode, peers = peers.len(), "starting session");

        if let Some(local_configs) = preconfigured {
            self.sessions.insert(
                handle,
                SessionEntry {
                    config,
                    events,
                    peers: HashMap::new(),
                    negotiation: None,
                    handles: Vec::new(),
                    opened: false,
                    closing: None,
                },
            );
            self.activate(handle, local_configs, &peers);
            return;
        }

        let local = self.registry.snapshot();
        let selector = match ConfigSelector::new(local, &config, peers.clone()) {
            Ok(selector) => selector,
            Err(error) => {
                warn!(session = %handle, %error, "session cannot open");
                let _ = events.send(SessionEvent::OpenFailed {
                    session: handle,
                    peer: None,
                    reason: open_failed_reason(error),
                });
                return;
            }
        };

        let request = OobCodec::encode(&OobMessage::CapabilityRequest(
            selector.capability_request(),
        ));
        self.sessions.insert(
            handle,
            SessionEntry {
                config,
                events,
                peers: HashMap::new(),
                negotiation: Some(selector),
                handles: Vec::new(),
                opened: false,
                closing: None,
            },
        );

        for peer in peers {
            if let Err(error) = self.transport.send(handle, peer, request.clone()).await {
                warn!(session = %handle, %peer, %error, "capability request undeliverable");
                if let Some(mut entry) = self.sessions.get_mut(&handle) {
                    if let Some(selector) = entry.negotiation.as_mut() {
                        selector.fail_peer(peer, SelectionError::PeerUnreachable { peer });
                    }
                }
            }
        }
        self.try_complete_negotiation(handle).await;
    }

    fn handle_stop(&self, handle: SessionHandle, reason: StopReason) {
        let Some(mut entry) = self.sessions.get_mut(&handle) else {
            debug!(session = %handle, "stop for unknown session");
            return;
        };

        if entry.closing.is_some() {
            return;
        }
        entry.closing = Some(reason);

        // Abandon any pending round. Its unanswered peers never started, so
        // they fail here; peers already ranging still get a real stop below.
        let pending: Vec<DeviceId> = entry
            .negotiation
            .take()
            .map(|selector| selector.pending_peers().to_vec())
            .unwrap_or_default();
        for peer in pending {
            let _ = entry.events.send(SessionEvent::OpenFailed {
                session: handle,
                peer: Some(peer),
                reason: OpenFailedReason::FailedToStart(reason),
            });
        }

        if entry.peers.is_empty() {
            let events = entry.events.clone();
            drop(entry);
            self.sessions.remove(&handle);
            let _ = events.send(SessionEvent::Closed {
                session: handle,
                reason,
            });
            return;
        }

        let machines: Vec<Arc<PeerStateMachine>> = entry.peers.values().cloned().collect();
        drop(entry);
        for machine in machines {
            machine.stop(reason);
        }
    }

    async fn handle_add_peer(&self, handle: SessionHandle, peer: DeviceId) {
        let request = {
            let Some(mut entry) = self.sessions.get_mut(&handle) else {
                debug!(session = %handle, "add peer for unknown session");
                return;
            };
            if entry.closing.is_some()
                || entry.peers.contains_key(&peer)
                || entry.negotiation.is_some()
            {
                debug!(session = %handle, %peer, "add peer ignored");
                return;
            }

            let local = self.registry.snapshot();
            match ConfigSelector::new(local, &entry.config, vec![peer]) {
                Ok(selector) => {
                    let request = OobCodec::encode(&OobMessage::CapabilityRequest(
                        selector.capability_request(),
                    ));
                    entry.negotiation = Some(selector);
                    request
                }
                Err(error) => {
                    let _ = entry.events.send(SessionEvent::OpenFailed {
                        session: handle,
                        peer: Some(peer),
                        reason: open_failed_reason(error),
                    });
                    return;
                }
            }
        };

        if let Err(error) = self.transport.send(handle, peer, request).await {
            warn!(session = %handle, %peer, %error, "capability request undeliverable");
            if let Some(mut entry) = self.sessions.get_mut(&handle) {
                if let Some(selector) = entry.negotiation.as_mut() {
                    selector.fail_peer(peer, SelectionError::PeerUnreachable { peer });
                }
            }
        }
        self.try_complete_negotiation(handle).await;
    }

    fn handle_remove_peer(&self, handle: SessionHandle, peer: DeviceId) {
        let Some(mut entry) = self.sessions.get_mut(&handle) else {
            debug!(session = %handle, "remove peer for unknown session");
            return;
        };

        if let Some(selector) = entry.negotiation.as_mut() {
            selector.fail_peer(peer, SelectionError::PeerUnreachable { peer });
        }
        let machine = entry.peers.get(&peer).cloned();
        drop(entry);

        match machine {
            Some(machine) => machine.stop(StopReason::LocalRequest),
            None => debug!(session = %handle, %peer, "remove for unknown peer"),
        }
    }

    fn handle_visibility(&self, state: AppVisibility) {
        for entry in self.sessions.iter() {
            for adapter in &entry.handles {
                adapter.app_visibility(state, &self.workers);
            }
        }
    }

    fn handle_reconfigure(&self, handle: SessionHandle, interval: IntervalRange) {
        let Some(entry) = self.sessions.get(&handle) else {
            debug!(session = %handle, "reconfigure for unknown session");
            return;
        };
        for adapter in &entry.handles {
            adapter.reconfigure(interval, &self.workers);
        }
    }

    // ------------------------------------------------------------------
    // OOB handling
    // ------------------------------------------------------------------

    async fn handle_oob(&self, event: OobEvent) {
        match event {
            OobEvent::Delivered {
                session,
                peer,
                bytes,
            } => self.handle_oob_message(session, peer, &bytes).await,
            OobEvent::Disconnected { session, peer } => {
                debug!(%session, %peer, "oob channel dropped");
                if let Some(mut entry) = self.sessions.get_mut(&session) {
                    if let Some(selector) = entry.negotiation.as_mut() {
                        selector.fail_peer(peer, SelectionError::PeerUnreachable { peer });
                    }
                }
                self.try_complete_negotiation(session).await;
            }
            OobEvent::Reconnected { session, peer } => {
                debug!(%session, %peer, "oob channel restored");
            }
            OobEvent::Closed { session, peer } => {
                let machine = {
                    let Some(mut entry) = self.sessions.get_mut(&session) else {
                        return;
                    };
                    if let Some(selector) = entry.negotiation.as_mut() {
                        selector.fail_peer(peer, SelectionError::PeerUnreachable { peer });
                    }
                    entry.peers.get(&peer).cloned()
                };
                if let Some(machine) = machine {
                    machine.stop(StopReason::LostConnection);
                }
                self.try_complete_negotiation(session).await;
            }
        }
    }

    async fn handle_oob_message(&self, session: SessionHandle, peer: DeviceId, bytes: &[u8]) {
        let message = match OobCodec::decode(bytes) {
            Ok(message) => message,
            Err(error) => {
                warn!(%session, %peer, %error, "malformed oob message");
                if let Some(mut entry) = self.sessions.get_mut(&session) {
                    if let Some(selector) = entry.negotiation.as_mut() {
                        selector.fail_peer(peer, SelectionError::MalformedResponse { peer });
                    }
                }
                self.try_complete_negotiation(session).await;
                return;
            }
        };

        match message {
            OobMessage::CapabilityRequest(request) => {
                self.answer_capability_request(session, peer, &request)
                    .await;
            }
            OobMessage::CapabilityResponse(response) => {
                if let Some(mut entry) = self.sessions.get_mut(&session) {
                    match entry.negotiation.as_mut() {
                        Some(selector) => {
                            // Failures are recorded inside the selector; the
                            // round continues for the remaining peers
                            let _ = selector.handle_response(peer, &response);
                        }
                        None => debug!(%session, %peer, "response outside a negotiation"),
                    }
                }
                self.try_complete_negotiation(session).await;
            }
            OobMessage::SetConfiguration(_) => {
                // This side always initiates; a peer trying to configure us
                // is out of protocol
                debug!(%session, %peer, "ignoring peer-initiated configuration");
            }
        }
    }

    /// Answer a peer's capability request with the local snapshot filtered
    /// to what it asked about.
    async fn answer_capability_request(
        &self,
        session: SessionHandle,
        peer: DeviceId,
        request: &CapabilityRequest,
    ) {
        let local = self.registry.snapshot();
        let entries = local
            .enabled()
            .intersect(&request.requested)
            .iter()
            .filter_map(|tech| local.payload(tech).map(|p| (tech, p.clone())))
            .collect();

        let response = match CapabilityResponse::new(entries) {
            Ok(response) => response,
            Err(error) => {
                warn!(%session, %peer, %error, "cannot build capability response");
                return;
            }
        };
        let bytes = OobCodec::encode(&OobMessage::CapabilityResponse(response));
        if let Err(error) = self.transport.send(session, peer, bytes).await {
            warn!(%session, %peer, %error, "capability response undeliverable");
        }
    }

    // ------------------------------------------------------------------
    // Negotiation completion
    // ------------------------------------------------------------------

    async fn try_complete_negotiation(&self, handle: SessionHandle) {
        let outcome = {
            let Some(mut entry) = self.sessions.get_mut(&handle) else {
                return;
            };
            match entry.negotiation.as_ref() {
                Some(selector) if selector.is_complete() => {
                    let selector = entry.negotiation.take();
                    selector.map(|s| s.finish())
                }
                _ => None,
            }
        };
        let Some(outcome) = outcome else { return };

        // Per-peer negotiation failures first
        for (peer, error) in &outcome.failed_peers {
            let Some(entry) = self.sessions.get(&handle) else {
                return;
            };
            let _ = entry.events.send(SessionEvent::OpenFailed {
                session: handle,
                peer: Some(*peer),
                reason: open_failed_reason(error.clone()),
            });
        }

        if outcome.peer_messages.is_empty() {
            self.session_dead_on_arrival(handle, &outcome.failed_peers);
            return;
        }

        // Deliver the chosen configuration to each surviving peer. A failed
        // delivery is not fatal here; the peer's liveness timer covers it.
        for (peer, message) in &outcome.peer_messages {
            let bytes = OobCodec::encode(&OobMessage::SetConfiguration(message.clone()));
            if let Err(error) = self.transport.send(handle, *peer, bytes).await {
                warn!(session = %handle, %peer, %error, "configuration undeliverable");
            }
        }

        let peers: Vec<DeviceId> = outcome.peer_messages.iter().map(|(p, _)| *p).collect();
        self.activate(handle, outcome.local_configs, &peers);
    }

    /// Every peer of the round failed; nothing to start
    fn session_dead_on_arrival(
        &self,
        handle: SessionHandle,
        failures: &[(DeviceId, SelectionError)],
    ) {
        let Some(entry) = self.sessions.get(&handle) else {
            return;
        };
        if entry.opened {
            // Dynamic-add round failed; the running session is untouched
            return;
        }
        let events = entry.events.clone();
        drop(entry);
        self.sessions.remove(&handle);

        let reason = failures
            .first()
            .map(|(_, error)| error.clone())
            .unwrap_or(SelectionError::NoLocalTechnology);
        let _ = events.send(SessionEvent::OpenFailed {
            session: handle,
            peer: None,
            reason: open_failed_reason(reason),
        });
    }

    /// Build adapters and peer state machines for a completed round and
    /// start them.
    fn activate(
        &self,
        handle: SessionHandle,
        local_configs: Vec<TechnologyConfig>,
        peers: &[DeviceId],
    ) {
        let Some(mut entry) = self.sessions.get_mut(&handle) else {
            return;
        };

        let mut new_handles: Vec<SharedAdapterHandle> = Vec::with_capacity(local_configs.len());
        for config in local_configs {
            match self.factory.create(config.technology()) {
                Ok(adapter) => new_handles.push(SharedAdapterHandle::new(adapter, config)),
                Err(error) => {
                    warn!(session = %handle, technology = %config.technology(), %error,
                        "no adapter for negotiated technology");
                }
            }
        }

        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        self.forward_notices(notices_rx);

        let mut machines = Vec::new();
        for peer in peers {
            let peer_handles: Vec<SharedAdapterHandle> = new_handles
                .iter()
                .filter(|h| h.config().target.contains(*peer))
                .cloned()
                .collect();
            let machine = PeerStateMachine::new(
                handle,
                *peer,
                entry.config.clone(),
                peer_handles,
                self.context.clone(),
                entry.events.clone(),
                notices_tx.clone(),
                Arc::clone(&self.workers),
            );
            entry.peers.insert(*peer, Arc::clone(&machine));
            machines.push(machine);
        }
        entry.handles.extend(new_handles);

        if !entry.opened {
            entry.opened = true;
            let _ = entry.events.send(SessionEvent::Opened { session: handle });
        }
        drop(entry);

        for machine in machines {
            machine.start();
        }
    }

    /// Peer notices re-enter the ordered queue so terminal accounting never
    /// races session tasks.
    fn forward_notices(&self, mut notices: mpsc::UnboundedReceiver<PeerNotice>) {
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                if tasks.send(SessionTask::Notice(notice)).is_err() {
                    break;
                }
            }
        });
    }

    fn handle_notice(&self, notice: PeerNotice) {
        match notice {
            PeerNotice::Terminated {
                session,
                peer,
                reason,
                ..
            } => {
                let Some(mut entry) = self.sessions.get_mut(&session) else {
                    return;
                };
                entry.peers.remove(&peer);
                if entry.peers.is_empty() && entry.negotiation.is_none() {
                    let close_reason = entry.closing.unwrap_or(reason);
                    let events = entry.events.clone();
                    drop(entry);
                    self.sessions.remove(&session);
                    info!(%session, reason = %close_reason, "session closed");
                    let _ = events.send(SessionEvent::Closed {
                        session,
                        reason: close_reason,
                    });
                }
            }
            PeerNotice::MeasurementLimit { session, peer } => {
                debug!(%session, %peer, "measurement limit reached");
                self.handle_stop(session, StopReason::LocalRequest);
            }
        }
    }
}
