//! Orchestrator assembly
//!
//! The builder wires the host-supplied seams (capability sources, adapter
//! factory, OOB transport) to the session manager and worker pool. The
//! resulting [`Orchestrator`] is the single handle a host embeds.

use std::sync::Arc;

use multirange_core::{
    AdapterFactory, AttributionContext, Capabilities, CapabilityRegistry, CapabilitySource,
    DeviceId, IntervalRange, ListenerToken, OobEvent, OobTransport, Result, SessionConfig,
    SessionHandle, Technology, TechnologyConfig,
};
use tokio::sync::mpsc;

use crate::adapters::AppVisibility;
use crate::events::SessionEventReceiver;
use crate::session::SessionManager;
use crate::workers::WorkerPool;

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

pub struct OrchestratorBuilder {
    sources: Vec<Box<dyn CapabilitySource>>,
    factory: Option<Arc<dyn AdapterFactory>>,
    transport: Option<Arc<dyn OobTransport>>,
    context: AttributionContext,
    workers: usize,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            factory: None,
            transport: None,
            context: AttributionContext::default(),
            workers: WorkerPool::DEFAULT_WORKERS,
        }
    }

    /// Add one per-technology capability source
    pub fn capability_source(mut self, source: Box<dyn CapabilitySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn adapter_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn oob_transport(mut self, transport: Arc<dyn OobTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Caller identity stamped onto every adapter start
    pub fn attribution(mut self, context: AttributionContext) -> Self {
        self.context = context;
        self
    }

    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Assemble the orchestrator. Must run inside a tokio runtime; panics on
    /// a missing factory or transport since those are wiring mistakes, not
    /// runtime conditions.
    pub fn build(self) -> Orchestrator {
        let factory = self.factory.expect("adapter factory is required");
        let transport = self.transport.expect("oob transport is required");

        let registry = Arc::new(CapabilityRegistry::new(self.sources));
        let workers = Arc::new(WorkerPool::new(self.workers));
        let manager = SessionManager::new(
            Arc::clone(&registry),
            factory,
            transport,
            self.context,
            workers,
        );

        Orchestrator { registry, manager }
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Orchestrator
// ----------------------------------------------------------------------------

/// Host-facing handle over the whole ranging stack
pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    manager: Arc<SessionManager>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Open a ranging session toward `peers`. Progress and measurements
    /// arrive on the returned event channel.
    pub fn start_session(
        &self,
        config: SessionConfig,
        peers: Vec<DeviceId>,
    ) -> Result<(SessionHandle, SessionEventReceiver)> {
        self.manager.start_session(config, peers)
    }

    /// Open a session whose configuration was agreed out of band; skips the
    /// negotiation round entirely.
    pub fn start_preconfigured(
        &self,
        config: SessionConfig,
        local_configs: Vec<TechnologyConfig>,
    ) -> Result<(SessionHandle, SessionEventReceiver)> {
        self.manager.start_preconfigured(config, local_configs)
    }

    pub fn stop_session(&self, handle: SessionHandle) -> Result<()> {
        self.manager.stop_session(handle)
    }

    pub fn add_peer(&self, handle: SessionHandle, peer: DeviceId) -> Result<()> {
        self.manager.add_peer(handle, peer)
    }

    pub fn remove_peer(&self, handle: SessionHandle, peer: DeviceId) -> Result<()> {
        self.manager.remove_peer(handle, peer)
    }

    pub fn reconfigure(&self, handle: SessionHandle, interval: IntervalRange) -> Result<()> {
        self.manager.reconfigure(handle, interval)
    }

    /// Route one inbound OOB transport event
    pub fn oob_event(&self, event: OobEvent) -> Result<()> {
        self.manager.oob_event(event)
    }

    /// The client process went away; every session it owns stops
    pub fn client_disconnected(&self) -> Result<()> {
        self.manager.client_disconnected()
    }

    /// Forward an app visibility transition to every running adapter
    pub fn app_visibility(&self, state: AppVisibility) -> Result<()> {
        self.manager.app_visibility(state)
    }

    /// Current local capability snapshot
    pub fn capabilities(&self) -> Capabilities {
        self.registry.snapshot()
    }

    /// Subscribe to capability changes
    pub fn register_capability_listener(
        &self,
        sender: mpsc::UnboundedSender<Capabilities>,
    ) -> ListenerToken {
        self.registry.register_listener(sender)
    }

    pub fn unregister_capability_listener(&self, token: ListenerToken) {
        self.registry.unregister_listener(token)
    }

    /// A technology stack pushed a capability change
    pub fn notify_capability_change(&self, technology: Technology) {
        self.registry.notify_push(technology)
    }
}
