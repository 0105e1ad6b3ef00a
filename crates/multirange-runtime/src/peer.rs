//! Per-peer ranging lifecycle
//!
//! One state machine per (session, peer). It owns the peer's fusion engine
//! and liveness timers, consumes adapter events from the shared handles the
//! peer participates in, and reports exactly one terminal event per peer:
//! `PeerStopped` if the peer ever started, `OpenFailed` if it never did.
//!
//! Lifecycle: STOPPED -> STARTING -> STARTED -> STOPPING -> STOPPED. All
//! stop paths converge on `stop`; the first recorded reason wins and later
//! ones are dropped.

use std::sync::{Arc, Mutex};

use multirange_core::{
    AdapterEvent, AttributionContext, DeviceId, FusionEngine, SessionConfig, SessionHandle,
    StopReason, Technology, TechnologySet,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::adapters::SharedAdapterHandle;
use crate::events::{OpenFailedReason, SessionEvent, SessionEventSender};
use crate::timers::LivenessTimer;
use crate::workers::WorkerPool;

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLifecycle {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Upcalls from a peer state machine to its session manager
#[derive(Debug, Clone)]
pub enum PeerNotice {
    /// The peer reached its terminal state
    Terminated {
        session: SessionHandle,
        peer: DeviceId,
        reason: StopReason,
        ever_started: bool,
    },
    /// The peer produced its configured number of fused measurements
    MeasurementLimit {
        session: SessionHandle,
        peer: DeviceId,
    },
}

pub type PeerNoticeSender = mpsc::UnboundedSender<PeerNotice>;

struct PeerInner {
    lifecycle: PeerLifecycle,
    /// Technologies still owed a stop event before the peer is terminal
    expected: TechnologySet,
    /// Technologies currently ranging
    started: TechnologySet,
    fusion: FusionEngine,
    stop_reason: Option<StopReason>,
    ever_started: bool,
    measurements: u64,
    detached: bool,
    finished: bool,
}

// ----------------------------------------------------------------------------
// Peer State Machine
// ----------------------------------------------------------------------------

pub struct PeerStateMachine {
    session: SessionHandle,
    peer: DeviceId,
    config: SessionConfig,
    handles: Vec<SharedAdapterHandle>,
    context: AttributionContext,
    events: SessionEventSender,
    notices: PeerNoticeSender,
    workers: Arc<WorkerPool>,
    initial_timer: LivenessTimer,
    update_timer: LivenessTimer,
    inner: Mutex<PeerInner>,
}

impl PeerStateMachine {
    /// Build the state machine for one peer over the shared handles whose
    /// target includes it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionHandle,
        peer: DeviceId,
        config: SessionConfig,
        handles: Vec<SharedAdapterHandle>,
        context: AttributionContext,
        events: SessionEventSender,
        notices: PeerNoticeSender,
        workers: Arc<WorkerPool>,
    ) -> Arc<Self> {
        let expected: TechnologySet = handles.iter().map(|h| h.technology()).collect();
        let fusion = FusionEngine::new(config.fusion);

        Arc::new(Self {
            session,
            peer,
            config,
            handles,
            context,
            events,
            notices,
            workers,
            initial_timer: LivenessTimer::new(),
            update_timer: LivenessTimer::new(),
            inner: Mutex::new(PeerInner {
                lifecycle: PeerLifecycle::Stopped,
                expected,
                started: TechnologySet::empty(),
                fusion,
                stop_reason: None,
                ever_started: false,
                measurements: 0,
                detached: false,
                finished: false,
            }),
        })
    }

    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    pub fn lifecycle(&self) -> PeerLifecycle {
        self.inner.lock().expect("peer lock").lifecycle
    }

    /// Begin ranging. A no-op in any state but STOPPED.
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().expect("peer lock");
            if inner.lifecycle != PeerLifecycle::Stopped || inner.finished {
                debug!(peer = %self.peer, state = ?inner.lifecycle, "start ignored");
                return;
            }
            if inner.expected.is_empty() {
                // Nothing to range with; terminal straight away
                inner.stop_reason.get_or_insert(StopReason::FailedToStart);
                drop(inner);
                self.finish();
                return;
            }
            inner.lifecycle = PeerLifecycle::Starting;
        }

        // Subscribe before attaching so no started event can be missed
        let (tx, rx) = mpsc::unbounded_channel();
        for handle in &self.handles {
            handle.subscribe(tx.clone());
        }
        self.spawn_pump(rx);

        let this = Arc::downgrade(self);
        self.initial_timer
            .arm(self.config.no_initial_data_timeout, move || {
                if let Some(peer) = this.upgrade() {
                    warn!(peer = %peer.peer, "no initial measurement before deadline");
                    peer.stop(StopReason::NoInitialDataTimeout);
                }
            });

        for handle in &self.handles {
            handle.attach(self.peer, self.context.clone(), &self.workers);
        }
    }

    /// Stop ranging. Idempotent; the first reason is the one reported.
    pub fn stop(&self, reason: StopReason) {
        let (detach, finish) = {
            let mut inner = self.inner.lock().expect("peer lock");
            match inner.lifecycle {
                PeerLifecycle::Stopped | PeerLifecycle::Stopping => return,
                PeerLifecycle::Starting | PeerLifecycle::Started => {
                    inner.lifecycle = PeerLifecycle::Stopping;
                    inner.stop_reason.get_or_insert(reason);
                    inner.fusion.stop();
                    let detach = !inner.detached;
                    inner.detached = true;
                    (detach, inner.expected.is_empty())
                }
            }
        };

        self.initial_timer.cancel();
        self.update_timer.cancel();

        if detach {
            for handle in &self.handles {
                handle.detach(self.peer, &self.workers);
            }
        }
        if finish {
            self.finish();
        }
    }

    // ------------------------------------------------------------------
    // Adapter events
    // ------------------------------------------------------------------

    fn spawn_pump(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<AdapterEvent>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_event(event);
                if this.inner.lock().expect("peer lock").finished {
                    break;
                }
            }
        });
    }

    fn handle_event(self: &Arc<Self>, event: AdapterEvent) {
        trace!(peer = %self.peer, ?event, "adapter event");
        match event {
            AdapterEvent::Started { technology, peers } => {
                if !peers.contains(&self.peer) {
                    return;
                }
                let became_started = {
                    let mut inner = self.inner.lock().expect("peer lock");
                    if inner.lifecycle == PeerLifecycle::Stopping
                        || inner.lifecycle == PeerLifecycle::Stopped
                        || !inner.expected.contains(technology)
                    {
                        return;
                    }
                    inner.started.insert(technology);
                    inner.fusion.add_source(technology);
                    if inner.lifecycle == PeerLifecycle::Starting {
                        inner.lifecycle = PeerLifecycle::Started;
                        inner.ever_started = true;
                        true
                    } else {
                        false
                    }
                };
                if became_started {
                    self.emit(SessionEvent::PeerStarted {
                        session: self.session,
                        peer: self.peer,
                    });
                }
                self.emit(SessionEvent::TechnologyStarted {
                    session: self.session,
                    peer: self.peer,
                    technology,
                });
            }
            AdapterEvent::RangingData {
                technology: _,
                peer,
                measurement,
            } => {
                if peer != self.peer {
                    return;
                }
                let fused = {
                    let mut inner = self.inner.lock().expect("peer lock");
                    if inner.lifecycle != PeerLifecycle::Started {
                        return;
                    }
                    match inner.fusion.feed(&measurement) {
                        Some(fused) => {
                            inner.measurements += 1;
                            let limit_hit = self
                                .config
                                .measurement_limit
                                .is_some_and(|limit| inner.measurements >= u64::from(limit));
                            Some((fused, limit_hit))
                        }
                        None => None,
                    }
                };

                if let Some((measurement, limit_hit)) = fused {
                    self.initial_timer.cancel();
                    let this = Arc::downgrade(self);
                    self.update_timer.arm(self.config.no_update_timeout, move || {
                        if let Some(peer) = this.upgrade() {
                            warn!(peer = %peer.peer, "measurement stream went silent");
                            peer.stop(StopReason::NoUpdatedDataTimeout);
                        }
                    });
                    self.emit(SessionEvent::Results {
                        session: self.session,
                        peer: self.peer,
                        measurement,
                    });
                    if limit_hit {
                        let _ = self.notices.send(PeerNotice::MeasurementLimit {
                            session: self.session,
                            peer: self.peer,
                        });
                    }
                }
            }
            AdapterEvent::Stopped {
                technology,
                peers,
                reason,
            } => {
                if !peers.contains(&self.peer) {
                    return;
                }
                self.technology_stopped(technology, reason);
            }
            AdapterEvent::Closed { technology, reason } => {
                self.technology_stopped(technology, reason);
            }
        }
    }

    fn technology_stopped(&self, technology: Technology, reason: StopReason) {
        let (was_started, all_done) = {
            let mut inner = self.inner.lock().expect("peer lock");
            if inner.finished || !inner.expected.contains(technology) {
                return;
            }
            inner.expected.remove(technology);
            let was_started = inner.started.contains(technology);
            inner.started.remove(technology);
            inner.fusion.remove_source(technology);
            inner.stop_reason.get_or_insert(reason);
            (was_started, inner.expected.is_empty())
        };

        if was_started {
            self.emit(SessionEvent::TechnologyStopped {
                session: self.session,
                peer: self.peer,
                technology,
            });
        }
        if all_done {
            self.finish();
        }
    }

    // ------------------------------------------------------------------
    // Terminal handling
    // ------------------------------------------------------------------

    fn finish(&self) {
        let (reason, ever_started, detach) = {
            let mut inner = self.inner.lock().expect("peer lock");
            if inner.finished {
                return;
            }
            inner.finished = true;
            inner.lifecycle = PeerLifecycle::Stopped;
            inner.fusion.stop();
            let detach = !inner.detached;
            inner.detached = true;
            (
                inner.stop_reason.unwrap_or(StopReason::Unknown),
                inner.ever_started,
                detach,
            )
        };

        self.initial_timer.cancel();
        self.update_timer.cancel();

        // Remote-initiated stops reach here without a local stop call; the
        // member refcount on each handle still has to drop.
        if detach {
            for handle in &self.handles {
                handle.detach(self.peer, &self.workers);
            }
        }

        if ever_started {
            self.emit(SessionEvent::PeerStopped {
                session: self.session,
                peer: self.peer,
                reason,
            });
        } else {
            self.emit(SessionEvent::OpenFailed {
                session: self.session,
                peer: Some(self.peer),
                reason: OpenFailedReason::FailedToStart(reason),
            });
        }
        let _ = self.notices.send(PeerNotice::Terminated {
            session: self.session,
            peer: self.peer,
            reason,
            ever_started,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use multirange_core::{
        AdapterEventSender, ConfigTarget, RangingMeasurement, Result, Technology,
        TechnologyAdapter, TechnologyConfig, TechnologyParams,
    };
    use std::time::Duration;

    /// Adapter that acks start/stop immediately and hands the test its event
    /// sender so measurements can be injected.
    struct ScriptedAdapter {
        technology: Technology,
        tap: Arc<Mutex<Option<AdapterEventSender>>>,
    }

    #[async_trait]
    impl TechnologyAdapter for ScriptedAdapter {
        fn technology(&self) -> Technology {
            self.technology
        }

        async fn start(
            &mut self,
            config: TechnologyConfig,
            _context: AttributionContext,
            events: AdapterEventSender,
        ) -> Result<()> {
            let _ = events.send(AdapterEvent::Started {
                technology: self.technology,
                peers: config.target.peers().to_vec(),
            });
            *self.tap.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            if let Some(events) = self.tap.lock().unwrap().take() {
                let _ = events.send(AdapterEvent::Closed {
                    technology: self.technology,
                    reason: StopReason::LocalRequest,
                });
            }
            Ok(())
        }
    }

    fn peer_id() -> DeviceId {
        DeviceId::new([7; 6])
    }

    struct Fixture {
        machine: Arc<PeerStateMachine>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        notices: mpsc::UnboundedReceiver<PeerNotice>,
        tap: Arc<Mutex<Option<AdapterEventSender>>>,
    }

    fn fixture(config: SessionConfig) -> Fixture {
        let tap = Arc::new(Mutex::new(None));
        let adapter = Box::new(ScriptedAdapter {
            technology: Technology::Uwb,
            tap: Arc::clone(&tap),
        });
        let handle = SharedAdapterHandle::new(
            adapter,
            TechnologyConfig {
                target: ConfigTarget::Unicast(peer_id()),
                params: TechnologyParams::defaults(Technology::Uwb),
            },
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let machine = PeerStateMachine::new(
            SessionHandle::generate(),
            peer_id(),
            config,
            vec![handle],
            AttributionContext::default(),
            events_tx,
            notices_tx,
            Arc::new(WorkerPool::new(2)),
        );

        Fixture {
            machine,
            events: events_rx,
            notices: notices_rx,
            tap,
        }
    }

    struct DualFixture {
        machine: Arc<PeerStateMachine>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        notices: mpsc::UnboundedReceiver<PeerNotice>,
        taps: Vec<Arc<Mutex<Option<AdapterEventSender>>>>,
    }

    /// Two technologies ranging with the same peer
    fn dual_fixture() -> DualFixture {
        let mut handles = Vec::new();
        let mut taps = Vec::new();
        for technology in [Technology::Uwb, Technology::BleRssi] {
            let tap = Arc::new(Mutex::new(None));
            let adapter = Box::new(ScriptedAdapter {
                technology,
                tap: Arc::clone(&tap),
            });
            handles.push(SharedAdapterHandle::new(
                adapter,
                TechnologyConfig {
                    target: ConfigTarget::Unicast(peer_id()),
                    params: TechnologyParams::defaults(technology),
                },
            ));
            taps.push(tap);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let machine = PeerStateMachine::new(
            SessionHandle::generate(),
            peer_id(),
            SessionConfig::default(),
            handles,
            AttributionContext::default(),
            events_tx,
            notices_tx,
            Arc::new(WorkerPool::new(2)),
        );

        DualFixture {
            machine,
            events: events_rx,
            notices: notices_rx,
            taps,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event before deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_start_reports_peer_and_technology_started() {
        let mut fx = fixture(SessionConfig::default());
        fx.machine.start();

        assert!(matches!(
            next_event(&mut fx.events).await,
            SessionEvent::PeerStarted { .. }
        ));
        assert!(matches!(
            next_event(&mut fx.events).await,
            SessionEvent::TechnologyStarted {
                technology: Technology::Uwb,
                ..
            }
        ));
        assert_eq!(fx.machine.lifecycle(), PeerLifecycle::Started);
    }

    #[tokio::test]
    async fn test_double_start_is_a_no_op() {
        let mut fx = fixture(SessionConfig::default());
        fx.machine.start();
        next_event(&mut fx.events).await;
        next_event(&mut fx.events).await;

        fx.machine.start();
        fx.machine.stop(StopReason::LocalRequest);

        // Exactly one terminal event despite the second start
        loop {
            if matches!(
                next_event(&mut fx.events).await,
                SessionEvent::PeerStopped { .. }
            ) {
                break;
            }
        }
        let extra = tokio::time::timeout(Duration::from_millis(200), fx.events.recv()).await;
        assert!(matches!(extra, Err(_) | Ok(None)));
    }

    #[tokio::test]
    async fn test_measurements_flow_through_fusion() {
        let mut fx = fixture(SessionConfig::default());
        fx.machine.start();
        next_event(&mut fx.events).await;
        next_event(&mut fx.events).await;

        let sender = fx.tap.lock().unwrap().clone().expect("adapter started");
        sender
            .send(AdapterEvent::RangingData {
                technology: Technology::Uwb,
                peer: peer_id(),
                measurement: RangingMeasurement::distance(Technology::Uwb, 1.25),
            })
            .unwrap();

        match next_event(&mut fx.events).await {
            SessionEvent::Results { measurement, .. } => {
                assert_eq!(measurement.distance_m, 1.25);
            }
            other => panic!("expected results, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_reports_first_reason_once() {
        let mut fx = fixture(SessionConfig::default());
        fx.machine.start();
        next_event(&mut fx.events).await;
        next_event(&mut fx.events).await;

        fx.machine.stop(StopReason::RemoteRequest);
        fx.machine.stop(StopReason::LocalRequest);

        loop {
            match next_event(&mut fx.events).await {
                SessionEvent::PeerStopped { reason, .. } => {
                    assert_eq!(reason, StopReason::RemoteRequest);
                    break;
                }
                SessionEvent::TechnologyStopped { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }

        let notice = fx.notices.recv().await.expect("terminal notice");
        assert!(matches!(
            notice,
            PeerNotice::Terminated {
                reason: StopReason::RemoteRequest,
                ever_started: true,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_initial_data_timeout_fails_the_peer() {
        let config = SessionConfig {
            no_initial_data_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        let mut fx = fixture(config);
        fx.machine.start();
        next_event(&mut fx.events).await;
        next_event(&mut fx.events).await;

        // No measurement ever arrives
        tokio::time::sleep(Duration::from_millis(400)).await;

        loop {
            match next_event(&mut fx.events).await {
                SessionEvent::PeerStopped { reason, .. } => {
                    assert_eq!(reason, StopReason::NoInitialDataTimeout);
                    break;
                }
                SessionEvent::TechnologyStopped { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_outlives_first_of_two_technology_stops() {
        let mut fx = dual_fixture();
        fx.machine.start();

        // PeerStarted plus one TechnologyStarted per technology
        let mut started = 0;
        while started < 2 {
            if matches!(
                next_event(&mut fx.events).await,
                SessionEvent::TechnologyStarted { .. }
            ) {
                started += 1;
            }
        }

        let uwb = fx.taps[0].lock().unwrap().clone().expect("uwb started");
        uwb.send(AdapterEvent::Stopped {
            technology: Technology::Uwb,
            peers: vec![peer_id()],
            reason: StopReason::RemoteRequest,
        })
        .unwrap();

        // Only a per-technology stop; the peer keeps ranging
        match next_event(&mut fx.events).await {
            SessionEvent::TechnologyStopped { technology, .. } => {
                assert_eq!(technology, Technology::Uwb);
            }
            other => panic!("expected technology stop, got {:?}", other),
        }
        assert_eq!(fx.machine.lifecycle(), PeerLifecycle::Started);
        let quiet = tokio::time::timeout(Duration::from_millis(200), fx.events.recv()).await;
        assert!(quiet.is_err());

        let rssi = fx.taps[1].lock().unwrap().clone().expect("rssi started");
        rssi.send(AdapterEvent::Stopped {
            technology: Technology::BleRssi,
            peers: vec![peer_id()],
            reason: StopReason::RemoteRequest,
        })
        .unwrap();

        loop {
            match next_event(&mut fx.events).await {
                SessionEvent::PeerStopped { reason, .. } => {
                    assert_eq!(reason, StopReason::RemoteRequest);
                    break;
                }
                SessionEvent::TechnologyStopped { technology, .. } => {
                    assert_eq!(technology, Technology::BleRssi);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(fx.machine.lifecycle(), PeerLifecycle::Stopped);

        // Terminal reported exactly once
        let notice = fx.notices.recv().await.expect("terminal notice");
        assert!(matches!(
            notice,
            PeerNotice::Terminated {
                ever_started: true,
                ..
            }
        ));
        let extra = tokio::time::timeout(Duration::from_millis(200), fx.events.recv()).await;
        assert!(matches!(extra, Err(_) | Ok(None)));
    }

    #[tokio::test]
    async fn test_measurement_limit_raises_notice() {
        let config = SessionConfig {
            measurement_limit: Some(2),
            ..SessionConfig::default()
        };
        let mut fx = fixture(config);
        fx.machine.start();
        next_event(&mut fx.events).await;
        next_event(&mut fx.events).await;

        let sender = fx.tap.lock().unwrap().clone().expect("adapter started");
        for _ in 0..2 {
            sender
                .send(AdapterEvent::RangingData {
                    technology: Technology::Uwb,
                    peer: peer_id(),
                    measurement: RangingMeasurement::distance(Technology::Uwb, 2.0),
                })
                .unwrap();
            next_event(&mut fx.events).await;
        }

        let notice = tokio::time::timeout(Duration::from_secs(1), fx.notices.recv())
            .await
            .expect("notice before deadline")
            .expect("channel open");
        assert!(matches!(notice, PeerNotice::MeasurementLimit { .. }));
    }
}
