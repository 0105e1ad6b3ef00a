//! End-to-end orchestrator tests over mock adapters and a channel-backed
//! OOB transport. The test body plays the remote peers: it reads outbound
//! OOB messages off the transport channel and injects replies through
//! `Orchestrator::oob_event`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multirange_core::{
    AdapterError, AdapterEvent, AdapterEventSender, AdapterFactory, AttributionContext,
    CapabilityPayload, CapabilityResponse, CapabilitySource, DeviceId, FusionPolicy, OobCodec,
    OobEvent, OobMessage, OobTransport, RangingError, RangingMeasurement, RangingMode, Result,
    SelectionError, SessionConfig, SessionHandle, StopReason, Technology, TechnologyAdapter,
    TechnologyCapability, TechnologyConfig, TechnologyParams,
};
use multirange_runtime::{OpenFailedReason, Orchestrator, SessionEvent, SessionEventReceiver};
use tokio::sync::mpsc;

// ----------------------------------------------------------------------------
// Mocks
// ----------------------------------------------------------------------------

struct StaticSource {
    technology: Technology,
}

impl CapabilitySource for StaticSource {
    fn technology(&self) -> Technology {
        self.technology
    }

    fn current(&self) -> TechnologyCapability {
        TechnologyCapability::enabled(CapabilityPayload::defaults(self.technology))
    }
}

/// Adapter that acks start, then streams one measurement per peer every few
/// milliseconds until stopped.
struct MockAdapter {
    technology: Technology,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl TechnologyAdapter for MockAdapter {
    fn technology(&self) -> Technology {
        self.technology
    }

    async fn start(
        &mut self,
        config: TechnologyConfig,
        _context: AttributionContext,
        events: AdapterEventSender,
    ) -> Result<()> {
        let peers = config.target.peers().to_vec();
        let _ = events.send(AdapterEvent::Started {
            technology: self.technology,
            peers: peers.clone(),
        });

        let technology = self.technology;
        let stopped = Arc::clone(&self.stopped);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if stopped.load(Ordering::SeqCst) {
                    let _ = events.send(AdapterEvent::Stopped {
                        technology,
                        peers: peers.clone(),
                        reason: StopReason::LocalRequest,
                    });
                    break;
                }
                for peer in &peers {
                    let _ = events.send(AdapterEvent::RangingData {
                        technology,
                        peer: *peer,
                        measurement: RangingMeasurement::distance(technology, 1.5),
                    });
                }
            }
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockFactory {
    /// Technologies whose adapter creation should fail
    broken: Vec<Technology>,
}

impl AdapterFactory for MockFactory {
    fn create(&self, technology: Technology) -> Result<Box<dyn TechnologyAdapter>> {
        if self.broken.contains(&technology) {
            return Err(AdapterError::Unavailable { technology }.into());
        }
        Ok(Box::new(MockAdapter {
            technology,
            stopped: Arc::new(AtomicBool::new(false)),
        }))
    }
}

type Outbound = (SessionHandle, DeviceId, Vec<u8>);

/// Transport that hands every outbound message to the test body
struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl OobTransport for ChannelTransport {
    async fn send(&self, session: SessionHandle, peer: DeviceId, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send((session, peer, bytes))
            .map_err(|_| RangingError::transport_send(peer, "test channel closed"))
    }
}

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

struct Harness {
    orchestrator: Orchestrator,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

fn harness(technologies: &[Technology], broken: Vec<Technology>) -> Harness {
    let (tx, outbound) = mpsc::unbounded_channel();
    let mut builder = Orchestrator::builder()
        .adapter_factory(Arc::new(MockFactory { broken }))
        .oob_transport(Arc::new(ChannelTransport { tx }))
        .attribution(AttributionContext::new("com.test.ranging", 1000));
    for technology in technologies {
        builder = builder.capability_source(Box::new(StaticSource {
            technology: *technology,
        }));
    }
    Harness {
        orchestrator: builder.build(),
        outbound,
    }
}

fn peer(n: u8) -> DeviceId {
    DeviceId::new([n; 6])
}

fn session_config(mode: RangingMode) -> SessionConfig {
    SessionConfig {
        mode,
        fusion: FusionPolicy::PassThrough,
        ..SessionConfig::default()
    }
}

async fn next_outbound(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> (DeviceId, OobMessage) {
    let (_, peer, bytes) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("outbound message before deadline")
        .expect("transport channel open");
    (peer, OobCodec::decode(&bytes).expect("well-formed message"))
}

/// Answer the pending capability request from `peer` with the given set
fn respond(
    orchestrator: &Orchestrator,
    session: SessionHandle,
    peer: DeviceId,
    technologies: &[Technology],
) {
    let response = CapabilityResponse::new(
        technologies
            .iter()
            .map(|t| (*t, CapabilityPayload::defaults(*t)))
            .collect(),
    )
    .expect("valid response");
    let bytes = OobCodec::encode(&OobMessage::CapabilityResponse(response));
    orchestrator
        .oob_event(OobEvent::Delivered {
            session,
            peer,
            bytes,
        })
        .expect("queue open");
}

/// Skip events until one matches, panicking if the channel stalls
async fn wait_for<F>(rx: &mut SessionEventReceiver, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event before deadline")
            .expect("event channel open");
        if matches(&event) {
            return event;
        }
    }
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_high_accuracy_session_end_to_end() {
    let mut h = harness(&[Technology::Uwb], vec![]);
    let (session, mut events) = h
        .orchestrator
        .start_session(session_config(RangingMode::HighAccuracy), vec![peer(1)])
        .unwrap();

    // Capability request goes out to the peer
    let (to, message) = next_outbound(&mut h.outbound).await;
    assert_eq!(to, peer(1));
    match message {
        OobMessage::CapabilityRequest(request) => {
            assert!(request.requested.contains(Technology::Uwb));
        }
        other => panic!("expected capability request, got {:?}", other),
    }

    respond(&h.orchestrator, session, peer(1), &[Technology::Uwb]);

    // Configuration goes out once negotiation completes
    let (to, message) = next_outbound(&mut h.outbound).await;
    assert_eq!(to, peer(1));
    match message {
        OobMessage::SetConfiguration(config) => {
            assert!(config.activate.contains(Technology::Uwb));
            assert!(config.start_immediately.contains(Technology::Uwb));
            assert_eq!(config.configs.len(), 1);
        }
        other => panic!("expected configuration, got {:?}", other),
    }

    wait_for(&mut events, |e| matches!(e, SessionEvent::Opened { .. })).await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::PeerStarted { .. })).await;
    wait_for(&mut events, |e| {
        matches!(
            e,
            SessionEvent::TechnologyStarted {
                technology: Technology::Uwb,
                ..
            }
        )
    })
    .await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::Results { .. })).await;

    h.orchestrator.stop_session(session).unwrap();
    let stopped = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PeerStopped { .. })
    })
    .await;
    match stopped {
        SessionEvent::PeerStopped { reason, .. } => {
            assert_eq!(reason, StopReason::LocalRequest);
        }
        _ => unreachable!(),
    }
    let closed = wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;
    match closed {
        SessionEvent::Closed { reason, .. } => assert_eq!(reason, StopReason::LocalRequest),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_peer_missing_required_technology_fails_alone() {
    let mut h = harness(&[Technology::Uwb], vec![]);
    let (session, mut events) = h
        .orchestrator
        .start_session(
            session_config(RangingMode::HighAccuracy),
            vec![peer(1), peer(2)],
        )
        .unwrap();

    next_outbound(&mut h.outbound).await;
    next_outbound(&mut h.outbound).await;

    respond(&h.orchestrator, session, peer(1), &[Technology::BleRssi]);
    respond(&h.orchestrator, session, peer(2), &[Technology::Uwb]);

    let failed = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::OpenFailed { .. })
    })
    .await;
    match failed {
        SessionEvent::OpenFailed { peer: who, reason, .. } => {
            assert_eq!(who, Some(peer(1)));
            assert!(matches!(
                reason,
                OpenFailedReason::CapabilityMismatch(
                    SelectionError::RequiredTechnologyMissing { .. }
                )
            ));
        }
        _ => unreachable!(),
    }

    // The session still opens for the surviving peer
    wait_for(&mut events, |e| matches!(e, SessionEvent::Opened { .. })).await;
    let started = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PeerStarted { .. })
    })
    .await;
    match started {
        SessionEvent::PeerStarted { peer: who, .. } => assert_eq!(who, peer(2)),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_malformed_response_fails_only_the_sender() {
    let mut h = harness(&[Technology::Uwb], vec![]);
    let (session, mut events) = h
        .orchestrator
        .start_session(
            session_config(RangingMode::HighAccuracy),
            vec![peer(1), peer(2)],
        )
        .unwrap();

    next_outbound(&mut h.outbound).await;
    next_outbound(&mut h.outbound).await;

    h.orchestrator
        .oob_event(OobEvent::Delivered {
            session,
            peer: peer(1),
            bytes: vec![0xff, 0x00, 0x01],
        })
        .unwrap();
    respond(&h.orchestrator, session, peer(2), &[Technology::Uwb]);

    let failed = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::OpenFailed { .. })
    })
    .await;
    match failed {
        SessionEvent::OpenFailed { peer: who, reason, .. } => {
            assert_eq!(who, Some(peer(1)));
            assert!(matches!(
                reason,
                OpenFailedReason::CapabilityMismatch(SelectionError::MalformedResponse { .. })
            ));
        }
        _ => unreachable!(),
    }
    wait_for(&mut events, |e| matches!(e, SessionEvent::Opened { .. })).await;
}

#[tokio::test]
async fn test_no_local_technology_fails_without_opening() {
    let h = harness(&[], vec![]);
    let (_, mut events) = h
        .orchestrator
        .start_session(session_config(RangingMode::Auto), vec![peer(1)])
        .unwrap();

    let failed = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::OpenFailed { .. })
    })
    .await;
    match failed {
        SessionEvent::OpenFailed { peer: who, reason, .. } => {
            assert_eq!(who, None);
            assert!(matches!(reason, OpenFailedReason::Unsupported));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_fused_mode_runs_every_mutual_technology() {
    let mut h = harness(&[Technology::Uwb, Technology::BleRssi], vec![]);
    let config = SessionConfig {
        fusion: FusionPolicy::Filtering,
        ..session_config(RangingMode::Fused)
    };
    let (session, mut events) = h.orchestrator.start_session(config, vec![peer(1)]).unwrap();

    next_outbound(&mut h.outbound).await;
    respond(
        &h.orchestrator,
        session,
        peer(1),
        &[Technology::Uwb, Technology::BleRssi],
    );
    next_outbound(&mut h.outbound).await; // configuration

    wait_for(&mut events, |e| matches!(e, SessionEvent::Opened { .. })).await;
    wait_for(&mut events, |e| {
        matches!(
            e,
            SessionEvent::TechnologyStarted {
                technology: Technology::Uwb,
                ..
            }
        )
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(
            e,
            SessionEvent::TechnologyStarted {
                technology: Technology::BleRssi,
                ..
            }
        )
    })
    .await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::Results { .. })).await;
}

#[tokio::test]
async fn test_adapter_failure_reports_failed_to_start() {
    let mut h = harness(&[Technology::Uwb], vec![Technology::Uwb]);
    let (session, mut events) = h
        .orchestrator
        .start_session(session_config(RangingMode::HighAccuracy), vec![peer(1)])
        .unwrap();

    next_outbound(&mut h.outbound).await;
    respond(&h.orchestrator, session, peer(1), &[Technology::Uwb]);

    wait_for(&mut events, |e| matches!(e, SessionEvent::Opened { .. })).await;
    let failed = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::OpenFailed { .. })
    })
    .await;
    match failed {
        SessionEvent::OpenFailed { peer: who, reason, .. } => {
            assert_eq!(who, Some(peer(1)));
            assert!(matches!(reason, OpenFailedReason::FailedToStart(_)));
        }
        _ => unreachable!(),
    }
    wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;
}

#[tokio::test]
async fn test_measurement_limit_closes_the_session() {
    let mut h = harness(&[Technology::Uwb], vec![]);
    let config = SessionConfig {
        measurement_limit: Some(3),
        ..session_config(RangingMode::HighAccuracy)
    };
    let (session, mut events) = h.orchestrator.start_session(config, vec![peer(1)]).unwrap();

    next_outbound(&mut h.outbound).await;
    respond(&h.orchestrator, session, peer(1), &[Technology::Uwb]);
    next_outbound(&mut h.outbound).await;

    wait_for(&mut events, |e| matches!(e, SessionEvent::Opened { .. })).await;
    // The limit trips on its own; no local stop call
    wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;
}

#[tokio::test(start_paused = true)]
async fn test_no_initial_data_timeout_closes_the_session() {
    // Peer negotiates fine but its adapter never produces measurements
    struct SilentAdapter {
        technology: Technology,
        running: Option<(Vec<DeviceId>, AdapterEventSender)>,
    }

    #[async_trait]
    impl TechnologyAdapter for SilentAdapter {
        fn technology(&self) -> Technology {
            self.technology
        }

        async fn start(
            &mut self,
            config: TechnologyConfig,
            _context: AttributionContext,
            events: AdapterEventSender,
        ) -> Result<()> {
            let peers = config.target.peers().to_vec();
            let _ = events.send(AdapterEvent::Started {
                technology: self.technology,
                peers: peers.clone(),
            });
            self.running = Some((peers, events));
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            if let Some((peers, events)) = self.running.take() {
                let _ = events.send(AdapterEvent::Stopped {
                    technology: self.technology,
                    peers,
                    reason: StopReason::LocalRequest,
                });
            }
            Ok(())
        }
    }

    struct SilentFactory;
    impl AdapterFactory for SilentFactory {
        fn create(&self, technology: Technology) -> Result<Box<dyn TechnologyAdapter>> {
            Ok(Box::new(SilentAdapter {
                technology,
                running: None,
            }))
        }
    }

    let (tx, mut outbound) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::builder()
        .adapter_factory(Arc::new(SilentFactory))
        .oob_transport(Arc::new(ChannelTransport { tx }))
        .capability_source(Box::new(StaticSource {
            technology: Technology::Uwb,
        }))
        .build();

    let config = SessionConfig {
        no_initial_data_timeout: Duration::from_millis(500),
        ..session_config(RangingMode::HighAccuracy)
    };
    let (session, mut events) = orchestrator.start_session(config, vec![peer(1)]).unwrap();

    next_outbound(&mut outbound).await;
    respond(&orchestrator, session, peer(1), &[Technology::Uwb]);
    next_outbound(&mut outbound).await;

    wait_for(&mut events, |e| matches!(e, SessionEvent::PeerStarted { .. })).await;

    tokio::time::sleep(Duration::from_secs(2)).await;

    let stopped = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PeerStopped { .. })
    })
    .await;
    match stopped {
        SessionEvent::PeerStopped { reason, .. } => {
            assert_eq!(reason, StopReason::NoInitialDataTimeout);
        }
        _ => unreachable!(),
    }
    let closed = wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;
    match closed {
        SessionEvent::Closed { reason, .. } => {
            assert_eq!(reason, StopReason::NoInitialDataTimeout);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_preconfigured_session_skips_negotiation() {
    let mut h = harness(&[Technology::Uwb], vec![]);
    let config = TechnologyConfig::unicast(peer(1), TechnologyParams::defaults(Technology::Uwb));
    let (session, mut events) = h
        .orchestrator
        .start_preconfigured(session_config(RangingMode::HighAccuracy), vec![config])
        .unwrap();

    wait_for(&mut events, |e| matches!(e, SessionEvent::Opened { .. })).await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::PeerStarted { .. })).await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::Results { .. })).await;

    // No OOB traffic for a pre-agreed session
    assert!(h.outbound.try_recv().is_err());

    h.orchestrator.stop_session(session).unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;
}

#[tokio::test]
async fn test_stop_during_dynamic_add_negotiation_stops_running_peers() {
    let mut h = harness(&[Technology::Uwb], vec![]);
    let (session, mut events) = h
        .orchestrator
        .start_session(session_config(RangingMode::HighAccuracy), vec![peer(1)])
        .unwrap();

    next_outbound(&mut h.outbound).await;
    respond(&h.orchestrator, session, peer(1), &[Technology::Uwb]);
    next_outbound(&mut h.outbound).await; // configuration

    wait_for(&mut events, |e| matches!(e, SessionEvent::Results { .. })).await;

    // Second peer never answers its capability request
    h.orchestrator.add_peer(session, peer(2)).unwrap();
    next_outbound(&mut h.outbound).await;

    h.orchestrator.stop_session(session).unwrap();

    // The unanswered peer fails, the ranging peer gets a real stop, and the
    // session closes; no peer is left running
    let failed = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::OpenFailed { .. })
    })
    .await;
    match failed {
        SessionEvent::OpenFailed { peer: who, reason, .. } => {
            assert_eq!(who, Some(peer(2)));
            assert!(matches!(
                reason,
                OpenFailedReason::FailedToStart(StopReason::LocalRequest)
            ));
        }
        _ => unreachable!(),
    }
    let stopped = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PeerStopped { .. })
    })
    .await;
    match stopped {
        SessionEvent::PeerStopped { peer: who, reason, .. } => {
            assert_eq!(who, peer(1));
            assert_eq!(reason, StopReason::LocalRequest);
        }
        _ => unreachable!(),
    }
    let closed = wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;
    match closed {
        SessionEvent::Closed { reason, .. } => assert_eq!(reason, StopReason::LocalRequest),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_remove_peer_keeps_the_rest_ranging() {
    let mut h = harness(&[Technology::Uwb], vec![]);
    let (session, mut events) = h
        .orchestrator
        .start_session(
            session_config(RangingMode::HighAccuracy),
            vec![peer(1), peer(2)],
        )
        .unwrap();

    next_outbound(&mut h.outbound).await;
    next_outbound(&mut h.outbound).await;
    respond(&h.orchestrator, session, peer(1), &[Technology::Uwb]);
    respond(&h.orchestrator, session, peer(2), &[Technology::Uwb]);
    // Identical params, so one multicast configuration per peer message
    next_outbound(&mut h.outbound).await;
    next_outbound(&mut h.outbound).await;

    wait_for(&mut events, |e| matches!(e, SessionEvent::Opened { .. })).await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PeerStarted { peer: p, .. } if *p == peer(1))
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PeerStarted { peer: p, .. } if *p == peer(2))
    })
    .await;

    h.orchestrator.remove_peer(session, peer(1)).unwrap();
    let stopped = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PeerStopped { .. })
    })
    .await;
    match stopped {
        SessionEvent::PeerStopped { peer: who, .. } => assert_eq!(who, peer(1)),
        _ => unreachable!(),
    }

    // The other peer keeps producing measurements
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Results { peer: p, .. } if *p == peer(2))
    })
    .await;
}
