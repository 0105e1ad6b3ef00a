//! Shared adapter handles
//!
//! One adapter instance serves every peer of one technology config: a single
//! peer for unicast, the whole group for multicast. The handle refcounts the
//! member peers, fans adapter events out to each subscribed peer state
//! machine, and dispatches the actual hardware calls on the worker pool so
//! they never block the caller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use multirange_core::{
    AdapterEvent, AttributionContext, DeviceId, IntervalRange, RangingError, StopReason,
    Technology, TechnologyAdapter, TechnologyConfig,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::workers::WorkerPool;

struct SharedAdapterInner {
    config: TechnologyConfig,
    adapter: tokio::sync::Mutex<Box<dyn TechnologyAdapter>>,
    /// Peers currently attached to this adapter session
    members: Mutex<HashSet<DeviceId>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AdapterEvent>>>,
    started: AtomicBool,
    stopping: AtomicBool,
    /// Set under the adapter lock once the hardware start succeeded; the
    /// stop job only touches hardware the start job actually brought up
    hw_started: AtomicBool,
    /// Channel the adapter itself reports into; a router task fans it out
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
}

/// App visibility transitions forwarded to the hardware stacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppVisibility {
    Foreground,
    Background,
    /// Background grace period expired
    BackgroundTimeout,
}

/// Cloneable handle to one underlying technology session
#[derive(Clone)]
pub struct SharedAdapterHandle {
    inner: Arc<SharedAdapterInner>,
}

impl SharedAdapterHandle {
    /// Wrap an adapter for the peers of `config` and spawn the fan-out
    /// router for its events.
    pub fn new(adapter: Box<dyn TechnologyAdapter>, config: TechnologyConfig) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<AdapterEvent>();
        let inner = Arc::new(SharedAdapterInner {
            config,
            adapter: tokio::sync::Mutex::new(adapter),
            members: Mutex::new(HashSet::new()),
            subscribers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            hw_started: AtomicBool::new(false),
            events_tx,
        });

        // Weak so the router exits once every handle clone is gone; the
        // sender inside `inner` closes the channel on drop.
        let router = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(inner) = router.upgrade() else { break };
                let mut subscribers = inner.subscribers.lock().expect("subscriber lock");
                subscribers.retain(|tx| tx.send(event.clone()).is_ok());
            }
        });

        Self { inner }
    }

    pub fn technology(&self) -> Technology {
        self.inner.config.technology()
    }

    pub fn config(&self) -> &TechnologyConfig {
        &self.inner.config
    }

    /// Subscribe a peer state machine to this adapter's events
    pub fn subscribe(&self, tx: mpsc::UnboundedSender<AdapterEvent>) {
        self.inner.subscribers.lock().expect("subscriber lock").push(tx);
    }

    /// Attach a peer. The first attachment dispatches the hardware start on
    /// the worker pool; later attachments only join the member set.
    pub fn attach(&self, peer: DeviceId, context: AttributionContext, workers: &WorkerPool) {
        {
            let mut members = self.inner.members.lock().expect("member lock");
            members.insert(peer);
        }

        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        workers.dispatch(async move {
            let technology = inner.config.technology();
            let events = inner.events_tx.clone();
            let config = inner.config.clone();
            let mut adapter = inner.adapter.lock().await;
            // The start and stop jobs race for the adapter lock on the pool;
            // a stop that got there first wins and the hardware stays down.
            if inner.stopping.load(Ordering::SeqCst) {
                debug!(%technology, "stop requested before start ran");
                let _ = inner.events_tx.send(AdapterEvent::Closed {
                    technology,
                    reason: StopReason::LocalRequest,
                });
                return;
            }
            match adapter.start(config, context, events).await {
                Ok(()) => inner.hw_started.store(true, Ordering::SeqCst),
                Err(error) => {
                    warn!(%technology, %error, "adapter start failed");
                    // Surface the failure through the normal event path so
                    // every member peer accounts for it.
                    let _ = inner.events_tx.send(AdapterEvent::Closed {
                        technology,
                        reason: StopReason::FailedToStart,
                    });
                }
            }
        });
    }

    /// Detach a peer. The last detachment dispatches the hardware stop; a
    /// multicast member leaving early gets a best-effort `remove_peer`.
    pub fn detach(&self, peer: DeviceId, workers: &WorkerPool) {
        let last = {
            let mut members = self.inner.members.lock().expect("member lock");
            members.remove(&peer);
            members.is_empty()
        };

        if last {
            if self.inner.stopping.swap(true, Ordering::SeqCst) {
                return;
            }
            let inner = Arc::clone(&self.inner);
            workers.dispatch(async move {
                let technology = inner.config.technology();
                let mut adapter = inner.adapter.lock().await;
                // Start never ran (it will observe `stopping`) or already
                // failed; a Closed event covers the members either way.
                if !inner.hw_started.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(error) = adapter.stop().await {
                    warn!(%technology, %error, "adapter stop failed, synthesizing ack");
                    // Termination must stay guaranteed even when the stack
                    // refuses the stop.
                    let _ = inner.events_tx.send(AdapterEvent::Closed {
                        technology,
                        reason: StopReason::Error,
                    });
                }
            });
        } else {
            let inner = Arc::clone(&self.inner);
            workers.dispatch(async move {
                let technology = inner.config.technology();
                let mut adapter = inner.adapter.lock().await;
                match adapter.remove_peer(peer).await {
                    Ok(()) => {}
                    Err(RangingError::Adapter(_)) => {
                        debug!(%technology, %peer, "dynamic peer removal unsupported");
                    }
                    Err(error) => {
                        warn!(%technology, %peer, %error, "dynamic peer removal failed");
                    }
                }
                // The stack will not ack a member-only departure, so tag the
                // departing peer out explicitly for its state machine.
                let _ = inner.events_tx.send(AdapterEvent::Stopped {
                    technology,
                    peers: vec![peer],
                    reason: StopReason::LocalRequest,
                });
            });
        }
    }

    /// Forward an app visibility transition to the adapter
    pub fn app_visibility(&self, state: AppVisibility, workers: &WorkerPool) {
        let inner = Arc::clone(&self.inner);
        workers.dispatch(async move {
            let mut adapter = inner.adapter.lock().await;
            match state {
                AppVisibility::Foreground => adapter.on_foreground(),
                AppVisibility::Background => adapter.on_background(),
                AppVisibility::BackgroundTimeout => adapter.on_background_timeout(),
            }
        });
    }

    /// Best-effort update-interval reconfiguration
    pub fn reconfigure(&self, interval: IntervalRange, workers: &WorkerPool) {
        let inner = Arc::clone(&self.inner);
        workers.dispatch(async move {
            let technology = inner.config.technology();
            let mut adapter = inner.adapter.lock().await;
            if let Err(error) = adapter.reconfigure(interval).await {
                debug!(%technology, %error, "reconfigure rejected");
            }
        });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
