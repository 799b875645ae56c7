//! Routing change detection
//!
//! The [`Detector`] listens to raw routing table notifications from the
//! platform layer and collapses bursts of them (interfaces flapping, DHCP
//! renewals, the VPN engine installing its own routes) into a single
//! [`RouteChangeEvent`], delivered [`DELAY_BEFORE_NOTIFY`] after the last
//! raw change.
//!
//! When a protected interface is configured, each event also says whether
//! internet traffic still leaves through that interface. If it does not,
//! traffic is leaking outside the tunnel.
//!
//! # Delivery
//!
//! Events go to a bounded channel with a non-blocking send. If the consumer
//! has not drained the previous event, the new one is dropped: the consumer
//! only needs to know that *something* changed since it last looked, and it
//! can always query the route table itself.

pub mod debounce;

use crate::platform::{PlatformError, RouteMonitor, RouteTable};
use debounce::Debouncer;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Quiet period after the last raw change before notifying
pub const DELAY_BEFORE_NOTIFY: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Route change detector is not initialized")]
    NotInitialized,
    #[error("Route change detector requires a Tokio runtime")]
    NoRuntime,
    #[error("Platform error: {0}")]
    PlatformError(#[from] PlatformError),
}

/// One detected routing change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteChangeEvent {
    leak_detected: bool,
    new_gateway: Option<IpAddr>,
}

impl RouteChangeEvent {
    /// True if internet traffic no longer goes through the protected interface
    pub fn is_interface_leak(&self) -> bool {
        self.leak_detected
    }

    /// Next hop of the route now used for internet traffic, when known
    pub fn new_default_gateway(&self) -> Option<IpAddr> {
        self.new_gateway
    }
}

#[derive(Default)]
struct DetectorState {
    initialized: bool,
    running: bool,
    protected_interface: Option<String>,
    notify_tx: Option<mpsc::Sender<RouteChangeEvent>>,
    debouncer: Option<Arc<Debouncer>>,
    monitor_cancel: Option<CancellationToken>,
}

/// Detects routing changes and interface leaks
pub struct Detector {
    delay: Duration,
    route_table: Arc<dyn RouteTable>,
    monitor: Arc<dyn RouteMonitor>,
    state: Mutex<DetectorState>,
}

impl Detector {
    pub fn new(route_table: Arc<dyn RouteTable>, monitor: Arc<dyn RouteMonitor>) -> Self {
        Self::with_delay(route_table, monitor, DELAY_BEFORE_NOTIFY)
    }

    pub fn with_delay(
        route_table: Arc<dyn RouteTable>,
        monitor: Arc<dyn RouteMonitor>,
        delay: Duration,
    ) -> Self {
        Self {
            delay,
            route_table,
            monitor,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Initialize the detector (stops it first if it was running).
    ///
    /// Without a `protected_interface` leak detection is disabled and events
    /// only signal that routing changed.
    pub fn init(
        &self,
        notify_tx: mpsc::Sender<RouteChangeEvent>,
        protected_interface: Option<String>,
    ) {
        self.stop();

        let mut state = self.lock_state();
        if protected_interface.is_none() {
            info!("Initialisation: interface to protect not specified, leak detection disabled");
        }

        state.protected_interface = protected_interface;
        state.notify_tx = Some(notify_tx);
        state.debouncer = None;
        state.initialized = true;
    }

    /// Stop the detector and forget the notification channel
    pub fn uninit(&self) {
        self.stop();
        let mut state = self.lock_state();
        state.initialized = false;
        state.debouncer = None;
        state.notify_tx = None;
        state.protected_interface = None;
    }

    /// Start watching routing changes in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), DetectorError> {
        let mut state = self.lock_state();

        if !state.initialized {
            return Err(DetectorError::NotInitialized);
        }
        if state.running {
            return Ok(());
        }

        let debouncer = match &state.debouncer {
            Some(debouncer) => Arc::clone(debouncer),
            None => {
                let debouncer = Arc::new(self.build_debouncer(&state)?);
                state.debouncer = Some(Arc::clone(&debouncer));
                debouncer
            }
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        self.monitor.spawn(
            Arc::new(move || debouncer.reset_unless_cancelled(&token)),
            cancel.clone(),
        )?;

        state.monitor_cancel = Some(cancel);
        state.running = true;
        info!(
            "Route change detector started (protecting: {})",
            state.protected_interface.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    /// Stop watching. Safe to call at any time.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        state.running = false;
        // Token first: callbacks already in flight then cannot reschedule
        let cancel = state.monitor_cancel.take();
        if let Some(cancel) = &cancel {
            cancel.cancel();
        }
        if let Some(debouncer) = &state.debouncer {
            debouncer.cancel();
        }
        if cancel.is_some() {
            debug!("Route change detector stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    pub fn protected_interface(&self) -> Option<String> {
        self.lock_state().protected_interface.clone()
    }

    /// Raw change entry point (normally driven by the platform monitor).
    /// Ignored unless the detector is running.
    pub fn route_changed(&self) {
        let state = self.lock_state();
        if !state.running {
            return;
        }
        if let Some(debouncer) = &state.debouncer {
            debouncer.reset();
        }
    }

    fn build_debouncer(&self, state: &DetectorState) -> Result<Debouncer, DetectorError> {
        let runtime = Handle::try_current().map_err(|_| DetectorError::NoRuntime)?;
        let notify_tx = state.notify_tx.clone().ok_or(DetectorError::NotInitialized)?;
        let route_table = Arc::clone(&self.route_table);
        let protected = state.protected_interface.clone();
        Ok(Debouncer::new(
            self.delay,
            runtime,
            Arc::new(move || {
                notify_route_change(&notify_tx, protected.as_deref(), route_table.as_ref());
            }),
        ))
    }

    fn lock_state(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the event for the current routing state and hand it to the consumer
fn notify_route_change(
    tx: &mpsc::Sender<RouteChangeEvent>,
    protected_interface: Option<&str>,
    route_table: &dyn RouteTable,
) {
    let mut event = RouteChangeEvent::default();

    if let Some(protected) = protected_interface {
        match route_table.default_route() {
            Ok(route) => {
                event.leak_detected = route.interface != protected;
                event.new_gateway = route.gateway;
                if event.leak_detected {
                    warn!(
                        "Route change detected. Internet traffic is no longer routed through {} (now: {})",
                        protected, route.interface
                    );
                }
            }
            Err(e) => {
                debug!("Route change ignored, leak check failed: {}", e);
                return;
            }
        }
    }

    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => debug!("Route change notification dropped (pending one not consumed)"),
        Err(TrySendError::Closed(_)) => debug!("Route change notification dropped (receiver closed)"),
    }
}
