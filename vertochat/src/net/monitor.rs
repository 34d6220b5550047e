//! Connection monitor: picks an interface, keeps the transports open and
//! tells listeners when the network goes down or comes back.
//!
//! The state machine lives in [`LinkTracker`], which is pure and driven by
//! probe results. [`ConnectionMonitor`] runs the probes on a timer. Each
//! probe multicasts a fresh token and passes only if the token comes back
//! through the group receiver, so a link that silently drops traffic still
//! goes down.
//!
//! ```text
//! Stopped -> Starting -> Up <-> Down
//!    ^                    |      |
//!    +------ stop() ------+------+
//! ```

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::NetworkConfig;
use crate::transport::{
    MessageTransport, Network, NetworkInterfaceInfo, ReceiverListener, TransportError,
};

use super::NetworkConnectionListener;

/// Consecutive failed probes that take an up link down.
pub const MISSES_BEFORE_DOWN: u32 = 2;

/// Lifecycle state of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Not running.
    Stopped,
    /// Opening the transports for the first time.
    Starting,
    /// Transports open and probes passing.
    Up,
    /// Link lost; reopening the transports every period.
    Down,
}

/// Notification produced by a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The network became usable.
    CameUp {
        /// True for the first up since [`LinkTracker::starting`].
        silent: bool,
    },
    /// The network became unusable.
    WentDown {
        /// True when caused by an explicit stop.
        silent: bool,
    },
}

/// Pure monitor state machine.
#[derive(Debug, Clone)]
pub struct LinkTracker {
    state: MonitorState,
    misses: u32,
    ever_up: bool,
}

impl Default for LinkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkTracker {
    /// A stopped tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: MonitorState::Stopped,
            misses: 0,
            ever_up: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> MonitorState {
        self.state
    }

    /// `Stopped -> Starting`. Returns false (and changes nothing) from any
    /// other state.
    pub const fn starting(&mut self) -> bool {
        if matches!(self.state, MonitorState::Stopped) {
            self.state = MonitorState::Starting;
            self.misses = 0;
            self.ever_up = false;
            true
        } else {
            false
        }
    }

    /// Record one probe result.
    pub const fn probe(&mut self, ok: bool) -> Option<LinkEvent> {
        match (self.state, ok) {
            (MonitorState::Starting | MonitorState::Down, true) => {
                self.state = MonitorState::Up;
                self.misses = 0;
                let silent = !self.ever_up;
                self.ever_up = true;
                Some(LinkEvent::CameUp { silent })
            }
            (MonitorState::Starting, false) => {
                self.state = MonitorState::Down;
                None
            }
            (MonitorState::Up, true) => {
                self.misses = 0;
                None
            }
            (MonitorState::Up, false) => {
                self.misses += 1;
                if self.misses >= MISSES_BEFORE_DOWN {
                    self.state = MonitorState::Down;
                    self.misses = 0;
                    Some(LinkEvent::WentDown { silent: false })
                } else {
                    None
                }
            }
            (MonitorState::Down, false) | (MonitorState::Stopped, _) => None,
        }
    }

    /// Any state `-> Stopped`. Only an up link reports going down.
    pub const fn stop(&mut self) -> Option<LinkEvent> {
        let was_up = matches!(self.state, MonitorState::Up);
        self.state = MonitorState::Stopped;
        self.misses = 0;
        if was_up {
            Some(LinkEvent::WentDown { silent: true })
        } else {
            None
        }
    }
}

/// Choose the interface to chat on.
///
/// Order: the configured interface if it is usable, then the interface the
/// OS routes multicast through, then the first usable interface.
///
/// # Errors
///
/// Returns [`TransportError::NoUsableInterface`] if no interface is usable.
pub async fn select_interface<N: Network>(
    network: &N,
    config: &NetworkConfig,
) -> Result<NetworkInterfaceInfo, TransportError> {
    let usable = network.usable_interfaces();
    if usable.is_empty() {
        return Err(TransportError::NoUsableInterface);
    }

    if let Some(selector) = config.interface.as_deref() {
        if let Some(iface) = usable.iter().find(|iface| iface.matches(selector)) {
            tracing::debug!(interface = %iface.name, "using configured interface");
            return Ok(iface.clone());
        }
        tracing::warn!(interface = selector, "configured interface is not usable, selecting another");
    }

    let detected = network
        .detect_os_interface(config.detection_group, config.detection_timeout)
        .await;
    if let Some(address) = detected
        && let Some(iface) = usable.iter().find(|iface| iface.address == address)
    {
        tracing::debug!(interface = %iface.name, "using interface chosen by the OS");
        return Ok(iface.clone());
    }

    let first = usable
        .into_iter()
        .next()
        .ok_or(TransportError::NoUsableInterface)?;
    tracing::debug!(interface = %first.name, "using first usable interface");
    Ok(first)
}

/// Group listener that catches the monitor's echo tokens and hands every
/// other datagram to the chat parser.
struct EchoCatcher {
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
    next: Arc<dyn ReceiverListener>,
}

impl EchoCatcher {
    fn new(next: Arc<dyn ReceiverListener>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next,
        }
    }

    /// A new token and the signal fired when it arrives. The token has a
    /// valid header with an unknown type, so peers ignore it.
    fn expect(&self) -> (String, oneshot::Receiver<()>) {
        let token = format!("0!ECHO#{:016x}:", rand::random::<u64>());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(token.clone(), tx);
        (token, rx)
    }

    fn forget(&self, token: &str) {
        self.pending.lock().remove(token);
    }
}

impl ReceiverListener for EchoCatcher {
    fn message_arrived(&self, message: &str, ip: Ipv4Addr) {
        let caught = self.pending.lock().remove(message);
        match caught {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => self.next.message_arrived(message, ip),
        }
    }
}

struct MonitorCore {
    tracker: LinkTracker,
    interface: Option<NetworkInterfaceInfo>,
    last_errors: u64,
    task: Option<JoinHandle<()>>,
}

struct MonitorInner<N: Network> {
    network: Arc<N>,
    config: NetworkConfig,
    group: Arc<MessageTransport<N>>,
    private: Option<Arc<MessageTransport<N>>>,
    group_listener: Arc<EchoCatcher>,
    private_listener: Option<Arc<dyn ReceiverListener>>,
    listeners: Mutex<Vec<Weak<dyn NetworkConnectionListener>>>,
    core: Mutex<MonitorCore>,
}

/// Keeps the group and private transports open while the network allows.
pub struct ConnectionMonitor<N: Network> {
    inner: Arc<MonitorInner<N>>,
}

impl<N: Network> ConnectionMonitor<N> {
    /// Creates a stopped monitor over the given transports.
    pub fn new(
        network: Arc<N>,
        config: NetworkConfig,
        group: Arc<MessageTransport<N>>,
        private: Option<(Arc<MessageTransport<N>>, Arc<dyn ReceiverListener>)>,
        group_listener: Arc<dyn ReceiverListener>,
    ) -> Self {
        let (private, private_listener) = private.unzip();
        Self {
            inner: Arc::new(MonitorInner {
                network,
                config,
                group,
                private,
                group_listener: Arc::new(EchoCatcher::new(group_listener)),
                private_listener,
                listeners: Mutex::new(Vec::new()),
                core: Mutex::new(MonitorCore {
                    tracker: LinkTracker::new(),
                    interface: None,
                    last_errors: 0,
                    task: None,
                }),
            }),
        }
    }

    /// Register a listener for up/down notifications. Held weakly.
    pub fn add_listener(&self, listener: Weak<dyn NetworkConnectionListener>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Current monitor state.
    #[must_use]
    pub fn state(&self) -> MonitorState {
        self.inner.core.lock().tracker.state()
    }

    /// Whether the monitor is running (in any state but `Stopped`).
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state() != MonitorState::Stopped
    }

    /// The interface in use, if the transports are open.
    #[cfg(test)]
    #[must_use]
    pub fn interface(&self) -> Option<NetworkInterfaceInfo> {
        self.inner.core.lock().interface.clone()
    }

    /// Select an interface, open the transports and start the periodic check.
    ///
    /// On success the listeners have already been told the network came up.
    /// Calling this while running does nothing.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] from interface selection or from
    /// binding the group socket. The monitor is stopped again in that case.
    pub async fn start(&self) -> Result<(), TransportError> {
        if !self.inner.core.lock().tracker.starting() {
            tracing::debug!("connection monitor already running");
            return Ok(());
        }

        if let Err(e) = self.inner.open().await {
            self.inner.close_transports();
            self.inner.core.lock().tracker.stop();
            tracing::error!(error = %e, "failed to open network transports");
            return Err(e);
        }

        let event = {
            let mut core = self.inner.core.lock();
            if core.tracker.state() != MonitorState::Starting {
                // Stopped while the transports were opening.
                drop(core);
                self.inner.close_transports();
                return Ok(());
            }
            let event = core.tracker.probe(true);
            core.task = Some(tokio::spawn(check_loop(
                Arc::downgrade(&self.inner),
                self.inner.config.monitor_interval,
            )));
            event
        };
        self.inner.fire(event);
        Ok(())
    }

    /// Stop checking, close the transports (sender before receiver) and tell
    /// the listeners the network went down if it was up.
    pub fn stop(&self) {
        let (event, task) = {
            let mut core = self.inner.core.lock();
            core.interface = None;
            (core.tracker.stop(), core.task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        self.inner.close_transports();
        tracing::info!("connection monitor stopped");
        self.inner.fire(event);
    }

    /// Run one check immediately, as the timer would.
    pub async fn check_now(&self) {
        self.inner.check().await;
    }
}

impl<N: Network> Drop for ConnectionMonitor<N> {
    fn drop(&mut self) {
        if let Some(task) = self.inner.core.lock().task.take() {
            task.abort();
        }
    }
}

impl<N: Network> MonitorInner<N> {
    async fn open(&self) -> Result<(), TransportError> {
        let iface = select_interface(self.network.as_ref(), &self.config).await?;
        let address = iface.address;

        let listener = Arc::clone(&self.group_listener) as Arc<dyn ReceiverListener>;
        self.group.start_receiver(address, listener)?;
        self.group.start_sender(address)?;
        self.open_private(address);

        tracing::info!(interface = %iface.name, address = %address, "network transports open");
        let errors = self.total_errors();
        let mut core = self.core.lock();
        core.interface = Some(iface);
        core.last_errors = errors;
        Ok(())
    }

    fn open_private(&self, address: Ipv4Addr) {
        let (Some(private), Some(listener)) = (&self.private, &self.private_listener) else {
            return;
        };
        let result = private
            .start_receiver(address, Arc::clone(listener))
            .and_then(|()| private.start_sender(address));
        if let Err(e) = result {
            tracing::warn!(error = %e, "private chat unavailable");
            private.stop_sender();
            private.stop_receiver();
        }
    }

    fn close_transports(&self) {
        self.group.stop_sender();
        if let Some(private) = &self.private {
            private.stop_sender();
        }
        self.group.stop_receiver();
        if let Some(private) = &self.private {
            private.stop_receiver();
        }
    }

    fn total_errors(&self) -> u64 {
        self.group.error_count() + self.private.as_ref().map_or(0, |p| p.error_count())
    }

    /// Interface still present, group transport running, a token sent to
    /// the group came back in time, no new errors.
    async fn probe(&self) -> bool {
        let Some(address) = self.core.lock().interface.as_ref().map(|i| i.address) else {
            return false;
        };
        let present = self
            .network
            .usable_interfaces()
            .iter()
            .any(|iface| iface.address == address);
        let running = self.group.is_receiving() && self.group.is_sending();
        let echoed = present && running && self.echo().await;
        let errors = self.total_errors();

        let mut core = self.core.lock();
        let fresh = errors == core.last_errors;
        core.last_errors = errors;
        tracing::trace!(present, running, echoed, fresh, "connection probe");
        present && running && echoed && fresh
    }

    /// Send a fresh token to the group and wait for it to come back.
    async fn echo(&self) -> bool {
        let (token, arrived) = self.group_listener.expect();
        let wait = self.config.probe_timeout.min(self.config.monitor_interval);
        let echoed = match self.group.send(&token) {
            Ok(()) => matches!(tokio::time::timeout(wait, arrived).await, Ok(Ok(()))),
            Err(e) => {
                tracing::debug!(error = %e, "echo token not sent");
                false
            }
        };
        self.group_listener.forget(&token);
        echoed
    }

    async fn check(&self) {
        let before = self.core.lock().tracker.state();
        let ok = match before {
            MonitorState::Up => self.probe().await,
            MonitorState::Down => match self.open().await {
                Ok(()) => self.probe().await,
                Err(e) => {
                    tracing::debug!(error = %e, "network still down");
                    self.close_transports();
                    false
                }
            },
            MonitorState::Stopped | MonitorState::Starting => return,
        };

        let event = {
            let mut core = self.core.lock();
            if core.tracker.state() != before {
                return;
            }
            let event = core.tracker.probe(ok);
            if matches!(event, Some(LinkEvent::WentDown { .. })) {
                core.interface = None;
            }
            event
        };
        if matches!(event, Some(LinkEvent::WentDown { .. })) {
            tracing::warn!("network connection lost");
            self.close_transports();
        }
        self.fire(event);
    }

    fn fire(&self, event: Option<LinkEvent>) {
        let Some(event) = event else {
            return;
        };
        let listeners: Vec<Arc<dyn NetworkConnectionListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::info!(?event, "network state changed");
        for listener in listeners {
            match event {
                LinkEvent::CameUp { silent } => {
                    listener.before_network_came_up();
                    listener.network_came_up(silent);
                }
                LinkEvent::WentDown { silent } => listener.network_went_down(silent),
            }
        }
    }
}

async fn check_loop<N: Network>(inner: Weak<MonitorInner<N>>, period: Duration) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.check().await;
    }
}
