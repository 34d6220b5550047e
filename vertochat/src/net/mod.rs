//! Network service: the group and private transports behind a connection
//! monitor, with one narrow send API for the controller.
//!
//! The service owns its listeners' receive side (the parsers) strongly and
//! the connection listeners (the controller) weakly, so the controller can
//! own the service without forming a reference cycle.

pub mod monitor;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};

use crate::config::NetworkConfig;
use crate::transport::{Endpoint, MessageTransport, Network, ReceiverListener, TransportError};

use monitor::{ConnectionMonitor, MonitorState};

/// Notified when the network goes down or comes back.
///
/// Callbacks run on the monitor's task (or on the caller of
/// [`NetworkService::connect`]/[`NetworkService::disconnect`]) and never
/// while the monitor holds its own lock.
pub trait NetworkConnectionListener: Send + Sync + 'static {
    /// Called right before [`network_came_up`](Self::network_came_up).
    fn before_network_came_up(&self);

    /// The network is usable. `silent` is true for the first up after
    /// [`NetworkService::connect`].
    fn network_came_up(&self, silent: bool);

    /// The network is gone. `silent` is true when caused by
    /// [`NetworkService::disconnect`].
    fn network_went_down(&self, silent: bool);
}

/// Group chat over multicast plus optional private chat over unicast.
pub struct NetworkService<N: Network> {
    group: Arc<MessageTransport<N>>,
    private: Option<Arc<MessageTransport<N>>>,
    monitor: ConnectionMonitor<N>,
}

impl<N: Network> NetworkService<N> {
    /// Creates a disconnected service.
    ///
    /// Group datagrams go to `group_listener`. The private transport, and
    /// with it `private_listener`, is only used when private chat is
    /// enabled in `config`.
    pub fn new(
        network: Arc<N>,
        config: NetworkConfig,
        group_listener: Arc<dyn ReceiverListener>,
        private_listener: Arc<dyn ReceiverListener>,
    ) -> Self {
        let group = Arc::new(MessageTransport::new(
            Arc::clone(&network),
            Endpoint::Group(config.group),
            config.packet_size,
        ));
        let private = config.private_chat_enabled.then(|| {
            Arc::new(MessageTransport::new(
                Arc::clone(&network),
                Endpoint::Private {
                    port: config.private_chat_port,
                },
                config.packet_size,
            ))
        });
        let monitor = ConnectionMonitor::new(
            network,
            config,
            Arc::clone(&group),
            private.clone().map(|p| (p, private_listener)),
            group_listener,
        );
        Self {
            group,
            private,
            monitor,
        }
    }

    /// Register a listener for up/down notifications. Held weakly.
    pub fn register_connection_listener(&self, listener: Weak<dyn NetworkConnectionListener>) {
        self.monitor.add_listener(listener);
    }

    /// Open the transports and start monitoring the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if no interface is usable or the group
    /// socket cannot be bound.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.monitor.start().await
    }

    /// Stop monitoring and close the transports.
    pub fn disconnect(&self) {
        self.monitor.stop();
    }

    /// Run one connection check now instead of waiting for the timer.
    pub async fn check_connection(&self) {
        self.monitor.check_now().await;
    }

    /// Whether the monitor is running, up or not.
    #[must_use]
    pub fn is_connection_alive(&self) -> bool {
        self.monitor.is_alive()
    }

    /// Whether the network is currently usable.
    #[must_use]
    pub fn is_network_up(&self) -> bool {
        self.monitor.state() == MonitorState::Up
    }

    /// Whether private chat was enabled in the configuration.
    #[must_use]
    pub const fn is_private_chat_enabled(&self) -> bool {
        self.private.is_some()
    }

    /// Port the private chat socket is bound to, if open.
    #[must_use]
    pub fn private_chat_port(&self) -> Option<u16> {
        self.private.as_ref().and_then(|p| p.local_port())
    }

    /// Send a line to the multicast group.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotStarted`] when disconnected, or the
    /// socket error.
    pub fn send_to_all(&self, text: &str) -> Result<(), TransportError> {
        tracing::trace!(text, "sending to group");
        self.group.send(text)
    }

    /// Send a line to one user's private chat port.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotStarted`] when private chat is disabled
    /// or disconnected, or the socket error.
    pub fn send_to_user(&self, text: &str, ip: Ipv4Addr, port: u16) -> Result<(), TransportError> {
        let private = self.private.as_ref().ok_or(TransportError::NotStarted)?;
        tracing::trace!(text, ip = %ip, port, "sending to user");
        private.send_to(text, SocketAddrV4::new(ip, port))
    }
}
