//! Datagram transport layer for `VertoChat`.
//!
//! [`MessageTransport`] owns one receive socket and one send socket for a
//! single endpoint: the multicast group, or the private unicast port. The
//! sockets themselves come from a [`Network`] implementation:
//! - [`udp::UdpNetwork`]: real UDP sockets on the host's interfaces
//! - [`loopback::LoopbackNetwork`]: in-process hub for testing

pub mod loopback;
pub mod udp;

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// How many consecutive ports are tried for the private chat socket.
pub const PRIVATE_PORT_ATTEMPTS: u16 = 50;

/// Pause after a failed receive so a broken socket does not spin.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Interface name prefixes of virtual and point-to-point links.
const VIRTUAL_PREFIXES: &[&str] = &[
    "vmnet", "vboxnet", "docker", "br-", "veth", "virbr", "tun", "tap", "ppp", "utun", "wg",
];

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A socket could not be bound or could not join its group.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was attempted.
        addr: SocketAddrV4,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The sender has not been started, or was stopped.
    #[error("transport not started")]
    NotStarted,

    /// No interface passed the usability filter.
    #[error("no usable network interface")]
    NoUsableInterface,

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Link flags of an interface as the OS reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceFlags {
    /// Administratively up.
    pub up: bool,
    /// Has carrier (operationally up).
    pub running: bool,
    /// Loopback device.
    pub loopback: bool,
    /// Point-to-point link such as a VPN tunnel.
    pub point_to_point: bool,
    /// Supports multicast.
    pub multicast: bool,
}

impl InterfaceFlags {
    /// An ordinary LAN interface that is up with carrier.
    pub const ACTIVE: Self = Self {
        up: true,
        running: true,
        loopback: false,
        point_to_point: false,
        multicast: true,
    };

    const IFF_UP: u32 = 0x1;
    const IFF_LOOPBACK: u32 = 0x8;
    const IFF_POINTOPOINT: u32 = 0x10;
    const IFF_RUNNING: u32 = 0x40;
    const IFF_MULTICAST: u32 = 0x1000;

    /// Decode the `IFF_*` bits of an interface flags word.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            up: bits & Self::IFF_UP != 0,
            running: bits & Self::IFF_RUNNING != 0,
            loopback: bits & Self::IFF_LOOPBACK != 0,
            point_to_point: bits & Self::IFF_POINTOPOINT != 0,
            multicast: bits & Self::IFF_MULTICAST != 0,
        }
    }

    /// Up, with carrier, multicast capable, and neither loopback nor
    /// point-to-point.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        self.up && self.running && self.multicast && !self.loopback && !self.point_to_point
    }
}

impl Default for InterfaceFlags {
    fn default() -> Self {
        Self::ACTIVE
    }
}

/// An IPv4 address on a named local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceInfo {
    /// OS name of the interface, e.g. `eth0`.
    pub name: String,
    /// IPv4 address assigned to the interface.
    pub address: Ipv4Addr,
    /// Link state and capabilities.
    pub flags: InterfaceFlags,
}

impl NetworkInterfaceInfo {
    /// Creates info for an active interface from a name and address.
    pub fn new(name: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            address,
            flags: InterfaceFlags::ACTIVE,
        }
    }

    /// Replace the link flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: InterfaceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether this interface can carry the LAN chat.
    ///
    /// The link must be up, have carrier and support multicast. Loopback
    /// and point-to-point links are rejected, as are link-local and
    /// unspecified addresses and interfaces whose names mark them as
    /// virtual.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        if !self.flags.is_usable() {
            return false;
        }
        let address = self.address;
        if address.is_loopback() || address.is_link_local() || address.is_unspecified() {
            return false;
        }
        let name = self.name.to_ascii_lowercase();
        !VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
    }

    /// Whether `selector` names this interface, by name or by address.
    #[must_use]
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim();
        self.name == selector || self.address.to_string() == selector
    }
}

/// A bound datagram socket.
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send one datagram without waiting. A full buffer is an error.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the datagram could not be handed
    /// to the network.
    fn send_to(&self, data: &[u8], target: SocketAddrV4) -> Result<(), TransportError>;

    /// Wait for the next datagram. Cancelled by dropping the future.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(usize, SocketAddr), TransportError>> + Send;

    /// Local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the address cannot be queried.
    fn local_addr(&self) -> Result<SocketAddrV4, TransportError>;

    /// Stop delivery and release the bound address now rather than when the
    /// last reference is dropped. Sockets that cannot do this ignore it.
    fn close(&self) {}
}

/// Source of sockets and interface information.
///
/// All `bind_*` methods must be called from within a tokio runtime.
pub trait Network: Send + Sync + 'static {
    /// Socket type produced by this network.
    type Socket: DatagramSocket;

    /// IPv4 interfaces currently present that pass
    /// [`NetworkInterfaceInfo::is_usable`].
    fn usable_interfaces(&self) -> Vec<NetworkInterfaceInfo>;

    /// Address of the interface the OS routes multicast through, found by
    /// sending a probe to `probe_group` and watching where it comes back
    /// from. `None` if nothing came back within `timeout`.
    fn detect_os_interface(
        &self,
        probe_group: SocketAddrV4,
        timeout: Duration,
    ) -> impl Future<Output = Option<Ipv4Addr>> + Send;

    /// Bind a socket receiving datagrams sent to `group` on `interface`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the port is taken or the group
    /// cannot be joined.
    fn bind_group(
        &self,
        group: SocketAddrV4,
        interface: Ipv4Addr,
    ) -> Result<Self::Socket, TransportError>;

    /// Bind a socket receiving unicast datagrams on `interface:port`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the port is taken.
    fn bind_unicast(&self, interface: Ipv4Addr, port: u16) -> Result<Self::Socket, TransportError>;

    /// Bind a socket for sending from `interface` on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if no socket can be created.
    fn bind_sender(&self, interface: Ipv4Addr) -> Result<Self::Socket, TransportError>;
}

/// Receives every datagram that arrives on a [`MessageTransport`].
pub trait ReceiverListener: Send + Sync + 'static {
    /// Called once per datagram with its text and source address.
    fn message_arrived(&self, message: &str, ip: Ipv4Addr);
}

/// What a [`MessageTransport`] receives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// A multicast group; sends go to the group.
    Group(SocketAddrV4),
    /// A unicast port, trying the following ports when it is taken.
    Private {
        /// First port tried.
        port: u16,
    },
}

/// A running receive loop and the socket it reads from.
struct ReceiverHandle<S> {
    socket: Arc<S>,
    local: SocketAddrV4,
    task: JoinHandle<()>,
}

/// Send and receive sockets for one endpoint.
pub struct MessageTransport<N: Network> {
    network: Arc<N>,
    endpoint: Endpoint,
    packet_size: usize,
    receiver: Mutex<Option<ReceiverHandle<N::Socket>>>,
    sender: Mutex<Option<Arc<N::Socket>>>,
    errors: Arc<AtomicU64>,
}

impl<N: Network> MessageTransport<N> {
    /// Creates a stopped transport for `endpoint`.
    pub fn new(network: Arc<N>, endpoint: Endpoint, packet_size: usize) -> Self {
        Self {
            network,
            endpoint,
            packet_size,
            receiver: Mutex::new(None),
            sender: Mutex::new(None),
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The endpoint this transport serves.
    #[must_use]
    pub const fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Bind the receive socket on `interface` and spawn the receive loop.
    ///
    /// Calling this while the receiver is running does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the socket cannot be bound (for a
    /// private endpoint: if every candidate port is taken).
    pub fn start_receiver(
        &self,
        interface: Ipv4Addr,
        listener: Arc<dyn ReceiverListener>,
    ) -> Result<(), TransportError> {
        let mut slot = self.receiver.lock();
        if let Some(handle) = slot.as_ref() {
            tracing::debug!(local = %handle.local, "receiver already running");
            return Ok(());
        }

        let socket = Arc::new(self.bind_receiver(interface)?);
        let local = socket.local_addr()?;
        let task = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            listener,
            self.packet_size,
            Arc::clone(&self.errors),
        ));
        tracing::info!(local = %local, endpoint = ?self.endpoint, "receiver started");
        *slot = Some(ReceiverHandle {
            socket,
            local,
            task,
        });
        Ok(())
    }

    fn bind_receiver(&self, interface: Ipv4Addr) -> Result<N::Socket, TransportError> {
        match self.endpoint {
            Endpoint::Group(group) => self.network.bind_group(group, interface),
            Endpoint::Private { port } => {
                let mut last_error = None;
                for candidate in (0..PRIVATE_PORT_ATTEMPTS).filter_map(|i| port.checked_add(i)) {
                    match self.network.bind_unicast(interface, candidate) {
                        Ok(socket) => return Ok(socket),
                        Err(e) => {
                            tracing::debug!(port = candidate, error = %e, "private port unavailable");
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.unwrap_or(TransportError::NoUsableInterface))
            }
        }
    }

    /// Stop the receive loop and close its socket. Does nothing if stopped.
    pub fn stop_receiver(&self) {
        if let Some(handle) = self.receiver.lock().take() {
            handle.task.abort();
            handle.socket.close();
            tracing::info!(local = %handle.local, "receiver stopped");
        }
    }

    /// Bind the send socket on `interface`. Does nothing if running.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the socket cannot be bound.
    pub fn start_sender(&self, interface: Ipv4Addr) -> Result<(), TransportError> {
        let mut slot = self.sender.lock();
        if slot.is_some() {
            tracing::debug!(endpoint = ?self.endpoint, "sender already running");
            return Ok(());
        }
        let socket = self.network.bind_sender(interface)?;
        tracing::info!(interface = %interface, endpoint = ?self.endpoint, "sender started");
        *slot = Some(Arc::new(socket));
        Ok(())
    }

    /// Close the send socket. Does nothing if stopped.
    pub fn stop_sender(&self) {
        if let Some(socket) = self.sender.lock().take() {
            socket.close();
            tracing::info!(endpoint = ?self.endpoint, "sender stopped");
        }
    }

    /// Send `text` to the multicast group.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotStarted`] for a private endpoint or a
    /// stopped sender, or the socket error. Socket errors are also counted
    /// in [`error_count`](Self::error_count).
    pub fn send(&self, text: &str) -> Result<(), TransportError> {
        match self.endpoint {
            Endpoint::Group(group) => self.send_to(text, group),
            Endpoint::Private { .. } => Err(TransportError::NotStarted),
        }
    }

    /// Send `text` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotStarted`] if the sender is stopped, or
    /// the socket error. Socket errors are also counted in
    /// [`error_count`](Self::error_count).
    pub fn send_to(&self, text: &str, target: SocketAddrV4) -> Result<(), TransportError> {
        let socket = self
            .sender
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or(TransportError::NotStarted)?;
        socket.send_to(text.as_bytes(), target).inspect_err(|e| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(target = %target, error = %e, "send failed");
        })
    }

    /// Whether the receive loop is running.
    #[must_use]
    pub fn is_receiving(&self) -> bool {
        self.receiver
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Whether the send socket is open.
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Total send and receive failures since this transport was created.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Port the receive socket is bound to, if running.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        self.receiver.lock().as_ref().map(|handle| handle.local.port())
    }
}

impl<N: Network> Drop for MessageTransport<N> {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver.get_mut().take() {
            handle.task.abort();
        }
    }
}

/// Read datagrams until aborted, handing each to `listener`.
async fn receive_loop<S: DatagramSocket>(
    socket: Arc<S>,
    listener: Arc<dyn ReceiverListener>,
    packet_size: usize,
    errors: Arc<AtomicU64>,
) {
    let mut buf = vec![0u8; packet_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, SocketAddr::V4(from))) => {
                let text = String::from_utf8_lossy(&buf[..len]);
                listener.message_arrived(&text, *from.ip());
            }
            Ok((_, from)) => tracing::debug!(from = %from, "ignoring non-IPv4 datagram"),
            Err(e) => {
                errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "receive failed");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
            }
        }
    }
}
