//! In-process network for testing.
//!
//! A [`LoopbackHub`] stands in for one LAN segment. Each
//! [`LoopbackNetwork`] is a host on that segment with a single interface
//! (`eth0`) and its own IPv4 address. Multicast datagrams reach every socket
//! that joined the group, including sockets on the sending host, just like
//! a real multicast group with loopback enabled. Pulling a host's cable
//! with [`LoopbackNetwork::set_link_up`] removes its interface, fails its
//! sends and drops datagrams addressed to it.
//! [`LoopbackNetwork::set_black_hole`] is the quieter failure: the interface
//! stays listed and sends succeed, but nothing reaches or leaves the host.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{DatagramSocket, Network, NetworkInterfaceInfo, TransportError};

/// Name of the single interface every loopback host has.
pub const INTERFACE_NAME: &str = "eth0";

/// First port handed out to sender sockets.
const FIRST_EPHEMERAL_PORT: u16 = 50_000;

type Datagram = (Vec<u8>, SocketAddrV4);

/// Shared state of one simulated LAN segment.
pub struct LoopbackHub {
    state: Mutex<HubState>,
}

struct HubState {
    hosts: HashMap<Ipv4Addr, HostState>,
    sockets: HashMap<u64, SocketEntry>,
    next_id: u64,
    next_port: u16,
}

struct HostState {
    link_up: bool,
    black_hole: bool,
    os_detection: bool,
}

impl HostState {
    const fn reachable(&self) -> bool {
        self.link_up && !self.black_hole
    }
}

struct SocketEntry {
    local: SocketAddrV4,
    group: Option<Ipv4Addr>,
    tx: mpsc::UnboundedSender<Datagram>,
}

impl LoopbackHub {
    /// Creates an empty segment.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                hosts: HashMap::new(),
                sockets: HashMap::new(),
                next_id: 0,
                next_port: FIRST_EPHEMERAL_PORT,
            }),
        })
    }

    fn register(
        self: &Arc<Self>,
        local: SocketAddrV4,
        group: Option<Ipv4Addr>,
    ) -> Result<LoopbackSocket, TransportError> {
        let mut state = self.state.lock();
        if !state.hosts.get(local.ip()).is_some_and(|host| host.link_up) {
            return Err(TransportError::Bind {
                addr: local,
                source: io::Error::from(io::ErrorKind::AddrNotAvailable),
            });
        }
        let taken = state
            .sockets
            .values()
            .any(|entry| entry.local == local && entry.group == group);
        if taken {
            return Err(TransportError::Bind {
                addr: local,
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id;
        state.next_id += 1;
        state.sockets.insert(id, SocketEntry { local, group, tx });
        Ok(LoopbackSocket {
            hub: Arc::clone(self),
            id,
            local,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn ephemeral_port(&self) -> u16 {
        let mut state = self.state.lock();
        let port = state.next_port;
        state.next_port = state.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
        port
    }

    fn deliver(&self, from: SocketAddrV4, data: &[u8], target: SocketAddrV4) -> io::Result<()> {
        let state = self.state.lock();
        let Some(sender) = state.hosts.get(from.ip()).filter(|host| host.link_up) else {
            return Err(io::Error::from(io::ErrorKind::NetworkUnreachable));
        };
        if sender.black_hole {
            return Ok(());
        }
        let reachable = |ip: &Ipv4Addr| state.hosts.get(ip).is_some_and(HostState::reachable);

        let multicast = target.ip().is_multicast();
        for entry in state.sockets.values() {
            let addressed = if multicast {
                entry.group == Some(*target.ip()) && entry.local.port() == target.port()
            } else {
                entry.group.is_none() && entry.local == target
            };
            if addressed && reachable(entry.local.ip()) {
                let _ = entry.tx.send((data.to_vec(), from));
            }
        }
        Ok(())
    }

    fn unregister(&self, id: u64) {
        self.state.lock().sockets.remove(&id);
    }
}

/// One host on a [`LoopbackHub`].
pub struct LoopbackNetwork {
    hub: Arc<LoopbackHub>,
    address: Ipv4Addr,
}

impl LoopbackNetwork {
    /// Adds a host with `address` to `hub`, with its link up.
    #[must_use]
    pub fn new(hub: &Arc<LoopbackHub>, address: Ipv4Addr) -> Self {
        hub.state.lock().hosts.insert(
            address,
            HostState {
                link_up: true,
                black_hole: false,
                os_detection: true,
            },
        );
        Self {
            hub: Arc::clone(hub),
            address,
        }
    }

    /// The host's address.
    #[must_use]
    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Plug or pull the host's network cable.
    pub fn set_link_up(&self, up: bool) {
        if let Some(host) = self.hub.state.lock().hosts.get_mut(&self.address) {
            host.link_up = up;
        }
        tracing::debug!(host = %self.address, up, "loopback link changed");
    }

    /// Silently drop every datagram to or from this host while its
    /// interface stays listed and its sends keep succeeding.
    pub fn set_black_hole(&self, enabled: bool) {
        if let Some(host) = self.hub.state.lock().hosts.get_mut(&self.address) {
            host.black_hole = enabled;
        }
        tracing::debug!(host = %self.address, enabled, "loopback black hole changed");
    }

    /// Make OS interface detection succeed or come back empty.
    pub fn set_os_detection(&self, enabled: bool) {
        if let Some(host) = self.hub.state.lock().hosts.get_mut(&self.address) {
            host.os_detection = enabled;
        }
    }

    fn host_flags(&self) -> (bool, bool) {
        self.hub
            .state
            .lock()
            .hosts
            .get(&self.address)
            .map_or((false, false), |host| (host.link_up, host.os_detection))
    }

    fn check_interface(&self, interface: Ipv4Addr, port: u16) -> Result<(), TransportError> {
        if interface == self.address {
            Ok(())
        } else {
            Err(TransportError::Bind {
                addr: SocketAddrV4::new(interface, port),
                source: io::Error::from(io::ErrorKind::AddrNotAvailable),
            })
        }
    }
}

impl Network for LoopbackNetwork {
    type Socket = LoopbackSocket;

    fn usable_interfaces(&self) -> Vec<NetworkInterfaceInfo> {
        let (link_up, _) = self.host_flags();
        if link_up {
            vec![NetworkInterfaceInfo::new(INTERFACE_NAME, self.address)]
        } else {
            Vec::new()
        }
    }

    async fn detect_os_interface(
        &self,
        _probe_group: SocketAddrV4,
        _timeout: Duration,
    ) -> Option<Ipv4Addr> {
        match self.host_flags() {
            (true, true) => Some(self.address),
            _ => None,
        }
    }

    fn bind_group(
        &self,
        group: SocketAddrV4,
        interface: Ipv4Addr,
    ) -> Result<Self::Socket, TransportError> {
        self.check_interface(interface, group.port())?;
        self.hub.register(
            SocketAddrV4::new(self.address, group.port()),
            Some(*group.ip()),
        )
    }

    fn bind_unicast(&self, interface: Ipv4Addr, port: u16) -> Result<Self::Socket, TransportError> {
        self.check_interface(interface, port)?;
        self.hub.register(SocketAddrV4::new(self.address, port), None)
    }

    fn bind_sender(&self, interface: Ipv4Addr) -> Result<Self::Socket, TransportError> {
        self.check_interface(interface, 0)?;
        let port = self.hub.ephemeral_port();
        self.hub.register(SocketAddrV4::new(self.address, port), None)
    }
}

/// Socket on a [`LoopbackHub`].
pub struct LoopbackSocket {
    hub: Arc<LoopbackHub>,
    id: u64,
    local: SocketAddrV4,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl DatagramSocket for LoopbackSocket {
    fn send_to(&self, data: &[u8], target: SocketAddrV4) -> Result<(), TransportError> {
        Ok(self.hub.deliver(self.local, data, target)?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        let mut rx = self.rx.lock().await;
        let (data, from) = rx
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, SocketAddr::V4(from)))
    }

    fn local_addr(&self) -> Result<SocketAddrV4, TransportError> {
        Ok(self.local)
    }

    fn close(&self) {
        self.hub.unregister(self.id);
    }
}

impl Drop for LoopbackSocket {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 168, 5, 1), 40005);

    fn host(hub: &Arc<LoopbackHub>, last: u8) -> LoopbackNetwork {
        LoopbackNetwork::new(hub, Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn unicast_reaches_only_the_bound_port() {
        let hub = LoopbackHub::new();
        let a = host(&hub, 1);
        let b = host(&hub, 2);
        let receiver = b.bind_unicast(b.address(), 40008).unwrap();
        let other = b.bind_unicast(b.address(), 40009).unwrap();
        let sender = a.bind_sender(a.address()).unwrap();

        sender
            .send_to(b"hello", SocketAddrV4::new(b.address(), 40008))
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from.ip(), std::net::IpAddr::V4(a.address()));
        assert!(other.rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn same_port_twice_is_in_use() {
        let hub = LoopbackHub::new();
        let a = host(&hub, 1);
        let _first = a.bind_group(GROUP, a.address()).unwrap();
        assert!(matches!(
            a.bind_group(GROUP, a.address()),
            Err(TransportError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn closing_releases_the_port() {
        let hub = LoopbackHub::new();
        let a = host(&hub, 1);
        let first = a.bind_unicast(a.address(), 40008).unwrap();
        first.close();
        assert!(a.bind_unicast(a.address(), 40008).is_ok());
    }

    #[tokio::test]
    async fn pulled_cable_hides_interface_and_fails_sends() {
        let hub = LoopbackHub::new();
        let a = host(&hub, 1);
        let sender = a.bind_sender(a.address()).unwrap();
        a.set_link_up(false);

        assert!(a.usable_interfaces().is_empty());
        assert!(sender.send_to(b"x", GROUP).is_err());
        assert!(a.bind_group(GROUP, a.address()).is_err());
        assert_eq!(
            a.detect_os_interface(GROUP, Duration::from_millis(1)).await,
            None
        );

        a.set_link_up(true);
        assert_eq!(a.usable_interfaces().len(), 1);
        assert!(sender.send_to(b"x", GROUP).is_ok());
    }

    #[tokio::test]
    async fn black_hole_keeps_the_interface_but_drops_traffic() {
        let hub = LoopbackHub::new();
        let a = host(&hub, 1);
        let b = host(&hub, 2);
        let a_group = a.bind_group(GROUP, a.address()).unwrap();
        let b_group = b.bind_group(GROUP, b.address()).unwrap();
        let a_sender = a.bind_sender(a.address()).unwrap();
        let b_sender = b.bind_sender(b.address()).unwrap();
        a.set_black_hole(true);

        assert_eq!(a.usable_interfaces().len(), 1);
        assert!(a_sender.send_to(b"out", GROUP).is_ok());
        assert!(b_sender.send_to(b"in", GROUP).is_ok());
        assert!(a_group.rx.lock().await.try_recv().is_err());

        let mut buf = [0u8; 8];
        let (len, _) = b_group.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"in");
        assert!(b_group.rx.lock().await.try_recv().is_err());

        a.set_black_hole(false);
        assert!(a_sender.send_to(b"again", GROUP).is_ok());
        let (len, _) = a_group.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"again");
    }

    #[tokio::test]
    async fn binding_a_foreign_address_fails() {
        let hub = LoopbackHub::new();
        let a = host(&hub, 1);
        assert!(a.bind_sender(Ipv4Addr::new(10, 0, 0, 99)).is_err());
    }
}
