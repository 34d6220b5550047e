//! UDP sockets on the host's real interfaces.
//!
//! Sockets are created with `std::net`, configured, switched to
//! non-blocking mode and handed to tokio with `UdpSocket::from_std`.
//! Senders are bound to the chosen interface's address; on Linux that is
//! enough for multicast to leave through the interface owning the address.
//!
//! Addresses come from `if_addrs`. Link flags come from `/sys/class/net` on
//! Linux; elsewhere every listed interface is taken as active.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use super::{DatagramSocket, InterfaceFlags, Network, NetworkInterfaceInfo, TransportError};

/// Network backed by the operating system's UDP stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpNetwork;

impl UdpNetwork {
    /// Creates the OS network.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn into_tokio(
    socket: std::net::UdpSocket,
    addr: SocketAddrV4,
) -> Result<UdpDatagramSocket, TransportError> {
    socket
        .set_nonblocking(true)
        .map_err(|source| TransportError::Bind { addr, source })?;
    let socket = tokio::net::UdpSocket::from_std(socket)
        .map_err(|source| TransportError::Bind { addr, source })?;
    Ok(UdpDatagramSocket(socket))
}

/// Parse the contents of `/sys/class/net/<if>/flags` and `operstate`.
///
/// The flags word there never carries `IFF_RUNNING`, so carrier comes from
/// the operational state. `unknown` is what drivers without carrier
/// detection report, and counts as running.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_sys_flags(flags: &str, operstate: Option<&str>) -> Option<InterfaceFlags> {
    let bits = u32::from_str_radix(flags.trim().trim_start_matches("0x"), 16).ok()?;
    let mut parsed = InterfaceFlags::from_bits(bits);
    parsed.running = operstate.is_none_or(|state| matches!(state.trim(), "up" | "unknown"));
    Some(parsed)
}

#[cfg(target_os = "linux")]
fn link_flags(name: &str) -> InterfaceFlags {
    let dir = std::path::Path::new("/sys/class/net").join(name);
    let flags = match std::fs::read_to_string(dir.join("flags")) {
        Ok(flags) => flags,
        Err(e) => {
            tracing::debug!(interface = name, error = %e, "no link flags, assuming active");
            return InterfaceFlags::ACTIVE;
        }
    };
    let operstate = std::fs::read_to_string(dir.join("operstate")).ok();
    parse_sys_flags(&flags, operstate.as_deref()).unwrap_or_else(|| {
        tracing::debug!(interface = name, flags = flags.trim(), "unreadable link flags, assuming active");
        InterfaceFlags::ACTIVE
    })
}

#[cfg(not(target_os = "linux"))]
fn link_flags(_name: &str) -> InterfaceFlags {
    InterfaceFlags::ACTIVE
}

fn bind_std(addr: SocketAddrV4) -> Result<std::net::UdpSocket, TransportError> {
    std::net::UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })
}

impl Network for UdpNetwork {
    type Socket = UdpDatagramSocket;

    fn usable_interfaces(&self) -> Vec<NetworkInterfaceInfo> {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list network interfaces");
                return Vec::new();
            }
        };
        interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => {
                    let flags = link_flags(&iface.name);
                    Some(NetworkInterfaceInfo::new(iface.name, v4.ip).with_flags(flags))
                }
                if_addrs::IfAddr::V6(_) => None,
            })
            .filter(NetworkInterfaceInfo::is_usable)
            .collect()
    }

    async fn detect_os_interface(
        &self,
        probe_group: SocketAddrV4,
        timeout: Duration,
    ) -> Option<Ipv4Addr> {
        let listen_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, probe_group.port());
        let receiver = bind_std(listen_addr)
            .inspect_err(|e| tracing::debug!(error = %e, "interface probe bind failed"))
            .ok()?;
        receiver
            .join_multicast_v4(probe_group.ip(), &Ipv4Addr::UNSPECIFIED)
            .inspect_err(|e| tracing::debug!(error = %e, "interface probe join failed"))
            .ok()?;
        let receiver = into_tokio(receiver, listen_addr).ok()?;

        let sender_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let sender = bind_std(sender_addr).ok()?;
        sender.set_multicast_loop_v4(true).ok()?;
        let sender = into_tokio(sender, sender_addr).ok()?;

        let token = format!("vertochat-probe-{}", rand::random::<u64>());
        sender
            .0
            .try_send_to(token.as_bytes(), SocketAddr::V4(probe_group))
            .ok()?;

        let wait_for_echo = async {
            let mut buf = [0u8; 128];
            loop {
                let (len, from) = receiver.0.recv_from(&mut buf).await.ok()?;
                if &buf[..len] == token.as_bytes()
                    && let SocketAddr::V4(from) = from
                {
                    return Some(*from.ip());
                }
            }
        };
        let detected = tokio::time::timeout(timeout, wait_for_echo)
            .await
            .ok()
            .flatten();
        tracing::debug!(detected = ?detected, "OS multicast interface detection finished");
        detected
    }

    fn bind_group(
        &self,
        group: SocketAddrV4,
        interface: Ipv4Addr,
    ) -> Result<Self::Socket, TransportError> {
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
        let socket = bind_std(addr)?;
        socket
            .join_multicast_v4(group.ip(), &interface)
            .map_err(|source| TransportError::Bind { addr: group, source })?;
        into_tokio(socket, addr)
    }

    fn bind_unicast(&self, interface: Ipv4Addr, port: u16) -> Result<Self::Socket, TransportError> {
        let addr = SocketAddrV4::new(interface, port);
        into_tokio(bind_std(addr)?, addr)
    }

    fn bind_sender(&self, interface: Ipv4Addr) -> Result<Self::Socket, TransportError> {
        let addr = SocketAddrV4::new(interface, 0);
        let socket = bind_std(addr)?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(|source| TransportError::Bind { addr, source })?;
        into_tokio(socket, addr)
    }
}

/// A tokio UDP socket.
#[derive(Debug)]
pub struct UdpDatagramSocket(tokio::net::UdpSocket);

impl DatagramSocket for UdpDatagramSocket {
    fn send_to(&self, data: &[u8], target: SocketAddrV4) -> Result<(), TransportError> {
        self.0.try_send_to(data, SocketAddr::V4(target))?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        Ok(self.0.recv_from(buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddrV4, TransportError> {
        match self.0.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(_) => Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::AddrNotAvailable,
            ))),
        }
    }
}
