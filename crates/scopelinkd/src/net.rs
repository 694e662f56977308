//! Socket setup shared by every endpoint.
//!
//! Sockets are created synchronously with socket2 in the endpoint
//! constructor, so bind errors and the bound port are known before the
//! worker starts. The worker adopts the socket into its own runtime in
//! `on_start`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::error::EndpointError;

pub fn resolve(addr: &str) -> Result<SocketAddr, EndpointError> {
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| EndpointError::Resolve(addr.to_string()))
}

/// Bind a server socket. `buffer_bytes` sizes both kernel buffers.
pub fn bind_udp(addr: &str, buffer_bytes: Option<usize>) -> Result<std::net::UdpSocket, EndpointError> {
    let target = resolve(addr)?;
    let bind_err = |source| EndpointError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    if let Some(bytes) = buffer_bytes {
        socket.set_recv_buffer_size(bytes).map_err(bind_err)?;
        socket.set_send_buffer_size(bytes).map_err(bind_err)?;
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&target.into()).map_err(bind_err)?;

    Ok(socket.into())
}

/// Bind a listening stream socket. `buffer_bytes` sizes both kernel buffers;
/// accepted connections inherit them.
pub fn bind_tcp(addr: &str, buffer_bytes: Option<usize>) -> Result<std::net::TcpListener, EndpointError> {
    let target = resolve(addr)?;
    let bind_err = |source| EndpointError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    if let Some(bytes) = buffer_bytes {
        socket.set_recv_buffer_size(bytes).map_err(bind_err)?;
        socket.set_send_buffer_size(bytes).map_err(bind_err)?;
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&target.into()).map_err(bind_err)?;
    socket.listen(128).map_err(bind_err)?;

    Ok(socket.into())
}

/// Open a client socket on an ephemeral port, connected to `addr`.
pub fn connect_udp(addr: &str) -> Result<std::net::UdpSocket, EndpointError> {
    let target = resolve(addr)?;
    let connect_err = |source| EndpointError::Connect {
        addr: addr.to_string(),
        source,
    };

    let socket = std::net::UdpSocket::bind(unspecified(target, 0)).map_err(connect_err)?;
    socket.connect(target).map_err(connect_err)?;
    socket.set_nonblocking(true).map_err(connect_err)?;
    Ok(socket)
}

fn unspecified(target: SocketAddr, port: u16) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, port).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, port).into(),
    }
}

/// Socket for sending announcements to `group`. Multicast announcements
/// stay on the local link and loop back to explorers on this host.
pub fn announce_socket(group: SocketAddr) -> Result<std::net::UdpSocket, EndpointError> {
    let bind_err = |source| EndpointError::Bind {
        addr: group.to_string(),
        source,
    };

    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    match group.ip() {
        IpAddr::V4(ip) if ip.is_multicast() => {
            socket.set_multicast_ttl_v4(1).map_err(bind_err)?;
            socket.set_multicast_loop_v4(true).map_err(bind_err)?;
        }
        IpAddr::V6(ip) if ip.is_multicast() => {
            socket.set_multicast_hops_v6(1).map_err(bind_err)?;
            socket.set_multicast_loop_v6(true).map_err(bind_err)?;
        }
        _ => {}
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket
        .bind(&unspecified(group, 0).into())
        .map_err(bind_err)?;

    Ok(socket.into())
}

/// Socket receiving whatever is sent to `group`. A multicast group is
/// joined on the default interface; a unicast address is bound directly.
pub fn discovery_socket(group: SocketAddr) -> Result<std::net::UdpSocket, EndpointError> {
    let bind_err = |source| EndpointError::Bind {
        addr: group.to_string(),
        source,
    };

    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    match group.ip() {
        IpAddr::V4(ip) if ip.is_multicast() => {
            socket
                .bind(&unspecified(group, group.port()).into())
                .map_err(bind_err)?;
            socket
                .join_multicast_v4(&ip, &Ipv4Addr::UNSPECIFIED)
                .map_err(bind_err)?;
        }
        IpAddr::V6(ip) if ip.is_multicast() => {
            socket
                .bind(&unspecified(group, group.port()).into())
                .map_err(bind_err)?;
            socket.join_multicast_v6(&ip, 0).map_err(bind_err)?;
        }
        _ => socket.bind(&group.into()).map_err(bind_err)?,
    }

    Ok(socket.into())
}

/// A std socket that a tokio runtime can take over.
pub trait Adopt: Send + 'static {
    type Async: Send + 'static;

    fn adopt(self) -> std::io::Result<Self::Async>;
}

impl Adopt for std::net::UdpSocket {
    type Async = UdpSocket;

    fn adopt(self) -> std::io::Result<UdpSocket> {
        UdpSocket::from_std(self)
    }
}

impl Adopt for std::net::TcpListener {
    type Async = TcpListener;

    fn adopt(self) -> std::io::Result<TcpListener> {
        TcpListener::from_std(self)
    }
}

/// A std socket waiting to be adopted by a worker runtime.
pub struct LoopSocket<S: Adopt = std::net::UdpSocket> {
    pending: Option<S>,
    ready: Option<S::Async>,
}

impl<S: Adopt> LoopSocket<S> {
    pub fn new(socket: S) -> Self {
        Self {
            pending: Some(socket),
            ready: None,
        }
    }

    /// Register the socket with the current runtime. Call from `on_start`.
    pub fn activate(&mut self) -> anyhow::Result<()> {
        if let Some(std_socket) = self.pending.take() {
            self.ready = Some(std_socket.adopt().context("adopt socket")?);
        }
        Ok(())
    }

    pub fn get(&self) -> anyhow::Result<&S::Async> {
        self.ready.as_ref().context("socket used before worker start")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use socket2::SockRef;

    #[test]
    fn bind_reports_ephemeral_port() {
        let socket = bind_udp("127.0.0.1:0", Some(64 * 1024)).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn requested_buffer_sizes_are_applied() {
        let n = 64 * 1024;

        let udp = bind_udp("127.0.0.1:0", Some(n)).unwrap();
        let udp = SockRef::from(&udp);
        assert!(udp.recv_buffer_size().unwrap() >= n);
        assert!(udp.send_buffer_size().unwrap() >= n);

        let tcp = bind_tcp("127.0.0.1:0", Some(n)).unwrap();
        assert_ne!(tcp.local_addr().unwrap().port(), 0);
        let tcp = SockRef::from(&tcp);
        assert!(tcp.recv_buffer_size().unwrap() >= n);
        assert!(tcp.send_buffer_size().unwrap() >= n);
    }

    #[test]
    fn accepted_streams_inherit_listener_buffers() {
        let n = 96 * 1024;
        let listener = bind_tcp("127.0.0.1:0", Some(n)).unwrap();
        listener.set_nonblocking(false).unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        assert!(SockRef::from(&accepted).recv_buffer_size().unwrap() >= n);
    }

    #[test]
    fn connect_targets_remote() {
        let server = bind_udp("127.0.0.1:0", None).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = connect_udp(&server_addr.to_string()).unwrap();
        assert_eq!(client.peer_addr().unwrap(), server_addr);
    }

    #[test]
    fn announcements_reach_a_unicast_discovery_socket() {
        let listener = discovery_socket(resolve("127.0.0.1:0").unwrap()).unwrap();
        let target = listener.local_addr().unwrap();
        assert_ne!(target.port(), 0);

        let sender = announce_socket(target).unwrap();
        sender.send_to(b"hello", target).unwrap();

        listener.set_nonblocking(false).unwrap();
        listener
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = listener.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
    }

    #[test]
    fn unresolvable_address_is_an_error() {
        assert!(matches!(
            resolve("definitely not an address"),
            Err(EndpointError::Resolve(_))
        ));
    }
}
