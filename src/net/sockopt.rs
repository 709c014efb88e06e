//! Socket construction and options.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};

use crate::manager::NetBuffers;

fn set_buffers(socket: &SockRef<'_>, recv: usize, send: usize) {
    if recv > 0 {
        if let Err(e) = socket.set_recv_buffer_size(recv) {
            tracing::warn!(size = recv, error = %e, "Failed to set receive buffer size");
        }
    }
    if send > 0 {
        if let Err(e) = socket.set_send_buffer_size(send) {
            tracing::warn!(size = send, error = %e, "Failed to set send buffer size");
        }
    }
}

fn new_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    Ok(socket)
}

/// Bound, listening, non-blocking TCP socket.
pub(crate) fn tcp_listener(
    addr: SocketAddr,
    backlog: i32,
    buffers: &NetBuffers,
) -> io::Result<std::net::TcpListener> {
    let socket = new_socket(addr, Type::STREAM, Protocol::TCP)?;
    set_buffers(&SockRef::from(&socket), buffers.recv_tcp, buffers.send_tcp);
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Bound, non-blocking UDP socket.
pub(crate) fn udp_socket(addr: SocketAddr, buffers: &NetBuffers) -> io::Result<std::net::UdpSocket> {
    let socket = new_socket(addr, Type::DGRAM, Protocol::UDP)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    set_buffers(&SockRef::from(&socket), buffers.recv_udp, buffers.send_udp);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Unbound TCP socket ready to connect to `peer` from `local`.
pub(crate) fn tcp_client(
    local: SocketAddr,
    peer: SocketAddr,
    buffers: &NetBuffers,
) -> io::Result<TcpSocket> {
    let socket = if peer.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if buffers.recv_tcp > 0 {
        socket.set_recv_buffer_size(u32::try_from(buffers.recv_tcp).unwrap_or(u32::MAX))?;
    }
    if buffers.send_tcp > 0 {
        socket.set_send_buffer_size(u32::try_from(buffers.send_tcp).unwrap_or(u32::MAX))?;
    }
    if !local.ip().is_unspecified() || local.port() != 0 {
        socket.set_reuseaddr(true)?;
        socket.bind(local)?;
    }
    Ok(socket)
}

/// `local`, or the wildcard address of `peer`'s family when `local` is a
/// wildcard of the other one.
pub(crate) fn local_for(local: SocketAddr, peer: SocketAddr) -> SocketAddr {
    if local.ip().is_unspecified() && local.is_ipv4() != peer.is_ipv4() {
        let ip = if peer.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, local.port())
    } else {
        local
    }
}

pub(crate) fn apply_stream_buffers(stream: &TcpStream, buffers: &NetBuffers) {
    set_buffers(&SockRef::from(stream), buffers.recv_tcp, buffers.send_tcp);
}

/// Make the next close send RST instead of FIN.
pub(crate) fn reset_on_close(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_linger(Some(Duration::ZERO))
}

/// Bind a throwaway socket of type `ty` to `addr` to see if it is usable.
pub(crate) fn probe(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<()> {
    let socket = new_socket(addr, ty, protocol)?;
    socket.bind(&addr.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_for_matches_peer_family() {
        let any4: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let peer6: SocketAddr = "[::1]:53".parse().unwrap();
        assert_eq!(local_for(any4, peer6), "[::]:0".parse::<SocketAddr>().unwrap());

        let bound: SocketAddr = "127.0.0.1:5300".parse().unwrap();
        assert_eq!(local_for(bound, "127.0.0.1:53".parse().unwrap()), bound);
    }

    #[test]
    fn listener_binds_ephemeral_port() {
        let listener =
            tcp_listener("127.0.0.1:0".parse().unwrap(), 16, &NetBuffers::default()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
