use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use socket2::{Domain, Protocol, Socket, Type};
use crate::error::Result;
use log::{debug, warn};

fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// Apply Linux SO_MARK to a socket before it is connected
pub fn apply_so_mark(socket: &Socket, mark: u32) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        platform::apply_so_mark(socket, mark)?;
        debug!("Applied SO_MARK: {}", mark);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = socket;
        warn!("SO_MARK {} not supported on this platform", mark);
    }
    Ok(())
}

/// Connect a TCP stream whose socket carries `mark`
pub async fn connect_marked_tcp(target_addr: SocketAddr, mark: u32) -> Result<TcpStream> {
    let socket = Socket::new(domain_for(&target_addr), Type::STREAM, Some(Protocol::TCP))?;
    apply_so_mark(&socket, mark)?;
    socket.set_nonblocking(true)?;

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpSocket::from_std_stream(std_stream).connect(target_addr).await?;

    debug!("Created marked TCP stream to {}", target_addr);
    Ok(stream)
}

/// Bind an unconnected UDP socket of the family of `target_addr`,
/// optionally carrying `mark`
pub fn bind_udp_for(target_addr: SocketAddr, mark: Option<u32>) -> Result<UdpSocket> {
    let domain = domain_for(&target_addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(mark) = mark {
        apply_so_mark(&socket, mark)?;
    }
    let local: SocketAddr = match target_addr {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;

    pub fn apply_so_mark(socket: &Socket, mark: u32) -> Result<()> {
        socket.set_mark(mark).map_err(|e| {
            warn!("Failed to set SO_MARK {}: {}", mark, e);
            e
        })?;
        Ok(())
    }
}
