use crate::destination::Destination;
use crate::error::Result;
use crate::relay::BoxedStream;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// A datagram socket bound to a single remote peer.
#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn send(&self, payload: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Connected `UdpSocket`s only exchange datagrams with their peer.
#[async_trait]
impl DatagramConn for UdpSocket {
    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, payload).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

/// Outbound side of a Point: reaches the real destination.
///
/// Implementations only establish transports. The dispatcher owns the relay
/// loops, buffers and session bookkeeping on top of what they return.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    /// Registered protocol name
    fn name(&self) -> &str;

    /// Opens a stream to a TCP destination.
    async fn connect_stream(&self, destination: &Destination) -> Result<BoxedStream>;

    /// Opens a datagram socket to a UDP destination.
    async fn open_datagram(&self, destination: &Destination) -> Result<Arc<dyn DatagramConn>>;
}
