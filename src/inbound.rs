use crate::destination::{Destination, Packet};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use log::warn;
use std::net::SocketAddr;

/// Client-facing side of a Point: terminates one wire protocol and hands the
/// carried traffic to the dispatcher.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Registered protocol name
    fn name(&self) -> &str;

    /// Binds `bind_addr` and starts accepting in the background. Returns the
    /// bound address once the listener is up.
    async fn listen(&self, bind_addr: SocketAddr) -> Result<SocketAddr>;

    /// Stops accepting new connections. Sessions already dispatched are left
    /// to the dispatcher.
    fn close(&self);
}

/// Return channel for response datagrams.
///
/// Whoever calls `dispatch` with a packet passes its sink along; the
/// dispatcher delivers every response from that destination through
/// `communicate`, handing over ownership of the payload buffer.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn communicate(&self, packet: Packet) -> Result<()>;

    /// Called when traffic to `destination` could not be delivered.
    fn report_error(&self, destination: &Destination, error: &ProxyError) {
        warn!("Datagram to {} failed: {}", destination, error);
    }
}
