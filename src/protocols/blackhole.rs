use crate::destination::Destination;
use crate::error::{ProxyError, Result};
use crate::outbound::{DatagramConn, OutboundHandler};
use crate::relay::BoxedStream;
use async_trait::async_trait;
use std::sync::Arc;

/// Outbound that drops everything it is given
pub struct BlackholeProtocol;

impl BlackholeProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BlackholeProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundHandler for BlackholeProtocol {
    fn name(&self) -> &str {
        "blackhole"
    }

    async fn connect_stream(&self, destination: &Destination) -> Result<BoxedStream> {
        Err(ProxyError::ConnectionFailed(format!("Blackhole outbound - {} dropped", destination)))
    }

    async fn open_datagram(&self, destination: &Destination) -> Result<Arc<dyn DatagramConn>> {
        Err(ProxyError::ConnectionFailed(format!("Blackhole outbound - {} dropped", destination)))
    }
}
