use crate::destination::Destination;
use crate::dns::DnsResolver;
use crate::error::{ProxyError, Result};
use crate::outbound::{DatagramConn, OutboundHandler};
use crate::relay::BoxedStream;
use crate::traffic_mark::{bind_udp_for, connect_marked_tcp};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FreedomSettings {
    /// Deadline for one TCP connect; unset leaves only the dispatcher deadline
    pub connect_timeout_secs: Option<u64>,
    /// Linux SO_MARK for outgoing sockets (unset to disable)
    pub so_mark: Option<u32>,
}

impl FreedomSettings {
    fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == Some(0) {
            return Err(ProxyError::Config("freedom connect_timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }

    fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

/// Direct outbound: connects straight to the destination
pub struct FreedomProtocol {
    settings: FreedomSettings,
    resolver: DnsResolver,
}

impl FreedomProtocol {
    pub fn new(settings: FreedomSettings) -> Self {
        Self { settings, resolver: DnsResolver::new() }
    }

    pub fn from_settings(settings: Option<&Value>) -> Result<Self> {
        let settings: FreedomSettings = super::parse_settings("freedom", settings)?;
        settings.validate()?;
        Ok(Self::new(settings))
    }
}

fn connect_error(e: io::Error) -> ProxyError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ProxyError::ConnectionRefused(e.to_string()),
        _ => ProxyError::ConnectionFailed(e.to_string()),
    }
}

/// Runs `connect` under `limit` when one is set.
async fn connect_within<T, F>(limit: Option<Duration>, connect: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| ProxyError::ConnectionFailed("Connection timeout".to_string()))?,
        None => connect.await,
    }
}

#[async_trait]
impl OutboundHandler for FreedomProtocol {
    fn name(&self) -> &str {
        "freedom"
    }

    async fn connect_stream(&self, destination: &Destination) -> Result<BoxedStream> {
        let target = destination.resolve(&self.resolver).await?;
        let connect = async {
            match self.settings.so_mark {
                Some(mark) => connect_marked_tcp(target, mark).await.map_err(|e| match e {
                    ProxyError::Io(e) => connect_error(e),
                    other => other,
                }),
                None => TcpStream::connect(target).await.map_err(connect_error),
            }
        };
        let stream = connect_within(self.settings.connect_timeout(), connect).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY on {} failed: {}", target, e);
        }
        debug!("Freedom connected {} ({})", destination, target);
        Ok(Box::new(stream))
    }

    async fn open_datagram(&self, destination: &Destination) -> Result<Arc<dyn DatagramConn>> {
        let target = destination.resolve(&self.resolver).await?;
        let socket = bind_udp_for(target, self.settings.so_mark)?;
        socket.connect(target).await.map_err(connect_error)?;
        debug!("Freedom UDP socket {:?} -> {}", socket.local_addr().ok(), target);
        Ok(Arc::new(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    #[test]
    fn test_settings_parsing() {
        let settings = serde_json::json!({ "so_mark": 255 });
        let freedom = FreedomProtocol::from_settings(Some(&settings)).unwrap();
        assert_eq!(freedom.settings.so_mark, Some(255));

        let bad = serde_json::json!({ "so_mark": "high" });
        assert!(matches!(FreedomProtocol::from_settings(Some(&bad)), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_connect_timeout_setting() {
        let settings = serde_json::json!({ "connect_timeout_secs": 3 });
        let freedom = FreedomProtocol::from_settings(Some(&settings)).unwrap();
        assert_eq!(freedom.settings.connect_timeout(), Some(Duration::from_secs(3)));

        let unset = FreedomProtocol::from_settings(None).unwrap();
        assert_eq!(unset.settings.connect_timeout(), None);

        let zero = serde_json::json!({ "connect_timeout_secs": 0 });
        assert!(matches!(FreedomProtocol::from_settings(Some(&zero)), Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_within_deadline() {
        let stalled = connect_within::<(), _>(Some(Duration::from_millis(20)), std::future::pending()).await;
        assert!(matches!(stalled, Err(ProxyError::ConnectionFailed(ref msg)) if msg == "Connection timeout"));

        let quick = connect_within(Some(Duration::from_secs(1)), async { Ok(7u8) }).await;
        assert_eq!(quick.unwrap(), 7);

        let unbounded = connect_within(None, async { Ok::<_, ProxyError>("done") }).await;
        assert_eq!(unbounded.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_connect_stream_with_timeout_configured() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let freedom = FreedomProtocol::new(FreedomSettings {
            connect_timeout_secs: Some(2),
            so_mark: None,
        });
        let dest = Destination::from_socket_addr(crate::destination::Network::Tcp, addr);
        assert!(freedom.connect_stream(&dest).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"hello").await.unwrap();
        });

        let freedom = FreedomProtocol::new(FreedomSettings::default());
        let dest = Destination::from_socket_addr(crate::destination::Network::Tcp, addr);
        let mut stream = freedom.connect_stream(&dest).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let freedom = FreedomProtocol::new(FreedomSettings::default());
        let dest = Destination::from_socket_addr(crate::destination::Network::Tcp, addr);
        let result = freedom.connect_stream(&dest).await;
        assert!(matches!(result, Err(ProxyError::ConnectionRefused(_))));
    }

    #[tokio::test]
    async fn test_open_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let freedom = FreedomProtocol::new(FreedomSettings::default());
        let dest = Destination::from_socket_addr(crate::destination::Network::Udp, addr);
        let conn = freedom.open_datagram(&dest).await.unwrap();
        conn.send(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.send_to(b"pong", peer).await.unwrap();

        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
