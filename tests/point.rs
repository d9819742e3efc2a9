use async_trait::async_trait;
use relaypoint::{
    register_inbound, Address, BufferPool, ConnectionConfig, Destination, InboundHandler, Network, Packet,
    PacketDispatcher, PacketSink, Point, PointConfig, ProxyError, Result, Services,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

const DATA: &str = "Data to be sent to remote";

/// TCP server that reads until EOF and answers with `prefix` + request.
async fn start_tcp_server(prefix: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                conn.read_to_end(&mut request).await.unwrap();
                let mut response = prefix.as_bytes().to_vec();
                response.extend_from_slice(&request);
                conn.write_all(&response).await.unwrap();
                conn.shutdown().await.unwrap();
            });
        }
    });
    addr
}

async fn start_udp_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => return,
            };
            let mut response = b"Processed: ".to_vec();
            response.extend_from_slice(&buf[..n]);
            socket.send_to(&response, peer).await.unwrap();
        }
    });
    addr
}

fn socks_point_config() -> PointConfig {
    PointConfig::new(
        0,
        ConnectionConfig::new("socks", Some(serde_json::json!({ "auth": "noauth" }))),
        ConnectionConfig::new("freedom", None),
    )
}

/// Performs the SOCKS5 handshake and CONNECT; returns the stream and reply code.
async fn socks_connect(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let ip = match target.ip() {
        std::net::IpAddr::V4(ip) => ip,
        std::net::IpAddr::V6(_) => panic!("ipv4 only"),
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply[1])
}

async fn wait_until_idle(point: &Point) {
    let dispatcher = point.dispatcher();
    timeout(Duration::from_secs(5), async {
        while dispatcher.stats().tcp_sessions != 0 || point.buffer_pool().stats().outstanding() != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions did not drain");
}

#[tokio::test]
async fn test_socks_tcp_connect() {
    let server = start_tcp_server("Processed: ").await;
    let point = Point::new(socks_point_config()).unwrap();
    let proxy = point.start().await.unwrap();

    let (mut conn, status) = socks_connect(proxy, server).await;
    assert_eq!(status, 0x00);

    conn.write_all(DATA.as_bytes()).await.unwrap();
    // Half-close: the remote only answers after seeing EOF.
    conn.shutdown().await.unwrap();

    let mut returned = Vec::new();
    timeout(Duration::from_secs(5), conn.read_to_end(&mut returned))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(returned, b"Processed: Data to be sent to remote");

    wait_until_idle(&point).await;
    point.close();
}

struct MockInbound {
    dispatcher: Arc<dyn PacketDispatcher>,
    pool: Arc<BufferPool>,
    output: Mutex<Vec<u8>>,
    errors: Mutex<Vec<String>>,
    notify: Notify,
}

impl MockInbound {
    fn communicate_out(self: &Arc<Self>, packet: Packet) {
        self.dispatcher.dispatch(packet, self.clone());
    }
}

#[async_trait]
impl InboundHandler for MockInbound {
    fn name(&self) -> &str {
        "mock_ich"
    }

    async fn listen(&self, bind_addr: SocketAddr) -> Result<SocketAddr> {
        Ok(bind_addr)
    }

    fn close(&self) {}
}

#[async_trait]
impl PacketSink for MockInbound {
    async fn communicate(&self, packet: Packet) -> Result<()> {
        let (_, payload) = packet.into_parts();
        self.output.lock().unwrap().extend_from_slice(&payload);
        self.pool.release(payload);
        self.notify.notify_one();
        Ok(())
    }

    fn report_error(&self, _destination: &Destination, error: &ProxyError) {
        self.errors.lock().unwrap().push(error.to_string());
        self.notify.notify_one();
    }
}

fn register_mock(name: &str) -> Arc<Mutex<Option<Arc<MockInbound>>>> {
    let slot: Arc<Mutex<Option<Arc<MockInbound>>>> = Arc::new(Mutex::new(None));
    let captured = slot.clone();
    register_inbound(name, move |_settings, services: Services| {
        let ich = Arc::new(MockInbound {
            dispatcher: services.dispatcher,
            pool: services.buffer_pool,
            output: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        *captured.lock().unwrap() = Some(ich.clone());
        Ok(ich as Arc<dyn InboundHandler>)
    })
    .unwrap();
    slot
}

#[tokio::test]
async fn test_udp_send() {
    let server = start_udp_server().await;
    let slot = register_mock("mock_udp_ich");

    let config = PointConfig::new(
        0,
        ConnectionConfig::new("mock_udp_ich", None),
        ConnectionConfig::new("freedom", None),
    );
    let point = Point::new(config).unwrap();
    point.start().await.unwrap();
    let ich = slot.lock().unwrap().clone().unwrap();

    let mut payload = point.buffer_pool().acquire();
    payload.append(DATA.as_bytes());
    let notified = ich.notify.notified();
    ich.communicate_out(Packet::new(Destination::from_socket_addr(Network::Udp, server), payload, false));
    timeout(Duration::from_secs(5), notified).await.unwrap();

    assert_eq!(*ich.output.lock().unwrap(), b"Processed: Data to be sent to remote".to_vec());
    assert_eq!(point.dispatcher().stats().udp_sessions, 1);

    // A second datagram reuses the same outbound socket.
    let mut payload = point.buffer_pool().acquire();
    payload.append(b"again");
    let notified = ich.notify.notified();
    ich.communicate_out(Packet::new(Destination::from_socket_addr(Network::Udp, server), payload, false));
    timeout(Duration::from_secs(5), notified).await.unwrap();
    assert_eq!(point.dispatcher().stats().udp_sessions, 1);
    assert!(ich.output.lock().unwrap().ends_with(b"Processed: again"));

    point.close();
}

#[tokio::test]
async fn test_unreachable_destination() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let point = Point::new(socks_point_config()).unwrap();
    let proxy = point.start().await.unwrap();

    let (mut conn, status) = socks_connect(proxy, closed).await;
    assert_eq!(status, 0x05);
    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    wait_until_idle(&point).await;
    assert_eq!(point.buffer_pool().stats().outstanding(), 0);
    point.close();
}

#[tokio::test]
async fn test_sessions_do_not_cross_talk() {
    let server_a = start_tcp_server("A:").await;
    let server_b = start_tcp_server("B:").await;

    let mut config = socks_point_config();
    // Small buffers force many reuses through the pool.
    config.buffer.size = 256;
    config.buffer.pooled = 4;
    let point = Point::new(config).unwrap();
    let proxy = point.start().await.unwrap();

    let run = |target: SocketAddr, fill: u8, prefix: &'static [u8]| async move {
        let (mut conn, status) = socks_connect(proxy, target).await;
        assert_eq!(status, 0x00);
        let payload = vec![fill; 64 * 1024];
        conn.write_all(&payload).await.unwrap();
        conn.shutdown().await.unwrap();

        let mut returned = Vec::new();
        conn.read_to_end(&mut returned).await.unwrap();
        assert_eq!(&returned[..prefix.len()], prefix);
        assert_eq!(returned.len(), prefix.len() + payload.len());
        assert!(returned[prefix.len()..].iter().all(|b| *b == fill));
    };

    tokio::join!(run(server_a, b'a', b"A:"), run(server_b, b'b', b"B:"));

    wait_until_idle(&point).await;
    assert!(point.buffer_pool().stats().reuses > 0);
    point.close();
}

#[tokio::test]
async fn test_close_stops_accepting() {
    let point = Point::new(socks_point_config()).unwrap();
    let proxy = point.start().await.unwrap();
    point.close();

    let refused = timeout(Duration::from_secs(5), async {
        loop {
            if TcpStream::connect(proxy).await.is_err() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(refused.is_ok());

    let dest = Destination::tcp(Address::V4(Ipv4Addr::LOCALHOST), proxy.port());
    assert!(matches!(point.dispatcher().establish(dest).await, Err(ProxyError::Closed)));
}

#[tokio::test]
async fn test_registry_uniqueness() {
    let first = register_mock("mock_unique_ich");
    let second = register_inbound("mock_unique_ich", |_settings, _services| {
        Err(ProxyError::Config("second factory must never run".to_string()))
    });
    assert!(matches!(second, Err(ProxyError::DuplicateProtocol(_))));

    let config = PointConfig::new(
        0,
        ConnectionConfig::new("mock_unique_ich", None),
        ConnectionConfig::new("freedom", None),
    );
    assert!(Point::new(config).is_ok());
    assert!(first.lock().unwrap().is_some());
}
