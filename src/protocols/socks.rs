//! SOCKS5 inbound (RFC 1928 CONNECT, RFC 1929 username/password).

use crate::destination::{Address, Destination};
use crate::dispatcher::PacketDispatcher;
use crate::error::{ProxyError, Result};
use crate::inbound::InboundHandler;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_PASSWORD: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    NoAuth,
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksSettings {
    pub auth: AuthMethod,
    pub accounts: Vec<Account>,
}

impl SocksSettings {
    fn validate(&self) -> Result<()> {
        if self.auth == AuthMethod::Password && self.accounts.is_empty() {
            return Err(ProxyError::Config("socks password auth needs at least one account".to_string()));
        }
        Ok(())
    }

    fn method(&self) -> u8 {
        match self.auth {
            AuthMethod::NoAuth => METHOD_NO_AUTH,
            AuthMethod::Password => METHOD_PASSWORD,
        }
    }

    fn accepts(&self, user: &str, pass: &str) -> bool {
        self.accounts.iter().any(|a| a.user == user && a.pass == pass)
    }
}

pub struct SocksInbound {
    settings: Arc<SocksSettings>,
    dispatcher: Arc<dyn PacketDispatcher>,
    shutdown: CancellationToken,
}

impl SocksInbound {
    pub fn new(settings: SocksSettings, dispatcher: Arc<dyn PacketDispatcher>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings: Arc::new(settings),
            dispatcher,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn from_settings(settings: Option<&Value>, dispatcher: Arc<dyn PacketDispatcher>) -> Result<Self> {
        Self::new(super::parse_settings("socks", settings)?, dispatcher)
    }
}

#[async_trait]
impl InboundHandler for SocksInbound {
    fn name(&self) -> &str {
        "socks"
    }

    async fn listen(&self, bind_addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("SOCKS5 inbound listening on {}", local_addr);

        let settings = self.settings.clone();
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, client_addr)) => {
                        debug!("New connection from {}", client_addr);
                        let settings = settings.clone();
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, client_addr, &settings, dispatcher).await {
                                warn!("Error handling connection from {}: {}", client_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            info!("SOCKS5 inbound on {} stopped accepting", local_addr);
        });

        Ok(local_addr)
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    settings: &SocksSettings,
    dispatcher: Arc<dyn PacketDispatcher>,
) -> Result<()> {
    negotiate(&mut stream, settings).await?;
    debug!("SOCKS5 handshake completed for {}", client_addr);

    let (address, port) = match read_request(&mut stream).await {
        Ok(target) => target,
        Err(e) => {
            let status = reply_code(&e);
            let reply = encode_reply(status, &Address::V4(Ipv4Addr::UNSPECIFIED), 0);
            if let Err(write_err) = stream.write_all(&reply).await {
                debug!("Failed to send reply {:#04x} to {}: {}", status, client_addr, write_err);
            }
            return Err(e);
        }
    };
    let destination = Destination::tcp(address.clone(), port);

    let link = match dispatcher.establish(destination).await {
        Ok(link) => link,
        Err(e) => {
            let status = reply_code(&e);
            if let Err(write_err) = stream.write_all(&encode_reply(status, &address, port)).await {
                debug!("Failed to send reply {:#04x} to {}: {}", status, client_addr, write_err);
            }
            return Err(e);
        }
    };
    stream.write_all(&encode_reply(REP_SUCCEEDED, &address, port)).await?;

    let session = link.relay(Box::new(stream));
    let stats = session.finished().await;
    debug!(
        "Connection from {} completed (up {} bytes, down {} bytes)",
        client_addr, stats.uplink, stats.downlink
    );
    Ok(())
}

/// Method selection plus, when configured, the username/password subnegotiation.
pub async fn negotiate<S>(stream: &mut S, settings: &SocksSettings) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!("Unsupported SOCKS version: {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let wanted = settings.method();
    if !methods.contains(&wanted) {
        stream.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(ProxyError::AuthFailed);
    }
    stream.write_all(&[SOCKS_VERSION, wanted]).await?;

    if wanted == METHOD_PASSWORD {
        let (user, pass) = read_credentials(stream).await?;
        if !settings.accepts(&user, &pass) {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            return Err(ProxyError::AuthFailed);
        }
        stream.write_all(&[AUTH_VERSION, 0x00]).await?;
    }
    Ok(())
}

async fn read_credentials<S>(stream: &mut S) -> Result<(String, String)>
where
    S: AsyncRead + Unpin,
{
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(ProxyError::Protocol(format!("Unsupported auth version: {}", version)));
    }
    let user = read_short_string(stream).await?;
    let pass = read_short_string(stream).await?;
    Ok((user, pass))
}

async fn read_short_string<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await?;
    String::from_utf8(raw).map_err(|_| ProxyError::Protocol("Invalid UTF-8 string".to_string()))
}

/// Reads a complete request and returns the CONNECT target.
pub async fn read_request<S>(stream: &mut S) -> Result<(Address, u16)>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!("Unsupported SOCKS version: {}", head[0])));
    }
    let command = head[1];

    let address = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Address::V4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let domain = read_short_string(stream).await?;
            Address::Domain(domain)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Address::V6(Ipv6Addr::from(octets))
        }
        other => return Err(ProxyError::InvalidAddressType(other)),
    };
    let port = stream.read_u16().await?;

    if command != CMD_CONNECT {
        return Err(ProxyError::UnsupportedCommand(command));
    }
    Ok((address, port))
}

pub fn encode_reply(status: u8, address: &Address, port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(262);

    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(status);
    buf.put_u8(0x00);

    match address {
        Address::V4(ip) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Address::V6(ip) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
        Address::Domain(domain) => {
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(domain.len() as u8);
            buf.put_slice(domain.as_bytes());
        }
    }
    buf.put_u16(port);

    buf.freeze()
}

/// Maps a dispatch failure onto the SOCKS reply field.
pub fn reply_code(error: &ProxyError) -> u8 {
    match error {
        ProxyError::ConnectionRefused(_) => REP_CONNECTION_REFUSED,
        ProxyError::ConnectionFailed(_) | ProxyError::DnsResolution(_) => REP_HOST_UNREACHABLE,
        ProxyError::UnsupportedCommand(_) => REP_COMMAND_NOT_SUPPORTED,
        ProxyError::InvalidAddressType(_) => REP_ADDRESS_NOT_SUPPORTED,
        _ => REP_GENERAL_FAILURE,
    }
}
