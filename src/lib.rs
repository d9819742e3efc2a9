pub mod buffer;
pub mod config;
pub mod destination;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod point;
pub mod protocols;
pub mod registry;
pub mod relay;
pub mod traffic_mark;

pub use buffer::{Buffer, BufferPool, PoolStats};
pub use config::{Config, ConnectionConfig, PointConfig};
pub use destination::{Address, Destination, Network, Packet};
pub use dispatcher::{DefaultDispatcher, DispatcherOptions, DispatcherStats, OutboundLink, PacketDispatcher};
pub use error::{ProxyError, Result};
pub use inbound::{InboundHandler, PacketSink};
pub use outbound::{DatagramConn, OutboundHandler};
pub use point::Point;
pub use protocols::{BlackholeProtocol, FreedomProtocol, SocksInbound};
pub use registry::{register_inbound, register_outbound, Services};
pub use relay::{BoxedStream, ProxyStream, RelayStats, SessionHandle};
