use crate::buffer::BufferPool;
use crate::config::PointConfig;
use crate::dispatcher::{DefaultDispatcher, PacketDispatcher};
use crate::error::Result;
use crate::inbound::InboundHandler;
use crate::registry::{self, Services};
use log::info;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// One listening port with its inbound handler, dispatcher and outbound
/// handler. Everything is wired in [`Point::new`]; unknown protocol names or
/// malformed settings fail there, before any socket is opened.
pub struct Point {
    config: PointConfig,
    inbound: Arc<dyn InboundHandler>,
    dispatcher: Arc<DefaultDispatcher>,
    buffer_pool: Arc<BufferPool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Point {
    pub fn new(config: PointConfig) -> Result<Self> {
        config.validate()?;
        let inbound_factory = registry::inbound_factory(&config.inbound.protocol)?;
        let outbound_factory = registry::outbound_factory(&config.outbound.protocol)?;

        let buffer_pool = Arc::new(BufferPool::new(config.buffer.size, config.buffer.pooled));
        let outbound = outbound_factory(config.outbound.settings.as_ref())?;
        let dispatcher = Arc::new(DefaultDispatcher::new(
            outbound,
            buffer_pool.clone(),
            config.session.dispatcher_options(),
        ));

        let services = Services {
            dispatcher: dispatcher.clone(),
            buffer_pool: buffer_pool.clone(),
        };
        let inbound = inbound_factory(config.inbound.settings.as_ref(), services)?;

        Ok(Self {
            config,
            inbound,
            dispatcher,
            buffer_pool,
            local_addr: Mutex::new(None),
        })
    }

    /// Binds the configured port and starts accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self.inbound.listen(self.config.bind_addr()).await?;
        *self.local_addr.lock().unwrap_or_else(|p| p.into_inner()) = Some(addr);
        info!(
            "Point started on {} ({} -> {})",
            addr,
            self.inbound.name(),
            self.dispatcher.outbound_name()
        );
        Ok(addr)
    }

    /// Stops accepting, then signals live sessions to finish.
    pub fn close(&self) {
        self.inbound.close();
        self.dispatcher.close();
        info!("Point on {:?} closed", self.local_addr());
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn dispatcher(&self) -> Arc<dyn PacketDispatcher> {
        self.dispatcher.clone()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn config(&self) -> &PointConfig {
        &self.config
    }
}
