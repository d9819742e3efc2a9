//! Process-wide protocol registry.
//!
//! Maps protocol names to the factories that build inbound and outbound
//! handlers. Every name can be registered once; the built-in protocols
//! (`socks`, `freedom`, `blackhole`) are registered on first access. Points
//! look their factories up once at construction and never touch the registry
//! afterwards.

use crate::buffer::BufferPool;
use crate::dispatcher::PacketDispatcher;
use crate::error::{ProxyError, Result};
use crate::inbound::InboundHandler;
use crate::outbound::OutboundHandler;
use crate::protocols::{BlackholeProtocol, FreedomProtocol, SocksInbound};
use lazy_static::lazy_static;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Once, RwLock};

/// Shared application services handed to inbound factories.
#[derive(Clone)]
pub struct Services {
    pub dispatcher: Arc<dyn PacketDispatcher>,
    pub buffer_pool: Arc<BufferPool>,
}

pub type InboundFactory =
    Arc<dyn Fn(Option<&Value>, Services) -> Result<Arc<dyn InboundHandler>> + Send + Sync>;

/// Outbounds only establish transports; buffers stay with the dispatcher.
pub type OutboundFactory = Arc<dyn Fn(Option<&Value>) -> Result<Arc<dyn OutboundHandler>> + Send + Sync>;

/// Name-keyed, write-once-per-name factory table.
pub struct Registry<F> {
    kind: &'static str,
    factories: RwLock<HashMap<String, F>>,
}

impl<F: Clone> Registry<F> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Fails with `DuplicateProtocol` when `name` is taken; the existing
    /// factory stays in place.
    pub fn register(&self, name: &str, factory: F) -> Result<()> {
        let mut factories = self.factories.write().unwrap_or_else(|p| p.into_inner());
        if factories.contains_key(name) {
            return Err(ProxyError::DuplicateProtocol(name.to_string()));
        }
        factories.insert(name.to_string(), factory);
        debug!("Registered {} protocol {}", self.kind, name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<F> {
        self.factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownProtocol(format!("{} {}", self.kind, name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().unwrap_or_else(|p| p.into_inner()).contains_key(name)
    }
}

lazy_static! {
    static ref INBOUNDS: Registry<InboundFactory> = Registry::new("inbound");
    static ref OUTBOUNDS: Registry<OutboundFactory> = Registry::new("outbound");
}

static BUILTINS: Once = Once::new();

fn ensure_builtins() {
    BUILTINS.call_once(|| {
        let socks: InboundFactory = Arc::new(|settings: Option<&Value>, services: Services| {
            let inbound = SocksInbound::from_settings(settings, services.dispatcher)?;
            Ok(Arc::new(inbound) as Arc<dyn InboundHandler>)
        });
        let freedom: OutboundFactory = Arc::new(|settings: Option<&Value>| {
            Ok(Arc::new(FreedomProtocol::from_settings(settings)?) as Arc<dyn OutboundHandler>)
        });
        let blackhole: OutboundFactory =
            Arc::new(|_settings: Option<&Value>| Ok(Arc::new(BlackholeProtocol::new()) as Arc<dyn OutboundHandler>));

        // Fresh tables at this point, so these cannot collide.
        let _ = INBOUNDS.register("socks", socks);
        let _ = OUTBOUNDS.register("freedom", freedom);
        let _ = OUTBOUNDS.register("blackhole", blackhole);
    });
}

/// Registers an inbound protocol under `name`.
pub fn register_inbound<F>(name: &str, factory: F) -> Result<()>
where
    F: Fn(Option<&Value>, Services) -> Result<Arc<dyn InboundHandler>> + Send + Sync + 'static,
{
    ensure_builtins();
    INBOUNDS.register(name, Arc::new(factory))
}

/// Registers an outbound protocol under `name`.
pub fn register_outbound<F>(name: &str, factory: F) -> Result<()>
where
    F: Fn(Option<&Value>) -> Result<Arc<dyn OutboundHandler>> + Send + Sync + 'static,
{
    ensure_builtins();
    OUTBOUNDS.register(name, Arc::new(factory))
}

pub fn inbound_factory(name: &str) -> Result<InboundFactory> {
    ensure_builtins();
    INBOUNDS.get(name)
}

pub fn outbound_factory(name: &str) -> Result<OutboundFactory> {
    ensure_builtins();
    OUTBOUNDS.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_name_keeps_first() {
        let registry: Registry<&'static str> = Registry::new("test");
        registry.register("mock", "first").unwrap();
        let err = registry.register("mock", "second").unwrap_err();
        assert!(matches!(err, ProxyError::DuplicateProtocol(ref name) if name == "mock"));
        assert_eq!(registry.get("mock").unwrap(), "first");
    }

    #[test]
    fn test_unknown_name() {
        let registry: Registry<&'static str> = Registry::new("test");
        assert!(matches!(registry.get("nope"), Err(ProxyError::UnknownProtocol(_))));
    }

    #[test]
    fn test_builtins_registered() {
        assert!(inbound_factory("socks").is_ok());
        assert!(outbound_factory("freedom").is_ok());
        assert!(outbound_factory("blackhole").is_ok());
        assert!(OUTBOUNDS.contains("freedom"));

        let again = register_outbound("freedom", |_settings| {
            Ok(Arc::new(BlackholeProtocol::new()) as Arc<dyn OutboundHandler>)
        });
        assert!(matches!(again, Err(ProxyError::DuplicateProtocol(_))));
    }

    #[test]
    fn test_outbound_factory_receives_settings() {
        register_outbound("settings_only_outbound", |settings| match settings {
            Some(_) => Ok(Arc::new(FreedomProtocol::from_settings(settings)?) as Arc<dyn OutboundHandler>),
            None => Ok(Arc::new(BlackholeProtocol::new()) as Arc<dyn OutboundHandler>),
        })
        .unwrap();

        let factory = outbound_factory("settings_only_outbound").unwrap();
        let settings = serde_json::json!({ "connect_timeout_secs": 5 });
        assert_eq!(factory(Some(&settings)).unwrap().name(), "freedom");
        assert_eq!(factory(None).unwrap().name(), "blackhole");
    }
}
