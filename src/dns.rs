use std::net::SocketAddr;
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use crate::error::{ProxyError, Result};
use log::{debug, warn};

/// Resolves domain destinations for outbound handlers
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    /// Create a new DNS resolver with default configuration
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::default(), ResolverOpts::default())
    }

    /// Create a new DNS resolver with custom configuration
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self { resolver: TokioAsyncResolver::tokio(config, opts) }
    }

    /// Resolve a domain name to the first address returned
    pub async fn resolve_domain(&self, domain: &str, port: u16) -> Result<SocketAddr> {
        debug!("Resolving domain: {}:{}", domain, port);

        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => match lookup.iter().next() {
                Some(ip) => {
                    debug!("Resolved {} to IP: {}", domain, ip);
                    Ok(SocketAddr::new(ip, port))
                }
                None => Err(ProxyError::DnsResolution(format!("No IP addresses found for {}", domain))),
            },
            Err(e) => {
                warn!("DNS resolution failed for {}: {}", domain, e);
                Err(ProxyError::DnsResolution(e.to_string()))
            }
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}
