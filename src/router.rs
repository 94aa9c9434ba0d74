use std::net::SocketAddr;

use async_trait::async_trait;
use russh::keys::ssh_key::Fingerprint;

use crate::ssh::target::TargetConfig;

/// What a router is allowed to learn about an authenticated origin
/// connection before deciding where it goes.
#[derive(Debug, Clone)]
pub struct OriginInfo {
    /// IP and port of the origin connection.
    pub peer: SocketAddr,
    /// Username from the origin's authentication, if any was presented.
    pub user: Option<String>,
    /// SHA-256 fingerprint of the origin's public key, if one was used.
    pub key_fingerprint: Option<Fingerprint>,
}

/// One routing decision: where to connect and how to authenticate there.
pub struct Route {
    /// Target address in `host:port` form.
    pub target_addr: String,
    /// Handshake configuration for the target connection. Consumed by the
    /// connection this route was produced for; never shared.
    pub target: TargetConfig,
}

/// Picks a target for each authenticated origin connection.
///
/// Called exactly once per connection, after the origin handshake succeeds
/// and before the target is dialed. Implementations may block, e.g. to
/// consult an external authorization service; the per-connection
/// cancellation bounds the wait.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, origin: &OriginInfo) -> color_eyre::Result<Route>;
}

/// Routes every connection to a single fixed target.
pub struct StaticRouter {
    target_addr: String,
    target: TargetConfig,
}

impl StaticRouter {
    pub fn new(target_addr: impl Into<String>, target: TargetConfig) -> Self {
        StaticRouter {
            target_addr: target_addr.into(),
            target,
        }
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn route(&self, _origin: &OriginInfo) -> color_eyre::Result<Route> {
        Ok(Route {
            target_addr: self.target_addr.clone(),
            target: self.target.clone(),
        })
    }
}
