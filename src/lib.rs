//! Keyhole is an authorization-terminating SSH reverse proxy.
//!
//! It accepts origin SSH connections under its own host key and
//! authentication policy, asks a [`Router`] where each authenticated
//! connection should go, opens an independent SSH connection to that
//! target with router-supplied credentials, and transparently forwards
//! channels, channel requests, extended data, and port-forwarding
//! requests in both directions. Origin credentials never reach the
//! target.
//!
//! The [`entrypoint`] function and `keyhole` binary wire this up for the
//! single-target case; library users compose [`ProxyServer`] with their
//! own [`Router`] and [`AuthPolicy`] implementations.

mod config;
mod droppable_handle;
mod entrypoint;
mod error;
mod router;
mod server;
mod ssh;

pub use config::ApplicationConfig;
pub use entrypoint::entrypoint;
pub use error::ProxyError;
pub use router::{OriginInfo, Route, Router, StaticRouter};
pub use server::ProxyServer;
pub use ssh::auth::{AllowAllPolicy, AuthPolicy, AuthorizedKeysPolicy};
pub use ssh::target::{HostKeyPolicy, TargetConfig, TargetCredential};
