use std::{io, sync::Arc, time::Duration};

use russh::{
    Channel, Disconnect,
    client::{self, AuthResult},
    keys::{HashAlg, PrivateKey, PublicKey, key::PrivateKeyWithHashAlg},
    server,
};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::ProxyError,
    ssh::forwarding::{ChannelRegistry, spawn_pump},
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Identity presented to the target. Selected by the router; the origin's
/// own credentials never appear here.
#[derive(Clone)]
pub enum TargetCredential {
    Password(String),
    PrivateKey(PrivateKey),
    /// Authenticate with the "none" method.
    None,
}

impl std::fmt::Debug for TargetCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetCredential::Password(_) => f.debug_tuple("Password").field(&"[redacted]").finish(),
            TargetCredential::PrivateKey(_) => {
                f.debug_tuple("PrivateKey").field(&"[redacted]").finish()
            }
            TargetCredential::None => f.debug_tuple("None").finish(),
        }
    }
}

/// How to verify the target's host key during the client-side handshake.
#[derive(Clone, Debug, Default)]
pub enum HostKeyPolicy {
    /// Accept whatever the target presents. Only reasonable when the
    /// network path to the target is already trusted.
    #[default]
    AcceptAny,
    /// Require this exact key.
    Expect(PublicKey),
}

impl HostKeyPolicy {
    fn verify(&self, offered: &PublicKey) -> bool {
        match self {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::Expect(expected) => offered == expected,
        }
    }
}

/// Client-side handshake configuration for one target connection.
#[derive(Clone)]
pub struct TargetConfig {
    pub user: String,
    pub credential: TargetCredential,
    pub host_key: HostKeyPolicy,
    /// Bounds the TCP dial only. Everything after the dial blocks until
    /// EOF or cancellation.
    pub dial_timeout: Duration,
    pub client: Arc<client::Config>,
}

impl std::fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConfig")
            .field("user", &self.user)
            .field("credential", &self.credential)
            .field("host_key", &self.host_key)
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

impl TargetConfig {
    pub fn new(user: impl Into<String>) -> Self {
        TargetConfig {
            user: user.into(),
            credential: TargetCredential::None,
            host_key: HostKeyPolicy::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            client: Arc::new(client::Config::default()),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.credential = TargetCredential::Password(password.into());
        self
    }

    pub fn with_key(mut self, key: PrivateKey) -> Self {
        self.credential = TargetCredential::PrivateKey(key);
        self
    }

    pub fn with_host_key(mut self, host_key: HostKeyPolicy) -> Self {
        self.host_key = host_key;
        self
    }
}

async fn dial(addr: &str, dial_timeout: Duration) -> Result<TcpStream, ProxyError> {
    match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(error)) => Err(ProxyError::Dial(error)),
        Err(_) => Err(ProxyError::Dial(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connection to {addr} timed out"),
        ))),
    }
}

/// Dials the routed target and runs the client-side handshake with the
/// router-supplied identity. Returns the authenticated session handle.
pub(crate) async fn connect(
    addr: &str,
    config: TargetConfig,
    origin: server::Handle,
    registry: ChannelRegistry,
    cancellation_token: CancellationToken,
) -> Result<client::Handle<TargetClient>, ProxyError> {
    let stream = dial(addr, config.dial_timeout).await?;
    if let Err(error) = stream.set_nodelay(true) {
        warn!(%error, "Error setting nodelay.");
    }
    let handler = TargetClient {
        host_key: config.host_key,
        origin,
        registry,
        cancellation_token,
    };
    let mut handle = client::connect_stream(config.client, stream, handler)
        .await
        .map_err(|error| match error {
            ProxyError::Ssh(error) => ProxyError::TargetHandshake(error),
            other => other,
        })?;

    let result = match config.credential {
        TargetCredential::Password(ref password) => {
            handle.authenticate_password(&config.user, password).await?
        }
        TargetCredential::PrivateKey(key) => {
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(
                    &config.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await?
        }
        TargetCredential::None => handle.authenticate_none(&config.user).await?,
    };
    match result {
        AuthResult::Success => {
            info!(target = %addr, user = %config.user, "Target connection established.");
            Ok(handle)
        }
        AuthResult::Failure { .. } => {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            Err(ProxyError::TargetAuth(config.user))
        }
    }
}

/// Handler for the proxy's own connection to the target. Mirrors
/// target-initiated channels back to the origin.
pub(crate) struct TargetClient {
    host_key: HostKeyPolicy,
    origin: server::Handle,
    registry: ChannelRegistry,
    cancellation_token: CancellationToken,
}

impl TargetClient {
    /// Registers a target-opened channel against its origin-side mirror
    /// and starts the pump. The mirror handle is only needed for its id;
    /// traffic flows through the session handle.
    fn attach(&self, origin_channel: Channel<server::Msg>, target_channel: Channel<client::Msg>) {
        spawn_pump(
            self.origin.clone(),
            origin_channel.id(),
            target_channel,
            Arc::clone(&self.registry),
            self.cancellation_token.clone(),
        );
    }
}

impl client::Handler for TargetClient {
    type Error = ProxyError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if self.host_key.verify(server_public_key) {
            Ok(true)
        } else {
            warn!(
                fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
                "Target host key does not match the expected key."
            );
            Ok(false)
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        match self
            .origin
            .channel_open_forwarded_tcpip(
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(origin_channel) => {
                self.attach(origin_channel, channel);
                Ok(())
            }
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                debug!(?reason, "Origin refused forwarded channel.");
                let _ = channel.close().await;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<client::Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        match self
            .origin
            .channel_open_x11(originator_address, originator_port)
            .await
        {
            Ok(origin_channel) => {
                self.attach(origin_channel, channel);
                Ok(())
            }
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                debug!(?reason, "Origin refused X11 channel.");
                let _ = channel.close().await;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

// The target connection ending is as final as the origin's: tear the
// whole proxied session down so the origin observes the disconnect.
impl Drop for TargetClient {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
