use std::{net::SocketAddr, sync::Arc};

pub(crate) mod auth;
pub(crate) mod forwarding;
pub(crate) mod target;

use dashmap::DashMap;
use russh::{
    Channel, ChannelId, ChannelMsg, CryptoVec, Disconnect, Pty, Sig,
    keys::{HashAlg, PublicKey, ssh_key::Fingerprint},
    server::{Auth, Handler, Msg, Session},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::ProxyError,
    router::{OriginInfo, Router},
    ssh::{
        auth::AuthPolicy,
        forwarding::{ChannelRegistry, spawn_pump},
        target::TargetClient,
    },
};

// Per-connection state on the origin side.
pub(crate) struct ProxyHandler {
    // The IP and port of the origin connection.
    peer: SocketAddr,
    // The proxy's own authentication policy for origins.
    auth: Arc<dyn AuthPolicy>,
    // Picks the target once the origin is authenticated.
    router: Arc<dyn Router>,
    // Cancelling this ends every pump of this connection.
    cancellation_token: CancellationToken,
    // The username from this connection's authentication.
    user: Option<String>,
    // The fingerprint of the public key from authentication, if any.
    key_fingerprint: Option<Fingerprint>,
    // Pump queues for the live channels of this connection.
    registry: ChannelRegistry,
    // Session handle to the target, present once routing succeeded.
    target: Option<russh::client::Handle<TargetClient>>,
}

impl ProxyHandler {
    pub(crate) fn new(
        peer: SocketAddr,
        auth: Arc<dyn AuthPolicy>,
        router: Arc<dyn Router>,
        cancellation_token: CancellationToken,
    ) -> Self {
        info!(%peer, "SSH client connected.");
        ProxyHandler {
            peer,
            auth,
            router,
            cancellation_token,
            user: None,
            key_fingerprint: None,
            registry: Arc::new(DashMap::new()),
            target: None,
        }
    }

    fn target(&self) -> Result<&russh::client::Handle<TargetClient>, ProxyError> {
        self.target.as_ref().ok_or(ProxyError::NoTarget)
    }

    // Queues one origin-side channel event for its pump. Events for
    // channels without a pump are dropped; the channel is already gone.
    async fn forward(&self, id: ChannelId, msg: ChannelMsg) {
        let Some(tx) = self.registry.get(&id).map(|entry| entry.value().clone()) else {
            debug!(peer = %self.peer, channel = %id, "Dropping event for unknown channel.");
            return;
        };
        if tx.send(msg).await.is_err() {
            debug!(peer = %self.peer, channel = %id, "Dropping event for closed channel.");
        }
    }
}

impl Handler for ProxyHandler {
    type Error = ProxyError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.user = Some(user.into());
        Ok(self.auth.auth_none(user).await)
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.user = Some(user.into());
        let auth = self.auth.auth_password(user, password).await;
        if matches!(auth, Auth::Accept) {
            info!(peer = %self.peer, %user, "SSH client authenticated with password.");
        }
        Ok(auth)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        self.user = Some(user.into());
        self.key_fingerprint = Some(fingerprint);
        let auth = self.auth.auth_publickey(user, public_key).await;
        if matches!(auth, Auth::Accept) {
            info!(
                peer = %self.peer, %user, %fingerprint,
                "SSH client authenticated with public key."
            );
        }
        Ok(auth)
    }

    // The origin handshake is complete: route the connection and bring up
    // the target side. Failing here tears the origin connection down.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let origin = OriginInfo {
            peer: self.peer,
            user: self.user.clone(),
            key_fingerprint: self.key_fingerprint.clone(),
        };
        let route = self
            .router
            .route(&origin)
            .await
            .map_err(ProxyError::Route)?;
        info!(peer = %self.peer, target = %route.target_addr, "Routing origin to target.");
        let handle = target::connect(
            &route.target_addr,
            route.target,
            session.handle(),
            Arc::clone(&self.registry),
            self.cancellation_token.clone(),
        )
        .await?;
        self.target = Some(handle);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.target()?.channel_open_session().await {
            Ok(target_channel) => {
                spawn_pump(
                    session.handle(),
                    channel.id(),
                    target_channel,
                    Arc::clone(&self.registry),
                    self.cancellation_token.clone(),
                );
                Ok(true)
            }
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                warn!(peer = %self.peer, ?reason, "Target refused session channel.");
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self
            .target()?
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(target_channel) => {
                spawn_pump(
                    session.handle(),
                    channel.id(),
                    target_channel,
                    Arc::clone(&self.registry),
                    self.cancellation_token.clone(),
                );
                Ok(true)
            }
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                warn!(
                    peer = %self.peer, ?reason, host = %host_to_connect, port = %port_to_connect,
                    "Target refused direct-tcpip channel."
                );
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelMsg::Data {
                data: CryptoVec::from(data.to_vec()),
            },
        )
        .await;
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelMsg::ExtendedData {
                data: CryptoVec::from(data.to_vec()),
                ext: code,
            },
        )
        .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelMsg::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelMsg::Close).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelMsg::Exec {
                want_reply: true,
                command: data.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelMsg::RequestPty {
                want_reply: true,
                term: term.into(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes: modes.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelMsg::RequestShell { want_reply: true })
            .await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelMsg::SetEnv {
                want_reply: true,
                variable_name: variable_name.into(),
                variable_value: variable_value.into(),
            },
        )
        .await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelMsg::RequestSubsystem {
                want_reply: true,
                name: name.into(),
            },
        )
        .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelMsg::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelMsg::Signal { signal }).await;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelMsg::RequestX11 {
                want_reply: true,
                single_connection,
                x11_authentication_protocol: x11_auth_protocol.into(),
                x11_authentication_cookie: x11_auth_cookie.into(),
                x11_screen_number,
            },
        )
        .await;
        Ok(())
    }

    // The agent request is answered inline per the callback contract; the
    // forwarded copy is sent without the target owing a second reply the
    // origin never asked for.
    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forward(channel, ChannelMsg::AgentForward { want_reply: false })
            .await;
        Ok(true)
    }

    // Global requests are forwarded inline so the origin observes the
    // target's own accept or deny, in order.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let target = self.target.as_mut().ok_or(ProxyError::NoTarget)?;
        match target.tcpip_forward(address, *port).await {
            Ok(_) => Ok(true),
            Err(russh::Error::RequestDenied) => {
                debug!(peer = %self.peer, %address, %port, "Target denied tcpip-forward.");
                Ok(false)
            }
            Err(error) => {
                warn!(peer = %self.peer, %error, "Forwarding tcpip-forward failed.");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let target = self.target.as_mut().ok_or(ProxyError::NoTarget)?;
        match target.cancel_tcpip_forward(address, port).await {
            Ok(_) => Ok(true),
            Err(russh::Error::RequestDenied) => Ok(false),
            Err(error) => {
                warn!(peer = %self.peer, %error, "Forwarding cancel-tcpip-forward failed.");
                Ok(false)
            }
        }
    }
}

// Tear down the target side together with the origin connection.
impl Drop for ProxyHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        info!(peer = %self.peer, %user, "SSH client disconnected.");
        self.cancellation_token.cancel();
        if let Some(target) = self.target.take() {
            tokio::spawn(async move {
                let _ = target
                    .disconnect(Disconnect::ByApplication, "origin closed", "en")
                    .await;
            });
        }
    }
}
