use std::{io, net::SocketAddr, sync::Arc};

use russh::Disconnect;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::ProxyError,
    router::Router,
    ssh::{ProxyHandler, auth::AuthPolicy},
};

/// Accepts origin connections and proxies each one to its routed target.
pub struct ProxyServer {
    config: Arc<russh::server::Config>,
    auth: Arc<dyn AuthPolicy>,
    router: Arc<dyn Router>,
}

impl ProxyServer {
    pub fn new(
        config: Arc<russh::server::Config>,
        auth: Arc<dyn AuthPolicy>,
        router: Arc<dyn Router>,
    ) -> Self {
        ProxyServer {
            config,
            auth,
            router,
        }
    }

    /// Runs the accept loop until the token is cancelled or the listener
    /// fails. Transient accept errors are logged and the loop continues.
    pub async fn listen(
        &self,
        listener: TcpListener,
        cancellation_token: CancellationToken,
    ) -> io::Result<()> {
        info!(address = %listener.local_addr()?, "Listening for SSH connections.");
        loop {
            tokio::select! {
                conn = listener.accept() => {
                    let (stream, address) = match conn {
                        Ok(conn) => conn,
                        Err(error)
                            if matches!(
                                error.kind(),
                                io::ErrorKind::ConnectionAborted
                                    | io::ErrorKind::ConnectionReset
                                    | io::ErrorKind::Interrupted
                            ) =>
                        {
                            warn!(%error, "Transient error accepting SSH connection.");
                            continue;
                        }
                        Err(error) => {
                            warn!(%error, "Unable to accept SSH connection.");
                            return Err(error);
                        }
                    };
                    if let Err(error) = stream.set_nodelay(true) {
                        warn!(%error, %address, "Error setting nodelay.");
                    }
                    self.handle_connection(stream, address, cancellation_token.child_token());
                }
                _ = cancellation_token.cancelled() => {
                    info!("Shutting down SSH listener.");
                    return Ok(());
                }
            }
        }
    }

    fn handle_connection(
        &self,
        stream: TcpStream,
        address: SocketAddr,
        cancellation_token: CancellationToken,
    ) {
        let handler = ProxyHandler::new(
            address,
            Arc::clone(&self.auth),
            Arc::clone(&self.router),
            cancellation_token.clone(),
        );
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            let mut session = match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => session,
                Err(error) => {
                    warn!(%error, %address, "Connection setup failed.");
                    return;
                }
            };
            tokio::select! {
                result = &mut session => {
                    match result {
                        Ok(()) | Err(ProxyError::Ssh(russh::Error::Disconnect)) => {}
                        Err(error) => warn!(%error, %address, "Connection closed."),
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!(%address, "Disconnecting client...");
                    let _ = session
                        .handle()
                        .disconnect(Disconnect::ByApplication, "".into(), "English".into())
                        .await;
                }
            }
        });
    }
}
