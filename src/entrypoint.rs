use std::{io, path::Path, sync::Arc, time::Duration};

use color_eyre::eyre::Context;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::keys::{
    PrivateKey, decode_secret_key, load_secret_key,
    ssh_key::{LineEnding, private::Ed25519Keypair},
};
use tokio::{fs, net::TcpListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ApplicationConfig,
    droppable_handle::DroppableHandle,
    router::StaticRouter,
    server::ProxyServer,
    ssh::{
        auth::{AllowAllPolicy, AuthPolicy, AuthorizedKeysPolicy},
        target::TargetConfig,
    },
};

// Find the proxy's host key, or create a new one on first start.
async fn load_or_generate_key(path: &Path) -> color_eyre::Result<PrivateKey> {
    match fs::read_to_string(path).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding secret key"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            info!("Key file not found. Creating...");
            let key = PrivateKey::from(Ed25519Keypair::from_seed(
                &ChaCha20Rng::from_os_rng().random(),
            ));
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| "Error creating secret key directory")?;
            }
            let key_string = key.to_openssh(LineEnding::LF)?;
            fs::write(path, key_string.as_bytes())
                .await
                .with_context(|| "Error saving secret key to filesystem")?;
            Ok(key)
        }
        Err(error) => Err(error).with_context(|| "Error reading secret key"),
    }
}

#[doc(hidden)]
// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting keyhole...");
    let key = load_or_generate_key(config.private_key_file.as_path()).await?;
    let ssh_config = Arc::new(russh::server::Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let auth: Arc<dyn AuthPolicy> = match config.authorized_keys {
        Some(ref path) => Arc::new(
            AuthorizedKeysPolicy::load(path).with_context(|| "Error reading authorized keys")?,
        ),
        None => {
            warn!("No authorized keys file configured. Accepting every origin.");
            Arc::new(AllowAllPolicy)
        }
    };

    let mut target = TargetConfig::new(&config.target_user);
    target.dial_timeout = config.dial_timeout;
    if let Some(ref path) = config.target_key_file {
        target = target.with_key(
            load_secret_key(path, None).with_context(|| "Error reading target key file")?,
        );
    } else if let Some(ref password) = config.target_password {
        target = target.with_password(password);
    }
    let router = Arc::new(StaticRouter::new(config.target.clone(), target));

    let listener = TcpListener::bind((config.listen_address, config.ssh_port.into()))
        .await
        .with_context(|| "Error listening to SSH port")?;
    let server = ProxyServer::new(ssh_config, auth, router);
    let cancellation_token = CancellationToken::new();

    let mut listen_handle = DroppableHandle(tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move { server.listen(listener, cancellation_token).await }
    }));
    info!("Keyhole is now running.");
    tokio::select! {
        result = &mut listen_handle.0 => {
            result
                .with_context(|| "Listener task failed")?
                .with_context(|| "Error accepting SSH connections")?;
        }
        _ = wait_for_signal() => {
            info!("Shutting down...");
            cancellation_token.cancel();
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
